// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// One cluster node's service addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    data_port: u16,
    mgmt_port: u16,
    view_base: Option<String>,
}

impl Endpoint {
    pub fn new(host: String, data_port: u16, mgmt_port: u16, view_base: Option<String>) -> Self {
        Self {
            host,
            data_port,
            mgmt_port,
            view_base,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn mgmt_port(&self) -> u16 {
        self.mgmt_port
    }

    /// Base URL for view requests, when the node serves views.
    pub fn view_base(&self) -> Option<&str> {
        self.view_base.as_deref()
    }

    /// `host:data_port`, the authority key/value connections dial.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }

    pub fn mgmt_authority(&self) -> String {
        format!("{}:{}", self.host, self.mgmt_port)
    }
}

enum Locator {
    VBucket {
        num_replicas: usize,
        rows: Vec<Vec<i32>>,
    },
    Ketama(Continuum),
}

/// An immutable topology snapshot: the node list plus either a vbucket table
/// or a ketama continuum. Swapped wholesale when a new configuration is
/// adopted, never mutated in place.
pub struct VBucketMap {
    bucket: String,
    endpoints: Vec<Endpoint>,
    locator: Locator,
}

/// Default data port when a node descriptor does not carry one.
const DEFAULT_DATA_PORT: u16 = 11210;

impl VBucketMap {
    pub fn from_document(document: &ConfigDocument) -> Result<Self, TopologyError> {
        match document.bucket_type() {
            BucketType::Couchbase => Self::from_vbucket_document(document),
            BucketType::Memcached => Self::from_memcached_document(document),
        }
    }

    fn from_vbucket_document(document: &ConfigDocument) -> Result<Self, TopologyError> {
        let server_map = document
            .vbucket_server_map
            .as_ref()
            .ok_or(TopologyError::NoServers)?;

        if !server_map.hash_algorithm.eq_ignore_ascii_case("crc") {
            return Err(TopologyError::UnsupportedHash(
                server_map.hash_algorithm.clone(),
            ));
        }

        let num_vbuckets = server_map.vbucket_map.len();
        if num_vbuckets == 0 {
            return Err(TopologyError::EmptyMap);
        }
        if !num_vbuckets.is_power_of_two() {
            return Err(TopologyError::BadVBucketCount(num_vbuckets));
        }

        let num_servers = server_map.server_list.len();
        for (row_index, row) in server_map.vbucket_map.iter().enumerate() {
            if row.is_empty() {
                return Err(TopologyError::ShortRow { row: row_index });
            }
            for &index in row {
                if index >= num_servers as i32 || index < -1 {
                    return Err(TopologyError::BadServerIndex {
                        index,
                        servers: num_servers,
                    });
                }
            }
        }

        let endpoints = server_map
            .server_list
            .iter()
            .map(|authority| {
                let (host, port) = authority
                    .rsplit_once(':')
                    .map(|(host, port)| (host, port.parse().unwrap_or(DEFAULT_DATA_PORT)))
                    .unwrap_or((authority.as_str(), DEFAULT_DATA_PORT));

                // management port and view base come from the matching node
                // descriptor, when one exists
                let node = document.nodes.iter().find(|node| node.host() == host);

                Endpoint::new(
                    host.to_string(),
                    port,
                    node.map(|node| node.mgmt_port()).unwrap_or(8091),
                    node.and_then(|node| node.couch_api_base.clone()),
                )
            })
            .collect();

        debug!(
            "adopting vbucket map: {} vbuckets, {} servers, {} replicas",
            num_vbuckets,
            num_servers,
            server_map.num_replicas
        );

        Ok(Self {
            bucket: document.name.clone(),
            endpoints,
            locator: Locator::VBucket {
                num_replicas: server_map.num_replicas,
                rows: server_map.vbucket_map.clone(),
            },
        })
    }

    fn from_memcached_document(document: &ConfigDocument) -> Result<Self, TopologyError> {
        if document.nodes.is_empty() {
            return Err(TopologyError::NoServers);
        }

        let endpoints: Vec<Endpoint> = document
            .nodes
            .iter()
            .map(|node| {
                Endpoint::new(
                    node.host().to_string(),
                    node.ports.direct.unwrap_or(DEFAULT_DATA_PORT),
                    node.mgmt_port(),
                    node.couch_api_base.clone(),
                )
            })
            .collect();

        let authorities: Vec<String> = endpoints.iter().map(|e| e.authority()).collect();
        let continuum = Continuum::new(&authorities);

        debug!(
            "adopting ketama map: {} servers, {} points",
            endpoints.len(),
            continuum.num_points()
        );

        Ok(Self {
            bucket: document.name.clone(),
            endpoints,
            locator: Locator::Ketama(continuum),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn is_memcached(&self) -> bool {
        matches!(self.locator, Locator::Ketama(_))
    }

    /// The vbucket a key hashes to. Always 0 for memcached buckets, which
    /// have no vbuckets.
    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        match &self.locator {
            Locator::VBucket { rows, .. } => {
                ((crc32fast::hash(key) >> 16) & (rows.len() as u32 - 1)) as u16
            }
            Locator::Ketama(_) => 0,
        }
    }

    /// Route a key to its master: the owning vbucket and the server index, or
    /// `None` when the vbucket row has no master assigned (mid-rebalance).
    pub fn route_master(&self, key: &[u8]) -> (u16, Option<usize>) {
        match &self.locator {
            Locator::VBucket { rows, .. } => {
                let vbucket = self.vbucket_for_key(key);
                let master = rows[vbucket as usize][0];
                (vbucket, usize::try_from(master).ok())
            }
            Locator::Ketama(continuum) => (0, continuum.locate(key)),
        }
    }

    /// The server index holding replica number `which` (0-based) of a
    /// vbucket, or `None` when that replica is unpopulated.
    pub fn route_replica(&self, vbucket: u16, which: usize) -> Option<usize> {
        match &self.locator {
            Locator::VBucket { num_replicas, rows } => {
                if which >= *num_replicas {
                    return None;
                }
                let row = rows.get(vbucket as usize)?;
                let index = *row.get(which + 1)?;
                usize::try_from(index).ok()
            }
            Locator::Ketama(_) => None,
        }
    }

    pub fn num_replicas(&self) -> usize {
        match &self.locator {
            Locator::VBucket { num_replicas, .. } => *num_replicas,
            Locator::Ketama(_) => 0,
        }
    }

    pub fn num_vbuckets(&self) -> usize {
        match &self.locator {
            Locator::VBucket { rows, .. } => rows.len(),
            Locator::Ketama(_) => 0,
        }
    }

    pub fn num_servers(&self) -> usize {
        self.endpoints.len()
    }

    pub fn server(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Whether another snapshot describes the same topology. Used to skip
    /// re-adoption of a configuration identical to the current one.
    pub fn same_topology(&self, other: &VBucketMap) -> bool {
        if self.bucket != other.bucket || self.endpoints != other.endpoints {
            return false;
        }
        match (&self.locator, &other.locator) {
            (
                Locator::VBucket {
                    num_replicas: a_replicas,
                    rows: a_rows,
                },
                Locator::VBucket {
                    num_replicas: b_replicas,
                    rows: b_rows,
                },
            ) => a_replicas == b_replicas && a_rows == b_rows,
            (Locator::Ketama(_), Locator::Ketama(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> ConfigDocument {
        ConfigDocument::parse(
            r#"{
                "name": "default",
                "nodes": [
                    {
                        "hostname": "10.0.0.1:8091",
                        "ports": { "direct": 11210 },
                        "couchApiBase": "http://10.0.0.1:8092/default"
                    },
                    { "hostname": "10.0.0.2:8091", "ports": { "direct": 11210 } }
                ],
                "vBucketServerMap": {
                    "hashAlgorithm": "CRC",
                    "numReplicas": 1,
                    "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
                    "vBucketMap": [[0, 1], [1, 0], [0, 1], [1, -1]]
                }
            }"#,
        )
        .expect("failed to parse")
    }

    #[test]
    fn routing_follows_the_rows() {
        let map = VBucketMap::from_document(&sample_document()).expect("failed to build");

        assert_eq!(map.num_vbuckets(), 4);
        assert_eq!(map.num_servers(), 2);
        assert_eq!(map.num_replicas(), 1);

        let (vbucket, master) = map.route_master(b"some key");
        assert!(vbucket < 4);
        // row contents and the routed master agree
        let expected = match vbucket {
            0 | 2 => 0,
            _ => 1,
        };
        assert_eq!(master, Some(expected));

        // routing is a pure function of the map and the key
        assert_eq!(map.route_master(b"some key"), (vbucket, master));
    }

    #[test]
    fn crc_vbucket_selection() {
        // crc32("a") == 0xe8b7be43, so "a" hashes to (0xe8b7 & 1023) == 183
        let rows = vec![vec![0i32]; 1024];
        let document = ConfigDocument {
            name: "default".to_string(),
            nodes: Vec::new(),
            vbucket_server_map: Some(VBucketServerMap {
                hash_algorithm: "CRC".to_string(),
                num_replicas: 0,
                server_list: vec!["a:11210".to_string()],
                vbucket_map: rows,
            }),
            node_locator: Some("vbucket".to_string()),
            bucket_type: None,
        };
        let map = VBucketMap::from_document(&document).expect("failed to build");
        assert_eq!(map.vbucket_for_key(b"a"), 183);
    }

    #[test]
    fn replica_routing() {
        let map = VBucketMap::from_document(&sample_document()).expect("failed to build");

        assert_eq!(map.route_replica(0, 0), Some(1));
        assert_eq!(map.route_replica(1, 0), Some(0));
        // vbucket 3 has an unpopulated replica slot
        assert_eq!(map.route_replica(3, 0), None);
        // replica index beyond the replica count
        assert_eq!(map.route_replica(0, 1), None);
    }

    #[test]
    fn endpoints_carry_service_ports() {
        let map = VBucketMap::from_document(&sample_document()).expect("failed to build");

        let endpoint = map.server(0).expect("no server 0");
        assert_eq!(endpoint.authority(), "10.0.0.1:11210");
        assert_eq!(endpoint.mgmt_authority(), "10.0.0.1:8091");
        assert_eq!(endpoint.view_base(), Some("http://10.0.0.1:8092/default"));

        // second node publishes no view base
        assert_eq!(map.server(1).and_then(|e| e.view_base()), None);
    }

    #[test]
    fn non_power_of_two_rejected() {
        let document = ConfigDocument {
            name: "default".to_string(),
            nodes: Vec::new(),
            vbucket_server_map: Some(VBucketServerMap {
                hash_algorithm: "CRC".to_string(),
                num_replicas: 0,
                server_list: vec!["a:11210".to_string()],
                vbucket_map: vec![vec![0], vec![0], vec![0]],
            }),
            node_locator: Some("vbucket".to_string()),
            bucket_type: None,
        };
        assert!(matches!(
            VBucketMap::from_document(&document),
            Err(TopologyError::BadVBucketCount(3))
        ));
    }

    #[test]
    fn same_topology_detects_identical_documents() {
        let a = VBucketMap::from_document(&sample_document()).expect("failed to build");
        let b = VBucketMap::from_document(&sample_document()).expect("failed to build");
        assert!(a.same_topology(&b));

        let mut document = sample_document();
        document
            .vbucket_server_map
            .as_mut()
            .expect("no server map")
            .vbucket_map[0] = vec![1, 0];
        let c = VBucketMap::from_document(&document).expect("failed to build");
        assert!(!a.same_topology(&c));
    }

    #[test]
    fn memcached_bucket_routes_by_continuum() {
        let document = ConfigDocument::parse(
            r#"{
                "name": "mc",
                "bucketType": "memcached",
                "nodeLocator": "ketama",
                "nodes": [
                    { "hostname": "10.0.0.1:8091", "ports": { "direct": 11211 } },
                    { "hostname": "10.0.0.2:8091", "ports": { "direct": 11211 } }
                ]
            }"#,
        )
        .expect("failed to parse");

        let map = VBucketMap::from_document(&document).expect("failed to build");
        assert!(map.is_memcached());
        assert_eq!(map.num_replicas(), 0);
        assert_eq!(map.num_vbuckets(), 0);

        let (vbucket, master) = map.route_master(b"key");
        assert_eq!(vbucket, 0);
        assert!(master.is_some());
        assert_eq!(map.route_replica(0, 0), None);
    }

    #[test]
    fn host_placeholder_substitution() {
        let config = r#"{"name":"default","nodes":[{"hostname":"$HOST:8091"}]}"#;
        let replaced = replace_host_placeholder(config, "10.9.8.7");
        assert!(replaced.contains("10.9.8.7:8091"));
        assert!(!replaced.contains("$HOST"));
    }
}
