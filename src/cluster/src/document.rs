// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::Deserialize;

/// The server-published configuration document, as fetched over either
/// bootstrap transport. Only the fields the routing layer consumes are
/// modelled; everything else in the document is ignored.
#[derive(Deserialize, Debug, Clone)]
pub struct ConfigDocument {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(rename = "vBucketServerMap")]
    pub vbucket_server_map: Option<VBucketServerMap>,
    #[serde(rename = "nodeLocator", default)]
    pub node_locator: Option<String>,
    #[serde(rename = "bucketType", default)]
    pub bucket_type: Option<String>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> Result<Self, crate::TopologyError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Memcached buckets have no vbuckets: they either say so through the
    /// node locator, the bucket type, or by omitting the server map entirely.
    pub fn bucket_type(&self) -> BucketType {
        if self.node_locator.as_deref() == Some("ketama")
            || self.bucket_type.as_deref() == Some("memcached")
            || self.vbucket_server_map.is_none()
        {
            BucketType::Memcached
        } else {
            BucketType::Couchbase
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketType {
    Couchbase,
    Memcached,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Node {
    pub hostname: String,
    #[serde(default)]
    pub ports: NodePorts,
    #[serde(rename = "couchApiBase", default)]
    pub couch_api_base: Option<String>,
}

impl Node {
    /// `hostname` in the document carries the management port, for example
    /// `"10.0.0.1:8091"`.
    pub fn host(&self) -> &str {
        self.hostname
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.hostname)
    }

    pub fn mgmt_port(&self) -> u16 {
        self.hostname
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(8091)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct NodePorts {
    #[serde(default)]
    pub direct: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct VBucketServerMap {
    #[serde(rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    #[serde(rename = "numReplicas")]
    pub num_replicas: usize,
    #[serde(rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"{
        "name": "default",
        "nodeLocator": "vbucket",
        "nodes": [
            {
                "hostname": "10.0.0.1:8091",
                "ports": { "direct": 11210 },
                "couchApiBase": "http://10.0.0.1:8092/default"
            },
            {
                "hostname": "10.0.0.2:8091",
                "ports": { "direct": 11210 }
            }
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 1,
            "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
            "vBucketMap": [[0, 1], [1, 0], [0, 1], [1, -1]]
        }
    }"#;

    #[test]
    fn parse_sample() {
        let document = ConfigDocument::parse(SAMPLE).expect("failed to parse");
        assert_eq!(document.name, "default");
        assert_eq!(document.bucket_type(), BucketType::Couchbase);
        assert_eq!(document.nodes.len(), 2);
        assert_eq!(document.nodes[0].host(), "10.0.0.1");
        assert_eq!(document.nodes[0].mgmt_port(), 8091);
        assert_eq!(document.nodes[0].ports.direct, Some(11210));

        let map = document.vbucket_server_map.expect("no server map");
        assert_eq!(map.num_replicas, 1);
        assert_eq!(map.vbucket_map.len(), 4);
    }

    #[test]
    fn memcached_bucket_detected() {
        let document = ConfigDocument::parse(
            r#"{
                "name": "mc",
                "bucketType": "memcached",
                "nodeLocator": "ketama",
                "nodes": [{ "hostname": "10.0.0.1:8091", "ports": { "direct": 11210 } }]
            }"#,
        )
        .expect("failed to parse");
        assert_eq!(document.bucket_type(), BucketType::Memcached);
    }

    #[test]
    fn ignores_unmodelled_fields() {
        let document = ConfigDocument::parse(
            r#"{ "name": "b", "uuid": "xyz", "rev": 1404, "nodes": [] }"#,
        )
        .expect("failed to parse");
        assert_eq!(document.bucket_type(), BucketType::Memcached);
    }
}
