// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use core::fmt::Debug;

// 40 hashes per server, 4 continuum points out of each 16-byte digest.
const HASHES_PER_SERVER: u32 = 40;
const POINTS_PER_HASH: usize = 4;

/// A ketama consistent-hashing continuum over a set of server endpoints.
/// Used for memcached-type buckets, which have no vbuckets: a key maps to the
/// server owning the first continuum point at or after the key's hash point,
/// wrapping at the top of the ring.
pub struct Continuum {
    points: Vec<(u32, usize)>,
}

impl Debug for Continuum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Continuum({} points)", self.points.len())
    }
}

impl Continuum {
    /// Build the continuum for an ordered list of `host:port` authorities.
    pub fn new<T: AsRef<str>>(servers: &[T]) -> Self {
        let mut points = Vec::with_capacity(servers.len() * HASHES_PER_SERVER as usize * POINTS_PER_HASH);

        for (index, server) in servers.iter().enumerate() {
            for iteration in 0..HASHES_PER_SERVER {
                let digest = md5::compute(format!("{}-{}", server.as_ref(), iteration));
                for chunk in 0..POINTS_PER_HASH {
                    let offset = chunk * 4;
                    let point = u32::from_le_bytes([
                        digest[offset],
                        digest[offset + 1],
                        digest[offset + 2],
                        digest[offset + 3],
                    ]);
                    points.push((point, index));
                }
            }
        }

        points.sort_unstable();

        Self { points }
    }

    /// The server index owning `key`, or `None` for an empty continuum.
    pub fn locate(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }

        let digest = md5::compute(key);
        let point = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);

        let position = self
            .points
            .partition_point(|&(candidate, _)| candidate < point);

        // wrap to the first point at the top of the ring
        let (_, index) = self.points[position % self.points.len()];
        Some(index)
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_count() {
        let continuum = Continuum::new(&["10.0.0.1:11211", "10.0.0.2:11211"]);
        assert_eq!(continuum.num_points(), 2 * 40 * 4);
    }

    #[test]
    fn lookup_is_deterministic() {
        let continuum = Continuum::new(&["a:1", "b:1", "c:1"]);
        let first = continuum.locate(b"some key");
        for _ in 0..16 {
            assert_eq!(continuum.locate(b"some key"), first);
        }
    }

    #[test]
    fn all_keys_land_on_a_server() {
        let servers = ["a:1", "b:1", "c:1"];
        let continuum = Continuum::new(&servers);
        let mut seen = [false; 3];
        for i in 0..1000u32 {
            let key = format!("key-{}", i);
            let index = continuum.locate(key.as_bytes()).expect("empty continuum");
            assert!(index < servers.len());
            seen[index] = true;
        }
        // the ring spreads a thousand keys across every server
        assert!(seen.iter().all(|&hit| hit));
    }

    #[test]
    fn empty_continuum() {
        let continuum = Continuum::new::<&str>(&[]);
        assert_eq!(continuum.locate(b"key"), None);
    }

    #[test]
    fn stable_under_unrelated_server_removal() {
        let full = Continuum::new(&["a:1", "b:1", "c:1"]);
        let reduced = Continuum::new(&["a:1", "b:1"]);

        // keys owned by a surviving server keep their owner
        let mut moved = 0;
        let mut kept = 0;
        for i in 0..1000u32 {
            let key = format!("key-{}", i);
            match full.locate(key.as_bytes()) {
                Some(2) => moved += 1,
                Some(index) => {
                    if reduced.locate(key.as_bytes()) == Some(index) {
                        kept += 1;
                    } else {
                        moved += 1;
                    }
                }
                None => unreachable!(),
            }
        }
        // consistent hashing: most keys stay put
        assert!(kept > moved);
    }
}
