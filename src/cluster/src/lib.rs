// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Cluster topology handling: parsing the server-published configuration
//! document and routing keys to the nodes that own them.
//!
//! A parsed configuration becomes an immutable [`VBucketMap`] snapshot. The
//! engine swaps snapshots atomically (an `Arc` pointer replacement) whenever a
//! new configuration is adopted; a snapshot is never mutated after
//! construction, so routing computations in flight against an old snapshot
//! stay internally consistent.
//!
//! Couchbase-type buckets route by vbucket: `(crc32(key) >> 16)` masked to the
//! (power of two) vbucket count indexes a table of `(master, replicas…)`
//! rows. Memcached-type buckets have no vbuckets and route on a ketama
//! continuum instead.

#[macro_use]
extern crate log;

mod document;
mod ketama;
mod map;

pub use document::{BucketType, ConfigDocument, Node, VBucketServerMap};
pub use ketama::Continuum;
pub use map::{Endpoint, VBucketMap};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("vbucket map is empty")]
    EmptyMap,

    #[error("vbucket count {0} is not a power of two")]
    BadVBucketCount(usize),

    #[error("vbucket row {row} is shorter than one master entry")]
    ShortRow { row: usize },

    #[error("server index {index} out of range ({servers} servers)")]
    BadServerIndex { index: i32, servers: usize },

    #[error("bucket has neither a vbucket map nor a node list")]
    NoServers,

    #[error("unsupported hash algorithm {0:?}")]
    UnsupportedHash(String),
}

/// Substitute the `$HOST` placeholder carried by configurations fetched over
/// the data port with the host they were fetched from.
pub fn replace_host_placeholder(config: &str, host: &str) -> String {
    config.replace("$HOST", host)
}
