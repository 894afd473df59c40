// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The cluster client core: a single-threaded, cooperatively scheduled engine
//! that bootstraps a cluster topology, routes key/value commands to the nodes
//! that own them, pipelines frames over per-node connections, and recovers
//! from topology changes and node failures.
//!
//! A [`Client`] is not thread safe; callers that want parallelism run one
//! client per thread or serialise entry externally. Everything the client
//! does happens inside [`Client::run_once`] (one event-loop turn) or
//! [`Client::wait`] (drive until idle): submits enqueue work, the loop moves
//! bytes, and completions are delivered through callbacks registered per
//! operation kind.
//!
//! ```no_run
//! use cbclient::{Client, Command, Settings};
//!
//! let settings = Settings::default().set_hosts(vec!["127.0.0.1:11210".into()]);
//! let mut client = Client::new(settings).unwrap();
//! client.set_callback(cbclient::OpKind::Get, Box::new(|_cookie, result| {
//!     println!("{:?}", result.map(|r| r.value));
//! }));
//! client.connect().unwrap();
//! client.wait().unwrap();
//! client.submit(Command::get(b"Hello"), 0).unwrap();
//! client.wait().unwrap();
//! ```

#[macro_use]
extern crate log;

mod bootstrap;
mod clock;
mod command;
mod connection;
mod driver;
mod error;
mod handle;
mod http;
mod observe;
mod operation;
mod registry;
mod router;
mod scheduler;

pub use clock::{Clock, MonotonicClock};
pub use command::{ArithKind, Command, Cookie, OpKind, OpResponse, StoreKind};
pub use driver::{IoDriver, MioDriver};
pub use error::{Error, ErrorFlags};
pub use handle::Client;
pub use http::{HttpHandle, HttpMethod, HttpResponse, ViewRequest};
pub use observe::DurabilityRequirement;

pub use config::{BootstrapTransport, Credentials, Settings};
pub use protocol_binary::Status;

use protocol_binary::{Opcode, Request, Response, ResponseParser};

pub type Result<T> = std::result::Result<T, Error>;

/// Callback invoked with the outcome of a submitted command. Exactly one
/// callback fires for every accepted submit; none for a rejected one.
pub type OpCallback = Box<dyn FnMut(Cookie, std::result::Result<OpResponse, Error>)>;

/// Callback invoked once per key of a durability requirement.
pub type DurabilityCallback =
    Box<dyn FnMut(Cookie, Vec<u8>, std::result::Result<u64, Error>)>;

/// Callback invoked with the outcome of an HTTP request.
pub type HttpCallback = Box<dyn FnMut(Cookie, std::result::Result<HttpResponse, Error>)>;

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER_TOKEN: net::Token = net::Token(usize::MAX);
