// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Readiness-oriented socket primitives for the client core. This crate wraps
//! mio so that every socket-bound component speaks one narrow interface:
//! non-blocking connect, buffered read/write, and event (re)registration.
//!
//! Connects are always asynchronous: `TcpStream::connect` returns before the
//! three-way handshake completes and the socket becomes writable once the
//! connection is established. Callers check `is_established` when the first
//! WRITABLE event arrives.

pub use mio::*;

pub mod event {
    pub use mio::event::*;
}

mod connector;
mod tcp;

pub use connector::Connector;
pub use tcp::TcpStream;

use std::io::{Error, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};

type Result<T> = std::io::Result<T>;
