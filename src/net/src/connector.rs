// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// Resolves an address and begins a non-blocking connect to the first
/// resolved candidate that accepts the attempt.
#[derive(Clone, Default)]
pub struct Connector {
    _inner: (),
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to connect to the provided address. A successful return means
    /// the connect was *started*; establishment is reported through readiness.
    pub fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let mut stream = Err(Error::new(ErrorKind::Other, "failed to resolve"));
        for addr in addrs {
            stream = TcpStream::connect(addr);
            if stream.is_ok() {
                break;
            }
        }

        stream
    }
}
