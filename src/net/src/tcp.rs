// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;
use core::fmt::Debug;
use core::ops::Deref;
use std::io::{Read, Write};

pub use std::net::Shutdown;

/// A non-blocking TCP stream. Construction begins the connect; the stream is
/// usable once the socket reports writable and `is_established` returns true.
pub struct TcpStream {
    inner: mio::net::TcpStream,
}

impl TcpStream {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let inner = mio::net::TcpStream::connect(addr)?;
        let _ = inner.set_nodelay(true);

        Ok(Self { inner })
    }

    pub fn from_std(stream: std::net::TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: mio::net::TcpStream::from_std(stream),
        })
    }

    /// True once the three-way handshake has completed. A connect that was
    /// refused reports false here and an error on the first read or write.
    pub fn is_established(&self) -> bool {
        self.inner.peer_addr().is_ok()
    }

    /// The event interest for this stream: connecting streams want to learn
    /// about writability, established streams are read-driven by default.
    pub fn interest(&self) -> Interest {
        if self.is_established() {
            Interest::READABLE
        } else {
            Interest::READABLE.add(Interest::WRITABLE)
        }
    }

    /// Surface a deferred connect error, if any. Non-blocking connects report
    /// refusal through SO_ERROR rather than from the connect call itself.
    pub fn take_error(&self) -> Result<Option<Error>> {
        self.inner.take_error()
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        self.inner.set_nodelay(nodelay)
    }
}

impl Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{:?}", self.inner)
    }
}

impl Deref for TcpStream {
    type Target = mio::net::TcpStream;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

impl event::Source for TcpStream {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interest: mio::Interest,
    ) -> Result<()> {
        self.inner.register(registry, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interest: mio::Interest,
    ) -> Result<()> {
        self.inner.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> Result<()> {
        self.inner.deregister(registry)
    }
}
