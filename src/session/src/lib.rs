// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Abstractions for bi-directional buffered communications on top of streams.
//! A `Session` pairs a stream with growable read and write buffers so that
//! reads and writes hit the socket in large chunks. A `ClientSession` layers a
//! parser and a FIFO queue of in-flight requests on top, which is the shape a
//! pipelined protocol client needs: requests go out in order and each decoded
//! response is matched with the request at the head of the queue.

#[macro_use]
extern crate log;

mod buffer;
mod client;

pub use buffer::*;
pub use client::ClientSession;

use core::borrow::Borrow;
use core::fmt::Debug;
use net::TcpStream;
use net::{Interest, Registry, Token};
use protocol_common::{Compose, Parse};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Result, Write};
use std::os::unix::prelude::AsRawFd;

const KB: usize = 1024;

// If the read buffer has less than this amount available before a read, we
// grow the read buffer. One page.
const BUFFER_MIN_FREE: usize = 4 * KB;

// The target size of read operations.
const TARGET_READ_SIZE: usize = 16 * KB;

/// A `Session` is an underlying stream with its read and write buffers. The
/// caller fills the read buffer from the socket and consumes parsed bytes out
/// of it; writes are buffered and flushed when the socket is writable.
pub struct Session {
    stream: TcpStream,
    read_buffer: Buffer,
    write_buffer: Buffer,
}

impl AsRawFd for Session {
    fn as_raw_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{:?}", self.stream)
    }
}

impl Session {
    pub fn new(stream: TcpStream, read_buffer: Buffer, write_buffer: Buffer) -> Self {
        Self {
            stream,
            read_buffer,
            write_buffer,
        }
    }

    /// Return the event `Interest`s for the `Session`. WRITE interest is
    /// asserted only while the write buffer holds unflushed bytes.
    pub fn interest(&self) -> Interest {
        if self.write_buffer.has_remaining() {
            self.stream.interest().add(Interest::WRITABLE)
        } else {
            self.stream.interest()
        }
    }

    /// Indicates that the underlying TCP connect has completed.
    pub fn is_established(&self) -> bool {
        self.stream.is_established()
    }

    /// Surface a deferred connect error, if any.
    pub fn take_error(&self) -> Result<Option<std::io::Error>> {
        self.stream.take_error()
    }

    /// Fill the read buffer by calling read on the underlying stream until
    /// read would block. Returns the number of bytes read. `Ok(0)` indicates
    /// that the remote side has closed the stream.
    pub fn fill(&mut self) -> Result<usize> {
        let mut read = 0;

        loop {
            if self.read_buffer.remaining_mut() < BUFFER_MIN_FREE {
                self.read_buffer.reserve(TARGET_READ_SIZE);
            }

            match self.stream.read(self.read_buffer.unfilled()) {
                Ok(0) => {
                    return Ok(0);
                }
                Ok(n) => {
                    unsafe {
                        self.read_buffer.advance_mut(n);
                    }
                    read += n;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        if read == 0 {
                            return Err(e);
                        } else {
                            return Ok(read);
                        }
                    }
                    ErrorKind::Interrupted => {}
                    _ => {
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Mark `amt` bytes as consumed from the read buffer.
    pub fn consume(&mut self, amt: usize) {
        self.read_buffer.advance(amt)
    }

    /// Return the number of bytes currently in the write buffer.
    pub fn write_pending(&self) -> usize {
        self.write_buffer.remaining()
    }

    /// Attempts to flush the write buffer to the underlying stream.
    pub fn flush(&mut self) -> Result<usize> {
        let mut flushed = 0;
        while self.write_buffer.has_remaining() {
            match self.stream.write(self.write_buffer.chunk()) {
                Ok(amt) => {
                    self.write_buffer.advance(amt);
                    flushed += amt;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        if flushed == 0 {
                            return Err(e);
                        }
                        break;
                    }
                    ErrorKind::Interrupted => {}
                    _ => {
                        return Err(e);
                    }
                },
            }
        }

        Ok(flushed)
    }

    pub fn read_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.read_buffer
    }

    pub fn write_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.write_buffer
    }
}

impl From<TcpStream> for Session {
    fn from(other: TcpStream) -> Self {
        Self::new(
            other,
            Buffer::new(TARGET_READ_SIZE),
            Buffer::new(TARGET_READ_SIZE),
        )
    }
}

impl Borrow<[u8]> for Session {
    fn borrow(&self) -> &[u8] {
        self.read_buffer.borrow()
    }
}

impl Buf for Session {
    fn remaining(&self) -> usize {
        self.read_buffer.remaining()
    }

    fn chunk(&self) -> &[u8] {
        self.read_buffer.chunk()
    }

    fn advance(&mut self, amt: usize) {
        self.read_buffer.advance(amt)
    }
}

unsafe impl BufMut for Session {
    fn remaining_mut(&self) -> usize {
        self.write_buffer.remaining_mut()
    }

    unsafe fn advance_mut(&mut self, amt: usize) {
        self.write_buffer.advance_mut(amt)
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        self.write_buffer.chunk_mut()
    }

    fn put_slice(&mut self, src: &[u8]) {
        self.write_buffer.put_slice(src)
    }
}

impl net::event::Source for Session {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.stream.register(registry, token, interest)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.stream.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.stream.deregister(registry)
    }
}
