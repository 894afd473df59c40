// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::*;
use core::marker::PhantomData;
use protocol_common::ParseOk;

/// The client side of a pipelined, framed session. Requests are composed onto
/// the session write buffer and remembered in a FIFO queue; the protocol
/// guarantees that responses come back in request order, so each decoded
/// response is paired with the request at the head of the queue.
pub struct ClientSession<Parser, Tx, Rx> {
    session: Session,
    parser: Parser,
    pending: VecDeque<Tx>,
    _rx: PhantomData<Rx>,
}

impl<Parser, Tx, Rx> Debug for ClientSession<Parser, Tx, Rx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{:?}", self.session)
    }
}

impl<Parser, Tx, Rx> AsRawFd for ClientSession<Parser, Tx, Rx> {
    fn as_raw_fd(&self) -> i32 {
        self.session.as_raw_fd()
    }
}

impl<Parser, Tx, Rx> ClientSession<Parser, Tx, Rx>
where
    Tx: Compose,
    Parser: Parse<Rx>,
{
    pub fn new(session: Session, parser: Parser) -> Self {
        Self {
            session,
            parser,
            pending: VecDeque::new(),
            _rx: PhantomData,
        }
    }

    /// Compose the request onto the session write buffer and append it to the
    /// in-flight queue. The session buffer is *not* flushed.
    pub fn send(&mut self, tx: Tx) -> Result<usize> {
        let size = tx.compose(&mut self.session);
        self.pending.push_back(tx);
        Ok(size)
    }

    /// Attempts to decode one response from buffered bytes, pairing it with
    /// the request at the head of the in-flight queue. Operates only on
    /// buffered data; returns `WouldBlock` when a complete response is not yet
    /// buffered.
    pub fn receive(&mut self) -> Result<(Tx, Rx)> {
        let src: &[u8] = self.session.borrow();
        let res: ParseOk<Rx> = self.parser.parse(src)?;
        let tx = self
            .pending
            .pop_front()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "response without request"))?;
        let consumed = res.consumed();
        let rx = res.into_inner();
        self.session.consume(consumed);
        Ok((tx, rx))
    }

    /// Attempts to flush the session write buffer.
    pub fn flush(&mut self) -> Result<()> {
        self.session.flush()?;
        Ok(())
    }

    /// Returns the number of bytes currently in the write buffer.
    pub fn write_pending(&self) -> usize {
        self.session.write_pending()
    }

    /// Performs a read of the underlying session to fill the read buffer.
    pub fn fill(&mut self) -> Result<usize> {
        self.session.fill()
    }

    /// Returns the current event interest for this session.
    pub fn interest(&self) -> Interest {
        self.session.interest()
    }

    pub fn is_established(&self) -> bool {
        self.session.is_established()
    }

    pub fn take_error(&self) -> Result<Option<std::io::Error>> {
        self.session.take_error()
    }

    /// The number of requests awaiting responses.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The in-flight queue, oldest request first. The engine walks this to
    /// expire requests by deadline without disturbing wire order.
    pub fn pending_mut(&mut self) -> &mut VecDeque<Tx> {
        &mut self.pending
    }

    /// Remove and return every in-flight request, oldest first. Used when the
    /// connection dies and the requests must be failed or resent elsewhere.
    pub fn take_pending(&mut self) -> VecDeque<Tx> {
        std::mem::take(&mut self.pending)
    }
}

impl<Parser, Tx, Rx> net::event::Source for ClientSession<Parser, Tx, Rx> {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.session.register(registry, token, interest)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.session.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.session.deregister(registry)
    }
}
