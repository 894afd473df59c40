// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::operation::Operation;
use crate::*;
use net::{Connector, Interest};
use session::{ClientSession, Session};
use std::collections::VecDeque;
use std::time::Duration;

/// Marker server index for connections opened by the bootstrap provider
/// rather than routed to by the map.
pub(crate) const BOOTSTRAP_SERVER: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// TCP connect issued, not yet established.
    Dialing,
    /// Established, SASL exchange in progress.
    Authenticating,
    /// Accepting writes.
    Ready,
    /// Removed from the topology: refuses new writes, flushes what is
    /// pending, then dies.
    Draining,
    /// Terminal. The socket is released when the connection is dropped.
    Dead,
}

/// A pipelined session to one cluster node. The engine owns one per node it
/// has routed to, plus short-lived ones the bootstrap provider opens.
///
/// Writes are accepted only while `Ready`. Operations routed here before the
/// connection is ready wait on the `park` list and are moved onto the wire in
/// arrival order by `flush_park`.
pub(crate) struct ServerConnection {
    pub server: usize,
    pub authority: String,
    pub phase: Phase,
    session: ClientSession<ResponseParser, Operation, Response>,
    pub park: VecDeque<Operation>,
}

impl ServerConnection {
    /// Begin a non-blocking connect to `authority` (`host:port`).
    pub fn connect(server: usize, authority: &str) -> Result<Self> {
        let stream = Connector::new()
            .connect(authority)
            .map_err(Error::ConnectFailed)?;

        debug!("dialing {}", authority);

        Ok(Self {
            server,
            authority: authority.to_string(),
            phase: Phase::Dialing,
            session: ClientSession::new(Session::from(stream), ResponseParser::new()),
            park: VecDeque::new(),
        })
    }

    pub fn is_bootstrap(&self) -> bool {
        self.server == BOOTSTRAP_SERVER
    }

    /// Event interest for the current phase. Dialing connections always want
    /// writability (that is how connect completion is reported); otherwise
    /// the session decides based on buffered output.
    pub fn interest(&self) -> Interest {
        match self.phase {
            Phase::Dialing => Interest::READABLE.add(Interest::WRITABLE),
            _ => self.session.interest(),
        }
    }

    /// Surface a deferred socket error, if any.
    pub fn take_error(&self) -> std::io::Result<Option<std::io::Error>> {
        self.session.take_error()
    }

    /// Called on the first writable event while dialing. Returns the error
    /// if the connect actually failed.
    pub fn on_established(&mut self) -> std::io::Result<()> {
        if let Some(e) = self.session.take_error()? {
            return Err(e);
        }
        if !self.session.is_established() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "writable before established",
            ));
        }
        Ok(())
    }

    /// Pipeline an operation onto the wire buffer. Caller must have checked
    /// the phase; only `Ready` connections accept writes.
    pub fn send(&mut self, op: Operation) -> std::io::Result<usize> {
        debug_assert_eq!(self.phase, Phase::Ready);
        self.session.send(op).map_err(|e| {
            error!("failed to compose frame: {}", e);
            e
        })
    }

    /// Pipeline an engine-internal operation regardless of phase. The SASL
    /// exchange and configuration fetches run before the connection is
    /// `Ready`.
    pub fn send_unchecked(&mut self, op: Operation) -> std::io::Result<usize> {
        self.session.send(op)
    }

    /// Queue an operation while the connection is not yet ready.
    pub fn park(&mut self, op: Operation) {
        self.park.push_back(op);
    }

    /// Move parked operations onto the wire, in arrival order.
    pub fn flush_park(&mut self) -> std::io::Result<()> {
        while let Some(op) = self.park.pop_front() {
            self.session.send(op)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.session.flush()
    }

    pub fn fill(&mut self) -> std::io::Result<usize> {
        self.session.fill()
    }

    /// Decode one response. `WouldBlock` means no complete frame is buffered.
    pub fn receive(&mut self) -> std::io::Result<(Operation, Response)> {
        let (op, response) = self.session.receive()?;

        // responses arrive in request order; a mismatched opaque means the
        // connection state no longer matches the wire
        if op.opaque != response.opaque() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "opaque mismatch",
            ));
        }

        Ok((op, response))
    }

    pub fn write_pending(&self) -> usize {
        self.session.write_pending()
    }

    pub fn pending_len(&self) -> usize {
        self.session.pending_len()
    }

    /// Whether a draining connection has finished its work.
    pub fn drained(&self) -> bool {
        self.session.pending_len() == 0 && self.session.write_pending() == 0
    }

    /// Tear down, returning the operations this connection still owns. The
    /// first list reached the wire buffer (their execution state is unknown,
    /// they must be failed); the second never left the park list and is safe
    /// to re-route.
    pub fn abort(&mut self) -> (Vec<Operation>, Vec<Operation>) {
        self.phase = Phase::Dead;
        let wire: Vec<Operation> = self.session.take_pending().into();
        let parked: Vec<Operation> = std::mem::take(&mut self.park).into();
        (wire, parked)
    }

    /// Find a live (not timed-out) operation by opaque, searching in-flight
    /// and parked operations.
    pub fn find_op_mut(&mut self, opaque: u32) -> Option<&mut Operation> {
        self.session
            .pending_mut()
            .iter_mut()
            .chain(self.park.iter_mut())
            .find(|op| op.opaque == opaque && !op.completed)
    }
}

impl net::event::Source for ServerConnection {
    fn register(
        &mut self,
        registry: &net::Registry,
        token: net::Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.session.register(registry, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &net::Registry,
        token: net::Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.session.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &net::Registry) -> std::io::Result<()> {
        self.session.deregister(registry)
    }
}

/// Exponential reconnect backoff, doubling per consecutive failure up to the
/// cap, reset when a connection reaches `Ready`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    next: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            next: base,
            base,
            max,
        }
    }

    /// The delay to wait before the next attempt, advancing the schedule.
    pub fn advance(&mut self) -> Duration {
        let current = self.next;
        self.next = std::cmp::min(self.next * 2, self.max);
        current
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(backoff.advance(), Duration::from_millis(100));
        assert_eq!(backoff.advance(), Duration::from_millis(200));
        assert_eq!(backoff.advance(), Duration::from_millis(400));
        assert_eq!(backoff.advance(), Duration::from_millis(500));
        assert_eq!(backoff.advance(), Duration::from_millis(500));

        backoff.reset();
        assert_eq!(backoff.advance(), Duration::from_millis(100));
    }
}
