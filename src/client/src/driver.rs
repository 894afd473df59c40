// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::WAKER_TOKEN;
use net::event::Source;
use net::{Events, Interest, Token, Waker};
use std::sync::Arc;
use std::time::Duration;

/// The readiness I/O provider the engine runs on. The built-in
/// implementation wraps a mio poll; completion-oriented loops integrate by
/// translating completions into readiness events behind this same interface.
///
/// Registrations are level-style from the engine's point of view: after
/// handling an event, connections re-assert their current interest via
/// `reregister`.
pub trait IoDriver {
    /// Wait for events, at most `timeout`.
    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> std::io::Result<()>;

    fn register(
        &self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> std::io::Result<()>;

    fn reregister(
        &self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> std::io::Result<()>;

    fn deregister(&self, source: &mut dyn Source) -> std::io::Result<()>;

    /// A handle other threads may use to interrupt `poll`. The only object
    /// in the engine that is allowed to cross threads.
    fn waker(&self) -> Arc<Waker>;
}

/// The built-in driver over a mio poll instance.
pub struct MioDriver {
    poll: net::Poll,
    waker: Arc<Waker>,
}

impl MioDriver {
    pub fn new() -> std::io::Result<Self> {
        let poll = net::Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self { poll, waker })
    }
}

impl IoDriver for MioDriver {
    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> std::io::Result<()> {
        self.poll.poll(events, timeout)
    }

    fn register(
        &self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    fn reregister(
        &self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    fn deregister(&self, source: &mut dyn Source) -> std::io::Result<()> {
        self.poll.registry().deregister(source)
    }

    fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }
}
