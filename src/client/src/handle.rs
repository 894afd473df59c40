// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The client handle: the root object owning the topology snapshot, the
//! per-node connections, the deadline scheduler, and the event loop that
//! drives them all cooperatively on one thread.

use crate::bootstrap::Bootstrap;
use crate::connection::{Backoff, Phase, ServerConnection};
use crate::http::HttpChannel;
use crate::observe::DurabilityPoll;
use crate::operation::Operation;
use crate::registry::{Callbacks, Completion};
use crate::scheduler::{TimerKind, Timers};
use crate::*;
use cluster::{ConfigDocument, VBucketMap};
use config::ProcessInit;
use slab::Slab;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const NEVENT: usize = 1024;

/// Every registered socket is one of these.
pub(crate) enum Channel {
    Data(ServerConnection),
    Http(HttpChannel),
}

pub struct Client {
    pub(crate) settings: Settings,
    init: ProcessInit,
    pub(crate) driver: Box<dyn IoDriver>,
    pub(crate) clock: Box<dyn Clock>,
    events: net::Events,

    pub(crate) map: Option<Arc<VBucketMap>>,
    pub(crate) channels: Slab<Channel>,
    /// server index -> channel token, for connections routed to by the map
    pub(crate) server_tokens: HashMap<usize, usize>,
    pub(crate) backoffs: HashMap<usize, Backoff>,

    pub(crate) callbacks: Callbacks,
    pub(crate) timers: Timers,
    pub(crate) queued: Vec<Completion>,

    pub(crate) bootstrap: Bootstrap,
    pub(crate) durability: Slab<DurabilityPoll>,
    /// http request id -> channel token
    pub(crate) http_exchanges: HashMap<usize, usize>,
    pub(crate) next_http_id: usize,

    pub(crate) opaque_counter: u32,
    pub(crate) error_count: u32,
    pub(crate) first_error_at: Option<Instant>,
    pub(crate) pending_user_ops: usize,
    pub(crate) shutting_down: bool,
}

impl Client {
    /// Create a handle over the built-in mio driver. Nothing is dialed until
    /// `connect`.
    pub fn new(settings: Settings) -> Result<Self> {
        let driver = MioDriver::new().map_err(Error::Driver)?;
        Self::with_driver(settings, Box::new(driver))
    }

    /// Create a handle over a caller-provided I/O driver.
    pub fn with_driver(settings: Settings, driver: Box<dyn IoDriver>) -> Result<Self> {
        let init = ProcessInit::from_env();
        debug!(
            "client handle created, bucket {:?}, log level {:?}",
            settings.bucket(),
            init.log_level()
        );

        let bootstrap = Bootstrap::new(
            settings.retry_backoff_base(),
            settings.retry_backoff_max(),
        );

        Ok(Self {
            settings,
            init,
            driver,
            clock: Box::new(MonotonicClock),
            events: net::Events::with_capacity(NEVENT),
            map: None,
            channels: Slab::new(),
            server_tokens: HashMap::new(),
            backoffs: HashMap::new(),
            callbacks: Callbacks::new(),
            timers: Timers::new(),
            queued: Vec::new(),
            bootstrap,
            durability: Slab::new(),
            http_exchanges: HashMap::new(),
            next_http_id: 0,
            opaque_counter: 0,
            error_count: 0,
            first_error_at: None,
            pending_user_ops: 0,
            shutting_down: false,
        })
    }

    /// Register the callback for an operation kind. Completions for kinds
    /// without a callback are logged and dropped.
    pub fn set_callback(&mut self, kind: OpKind, callback: OpCallback) {
        self.callbacks.set_op(kind, callback);
    }

    pub fn set_durability_callback(&mut self, callback: DurabilityCallback) {
        self.callbacks.set_durability(callback);
    }

    pub fn set_http_callback(&mut self, callback: HttpCallback) {
        self.callbacks.set_http(callback);
    }

    /// Begin bootstrapping. Non-blocking; drive with `wait` or `run_once`.
    pub fn connect(&mut self) -> Result<()> {
        if self.shutting_down {
            return Err(Error::Shutdown);
        }
        self.start_bootstrap()
    }

    /// Install a caller-provided configuration document (for example one
    /// cached from an earlier run) and skip the initial network bootstrap.
    pub fn seed_config(&mut self, text: &str) -> Result<()> {
        let document =
            ConfigDocument::parse(text).map_err(|_| Error::Protocol("invalid seed configuration"))?;
        if self.install_config(&document) {
            Ok(())
        } else {
            Err(Error::Protocol("unusable seed configuration"))
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.map.is_some()
    }

    /// The current topology snapshot.
    pub fn vbucket_map(&self) -> Option<Arc<VBucketMap>> {
        self.map.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The process-wide knobs captured when this handle was created.
    pub fn process_init(&self) -> &ProcessInit {
        &self.init
    }

    /// Submitted operations not yet completed.
    pub fn pending_operations(&self) -> usize {
        self.pending_user_ops
    }

    /// A handle other threads may use to interrupt a blocked `run_once`.
    pub fn waker(&self) -> Arc<net::Waker> {
        self.driver.waker()
    }

    fn is_idle(&self) -> bool {
        !self.bootstrap.in_progress()
            && self.pending_user_ops == 0
            && self.durability.is_empty()
            && self.http_exchanges.is_empty()
            && self.queued.is_empty()
    }

    /// Drive the event loop until nothing is outstanding: bootstrap settled,
    /// every submitted operation completed, durability polls and HTTP
    /// exchanges finished.
    pub fn wait(&mut self) -> Result<()> {
        loop {
            self.deliver_queued();
            if let Some(error) = self.bootstrap.error.take() {
                return Err(error);
            }
            if self.is_idle() {
                return Ok(());
            }
            self.run_once(self.settings.timer_granularity())?;
        }
    }

    /// One turn of the event loop: expire timers, wait for readiness at most
    /// `max_wait`, move bytes, deliver completions.
    pub fn run_once(&mut self, max_wait: Duration) -> Result<()> {
        let now = self.clock.now();
        self.process_timers(now);

        let timeout = if self.queued.is_empty() {
            let granularity = self.settings.timer_granularity();
            let until_deadline = self
                .timers
                .next_deadline()
                .map(|at| at.saturating_duration_since(now))
                .unwrap_or(granularity);
            std::cmp::min(std::cmp::min(granularity, until_deadline), max_wait)
        } else {
            // completions are already waiting; do not block
            Duration::ZERO
        };

        let mut events = std::mem::replace(&mut self.events, net::Events::with_capacity(0));
        let poll_result = self.driver.poll(&mut events, Some(timeout));

        let summaries: Vec<(usize, bool, bool, bool)> = events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(|event| {
                (
                    event.token().0,
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                )
            })
            .collect();
        self.events = events;

        if let Err(e) = poll_result {
            if e.kind() != std::io::ErrorKind::Interrupted {
                return Err(Error::Driver(e));
            }
        }

        for (token, readable, writable, error) in summaries {
            self.handle_event(token, readable, writable, error);
        }

        let now = self.clock.now();
        self.process_timers(now);
        self.deliver_queued();
        Ok(())
    }

    fn handle_event(&mut self, token: usize, readable: bool, writable: bool, error: bool) {
        match self.channels.get(token) {
            None => {
                // channel was torn down earlier this turn
                trace!("event for stale token {}", token);
            }
            Some(Channel::Http(_)) => self.on_http_event(token, readable, writable, error),
            Some(Channel::Data(_)) => self.on_data_event(token, readable, writable, error),
        }
    }

    fn on_data_event(&mut self, token: usize, readable: bool, writable: bool, error: bool) {
        if error {
            let cause = match self.channels.get(token) {
                Some(Channel::Data(conn)) => conn
                    .take_error()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "socket error")
                    }),
                _ => return,
            };
            self.fail_data_connection(token, Error::Network(cause));
            return;
        }

        if writable {
            let established = match self.channels.get_mut(token) {
                Some(Channel::Data(conn)) if conn.phase == Phase::Dialing => {
                    Some(conn.on_established())
                }
                Some(Channel::Data(_)) => None,
                _ => return,
            };

            match established {
                Some(Ok(())) => self.promote_connection(token),
                Some(Err(e)) => {
                    self.fail_data_connection(token, Error::ConnectFailed(e));
                    return;
                }
                None => {}
            }

            let flushed = match self.channels.get_mut(token) {
                Some(Channel::Data(conn)) if conn.phase != Phase::Dialing => match conn.flush() {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                    Err(e) => Err(e),
                },
                _ => Ok(()),
            };

            if let Err(e) = flushed {
                self.fail_data_connection(token, Error::Network(e));
                return;
            }
        }

        if readable {
            let filled = match self.channels.get_mut(token) {
                Some(Channel::Data(conn)) => conn.fill(),
                _ => return,
            };

            match filled {
                Ok(0) => {
                    debug!("peer closed connection");
                    self.fail_data_connection(
                        token,
                        Error::Network(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "remote close",
                        )),
                    );
                    return;
                }
                Ok(_) => {
                    if self.drain_responses(token) {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.fail_data_connection(token, Error::Network(e));
                    return;
                }
            }
        }

        let drained = match self.channels.get(token) {
            Some(Channel::Data(conn)) => conn.phase == Phase::Draining && conn.drained(),
            _ => return,
        };

        if drained {
            debug!("draining connection finished");
            self.drop_channel(token);
            return;
        }

        self.reassert_interest(token);
    }

    /// Decode and dispatch every complete response buffered on a connection.
    /// Returns true when the connection was torn down in the process.
    fn drain_responses(&mut self, token: usize) -> bool {
        loop {
            let received = match self.channels.get_mut(token) {
                Some(Channel::Data(conn)) => conn.receive(),
                _ => return true,
            };

            match received {
                Ok((op, response)) => {
                    self.on_response(token, op, response);
                    if !self.channels.contains(token) {
                        return true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    warn!("framing violation: {}", e);
                    self.fail_data_connection(token, Error::Protocol("malformed response"));
                    return true;
                }
                Err(e) => {
                    self.fail_data_connection(token, Error::Network(e));
                    return true;
                }
            }
        }
    }

    fn process_timers(&mut self, now: Instant) {
        while let Some((_, kind)) = self.timers.pop_expired(now) {
            match kind {
                TimerKind::OpDeadline { token, opaque } => self.on_op_deadline(token, opaque),
                TimerKind::Reconnect { server } => self.on_reconnect_timer(server),
                TimerKind::BootstrapNode => self.on_bootstrap_node_timeout(),
                TimerKind::BootstrapTotal => self.on_bootstrap_total_timeout(),
                TimerKind::BootstrapRetry => self.on_bootstrap_retry(),
                TimerKind::HtconfigIdle { token } => self.on_htconfig_idle(token),
                TimerKind::DurabilityPoll { id } => self.on_durability_poll(id),
                TimerKind::DurabilityDeadline { id } => self.on_durability_deadline(id),
                TimerKind::HttpDeadline { id } => self.on_http_deadline(id),
            }
        }
    }

    /// An operation's deadline fired. Parked operations are unlinked
    /// outright; operations already on the wire leave a tombstone so the
    /// response stream stays aligned with the pending queue.
    fn on_op_deadline(&mut self, token: usize, opaque: u32) {
        enum Expired {
            Unlinked(Operation),
            Tombstoned { kind: OpKind, cookie: Cookie },
            Gone,
        }

        let expired = match self.channels.get_mut(token) {
            Some(Channel::Data(conn)) => {
                if let Some(position) = conn
                    .park
                    .iter()
                    .position(|op| op.opaque == opaque && !op.completed)
                {
                    match conn.park.remove(position) {
                        Some(op) => Expired::Unlinked(op),
                        None => Expired::Gone,
                    }
                } else if let Some(op) = conn.find_op_mut(opaque) {
                    op.completed = true;
                    op.deadline_timer = None;
                    Expired::Tombstoned {
                        kind: op.kind,
                        cookie: op.cookie,
                    }
                } else {
                    Expired::Gone
                }
            }
            _ => Expired::Gone,
        };

        match expired {
            Expired::Unlinked(mut op) => {
                op.deadline_timer = None;
                if op.kind.is_internal() {
                    op.completed = true;
                    self.on_internal_timeout(token, op.kind, op.cookie);
                } else {
                    self.complete_op(&mut op, Err(Error::TimedOut));
                }
            }
            Expired::Tombstoned { kind, cookie } => {
                if kind.is_internal() {
                    self.on_internal_timeout(token, kind, cookie);
                } else {
                    self.pending_user_ops -= 1;
                    self.queued.push(Completion::Op {
                        kind,
                        cookie,
                        result: Err(Error::TimedOut),
                    });
                }
            }
            Expired::Gone => {}
        }
    }

    /// An engine-internal operation timed out. A hung SASL exchange or
    /// config fetch condemns its connection; a lost observe just weakens the
    /// current durability round.
    fn on_internal_timeout(&mut self, token: usize, kind: OpKind, cookie: Cookie) {
        match kind {
            OpKind::Observe => self.on_observe_failed(cookie as usize),
            OpKind::SaslAuth | OpKind::SaslListMechs | OpKind::ClusterConfig => {
                self.fail_data_connection(
                    token,
                    Error::Network(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "handshake timed out",
                    )),
                );
            }
            _ => {}
        }
    }

    /// A backed-off reconnect attempt is due.
    fn on_reconnect_timer(&mut self, server: usize) {
        if self.shutting_down || self.server_tokens.contains_key(&server) {
            return;
        }

        let map = match self.map.clone() {
            Some(map) => map,
            None => return,
        };
        if map.server(server).is_none() {
            // the node left the topology while we were backing off
            self.backoffs.remove(&server);
            return;
        }

        match self.ensure_connection(&map, server) {
            Ok(_) => {}
            Err(e) => {
                debug!("reconnect to server {} failed: {}", server, e);
                let delay = self
                    .backoffs
                    .entry(server)
                    .or_insert_with(|| {
                        Backoff::new(
                            self.settings.retry_backoff_base(),
                            self.settings.retry_backoff_max(),
                        )
                    })
                    .advance();
                let now = self.clock.now();
                self.timers
                    .schedule_after(now, delay, TimerKind::Reconnect { server });
            }
        }
    }

    /// Fail everything outstanding with `Shutdown`, deliver those callbacks
    /// synchronously, and release every socket. After this returns no
    /// callback will ever fire again.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("shutting down, {} operations pending", self.pending_user_ops);

        let tokens: Vec<usize> = self.channels.iter().map(|(token, _)| token).collect();
        for token in tokens {
            let ops = match self.channels.get_mut(token) {
                Some(Channel::Data(conn)) => {
                    let (wire, parked) = conn.abort();
                    Some(wire.into_iter().chain(parked))
                }
                _ => None,
            };

            match ops {
                Some(ops) => {
                    for mut op in ops {
                        if op.kind.is_internal() {
                            self.discard_internal(&mut op);
                        } else if !op.completed {
                            self.complete_op(&mut op, Err(Error::Shutdown));
                        }
                    }
                    self.drop_channel(token);
                }
                None => {
                    self.fail_http_channel(token, Error::Shutdown);
                }
            }
        }

        self.fail_all_durability();
        self.server_tokens.clear();
        self.backoffs.clear();
        self.deliver_queued();
        self.timers = Timers::new();
        self.map = None;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
