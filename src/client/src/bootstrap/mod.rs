// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Topology acquisition. Two transports fetch the same configuration
//! document: an inline binary-protocol fetch on the data port, and a
//! streaming HTTP feed on the management port. The provider walks the
//! transports in the caller's order and, within each transport, the host
//! list in order, bounded by a per-host deadline and (for the initial
//! bootstrap) an overall deadline.
//!
//! The initial walk failing is fatal to `connect`; a refresh walk failing
//! only schedules a backed-off retry. When a refresh is wanted and a ready
//! data connection already exists, the provider asks that connection for a
//! config inline before opening any new sockets.

use crate::connection::{Backoff, Phase, BOOTSTRAP_SERVER};
use crate::handle::{Channel, Client};
use crate::scheduler::{TimerId, TimerKind};
use crate::*;
use cluster::ConfigDocument;

pub(crate) struct Bootstrap {
    pub state: State,
    /// Terminal error of the initial bootstrap, taken by `wait`.
    pub error: Option<Error>,
    pub refresh_backoff: Backoff,
    /// Memcached buckets never speak the binary config opcode.
    pub cccp_disabled: bool,
    /// A refresh was requested while a walk was already running.
    refresh_queued: bool,
}

pub(crate) enum State {
    Idle,
    Walking(Walk),
    /// Refresh requested over an established data connection.
    CccpInline { token: usize },
    Established,
}

pub(crate) struct Walk {
    pub initial: bool,
    transports: Vec<BootstrapTransport>,
    transport_idx: usize,
    host_idx: usize,
    pub attempt_token: Option<usize>,
    pub node_timer: Option<TimerId>,
    pub total_timer: Option<TimerId>,
}

impl Bootstrap {
    pub fn new(backoff_base: std::time::Duration, backoff_max: std::time::Duration) -> Self {
        Self {
            state: State::Idle,
            error: None,
            refresh_backoff: Backoff::new(backoff_base, backoff_max),
            cccp_disabled: false,
            refresh_queued: false,
        }
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.state, State::Walking(_) | State::CccpInline { .. })
    }

    /// The attempt token when a walk is running.
    fn attempt(&self) -> Option<usize> {
        match &self.state {
            State::Walking(walk) => walk.attempt_token,
            _ => None,
        }
    }
}

impl Client {
    /// Begin the initial bootstrap. Non-blocking: drive the loop (`wait`)
    /// until a map is installed or the walk fails.
    pub(crate) fn start_bootstrap(&mut self) -> Result<()> {
        if self.map.is_some() {
            // seeded by the caller; the network walk runs only when a
            // refresh is provoked
            self.bootstrap.state = State::Established;
            return Ok(());
        }

        if self.bootstrap.in_progress() {
            return Ok(());
        }

        self.bootstrap.error = None;

        let now = self.clock.now();
        let total_timer = Some(self.timers.schedule_after(
            now,
            self.settings.config_total_timeout(),
            TimerKind::BootstrapTotal,
        ));

        self.bootstrap.state = State::Walking(Walk {
            initial: true,
            transports: self.walk_transports(),
            transport_idx: 0,
            host_idx: 0,
            attempt_token: None,
            node_timer: None,
            total_timer,
        });
        self.begin_attempt();
        Ok(())
    }

    fn walk_transports(&self) -> Vec<BootstrapTransport> {
        self.settings
            .transports()
            .iter()
            .copied()
            .filter(|transport| {
                !(self.bootstrap.cccp_disabled && *transport == BootstrapTransport::Cccp)
            })
            .collect()
    }

    /// Try the next (transport, host) pair until an attempt starts or the
    /// walk is exhausted.
    pub(crate) fn begin_attempt(&mut self) {
        if self.shutting_down {
            return;
        }
        loop {
            let (transport_idx, host_idx, transport) = match &self.bootstrap.state {
                State::Walking(walk) => match walk.transports.get(walk.transport_idx) {
                    Some(transport) => (walk.transport_idx, walk.host_idx, *transport),
                    None => {
                        self.walk_exhausted();
                        return;
                    }
                },
                _ => return,
            };

            let hosts = match transport {
                BootstrapTransport::Cccp => self.settings.hosts().to_vec(),
                BootstrapTransport::HttpStreaming => self.mgmt_authorities(),
            };

            let host = match hosts.get(host_idx) {
                Some(host) => host.clone(),
                None => {
                    if let State::Walking(walk) = &mut self.bootstrap.state {
                        walk.transport_idx = transport_idx + 1;
                        walk.host_idx = 0;
                    }
                    continue;
                }
            };

            debug!("bootstrap attempt: {:?} {}", transport, host);

            let attempt = match transport {
                BootstrapTransport::Cccp => self.open_data_connection(BOOTSTRAP_SERVER, &host),
                BootstrapTransport::HttpStreaming => self.open_config_feed(&host),
            };

            match attempt {
                Ok(token) => {
                    let now = self.clock.now();
                    let node_timer = self.timers.schedule_after(
                        now,
                        self.settings.config_node_timeout(),
                        TimerKind::BootstrapNode,
                    );
                    if let State::Walking(walk) = &mut self.bootstrap.state {
                        walk.attempt_token = Some(token);
                        walk.node_timer = Some(node_timer);
                    }
                    return;
                }
                Err(e) => {
                    info!("bootstrap attempt {} failed to start: {}", host, e);
                    if let State::Walking(walk) = &mut self.bootstrap.state {
                        walk.host_idx += 1;
                    }
                }
            }
        }
    }

    /// The management-port authorities the HTTP transport dials: explicit
    /// when configured, otherwise the data hosts with the default
    /// management port.
    fn mgmt_authorities(&self) -> Vec<String> {
        let explicit = self.settings.mgmt_hosts();
        if !explicit.is_empty() {
            return explicit.to_vec();
        }
        self.settings
            .hosts()
            .iter()
            .map(|authority| {
                let host = authority
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(authority);
                format!("{}:8091", host)
            })
            .collect()
    }

    /// The in-flight attempt failed (dial error, EOF, malformed payload).
    pub(crate) fn on_bootstrap_attempt_failed(&mut self) {
        let inline_failed = matches!(self.bootstrap.state, State::CccpInline { .. });
        if inline_failed {
            // inline refresh failed; fall back to a full walk
            self.bootstrap.state = State::Established;
            self.start_refresh_walk();
            return;
        }

        let node_timer = match &mut self.bootstrap.state {
            State::Walking(walk) => {
                walk.attempt_token = None;
                walk.host_idx += 1;
                walk.node_timer.take()
            }
            _ => return,
        };

        if let Some(timer) = node_timer {
            self.timers.cancel(timer);
        }
        self.begin_attempt();
    }

    /// A fatal response (authentication rejected, bucket missing) aborts the
    /// walk outright; no other host will answer differently.
    pub(crate) fn on_bootstrap_attempt_fatal(&mut self, error: Error) {
        warn!("bootstrap aborted: {}", error);
        self.abort_walk();
        self.bootstrap.error = Some(error);
    }

    fn abort_walk(&mut self) {
        let (timers, attempt) = match &mut self.bootstrap.state {
            State::Walking(walk) => {
                let timers: Vec<TimerId> = walk
                    .node_timer
                    .take()
                    .into_iter()
                    .chain(walk.total_timer.take())
                    .collect();
                (timers, walk.attempt_token.take())
            }
            _ => (Vec::new(), None),
        };

        for timer in timers {
            self.timers.cancel(timer);
        }
        if let Some(token) = attempt {
            self.drop_channel(token);
        }

        self.bootstrap.state = if self.map.is_some() {
            State::Established
        } else {
            State::Idle
        };
    }

    fn walk_exhausted(&mut self) {
        let initial = match &self.bootstrap.state {
            State::Walking(walk) => walk.initial,
            _ => return,
        };

        self.abort_walk();

        if initial && self.map.is_none() {
            warn!("bootstrap failed: all transports and hosts exhausted");
            self.bootstrap.error = Some(Error::BootstrapFailed);
        } else {
            let delay = self.bootstrap.refresh_backoff.advance();
            debug!("refresh failed, retrying in {:?}", delay);
            let now = self.clock.now();
            self.timers
                .schedule_after(now, delay, TimerKind::BootstrapRetry);
        }
    }

    /// The per-host attempt deadline fired.
    pub(crate) fn on_bootstrap_node_timeout(&mut self) {
        let attempt = match &mut self.bootstrap.state {
            State::Walking(walk) => {
                walk.node_timer = None;
                walk.host_idx += 1;
                walk.attempt_token.take()
            }
            _ => return,
        };

        if let Some(token) = attempt {
            debug!("bootstrap attempt timed out");
            self.drop_channel(token);
        }
        self.begin_attempt();
    }

    /// The overall bootstrap deadline fired.
    pub(crate) fn on_bootstrap_total_timeout(&mut self) {
        let fatal = match &mut self.bootstrap.state {
            State::Walking(walk) => {
                walk.total_timer = None;
                walk.initial && self.map.is_none()
            }
            _ => false,
        };

        self.abort_walk();

        if fatal {
            warn!("bootstrap failed: overall deadline elapsed");
            self.bootstrap.error = Some(Error::BootstrapFailed);
        }
    }

    /// The backed-off refresh retry fired.
    pub(crate) fn on_bootstrap_retry(&mut self) {
        self.start_refresh_walk();
    }

    /// Ask for a fresh configuration. Prefers asking an established data
    /// connection inline; falls back to a full transport walk.
    pub(crate) fn request_refresh(&mut self) {
        if self.shutting_down {
            return;
        }
        if self.bootstrap.in_progress() {
            self.bootstrap.refresh_queued = true;
            return;
        }

        if !self.bootstrap.cccp_disabled {
            let ready = self
                .channels
                .iter()
                .find_map(|(token, channel)| match channel {
                    Channel::Data(conn)
                        if conn.phase == Phase::Ready && !conn.is_bootstrap() =>
                    {
                        Some(token)
                    }
                    _ => None,
                });

            if let Some(token) = ready {
                trace!("refreshing configuration inline over channel {}", token);
                self.bootstrap.state = State::CccpInline { token };
                self.send_internal(token, OpKind::ClusterConfig, Request::get_cluster_config());
                return;
            }
        }

        self.start_refresh_walk();
    }

    fn start_refresh_walk(&mut self) {
        if self.bootstrap.in_progress() {
            return;
        }

        self.bootstrap.state = State::Walking(Walk {
            initial: false,
            transports: self.walk_transports(),
            transport_idx: 0,
            host_idx: 0,
            attempt_token: None,
            node_timer: None,
            total_timer: None,
        });
        self.begin_attempt();
    }

    /// A GET_CLUSTER_CONFIG response arrived (bootstrap attempt or inline
    /// refresh).
    pub(crate) fn on_config_response(&mut self, token: usize, response: Response) {
        if response.status() != Status::Success {
            debug!("config fetch failed with {:?}", response.status());

            let is_attempt = self.bootstrap.attempt() == Some(token);
            let is_inline = matches!(
                self.bootstrap.state,
                State::CccpInline { token: inline } if inline == token
            );

            if is_attempt {
                // this node does not serve configs over the data port
                self.drop_channel(token);
                self.on_bootstrap_attempt_failed();
            } else if is_inline {
                self.bootstrap.cccp_disabled = true;
                self.on_bootstrap_attempt_failed();
            }
            return;
        }

        let host = match self.channels.get(token) {
            Some(Channel::Data(conn)) => conn
                .authority
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| conn.authority.clone()),
            _ => return,
        };

        let text = match std::str::from_utf8(response.value()) {
            Ok(text) => cluster::replace_host_placeholder(text, &host),
            Err(_) => {
                warn!("configuration payload is not utf-8");
                self.drop_channel(token);
                self.on_bootstrap_attempt_failed();
                return;
            }
        };

        match ConfigDocument::parse(&text) {
            Ok(document) => {
                // adoption settles the walk through on_map_installed
                self.install_config(&document);
            }
            Err(e) => {
                warn!("unparseable configuration: {}", e);
                self.drop_channel(token);
                self.on_bootstrap_attempt_failed();
            }
        }
    }

    /// Settle bootstrap state after a map was installed (or a fetched map
    /// turned out identical).
    pub(crate) fn finish_bootstrap(&mut self, changed: bool) {
        if let Some(map) = &self.map {
            if map.is_memcached() && !self.bootstrap.cccp_disabled {
                debug!("memcached bucket: disabling inline config fetches");
                self.bootstrap.cccp_disabled = true;
            }
        }

        match std::mem::replace(&mut self.bootstrap.state, State::Established) {
            State::Walking(mut walk) => {
                for timer in walk
                    .node_timer
                    .take()
                    .into_iter()
                    .chain(walk.total_timer.take())
                {
                    self.timers.cancel(timer);
                }
                if let Some(token) = walk.attempt_token.take() {
                    // binary fetch connections close after the fetch; the
                    // streaming feed keeps its socket for pushed updates
                    match self.channels.get(token) {
                        Some(Channel::Data(_)) => self.drop_channel(token),
                        Some(Channel::Http(_)) => self.hold_config_feed_open(token),
                        None => {}
                    }
                }
                self.bootstrap.refresh_backoff.reset();
            }
            State::CccpInline { .. } => {}
            other => {
                self.bootstrap.state = other;
            }
        }

        if changed {
            self.bootstrap.error = None;
        }

        if std::mem::take(&mut self.bootstrap.refresh_queued) {
            self.request_refresh();
        }
    }
}
