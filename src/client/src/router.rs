// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The submit path and its failure branches: hash the key against the
//! current map, pick the owning connection, pipeline the frame, and recover
//! when the topology moved underneath an in-flight operation.

use crate::bootstrap::State as BootstrapState;
use crate::connection::{Phase, ServerConnection, BOOTSTRAP_SERVER};
use crate::handle::{Channel, Client};
use crate::operation::Operation;
use crate::scheduler::TimerKind;
use crate::*;
use cluster::{ConfigDocument, VBucketMap};
use std::sync::Arc;

impl Client {
    /// Submit a command. A successful return guarantees exactly one callback
    /// later; an error return guarantees none.
    pub fn submit(&mut self, command: Command, cookie: Cookie) -> Result<()> {
        if self.shutting_down {
            return Err(Error::Shutdown);
        }

        if let Some(key) = command.key() {
            if key.is_empty() {
                return Err(Error::EmptyKey);
            }
        }

        let map = self.map.clone().ok_or(Error::NotBootstrapped)?;

        let replica = match command {
            Command::GetReplica { replica, .. } => {
                if replica >= map.num_replicas() {
                    return Err(Error::NoReplica);
                }
                Some(replica)
            }
            _ => None,
        };

        let deadline = self.clock.now() + self.settings.op_timeout();
        let mut op = Operation::new(command.kind(), cookie, command.to_request(), deadline);
        op.replica = replica;

        self.pending_user_ops += 1;
        self.dispatch_op(op);
        Ok(())
    }

    /// Route an operation against the current map and hand it to the owning
    /// connection. Never fails synchronously: an operation that cannot be
    /// dispatched completes through its callback.
    pub(crate) fn dispatch_op(&mut self, mut op: Operation) {
        let map = match self.map.clone() {
            Some(map) => map,
            None => {
                self.complete_op(&mut op, Err(Error::NotBootstrapped));
                return;
            }
        };

        let (vbucket, server) = {
            let (vbucket, master) = map.route_master(op.request.key());
            let routed = match op.replica {
                Some(which) => map.route_replica(vbucket, which),
                None => master,
            };
            (vbucket, routed)
        };

        let server = match server {
            Some(server) => server,
            None => {
                // the row has no owner (mid-rebalance) or the replica slot is
                // unpopulated
                let error = if op.replica.is_some() {
                    Error::NoReplica
                } else {
                    Error::NoServerForKey
                };
                self.complete_op(&mut op, Err(error));
                return;
            }
        };

        self.dispatch_to_server(op, &map, vbucket, server);
    }

    /// Dispatch with the destination server chosen by the caller (replica
    /// reads and observe polls route explicitly).
    pub(crate) fn dispatch_to_server(
        &mut self,
        mut op: Operation,
        map: &Arc<VBucketMap>,
        vbucket: u16,
        server: usize,
    ) {
        let token = match self.ensure_connection(map, server) {
            Ok(token) => token,
            Err(e) => {
                warn!("failed to dial server {}: {}", server, e);
                self.note_network_error();
                if op.kind.is_internal() {
                    self.discard_internal(&mut op);
                } else {
                    self.complete_op(&mut op, Err(e));
                }
                return;
            }
        };

        op.stamp(vbucket, server, self.next_opaque());
        op.deadline_timer = Some(self.timers.schedule(
            op.deadline,
            TimerKind::OpDeadline {
                token,
                opaque: op.opaque,
            },
        ));

        let phase = match self.channels.get_mut(token) {
            Some(Channel::Data(conn)) => conn.phase,
            _ => {
                self.cancel_op_timer(&mut op);
                if op.kind.is_internal() {
                    self.discard_internal(&mut op);
                } else {
                    self.complete_op(&mut op, Err(Error::Internal("routed to a non-data channel")));
                }
                return;
            }
        };

        match phase {
            Phase::Ready => {
                let send_failed = match self.channels.get_mut(token) {
                    Some(Channel::Data(conn)) => conn.send(op).is_err(),
                    _ => true,
                };
                if send_failed {
                    self.fail_data_connection(token, Error::Protocol("compose failed"));
                    return;
                }
                self.reassert_interest(token);
            }
            Phase::Dialing | Phase::Authenticating => {
                if let Some(Channel::Data(conn)) = self.channels.get_mut(token) {
                    conn.park(op);
                }
            }
            Phase::Draining | Phase::Dead => {
                // routing never selects these: draining connections have
                // been removed from the token table
                self.cancel_op_timer(&mut op);
                if op.kind.is_internal() {
                    self.discard_internal(&mut op);
                } else {
                    self.complete_op(&mut op, Err(Error::Internal("routed to a dead connection")));
                }
            }
        }
    }

    fn cancel_op_timer(&mut self, op: &mut Operation) {
        if let Some(timer) = op.deadline_timer.take() {
            self.timers.cancel(timer);
        }
    }

    /// The connection for a server index, dialing one lazily on the first
    /// route hit.
    pub(crate) fn ensure_connection(
        &mut self,
        map: &Arc<VBucketMap>,
        server: usize,
    ) -> Result<usize> {
        if let Some(&token) = self.server_tokens.get(&server) {
            return Ok(token);
        }

        let endpoint = map.server(server).ok_or(Error::NoServerForKey)?;
        let token = self.open_data_connection(server, &endpoint.authority())?;
        self.server_tokens.insert(server, token);
        Ok(token)
    }

    /// Dial an authority and register the new connection with the driver.
    pub(crate) fn open_data_connection(&mut self, server: usize, authority: &str) -> Result<usize> {
        let conn = ServerConnection::connect(server, authority)?;

        let entry = self.channels.vacant_entry();
        let token = entry.key();
        let conn = entry.insert(Channel::Data(conn));

        if let Channel::Data(conn) = conn {
            let interest = conn.interest();
            if let Err(e) = self.driver.register(conn, net::Token(token), interest) {
                error!("failed to register connection: {}", e);
                self.channels.remove(token);
                return Err(Error::Driver(e));
            }
        }

        Ok(token)
    }

    /// A dialing connection reported established: start the SASL exchange or
    /// go straight to ready.
    pub(crate) fn promote_connection(&mut self, token: usize) {
        let needs_auth = self.settings.credentials().is_some();

        if needs_auth {
            if let Some(Channel::Data(conn)) = self.channels.get_mut(token) {
                trace!("{} established, authenticating", conn.authority);
                conn.phase = Phase::Authenticating;
            }
            self.send_internal(token, OpKind::SaslListMechs, Request::sasl_list_mechs());
        } else {
            self.make_ready(token);
        }
    }

    /// Transition a connection to ready: reset its backoff, move parked
    /// operations onto the wire, and (for bootstrap connections) fetch the
    /// configuration this connection was opened for.
    pub(crate) fn make_ready(&mut self, token: usize) {
        let (server, is_bootstrap, park_failed) = {
            let conn = match self.channels.get_mut(token) {
                Some(Channel::Data(conn)) => conn,
                _ => return,
            };
            conn.phase = Phase::Ready;
            debug!("{} ready", conn.authority);
            let park_failed = conn.flush_park().is_err();
            (conn.server, conn.is_bootstrap(), park_failed)
        };

        if park_failed {
            self.fail_data_connection(token, Error::Protocol("compose failed"));
            return;
        }

        if !is_bootstrap {
            if let Some(backoff) = self.backoffs.get_mut(&server) {
                backoff.reset();
            }
        }

        if is_bootstrap {
            self.send_internal(token, OpKind::ClusterConfig, Request::get_cluster_config());
        }

        self.reassert_interest(token);
    }

    /// A connection failed mid-stream or while dialing. Operations that
    /// reached the wire fail with a network error; parked operations never
    /// left this process and are re-routed. Schedules a backed-off reconnect
    /// for mapped servers and nudges the refresh thresholds.
    pub(crate) fn fail_data_connection(&mut self, token: usize, error: Error) {
        let (server, is_bootstrap, authority, wire, parked) = {
            let conn = match self.channels.get_mut(token) {
                Some(Channel::Data(conn)) => conn,
                _ => return,
            };
            let (wire, parked) = conn.abort();
            (
                conn.server,
                conn.is_bootstrap(),
                conn.authority.clone(),
                wire,
                parked,
            )
        };

        info!("connection to {} failed: {}", authority, error);
        self.drop_channel(token);

        if is_bootstrap {
            for mut op in wire.into_iter().chain(parked) {
                self.discard_internal(&mut op);
            }
            self.on_bootstrap_attempt_failed();
            return;
        }

        self.server_tokens.remove(&server);
        self.note_network_error();

        // an inline config refresh riding on this connection dies with it
        let inline = matches!(
            &self.bootstrap.state,
            BootstrapState::CccpInline { token: inline } if *inline == token
        );
        if inline {
            self.on_bootstrap_attempt_failed();
        }

        for mut op in wire {
            if op.kind.is_internal() {
                self.discard_internal(&mut op);
            } else if !op.completed {
                self.complete_op(&mut op, Err(Error::Network(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection failed",
                ))));
            }
        }

        // parked operations never hit the socket; re-route them (the map may
        // have moved their keys elsewhere by now)
        for mut op in parked {
            self.cancel_op_timer(&mut op);
            if op.kind.is_internal() {
                self.discard_internal(&mut op);
            } else if !op.completed {
                self.dispatch_op(op);
            }
        }

        // warm the pipe again after a backoff, if the node is still mapped
        let delay = self
            .backoffs
            .entry(server)
            .or_insert_with(|| {
                crate::connection::Backoff::new(
                    self.settings.retry_backoff_base(),
                    self.settings.retry_backoff_max(),
                )
            })
            .advance();
        let now = self.clock.now();
        self.timers
            .schedule_after(now, delay, TimerKind::Reconnect { server });
    }

    /// `NOT_MY_VBUCKET`: adopt the piggy-backed configuration when the server
    /// sent one, otherwise ask for a refresh, then re-route.
    pub(crate) fn on_not_my_vbucket(&mut self, token: usize, mut op: Operation, response: &Response) {
        self.cancel_op_timer(&mut op);

        let host = match self.channels.get(token) {
            Some(Channel::Data(conn)) => conn
                .authority
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| conn.authority.clone()),
            _ => String::new(),
        };

        let mut adopted = false;
        if !response.value().is_empty() {
            if let Ok(text) = std::str::from_utf8(response.value()) {
                let text = cluster::replace_host_placeholder(text, &host);
                match ConfigDocument::parse(&text) {
                    Ok(document) => adopted = self.install_config(&document),
                    Err(e) => debug!("unparseable config in not-my-vbucket response: {}", e),
                }
            }
        }

        if !adopted {
            self.request_refresh();
        }

        if op.retries >= self.settings.retry_limit() {
            self.complete_op(&mut op, Err(Error::RetriesExhausted));
            return;
        }

        op.retries += 1;
        trace!(
            "re-routing opaque {} after not-my-vbucket (retry {})",
            op.opaque,
            op.retries
        );
        op.deadline_timer = None;
        self.dispatch_op(op);
    }

    /// Adopt a configuration document. Returns true when the topology
    /// actually changed (a no-op document is skipped).
    pub(crate) fn install_config(&mut self, document: &ConfigDocument) -> bool {
        let map = match VBucketMap::from_document(document) {
            Ok(map) => map,
            Err(e) => {
                warn!("rejecting configuration: {}", e);
                return false;
            }
        };

        if let Some(current) = &self.map {
            if current.same_topology(&map) {
                trace!("configuration identical to current, skipping");
                self.on_map_installed(false);
                return false;
            }
        }

        let map = Arc::new(map);

        // keep connections whose endpoint survives, under its (possibly new)
        // server index; drain connections to removed nodes
        let mut kept = std::collections::HashMap::new();
        for (token, channel) in self.channels.iter_mut() {
            let conn = match channel {
                Channel::Data(conn) => conn,
                Channel::Http(_) => continue,
            };
            if conn.is_bootstrap() || conn.phase == Phase::Dead || conn.phase == Phase::Draining {
                continue;
            }

            let new_index = map
                .endpoints()
                .iter()
                .position(|endpoint| endpoint.authority() == conn.authority);

            match new_index {
                Some(index) => {
                    conn.server = index;
                    kept.insert(index, token);
                }
                None => {
                    debug!("{} left the topology, draining", conn.authority);
                    conn.phase = Phase::Draining;
                }
            }
        }

        self.server_tokens = kept;
        self.map = Some(map);
        self.on_map_installed(true);
        true
    }

    /// Count a network-class error against the refresh thresholds.
    pub(crate) fn note_network_error(&mut self) {
        self.error_count += 1;
        let now = self.clock.now();
        self.first_error_at.get_or_insert(now);
        self.maybe_refresh();
    }

    /// Trigger a refresh when either error threshold has been crossed.
    pub(crate) fn maybe_refresh(&mut self) {
        let count_exceeded = self.error_count >= self.settings.conf_err_threshold();
        let delay_exceeded = self
            .first_error_at
            .map(|at| self.clock.now().duration_since(at) >= self.settings.conf_delay_threshold())
            .unwrap_or(false);

        if count_exceeded || delay_exceeded {
            debug!(
                "error thresholds crossed ({} errors), requesting refresh",
                self.error_count
            );
            self.request_refresh();
        }
    }

    /// Bookkeeping common to every successful (or skipped-identical) map
    /// installation: thresholds reset and the bootstrap walk is settled.
    pub(crate) fn on_map_installed(&mut self, changed: bool) {
        self.error_count = 0;
        self.first_error_at = None;
        self.finish_bootstrap(changed);
    }

    pub(crate) fn next_opaque(&mut self) -> u32 {
        self.opaque_counter = self.opaque_counter.wrapping_add(1);
        self.opaque_counter
    }

    /// Remove a channel from the slab and the driver.
    pub(crate) fn drop_channel(&mut self, token: usize) {
        if !self.channels.contains(token) {
            return;
        }
        let mut channel = self.channels.remove(token);
        let source: &mut dyn net::event::Source = match &mut channel {
            Channel::Data(conn) => conn,
            Channel::Http(http) => http,
        };
        let _ = self.driver.deregister(source);
    }

    /// Re-assert a channel's current interest with the driver. Registrations
    /// are consumed by delivery, so this runs after every handled event and
    /// after every write that may have changed the interest set.
    pub(crate) fn reassert_interest(&mut self, token: usize) {
        let failed = match self.channels.get_mut(token) {
            Some(Channel::Data(conn)) => {
                let interest = conn.interest();
                self.driver
                    .reregister(conn, net::Token(token), interest)
                    .is_err()
            }
            Some(Channel::Http(http)) => {
                let interest = http.interest();
                self.driver
                    .reregister(http, net::Token(token), interest)
                    .is_err()
            }
            None => false,
        };

        if failed {
            error!("failed to reregister channel {}", token);
            match self.channels.get(token) {
                Some(Channel::Data(_)) => {
                    self.fail_data_connection(token, Error::Internal("reregister failed"))
                }
                Some(Channel::Http(_)) => {
                    self.fail_http_channel(token, Error::Internal("reregister failed"))
                }
                None => {}
            }
        }
    }
}
