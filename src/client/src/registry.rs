// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Correlates decoded responses with their operations and dispatches
//! completions to the callbacks registered per operation kind.
//!
//! Correlation itself rides on the wire ordering guarantee: each connection's
//! pending queue is FIFO and the opaque is cross-checked when a response is
//! popped. What remains here is deciding *whose* completion a response is —
//! a user callback slot, or one of the engine's internal consumers (SASL,
//! configuration fetch, observe polling).

use crate::handle::{Channel, Client};
use crate::operation::Operation;
use crate::scheduler::TimerKind;
use crate::*;
use std::collections::HashMap;

/// The user-registered callback table.
pub(crate) struct Callbacks {
    ops: HashMap<OpKind, OpCallback>,
    durability: Option<DurabilityCallback>,
    http: Option<HttpCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self {
            ops: HashMap::new(),
            durability: None,
            http: None,
        }
    }

    pub fn set_op(&mut self, kind: OpKind, callback: OpCallback) {
        self.ops.insert(kind, callback);
    }

    pub fn set_durability(&mut self, callback: DurabilityCallback) {
        self.durability = Some(callback);
    }

    pub fn set_http(&mut self, callback: HttpCallback) {
        self.http = Some(callback);
    }
}

/// A completion waiting to be delivered. Completions are queued while the
/// engine holds connection borrows and delivered at the end of the loop turn.
pub(crate) enum Completion {
    Op {
        kind: OpKind,
        cookie: Cookie,
        result: std::result::Result<OpResponse, Error>,
    },
    Durability {
        cookie: Cookie,
        key: Vec<u8>,
        result: std::result::Result<u64, Error>,
    },
    Http {
        cookie: Cookie,
        result: std::result::Result<HttpResponse, Error>,
    },
}

impl Client {
    /// Queue a user-operation completion. Exactly one of these exists per
    /// accepted submit.
    pub(crate) fn complete_op(
        &mut self,
        op: &mut Operation,
        result: std::result::Result<OpResponse, Error>,
    ) {
        debug_assert!(!op.kind.is_internal());
        debug_assert!(!op.completed);
        op.completed = true;

        if let Some(timer) = op.deadline_timer.take() {
            self.timers.cancel(timer);
        }

        self.pending_user_ops -= 1;
        self.queued.push(Completion::Op {
            kind: op.kind,
            cookie: op.cookie,
            result,
        });
    }

    /// A response arrived for `op` on the connection at `token`.
    pub(crate) fn on_response(&mut self, token: usize, mut op: Operation, response: Response) {
        if op.completed {
            // deadline already fired and reported; the late response only
            // releases the queue slot
            trace!("discarding response for timed out opaque {}", op.opaque);
            return;
        }

        if op.kind.is_internal() {
            if let Some(timer) = op.deadline_timer.take() {
                self.timers.cancel(timer);
            }
        }

        match op.kind {
            OpKind::SaslListMechs => self.on_sasl_mechs(token, response),
            OpKind::SaslAuth => self.on_sasl_auth(token, response),
            OpKind::ClusterConfig => self.on_config_response(token, response),
            OpKind::Observe => {
                self.on_observe_response(op.cookie as usize, op.server, &response);
            }
            _ => match response.status() {
                Status::Success => {
                    let payload = OpResponse::from_wire(&response);
                    self.complete_op(&mut op, Ok(payload));
                }
                Status::NotMyVbucket => {
                    self.on_not_my_vbucket(token, op, &response);
                }
                status => {
                    self.complete_op(&mut op, Err(Error::from_status(status)));
                }
            },
        }
    }

    /// SASL_LIST_MECHS response: the server must offer PLAIN.
    fn on_sasl_mechs(&mut self, token: usize, response: Response) {
        let offers_plain = response.status() == Status::Success
            && response
                .value()
                .split(|&b| b == b' ')
                .any(|mech| mech == b"PLAIN");

        if !offers_plain {
            warn!("server does not offer SASL PLAIN");
            self.fail_connection_fatal(token, Error::AuthFailed);
            return;
        }

        let credentials = match self.settings.credentials() {
            Some(c) => c.clone(),
            None => {
                self.fail_connection_fatal(token, Error::Internal("authenticating without credentials"));
                return;
            }
        };

        let request = Request::sasl_plain(&credentials.username, &credentials.password);
        self.send_internal(token, OpKind::SaslAuth, request);
    }

    fn on_sasl_auth(&mut self, token: usize, response: Response) {
        match response.status() {
            Status::Success => {
                debug!("sasl auth complete");
                self.make_ready(token);
            }
            _ => {
                warn!("sasl auth rejected");
                self.fail_connection_fatal(token, Error::AuthFailed);
            }
        }
    }

    /// Pipeline an engine-internal request on a connection that is not
    /// necessarily `Ready` (SASL runs while `Authenticating`).
    pub(crate) fn send_internal(&mut self, token: usize, kind: OpKind, request: Request) {
        let now = self.clock.now();
        let deadline = now + self.settings.op_timeout();
        let mut op = Operation::new(kind, 0, request, deadline);
        op.server = match self.channels.get(token) {
            Some(Channel::Data(conn)) => conn.server,
            _ => return,
        };
        op.stamp(0, op.server, self.next_opaque());
        op.deadline_timer = Some(self.timers.schedule(
            deadline,
            TimerKind::OpDeadline {
                token,
                opaque: op.opaque,
            },
        ));

        let send_failed = match self.channels.get_mut(token) {
            Some(Channel::Data(conn)) => conn.send_unchecked(op).is_err(),
            _ => return,
        };

        if send_failed {
            self.fail_data_connection(token, Error::Protocol("compose failed"));
            return;
        }
        self.reassert_interest(token);
    }

    /// Deliver every queued completion to the registered callbacks. Runs with
    /// no connection borrows held; callbacks receive only the cookie and the
    /// result.
    pub(crate) fn deliver_queued(&mut self) {
        while !self.queued.is_empty() {
            let batch: Vec<Completion> = std::mem::take(&mut self.queued);
            for completion in batch {
                match completion {
                    Completion::Op {
                        kind,
                        cookie,
                        result,
                    } => {
                        if let Some(callback) = self.callbacks.ops.get_mut(&kind) {
                            callback(cookie, result);
                        } else {
                            debug!("no callback registered for {:?}", kind);
                        }
                    }
                    Completion::Durability {
                        cookie,
                        key,
                        result,
                    } => {
                        if let Some(callback) = self.callbacks.durability.as_mut() {
                            callback(cookie, key, result);
                        } else {
                            debug!("no durability callback registered");
                        }
                    }
                    Completion::Http { cookie, result } => {
                        if let Some(callback) = self.callbacks.http.as_mut() {
                            callback(cookie, result);
                        } else {
                            debug!("no http callback registered");
                        }
                    }
                }
            }
        }
    }

    /// Fail a connection on a fatal (non-retryable) error: every operation it
    /// owns completes with an error derived from the cause, and no reconnect
    /// is scheduled.
    pub(crate) fn fail_connection_fatal(&mut self, token: usize, error: Error) {
        let (conn_server, is_bootstrap, wire, parked) = {
            let conn = match self.channels.get_mut(token) {
                Some(Channel::Data(conn)) => conn,
                _ => return,
            };
            let (wire, parked) = conn.abort();
            (conn.server, conn.is_bootstrap(), wire, parked)
        };

        self.drop_channel(token);
        if !is_bootstrap {
            self.server_tokens.remove(&conn_server);
        }

        for mut op in wire.into_iter().chain(parked) {
            if op.completed || op.kind.is_internal() {
                self.discard_internal(&mut op);
                continue;
            }
            let failure = match &error {
                Error::AuthFailed => Error::AuthFailed,
                Error::Protocol(msg) => Error::Protocol(*msg),
                Error::Internal(msg) => Error::Internal(*msg),
                _ => Error::Internal("connection failed"),
            };
            self.complete_op(&mut op, Err(failure));
        }

        if is_bootstrap {
            self.on_bootstrap_attempt_fatal(error);
        } else if matches!(error, Error::AuthFailed) {
            // an auth failure will repeat on reconnect; surface it through
            // the bootstrap state so wait() reports it
            self.bootstrap.error.get_or_insert(Error::AuthFailed);
        }
    }

    /// Cancel timers and settle bookkeeping for an internal operation that
    /// will never complete normally.
    pub(crate) fn discard_internal(&mut self, op: &mut Operation) {
        if let Some(timer) = op.deadline_timer.take() {
            self.timers.cancel(timer);
        }
        if op.kind == OpKind::Observe && !op.completed {
            op.completed = true;
            self.on_observe_failed(op.cookie as usize);
        }
    }
}
