// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Durability polling. Each round sends OBSERVE to the master and every
//! populated replica of each key, tallies the per-node persistence and
//! replication states, and re-polls on an interval until every key meets its
//! requirement or the overall deadline fires.

use crate::handle::Client;
use crate::operation::Operation;
use crate::registry::Completion;
use crate::scheduler::{TimerId, TimerKind};
use crate::*;
use protocol_binary::{ObserveEntry, ObserveStatus};
use std::collections::HashMap;

/// One key's durability requirement: how many nodes must have persisted the
/// mutation and how many replicas must hold it.
#[derive(Debug, Clone)]
pub struct DurabilityRequirement {
    pub key: Vec<u8>,
    /// The CAS returned by the mutation being observed. Zero skips the
    /// mismatch check.
    pub cas: u64,
    pub persist_to: usize,
    pub replicate_to: usize,
}

struct KeyState {
    key: Vec<u8>,
    cas: u64,
    persist_to: usize,
    replicate_to: usize,
    done: bool,
    round_persisted: usize,
    round_replicated: usize,
    round_failure: Option<Error>,
}

pub(crate) struct DurabilityPoll {
    cookie: Cookie,
    keys: Vec<KeyState>,
    cap_max: bool,
    deadline_timer: TimerId,
    poll_timer: Option<TimerId>,
    /// OBSERVE operations still outstanding in the current round.
    outstanding: usize,
}

impl Client {
    /// Begin polling the given durability requirements. Exactly one
    /// durability callback fires per key; a synchronous error means none
    /// will.
    pub fn endure(
        &mut self,
        requirements: Vec<DurabilityRequirement>,
        cap_max: bool,
        cookie: Cookie,
    ) -> Result<()> {
        if self.shutting_down {
            return Err(Error::Shutdown);
        }
        if requirements.is_empty() {
            return Err(Error::EmptyKey);
        }

        let map = self.map.clone().ok_or(Error::NotBootstrapped)?;
        let replicas = map.num_replicas();

        for requirement in &requirements {
            if requirement.key.is_empty() {
                return Err(Error::EmptyKey);
            }
            let possible =
                requirement.replicate_to <= replicas && requirement.persist_to <= replicas + 1;
            if !possible && !cap_max {
                return Err(Error::TooManyReplicas);
            }
        }

        let keys = requirements
            .into_iter()
            .map(|requirement| KeyState {
                key: requirement.key,
                cas: requirement.cas,
                persist_to: requirement.persist_to,
                replicate_to: requirement.replicate_to,
                done: false,
                round_persisted: 0,
                round_replicated: 0,
                round_failure: None,
            })
            .collect();

        let now = self.clock.now();
        let entry = self.durability.vacant_entry();
        let id = entry.key();
        let deadline_timer = self.timers.schedule_after(
            now,
            self.settings.durability_timeout(),
            TimerKind::DurabilityDeadline { id },
        );
        entry.insert(DurabilityPoll {
            cookie,
            keys,
            cap_max,
            deadline_timer,
            poll_timer: None,
            outstanding: 0,
        });

        self.issue_observe_round(id);
        Ok(())
    }

    /// Send one OBSERVE per involved server, covering the master and every
    /// populated replica of every unfinished key.
    pub(crate) fn issue_observe_round(&mut self, id: usize) {
        let map = match self.map.clone() {
            Some(map) => map,
            None => return,
        };

        // batch (vbucket, key) pairs per destination server
        let mut batches: HashMap<usize, Vec<(u16, Vec<u8>)>> = HashMap::new();
        {
            let poll = match self.durability.get_mut(id) {
                Some(poll) => poll,
                None => return,
            };

            for key in poll.keys.iter_mut().filter(|key| !key.done) {
                key.round_persisted = 0;
                key.round_replicated = 0;
                key.round_failure = None;

                let (vbucket, master) = map.route_master(&key.key);
                if let Some(server) = master {
                    batches
                        .entry(server)
                        .or_default()
                        .push((vbucket, key.key.clone()));
                }
                for which in 0..map.num_replicas() {
                    if let Some(server) = map.route_replica(vbucket, which) {
                        batches
                            .entry(server)
                            .or_default()
                            .push((vbucket, key.key.clone()));
                    }
                }
            }

            poll.outstanding = batches.len();
        }

        if batches.is_empty() {
            // nothing routable this round; try again on the interval
            self.schedule_durability_poll(id);
            return;
        }

        let now = self.clock.now();
        let deadline = now + self.settings.op_timeout();
        for (server, entries) in batches {
            let request =
                Request::observe(entries.iter().map(|(vbucket, key)| (*vbucket, key.as_slice())));
            let op = Operation::new(OpKind::Observe, id as Cookie, request, deadline);
            self.dispatch_to_server(op, &map, 0, server);
        }
    }

    /// An OBSERVE response from `server` for poll `id`.
    pub(crate) fn on_observe_response(&mut self, id: usize, server: usize, response: &Response) {
        let map = match self.map.clone() {
            Some(map) => map,
            None => return,
        };

        let entries = match ObserveEntry::parse_all(response.value()) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("malformed observe payload: {}", e);
                Vec::new()
            }
        };

        let evaluate = {
            let poll = match self.durability.get_mut(id) {
                Some(poll) => poll,
                None => return,
            };

            for entry in entries {
                let key = match poll
                    .keys
                    .iter_mut()
                    .find(|key| !key.done && key.key == entry.key)
                {
                    Some(key) => key,
                    None => continue,
                };

                let is_master = map.route_master(&key.key).1 == Some(server);

                if is_master {
                    // only the master's CAS is authoritative for mismatch
                    if key.cas != 0
                        && entry.cas != key.cas
                        && entry.status != ObserveStatus::NotFound
                    {
                        key.round_failure = Some(Error::CasChanged);
                        continue;
                    }
                    if entry.status == ObserveStatus::Persisted {
                        key.round_persisted += 1;
                    }
                } else {
                    match entry.status {
                        ObserveStatus::Persisted => {
                            key.round_persisted += 1;
                            key.round_replicated += 1;
                        }
                        ObserveStatus::Found => {
                            key.round_replicated += 1;
                        }
                        _ => {}
                    }
                }
            }

            poll.outstanding = poll.outstanding.saturating_sub(1);
            poll.outstanding == 0
        };

        if evaluate {
            self.evaluate_durability(id);
        }
    }

    /// An OBSERVE operation died without a response (connection failure or
    /// deadline); its tallies simply do not arrive this round.
    pub(crate) fn on_observe_failed(&mut self, id: usize) {
        let evaluate = {
            let poll = match self.durability.get_mut(id) {
                Some(poll) => poll,
                None => return,
            };
            poll.outstanding = poll.outstanding.saturating_sub(1);
            poll.outstanding == 0
        };

        if evaluate {
            self.evaluate_durability(id);
        }
    }

    /// All of a round's responses are in: settle satisfied and failed keys,
    /// re-poll for the rest.
    fn evaluate_durability(&mut self, id: usize) {
        let available_replicas = self
            .map
            .as_ref()
            .map(|map| map.num_replicas())
            .unwrap_or(0);

        let (cookie, mut completions, all_done) = {
            let poll = match self.durability.get_mut(id) {
                Some(poll) => poll,
                None => return,
            };

            let cap_max = poll.cap_max;
            let mut completions = Vec::new();

            for key in poll.keys.iter_mut().filter(|key| !key.done) {
                if let Some(error) = key.round_failure.take() {
                    key.done = true;
                    completions.push((key.key.clone(), Err(error)));
                    continue;
                }

                let (persist_needed, replicate_needed) = if cap_max {
                    (
                        std::cmp::min(key.persist_to, available_replicas + 1),
                        std::cmp::min(key.replicate_to, available_replicas),
                    )
                } else {
                    (key.persist_to, key.replicate_to)
                };

                if key.round_persisted >= persist_needed
                    && key.round_replicated >= replicate_needed
                {
                    key.done = true;
                    completions.push((key.key.clone(), Ok(key.cas)));
                }
            }

            let all_done = poll.keys.iter().all(|key| key.done);
            (poll.cookie, completions, all_done)
        };

        for (key, result) in completions.drain(..) {
            self.queued.push(Completion::Durability {
                cookie,
                key,
                result,
            });
        }

        if all_done {
            self.remove_durability_poll(id);
        } else {
            self.schedule_durability_poll(id);
        }
    }

    fn schedule_durability_poll(&mut self, id: usize) {
        let now = self.clock.now();
        let timer =
            self.timers
                .schedule_after(now, self.settings.durability_interval(), TimerKind::DurabilityPoll {
                    id,
                });
        if let Some(poll) = self.durability.get_mut(id) {
            if let Some(previous) = poll.poll_timer.replace(timer) {
                self.timers.cancel(previous);
            }
        }
    }

    /// The re-poll interval fired.
    pub(crate) fn on_durability_poll(&mut self, id: usize) {
        if let Some(poll) = self.durability.get_mut(id) {
            poll.poll_timer = None;
        }
        self.issue_observe_round(id);
    }

    /// The overall durability deadline fired: every unfinished key fails.
    pub(crate) fn on_durability_deadline(&mut self, id: usize) {
        let (cookie, unfinished) = {
            let poll = match self.durability.get_mut(id) {
                Some(poll) => poll,
                None => return,
            };
            let unfinished: Vec<Vec<u8>> = poll
                .keys
                .iter_mut()
                .filter(|key| !key.done)
                .map(|key| {
                    key.done = true;
                    key.key.clone()
                })
                .collect();
            (poll.cookie, unfinished)
        };

        for key in unfinished {
            self.queued.push(Completion::Durability {
                cookie,
                key,
                result: Err(Error::DurabilityTimedOut),
            });
        }

        if let Some(poll) = self.durability.try_remove(id) {
            if let Some(timer) = poll.poll_timer {
                self.timers.cancel(timer);
            }
            // the deadline timer itself just fired
        }
    }

    fn remove_durability_poll(&mut self, id: usize) {
        if let Some(poll) = self.durability.try_remove(id) {
            self.timers.cancel(poll.deadline_timer);
            if let Some(timer) = poll.poll_timer {
                self.timers.cancel(timer);
            }
        }
    }

    /// Fail every unfinished key of every poll (client shutdown).
    pub(crate) fn fail_all_durability(&mut self) {
        let ids: Vec<usize> = self.durability.iter().map(|(id, _)| id).collect();
        for id in ids {
            let (cookie, unfinished) = match self.durability.get_mut(id) {
                Some(poll) => {
                    let unfinished: Vec<Vec<u8>> = poll
                        .keys
                        .iter_mut()
                        .filter(|key| !key.done)
                        .map(|key| {
                            key.done = true;
                            key.key.clone()
                        })
                        .collect();
                    (poll.cookie, unfinished)
                }
                None => continue,
            };

            for key in unfinished {
                self.queued.push(Completion::Durability {
                    cookie,
                    key,
                    result: Err(Error::Shutdown),
                });
            }
            self.remove_durability_poll(id);
        }
    }
}
