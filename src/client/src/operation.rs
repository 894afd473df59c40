// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;
use protocol_common::{BufMut, Compose};
use std::time::Instant;

/// One in-flight request. Born at submit, parked or pipelined on a server
/// connection, destroyed when its callback fires or its connection dies.
///
/// An operation whose deadline fires while a response is still owed keeps its
/// queue slot as a tombstone (`completed` set): the wire order of the pending
/// queue must match the byte stream, so the slot is only released when the
/// response arrives and is discarded.
pub(crate) struct Operation {
    pub kind: OpKind,
    pub cookie: Cookie,
    pub opaque: u32,
    pub vbucket: u16,
    pub server: usize,
    pub deadline: Instant,
    pub deadline_timer: Option<u64>,
    pub retries: u32,
    /// Set when this operation reads from a replica instead of the master.
    pub replica: Option<usize>,
    pub request: Request,
    pub completed: bool,
}

impl Operation {
    pub fn new(
        kind: OpKind,
        cookie: Cookie,
        request: Request,
        deadline: Instant,
    ) -> Self {
        Self {
            kind,
            cookie,
            opaque: 0,
            vbucket: 0,
            server: 0,
            deadline,
            deadline_timer: None,
            retries: 0,
            replica: None,
            request,
            completed: false,
        }
    }

    /// Stamp routing and correlation onto the retained request so the frame
    /// can be (re)composed for the wire.
    pub fn stamp(&mut self, vbucket: u16, server: usize, opaque: u32) {
        self.vbucket = vbucket;
        self.server = server;
        self.opaque = opaque;
        self.request.set_vbucket(vbucket);
        self.request.set_opaque(opaque);
    }
}

impl Compose for Operation {
    fn compose(&self, dst: &mut dyn BufMut) -> usize {
        self.request.compose(dst)
    }
}
