// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// Opaque caller context echoed back in the matching callback.
pub type Cookie = u64;

/// Storage flavours sharing the store frame layout or its concat variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithKind {
    Increment,
    Decrement,
}

/// A user command. One current variant per command kind; the engine copies
/// what it needs at submit time, so the caller keeps ownership of nothing
/// past the submit call.
#[derive(Debug, Clone)]
pub enum Command {
    Get {
        key: Vec<u8>,
    },
    GetReplica {
        key: Vec<u8>,
        /// Which replica to read from, 0-based.
        replica: usize,
    },
    Store {
        kind: StoreKind,
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        expiry: u32,
        cas: u64,
    },
    Delete {
        key: Vec<u8>,
        cas: u64,
    },
    Arithmetic {
        kind: ArithKind,
        key: Vec<u8>,
        delta: u64,
        initial: u64,
        expiry: u32,
    },
    Touch {
        key: Vec<u8>,
        expiry: u32,
    },
    Noop,
}

impl Command {
    pub fn get(key: &[u8]) -> Self {
        Self::Get { key: key.to_vec() }
    }

    pub fn set(key: &[u8], value: &[u8]) -> Self {
        Self::Store {
            kind: StoreKind::Set,
            key: key.to_vec(),
            value: value.to_vec(),
            flags: 0,
            expiry: 0,
            cas: 0,
        }
    }

    pub fn delete(key: &[u8]) -> Self {
        Self::Delete {
            key: key.to_vec(),
            cas: 0,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Self::Get { .. } => OpKind::Get,
            Self::GetReplica { .. } => OpKind::GetReplica,
            Self::Store { .. } => OpKind::Store,
            Self::Delete { .. } => OpKind::Delete,
            Self::Arithmetic { .. } => OpKind::Arithmetic,
            Self::Touch { .. } => OpKind::Touch,
            Self::Noop => OpKind::Noop,
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Self::Get { key }
            | Self::GetReplica { key, .. }
            | Self::Store { key, .. }
            | Self::Delete { key, .. }
            | Self::Arithmetic { key, .. }
            | Self::Touch { key, .. } => Some(key),
            Self::Noop => None,
        }
    }

    /// Build the wire request. Routing (vbucket) and correlation (opaque) are
    /// stamped later by the dispatcher.
    pub(crate) fn to_request(&self) -> Request {
        match self {
            Self::Get { key } => Request::get(key),
            Self::GetReplica { key, .. } => Request::get_replica(key),
            Self::Store {
                kind,
                key,
                value,
                flags,
                expiry,
                cas,
            } => match kind {
                StoreKind::Set => Request::store(Opcode::Set, key, value, *flags, *expiry, *cas),
                StoreKind::Add => Request::store(Opcode::Add, key, value, *flags, *expiry, *cas),
                StoreKind::Replace => {
                    Request::store(Opcode::Replace, key, value, *flags, *expiry, *cas)
                }
                StoreKind::Append => Request::concat(Opcode::Append, key, value, *cas),
                StoreKind::Prepend => Request::concat(Opcode::Prepend, key, value, *cas),
            },
            Self::Delete { key, cas } => Request::delete(key, *cas),
            Self::Arithmetic {
                kind,
                key,
                delta,
                initial,
                expiry,
            } => {
                let opcode = match kind {
                    ArithKind::Increment => Opcode::Increment,
                    ArithKind::Decrement => Opcode::Decrement,
                };
                Request::arithmetic(opcode, key, *delta, *initial, *expiry)
            }
            Self::Touch { key, expiry } => Request::touch(key, *expiry),
            Self::Noop => Request::noop(),
        }
    }
}

/// The callback-table key: one slot per command kind, plus the internal
/// kinds the engine correlates itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    GetReplica,
    Store,
    Delete,
    Arithmetic,
    Touch,
    Noop,
    // engine-internal correlation targets; never dispatched to user slots
    #[doc(hidden)]
    SaslAuth,
    #[doc(hidden)]
    SaslListMechs,
    #[doc(hidden)]
    ClusterConfig,
    #[doc(hidden)]
    Observe,
}

impl OpKind {
    pub(crate) fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::SaslAuth | Self::SaslListMechs | Self::ClusterConfig | Self::Observe
        )
    }
}

/// The payload handed to a user callback on success.
#[derive(Debug, Clone, Default)]
pub struct OpResponse {
    pub cas: u64,
    pub flags: u32,
    pub value: Vec<u8>,
    /// Counter value for arithmetic responses.
    pub counter: Option<u64>,
}

impl OpResponse {
    pub(crate) fn from_wire(response: &Response) -> Self {
        Self {
            cas: response.cas(),
            flags: response.flags().unwrap_or(0),
            counter: response.counter_value(),
            value: response.value().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_to_request() {
        let command = Command::set(b"k", b"World!");
        assert_eq!(command.kind(), OpKind::Store);
        assert_eq!(command.key(), Some(&b"k"[..]));

        let request = command.to_request();
        assert_eq!(request.opcode(), Opcode::Set);
        assert_eq!(request.key(), b"k");
    }

    #[test]
    fn internal_kinds() {
        assert!(OpKind::ClusterConfig.is_internal());
        assert!(!OpKind::Get.is_internal());
    }
}
