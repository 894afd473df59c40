// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use protocol_binary::Status;
use thiserror::Error;

/// Classification bits carried by every error. Callers branch on these to
/// decide retry policy instead of matching individual codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorFlags(u32);

impl ErrorFlags {
    /// The caller handed the library something invalid.
    pub const INPUT: Self = Self(1 << 0);
    /// A socket-level failure.
    pub const NETWORK: Self = Self(1 << 1);
    /// Not worth retrying; the condition will not clear on its own.
    pub const FATAL: Self = Self(1 << 2);
    /// Retrying the same operation may succeed.
    pub const TRANSIENT: Self = Self(1 << 3);
    /// The outcome of a data operation, reported by the server.
    pub const DATAOP: Self = Self(1 << 4);
    /// A bug or invariant violation inside the library.
    pub const INTERNAL: Self = Self(1 << 5);
    /// Raised by the I/O driver rather than the engine.
    pub const PLUGIN: Self = Self(1 << 6);
    /// Generated by the server (as opposed to locally).
    pub const SRVGEN: Self = Self(1 << 7);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for ErrorFlags {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        self.union(other)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("no configuration installed yet")]
    NotBootstrapped,

    #[error("no server owns this vbucket in the current configuration")]
    NoServerForKey,

    #[error("replica index out of range")]
    NoReplica,

    #[error("network failure: {0}")]
    Network(std::io::Error),

    #[error("connect failed: {0}")]
    ConnectFailed(std::io::Error),

    #[error("operation timed out")]
    TimedOut,

    #[error("bootstrap failed: no usable configuration source")]
    BootstrapFailed,

    #[error("authentication failed")]
    AuthFailed,

    #[error("bucket does not exist")]
    BucketNotFound,

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("topology changed too many times while retrying")]
    RetriesExhausted,

    #[error("key not found")]
    KeyNotFound,

    #[error("key exists (CAS mismatch)")]
    KeyExists,

    #[error("value was not stored")]
    NotStored,

    #[error("non-numeric value in arithmetic operation")]
    BadDelta,

    #[error("value too large")]
    ValueTooLarge,

    #[error("temporary server failure")]
    TemporaryFailure,

    #[error("server is busy")]
    Busy,

    #[error("server error (status {0:#06x})")]
    Server(u16),

    #[error("durability requirement exceeds replica count")]
    TooManyReplicas,

    #[error("durability requirement not met before the timeout")]
    DurabilityTimedOut,

    #[error("observed CAS differs from the required CAS")]
    CasChanged,

    #[error("client is shutting down")]
    Shutdown,

    #[error("request was cancelled")]
    Cancelled,

    #[error("malformed http response")]
    BadHttpResponse,

    #[error("redirect limit exceeded")]
    TooManyRedirects,

    #[error("i/o driver failure: {0}")]
    Driver(std::io::Error),

    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    pub fn flags(&self) -> ErrorFlags {
        use ErrorFlags as F;

        match self {
            Self::EmptyKey | Self::NoReplica | Self::TooManyReplicas | Self::TooManyRedirects => {
                F::INPUT
            }
            Self::NotBootstrapped | Self::NoServerForKey => F::TRANSIENT,
            Self::Network(_) | Self::ConnectFailed(_) => F::NETWORK | F::TRANSIENT,
            Self::TimedOut => F::NETWORK | F::TRANSIENT,
            Self::BootstrapFailed => F::NETWORK | F::FATAL,
            Self::AuthFailed | Self::BucketNotFound => F::FATAL | F::SRVGEN,
            Self::Protocol(_) => F::FATAL,
            Self::RetriesExhausted => F::TRANSIENT,
            Self::KeyNotFound | Self::KeyExists | Self::NotStored | Self::BadDelta
            | Self::ValueTooLarge => F::DATAOP | F::SRVGEN,
            Self::TemporaryFailure | Self::Busy => F::DATAOP | F::TRANSIENT | F::SRVGEN,
            Self::Server(_) => F::SRVGEN,
            Self::DurabilityTimedOut | Self::CasChanged => F::DATAOP,
            Self::Shutdown | Self::Cancelled => F::TRANSIENT,
            Self::BadHttpResponse => F::NETWORK,
            Self::Driver(_) => F::PLUGIN,
            Self::Internal(_) => F::INTERNAL,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.flags().contains(ErrorFlags::TRANSIENT)
    }

    pub fn is_network(&self) -> bool {
        self.flags().contains(ErrorFlags::NETWORK)
    }

    pub fn is_fatal(&self) -> bool {
        self.flags().contains(ErrorFlags::FATAL)
    }

    pub fn is_input(&self) -> bool {
        self.flags().contains(ErrorFlags::INPUT)
    }

    /// Map a non-success response status onto the error it is reported as.
    pub(crate) fn from_status(status: Status) -> Self {
        match status {
            Status::KeyNotFound => Self::KeyNotFound,
            Status::KeyExists => Self::KeyExists,
            Status::NotStored => Self::NotStored,
            Status::BadDelta => Self::BadDelta,
            Status::ValueTooLarge => Self::ValueTooLarge,
            Status::TemporaryFailure => Self::TemporaryFailure,
            Status::Busy => Self::Busy,
            Status::AuthError => Self::AuthFailed,
            other => Self::Server(u16::from(other)),
        }
    }
}
