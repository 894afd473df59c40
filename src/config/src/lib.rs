// Copyright 2020 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

#[macro_use]
extern crate log;

mod settings;

pub use settings::{BootstrapTransport, Credentials, Settings};

/// Process-wide knobs read exactly once, when a client handle is created.
/// Nothing in the request hot path consults the environment.
pub struct ProcessInit {
    log_level: log::LevelFilter,
}

impl ProcessInit {
    /// Read `CBCLIENT_LOGLEVEL` (1..5 mapping error..trace). Unset or
    /// unparseable values leave filtering to the installed logger.
    pub fn from_env() -> Self {
        let log_level = match std::env::var("CBCLIENT_LOGLEVEL")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
        {
            Some(1) => log::LevelFilter::Error,
            Some(2) => log::LevelFilter::Warn,
            Some(3) => log::LevelFilter::Info,
            Some(4) => log::LevelFilter::Debug,
            Some(n) if n >= 5 => log::LevelFilter::Trace,
            _ => log::LevelFilter::max(),
        };

        Self { log_level }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level
    }
}
