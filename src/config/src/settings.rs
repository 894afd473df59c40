// Copyright 2020 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;

// All intervals are expressed in microseconds in the settings file and at the
// programmatic surface; getters convert to `Duration`.

// constants to define default values
const OP_TIMEOUT: u64 = 2_500_000;
const CONFIG_TOTAL_TIMEOUT: u64 = 5_000_000;
const CONFIG_NODE_TIMEOUT: u64 = 2_000_000;
const VIEW_TIMEOUT: u64 = 75_000_000;
const DURABILITY_TIMEOUT: u64 = 5_000_000;
const DURABILITY_INTERVAL: u64 = 100_000;
const HTCONFIG_IDLE_TIMEOUT: u64 = 4_000_000;
const CONF_ERR_THRESHOLD: u32 = 100;
const CONF_DELAY_THRESHOLD: u64 = 10_000_000;
const MAX_REDIRECTS: u32 = 5;
const RETRY_BACKOFF_BASE: u64 = 100_000;
const RETRY_BACKOFF_MAX: u64 = 10_000_000;
const RETRY_LIMIT: u32 = 5;
const TIMER_GRANULARITY: u64 = 100_000;

// helper functions
fn op_timeout() -> u64 {
    OP_TIMEOUT
}

fn config_total_timeout() -> u64 {
    CONFIG_TOTAL_TIMEOUT
}

fn config_node_timeout() -> u64 {
    CONFIG_NODE_TIMEOUT
}

fn view_timeout() -> u64 {
    VIEW_TIMEOUT
}

fn durability_timeout() -> u64 {
    DURABILITY_TIMEOUT
}

fn durability_interval() -> u64 {
    DURABILITY_INTERVAL
}

fn htconfig_idle_timeout() -> u64 {
    HTCONFIG_IDLE_TIMEOUT
}

fn conf_err_threshold() -> u32 {
    CONF_ERR_THRESHOLD
}

fn conf_delay_threshold() -> u64 {
    CONF_DELAY_THRESHOLD
}

fn max_redirects() -> u32 {
    MAX_REDIRECTS
}

fn retry_backoff_base() -> u64 {
    RETRY_BACKOFF_BASE
}

fn retry_backoff_max() -> u64 {
    RETRY_BACKOFF_MAX
}

fn retry_limit() -> u32 {
    RETRY_LIMIT
}

fn timer_granularity() -> u64 {
    TIMER_GRANULARITY
}

fn bucket() -> String {
    "default".to_string()
}

fn hosts() -> Vec<String> {
    vec!["127.0.0.1:11210".to_string()]
}

fn transports() -> Vec<BootstrapTransport> {
    vec![BootstrapTransport::Cccp, BootstrapTransport::HttpStreaming]
}

/// The transports the bootstrap provider may use to fetch a cluster
/// configuration, tried in the order given.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapTransport {
    /// Configuration fetched inline over the data-port binary protocol.
    Cccp,
    /// Streaming configuration feed from the management port.
    #[serde(rename = "http")]
    HttpStreaming,
}

/// Bucket credentials for the SASL exchange.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// struct definitions
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "bucket")]
    bucket: String,
    #[serde(default = "hosts")]
    hosts: Vec<String>,
    /// Management-port authorities for the streaming transport. Derived from
    /// `hosts` with the default management port when empty.
    #[serde(default)]
    mgmt_hosts: Vec<String>,
    #[serde(default)]
    credentials: Option<Credentials>,
    #[serde(default = "transports")]
    transports: Vec<BootstrapTransport>,

    #[serde(default = "op_timeout")]
    op_timeout: u64,
    #[serde(default = "config_total_timeout")]
    config_total_timeout: u64,
    #[serde(default = "config_node_timeout")]
    config_node_timeout: u64,
    #[serde(default = "view_timeout")]
    view_timeout: u64,
    #[serde(default = "durability_timeout")]
    durability_timeout: u64,
    #[serde(default = "durability_interval")]
    durability_interval: u64,
    #[serde(default = "htconfig_idle_timeout")]
    htconfig_idle_timeout: u64,
    #[serde(default = "conf_err_threshold")]
    conf_err_threshold: u32,
    #[serde(default = "conf_delay_threshold")]
    conf_delay_threshold: u64,
    #[serde(default = "max_redirects")]
    max_redirects: u32,
    #[serde(default = "retry_backoff_base")]
    retry_backoff_base: u64,
    #[serde(default = "retry_backoff_max")]
    retry_backoff_max: u64,
    #[serde(default = "retry_limit")]
    retry_limit: u32,
    #[serde(default = "timer_granularity")]
    timer_granularity: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bucket: bucket(),
            hosts: hosts(),
            mgmt_hosts: Vec::new(),
            credentials: None,
            transports: transports(),
            op_timeout: op_timeout(),
            config_total_timeout: config_total_timeout(),
            config_node_timeout: config_node_timeout(),
            view_timeout: view_timeout(),
            durability_timeout: durability_timeout(),
            durability_interval: durability_interval(),
            htconfig_idle_timeout: htconfig_idle_timeout(),
            conf_err_threshold: conf_err_threshold(),
            conf_delay_threshold: conf_delay_threshold(),
            max_redirects: max_redirects(),
            retry_backoff_base: retry_backoff_base(),
            retry_backoff_max: retry_backoff_max(),
            retry_limit: retry_limit(),
            timer_granularity: timer_granularity(),
        }
    }
}

// implementation
impl Settings {
    pub fn load(file: &str) -> Result<Settings, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        match toml::from_str(&content) {
            Ok(t) => Ok(t),
            Err(e) => {
                error!("{}", e);
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "error parsing settings file",
                ))
            }
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn set_bucket<T: Into<String>>(mut self, bucket: T) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn set_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn mgmt_hosts(&self) -> &[String] {
        &self.mgmt_hosts
    }

    pub fn set_mgmt_hosts(mut self, hosts: Vec<String>) -> Self {
        self.mgmt_hosts = hosts;
        self
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn transports(&self) -> &[BootstrapTransport] {
        &self.transports
    }

    pub fn set_transports(mut self, transports: Vec<BootstrapTransport>) -> Self {
        self.transports = transports;
        self
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_micros(self.op_timeout)
    }

    pub fn set_op_timeout(mut self, micros: u64) -> Self {
        self.op_timeout = micros;
        self
    }

    pub fn config_total_timeout(&self) -> Duration {
        Duration::from_micros(self.config_total_timeout)
    }

    pub fn set_config_total_timeout(mut self, micros: u64) -> Self {
        self.config_total_timeout = micros;
        self
    }

    pub fn config_node_timeout(&self) -> Duration {
        Duration::from_micros(self.config_node_timeout)
    }

    pub fn set_config_node_timeout(mut self, micros: u64) -> Self {
        self.config_node_timeout = micros;
        self
    }

    pub fn view_timeout(&self) -> Duration {
        Duration::from_micros(self.view_timeout)
    }

    pub fn set_view_timeout(mut self, micros: u64) -> Self {
        self.view_timeout = micros;
        self
    }

    pub fn durability_timeout(&self) -> Duration {
        Duration::from_micros(self.durability_timeout)
    }

    pub fn set_durability_timeout(mut self, micros: u64) -> Self {
        self.durability_timeout = micros;
        self
    }

    pub fn durability_interval(&self) -> Duration {
        Duration::from_micros(self.durability_interval)
    }

    pub fn set_durability_interval(mut self, micros: u64) -> Self {
        self.durability_interval = micros;
        self
    }

    pub fn htconfig_idle_timeout(&self) -> Duration {
        Duration::from_micros(self.htconfig_idle_timeout)
    }

    pub fn set_htconfig_idle_timeout(mut self, micros: u64) -> Self {
        self.htconfig_idle_timeout = micros;
        self
    }

    pub fn conf_err_threshold(&self) -> u32 {
        self.conf_err_threshold
    }

    pub fn set_conf_err_threshold(mut self, count: u32) -> Self {
        self.conf_err_threshold = count;
        self
    }

    pub fn conf_delay_threshold(&self) -> Duration {
        Duration::from_micros(self.conf_delay_threshold)
    }

    pub fn set_conf_delay_threshold(mut self, micros: u64) -> Self {
        self.conf_delay_threshold = micros;
        self
    }

    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    pub fn set_max_redirects(mut self, count: u32) -> Self {
        self.max_redirects = count;
        self
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_micros(self.retry_backoff_base)
    }

    pub fn set_retry_backoff_base(mut self, micros: u64) -> Self {
        self.retry_backoff_base = micros;
        self
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_micros(self.retry_backoff_max)
    }

    pub fn set_retry_backoff_max(mut self, micros: u64) -> Self {
        self.retry_backoff_max = micros;
        self
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn set_retry_limit(mut self, count: u32) -> Self {
        self.retry_limit = count;
        self
    }

    pub fn timer_granularity(&self) -> Duration {
        Duration::from_micros(self.timer_granularity)
    }

    pub fn set_timer_granularity(mut self, micros: u64) -> Self {
        self.timer_granularity = micros;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.op_timeout(), Duration::from_micros(2_500_000));
        assert_eq!(settings.bucket(), "default");
        assert_eq!(
            settings.transports(),
            &[BootstrapTransport::Cccp, BootstrapTransport::HttpStreaming]
        );
    }

    #[test]
    fn parse_partial_file() {
        let settings: Settings = toml::from_str(
            r#"
            bucket = "travel-sample"
            hosts = ["10.0.0.1:11210", "10.0.0.2:11210"]
            op_timeout = 100000
            transports = ["http"]
            "#,
        )
        .expect("failed to parse");

        assert_eq!(settings.bucket(), "travel-sample");
        assert_eq!(settings.hosts().len(), 2);
        assert_eq!(settings.op_timeout(), Duration::from_micros(100_000));
        assert_eq!(settings.transports(), &[BootstrapTransport::HttpStreaming]);
        // unset fields take defaults
        assert_eq!(settings.max_redirects(), 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Settings, _> = toml::from_str("no_such_setting = 1\n");
        assert!(result.is_err());
    }
}
