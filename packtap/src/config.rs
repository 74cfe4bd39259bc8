//! Engine configuration

use crate::error::InitializationError;
use packtap_host::HostConfig;
use std::time::Duration;

/// Default collector endpoint
pub const DEFAULT_ENDPOINT: &str = "https://data.tskl.es";

/// Default periodic flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

/// Minimum spacing between two network dispatches
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Default bound on the shutdown wait for in-flight requests
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default bound on the synchronous exit flush
pub const DEFAULT_EXIT_FLUSH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default cap on a streamed response body buffered for `post`
pub const DEFAULT_MAX_BUFFERED_BODY: usize = 4 * 1024 * 1024;

/// packtap configuration
///
/// `network` defaults to "a secret is present" and `logging` defaults to
/// "network is disabled"; set either explicitly to override.
#[derive(Debug, Clone)]
pub struct PacktapConfig {
    /// Collector API secret
    pub secret: Option<String>,

    /// Send telemetry to the collector
    pub network: Option<bool>,

    /// Write one NDJSON record per completed request
    pub logging: Option<bool>,

    /// Also log every capture event at debug level when flushed
    pub force_log: bool,

    /// Collector base URL
    pub endpoint: String,

    /// Periodic flush interval
    pub flush_interval: Duration,

    /// Minimum spacing between network dispatches
    pub throttle_interval: Duration,

    /// Bound on the shutdown wait for in-flight requests
    pub shutdown_timeout: Duration,

    /// Bound on the synchronous exit flush
    pub exit_flush_timeout: Duration,

    /// Wall-clock bound on a single pack invocation
    pub invocation_timeout: Option<Duration>,

    /// Largest streamed body kept for `post`; longer bodies reach `post`
    /// without a body
    pub max_buffered_body: usize,

    /// Shut down and flush on SIGINT/SIGTERM once loaded
    pub handle_signals: bool,

    /// Wasm sandbox limits
    pub host: HostConfig,
}

impl Default for PacktapConfig {
    fn default() -> Self {
        Self {
            secret: None,
            network: None,
            logging: None,
            force_log: false,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            exit_flush_timeout: DEFAULT_EXIT_FLUSH_TIMEOUT,
            invocation_timeout: None,
            max_buffered_body: DEFAULT_MAX_BUFFERED_BODY,
            handle_signals: true,
            host: HostConfig::default(),
        }
    }
}

impl PacktapConfig {
    /// Create a config for a collector secret
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Default::default()
        }
    }

    /// Create a config that only writes local logs
    pub fn local() -> Self {
        Self {
            network: Some(false),
            logging: Some(true),
            ..Default::default()
        }
    }

    pub fn network(mut self, enabled: bool) -> Self {
        self.network = Some(enabled);
        self
    }

    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = Some(enabled);
        self
    }

    pub fn force_log(mut self, enabled: bool) -> Self {
        self.force_log = enabled;
        self
    }

    /// Set the collector base URL (a trailing `/` is ignored)
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn exit_flush_timeout(mut self, timeout: Duration) -> Self {
        self.exit_flush_timeout = timeout;
        self
    }

    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    pub fn max_buffered_body(mut self, bytes: usize) -> Self {
        self.max_buffered_body = bytes;
        self
    }

    /// Whether `load` installs the signal handler
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn host(mut self, host: HostConfig) -> Self {
        self.host = host;
        self
    }

    /// Whether telemetry goes to the collector
    pub fn network_enabled(&self) -> bool {
        self.network
            .unwrap_or_else(|| self.secret.as_deref().is_some_and(|s| !s.is_empty()))
    }

    /// Whether per-request records go to the local log
    pub fn logging_enabled(&self) -> bool {
        self.logging.unwrap_or_else(|| !self.network_enabled())
    }

    /// Collector base URL without a trailing `/`
    pub fn endpoint_base(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    /// Check that at least one output is usable
    pub fn validate(&self) -> Result<(), InitializationError> {
        let network = self.network_enabled();
        if !network && !self.logging_enabled() {
            return Err(InitializationError::NoOutputs);
        }
        if network && self.secret.as_deref().map_or(true, str::is_empty) {
            return Err(InitializationError::MissingSecret);
        }
        Ok(())
    }
}
