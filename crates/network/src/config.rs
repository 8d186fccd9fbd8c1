#[cfg(test)]
#[path = "tests/config.rs"]
mod tests;

use std::time::Duration;

use mixcomms_primitives::token::DEFAULT_TOKEN_TTL;
use serde::{Deserialize, Serialize};

/// Outer attempts made by a single send before giving up.
pub const MAX_RETRIES: u32 = 3;

pub const DEFAULT_DIAL_RETRIES: u32 = 10;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MESSAGING_TIMEOUT: Duration = Duration::from_secs(2 * 60);

const DIAL_TIMEOUT_STEP_MS: u64 = 2_000;
const DIAL_TIMEOUT_CAP_MS: u64 = 15_000;
const DIAL_ATTEMPTS_PER_STEP: u32 = 16;

/// Timeout for the given zero-based dial attempt: 2s, growing by 2s every
/// 16 attempts, capped at 15s.
#[must_use]
pub fn dial_timeout(attempt: u32) -> Duration {
    let steps = u64::from(attempt / DIAL_ATTEMPTS_PER_STEP).saturating_add(1);

    Duration::from_millis(
        DIAL_TIMEOUT_STEP_MS
            .saturating_mul(steps)
            .min(DIAL_TIMEOUT_CAP_MS),
    )
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// HTTP/2 framing.
    #[default]
    Native,
    /// HTTP/1.1 framing reachable from browsers.
    Web,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyErrorMetricParams {
    /// Failure ratio above which proxy failures are reported as
    /// [`Error::TooManyProxyErrors`](crate::Error::TooManyProxyErrors).
    pub cutoff: f64,
    /// Number of most recent outcomes considered; `0` disables tracking.
    pub window: usize,
}

impl Default for ProxyErrorMetricParams {
    fn default() -> Self {
        Self {
            cutoff: 0.7,
            window: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostParams {
    /// Dial cycles attempted before a connect fails.
    pub max_retries: u32,
    pub auth_enabled: bool,
    pub connection_type: ConnectionType,
    pub send_timeout: Duration,
    pub messaging_timeout: Duration,
    /// TLS server name to present, defaults to the certificate's first DNS name.
    pub server_name: Option<String>,
    pub enable_metrics: bool,
    /// Errors containing any of these substrings are not counted.
    pub excluded_metric_errors: Vec<String>,
    pub proxy_error_metric: ProxyErrorMetricParams,
}

impl Default for HostParams {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_DIAL_RETRIES,
            auth_enabled: false,
            connection_type: ConnectionType::Native,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            messaging_timeout: DEFAULT_MESSAGING_TIMEOUT,
            server_name: None,
            enable_metrics: true,
            excluded_metric_errors: Vec::new(),
            proxy_error_metric: ProxyErrorMetricParams::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    pub token_ttl: Duration,
    /// Parameters for hosts registered without explicit ones.
    pub host_params: HostParams,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            token_ttl: DEFAULT_TOKEN_TTL,
            host_params: HostParams::default(),
        }
    }
}
