// =============================================================================
// Feed Configuration — JSON settings with serde defaults and env overrides
// =============================================================================
//
// Every field carries `#[serde(default)]` so that a partial (or empty) config
// file still loads. The bridge keeps no state across restarts; this file only
// holds tunables.
//
// Environment overrides (applied after the file is read):
//   FEED_BIND_ADDR  — listen address of the HTTP/WebSocket server
//   FEED_PROXY_URL  — HTTP proxy attached to every exchange client
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_exchanges() -> Vec<String> {
    vec![
        "binance".to_string(),
        "binanceusdm".to_string(),
        "binancecoinm".to_string(),
    ]
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_page_cap() -> u32 {
    200
}

fn default_depth_update_speed_ms() -> u32 {
    100
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Listen address of the API server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Exchange ids offered to the chart.
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,

    /// Optional HTTP proxy for REST traffic to the exchanges.
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Per-request timeout of exchange REST calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum candles requested per historical page.
    #[serde(default = "default_page_cap")]
    pub page_cap: u32,

    /// Per-exchange override (milliseconds) of the delay between historical
    /// pages. Exchanges not listed use their advertised rate limit.
    #[serde(default)]
    pub rate_limit_ms: HashMap<String, u64>,

    /// Update speed requested for diff-depth streams.
    #[serde(default = "default_depth_update_speed_ms")]
    pub depth_update_speed_ms: u32,

    /// Delay before a dropped stream connection is re-established.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// WebSocket base URL used for every stream instead of the Binance hosts.
    #[serde(default)]
    pub stream_base_url: Option<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            exchanges: default_exchanges(),
            proxy_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            page_cap: default_page_cap(),
            rate_limit_ms: HashMap::new(),
            depth_update_speed_ms: default_depth_update_speed_ms(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            stream_base_url: None,
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults with
    /// a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            exchanges = ?config.exchanges,
            page_cap = config.page_cap,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Apply `FEED_*` environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FEED_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        if let Ok(proxy) = std::env::var("FEED_PROXY_URL") {
            let proxy = proxy.trim();
            self.proxy_url = (!proxy.is_empty()).then(|| proxy.to_string());
        }
    }

    /// Transport settings handed to each exchange client on construction.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            proxy_url: self.proxy_url.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// Proxy and timeout settings attached to an exchange client.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub proxy_url: Option<String>,
    pub timeout: Duration,
}
