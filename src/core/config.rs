// Configuration for the MetaTrader Gateway Client
// Caller-supplied construction options with validated defaults

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bearer token appended as the `auth-token` query parameter
    pub token: String,
    /// Application name stamped on every request
    pub application: String,
    /// Domain interpolated into the gateway base URL
    pub domain: String,

    // Timeouts
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,

    // Reconnect backoff bounds
    pub reconnect_floor_secs: u64,
    pub reconnect_ceiling_secs: u64,

    // Synchronization stream settings
    pub sequence_gap_timeout_secs: u64,
    pub min_quote_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            application: "MetaApi".to_string(),
            domain: "agiliumtrade.agiliumtrade.ai".to_string(),
            request_timeout_secs: 60,
            connect_timeout_secs: 60,
            reconnect_floor_secs: 1,
            reconnect_ceiling_secs: 5,
            sequence_gap_timeout_secs: 10,
            min_quote_interval_secs: 60,
        }
    }
}

impl GatewayConfig {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            ..Default::default()
        }
    }

    /// Gateway socket URL. The scheme stays `https` here; the transport
    /// layer maps it to the websocket scheme when opening the connection.
    pub fn url(&self) -> String {
        format!(
            "https://mt-client-api-v1.{}/ws?auth-token={}",
            self.domain, self.token
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sequence_gap_timeout(&self) -> Duration {
        Duration::from_secs(self.sequence_gap_timeout_secs)
    }

    pub fn min_quote_interval(&self) -> Duration {
        Duration::from_secs(self.min_quote_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::Validation("token must not be empty".to_string()));
        }
        if self.domain.is_empty() {
            return Err(ConfigError::Validation("domain must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        if self.reconnect_floor_secs == 0 || self.reconnect_floor_secs > self.reconnect_ceiling_secs {
            return Err(ConfigError::Validation(
                "reconnect backoff bounds must satisfy 0 < floor <= ceiling".to_string(),
            ));
        }
        Ok(())
    }
}
