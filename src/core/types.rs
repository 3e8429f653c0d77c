// Core Type Definitions for the MetaTrader Gateway Client
// Connection state, terminal-state view, health snapshot, trade return codes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Trade Return Codes
// ============================================================================

/// Return codes that count as a successful trade execution
pub const TRADE_SUCCESS_CODES: [&str; 5] = [
    "ERR_NO_ERROR",
    "TRADE_RETCODE_PLACED",
    "TRADE_RETCODE_DONE",
    "TRADE_RETCODE_DONE_PARTIAL",
    "TRADE_RETCODE_NO_CHANGES",
];

pub fn is_trade_success(string_code: &str) -> bool {
    TRADE_SUCCESS_CODES.contains(&string_code)
}

// ============================================================================
// Terminal State View
// ============================================================================

/// A single quote session window on a weekday, broker-local time of day
/// in `HH:mm:ss.SSS` form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSession {
    pub from: String,
    pub to: String,
}

/// Symbol specification as far as this core cares about it: the quote
/// sessions keyed by upper-case weekday name (`SUNDAY`..`SATURDAY`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSpecification {
    #[serde(default)]
    pub quote_sessions: HashMap<String, Vec<QuoteSession>>,
}

/// Read-only view of the local terminal state mirror, provided by an
/// external collaborator. The gateway core never mutates it.
pub trait TerminalState: Send + Sync {
    fn connected(&self) -> bool;
    fn connected_to_broker(&self) -> bool;
    fn synchronized(&self) -> bool;
    fn subscribed_symbols(&self) -> Vec<String>;
    fn specification(&self, symbol: &str) -> Option<SymbolSpecification>;
}

// ============================================================================
// Connection Health
// ============================================================================

/// Point-in-time health snapshot; `healthy` is the conjunction of the
/// four component booleans
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealthStatus {
    pub connected: bool,
    pub connected_to_broker: bool,
    pub quote_streaming_healthy: bool,
    pub synchronized: bool,
    pub healthy: bool,
    pub message: String,
}

impl fmt::Display for ConnectionHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionHealthStatus(connected={}, broker={}, quotes={}, synced={}, healthy={})",
            self.connected,
            self.connected_to_broker,
            self.quote_streaming_healthy,
            self.synchronized,
            self.healthy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_success_codes() {
        assert!(is_trade_success("ERR_NO_ERROR"));
        assert!(is_trade_success("TRADE_RETCODE_DONE"));
        assert!(is_trade_success("TRADE_RETCODE_DONE_PARTIAL"));
        assert!(!is_trade_success("TRADE_RETCODE_REQUOTE"));
        assert!(!is_trade_success(""));
    }

    #[test]
    fn test_specification_deserialization() {
        let spec: SymbolSpecification = serde_json::from_str(
            r#"{"quoteSessions": {"MONDAY": [{"from": "08:00:00.000", "to": "17:00:00.000"}]}}"#,
        )
        .unwrap();
        let sessions = spec.quote_sessions.get("MONDAY").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].from, "08:00:00.000");
    }

    #[test]
    fn test_connection_status_display() {
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "Reconnecting");
    }
}
