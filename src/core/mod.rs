// Core Module - foundational types, config, errors, logging

pub mod config;
pub mod errors;
pub mod logger;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{ConfigError, GatewayConfig};
pub use errors::GatewayError;
pub use logger::setup_logging;
pub use types::{
    is_trade_success, ConnectionHealthStatus, ConnectionStatus, QuoteSession, SymbolSpecification,
    TerminalState, TRADE_SUCCESS_CODES,
};
