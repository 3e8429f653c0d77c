// Layer 1 - Transport and RPC
// Event socket seam plus the gateway client built on top of it

pub mod gateway_client;
pub mod transport;

pub use gateway_client::{GatewayClient, GatewayClientStats, ReconnectListener};
pub use transport::{SocketEvent, Transport, TransportError, TransportSink, TransportStream, WsTransport};
