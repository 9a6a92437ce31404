//! Client fan-out for Strata.
//!
//! Dashboard clients connect over WebSocket, subscribe to topics and receive
//! every matching publication in order. Each connection has a bounded
//! outbound queue: a client that cannot keep up is degraded and then
//! evicted with a reconnect hint, so one slow reader never holds back the
//! publisher or other clients.

pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod topic;
pub mod ws;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use manager::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionManager, GatewayStats, SweepReport,
    Transport,
};
pub use protocol::{ClientMessage, ErrorCode, ServerMessage};
pub use topic::Topic;
pub use ws::{WsTransport, serve_socket, upgrade};
