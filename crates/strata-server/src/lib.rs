//! Strata server: configuration, wiring and the HTTP surface.
//!
//! `GET /ws` upgrades to the dashboard WebSocket protocol, `GET /health`
//! reports tier and feed status, `GET /metrics` renders Prometheus text.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod server;

pub use bootstrap::{AppState, Strata};
pub use config::AppConfig;
pub use error::{ServerError, ServerResult};
pub use server::{build_router, run};
