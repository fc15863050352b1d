//! Chat-to-speech relay: HTTP control API, chat ingest and pipeline wiring.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod source;
pub mod validation;

pub use api::{create_router, AppState};
pub use config::RelayConfig;
pub use relay::Relay;
