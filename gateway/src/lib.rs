//! Client-facing WebSocket front, bar fan-out, push sink, metrics and
//! Health HTTP API for the market-data fan-out broker.

pub mod config;
pub mod fanout;
pub mod health_api;
pub mod metrics;
pub mod models;
pub mod push_sink;
pub mod registry;
pub mod websocket;

pub use config::BrokerConfig;
pub use registry::ClientRegistry;
