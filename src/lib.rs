//! Forwarding HTTP proxy with an on-disk GET response cache.

pub mod cache;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod resilience;

pub use config::ProxyConfig;
pub use lifecycle::Shutdown;
pub use proxy::ProxyServer;
