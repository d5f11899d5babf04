//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! parser / relay / cache / handler produce:
//!     → tracing events (structured fields, one span per connection)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, filtered by RUST_LOG or config)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Progress output is diagnostics only; nothing in the relay depends on it
//! - Connection id and peer address flow through the connection span

pub mod logging;
pub mod metrics;
