//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Client header/body read  → timeouts.rs (client_read deadline per read)
//! Origin dial              → timeouts.rs (connect deadline, DNS included)
//! Origin response read     → timeouts.rs (origin_read deadline per chunk)
//! ```
//!
//! # Design Decisions
//! - Every deadline is configurable and may be disabled
//! - No retries; a failed relay is reported once and the connection closes

pub mod timeouts;

pub use timeouts::{with_timeout, TimeoutError};
