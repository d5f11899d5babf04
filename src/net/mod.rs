//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (admission permit, accept)
//!     → connection.rs (id for the span, in-flight tracking)
//!     → Hand off to proxy::handler
//! ```
//!
//! # Design Decisions
//! - Bounded admission prevents unbounded task growth
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
