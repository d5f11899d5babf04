//! Forwarding proxy core.
//!
//! # Data Flow
//! ```text
//! server.rs   accept (bounded) → spawn task per connection
//! handler.rs  parse request → resolve origin → relay → close client
//! relay.rs    GET: cache hit → replay | miss → dial, forward, stream + tee
//!             POST: dial, forward header + body + "\n", stream
//! ```
//!
//! # Design Decisions
//! - One request per connection; no keep-alive or pipelining
//! - Failures stop at the handler; the accept loop never sees them

pub mod handler;
pub mod relay;
pub mod server;

pub use handler::{ConnectionHandler, HandlerError, Served};
pub use relay::{RelayEngine, RelayError, RelayOutcome};
pub use server::ProxyServer;
