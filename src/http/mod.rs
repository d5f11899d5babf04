//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! client byte stream
//!     → request.rs (frame header block, read POST body, parse once)
//!     → target.rs (Host header + target port → OriginTarget)
//!     → [relay engine dials and streams]
//!     → response.rs (proxy-generated error responses only)
//! ```
//!
//! # Design Decisions
//! - Only GET and POST are understood; anything else is rejected up front
//! - Header bytes are forwarded exactly as received, never re-serialized
//! - No chunked-encoding awareness: bodies are framed by Content-Length

pub mod request;
pub mod response;
pub mod target;

pub use request::{Method, ParseError, Request, RequestParser};
pub use response::ErrorStatus;
pub use target::{resolve, OriginTarget, ResolveError, DEFAULT_PORT};
