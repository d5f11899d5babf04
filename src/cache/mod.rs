//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! GET target
//!     → open_or_reserve(target)
//!         Hit        → replay file to client, no origin connection
//!         Miss(w)    → relay from origin, tee each chunk into w, commit at EOF
//!         Miss(None) → another relay is filling this key; relay uncached
//! ```
//!
//! # Design Decisions
//! - One writer per key at a time, enforced by the index
//! - Cache failures are logged and never reach the client
//! - Entries live for the process lifetime in the index and forever on disk

pub mod store;

pub use store::{
    cache_file_name, CacheError, CacheLookup, CacheStore, CacheWriter, CachedResponse, ReplayError,
};
