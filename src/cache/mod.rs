//! Persistent cache for downloaded sources and rendered output
//!
//! The store keeps opaque byte payloads in a single-file SQLite database with
//! an absolute expiry per key. Expired or corrupt records never reach callers;
//! they are purged lazily whenever a live record is read.

mod store;

pub use store::{StoreError, TtlStore};
