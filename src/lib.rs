//! Library exports for integration testing.
//!
//! The binary entrypoint lives in `main.rs`; this file exposes the
//! internal modules so integration tests and the secondary `image-resolve`
//! binary can exercise them directly.

pub mod cache;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod registry;
pub mod supervisor;
pub mod version;
pub mod watch;
