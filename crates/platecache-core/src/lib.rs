//! Core library for platecache - offline persistence and sync for a restaurant directory.
//!
//! This crate provides:
//! - `store`: Durable key-value store with named, versioned partitions
//! - `cache`: Cache-aside reads and optimistic local writes
//! - `sync`: Pending write queue, drain engine and background worker
//! - `api`: Network boundary (`Transport`) with an HTTP and a mock implementation
//! - `directory`: Caller-facing operations used by the UI glue
//! - `models`: Restaurant and review models parsed from cached payloads

pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;

pub use config::Config;
pub use context::Context;
pub use directory::{Directory, FavoriteUpdate, PrefetchReport};
pub use error::{Error, ErrorCode, ErrorDescriptor, Result};
