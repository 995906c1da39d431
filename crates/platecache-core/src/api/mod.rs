//! Network boundary for the persistence and sync layer.
//!
//! This module provides the `Transport` trait through which every network
//! request flows, plus:
//! - `HttpTransport`: reqwest-based client against the restaurant API
//! - `OfflineTransport`: always reports the network as unreachable
//! - `MockTransport`: scriptable transport for tests and demos
//!
//! The API serves `/restaurants`, `/restaurants/{id}` and
//! `/reviews/?restaurant_id={id}` for reads, and accepts `POST /reviews` and
//! `PUT /restaurants/{id}/?is_favorite={bool}` for writes.

pub mod client;
pub mod error;
pub mod mock;
pub mod transport;

pub use client::HttpTransport;
pub use error::ApiError;
pub use mock::MockTransport;
pub use transport::{Method, OfflineTransport, Request, Response, Transport};
