//! Data models for directory entities.
//!
//! Payloads are cached as raw JSON; these types are the parsed view handed
//! to callers:
//!
//! - `Restaurant`, `LatLng`, `RestaurantFilter`: restaurant listings
//! - `Review`, `NewReview`: restaurant reviews

mod lenient;
pub mod restaurant;
pub mod review;

pub use restaurant::{distinct, LatLng, Restaurant, RestaurantFilter};
pub use review::{NewReview, Review};
