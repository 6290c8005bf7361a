#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! TrueVault API
//!
//! HTTP surface over the billing engine: checkout/capture/cancel endpoints,
//! the PayPal webhook receiver, and admin VIP management.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::AppConfig;
pub use error::{ApiError, ApiResult};
pub use routes::router;
pub use state::AppState;
