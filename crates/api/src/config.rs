//! API configuration

use crate::error::{ApiError, ApiResult};

/// Top-level API configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: String,
    /// Bearer token for the admin VIP endpoints.
    pub admin_token: String,
    /// Owner email upserted into the VIP directory at startup.
    pub owner_email: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> ApiResult<Self> {
        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/truevault.db".to_string()),
            admin_token: std::env::var("ADMIN_TOKEN")
                .map_err(|_| ApiError::Internal("ADMIN_TOKEN not set".to_string()))?,
            owner_email: std::env::var("OWNER_EMAIL").ok(),
        })
    }
}
