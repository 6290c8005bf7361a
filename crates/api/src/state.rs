//! Shared application state

use truevault_billing::BillingService;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
    pub config: AppConfig,
}
