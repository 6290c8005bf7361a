#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! TrueVault Billing Module
//!
//! The subscription lifecycle and access-provisioning engine:
//!
//! - **Checkout & capture**: PayPal order flow with idempotent webhook capture
//! - **Subscription ledger**: append-only history, one active row per user
//! - **VIP overrides**: payment bypass with irrevocable owner entries
//! - **Access provisioning**: best-effort peer registration on VPN nodes
//! - **Revocation sweep**: time-driven grace-period and cancellation expiry
//! - **Maintenance**: stale orders, retries, warnings, renewal invoices

pub mod client;
pub mod error;
pub mod invoices;
pub mod ledger;
pub mod maintenance;
pub mod plans;
pub mod provisioning;
pub mod revocations;
pub mod vip;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testutil;

// Client
pub use client::{CaptureOutcome, CreatedOrder, PayPalClient, PayPalConfig, REMOTE_TIMEOUT};

// Error
pub use error::{BillingError, BillingResult};

// Invoices
pub use invoices::{Invoice, InvoiceService};

// Ledger
pub use ledger::{
    CancelOutcome, CaptureResult, CheckoutOutcome, Subscription, SubscriptionLedger, User,
    GRACE_PERIOD_DAYS,
};

// Maintenance
pub use maintenance::{MaintenanceService, SweepReport};

// Plans
pub use plans::{Plan, PlanCatalog};

// Provisioning
pub use provisioning::{AccessProvisioner, ProvisionSummary, ServerCatalog, VpnServer};

// Revocations
pub use revocations::RevocationService;

// VIP
pub use vip::{NewVip, VipDirectory, VipEntry};

// Webhooks
pub use webhooks::{WebhookEvent, WebhookHandler, WebhookMeta};

use sqlx::SqlitePool;

/// All billing services wired together over one pool.
#[derive(Clone)]
pub struct BillingService {
    pub gateway: PayPalClient,
    pub plans: PlanCatalog,
    pub vip: VipDirectory,
    pub provisioner: AccessProvisioner,
    pub invoices: InvoiceService,
    pub ledger: SubscriptionLedger,
    pub webhooks: WebhookHandler,
    pub revocations: RevocationService,
    pub maintenance: MaintenanceService,
}

impl BillingService {
    pub fn new(pool: SqlitePool, paypal: PayPalConfig, catalog: ServerCatalog) -> Self {
        let gateway = PayPalClient::new(paypal);
        let plans = PlanCatalog::standard();
        let vip = VipDirectory::new(pool.clone());
        let provisioner = AccessProvisioner::new(pool.clone(), catalog, vip.clone());
        let invoices = InvoiceService::new(pool.clone());
        let ledger = SubscriptionLedger::new(
            pool.clone(),
            gateway.clone(),
            plans.clone(),
            vip.clone(),
            provisioner.clone(),
            invoices.clone(),
        );
        let webhooks = WebhookHandler::new(
            pool.clone(),
            gateway.clone(),
            ledger.clone(),
            provisioner.clone(),
        );
        let revocations = RevocationService::new(pool.clone(), provisioner.clone());
        let maintenance = MaintenanceService::new(
            pool,
            plans.clone(),
            invoices.clone(),
            revocations.clone(),
            ledger.clone(),
            vip.clone(),
        );

        Self {
            gateway,
            plans,
            vip,
            provisioner,
            invoices,
            ledger,
            webhooks,
            revocations,
            maintenance,
        }
    }

    /// Wire everything from environment variables.
    pub fn from_env(pool: SqlitePool) -> BillingResult<Self> {
        Ok(Self::new(
            pool,
            PayPalConfig::from_env()?,
            ServerCatalog::from_env()?,
        ))
    }
}
