//! Shared test fixtures.

use sqlx::SqlitePool;

use crate::client::{PayPalClient, PayPalConfig};
use crate::invoices::InvoiceService;
use crate::ledger::SubscriptionLedger;
use crate::plans::PlanCatalog;
use crate::provisioning::{AccessProvisioner, ServerCatalog};
use crate::vip::VipDirectory;
use truevault_shared::clock::utc_now;

pub(crate) fn paypal_config(api_base: &str) -> PayPalConfig {
    PayPalConfig {
        client_id: "client".to_string(),
        secret: "secret".to_string(),
        api_base: api_base.to_string(),
        webhook_secret: "whsec_test".to_string(),
        app_base_url: "https://vpn.example.com".to_string(),
        brand_name: "TrueVault VPN".to_string(),
    }
}

pub(crate) fn gateway_at(api_base: &str) -> PayPalClient {
    PayPalClient::new(paypal_config(api_base))
}

/// Ledger over an empty server catalog (provisioning no-ops against nodes).
pub(crate) fn ledger_with(pool: &SqlitePool, api_base: &str) -> SubscriptionLedger {
    ledger_with_catalog(pool, api_base, ServerCatalog::new(vec![], "node-token"))
}

pub(crate) fn ledger_with_catalog(
    pool: &SqlitePool,
    api_base: &str,
    catalog: ServerCatalog,
) -> SubscriptionLedger {
    let vip = VipDirectory::new(pool.clone());
    let provisioner = AccessProvisioner::new(pool.clone(), catalog, vip.clone());
    SubscriptionLedger::new(
        pool.clone(),
        gateway_at(api_base),
        PlanCatalog::standard(),
        vip,
        provisioner,
        InvoiceService::new(pool.clone()),
    )
}

pub(crate) async fn seed_user(pool: &SqlitePool, email: &str) -> i64 {
    sqlx::query("INSERT INTO users (email, status, created_at) VALUES (?, 'active', ?)")
        .bind(email)
        .bind(utc_now())
        .execute(pool)
        .await
        .unwrap();
    let (id,): (i64,) = sqlx::query_as("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_one(pool)
        .await
        .unwrap();
    id
}

pub(crate) async fn count(pool: &SqlitePool, sql: &str, user_id: i64) -> i64 {
    let (n,): (i64,) = sqlx::query_as(sql)
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap();
    n
}
