//! End-to-end subscription lifecycle:
//! checkout -> capture webhook -> provisioned access -> cancellation ->
//! scheduled revocation after the paid period ends.

#![allow(clippy::unwrap_used)]

use serde_json::json;
use sqlx::SqlitePool;
use time::Duration;

use truevault_billing::{
    BillingService, CheckoutOutcome, PayPalConfig, ServerCatalog, VpnServer, WebhookMeta,
};
use truevault_shared::clock::utc_now;
use truevault_shared::db::create_test_pool;

async fn seed_user(pool: &SqlitePool, email: &str) -> i64 {
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

fn paypal_config(api_base: &str) -> PayPalConfig {
    PayPalConfig {
        client_id: "client".to_string(),
        secret: "secret".to_string(),
        api_base: api_base.to_string(),
        webhook_secret: "whsec_test".to_string(),
        app_base_url: "https://vpn.example.com".to_string(),
        brand_name: "TrueVault VPN".to_string(),
    }
}

#[tokio::test]
async fn full_lifecycle_from_checkout_to_revocation() {
    // --- Payment provider ---
    let mut paypal = mockito::Server::new_async().await;
    let _token = paypal
        .mock("POST", "/v1/oauth2/token")
        .with_status(200)
        .with_body(r#"{"access_token":"tok","expires_in":3600}"#)
        .create_async()
        .await;
    let _order = paypal
        .mock("POST", "/v2/checkout/orders")
        .with_status(201)
        .with_body(
            r#"{"id":"ORDER-E2E","links":[{"rel":"approve","href":"https://paypal.test/approve/ORDER-E2E"}]}"#,
        )
        .create_async()
        .await;
    let capture = paypal
        .mock("POST", "/v2/checkout/orders/ORDER-E2E/capture")
        .with_status(201)
        .with_body(r#"{"status":"COMPLETED"}"#)
        .expect(1)
        .create_async()
        .await;

    // --- VPN nodes: two shared, one reserved for a named VIP ---
    let mut node_ny = mockito::Server::new_async().await;
    let mut node_tx = mockito::Server::new_async().await;
    let mut node_reserved = mockito::Server::new_async().await;

    let add_ny = node_ny
        .mock("POST", "/peers/add")
        .with_status(200)
        .with_body(r#"{"success":true,"allowed_ip":"10.0.0.7"}"#)
        .expect(1)
        .create_async()
        .await;
    let add_tx = node_tx
        .mock("POST", "/peers/add")
        .with_status(200)
        .with_body(r#"{"success":true,"allowed_ip":"10.10.1.7"}"#)
        .expect(1)
        .create_async()
        .await;
    let add_reserved = node_reserved
        .mock("POST", "/peers/add")
        .with_status(200)
        .with_body(r#"{"success":true,"allowed_ip":"10.0.1.7"}"#)
        .expect(0)
        .create_async()
        .await;

    // Revocation contacts every server in the catalog, reserved included.
    let remove_ny = node_ny
        .mock("POST", "/peers/remove")
        .with_status(200)
        .with_body(r#"{"success":true}"#)
        .expect(1)
        .create_async()
        .await;
    let remove_tx = node_tx
        .mock("POST", "/peers/remove")
        .with_status(200)
        .with_body(r#"{"success":true}"#)
        .expect(1)
        .create_async()
        .await;
    let remove_reserved = node_reserved
        .mock("POST", "/peers/remove")
        .with_status(200)
        .with_body(r#"{"success":true}"#)
        .expect(1)
        .create_async()
        .await;

    let catalog = ServerCatalog::new(
        vec![
            VpnServer {
                id: 1,
                name: "New York".to_string(),
                base_url: node_ny.url(),
                restricted_to: None,
            },
            VpnServer {
                id: 2,
                name: "St. Louis".to_string(),
                base_url: node_reserved.url(),
                restricted_to: Some("reserved-vip@example.com".to_string()),
            },
            VpnServer {
                id: 3,
                name: "Dallas".to_string(),
                base_url: node_tx.url(),
                restricted_to: None,
            },
        ],
        "node-token",
    );

    let pool = create_test_pool().await.unwrap();
    let billing = BillingService::new(pool.clone(), paypal_config(&paypal.url()), catalog);
    let user_id = seed_user(&pool, "newcomer@example.com").await;

    // --- Checkout ---
    let outcome = billing
        .ledger
        .create_checkout(user_id, "family")
        .await
        .unwrap();
    let order_id = match outcome {
        CheckoutOutcome::Redirect {
            order_id,
            approval_url,
        } => {
            assert_eq!(
                approval_url.as_deref(),
                Some("https://paypal.test/approve/ORDER-E2E")
            );
            order_id
        }
        other => panic!("expected redirect, got {other:?}"),
    };
    assert_eq!(order_id, "ORDER-E2E");

    let (amount_cents, order_status): (i64, String) =
        sqlx::query_as("SELECT amount_cents, status FROM pending_orders WHERE order_id = ?")
            .bind(&order_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(amount_cents, 1497);
    assert_eq!(order_status, "pending");

    // --- Provider confirms the payment asynchronously ---
    let body = json!({
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": "CAPTURE-E2E",
            "supplementary_data": {"related_ids": {"order_id": "ORDER-E2E"}},
        }
    })
    .to_string();
    let transmission_time = "2026-08-07T12:00:00Z";
    let signature = billing
        .gateway
        .sign_webhook("wh-e2e", transmission_time, &body)
        .unwrap();
    billing
        .webhooks
        .handle_delivery(
            &WebhookMeta {
                transmission_id: "wh-e2e".to_string(),
                transmission_time: transmission_time.to_string(),
                signature,
            },
            &body,
        )
        .await
        .unwrap();

    capture.assert_async().await;

    let sub = billing
        .ledger
        .active_subscription(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.plan_id, "family");
    assert_eq!(sub.max_devices, 5);

    let invoices = billing.invoices.history(user_id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    assert!(invoices[0].invoice_number.starts_with("TV-"));
    assert_eq!(invoices[0].amount_cents, 1497);

    // Grants on both shared servers, none on the reserved one.
    add_ny.assert_async().await;
    add_tx.assert_async().await;
    add_reserved.assert_async().await;
    let grants: Vec<(i64, String)> = sqlx::query_as(
        "SELECT server_id, status FROM access_grants WHERE user_id = ? ORDER BY server_id",
    )
    .bind(user_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(grants.len(), 2);
    assert_eq!(grants[0], (1, "active".to_string()));
    assert_eq!(grants[1], (3, "active".to_string()));

    // --- Cancellation is non-renewing, not immediate ---
    let cancel = billing
        .ledger
        .cancel_subscription(user_id, Some("too expensive"))
        .await
        .unwrap();
    assert_eq!(cancel.access_until, sub.end_date);

    let (sub_status,): (String,) =
        sqlx::query_as("SELECT status FROM subscriptions WHERE id = ?")
            .bind(sub.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(sub_status, "cancelled");

    // Access still intact before the end date.
    let (active_grants,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM access_grants WHERE user_id = ? AND status = 'active'",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(active_grants, 2);

    // --- Cron fires after the paid period ends, no resubscription ---
    let after_end = cancel.access_until + Duration::hours(1);
    let report = billing.maintenance.run_sweep_at(after_end).await.unwrap();
    assert_eq!(report.revocations, 1);

    remove_ny.assert_async().await;
    remove_tx.assert_async().await;
    remove_reserved.assert_async().await;

    let (remaining,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM access_grants WHERE user_id = ? AND status = 'active'",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(remaining, 0);

    let (user_status,): (String,) = sqlx::query_as("SELECT status FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(user_status, "suspended");

    let (revocation_status,): (String,) = sqlx::query_as(
        "SELECT status FROM scheduled_revocations WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(revocation_status, "completed");
}
