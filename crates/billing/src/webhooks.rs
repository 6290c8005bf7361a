//! PayPal webhook handling
//!
//! The sole externally-reachable entry point for asynchronous provider
//! events. Ordering: persist the raw payload first, verify authenticity,
//! dispatch, then mark the log row processed. Duplicate and out-of-order
//! deliveries are expected; idempotence lives in the ledger, not here.

use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::client::PayPalClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::SubscriptionLedger;
use crate::provisioning::AccessProvisioner;
use truevault_shared::clock::utc_now;
use truevault_shared::types::UserStatus;

/// Transport metadata accompanying a webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookMeta {
    pub transmission_id: String,
    pub transmission_time: String,
    pub signature: String,
}

/// A parsed provider event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub event_type: String,
    #[serde(default)]
    pub resource: Value,
}

/// The `custom_id` envelope attached to orders at checkout time; the only
/// link back to the user when the provider omits our order id.
#[derive(Debug, Clone, Deserialize)]
struct CustomEnvelope {
    user_id: i64,
    #[allow(dead_code)]
    plan_id: Option<String>,
    #[allow(dead_code)]
    email: Option<String>,
}

/// Webhook handler for PayPal events
#[derive(Clone)]
pub struct WebhookHandler {
    pool: SqlitePool,
    gateway: PayPalClient,
    ledger: SubscriptionLedger,
    provisioner: AccessProvisioner,
}

impl WebhookHandler {
    pub fn new(
        pool: SqlitePool,
        gateway: PayPalClient,
        ledger: SubscriptionLedger,
        provisioner: AccessProvisioner,
    ) -> Self {
        Self {
            pool,
            gateway,
            ledger,
            provisioner,
        }
    }

    /// Process one delivery.
    ///
    /// Returns `Ok(())` for every authentically-signed event, including those
    /// whose internal processing failed (the error is recorded on the log row
    /// for operator follow-up; acknowledging stops the provider from
    /// retry-storming on a bug). `SignatureInvalid` and `MalformedEvent` are
    /// the only errors surfaced to the caller.
    pub async fn handle_delivery(&self, meta: &WebhookMeta, body: &str) -> BillingResult<()> {
        // Durability first: if anything after this crashes, the event is
        // unprocessed, not lost.
        let log_id = self.log_received(&meta.transmission_id, body).await?;

        if let Err(e) = self.gateway.verify_webhook_signature(
            &meta.transmission_id,
            &meta.transmission_time,
            &meta.signature,
            body,
        ) {
            self.record_error(log_id, "signature verification failed")
                .await;
            tracing::warn!(
                transmission_id = %meta.transmission_id,
                "Rejected webhook with invalid signature"
            );
            return Err(e);
        }

        let event: WebhookEvent = match serde_json::from_str(body) {
            Ok(event) => event,
            Err(e) => {
                self.record_error(log_id, "malformed payload").await;
                return Err(BillingError::MalformedEvent(e.to_string()));
            }
        };

        sqlx::query("UPDATE webhook_log SET event_type = ? WHERE id = ?")
            .bind(&event.event_type)
            .bind(log_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            transmission_id = %meta.transmission_id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        match self.dispatch(&event).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE webhook_log SET processed = 1, processed_at = ? WHERE id = ?",
                )
                .bind(utc_now())
                .bind(log_id)
                .execute(&self.pool)
                .await?;
            }
            Err(e) => {
                // Verified events are acknowledged regardless; the failure is
                // an operator concern, not the provider's.
                tracing::error!(
                    transmission_id = %meta.transmission_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed; acknowledging anyway"
                );
                self.record_error(log_id, &e.to_string()).await;
            }
        }

        Ok(())
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<()> {
        match event.event_type.as_str() {
            "CHECKOUT.ORDER.APPROVED" | "PAYMENT.CAPTURE.COMPLETED" => {
                let Some(order_id) = order_id_of(&event.resource) else {
                    return Err(BillingError::MalformedEvent(
                        "payment event without an order id".to_string(),
                    ));
                };
                self.ledger.complete_payment(&order_id).await?;
            }

            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED"
            | "BILLING.SUBSCRIPTION.SUSPENDED" => {
                if let Some(envelope) = custom_envelope(&event.resource) {
                    self.ledger.handle_payment_failure(envelope.user_id).await?;
                }
            }

            "BILLING.SUBSCRIPTION.CANCELLED" => {
                if let Some(envelope) = custom_envelope(&event.resource) {
                    match self
                        .ledger
                        .cancel_subscription(envelope.user_id, Some("provider cancellation"))
                        .await
                    {
                        Ok(_) | Err(BillingError::NoActiveSubscription(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            "PAYMENT.CAPTURE.REFUNDED" => {
                // Refunds skip the grace period entirely.
                if let Some(envelope) = custom_envelope(&event.resource) {
                    self.provisioner.revoke_all(envelope.user_id).await?;
                    self.ledger
                        .set_user_status(envelope.user_id, UserStatus::Refunded)
                        .await?;
                    tracing::warn!(
                        user_id = envelope.user_id,
                        "Refund processed: access revoked immediately"
                    );
                }
            }

            "CUSTOMER.DISPUTE.CREATED" => {
                // Log only; disputes are resolved by a human.
                let dispute_id = event
                    .resource
                    .get("dispute_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let reason = event.resource.get("reason").and_then(Value::as_str);
                sqlx::query(
                    r#"
                    INSERT INTO disputes (dispute_id, reason, status, payload, created_at)
                    VALUES (?, ?, 'open', ?, ?)
                    "#,
                )
                .bind(dispute_id)
                .bind(reason)
                .bind(event.resource.to_string())
                .bind(utc_now())
                .execute(&self.pool)
                .await?;
            }

            other => {
                tracing::info!(event_type = %other, "Unhandled webhook event type");
            }
        }
        Ok(())
    }

    async fn log_received(&self, transmission_id: &str, payload: &str) -> BillingResult<i64> {
        let result = sqlx::query(
            "INSERT INTO webhook_log (transmission_id, payload, received_at) VALUES (?, ?, ?)",
        )
        .bind(transmission_id)
        .bind(payload)
        .bind(utc_now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn record_error(&self, log_id: i64, error: &str) {
        if let Err(e) = sqlx::query("UPDATE webhook_log SET error = ? WHERE id = ?")
            .bind(error)
            .bind(log_id)
            .execute(&self.pool)
            .await
        {
            tracing::error!(log_id = log_id, error = %e, "Failed to record webhook error");
        }
    }
}

/// Order id from a payment resource: either the resource id itself or the
/// related-ids block on capture events.
fn order_id_of(resource: &Value) -> Option<String> {
    resource
        .pointer("/supplementary_data/related_ids/order_id")
        .and_then(Value::as_str)
        .or_else(|| resource.get("id").and_then(Value::as_str))
        .map(str::to_string)
}

fn custom_envelope(resource: &Value) -> Option<CustomEnvelope> {
    let raw = resource.get("custom_id")?.as_str()?;
    match serde_json::from_str(raw) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable custom_id envelope on webhook resource");
            None
        }
    }
}
