//! Scheduled revocation sweep
//!
//! The only component that mutates state purely on the passage of time.
//! Safe to re-run on every cron tick: the query filters on `pending` rows
//! only, and each row is re-checked against the live subscription state
//! before anything is revoked.

use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::provisioning::AccessProvisioner;
use truevault_shared::clock::utc_now;
use truevault_shared::types::RevocationStatus;

/// Revocation sweep service
#[derive(Clone)]
pub struct RevocationService {
    pool: SqlitePool,
    provisioner: AccessProvisioner,
}

impl RevocationService {
    pub fn new(pool: SqlitePool, provisioner: AccessProvisioner) -> Self {
        Self { pool, provisioner }
    }

    /// Process every due revocation. Returns the number of rows handled.
    pub async fn process_due(&self) -> BillingResult<u64> {
        self.process_due_at(utc_now()).await
    }

    pub async fn process_due_at(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let due: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, user_id
            FROM scheduled_revocations
            WHERE status = ? AND revoke_at <= ?
            "#,
        )
        .bind(RevocationStatus::Pending)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut processed = 0u64;
        for (revocation_id, user_id) in due {
            // A timely resubscription always wins: re-check the live state
            // rather than trusting the schedule.
            let resubscribed: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM subscriptions WHERE user_id = ? AND status = 'active'",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

            if resubscribed.is_some() {
                sqlx::query(
                    "UPDATE scheduled_revocations SET status = ? WHERE id = ? AND status = ?",
                )
                .bind(RevocationStatus::Cancelled)
                .bind(revocation_id)
                .bind(RevocationStatus::Pending)
                .execute(&self.pool)
                .await?;
                tracing::info!(user_id = user_id, "Revocation cancelled: user resubscribed");
                processed += 1;
                continue;
            }

            self.provisioner.revoke_all(user_id).await?;

            sqlx::query("UPDATE users SET status = 'suspended' WHERE id = ?")
                .bind(user_id)
                .execute(&self.pool)
                .await?;

            sqlx::query(
                r#"
                UPDATE scheduled_revocations
                SET status = ?, completed_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(RevocationStatus::Completed)
            .bind(now)
            .bind(revocation_id)
            .bind(RevocationStatus::Pending)
            .execute(&self.pool)
            .await?;

            tracing::warn!(user_id = user_id, "Access revoked and user suspended");
            processed += 1;
        }

        Ok(processed)
    }
}
