//! Invoice records
//!
//! Immutable billing records, generated exactly once per completed payment
//! or monthly renewal cycle. Numbers follow `TV-YYYYMMDD-NNNN` with a
//! per-day counter.

use serde::Serialize;
use sqlx::SqlitePool;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use truevault_shared::clock::utc_now;

/// An issued invoice.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: i64,
    pub user_id: i64,
    pub invoice_number: String,
    pub plan_id: String,
    pub amount_cents: i64,
    pub payment_ref: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Invoice service
#[derive(Clone)]
pub struct InvoiceService {
    pool: SqlitePool,
}

impl InvoiceService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Issue an invoice dated `now`. Returns the invoice number.
    pub async fn create(
        &self,
        user_id: i64,
        plan_id: &str,
        amount_cents: i64,
        payment_ref: &str,
        now: OffsetDateTime,
    ) -> BillingResult<String> {
        let day = now
            .format(format_description!("[year][month][day]"))
            .map_err(|e| BillingError::Database(e.to_string()))?;

        // Per-day counter; retry on the (rare) concurrent collision since
        // invoice_number is unique.
        for attempt in 0..3u32 {
            let (issued_today,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM invoices WHERE invoice_number LIKE ?")
                    .bind(format!("TV-{day}-%"))
                    .fetch_one(&self.pool)
                    .await?;

            let number = format!("TV-{}-{:04}", day, issued_today + 1 + attempt as i64);
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO invoices
                    (user_id, invoice_number, plan_id, amount_cents, payment_ref, status, created_at)
                VALUES (?, ?, ?, ?, ?, 'paid', ?)
                "#,
            )
            .bind(user_id)
            .bind(&number)
            .bind(plan_id)
            .bind(amount_cents)
            .bind(payment_ref)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 1 {
                tracing::info!(
                    user_id = user_id,
                    invoice_number = %number,
                    amount_cents = amount_cents,
                    "Invoice issued"
                );
                return Ok(number);
            }
        }

        Err(BillingError::Database(
            "could not allocate a unique invoice number".to_string(),
        ))
    }

    /// Billing history, newest first.
    pub async fn history(&self, user_id: i64) -> BillingResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, user_id, invoice_number, plan_id, amount_cents,
                   payment_ref, status, created_at
            FROM invoices
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    /// Whether a renewal invoice already exists for this payment reference
    /// (used to keep monthly generation idempotent).
    pub async fn exists_for_ref(&self, user_id: i64, payment_ref: &str) -> BillingResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM invoices WHERE user_id = ? AND payment_ref = ?",
        )
        .bind(user_id)
        .bind(payment_ref)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}
