//! Time-driven maintenance sweeps
//!
//! Everything the 5-minute cron performs beyond the revocation sweep itself:
//! auto-expiry, expiry warnings, bounded payment-failure retries, stale
//! pending-order cleanup, and first-of-month renewal invoices. Each task is
//! idempotent, so a delayed or repeated cron tick is harmless.

use sqlx::SqlitePool;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::invoices::InvoiceService;
use crate::ledger::SubscriptionLedger;
use crate::plans::PlanCatalog;
use crate::revocations::RevocationService;
use crate::vip::VipDirectory;
use truevault_shared::clock::{plus_years, utc_now};

/// Bounded retry policy for failed payments inside the grace window.
pub const MAX_PAYMENT_RETRIES: i64 = 3;
pub const RETRY_SPACING_DAYS: i64 = 3;

/// Pending orders older than this are swept to `expired`.
pub const PENDING_ORDER_TTL_HOURS: i64 = 24;

/// Raw webhook payloads are kept this long.
pub const WEBHOOK_LOG_RETENTION_DAYS: i64 = 30;

const EXPIRY_WARNING_DAYS: i64 = 7;

/// Per-task counts from one sweep, logged for operator visibility.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub revocations: u64,
    pub expired_subscriptions: u64,
    pub vip_extensions: u64,
    pub expiry_warnings: u64,
    pub payment_retries: u64,
    pub stale_orders: u64,
    pub renewal_invoices: u64,
}

/// Maintenance sweep service
#[derive(Clone)]
pub struct MaintenanceService {
    pool: SqlitePool,
    plans: PlanCatalog,
    invoices: InvoiceService,
    revocations: RevocationService,
    ledger: SubscriptionLedger,
    vip: VipDirectory,
}

impl MaintenanceService {
    pub fn new(
        pool: SqlitePool,
        plans: PlanCatalog,
        invoices: InvoiceService,
        revocations: RevocationService,
        ledger: SubscriptionLedger,
        vip: VipDirectory,
    ) -> Self {
        Self {
            pool,
            plans,
            invoices,
            revocations,
            ledger,
            vip,
        }
    }

    /// The 5-minute billing sweep.
    pub async fn run_sweep(&self) -> BillingResult<SweepReport> {
        self.run_sweep_at(utc_now()).await
    }

    pub async fn run_sweep_at(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let mut report = SweepReport {
            revocations: self.revocations.process_due_at(now).await?,
            ..SweepReport::default()
        };

        let (expired, extended) = self.expire_overdue_subscriptions(now).await?;
        report.expired_subscriptions = expired;
        report.vip_extensions = extended;

        report.expiry_warnings = self.flag_expiring_subscriptions(now).await?;
        report.payment_retries = self.retry_payment_failures(now).await?;
        report.stale_orders = self.expire_stale_orders(now).await?;

        if now.day() == 1 {
            report.renewal_invoices = self.generate_renewal_invoices(now).await?;
        }

        tracing::info!(
            revocations = report.revocations,
            expired = report.expired_subscriptions,
            vip_extensions = report.vip_extensions,
            warnings = report.expiry_warnings,
            retries = report.payment_retries,
            stale_orders = report.stale_orders,
            renewal_invoices = report.renewal_invoices,
            "Billing sweep complete"
        );
        Ok(report)
    }

    /// Active subscriptions past their end date are expired with an
    /// immediate revocation; VIP subscriptions never expire and are extended
    /// instead.
    async fn expire_overdue_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<(u64, u64)> {
        let overdue: Vec<(i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT s.id, s.user_id, u.email
            FROM subscriptions s
            JOIN users u ON u.id = s.user_id
            WHERE s.status = 'active' AND s.end_date < ?
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = 0u64;
        let mut extended = 0u64;
        for (subscription_id, user_id, email) in overdue {
            if self.vip.is_vip(&email).await? {
                sqlx::query(
                    "UPDATE subscriptions SET end_date = ? WHERE id = ? AND status = 'active'",
                )
                .bind(plus_years(now, 100))
                .bind(subscription_id)
                .execute(&self.pool)
                .await?;
                extended += 1;
                continue;
            }

            sqlx::query(
                "UPDATE subscriptions SET status = 'expired' WHERE id = ? AND status = 'active'",
            )
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;

            // Grace already passed with the end date; revoke on the next
            // sweep pass.
            self.ledger.schedule_access_revocation(user_id, now).await?;
            tracing::info!(user_id = user_id, "Subscription expired");
            expired += 1;
        }

        Ok((expired, extended))
    }

    /// Set the warned flag on subscriptions inside the warning window.
    /// The flag is the contract; delivery of the warning itself is an
    /// external concern.
    async fn flag_expiring_subscriptions(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET expiry_warned = 1
            WHERE status = 'active'
              AND expiry_warned = 0
              AND end_date > ?
              AND end_date <= ?
            "#,
        )
        .bind(now)
        .bind(now + Duration::days(EXPIRY_WARNING_DAYS))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Record a retry attempt for eligible failures: under the attempt cap,
    /// spaced at least three days apart, and only while the grace window is
    /// open. No inline gateway charge is made here.
    async fn retry_payment_failures(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payment_failures
            SET retry_count = retry_count + 1, last_retry_at = ?
            WHERE retry_count < ?
              AND grace_end_date > ?
              AND (last_retry_at IS NULL OR last_retry_at <= ?)
            "#,
        )
        .bind(now)
        .bind(MAX_PAYMENT_RETRIES)
        .bind(now)
        .bind(now - Duration::days(RETRY_SPACING_DAYS))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Pending orders with no confirmation after 24 hours are expired.
    async fn expire_stale_orders(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE pending_orders SET status = 'expired' WHERE status = 'pending' AND created_at < ?",
        )
        .bind(now - Duration::hours(PENDING_ORDER_TTL_HOURS))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// First-of-month renewal invoices for active non-VIP subscriptions,
    /// at most one per user per cycle.
    async fn generate_renewal_invoices(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let cycle = now
            .format(format_description!("[year][month]"))
            .unwrap_or_default();
        let payment_ref = format!("monthly_{cycle}");

        let active: Vec<(i64, String)> = sqlx::query_as(
            "SELECT user_id, plan_id FROM subscriptions WHERE status = 'active'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut generated = 0u64;
        for (user_id, plan_id) in active {
            // VIP grants never renew and never invoice.
            if PlanCatalog::is_vip_plan(&plan_id) {
                continue;
            }
            if self.invoices.exists_for_ref(user_id, &payment_ref).await? {
                continue;
            }
            let Some(plan) = self.plans.get(&plan_id) else {
                tracing::warn!(user_id = user_id, plan_id = %plan_id, "Unknown plan on renewal; skipping");
                continue;
            };
            self.invoices
                .create(user_id, plan.id, plan.price_cents, &payment_ref, now)
                .await?;
            generated += 1;
        }

        Ok(generated)
    }

    /// Purge old webhook payloads (daily job).
    pub async fn cleanup_webhook_log(&self) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM webhook_log WHERE received_at < ?")
            .bind(utc_now() - Duration::days(WEBHOOK_LOG_RETENTION_DAYS))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::info!(deleted = result.rows_affected(), "Cleaned up old webhook log rows");
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::{AccessProvisioner, ServerCatalog};
    use crate::testutil::{count, ledger_with, seed_user};
    use crate::vip::NewVip;
    use time::macros::datetime;
    use truevault_shared::db::create_test_pool;

    fn maintenance_for(pool: &SqlitePool) -> MaintenanceService {
        let ledger = ledger_with(pool, "http://127.0.0.1:1");
        let vip = VipDirectory::new(pool.clone());
        let provisioner = AccessProvisioner::new(
            pool.clone(),
            ServerCatalog::new(vec![], "node-token"),
            vip.clone(),
        );
        MaintenanceService::new(
            pool.clone(),
            PlanCatalog::standard(),
            InvoiceService::new(pool.clone()),
            RevocationService::new(pool.clone(), provisioner),
            ledger,
            vip,
        )
    }

    #[tokio::test]
    async fn stale_pending_orders_expire_after_24h() {
        let pool = create_test_pool().await.unwrap();
        let maintenance = maintenance_for(&pool);
        let user_id = seed_user(&pool, "stale@example.com").await;
        let now = utc_now();

        sqlx::query(
            "INSERT INTO pending_orders (user_id, order_id, plan_id, amount_cents, status, created_at)
             VALUES (?, 'OLD-1', 'basic', 999, 'pending', ?), (?, 'NEW-1', 'basic', 999, 'pending', ?)",
        )
        .bind(user_id)
        .bind(now - Duration::hours(30))
        .bind(user_id)
        .bind(now - Duration::hours(2))
        .execute(&pool)
        .await
        .unwrap();

        let report = maintenance.run_sweep_at(now).await.unwrap();
        assert_eq!(report.stale_orders, 1);

        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM pending_orders WHERE order_id = 'OLD-1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "expired");
        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM pending_orders WHERE order_id = 'NEW-1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "pending");
    }

    #[tokio::test]
    async fn overdue_subscriptions_expire_but_vips_are_extended() {
        let pool = create_test_pool().await.unwrap();
        let maintenance = maintenance_for(&pool);
        let ledger = ledger_with(&pool, "http://127.0.0.1:1");

        let payer = seed_user(&pool, "payer@example.com").await;
        let vip_user = seed_user(&pool, "vip@example.com").await;
        maintenance.vip.add(NewVip::basic("vip@example.com")).await.unwrap();

        for id in [payer, vip_user] {
            let user = ledger.find_user(id).await.unwrap();
            ledger.activate_subscription(&user, "family", None).await.unwrap();
        }

        // Both subscriptions are now past their end date.
        let later = utc_now() + Duration::days(40);
        let report = maintenance.run_sweep_at(later).await.unwrap();
        assert_eq!(report.expired_subscriptions, 1);
        assert_eq!(report.vip_extensions, 1);

        let (payer_status,): (String,) = sqlx::query_as(
            "SELECT status FROM subscriptions WHERE user_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(payer)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(payer_status, "expired");

        // Expiry schedules an immediate revocation; the next sweep suspends.
        assert_eq!(
            count(
                &pool,
                "SELECT COUNT(*) FROM scheduled_revocations WHERE user_id = ? AND status = 'pending'",
                payer
            )
            .await,
            1
        );

        let (vip_status, vip_end): (String, OffsetDateTime) = sqlx::query_as(
            "SELECT status, end_date FROM subscriptions WHERE user_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(vip_user)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(vip_status, "active");
        assert!(vip_end > later + Duration::days(365 * 99));
    }

    #[tokio::test]
    async fn expiry_warning_flag_is_set_once() {
        let pool = create_test_pool().await.unwrap();
        let maintenance = maintenance_for(&pool);
        let ledger = ledger_with(&pool, "http://127.0.0.1:1");
        let user_id = seed_user(&pool, "warn@example.com").await;
        let user = ledger.find_user(user_id).await.unwrap();
        ledger.activate_subscription(&user, "family", None).await.unwrap();

        // Inside the 7-day warning window.
        let sub: (OffsetDateTime,) = sqlx::query_as(
            "SELECT end_date FROM subscriptions WHERE user_id = ? AND status = 'active'",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        let close_to_expiry = sub.0 - Duration::days(5);

        let first = maintenance.run_sweep_at(close_to_expiry).await.unwrap();
        assert_eq!(first.expiry_warnings, 1);

        let second = maintenance.run_sweep_at(close_to_expiry).await.unwrap();
        assert_eq!(second.expiry_warnings, 0);
    }

    #[tokio::test]
    async fn payment_retries_are_bounded_and_spaced() {
        let pool = create_test_pool().await.unwrap();
        let maintenance = maintenance_for(&pool);
        let ledger = ledger_with(&pool, "http://127.0.0.1:1");
        let user_id = seed_user(&pool, "retry@example.com").await;
        let user = ledger.find_user(user_id).await.unwrap();
        ledger.activate_subscription(&user, "family", None).await.unwrap();

        let t0 = utc_now();
        ledger.handle_payment_failure_at(user_id, t0).await.unwrap();

        // First retry fires immediately; a second on the same day does not.
        assert_eq!(maintenance.run_sweep_at(t0).await.unwrap().payment_retries, 1);
        assert_eq!(
            maintenance
                .run_sweep_at(t0 + Duration::days(1))
                .await
                .unwrap()
                .payment_retries,
            0
        );
        // Spaced three days apart, still inside the 7-day grace window.
        assert_eq!(
            maintenance
                .run_sweep_at(t0 + Duration::days(3))
                .await
                .unwrap()
                .payment_retries,
            1
        );
        assert_eq!(
            maintenance
                .run_sweep_at(t0 + Duration::days(6))
                .await
                .unwrap()
                .payment_retries,
            1
        );

        // Attempt cap reached; nothing further even when spacing allows.
        let (retries,): (i64,) =
            sqlx::query_as("SELECT retry_count FROM payment_failures WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(retries, 3);
    }

    async fn seed_subscription(
        pool: &SqlitePool,
        user_id: i64,
        plan_id: &str,
        end_date: OffsetDateTime,
    ) {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, status, max_devices, max_cameras, start_date, end_date, created_at)
            VALUES (?, ?, 'active', 5, 2, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(end_date - Duration::days(30))
        .bind(end_date)
        .bind(end_date - Duration::days(30))
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn renewal_invoices_run_once_per_cycle_and_skip_vip_plans() {
        let pool = create_test_pool().await.unwrap();
        let maintenance = maintenance_for(&pool);

        let payer = seed_user(&pool, "payer@example.com").await;
        let vip_user = seed_user(&pool, "vip@example.com").await;
        maintenance.vip.add(NewVip::basic("vip@example.com")).await.unwrap();

        let first_of_month = datetime!(2026-09-01 04:00:00 UTC);
        // Dates pinned to the sweep time so neither row is overdue on the 1st.
        seed_subscription(&pool, payer, "family", first_of_month + Duration::days(12)).await;
        seed_subscription(&pool, vip_user, "vip_basic", first_of_month + Duration::days(365)).await;
        let report = maintenance.run_sweep_at(first_of_month).await.unwrap();
        assert_eq!(report.renewal_invoices, 1);

        // Re-running the same day generates nothing further.
        let again = maintenance.run_sweep_at(first_of_month).await.unwrap();
        assert_eq!(again.renewal_invoices, 0);

        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM invoices WHERE user_id = ?", payer).await,
            1
        );
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM invoices WHERE user_id = ?", vip_user).await,
            0
        );
        let (payment_ref,): (Option<String>,) =
            sqlx::query_as("SELECT payment_ref FROM invoices WHERE user_id = ?")
                .bind(payer)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(payment_ref.as_deref(), Some("monthly_202609"));
    }

    #[tokio::test]
    async fn webhook_log_cleanup_respects_retention() {
        let pool = create_test_pool().await.unwrap();
        let maintenance = maintenance_for(&pool);
        let now = utc_now();

        sqlx::query(
            "INSERT INTO webhook_log (transmission_id, payload, received_at) VALUES
             ('old', '{}', ?), ('fresh', '{}', ?)",
        )
        .bind(now - Duration::days(45))
        .bind(now - Duration::days(2))
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(maintenance.cleanup_webhook_log().await.unwrap(), 1);
        let (remaining,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM webhook_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
