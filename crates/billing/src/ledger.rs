//! Subscription ledger
//!
//! The single source of truth for "is this user entitled to VPN access right
//! now", and the orchestrator of every billing state transition. The VIP
//! directory is consulted before any payment-gateway interaction; access
//! provisioning is enacted best-effort after the billing write lands.

use serde::Serialize;
use sqlx::SqlitePool;
use time::{Duration, OffsetDateTime};

use crate::client::PayPalClient;
use crate::error::{BillingError, BillingResult};
use crate::invoices::InvoiceService;
use crate::plans::PlanCatalog;
use crate::provisioning::AccessProvisioner;
use crate::vip::{VipDirectory, VipEntry};
use truevault_shared::clock::{plus_one_month, plus_years, utc_now};
use truevault_shared::types::{OrderStatus, SubscriptionStatus, UserStatus, VipTier};

/// Fixed grace window after a payment failure.
pub const GRACE_PERIOD_DAYS: i64 = 7;

/// An identity record. Owned by the identity subsystem; the ledger only ever
/// updates `status` and `plan_type`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub status: UserStatus,
    pub plan_type: Option<String>,
}

/// One row of the append-only subscription history.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub payment_ref: Option<String>,
    pub max_devices: i64,
    pub max_cameras: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancel_reason: Option<String>,
}

/// Result of a checkout request.
#[derive(Debug, Clone)]
pub enum CheckoutOutcome {
    /// VIP bypass: subscription activated directly, no payment required.
    VipActivated,
    /// Order created; the user must approve it at the payment provider.
    Redirect {
        order_id: String,
        approval_url: Option<String>,
    },
}

/// Result of a capture attempt. `AlreadyProcessed` is the duplicate-delivery
/// defense: it is a success with no side effects.
#[derive(Debug, Clone)]
pub enum CaptureResult {
    Completed { invoice_number: String },
    AlreadyProcessed,
    Failed { provider_status: String },
}

/// Result of a cancellation: access continues until the recorded end date.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub access_until: OffsetDateTime,
}

/// Subscription ledger service
#[derive(Clone)]
pub struct SubscriptionLedger {
    pool: SqlitePool,
    gateway: PayPalClient,
    plans: PlanCatalog,
    vip: VipDirectory,
    provisioner: AccessProvisioner,
    invoices: InvoiceService,
}

impl SubscriptionLedger {
    pub fn new(
        pool: SqlitePool,
        gateway: PayPalClient,
        plans: PlanCatalog,
        vip: VipDirectory,
        provisioner: AccessProvisioner,
        invoices: InvoiceService,
    ) -> Self {
        Self {
            pool,
            gateway,
            plans,
            vip,
            provisioner,
            invoices,
        }
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    pub async fn find_user(&self, user_id: i64) -> BillingResult<User> {
        sqlx::query_as::<_, User>("SELECT id, email, status, plan_type FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))
    }

    pub async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, status, plan_type FROM users WHERE LOWER(email) = ?",
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// The user's single `active` subscription row, if any.
    pub async fn active_subscription(&self, user_id: i64) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, user_id, plan_id, status, payment_ref, max_devices, max_cameras,
                   start_date, end_date, cancelled_at, cancel_reason
            FROM subscriptions
            WHERE user_id = ? AND status = 'active'
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Most recent subscription still conferring access (active or
    /// cancelled-but-not-expired), for dashboard views.
    pub async fn current_subscription(&self, user_id: i64) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, user_id, plan_id, status, payment_ref, max_devices, max_cameras,
                   start_date, end_date, cancelled_at, cancel_reason
            FROM subscriptions
            WHERE user_id = ? AND status IN ('active', 'cancelled')
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Start a checkout for a plan.
    ///
    /// `vip_basic` users short-circuit to a direct activation with no payment
    /// unless they are buying the dedicated upgrade.
    pub async fn create_checkout(
        &self,
        user_id: i64,
        plan_id: &str,
    ) -> BillingResult<CheckoutOutcome> {
        let user = self.find_user(user_id).await?;
        let plan = self.plans.require(plan_id)?;

        if let Some(vip) = self.vip.get_details(&user.email).await? {
            if vip.tier == VipTier::VipBasic && plan_id != "vip_upgrade" {
                self.grant_vip(&user, &vip).await?;
                self.provision_best_effort(&user).await;
                tracing::info!(user_id = user.id, "VIP checkout bypass - no payment required");
                return Ok(CheckoutOutcome::VipActivated);
            }
        }

        let order = self.gateway.create_order(user.id, &user.email, plan).await?;

        sqlx::query(
            r#"
            INSERT INTO pending_orders (user_id, order_id, plan_id, amount_cents, status, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(user.id)
        .bind(&order.order_id)
        .bind(plan.id)
        .bind(plan.price_cents)
        .bind(utc_now())
        .execute(&self.pool)
        .await?;

        Ok(CheckoutOutcome::Redirect {
            order_id: order.order_id,
            approval_url: order.approval_url,
        })
    }

    /// Capture a pending order and activate the paid subscription.
    ///
    /// Idempotent: an order id with no `pending` row (unknown, or already
    /// processed by an earlier delivery) is a no-op success. This is the
    /// primary defense against duplicate webhook delivery.
    pub async fn complete_payment(&self, order_id: &str) -> BillingResult<CaptureResult> {
        let order: Option<(i64, String, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, plan_id, amount_cents
            FROM pending_orders
            WHERE order_id = ? AND status = ?
            "#,
        )
        .bind(order_id)
        .bind(OrderStatus::Pending)
        .fetch_optional(&self.pool)
        .await?;

        let Some((user_id, plan_id, amount_cents)) = order else {
            tracing::info!(order_id = %order_id, "No pending order; treating as duplicate delivery");
            return Ok(CaptureResult::AlreadyProcessed);
        };

        let capture = self.gateway.capture_order(order_id).await?;
        let now = utc_now();

        if !capture.completed {
            sqlx::query("UPDATE pending_orders SET status = ? WHERE order_id = ? AND status = ?")
                .bind(OrderStatus::Failed)
                .bind(order_id)
                .bind(OrderStatus::Pending)
                .execute(&self.pool)
                .await?;
            tracing::warn!(
                order_id = %order_id,
                provider_status = %capture.provider_status,
                "Capture did not complete; no access granted"
            );
            return Ok(CaptureResult::Failed {
                provider_status: capture.provider_status,
            });
        }

        // Atomically claim the pending -> completed transition; a lost race
        // means another delivery finished the work.
        let claimed = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = ?, completed_at = ?
            WHERE order_id = ? AND status = ?
            "#,
        )
        .bind(OrderStatus::Completed)
        .bind(now)
        .bind(order_id)
        .bind(OrderStatus::Pending)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 0 {
            return Ok(CaptureResult::AlreadyProcessed);
        }

        let invoice_number = self
            .invoices
            .create(user_id, &plan_id, amount_cents, order_id, now)
            .await?;

        let user = self.find_user(user_id).await?;
        self.activate_subscription(&user, &plan_id, Some(order_id))
            .await?;
        self.provision_best_effort(&user).await;

        tracing::info!(
            order_id = %order_id,
            user_id = user_id,
            invoice_number = %invoice_number,
            "Payment captured and subscription activated"
        );

        Ok(CaptureResult::Completed { invoice_number })
    }

    /// Supersede any current `active` row and insert a fresh one with end
    /// date one renewal interval out.
    pub async fn activate_subscription(
        &self,
        user: &User,
        plan_id: &str,
        payment_ref: Option<&str>,
    ) -> BillingResult<()> {
        let plan = self.plans.require(plan_id)?;
        let now = utc_now();
        self.activate_grant(
            user,
            plan.id,
            plan.max_devices,
            plan.max_cameras,
            plus_one_month(now),
            payment_ref,
            now,
        )
        .await
    }

    /// Synthesize a never-expiring subscription for a VIP entry without
    /// touching the payment gateway.
    pub async fn grant_vip(&self, user: &User, entry: &VipEntry) -> BillingResult<()> {
        let now = utc_now();
        self.activate_grant(
            user,
            entry.tier.as_str(),
            entry.max_devices,
            entry.max_cameras,
            plus_years(now, 100),
            None,
            now,
        )
        .await
    }

    async fn activate_grant(
        &self,
        user: &User,
        plan_id: &str,
        max_devices: i64,
        max_cameras: i64,
        end_date: OffsetDateTime,
        payment_ref: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        if let Some(current) = self.active_subscription(user.id).await? {
            ensure_transition(current.status, SubscriptionStatus::Superseded)?;
        }

        sqlx::query(
            "UPDATE subscriptions SET status = 'superseded' WHERE user_id = ? AND status = 'active'",
        )
        .bind(user.id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, status, payment_ref, max_devices, max_cameras,
                 start_date, end_date, created_at)
            VALUES (?, ?, 'active', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.id)
        .bind(plan_id)
        .bind(payment_ref)
        .bind(max_devices)
        .bind(max_cameras)
        .bind(now)
        .bind(end_date)
        .bind(now)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE users SET plan_type = ?, status = 'active' WHERE id = ?")
            .bind(plan_id)
            .bind(user.id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            user_id = user.id,
            plan_id = %plan_id,
            end_date = %end_date,
            "Subscription activated"
        );
        Ok(())
    }

    /// Mark the active subscription non-renewing. Access continues until the
    /// recorded end date; revocation is scheduled for then, not performed now.
    pub async fn cancel_subscription(
        &self,
        user_id: i64,
        reason: Option<&str>,
    ) -> BillingResult<CancelOutcome> {
        let sub = self
            .active_subscription(user_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(user_id))?;

        ensure_transition(sub.status, SubscriptionStatus::Cancelled)?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', cancelled_at = ?, cancel_reason = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(utc_now())
        .bind(reason)
        .bind(sub.id)
        .execute(&self.pool)
        .await?;

        self.schedule_access_revocation(user_id, sub.end_date)
            .await?;

        tracing::info!(
            user_id = user_id,
            access_until = %sub.end_date,
            reason = reason.unwrap_or("-"),
            "Subscription cancelled (non-renewing)"
        );

        Ok(CancelOutcome {
            access_until: sub.end_date,
        })
    }

    /// Record a payment failure and open the grace window. VIPs never lose
    /// access through payment failure; for them this is a no-op.
    pub async fn handle_payment_failure(&self, user_id: i64) -> BillingResult<()> {
        self.handle_payment_failure_at(user_id, utc_now()).await
    }

    pub async fn handle_payment_failure_at(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let user = self.find_user(user_id).await?;

        if self.vip.is_vip(&user.email).await? {
            tracing::info!(user_id = user_id, "Payment failure ignored for VIP");
            return Ok(());
        }

        if let Some(sub) = self.active_subscription(user_id).await? {
            ensure_transition(sub.status, SubscriptionStatus::PaymentFailed)?;
            sqlx::query(
                "UPDATE subscriptions SET status = 'payment_failed' WHERE id = ? AND status = 'active'",
            )
            .bind(sub.id)
            .execute(&self.pool)
            .await?;
        }

        let grace_end = now + Duration::days(GRACE_PERIOD_DAYS);

        sqlx::query(
            r#"
            INSERT INTO payment_failures (user_id, failure_date, grace_end_date, retry_count)
            VALUES (?, ?, ?, 0)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(grace_end)
        .execute(&self.pool)
        .await?;

        self.schedule_access_revocation(user_id, grace_end).await?;

        tracing::warn!(
            user_id = user_id,
            grace_end = %grace_end,
            "Payment failure recorded; grace period opened"
        );
        Ok(())
    }

    /// Upsert the single outstanding revocation for a user. Last writer wins:
    /// a renewed cancellation date overwrites an older one.
    pub async fn schedule_access_revocation(
        &self,
        user_id: i64,
        revoke_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_revocations (user_id, revoke_at, status)
            VALUES (?, ?, 'pending')
            ON CONFLICT (user_id) DO UPDATE SET
                revoke_at = excluded.revoke_at,
                status = 'pending',
                completed_at = NULL
            "#,
        )
        .bind(user_id)
        .bind(revoke_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = user_id, revoke_at = %revoke_at, "Access revocation scheduled");
        Ok(())
    }

    pub async fn set_user_status(&self, user_id: i64, status: UserStatus) -> BillingResult<()> {
        sqlx::query("UPDATE users SET status = ? WHERE id = ?")
            .bind(status)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Provisioning is best-effort relative to billing truth; its failures
    /// are logged and never unwind the billing write that triggered it.
    async fn provision_best_effort(&self, user: &User) {
        if let Err(e) = self.provisioner.provision(user.id, &user.email).await {
            tracing::error!(user_id = user.id, error = %e, "Provisioning failed after billing write");
        }
    }
}

fn ensure_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> BillingResult<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        tracing::error!(from = from.as_str(), to = to.as_str(), "Rejected status transition");
        Err(BillingError::InvalidTransition(
            from.as_str().to_string(),
            to.as_str().to_string(),
        ))
    }
}
