//! VIP override directory
//!
//! Email-keyed bypass list consulted before any payment-gateway interaction.
//! Lookups are a single indexed query on the lower-cased email. `owner`
//! entries can never be removed.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::{BillingError, BillingResult};
use truevault_shared::clock::utc_now;
use truevault_shared::types::VipTier;

/// A VIP directory entry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct VipEntry {
    pub id: i64,
    pub email: String,
    pub tier: VipTier,
    pub plan_id: String,
    pub max_devices: i64,
    pub max_cameras: i64,
    pub dedicated_server_id: Option<i64>,
    pub description: Option<String>,
}

/// Fields accepted when adding or updating an entry.
#[derive(Debug, Clone)]
pub struct NewVip {
    pub email: String,
    pub tier: VipTier,
    pub plan_id: String,
    pub max_devices: i64,
    pub max_cameras: i64,
    pub dedicated_server_id: Option<i64>,
    pub description: Option<String>,
}

impl NewVip {
    pub fn basic(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            tier: VipTier::VipBasic,
            plan_id: "family".to_string(),
            max_devices: 8,
            max_cameras: 2,
            dedicated_server_id: None,
            description: None,
        }
    }
}

/// VIP directory service
#[derive(Clone)]
pub struct VipDirectory {
    pool: SqlitePool,
}

impl VipDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn is_vip(&self, email: &str) -> BillingResult<bool> {
        Ok(self.get_details(email).await?.is_some())
    }

    pub async fn get_details(&self, email: &str) -> BillingResult<Option<VipEntry>> {
        let entry = sqlx::query_as::<_, VipEntry>(
            r#"
            SELECT id, email, tier, plan_id, max_devices, max_cameras,
                   dedicated_server_id, description
            FROM vip_entries
            WHERE email = ?
            "#,
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    pub async fn list(&self) -> BillingResult<Vec<VipEntry>> {
        let entries = sqlx::query_as::<_, VipEntry>(
            r#"
            SELECT id, email, tier, plan_id, max_devices, max_cameras,
                   dedicated_server_id, description
            FROM vip_entries
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Add or overwrite an entry, keyed on the lower-cased email.
    pub async fn add(&self, vip: NewVip) -> BillingResult<i64> {
        let email = vip.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::InvalidInput(format!(
                "invalid email: {email:?}"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO vip_entries
                (email, tier, plan_id, max_devices, max_cameras,
                 dedicated_server_id, description, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (email) DO UPDATE SET
                tier = excluded.tier,
                plan_id = excluded.plan_id,
                max_devices = excluded.max_devices,
                max_cameras = excluded.max_cameras,
                dedicated_server_id = excluded.dedicated_server_id,
                description = excluded.description
            "#,
        )
        .bind(&email)
        .bind(vip.tier)
        .bind(&vip.plan_id)
        .bind(vip.max_devices)
        .bind(vip.max_cameras)
        .bind(vip.dedicated_server_id)
        .bind(&vip.description)
        .bind(utc_now())
        .execute(&self.pool)
        .await?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM vip_entries WHERE email = ?")
            .bind(&email)
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(email = %email, tier = %vip.tier.as_str(), "VIP entry added");
        Ok(id)
    }

    /// Remove an entry. Refuses for `owner` rows.
    pub async fn remove(&self, email: &str) -> BillingResult<()> {
        let email = email.trim().to_lowercase();
        let existing = self
            .get_details(&email)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("VIP entry {email}")))?;

        if existing.tier == VipTier::Owner {
            return Err(BillingError::OwnerImmutable);
        }

        sqlx::query("DELETE FROM vip_entries WHERE email = ? AND tier != 'owner'")
            .bind(&email)
            .execute(&self.pool)
            .await?;

        tracing::info!(email = %email, "VIP entry removed");
        Ok(())
    }

    /// Upsert the irrevocable owner entry at startup.
    pub async fn ensure_owner(&self, email: &str) -> BillingResult<()> {
        self.add(NewVip {
            email: email.to_string(),
            tier: VipTier::Owner,
            plan_id: "dedicated".to_string(),
            max_devices: 999,
            max_cameras: 999,
            dedicated_server_id: None,
            description: Some("Owner - full access".to_string()),
        })
        .await?;
        Ok(())
    }
}
