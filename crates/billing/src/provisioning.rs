//! Access provisioning
//!
//! Translates "user is entitled to access" into per-server peer registrations
//! on the remote VPN nodes, and the reverse. Remote calls are best-effort
//! relative to billing truth: a node failure is logged and skipped, never
//! propagated to the billing operation that triggered it.

use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::client::REMOTE_TIMEOUT;
use crate::error::{BillingError, BillingResult};
use crate::vip::{VipDirectory, VipEntry};
use truevault_shared::clock::utc_now;
use truevault_shared::types::{GrantStatus, VipTier};

/// One VPN node in the fixed server table.
#[derive(Debug, Clone)]
pub struct VpnServer {
    pub id: i64,
    pub name: String,
    /// Node control API base, e.g. `http://203.0.113.10:8080`.
    pub base_url: String,
    /// When set, only this email (or an owner VIP, or the VIP assigned to
    /// this server) may be provisioned here.
    pub restricted_to: Option<String>,
}

/// The fixed server table plus the shared node API token.
#[derive(Debug, Clone)]
pub struct ServerCatalog {
    servers: Vec<VpnServer>,
    api_token: String,
}

impl ServerCatalog {
    pub fn new(servers: Vec<VpnServer>, api_token: impl Into<String>) -> Self {
        Self {
            servers,
            api_token: api_token.into(),
        }
    }

    /// Catalog from environment variables; URLs default to the production
    /// node addresses.
    pub fn from_env() -> BillingResult<Self> {
        let api_token = std::env::var("VPN_NODE_TOKEN")
            .map_err(|_| BillingError::Config("VPN_NODE_TOKEN not set".to_string()))?;
        let url = |var: &str, default: &str| {
            std::env::var(var).unwrap_or_else(|_| default.to_string())
        };
        Ok(Self::new(
            vec![
                VpnServer {
                    id: 1,
                    name: "New York".to_string(),
                    base_url: url("VPN_NODE_NY_URL", "http://203.0.113.10:8080"),
                    restricted_to: None,
                },
                VpnServer {
                    id: 2,
                    name: "St. Louis".to_string(),
                    base_url: url("VPN_NODE_STL_URL", "http://203.0.113.20:8080"),
                    restricted_to: std::env::var("VPN_NODE_STL_RESERVED_EMAIL").ok(),
                },
                VpnServer {
                    id: 3,
                    name: "Dallas".to_string(),
                    base_url: url("VPN_NODE_TX_URL", "http://203.0.113.30:8080"),
                    restricted_to: None,
                },
                VpnServer {
                    id: 4,
                    name: "Toronto".to_string(),
                    base_url: url("VPN_NODE_CA_URL", "http://203.0.113.40:8080"),
                    restricted_to: None,
                },
            ],
            api_token,
        ))
    }

    pub fn all(&self) -> &[VpnServer] {
        &self.servers
    }

    /// Servers a user may be provisioned on. Owner VIPs see everything;
    /// dedicated VIPs additionally see their assigned server; a restricted
    /// server is otherwise visible only to its named email.
    pub fn accessible_for<'a>(
        &'a self,
        email: &str,
        vip: Option<&VipEntry>,
    ) -> Vec<&'a VpnServer> {
        let email = email.trim().to_lowercase();
        self.servers
            .iter()
            .filter(|server| match &server.restricted_to {
                None => true,
                Some(reserved) => match vip {
                    Some(v) if v.tier == VipTier::Owner => true,
                    Some(v) if v.dedicated_server_id == Some(server.id) => true,
                    _ => reserved.trim().to_lowercase() == email,
                },
            })
            .collect()
    }
}

/// Outcome counts for a provisioning pass. Partial success is success.
#[derive(Debug, Clone, Default)]
pub struct ProvisionSummary {
    pub granted: u32,
    pub failed: u32,
}

#[derive(Debug, Clone)]
struct KeyPair {
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct AddPeerResponse {
    #[serde(default)]
    success: bool,
    allowed_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemovePeerResponse {
    #[serde(default)]
    success: bool,
}

/// Access provisioner service
#[derive(Clone)]
pub struct AccessProvisioner {
    pool: SqlitePool,
    http: reqwest::Client,
    catalog: ServerCatalog,
    vip: VipDirectory,
}

impl AccessProvisioner {
    pub fn new(pool: SqlitePool, catalog: ServerCatalog, vip: VipDirectory) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            pool,
            http,
            catalog,
            vip,
        }
    }

    pub fn catalog(&self) -> &ServerCatalog {
        &self.catalog
    }

    /// Register the user's public key on every server they are entitled to.
    ///
    /// Per-server failures are independent; an unreachable node is logged and
    /// skipped. Billing state is never rolled back on a provisioning failure.
    pub async fn provision(&self, user_id: i64, email: &str) -> BillingResult<ProvisionSummary> {
        let vip = self.vip.get_details(email).await?;
        let key = self.ensure_keypair(user_id).await?;
        let servers = self.catalog.accessible_for(email, vip.as_ref());

        let mut summary = ProvisionSummary::default();
        for server in servers {
            match self.add_peer(server, &key.public_key, user_id).await {
                Ok(allowed_ip) => {
                    self.record_grant(user_id, server.id, &key.public_key, allowed_ip.as_deref())
                        .await?;
                    summary.granted += 1;
                }
                Err(reason) => {
                    tracing::warn!(
                        user_id = user_id,
                        server_id = server.id,
                        server = %server.name,
                        reason = %reason,
                        "add-peer failed; continuing with remaining servers"
                    );
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            user_id = user_id,
            granted = summary.granted,
            failed = summary.failed,
            "Provisioning pass complete"
        );
        Ok(summary)
    }

    /// Remove the user's peer from every server in the catalog and mark all
    /// grant rows revoked.
    ///
    /// Every catalog server is contacted, not just currently-granted ones, so
    /// cleanup succeeds even when grant rows are stale. No active key is a
    /// no-op.
    pub async fn revoke_all(&self, user_id: i64) -> BillingResult<()> {
        let key: Option<(String,)> = sqlx::query_as(
            "SELECT public_key FROM wireguard_keys WHERE user_id = ? AND status = 'active'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((public_key,)) = key else {
            return Ok(());
        };

        for server in self.catalog.all() {
            if let Err(reason) = self.remove_peer(server, &public_key).await {
                tracing::warn!(
                    user_id = user_id,
                    server_id = server.id,
                    server = %server.name,
                    reason = %reason,
                    "remove-peer failed; continuing with remaining servers"
                );
            }
        }

        sqlx::query(
            r#"
            UPDATE access_grants
            SET status = ?, revoked_at = ?
            WHERE user_id = ? AND status = ?
            "#,
        )
        .bind(GrantStatus::Revoked)
        .bind(utc_now())
        .bind(user_id)
        .bind(GrantStatus::Active)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = user_id, "All access grants revoked");
        Ok(())
    }

    /// Existing active keypair, or a freshly generated one. Keys are created
    /// once and reused; they are never regenerated implicitly.
    async fn ensure_keypair(&self, user_id: i64) -> BillingResult<KeyPair> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT public_key FROM wireguard_keys WHERE user_id = ? AND status = 'active'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((public_key,)) = existing {
            return Ok(KeyPair { public_key });
        }

        let (public_key, private_key) = generate_keypair();
        sqlx::query(
            r#"
            INSERT INTO wireguard_keys (user_id, public_key, private_key, status, created_at)
            VALUES (?, ?, ?, 'active', ?)
            "#,
        )
        .bind(user_id)
        .bind(&public_key)
        .bind(&private_key)
        .bind(utc_now())
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = user_id, "Generated WireGuard keypair");
        Ok(KeyPair { public_key })
    }

    async fn record_grant(
        &self,
        user_id: i64,
        server_id: i64,
        public_key: &str,
        assigned_ip: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO access_grants
                (user_id, server_id, public_key, assigned_ip, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, server_id) DO UPDATE SET
                public_key = excluded.public_key,
                assigned_ip = excluded.assigned_ip,
                status = excluded.status,
                revoked_at = NULL
            "#,
        )
        .bind(user_id)
        .bind(server_id)
        .bind(public_key)
        .bind(assigned_ip)
        .bind(GrantStatus::Active)
        .bind(utc_now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_peer(
        &self,
        server: &VpnServer,
        public_key: &str,
        user_id: i64,
    ) -> Result<Option<String>, String> {
        let response = self
            .http
            .post(format!("{}/peers/add", server.base_url))
            .bearer_auth(&self.catalog.api_token)
            .json(&json!({ "public_key": public_key, "user_id": user_id }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("node returned status {}", response.status()));
        }

        let body: AddPeerResponse = response.json().await.map_err(|e| e.to_string())?;
        if !body.success {
            return Err("node reported failure".to_string());
        }
        Ok(body.allowed_ip)
    }

    async fn remove_peer(&self, server: &VpnServer, public_key: &str) -> Result<(), String> {
        let response = self
            .http
            .post(format!("{}/peers/remove", server.base_url))
            .bearer_auth(&self.catalog.api_token)
            .json(&json!({ "public_key": public_key }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("node returned status {}", response.status()));
        }

        let body: RemovePeerResponse = response.json().await.map_err(|e| e.to_string())?;
        if !body.success {
            return Err("node reported failure".to_string());
        }
        Ok(())
    }
}

/// Generate a WireGuard-style keypair.
///
/// Key cryptography lives on the nodes; to the control plane both halves are
/// opaque base64 tokens, with the public key derived stably from the private
/// key so re-registration is idempotent.
fn generate_keypair() -> (String, String) {
    let mut private = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut private);
    private[0] &= 248;
    private[31] = (private[31] & 127) | 64;

    let engine = base64::engine::general_purpose::STANDARD;
    let public = Sha256::digest(private);
    (engine.encode(public), engine.encode(private))
}
