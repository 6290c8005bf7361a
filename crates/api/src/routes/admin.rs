//! Admin VIP management
//!
//! Bearer-token authenticated CRUD over the VIP directory. Adding a VIP whose
//! email already has an account immediately synthesizes a never-expiring
//! subscription; the checkout flow is never involved.

use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use truevault_billing::{NewVip, VipEntry};
use truevault_shared::types::VipTier;

use crate::auth::require_admin;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct VipListResponse {
    pub success: bool,
    pub vips: Vec<VipEntry>,
}

pub async fn list_vips(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<VipListResponse>> {
    require_admin(&headers, &state.config)?;
    let vips = state.billing.vip.list().await?;
    Ok(Json(VipListResponse {
        success: true,
        vips,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VipRequest {
    pub email: String,
    #[serde(rename = "type", default)]
    pub tier: Option<VipTier>,
    pub plan: Option<String>,
    pub max_devices: Option<i64>,
    pub max_cameras: Option<i64>,
    pub dedicated_server_id: Option<i64>,
    pub description: Option<String>,
}

impl VipRequest {
    fn into_new_vip(self) -> NewVip {
        let mut vip = NewVip::basic(self.email);
        if let Some(tier) = self.tier {
            vip.tier = tier;
        }
        if let Some(plan) = self.plan {
            vip.plan_id = plan;
        }
        if let Some(devices) = self.max_devices {
            vip.max_devices = devices;
        }
        if let Some(cameras) = self.max_cameras {
            vip.max_cameras = cameras;
        }
        vip.dedicated_server_id = self.dedicated_server_id;
        vip.description = self.description;
        vip
    }
}

pub async fn add_vip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VipRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&headers, &state.config)?;

    let email = req.email.trim().to_lowercase();
    let id = state.billing.vip.add(req.into_new_vip()).await?;

    // An existing account gets its never-expiring subscription right away.
    if let Some(user) = state.billing.ledger.find_user_by_email(&email).await? {
        let entry = state
            .billing
            .vip
            .get_details(&email)
            .await?
            .ok_or_else(|| ApiError::Internal("VIP entry vanished after insert".to_string()))?;
        state.billing.ledger.grant_vip(&user, &entry).await?;
        tracing::info!(email = %email, user_id = user.id, "VIP subscription synthesized");
    }

    Ok(Json(json!({
        "success": true,
        "id": id,
        "message": "VIP added successfully",
    })))
}

pub async fn update_vip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VipRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&headers, &state.config)?;

    let email = req.email.trim().to_lowercase();
    if state.billing.vip.get_details(&email).await?.is_none() {
        return Err(ApiError::NotFound(format!("VIP entry {email}")));
    }
    state.billing.vip.add(req.into_new_vip()).await?;

    Ok(Json(json!({
        "success": true,
        "message": "VIP updated successfully",
    })))
}

#[derive(Debug, Deserialize)]
pub struct VipRemoveRequest {
    pub email: String,
}

pub async fn remove_vip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VipRemoveRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&headers, &state.config)?;
    state.billing.vip.remove(&req.email).await?;
    Ok(Json(json!({
        "success": true,
        "message": "VIP removed successfully",
    })))
}
