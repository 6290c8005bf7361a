//! Billing routes: checkout, capture, cancel, subscription views, and the
//! PayPal webhook endpoint.

use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;

use truevault_billing::{
    BillingError, CaptureResult, CheckoutOutcome, Invoice, Subscription, WebhookMeta,
};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Request to start a checkout
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: String,
}

/// Response from starting a checkout
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub vip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let outcome = state
        .billing
        .ledger
        .create_checkout(user.id, &req.plan_id)
        .await?;

    Ok(Json(match outcome {
        CheckoutOutcome::VipActivated => CheckoutResponse {
            success: true,
            order_id: None,
            approval_url: None,
            vip: true,
            message: Some("VIP access activated - no payment required".to_string()),
        },
        CheckoutOutcome::Redirect {
            order_id,
            approval_url,
        } => CheckoutResponse {
            success: true,
            order_id: Some(order_id),
            approval_url,
            vip: false,
            message: None,
        },
    }))
}

/// Request to complete a payment after approval
#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub order_id: String,
}

#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
}

pub async fn capture_payment(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<CaptureRequest>,
) -> ApiResult<Json<CaptureResponse>> {
    match state.billing.ledger.complete_payment(&req.order_id).await? {
        CaptureResult::Completed { invoice_number } => Ok(Json(CaptureResponse {
            success: true,
            message: "Payment completed".to_string(),
            invoice_id: Some(invoice_number),
        })),
        CaptureResult::AlreadyProcessed => Ok(Json(CaptureResponse {
            success: true,
            message: "Order already processed".to_string(),
            invoice_id: None,
        })),
        CaptureResult::Failed { provider_status } => Err(ApiError::BadRequest(format!(
            "Payment capture failed ({provider_status})"
        ))),
    }
}

/// Request to cancel the active subscription
#[derive(Debug, Deserialize, Default)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<CancelResponse>> {
    let reason = body.and_then(|Json(req)| req.reason);
    let outcome = state
        .billing
        .ledger
        .cancel_subscription(user.id, reason.as_deref())
        .await?;

    let until = outcome
        .access_until
        .format(&Rfc3339)
        .unwrap_or_else(|_| outcome.access_until.to_string());

    Ok(Json(CancelResponse {
        success: true,
        message: format!("Subscription cancelled. Access continues until {until}"),
    }))
}

/// Current subscription view. VIP users get a synthesized always-active view
/// instead of a ledger row.
#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub success: bool,
    pub is_vip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_devices: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cameras: Option<i64>,
    pub bypass_payment: bool,
}

pub async fn get_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<SubscriptionView>> {
    let account = state.billing.ledger.find_user(user.id).await?;

    if let Some(vip) = state.billing.vip.get_details(&account.email).await? {
        return Ok(Json(SubscriptionView {
            success: true,
            is_vip: true,
            subscription: None,
            plan_type: Some(vip.tier.as_str().to_string()),
            max_devices: Some(vip.max_devices),
            max_cameras: Some(vip.max_cameras),
            bypass_payment: true,
        }));
    }

    let subscription = state.billing.ledger.current_subscription(user.id).await?;
    let plan_type = subscription.as_ref().map(|s| s.plan_id.clone());
    Ok(Json(SubscriptionView {
        success: true,
        is_vip: false,
        subscription,
        plan_type,
        max_devices: None,
        max_cameras: None,
        bypass_payment: false,
    }))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub invoices: Vec<Invoice>,
}

pub async fn get_history(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<HistoryResponse>> {
    let invoices = state.billing.invoices.history(user.id).await?;
    Ok(Json(HistoryResponse {
        success: true,
        invoices,
    }))
}

/// Handle PayPal webhook events.
///
/// 200 `{"status":"processed"}` for any authentically-signed event, even when
/// internal processing failed; 400 for malformed deliveries; 403 when the
/// signature does not verify.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let meta = WebhookMeta {
        transmission_id: required_header(&headers, "paypal-transmission-id")?,
        transmission_time: required_header(&headers, "paypal-transmission-time")?,
        signature: required_header(&headers, "paypal-transmission-sig")?,
    };

    tracing::info!(
        transmission_id = %meta.transmission_id,
        body_len = body.len(),
        "PayPal webhook received"
    );

    state
        .billing
        .webhooks
        .handle_delivery(&meta, &body)
        .await
        .map_err(|e| match e {
            BillingError::SignatureInvalid => ApiError::SignatureInvalid,
            BillingError::MalformedEvent(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        })?;

    Ok(Json(json!({ "status": "processed" })))
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {name} header")))
}
