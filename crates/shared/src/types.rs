//! Common types used across TrueVault
//!
//! Every lifecycle status is a closed enum with an explicit allowed-transition
//! table. Callers check `can_transition` before writing; a transition outside
//! the table is a logic error, not a storage concern.

use serde::{Deserialize, Serialize};

/// Account-level status, owned by the identity subsystem. The billing core
/// only ever writes `Active`, `Suspended`, and `Refunded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
    Refunded,
    Cancelled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Refunded => "refunded",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Subscription lifecycle status.
///
/// `(none) → active → {cancelled, payment_failed, superseded, expired}`.
/// Reactivation never mutates a terminal row; a fresh `active` row is
/// inserted and the old one superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    PaymentFailed,
    Superseded,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::PaymentFailed => "payment_failed",
            Self::Superseded => "superseded",
            Self::Expired => "expired",
        }
    }

    /// Allowed-transition table. Anything not listed is rejected by the
    /// ledger and logged.
    pub fn can_transition(self, to: Self) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, to),
            (Active, Cancelled)
                | (Active, PaymentFailed)
                | (Active, Superseded)
                | (Active, Expired)
                | (Cancelled, Superseded)
                | (PaymentFailed, Superseded)
                | (PaymentFailed, Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Superseded | Self::Expired)
    }
}

/// Pending checkout order status. `Completed`, `Failed`, and `Expired` are
/// terminal; an order never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Expired)
        )
    }
}

/// Scheduled revocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RevocationStatus {
    Pending,
    Cancelled,
    Completed,
}

impl RevocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

/// Per-(user, server) grant status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Active,
    Revoked,
}

/// VIP override tier.
///
/// `Owner` entries are irrevocable; `VipDedicated` carries an assigned
/// private server; `VipBasic` is shared servers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VipTier {
    Owner,
    VipDedicated,
    VipBasic,
}

impl VipTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::VipDedicated => "vip_dedicated",
            Self::VipBasic => "vip_basic",
        }
    }
}
