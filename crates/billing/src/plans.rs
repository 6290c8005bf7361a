//! Plan catalog
//!
//! The fixed plan table, constructed once at startup and injected into the
//! services that need it. Prices are integer cents.

use crate::error::{BillingError, BillingResult};

/// A purchasable plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    pub price_cents: i64,
    pub max_devices: i64,
    pub max_cameras: i64,
}

impl Plan {
    /// Price formatted as a decimal USD string for the payment provider
    /// (`1497` -> `"14.97"`).
    pub fn price_usd(&self) -> String {
        format!("{}.{:02}", self.price_cents / 100, self.price_cents % 100)
    }
}

/// The fixed plan table.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn standard() -> Self {
        Self {
            plans: vec![
                Plan {
                    id: "basic",
                    name: "Basic",
                    price_cents: 999,
                    max_devices: 3,
                    max_cameras: 1,
                },
                Plan {
                    id: "family",
                    name: "Family",
                    price_cents: 1497,
                    max_devices: 5,
                    max_cameras: 2,
                },
                Plan {
                    id: "dedicated",
                    name: "Dedicated",
                    price_cents: 2999,
                    max_devices: 999,
                    max_cameras: 12,
                },
                // Discounted dedicated upgrade, only reachable by VIPs.
                Plan {
                    id: "vip_upgrade",
                    name: "VIP Dedicated Upgrade",
                    price_cents: 997,
                    max_devices: 999,
                    max_cameras: 12,
                },
            ],
        }
    }

    pub fn get(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    pub fn require(&self, plan_id: &str) -> BillingResult<&Plan> {
        self.get(plan_id)
            .ok_or_else(|| BillingError::InvalidPlan(plan_id.to_string()))
    }

    pub fn all(&self) -> &[Plan] {
        &self.plans
    }

    /// Plan identifiers recorded for VIP grants; these never renew and never
    /// appear on monthly invoices.
    pub fn is_vip_plan(plan_id: &str) -> bool {
        matches!(plan_id, "owner" | "vip_dedicated" | "vip_basic")
    }
}
