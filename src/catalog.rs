use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Commercial terms for one plan. Owned by the catalog collaborator; this
/// service only reads them to populate the purchase snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub feature_key: String,
    pub feature_name: String,
    pub price_cents: i64,
    /// 0 means the plan never expires (lifetime / one-time).
    pub duration_days: i64,
    #[serde(default)]
    pub one_time: bool,
    #[serde(default)]
    pub request_limit: i64,
}

/// Read-only view of the plan catalog, loaded once at startup from the
/// `PLAN_CATALOG_JSON` environment variable (a JSON array of plans).
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    plans: HashMap<String, Plan>,
}

impl Catalog {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let raw = env::var("PLAN_CATALOG_JSON")
            .map_err(|_| "PLAN_CATALOG_JSON environment variable must be set")?;
        let plans: Vec<Plan> = serde_json::from_str(&raw)?;
        Ok(Self::from_plans(plans))
    }

    pub fn from_plans(plans: Vec<Plan>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get_plan(&self, plan_id: &str) -> AppResult<&Plan> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| AppError::PlanNotFound(plan_id.to_string()))
    }
}
