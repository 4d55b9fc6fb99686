use crate::catalog::Plan;
use crate::error::{AppError, AppResult};
use crate::types::{PaymentGateway, PurchaseStatus};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable copy of the commercial terms a purchase was made under. Stored
/// as JSON in the purchase row; later price/limit computations read this,
/// never the live plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan_id: String,
    pub name: String,
    pub feature_key: String,
    pub feature_name: String,
    pub price_cents: i64,
    pub duration_days: i64,
    pub one_time: bool,
    pub request_limit: i64,
}

impl PlanSnapshot {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            plan_id: plan.id.clone(),
            name: plan.name.clone(),
            feature_key: plan.feature_key.clone(),
            feature_name: plan.feature_name.clone(),
            price_cents: plan.price_cents,
            duration_days: plan.duration_days,
            one_time: plan.one_time,
            request_limit: plan.request_limit,
        }
    }

    /// Expiry for a purchase activated at `from`. One-time and lifetime
    /// plans (duration 0) never expire.
    pub fn expiry_from(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        if self.one_time || self.duration_days <= 0 {
            None
        } else {
            Some(from + chrono::Duration::days(self.duration_days))
        }
    }
}

#[derive(Queryable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = crate::schema::purchases)]
pub struct Purchase {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub feature_key: String,
    pub plan_snapshot: String,
    pub amount_paid: Option<i64>,
    pub payment_gateway: PaymentGateway,
    pub transaction_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub status: PurchaseStatus,
    pub purchase_date: NaiveDateTime,
    pub expiry_date: Option<NaiveDateTime>,
    pub failure_reason: Option<String>,
    pub failure_at: Option<NaiveDateTime>,
    pub switch_pending: bool,
    pub pending_switch_plan_id: Option<String>,
    pub auto_renew: bool,
}

impl Purchase {
    /// A fresh draft: intent recorded, no authorization yet.
    pub fn new_draft(
        user_id: String,
        plan: &Plan,
        gateway: PaymentGateway,
        auto_renew: bool,
    ) -> AppResult<Self> {
        let snapshot = PlanSnapshot::from_plan(plan);
        let snapshot_json = serde_json::to_string(&snapshot)
            .map_err(|e| AppError::Internal(format!("failed to serialize plan snapshot: {}", e)))?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            plan_id: plan.id.clone(),
            feature_key: plan.feature_key.clone(),
            plan_snapshot: snapshot_json,
            amount_paid: None,
            payment_gateway: gateway,
            transaction_id: None,
            payment_intent_id: None,
            status: PurchaseStatus::Draft,
            purchase_date: chrono::Utc::now().naive_utc(),
            expiry_date: None,
            failure_reason: None,
            failure_at: None,
            switch_pending: false,
            pending_switch_plan_id: None,
            auto_renew,
        })
    }

    pub fn snapshot(&self) -> AppResult<PlanSnapshot> {
        serde_json::from_str(&self.plan_snapshot)
            .map_err(|e| AppError::Internal(format!("corrupt plan snapshot: {}", e)))
    }
}
