use diesel::deserialize::{self, FromSql};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, AsExpression, FromSqlRow, ToSchema,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Draft,
    PendingPayment,
    Active,
    Failed,
    Cancelled,
    Expired,
    Switched,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Draft => "draft",
            PurchaseStatus::PendingPayment => "pending_payment",
            PurchaseStatus::Active => "active",
            PurchaseStatus::Failed => "failed",
            PurchaseStatus::Cancelled => "cancelled",
            PurchaseStatus::Expired => "expired",
            PurchaseStatus::Switched => "switched",
        }
    }

    /// Whether a transition from `self` to `to` is an allowed edge.
    /// Re-asserting the current status is a no-op, not a transition.
    pub fn can_transition_to(self, to: PurchaseStatus) -> bool {
        use PurchaseStatus::*;
        matches!(
            (self, to),
            (Draft, PendingPayment)
                | (PendingPayment, Active)
                | (PendingPayment, Failed)
                | (Active, Cancelled)
                | (Active, Expired)
                | (Active, Switched)
                | (Active, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PurchaseStatus::Failed
                | PurchaseStatus::Cancelled
                | PurchaseStatus::Expired
                | PurchaseStatus::Switched
        )
    }
}

impl ToSql<Text, Sqlite> for PurchaseStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        <str as ToSql<Text, Sqlite>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Text, Sqlite> for PurchaseStatus {
    fn from_sql(
        bytes: <Sqlite as diesel::backend::Backend>::RawValue<'_>,
    ) -> deserialize::Result<Self> {
        let status_str = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        match status_str.as_str() {
            "draft" => Ok(PurchaseStatus::Draft),
            "pending_payment" => Ok(PurchaseStatus::PendingPayment),
            "active" => Ok(PurchaseStatus::Active),
            "failed" => Ok(PurchaseStatus::Failed),
            "cancelled" => Ok(PurchaseStatus::Cancelled),
            "expired" => Ok(PurchaseStatus::Expired),
            "switched" => Ok(PurchaseStatus::Switched),
            _ => Err("Invalid purchase status".into()),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, AsExpression, FromSqlRow, ToSchema,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum PaymentGateway {
    Stripe,
    Paypal,
    Bank,
    Free,
}

impl PaymentGateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentGateway::Stripe => "stripe",
            PaymentGateway::Paypal => "paypal",
            PaymentGateway::Bank => "bank",
            PaymentGateway::Free => "free",
        }
    }
}

impl std::str::FromStr for PaymentGateway {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(PaymentGateway::Stripe),
            "paypal" => Ok(PaymentGateway::Paypal),
            "bank" => Ok(PaymentGateway::Bank),
            "free" => Ok(PaymentGateway::Free),
            other => Err(format!("unknown payment gateway: {}", other)),
        }
    }
}

impl ToSql<Text, Sqlite> for PaymentGateway {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        <str as ToSql<Text, Sqlite>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Text, Sqlite> for PaymentGateway {
    fn from_sql(
        bytes: <Sqlite as diesel::backend::Backend>::RawValue<'_>,
    ) -> deserialize::Result<Self> {
        let gateway_str = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        gateway_str
            .parse()
            .map_err(|_| "Invalid payment gateway".into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceOutcome {
    Success,
    Failure,
}

/// Where a piece of confirmation evidence came from. Callback evidence is
/// authoritative; client evidence is optimistic; admin overrides carry the
/// acting administrator for the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceSource {
    Client,
    GatewayCallback,
    AdminOverride { actor: String },
}

impl EvidenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceSource::Client => "client",
            EvidenceSource::GatewayCallback => "gateway_callback",
            EvidenceSource::AdminOverride { .. } => "admin_override",
        }
    }
}

/// Normalized confirmation signal presented to the reconciler, regardless of
/// which gateway or actor produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub purchase_id: String,
    pub transaction_id: Option<String>,
    pub outcome: EvidenceOutcome,
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutType {
    New,
    Switch,
}

#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
pub struct BeginCheckoutRequest {
    pub plan_id: String,
    pub gateway: PaymentGateway,
    pub checkout_type: CheckoutType,
    pub existing_purchase_id: Option<String>,
    #[serde(default)]
    pub auto_renew: bool,
}

/// What the caller has to do next to complete the gateway-specific flow.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextAction {
    /// Card gateways: finish the client-side confirmation handshake.
    ConfirmCard {
        payment_intent_id: String,
        client_secret: String,
    },
    /// Redirect-based gateways: send the user to the approval URL.
    Redirect { url: String },
    /// Manual bank transfer: show static instructions and wait.
    BankTransfer { reference: String, details: String },
    /// Nothing left to do; the purchase is already settled.
    Complete,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckoutSessionResponse {
    pub purchase_id: String,
    pub status: PurchaseStatus,
    pub next_action: NextAction,
    /// Single-use token the caller must present on the confirm step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
pub struct ConfirmRequest {
    pub purchase_id: String,
    pub transaction_id: Option<String>,
    pub outcome: EvidenceOutcome,
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusQuery {
    #[serde(default)]
    pub refresh_count: u32,
}

/// Presentation phase for the confirmation view. Internal error codes are
/// never surfaced here, only a human-readable reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Processing,
    Confirmed,
    Error,
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub purchase_id: String,
    pub phase: StatusPhase,
    pub plan_name: String,
    pub feature_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_paid_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<chrono::NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Present while the view should keep polling; absent once settled or
    /// past the retry cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_again_in_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct AdminOverrideRequest {
    pub outcome: EvidenceOutcome,
    pub transaction_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub actor: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionTokenResponse {
    pub token: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EmptyData {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_never_reenters_pending_payment() {
        assert!(!PurchaseStatus::Active.can_transition_to(PurchaseStatus::PendingPayment));
        assert!(!PurchaseStatus::Switched.can_transition_to(PurchaseStatus::PendingPayment));
        assert!(!PurchaseStatus::Failed.can_transition_to(PurchaseStatus::Active));
    }

    #[test]
    fn checkout_path_edges() {
        assert!(PurchaseStatus::Draft.can_transition_to(PurchaseStatus::PendingPayment));
        assert!(PurchaseStatus::PendingPayment.can_transition_to(PurchaseStatus::Active));
        assert!(PurchaseStatus::PendingPayment.can_transition_to(PurchaseStatus::Failed));
        assert!(!PurchaseStatus::Draft.can_transition_to(PurchaseStatus::Active));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use PurchaseStatus::*;
        let all = [
            Draft,
            PendingPayment,
            Active,
            Failed,
            Cancelled,
            Expired,
            Switched,
        ];
        for from in all {
            if from.is_terminal() {
                for to in all {
                    assert!(
                        !from.can_transition_to(to),
                        "unexpected edge {:?} -> {:?}",
                        from,
                        to
                    );
                }
            }
        }
    }

    #[test]
    fn gateway_round_trips_through_str() {
        for gw in [
            PaymentGateway::Stripe,
            PaymentGateway::Paypal,
            PaymentGateway::Bank,
            PaymentGateway::Free,
        ] {
            assert_eq!(gw.as_str().parse::<PaymentGateway>().unwrap(), gw);
        }
        assert!("venmo".parse::<PaymentGateway>().is_err());
    }
}
