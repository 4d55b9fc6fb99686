use crate::error::{AppError, AppResult};
use crate::model::Purchase;
use crate::types::{Evidence, EvidenceOutcome, PaymentGateway};
use base64::prelude::*;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::env;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Outbound gateway calls never block a checkout past this bound.
pub const GATEWAY_TIMEOUT_SECS: u64 = 10;
/// Authorization creation may be retried on transient network errors.
/// Confirmation is never retried here; idempotency makes caller retries safe.
const AUTH_CREATE_RETRIES: u32 = 2;
/// Asynchronous callbacks sign the raw body with the per-gateway secret.
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

const STRIPE_API_BASE: &str = "https://api.stripe.com";
const PAYPAL_API_BASE: &str = "https://api-m.paypal.com";

/// Result of a successful authorization-creation call: whatever the caller
/// needs to complete the gateway-specific flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationHandle {
    CardIntent {
        intent_id: String,
        client_secret: String,
    },
    Redirect {
        url: String,
        order_id: String,
    },
    BankInstructions {
        reference: String,
        details: String,
    },
    Immediate {
        transaction_id: String,
    },
}

#[derive(Clone)]
pub struct StripeGateway {
    secret_key: String,
    webhook_secret: String,
    client: reqwest::Client,
}

#[derive(Clone)]
pub struct PaypalGateway {
    client_id: String,
    client_secret: String,
    webhook_secret: String,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Clone)]
pub struct BankGateway {
    transfer_details: String,
}

impl BankGateway {
    pub fn new(transfer_details: String) -> Self {
        Self { transfer_details }
    }
}

/// Per-gateway enabled flag and settings, read once at startup. A gateway
/// absent here is unavailable for checkout.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    stripe: Option<StripeGateway>,
    paypal: Option<PaypalGateway>,
    bank: Option<BankGateway>,
    free_enabled: bool,
}

impl GatewayRegistry {
    pub fn new(
        stripe: Option<StripeGateway>,
        paypal: Option<PaypalGateway>,
        bank: Option<BankGateway>,
        free_enabled: bool,
    ) -> Self {
        Self {
            stripe,
            paypal,
            bank,
            free_enabled,
        }
    }

    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(GATEWAY_TIMEOUT_SECS))
            .build()?;

        let stripe = match (env::var("STRIPE_SECRET_KEY"), env::var("STRIPE_WEBHOOK_SECRET")) {
            (Ok(secret_key), Ok(webhook_secret)) => Some(StripeGateway {
                secret_key,
                webhook_secret,
                client: client.clone(),
            }),
            _ => None,
        };

        let paypal = match (
            env::var("PAYPAL_CLIENT_ID"),
            env::var("PAYPAL_CLIENT_SECRET"),
            env::var("PAYPAL_WEBHOOK_SECRET"),
        ) {
            (Ok(client_id), Ok(client_secret), Ok(webhook_secret)) => Some(PaypalGateway {
                client_id,
                client_secret,
                webhook_secret,
                api_base: env::var("PAYPAL_API_BASE").unwrap_or_else(|_| PAYPAL_API_BASE.to_string()),
                client: client.clone(),
            }),
            _ => None,
        };

        let bank = match env::var("BANK_TRANSFER_ENABLED").as_deref() {
            Ok("true") | Ok("1") => Some(BankGateway {
                transfer_details: env::var("BANK_TRANSFER_DETAILS")
                    .map_err(|_| "BANK_TRANSFER_DETAILS must be set when bank transfer is enabled")?,
            }),
            _ => None,
        };

        Ok(Self {
            stripe,
            paypal,
            bank,
            free_enabled: true,
        })
    }

    pub fn resolve(&self, gateway: PaymentGateway) -> AppResult<GatewayRef<'_>> {
        let resolved = match gateway {
            PaymentGateway::Stripe => self.stripe.as_ref().map(GatewayRef::Stripe),
            PaymentGateway::Paypal => self.paypal.as_ref().map(GatewayRef::Paypal),
            PaymentGateway::Bank => self.bank.as_ref().map(GatewayRef::Bank),
            PaymentGateway::Free => self.free_enabled.then_some(GatewayRef::Free),
        };

        resolved.ok_or_else(|| {
            AppError::GatewayUnavailable(format!(
                "payment gateway {} is not enabled",
                gateway.as_str()
            ))
        })
    }
}

/// Closed set of gateway variants. Adding a gateway is a compile-time
/// change: every match below has to be extended.
pub enum GatewayRef<'a> {
    Stripe(&'a StripeGateway),
    Paypal(&'a PaypalGateway),
    Bank(&'a BankGateway),
    Free,
}

impl GatewayRef<'_> {
    pub async fn create_authorization(
        &self,
        purchase: &Purchase,
        amount_cents: i64,
    ) -> AppResult<AuthorizationHandle> {
        match self {
            GatewayRef::Stripe(gw) => gw.create_payment_intent(purchase, amount_cents).await,
            GatewayRef::Paypal(gw) => gw.create_order(purchase, amount_cents).await,
            GatewayRef::Bank(gw) => Ok(AuthorizationHandle::BankInstructions {
                reference: bank_reference(&purchase.id),
                details: gw.transfer_details.clone(),
            }),
            GatewayRef::Free => Ok(AuthorizationHandle::Immediate {
                transaction_id: format!("free_{}", Uuid::new_v4()),
            }),
        }
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        match self {
            GatewayRef::Stripe(gw) => Some(&gw.webhook_secret),
            GatewayRef::Paypal(gw) => Some(&gw.webhook_secret),
            GatewayRef::Bank(_) | GatewayRef::Free => None,
        }
    }

    /// Normalize a gateway-specific callback payload into common evidence.
    /// `Ok(None)` means the event type is not one this service acts on; the
    /// callback should still be acknowledged.
    pub fn extract_evidence(&self, payload: &Value) -> AppResult<Option<Evidence>> {
        match self {
            GatewayRef::Stripe(_) => extract_stripe_evidence(payload),
            GatewayRef::Paypal(_) => extract_paypal_evidence(payload),
            GatewayRef::Bank(_) => Err(AppError::BadRequest(
                "bank transfers are finalized by administrator override, not callbacks".to_string(),
            )),
            GatewayRef::Free => Err(AppError::BadRequest(
                "the free gateway does not deliver callbacks".to_string(),
            )),
        }
    }
}

/// Deterministic wire reference for a manual transfer, derived from the
/// purchase id so support can correlate statements.
pub fn bank_reference(purchase_id: &str) -> String {
    let short: String = purchase_id.chars().filter(|c| *c != '-').take(10).collect();
    format!("BT-{}", short.to_uppercase())
}

impl StripeGateway {
    pub fn new(secret_key: String, webhook_secret: String, client: reqwest::Client) -> Self {
        Self {
            secret_key,
            webhook_secret,
            client,
        }
    }

    async fn create_payment_intent(
        &self,
        purchase: &Purchase,
        amount_cents: i64,
    ) -> AppResult<AuthorizationHandle> {
        #[cfg(feature = "mock-gateways")]
        {
            let _ = amount_cents;
            return Ok(AuthorizationHandle::CardIntent {
                intent_id: format!("pi_mock_{}", bank_reference(&purchase.id)),
                client_secret: format!("pi_mock_secret_{}", Uuid::new_v4()),
            });
        }

        #[cfg(not(feature = "mock-gateways"))]
        {
            let mut attempt = 0;
            loop {
                match self.try_create_payment_intent(purchase, amount_cents).await {
                    Err(AppError::NetworkError(e)) if attempt < AUTH_CREATE_RETRIES => {
                        attempt += 1;
                        tracing::warn!(
                            purchase_id = %purchase.id,
                            attempt,
                            error = %e,
                            "stripe intent creation failed, retrying"
                        );
                    }
                    other => return other,
                }
            }
        }
    }

    #[cfg(not(feature = "mock-gateways"))]
    async fn try_create_payment_intent(
        &self,
        purchase: &Purchase,
        amount_cents: i64,
    ) -> AppResult<AuthorizationHandle> {
        let form = [
            ("amount", amount_cents.to_string()),
            ("currency", "usd".to_string()),
            ("metadata[purchase_id]", purchase.id.clone()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let res = self
            .client
            .post(format!("{}/v1/payment_intents", STRIPE_API_BASE))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&form)
            .send()
            .await
            .map_err(AppError::from)?;

        let status = res.status();
        let body: Value = res
            .json()
            .await
            .map_err(|e| AppError::GatewayResponseParse(e.to_string()))?;

        if status.is_success() {
            let intent_id = body
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::GatewayResponseParse("intent id missing".to_string()))?;
            let client_secret = body
                .get("client_secret")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::GatewayResponseParse("client secret missing".to_string()))?;

            Ok(AuthorizationHandle::CardIntent {
                intent_id: intent_id.to_string(),
                client_secret: client_secret.to_string(),
            })
        } else if status == reqwest::StatusCode::PAYMENT_REQUIRED
            || body.pointer("/error/type").and_then(Value::as_str) == Some("card_error")
        {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("card declined");
            Err(AppError::GatewayDeclined(message.to_string()))
        } else {
            Err(AppError::GatewayUnavailable(format!(
                "stripe returned status {}",
                status
            )))
        }
    }
}

impl PaypalGateway {
    pub fn new(
        client_id: String,
        client_secret: String,
        webhook_secret: String,
        api_base: String,
        client: reqwest::Client,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            webhook_secret,
            api_base,
            client,
        }
    }

    async fn create_order(
        &self,
        purchase: &Purchase,
        amount_cents: i64,
    ) -> AppResult<AuthorizationHandle> {
        #[cfg(feature = "mock-gateways")]
        {
            let _ = amount_cents;
            let order_id = format!("EC-MOCK-{}", bank_reference(&purchase.id));
            return Ok(AuthorizationHandle::Redirect {
                url: format!(
                    "https://www.sandbox.paypal.com/checkoutnow?token={}",
                    order_id
                ),
                order_id,
            });
        }

        #[cfg(not(feature = "mock-gateways"))]
        {
            let mut attempt = 0;
            loop {
                match self.try_create_order(purchase, amount_cents).await {
                    Err(AppError::NetworkError(e)) if attempt < AUTH_CREATE_RETRIES => {
                        attempt += 1;
                        tracing::warn!(
                            purchase_id = %purchase.id,
                            attempt,
                            error = %e,
                            "paypal order creation failed, retrying"
                        );
                    }
                    other => return other,
                }
            }
        }
    }

    #[cfg(not(feature = "mock-gateways"))]
    async fn try_create_order(
        &self,
        purchase: &Purchase,
        amount_cents: i64,
    ) -> AppResult<AuthorizationHandle> {
        let token_res = self
            .client
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(AppError::from)?;

        if !token_res.status().is_success() {
            return Err(AppError::GatewayUnavailable(format!(
                "paypal token endpoint returned status {}",
                token_res.status()
            )));
        }

        let token_body: Value = token_res
            .json()
            .await
            .map_err(|e| AppError::GatewayResponseParse(e.to_string()))?;
        let access_token = token_body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::GatewayResponseParse("access token missing".to_string()))?;

        let order = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": purchase.id,
                "custom_id": purchase.id,
                "amount": {
                    "currency_code": "USD",
                    "value": cents_to_dollars(amount_cents),
                }
            }]
        });

        let res = self
            .client
            .post(format!("{}/v2/checkout/orders", self.api_base))
            .bearer_auth(access_token)
            .json(&order)
            .send()
            .await
            .map_err(AppError::from)?;

        let status = res.status();
        let body: Value = res
            .json()
            .await
            .map_err(|e| AppError::GatewayResponseParse(e.to_string()))?;

        if !status.is_success() {
            return Err(AppError::GatewayUnavailable(format!(
                "paypal order endpoint returned status {}",
                status
            )));
        }

        let order_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::GatewayResponseParse("order id missing".to_string()))?;
        let approve_url = body
            .get("links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l.get("rel").and_then(Value::as_str) == Some("approve"))
            })
            .and_then(|l| l.get("href"))
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::GatewayResponseParse("approval link missing".to_string()))?;

        Ok(AuthorizationHandle::Redirect {
            url: approve_url.to_string(),
            order_id: order_id.to_string(),
        })
    }
}

fn extract_stripe_evidence(payload: &Value) -> AppResult<Option<Evidence>> {
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("callback missing event type".to_string()))?;

    let outcome = match event_type {
        "payment_intent.succeeded" => EvidenceOutcome::Success,
        "payment_intent.payment_failed" | "payment_intent.canceled" => EvidenceOutcome::Failure,
        _ => return Ok(None),
    };

    let object = payload
        .pointer("/data/object")
        .ok_or_else(|| AppError::BadRequest("callback missing payment intent".to_string()))?;

    let purchase_id = object
        .pointer("/metadata/purchase_id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("callback missing purchase reference".to_string()))?;
    let intent_id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("callback missing intent id".to_string()))?;

    Ok(Some(Evidence {
        purchase_id: purchase_id.to_string(),
        transaction_id: Some(intent_id.to_string()),
        outcome,
        amount_cents: object.get("amount").and_then(Value::as_i64),
        reason: object
            .pointer("/last_payment_error/message")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    }))
}

fn extract_paypal_evidence(payload: &Value) -> AppResult<Option<Evidence>> {
    let event_type = payload
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("callback missing event type".to_string()))?;

    let outcome = match event_type {
        "PAYMENT.CAPTURE.COMPLETED" | "CHECKOUT.ORDER.APPROVED" => EvidenceOutcome::Success,
        "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => EvidenceOutcome::Failure,
        _ => return Ok(None),
    };

    let resource = payload
        .get("resource")
        .ok_or_else(|| AppError::BadRequest("callback missing resource".to_string()))?;

    let purchase_id = resource
        .get("custom_id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("callback missing purchase reference".to_string()))?;
    let capture_id = resource
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("callback missing capture id".to_string()))?;

    let amount_cents = resource
        .pointer("/amount/value")
        .and_then(Value::as_str)
        .and_then(dollars_to_cents);

    Ok(Some(Evidence {
        purchase_id: purchase_id.to_string(),
        transaction_id: Some(capture_id.to_string()),
        outcome,
        amount_cents,
        reason: resource
            .pointer("/status_details/reason")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    }))
}

/// Verify the HMAC-SHA256 body signature carried on asynchronous callbacks.
pub fn verify_callback_signature(secret: &str, body: &[u8], signature_b64: &str) -> AppResult<()> {
    let signature = BASE64_STANDARD
        .decode(signature_b64)
        .map_err(|_| AppError::Unauthorized("malformed callback signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("callback secret unusable: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| AppError::Unauthorized("invalid callback signature".to_string()))
}

fn cents_to_dollars(amount_cents: i64) -> String {
    format!("{}.{:02}", amount_cents / 100, amount_cents % 100)
}

fn dollars_to_cents(value: &str) -> Option<i64> {
    let (dollars, cents) = match value.split_once('.') {
        Some((d, c)) => (d, c),
        None => (value, "0"),
    };
    let dollars: i64 = dollars.parse().ok()?;
    let cents: i64 = match cents.len() {
        0 => 0,
        1 => cents.parse::<i64>().ok()? * 10,
        2 => cents.parse().ok()?,
        _ => return None,
    };
    Some(dollars * 100 + cents)
}
