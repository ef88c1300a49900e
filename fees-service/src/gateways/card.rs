//! Card-processor checkout gateway client.
//!
//! REST payment intents authenticated with a bearer secret; webhook events
//! are HMAC-verified against the configured webhook secret before trust.

use crate::config::CardConfig;
use crate::models::PaymentMethod;
use crate::services::metrics::GATEWAY_CALLS_TOTAL;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use service_core::error::{AppError, GatewayErrorKind};
use service_core::utils::signature::verify_hmac;

use super::{
    transport_error, CallbackEvent, GatewayStatus, InitiateRequest, PaymentGateway,
    GATEWAY_TIMEOUT_SECS,
};

/// Header carrying the HMAC of the webhook body.
pub const CARD_SIGNATURE_HEADER: &str = "x-webhook-signature";

pub struct CardGateway {
    client: Client,
    config: CardConfig,
}

/// Request to create a payment intent. Amounts are in minor units.
#[derive(Debug, Serialize)]
pub struct CreateIntentRequest {
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: IntentMetadata,
}

#[derive(Debug, Serialize)]
pub struct IntentMetadata {
    pub account_reference: String,
    pub payer_reference: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct ProcessorError {
    #[serde(default)]
    error: Option<ProcessorErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ProcessorErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Webhook event: an event type plus the affected intent.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: PaymentIntent,
}

impl CardGateway {
    pub fn new(config: CardConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(GATEWAY_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Check if credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    fn minor_units(amount: Decimal) -> Result<i64, AppError> {
        (amount * Decimal::from(100))
            .round()
            .to_i64()
            .ok_or_else(|| AppError::validation("amount", "Amount is not representable"))
    }

    fn major_units(amount: i64) -> Decimal {
        Decimal::from(amount) / Decimal::from(100)
    }

    fn classify_failure(status: StatusCode, body: &str) -> AppError {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return AppError::gateway(
                GatewayErrorKind::Auth,
                "Request rejected, check the secret key",
            );
        }
        if status.is_server_error() {
            return AppError::gateway(
                GatewayErrorKind::Transient,
                format!("Processor returned {}", status),
            );
        }
        let detail = serde_json::from_str::<ProcessorError>(body)
            .ok()
            .and_then(|e| e.error)
            .and_then(|e| e.message)
            .unwrap_or_else(|| body.to_string());
        AppError::gateway(GatewayErrorKind::Rejected, detail)
    }

    fn intent_status(intent: &PaymentIntent) -> GatewayStatus {
        match intent.status.as_str() {
            "succeeded" => GatewayStatus::Success {
                amount: Some(Self::major_units(intent.amount)),
                receipt: Some(intent.id.clone()),
            },
            "canceled" | "payment_failed" => GatewayStatus::Failed {
                reason: format!("Payment intent {}", intent.status),
            },
            _ => GatewayStatus::Pending,
        }
    }
}

#[async_trait]
impl PaymentGateway for CardGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn initiate(&self, req: &InitiateRequest) -> Result<String, AppError> {
        if !self.is_configured() {
            return Err(AppError::gateway(
                GatewayErrorKind::Auth,
                "Card processor credentials not configured",
            ));
        }

        let request = CreateIntentRequest {
            amount: Self::minor_units(req.amount)?,
            currency: self.config.currency.clone(),
            description: req.description.clone(),
            metadata: IntentMetadata {
                account_reference: req.account_ref.clone(),
                payer_reference: req.payer_ref.clone(),
            },
        };

        let url = format!("{}/v1/payment_intents", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.secret_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                GATEWAY_CALLS_TOTAL
                    .with_label_values(&["card", "initiate", "transport_error"])
                    .inc();
                transport_error("card", e)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error("card", e))?;

        tracing::debug!(status = %status, body = %body, "Payment intent response");

        if !status.is_success() {
            GATEWAY_CALLS_TOTAL
                .with_label_values(&["card", "initiate", "error"])
                .inc();
            return Err(Self::classify_failure(status, &body));
        }

        let intent: PaymentIntent = serde_json::from_str(&body).map_err(|e| {
            AppError::gateway(
                GatewayErrorKind::Rejected,
                format!("Malformed intent response: {}", e),
            )
        })?;

        GATEWAY_CALLS_TOTAL
            .with_label_values(&["card", "initiate", "ok"])
            .inc();
        tracing::info!(intent_id = %intent.id, amount = intent.amount, "Payment intent created");
        Ok(intent.id)
    }

    async fn query_status(&self, external_ref: &str) -> Result<GatewayStatus, AppError> {
        let url = format!("{}/v1/payment_intents/{}", self.config.base_url, external_ref);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.config.secret_key.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error("card", e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error("card", e))?;

        if !status.is_success() {
            return Err(Self::classify_failure(status, &body));
        }

        let intent: PaymentIntent = serde_json::from_str(&body).map_err(|e| {
            AppError::gateway(
                GatewayErrorKind::Rejected,
                format!("Malformed intent response: {}", e),
            )
        })?;

        Ok(Self::intent_status(&intent))
    }

    fn verify_callback(&self, body: &str, signature: &str) -> Result<CallbackEvent, AppError> {
        let valid = verify_hmac(self.config.webhook_secret.expose_secret(), body, signature)
            .map_err(AppError::InternalError)?;
        if !valid {
            return Err(AppError::SignatureInvalid(anyhow::anyhow!(
                "Webhook signature does not match"
            )));
        }

        let event: WebhookEvent = serde_json::from_str(body).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Malformed webhook payload: {}", e))
        })?;

        let status = match event.event_type.as_str() {
            "payment_intent.succeeded" => GatewayStatus::Success {
                amount: Some(Self::major_units(event.data.object.amount)),
                receipt: Some(event.data.object.id.clone()),
            },
            "payment_intent.payment_failed" | "payment_intent.canceled" => GatewayStatus::Failed {
                reason: format!("Processor reported {}", event.event_type),
            },
            _ => GatewayStatus::Pending,
        };

        Ok(CallbackEvent {
            external_ref: event.data.object.id,
            status,
        })
    }
}
