//! Mobile-money STK push gateway client.
//!
//! Implements the push-payment provider's OAuth token exchange, STK push
//! initiation, status query, and callback verification.

use crate::config::MpesaConfig;
use crate::models::PaymentMethod;
use crate::services::metrics::GATEWAY_CALLS_TOTAL;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

use service_core::error::{AppError, GatewayErrorKind};
use service_core::utils::signature::verify_hmac;

use super::{
    transport_error, CallbackEvent, GatewayStatus, InitiateRequest, PaymentGateway,
    GATEWAY_TIMEOUT_SECS,
};

/// Header carrying the HMAC of the callback body.
pub const MPESA_SIGNATURE_HEADER: &str = "x-mpesa-signature";

/// Provider error code for a transaction still being processed.
const STILL_PROCESSING_CODE: &str = "500.001.1001";

pub struct MpesaGateway {
    client: Client,
    config: MpesaConfig,
    token: RwLock<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_utc: DateTime<Utc>,
}

/// STK push initiation request.
#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
}

#[derive(Debug, Serialize)]
struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResultCode", default)]
    pub result_code: Option<String>,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DarajaError {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: String,
}

/// Callback payload: `Body.stkCallback` with `ResultCode == 0` on success.
#[derive(Debug, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub item: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<serde_json::Value>,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(GATEWAY_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
        })
    }

    /// Check if credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.consumer_key.is_empty() && !self.config.short_code.is_empty()
    }

    /// Provider timestamp format, `YYYYMMDDHHmmss`.
    fn timestamp(now: DateTime<Utc>) -> String {
        now.format("%Y%m%d%H%M%S").to_string()
    }

    /// `base64(shortcode + passkey + timestamp)` as the provider requires.
    fn password(&self, timestamp: &str) -> String {
        general_purpose::STANDARD.encode(format!(
            "{}{}{}",
            self.config.short_code,
            self.config.passkey.expose_secret(),
            timestamp
        ))
    }

    /// Mobile money collects whole currency units.
    fn whole_units(amount: Decimal) -> Result<u64, AppError> {
        amount
            .round()
            .to_u64()
            .ok_or_else(|| AppError::validation("amount", "Amount is not representable"))
    }

    /// Client-credentials token exchange, cached until shortly before expiry.
    async fn access_token(&self) -> Result<String, AppError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_utc > Utc::now() {
                    return Ok(token.value.clone());
                }
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let response = self
            .client
            .get(&url)
            .basic_auth(
                &self.config.consumer_key,
                Some(self.config.consumer_secret.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| transport_error("mpesa", e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error("mpesa", e))?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AppError::gateway(
                GatewayErrorKind::Auth,
                "Token exchange rejected, check consumer credentials",
            ));
        }
        if !status.is_success() {
            return Err(AppError::gateway(
                if status.is_server_error() {
                    GatewayErrorKind::Transient
                } else {
                    GatewayErrorKind::Rejected
                },
                format!("Token exchange failed with {}", status),
            ));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::gateway(
                GatewayErrorKind::Rejected,
                format!("Malformed token response: {}", e),
            )
        })?;
        let ttl = token.expires_in.parse::<i64>().unwrap_or(3600);

        let cached = CachedToken {
            value: token.access_token.clone(),
            expires_utc: Utc::now() + ChronoDuration::seconds(ttl - 60),
        };
        *self.token.write().await = Some(cached);

        Ok(token.access_token)
    }

    fn classify_failure(status: StatusCode, body: &str) -> AppError {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return AppError::gateway(GatewayErrorKind::Auth, "Request rejected as unauthorized");
        }
        if status.is_server_error() {
            return AppError::gateway(
                GatewayErrorKind::Transient,
                format!("Provider returned {}", status),
            );
        }
        let detail = serde_json::from_str::<DarajaError>(body)
            .ok()
            .and_then(|e| e.error_message)
            .unwrap_or_else(|| body.to_string());
        AppError::gateway(GatewayErrorKind::Rejected, detail)
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::MobileMoney
    }

    async fn initiate(&self, req: &InitiateRequest) -> Result<String, AppError> {
        if !self.is_configured() {
            return Err(AppError::gateway(
                GatewayErrorKind::Auth,
                "Mobile money credentials not configured",
            ));
        }

        let token = self.access_token().await?;
        let timestamp = Self::timestamp(Utc::now());

        let request = StkPushRequest {
            business_short_code: self.config.short_code.clone(),
            password: self.password(&timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: Self::whole_units(req.amount)?,
            party_a: req.payer_ref.clone(),
            party_b: self.config.short_code.clone(),
            phone_number: req.payer_ref.clone(),
            callback_url: self.config.callback_url.clone(),
            account_reference: req.account_ref.clone(),
            transaction_desc: req.description.clone(),
        };

        let url = format!("{}/mpesa/stkpush/v1/processrequest", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                GATEWAY_CALLS_TOTAL
                    .with_label_values(&["mpesa", "initiate", "transport_error"])
                    .inc();
                transport_error("mpesa", e)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error("mpesa", e))?;

        tracing::debug!(status = %status, body = %body, "STK push response");

        if !status.is_success() {
            GATEWAY_CALLS_TOTAL
                .with_label_values(&["mpesa", "initiate", "error"])
                .inc();
            return Err(Self::classify_failure(status, &body));
        }

        let push: StkPushResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::gateway(
                GatewayErrorKind::Rejected,
                format!("Malformed STK push response: {}", e),
            )
        })?;

        if push.response_code != "0" {
            GATEWAY_CALLS_TOTAL
                .with_label_values(&["mpesa", "initiate", "rejected"])
                .inc();
            return Err(AppError::gateway(
                GatewayErrorKind::Rejected,
                push.response_description,
            ));
        }

        GATEWAY_CALLS_TOTAL
            .with_label_values(&["mpesa", "initiate", "ok"])
            .inc();
        tracing::info!(
            checkout_request_id = %push.checkout_request_id,
            merchant_request_id = %push.merchant_request_id,
            "STK push accepted"
        );
        Ok(push.checkout_request_id)
    }

    async fn query_status(&self, external_ref: &str) -> Result<GatewayStatus, AppError> {
        let token = self.access_token().await?;
        let timestamp = Self::timestamp(Utc::now());

        let request = StkQueryRequest {
            business_short_code: self.config.short_code.clone(),
            password: self.password(&timestamp),
            timestamp,
            checkout_request_id: external_ref.to_string(),
        };

        let url = format!("{}/mpesa/stkpushquery/v1/query", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("mpesa", e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error("mpesa", e))?;

        if !status.is_success() {
            // The provider reports an in-flight push as an error body.
            if let Ok(detail) = serde_json::from_str::<DarajaError>(&body) {
                if detail.error_code.as_deref() == Some(STILL_PROCESSING_CODE) {
                    return Ok(GatewayStatus::Pending);
                }
            }
            return Err(Self::classify_failure(status, &body));
        }

        let query: StkQueryResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::gateway(
                GatewayErrorKind::Rejected,
                format!("Malformed status response: {}", e),
            )
        })?;

        match query.result_code.as_deref() {
            Some("0") => Ok(GatewayStatus::Success {
                amount: None,
                receipt: None,
            }),
            Some(_) => Ok(GatewayStatus::Failed {
                reason: query
                    .result_desc
                    .unwrap_or_else(|| "Push rejected by payer or provider".to_string()),
            }),
            None => Ok(GatewayStatus::Pending),
        }
    }

    fn verify_callback(&self, body: &str, signature: &str) -> Result<CallbackEvent, AppError> {
        let valid = verify_hmac(self.config.callback_secret.expose_secret(), body, signature)
            .map_err(AppError::InternalError)?;
        if !valid {
            return Err(AppError::SignatureInvalid(anyhow::anyhow!(
                "Callback signature does not match"
            )));
        }

        let envelope: StkCallbackEnvelope = serde_json::from_str(body).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Malformed callback payload: {}", e))
        })?;
        let callback = envelope.body.stk_callback;

        let status = if callback.result_code == 0 {
            let amount = callback
                .callback_metadata
                .as_ref()
                .and_then(|m| item_decimal(&m.item, "Amount"));
            let receipt = callback
                .callback_metadata
                .as_ref()
                .and_then(|m| item_string(&m.item, "MpesaReceiptNumber"));
            GatewayStatus::Success { amount, receipt }
        } else {
            GatewayStatus::Failed {
                reason: callback.result_desc,
            }
        };

        Ok(CallbackEvent {
            external_ref: callback.checkout_request_id,
            status,
        })
    }
}

fn item_decimal(items: &[MetadataItem], name: &str) -> Option<Decimal> {
    items
        .iter()
        .find(|i| i.name == name)
        .and_then(|i| i.value.as_ref())
        .and_then(|v| match v {
            serde_json::Value::Number(n) => n.to_string().parse().ok(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        })
}

fn item_string(items: &[MetadataItem], name: &str) -> Option<String> {
    items
        .iter()
        .find(|i| i.name == name)
        .and_then(|i| i.value.as_ref())
        .and_then(|v| v.as_str().map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use secrecy::Secret;
    use service_core::utils::signature::compute_hmac;

    fn test_config() -> MpesaConfig {
        MpesaConfig {
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            short_code: "174379".to_string(),
            passkey: Secret::new("passkey123".to_string()),
            consumer_key: "consumer".to_string(),
            consumer_secret: Secret::new("secret".to_string()),
            callback_url: "https://fees.example.test/webhooks/mpesa".to_string(),
            callback_secret: Secret::new("callback_secret".to_string()),
        }
    }

    fn gateway() -> MpesaGateway {
        MpesaGateway::new(test_config()).unwrap()
    }

    fn success_callback(checkout_id: &str, amount: &str) -> String {
        format!(
            r#"{{"Body":{{"stkCallback":{{"MerchantRequestID":"mr-1","CheckoutRequestID":"{}","ResultCode":0,"ResultDesc":"The service request is processed successfully.","CallbackMetadata":{{"Item":[{{"Name":"Amount","Value":{}}},{{"Name":"MpesaReceiptNumber","Value":"QK12XYZ"}},{{"Name":"PhoneNumber","Value":254700000000}}]}}}}}}}}"#,
            checkout_id, amount
        )
    }

    #[test]
    fn test_password_derivation() {
        let gw = gateway();
        let password = gw.password("20250901120000");
        let decoded = general_purpose::STANDARD.decode(&password).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "174379passkey12320250901120000"
        );
    }

    #[test]
    fn test_timestamp_format() {
        let now = DateTime::parse_from_rfc3339("2025-09-01T12:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(MpesaGateway::timestamp(now), "20250901123045");
    }

    #[test]
    fn test_whole_units_rounds() {
        assert_eq!(MpesaGateway::whole_units(dec!(1200)).unwrap(), 1200);
        assert_eq!(MpesaGateway::whole_units(dec!(1200.4)).unwrap(), 1200);
    }

    #[test]
    fn test_verify_callback_success() {
        let gw = gateway();
        let body = success_callback("ws_CO_123", "3000");
        let signature = compute_hmac("callback_secret", &body).unwrap();

        let event = gw.verify_callback(&body, &signature).unwrap();
        assert_eq!(event.external_ref, "ws_CO_123");
        match event.status {
            GatewayStatus::Success { amount, receipt } => {
                assert_eq!(amount, Some(dec!(3000)));
                assert_eq!(receipt.as_deref(), Some("QK12XYZ"));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_callback_failure_result() {
        let gw = gateway();
        let body = r#"{"Body":{"stkCallback":{"MerchantRequestID":"mr-1","CheckoutRequestID":"ws_CO_9","ResultCode":1032,"ResultDesc":"Request cancelled by user"}}}"#;
        let signature = compute_hmac("callback_secret", body).unwrap();

        let event = gw.verify_callback(body, &signature).unwrap();
        assert_eq!(event.external_ref, "ws_CO_9");
        assert_eq!(
            event.status,
            GatewayStatus::Failed {
                reason: "Request cancelled by user".to_string()
            }
        );
    }

    #[test]
    fn test_verify_callback_rejects_bad_signature() {
        let gw = gateway();
        let body = success_callback("ws_CO_123", "3000");

        let result = gw.verify_callback(&body, "deadbeef");
        assert!(matches!(result, Err(AppError::SignatureInvalid(_))));
    }

    #[test]
    fn test_verify_callback_rejects_tampered_body() {
        let gw = gateway();
        let body = success_callback("ws_CO_123", "3000");
        let signature = compute_hmac("callback_secret", &body).unwrap();
        let tampered = success_callback("ws_CO_123", "9000");

        let result = gw.verify_callback(&tampered, &signature);
        assert!(matches!(result, Err(AppError::SignatureInvalid(_))));
    }
}
