//! Payment gateway boundary.
//!
//! Each provider implements [`PaymentGateway`]; callers go through the
//! registry and never branch on provider identity. Transport failures and
//! timeouts surface as `GatewayError{TRANSIENT}` so the caller's bounded
//! backoff can retry them.

pub mod card;
pub mod mpesa;

pub use card::CardGateway;
pub use mpesa::MpesaGateway;

use crate::models::PaymentMethod;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use service_core::error::{AppError, GatewayErrorKind};

/// Every outbound gateway call is bounded by this timeout; an expiry is a
/// transient failure.
pub const GATEWAY_TIMEOUT_SECS: u64 = 10;

/// Total window for retrying a transient `initiate` failure.
const INITIATE_RETRY_WINDOW_SECS: u64 = 8;

/// Provider-reported state of a payment request.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayStatus {
    Pending,
    Success {
        amount: Option<Decimal>,
        receipt: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// A verified, parsed asynchronous provider notification.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub external_ref: String,
    pub status: GatewayStatus,
}

/// Input for initiating a payment request with a provider.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub amount: Decimal,
    pub payer_ref: String,
    pub account_ref: String,
    pub description: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// The payment method this provider settles.
    fn method(&self) -> PaymentMethod;

    /// Ask the provider to start collecting; returns the provider-assigned
    /// request id used for callbacks and status queries.
    async fn initiate(&self, req: &InitiateRequest) -> Result<String, AppError>;

    /// Poll the provider for the state of an earlier request.
    async fn query_status(&self, external_ref: &str) -> Result<GatewayStatus, AppError>;

    /// Authenticate and parse an inbound callback. A signature mismatch is
    /// rejected here and never reaches the payment applicator.
    fn verify_callback(&self, body: &str, signature: &str) -> Result<CallbackEvent, AppError>;
}

/// Lookup table from payment method to provider.
pub struct GatewayRegistry {
    gateways: Vec<Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new(gateways: Vec<Arc<dyn PaymentGateway>>) -> Self {
        Self { gateways }
    }

    pub fn for_method(&self, method: PaymentMethod) -> Result<Arc<dyn PaymentGateway>, AppError> {
        if !method.is_gateway() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "{} is not a gateway payment method",
                method.as_str()
            )));
        }
        self.gateways
            .iter()
            .find(|g| g.method() == method)
            .cloned()
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "No gateway registered for method {}",
                    method.as_str()
                ))
            })
    }
}

/// Initiate with bounded exponential backoff. Only transient failures
/// retry; auth failures and provider rejections surface immediately.
pub async fn initiate_with_retry(
    gateway: &dyn PaymentGateway,
    req: &InitiateRequest,
) -> Result<String, AppError> {
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(250),
        max_elapsed_time: Some(Duration::from_secs(INITIATE_RETRY_WINDOW_SECS)),
        ..Default::default()
    };

    backoff::future::retry(policy, || async {
        gateway.initiate(req).await.map_err(|e| {
            if e.is_transient_gateway() {
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await
}

/// Map a reqwest transport failure (timeout, connect, body) to a transient
/// gateway error.
pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> AppError {
    AppError::gateway(
        GatewayErrorKind::Transient,
        format!("{} request failed: {}", provider, e),
    )
}
