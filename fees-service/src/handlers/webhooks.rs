//! Gateway webhook handlers.
//!
//! Each handler verifies the provider signature, acknowledges quickly, and
//! hands the event to the idempotent apply path, so provider retries and
//! the reconciliation sweep can deliver the same confirmation more than
//! once without double counting. An invalid signature is rejected before
//! any ledger state is touched.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};

use service_core::error::AppError;

use crate::gateways::card::CARD_SIGNATURE_HEADER;
use crate::gateways::mpesa::MPESA_SIGNATURE_HEADER;
use crate::gateways::{CallbackEvent, GatewayStatus};
use crate::models::PaymentMethod;
use crate::startup::AppState;

pub async fn mpesa_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let signature = required_signature(&headers, MPESA_SIGNATURE_HEADER)?;
    let gateway = state.gateways.for_method(PaymentMethod::MobileMoney)?;
    let event = gateway.verify_callback(&body, signature)?;

    tracing::info!(
        external_ref = %event.external_ref,
        "Verified mobile money callback"
    );
    dispatch_event(&state, PaymentMethod::MobileMoney, event).await?;
    Ok(StatusCode::OK)
}

pub async fn card_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let signature = required_signature(&headers, CARD_SIGNATURE_HEADER)?;
    let gateway = state.gateways.for_method(PaymentMethod::Card)?;
    let event = gateway.verify_callback(&body, signature)?;

    tracing::info!(
        external_ref = %event.external_ref,
        "Verified card processor webhook"
    );
    dispatch_event(&state, PaymentMethod::Card, event).await?;
    Ok(StatusCode::OK)
}

fn required_signature<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(header = name, "Webhook missing signature header");
            AppError::SignatureInvalid(anyhow::anyhow!("Missing webhook signature"))
        })
}

async fn dispatch_event(
    state: &AppState,
    method: PaymentMethod,
    event: CallbackEvent,
) -> Result<(), AppError> {
    match event.status {
        GatewayStatus::Success { amount, .. } => {
            state
                .applicator
                .confirm_gateway_payment(&event.external_ref, method, amount)
                .await?;
        }
        GatewayStatus::Failed { reason } => {
            state
                .applicator
                .fail_payment(&event.external_ref, &reason)
                .await?;
        }
        GatewayStatus::Pending => {
            tracing::debug!(
                external_ref = %event.external_ref,
                "Ignoring non-terminal gateway event"
            );
        }
    }
    Ok(())
}
