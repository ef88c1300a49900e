//! Payment and refund handlers.
//!
//! Manual payments complete immediately through the applicator; gateway
//! payments are initiated here and complete later via webhook or the
//! reconciliation sweep.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use service_core::error::AppError;

use crate::gateways::{initiate_with_retry, InitiateRequest};
use crate::models::{
    CreateRefund, ListPaymentsFilter, Payment, PaymentMethod, PaymentStatus, Refund,
};
use crate::services::applicator::ApplyPayment;
use crate::startup::AppState;

use super::SchoolQuery;

#[derive(Debug, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    pub school_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub external_ref: Option<String>,
    #[validate(length(max = 32))]
    pub payer_ref: Option<String>,
    pub recorded_by: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct InitiatePaymentRequest {
    pub school_id: Uuid,
    pub invoice_id: Uuid,
    pub method: PaymentMethod,
    /// Defaults to the outstanding balance.
    pub amount: Option<Decimal>,
    #[validate(length(min = 1, max = 32))]
    pub payer_ref: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListPaymentsQuery {
    pub school_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub enrollment_id: Option<Uuid>,
    pub status: Option<PaymentStatus>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    pub school_id: Uuid,
    pub amount: Decimal,
    #[validate(length(min = 1, max = 255))]
    pub reason: String,
    pub processed_by: Option<Uuid>,
}

/// Record a payment against an invoice. Manual methods settle immediately;
/// a gateway method here means an already-confirmed gateway event is being
/// entered, so it must carry the provider's transaction id.
pub async fn record_payment(
    State(state): State<AppState>,
    Json(payload): Json<RecordPaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    payload.validate()?;

    if payload.method.is_gateway() && payload.external_ref.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Gateway payments need an external transaction id; use /payments/initiate to start one"
        )));
    }

    let payment = state
        .applicator
        .apply_payment(ApplyPayment {
            school_id: payload.school_id,
            invoice_id: payload.invoice_id,
            amount: payload.amount,
            method: payload.method,
            external_ref: payload.external_ref,
            payer_ref: payload.payer_ref,
            recorded_by: payload.recorded_by,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(payment)))
}

/// Ask a provider to collect against an invoice. On success a pending
/// payment carrying the provider's request id is recorded; the ledger is
/// untouched until the confirmation arrives.
pub async fn initiate_payment(
    State(state): State<AppState>,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    payload.validate()?;

    let gateway = state.gateways.for_method(payload.method)?;
    let invoice = state
        .invoices
        .get_invoice(payload.school_id, payload.invoice_id)
        .await?;

    if !invoice.status().is_open() {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Invoice {} is {} and cannot accept payments",
            invoice.invoice_number,
            invoice.status
        )));
    }

    let amount = payload.amount.unwrap_or(invoice.balance);
    if amount <= Decimal::ZERO {
        return Err(AppError::validation(
            "amount",
            "Payment amount must be positive",
        ));
    }
    if amount > invoice.balance {
        return Err(AppError::Overpayment(anyhow::anyhow!(
            "Requested {} exceeds outstanding balance {} on invoice {}",
            amount,
            invoice.balance,
            invoice.invoice_number
        )));
    }

    let request = InitiateRequest {
        amount,
        payer_ref: payload.payer_ref.clone(),
        account_ref: invoice.invoice_number.clone(),
        description: payload
            .description
            .unwrap_or_else(|| format!("School fees {}", invoice.invoice_number)),
    };
    let external_ref = initiate_with_retry(gateway.as_ref(), &request).await?;

    let payment = state
        .applicator
        .record_pending_payment(
            payload.school_id,
            payload.invoice_id,
            amount,
            payload.method,
            external_ref,
            Some(payload.payer_ref),
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(payment)))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SchoolQuery>,
) -> Result<Json<Payment>, AppError> {
    let payment = state
        .store
        .get_payment(query.school_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;
    Ok(Json(payment))
}

pub async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<ListPaymentsQuery>,
) -> Result<Json<Vec<Payment>>, AppError> {
    let filter = ListPaymentsFilter {
        invoice_id: query.invoice_id,
        enrollment_id: query.enrollment_id,
        status: query.status,
    };
    let items = state.store.list_payments(query.school_id, &filter).await?;
    Ok(Json(items))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RefundRequest>,
) -> Result<(StatusCode, Json<Refund>), AppError> {
    payload.validate()?;

    let refund = state
        .applicator
        .refund_payment(
            payload.school_id,
            id,
            CreateRefund {
                amount: payload.amount,
                reason: payload.reason,
                processed_by: payload.processed_by,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(refund)))
}
