//! Invoice administration handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use service_core::error::AppError;

use crate::models::{CreateInvoice, FeeInvoice, InvoiceStatus, ListInvoicesFilter};
use crate::startup::AppState;

use super::SchoolQuery;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub school_id: Uuid,
    pub enrollment_id: Uuid,
    pub fee_structure_id: Uuid,
    #[validate(length(min = 1, max = 20))]
    pub academic_year: String,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub school_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelInvoiceRequest {
    pub school_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub reason: String,
}

pub async fn create_invoice(
    State(state): State<AppState>,
    Json(payload): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<FeeInvoice>), AppError> {
    payload.validate()?;

    let invoice = state
        .invoices
        .create_invoice(CreateInvoice {
            school_id: payload.school_id,
            enrollment_id: payload.enrollment_id,
            fee_structure_id: payload.fee_structure_id,
            academic_year: payload.academic_year,
            due_date: payload.due_date,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SchoolQuery>,
) -> Result<Json<FeeInvoice>, AppError> {
    let invoice = state.invoices.get_invoice(query.school_id, id).await?;
    Ok(Json(invoice))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<Vec<FeeInvoice>>, AppError> {
    let filter = ListInvoicesFilter {
        enrollment_id: query.enrollment_id,
        status: query.status,
    };
    let items = state.invoices.list_invoices(query.school_id, &filter).await?;
    Ok(Json(items))
}

pub async fn cancel_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelInvoiceRequest>,
) -> Result<Json<FeeInvoice>, AppError> {
    payload.validate()?;

    let invoice = state
        .invoices
        .cancel_invoice(payload.school_id, id, &payload.reason)
        .await?;
    Ok(Json(invoice))
}
