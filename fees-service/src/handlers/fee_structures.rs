//! Fee structure administration handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use service_core::error::AppError;

use crate::models::{CreateFeeStructure, FeeFrequency, FeeStructure, FeeType};
use crate::startup::AppState;

use super::SchoolQuery;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateFeeStructureRequest {
    pub school_id: Uuid,
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    pub fee_type: FeeType,
    pub frequency: FeeFrequency,
    pub amount: Decimal,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    pub class_level: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub academic_year: String,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
}

fn default_mandatory() -> bool {
    true
}

pub async fn create_fee_structure(
    State(state): State<AppState>,
    Json(payload): Json<CreateFeeStructureRequest>,
) -> Result<(StatusCode, Json<FeeStructure>), AppError> {
    payload.validate()?;

    let created = state
        .invoices
        .create_fee_structure(CreateFeeStructure {
            school_id: payload.school_id,
            name: payload.name,
            fee_type: payload.fee_type,
            frequency: payload.frequency,
            amount: payload.amount,
            mandatory: payload.mandatory,
            class_level: payload.class_level,
            academic_year: payload.academic_year,
            valid_from: payload.valid_from,
            valid_to: payload.valid_to,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_fee_structures(
    State(state): State<AppState>,
    Query(query): Query<SchoolQuery>,
) -> Result<Json<Vec<FeeStructure>>, AppError> {
    let items = state.invoices.list_fee_structures(query.school_id).await?;
    Ok(Json(items))
}

pub async fn retire_fee_structure(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SchoolQuery>,
) -> Result<Json<FeeStructure>, AppError> {
    let retired = state
        .invoices
        .retire_fee_structure(query.school_id, id)
        .await?;
    Ok(Json(retired))
}
