//! Refund model: reverses part or all of a completed payment.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Refund status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Processed,
    Failed,
    Cancelled,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Processed => "processed",
            RefundStatus::Failed => "failed",
            RefundStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processed" => RefundStatus::Processed,
            "failed" => RefundStatus::Failed,
            "cancelled" => RefundStatus::Cancelled,
            _ => RefundStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Refund {
    pub refund_id: Uuid,
    pub payment_id: Uuid,
    pub school_id: Option<Uuid>,
    pub amount: Decimal,
    pub status: String,
    pub reason: String,
    pub processed_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl Refund {
    pub fn status(&self) -> RefundStatus {
        RefundStatus::from_string(&self.status)
    }
}

/// Input for issuing a refund against a payment.
#[derive(Debug, Clone)]
pub struct CreateRefund {
    pub amount: Decimal,
    pub reason: String,
    pub processed_by: Option<Uuid>,
}
