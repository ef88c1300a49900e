//! Fee invoice model: one billable obligation for one enrollment.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Partial,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "partial" => InvoiceStatus::Partial,
            "paid" => InvoiceStatus::Paid,
            "overdue" => InvoiceStatus::Overdue,
            "cancelled" => InvoiceStatus::Cancelled,
            _ => InvoiceStatus::Pending,
        }
    }

    /// Statuses an invoice can still receive money in.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Pending | InvoiceStatus::Partial | InvoiceStatus::Overdue
        )
    }
}

/// A billable obligation. `balance` is always `total - paid`; only the
/// payment applicator mutates the money columns after issuance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeeInvoice {
    pub invoice_id: Uuid,
    pub school_id: Uuid,
    pub enrollment_id: Uuid,
    pub fee_structure_id: Uuid,
    pub invoice_number: String,
    pub academic_year: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub total: Decimal,
    pub paid: Decimal,
    pub balance: Decimal,
    pub status: String,
    pub cancelled_reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl FeeInvoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }
}

/// Input for creating an invoice from a fee structure.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub school_id: Uuid,
    pub enrollment_id: Uuid,
    pub fee_structure_id: Uuid,
    pub academic_year: String,
    pub due_date: Option<NaiveDate>,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub enrollment_id: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
}
