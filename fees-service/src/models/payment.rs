//! Payment model: a single monetary application event against an invoice.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How the money arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    BankDeposit,
    MobileMoney,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::BankDeposit => "bank_deposit",
            PaymentMethod::MobileMoney => "mobile_money",
            PaymentMethod::Card => "card",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "bank_deposit" => PaymentMethod::BankDeposit,
            "mobile_money" => PaymentMethod::MobileMoney,
            "card" => PaymentMethod::Card,
            _ => PaymentMethod::Cash,
        }
    }

    /// Gateway methods confirm asynchronously; the money has already moved
    /// by the time the confirmation arrives.
    pub fn is_gateway(&self) -> bool {
        matches!(self, PaymentMethod::MobileMoney | PaymentMethod::Card)
    }
}

/// Payment status. Completed, Failed, Cancelled and Refunded are terminal;
/// the only transition out of a terminal state is Completed -> Refunded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => PaymentStatus::Completed,
            "failed" => PaymentStatus::Failed,
            "cancelled" => PaymentStatus::Cancelled,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// Why a completed payment is queued for manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewFlag {
    /// The gateway confirmed more than the invoice balance; the excess was
    /// not applied but the money has moved.
    OverConfirmation,
    /// The confirmation could not be matched to an open invoice.
    Orphaned,
}

impl ReviewFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewFlag::OverConfirmation => "OVER_CONFIRMATION",
            ReviewFlag::Orphaned => "ORPHANED",
        }
    }
}

/// A payment event. `amount` is what the payer moved; `applied_amount` is
/// what actually hit the invoice (they differ only for clamped gateway
/// over-confirmations). `external_ref` is the gateway request id and the
/// idempotency key for repeated confirmations.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub school_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub reference: String,
    pub amount: Decimal,
    pub applied_amount: Decimal,
    pub method: String,
    pub status: String,
    pub external_ref: Option<String>,
    pub payer_ref: Option<String>,
    pub review_flag: Option<String>,
    pub failure_reason: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub initiated_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn status(&self) -> PaymentStatus {
        PaymentStatus::from_string(&self.status)
    }

    pub fn method(&self) -> PaymentMethod {
        PaymentMethod::from_string(&self.method)
    }

    pub fn new_reference() -> String {
        format!("PAY-{}", Uuid::new_v4().simple())
    }
}

/// Filter parameters for listing payments.
#[derive(Debug, Clone, Default)]
pub struct ListPaymentsFilter {
    pub invoice_id: Option<Uuid>,
    pub enrollment_id: Option<Uuid>,
    pub status: Option<PaymentStatus>,
}
