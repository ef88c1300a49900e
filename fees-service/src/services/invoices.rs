//! Invoice manager: creates invoices from fee structures, owns status
//! recomputation and cancellation, and flips overdue invoices on due-date
//! passage.

use crate::models::{
    CreateFeeStructure, CreateInvoice, FeeInvoice, FeeStructure, InvoiceStatus,
    ListInvoicesFilter,
};
use crate::services::ledger::LedgerStore;
use crate::services::metrics::INVOICES_TOTAL;
use crate::services::notifier::{Notifier, NotifyEvent};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use service_core::error::AppError;

/// Invoices fall due this long after issue when the fee structure has no
/// validity end to inherit.
const DEFAULT_DUE_DAYS: i64 = 30;

/// Pure status function. Cancellation is handled separately; for any live
/// invoice the status is fully determined by the money columns and the
/// due date.
pub fn recompute_status(
    paid: Decimal,
    total: Decimal,
    due_date: NaiveDate,
    today: NaiveDate,
) -> InvoiceStatus {
    let balance = total - paid;
    if balance <= Decimal::ZERO {
        InvoiceStatus::Paid
    } else if today > due_date {
        InvoiceStatus::Overdue
    } else if paid > Decimal::ZERO {
        InvoiceStatus::Partial
    } else {
        InvoiceStatus::Pending
    }
}

pub struct InvoiceManager {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
}

impl InvoiceManager {
    pub fn new(store: Arc<dyn LedgerStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    #[instrument(skip(self, input), fields(school_id = %input.school_id))]
    pub async fn create_fee_structure(
        &self,
        input: CreateFeeStructure,
    ) -> Result<FeeStructure, AppError> {
        if input.amount <= Decimal::ZERO {
            return Err(AppError::validation(
                "amount",
                "Fee amount must be positive",
            ));
        }
        if let Some(valid_to) = input.valid_to {
            if valid_to < input.valid_from {
                return Err(AppError::validation(
                    "valid_to",
                    "Fee structure validity window is inverted",
                ));
            }
        }
        self.store.insert_fee_structure(&input).await
    }

    pub async fn list_fee_structures(
        &self,
        school_id: Uuid,
    ) -> Result<Vec<FeeStructure>, AppError> {
        self.store.list_fee_structures(school_id).await
    }

    #[instrument(skip(self), fields(school_id = %school_id, fee_structure_id = %id))]
    pub async fn retire_fee_structure(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<FeeStructure, AppError> {
        self.store
            .retire_fee_structure(school_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Fee structure not found")))
    }

    /// Create an invoice for an enrollment from a billable fee structure.
    #[instrument(skip(self, input), fields(
        school_id = %input.school_id,
        enrollment_id = %input.enrollment_id,
        fee_structure_id = %input.fee_structure_id,
    ))]
    pub async fn create_invoice(&self, input: CreateInvoice) -> Result<FeeInvoice, AppError> {
        let structure = self
            .store
            .get_fee_structure(input.school_id, input.fee_structure_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Fee structure not found")))?;

        let today = Utc::now().date_naive();
        if !structure.is_billable(&input.academic_year, today) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Fee structure '{}' is not billable for {} on {}",
                structure.name,
                input.academic_year,
                today
            )));
        }

        if let Some(existing) = self
            .store
            .find_open_invoice(
                input.school_id,
                input.enrollment_id,
                input.fee_structure_id,
                &input.academic_year,
            )
            .await?
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Open invoice {} already exists for this billing period",
                existing.invoice_number
            )));
        }

        let due_date = input
            .due_date
            .or(structure.valid_to)
            .unwrap_or_else(|| today + Duration::days(DEFAULT_DUE_DAYS));

        let invoice_number = self
            .store
            .next_invoice_number(input.school_id, today.year())
            .await?;

        let now = Utc::now();
        let invoice = FeeInvoice {
            invoice_id: Uuid::new_v4(),
            school_id: input.school_id,
            enrollment_id: input.enrollment_id,
            fee_structure_id: input.fee_structure_id,
            invoice_number,
            academic_year: input.academic_year.clone(),
            issue_date: today,
            due_date,
            total: structure.amount,
            paid: Decimal::ZERO,
            balance: structure.amount,
            status: InvoiceStatus::Pending.as_str().to_string(),
            cancelled_reason: None,
            created_utc: now,
            updated_utc: now,
        };

        let created = self.store.insert_invoice(invoice).await?;
        self.store
            .mark_fee_structure_issued(input.fee_structure_id)
            .await?;

        INVOICES_TOTAL
            .with_label_values(&[InvoiceStatus::Pending.as_str()])
            .inc();
        info!(
            invoice_id = %created.invoice_id,
            invoice_number = %created.invoice_number,
            "Invoice issued"
        );
        Ok(created)
    }

    pub async fn get_invoice(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<FeeInvoice, AppError> {
        self.store
            .get_invoice(school_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))
    }

    pub async fn list_invoices(
        &self,
        school_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<FeeInvoice>, AppError> {
        self.store.list_invoices(school_id, filter).await
    }

    /// Cancel an invoice. Only allowed while nothing has been paid against
    /// it; re-cancelling is a no-op.
    #[instrument(skip(self), fields(school_id = %school_id, invoice_id = %id))]
    pub async fn cancel_invoice(
        &self,
        school_id: Uuid,
        id: Uuid,
        reason: &str,
    ) -> Result<FeeInvoice, AppError> {
        let invoice = self.get_invoice(school_id, id).await?;

        if invoice.status() == InvoiceStatus::Cancelled {
            return Ok(invoice);
        }
        if invoice.paid > Decimal::ZERO {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} has recorded payments and cannot be cancelled",
                invoice.invoice_number
            )));
        }

        let cancelled = self.store.mark_invoice_cancelled(id, reason).await?;
        INVOICES_TOTAL
            .with_label_values(&[InvoiceStatus::Cancelled.as_str()])
            .inc();
        self.notifier.notify(
            NotifyEvent::InvoiceStatusChanged,
            json!({
                "invoice_id": cancelled.invoice_id,
                "invoice_number": cancelled.invoice_number,
                "status": cancelled.status,
                "reason": reason,
            }),
        );
        Ok(cancelled)
    }

    /// Flip invoices past their due date to overdue. Touches status only,
    /// never the money columns. Returns the number of invoices flipped.
    #[instrument(skip(self))]
    pub async fn sweep_overdue(&self, today: NaiveDate) -> Result<usize, AppError> {
        let due = self.store.list_invoices_due_before(today).await?;
        let mut flipped = 0;

        for invoice in due {
            let status = recompute_status(invoice.paid, invoice.total, invoice.due_date, today);
            if status == InvoiceStatus::Overdue && invoice.status() != InvoiceStatus::Overdue {
                self.store
                    .update_invoice_amounts(
                        invoice.invoice_id,
                        invoice.paid,
                        invoice.balance,
                        status,
                    )
                    .await?;
                INVOICES_TOTAL
                    .with_label_values(&[InvoiceStatus::Overdue.as_str()])
                    .inc();
                self.notifier.notify(
                    NotifyEvent::InvoiceStatusChanged,
                    json!({
                        "invoice_id": invoice.invoice_id,
                        "invoice_number": invoice.invoice_number,
                        "status": InvoiceStatus::Overdue.as_str(),
                    }),
                );
                flipped += 1;
            }
        }

        if flipped > 0 {
            info!(flipped, "Overdue sweep completed");
        }
        Ok(flipped)
    }
}
