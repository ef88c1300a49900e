//! Ledger store boundary.
//!
//! `LedgerStore` is the persistence seam for the billing core. The Postgres
//! implementation lives in [`crate::services::database`]; the in-memory
//! implementation here backs tests and gateway-less development. Both
//! enforce the uniqueness rules (invoice number, payment reference,
//! gateway external ref) that the idempotent apply path relies on.

use crate::models::{
    CreateFeeStructure, FeeInvoice, FeeStructure, InvoiceStatus, ListInvoicesFilter,
    ListPaymentsFilter, Payment, PaymentStatus, Refund, ReviewFlag,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use service_core::error::AppError;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Fee structures
    async fn insert_fee_structure(&self, input: &CreateFeeStructure)
        -> Result<FeeStructure, AppError>;
    async fn get_fee_structure(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<Option<FeeStructure>, AppError>;
    async fn list_fee_structures(&self, school_id: Uuid) -> Result<Vec<FeeStructure>, AppError>;
    async fn mark_fee_structure_issued(&self, id: Uuid) -> Result<(), AppError>;
    async fn retire_fee_structure(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<Option<FeeStructure>, AppError>;

    // Invoices
    async fn next_invoice_number(&self, school_id: Uuid, year: i32) -> Result<String, AppError>;
    async fn insert_invoice(&self, invoice: FeeInvoice) -> Result<FeeInvoice, AppError>;
    async fn get_invoice(&self, school_id: Uuid, id: Uuid)
        -> Result<Option<FeeInvoice>, AppError>;
    async fn get_invoice_by_id(&self, id: Uuid) -> Result<Option<FeeInvoice>, AppError>;
    async fn find_open_invoice(
        &self,
        school_id: Uuid,
        enrollment_id: Uuid,
        fee_structure_id: Uuid,
        academic_year: &str,
    ) -> Result<Option<FeeInvoice>, AppError>;
    async fn list_invoices(
        &self,
        school_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<FeeInvoice>, AppError>;
    async fn update_invoice_amounts(
        &self,
        id: Uuid,
        paid: Decimal,
        balance: Decimal,
        status: InvoiceStatus,
    ) -> Result<FeeInvoice, AppError>;
    async fn mark_invoice_cancelled(&self, id: Uuid, reason: &str)
        -> Result<FeeInvoice, AppError>;
    async fn list_invoices_due_before(&self, cutoff: NaiveDate)
        -> Result<Vec<FeeInvoice>, AppError>;

    // Payments
    async fn insert_payment(&self, payment: Payment) -> Result<Payment, AppError>;
    async fn get_payment(&self, school_id: Uuid, id: Uuid) -> Result<Option<Payment>, AppError>;
    async fn find_payment_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Payment>, AppError>;
    async fn complete_payment(
        &self,
        id: Uuid,
        amount: Decimal,
        applied_amount: Decimal,
        review_flag: Option<ReviewFlag>,
    ) -> Result<Payment, AppError>;
    async fn update_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> Result<Payment, AppError>;
    async fn list_payments(
        &self,
        school_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, AppError>;
    async fn list_pending_gateway_payments(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Payment>, AppError>;

    // Refunds
    async fn insert_refund(&self, refund: Refund) -> Result<Refund, AppError>;
    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, AppError>;
}

#[derive(Default)]
struct MemoryState {
    fee_structures: HashMap<Uuid, FeeStructure>,
    invoices: HashMap<Uuid, FeeInvoice>,
    payments: HashMap<Uuid, Payment>,
    refunds: HashMap<Uuid, Refund>,
    invoice_seq: HashMap<(Uuid, i32), i64>,
}

/// In-memory ledger store. Uniqueness rules mirror the Postgres schema.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: RwLock<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_fee_structure(
        &self,
        input: &CreateFeeStructure,
    ) -> Result<FeeStructure, AppError> {
        let mut state = self.state.write().await;

        let duplicate = state.fee_structures.values().any(|fs| {
            fs.school_id == input.school_id
                && fs.name == input.name
                && fs.academic_year == input.academic_year
        });
        if duplicate {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Fee structure '{}' already exists for {}",
                input.name,
                input.academic_year
            )));
        }

        let fs = FeeStructure {
            fee_structure_id: Uuid::new_v4(),
            school_id: input.school_id,
            name: input.name.clone(),
            fee_type: input.fee_type.as_str().to_string(),
            frequency: input.frequency.as_str().to_string(),
            amount: input.amount,
            mandatory: input.mandatory,
            class_level: input.class_level.clone(),
            academic_year: input.academic_year.clone(),
            valid_from: input.valid_from,
            valid_to: input.valid_to,
            active: true,
            issued: false,
            created_utc: Utc::now(),
        };
        state.fee_structures.insert(fs.fee_structure_id, fs.clone());
        Ok(fs)
    }

    async fn get_fee_structure(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<Option<FeeStructure>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .fee_structures
            .get(&id)
            .filter(|fs| fs.school_id == school_id)
            .cloned())
    }

    async fn list_fee_structures(&self, school_id: Uuid) -> Result<Vec<FeeStructure>, AppError> {
        let state = self.state.read().await;
        let mut items: Vec<_> = state
            .fee_structures
            .values()
            .filter(|fs| fs.school_id == school_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(items)
    }

    async fn mark_fee_structure_issued(&self, id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        if let Some(fs) = state.fee_structures.get_mut(&id) {
            fs.issued = true;
        }
        Ok(())
    }

    async fn retire_fee_structure(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<Option<FeeStructure>, AppError> {
        let mut state = self.state.write().await;
        match state.fee_structures.get_mut(&id) {
            Some(fs) if fs.school_id == school_id => {
                fs.active = false;
                Ok(Some(fs.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn next_invoice_number(&self, school_id: Uuid, year: i32) -> Result<String, AppError> {
        let mut state = self.state.write().await;
        let seq = state.invoice_seq.entry((school_id, year)).or_insert(0);
        *seq += 1;
        Ok(format!("INV-{}-{:05}", year, seq))
    }

    async fn insert_invoice(&self, invoice: FeeInvoice) -> Result<FeeInvoice, AppError> {
        let mut state = self.state.write().await;
        if state
            .invoices
            .values()
            .any(|inv| inv.invoice_number == invoice.invoice_number)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice number {} already exists",
                invoice.invoice_number
            )));
        }
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(
        &self,
        school_id: Uuid,
        id: Uuid,
    ) -> Result<Option<FeeInvoice>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .get(&id)
            .filter(|inv| inv.school_id == school_id)
            .cloned())
    }

    async fn get_invoice_by_id(&self, id: Uuid) -> Result<Option<FeeInvoice>, AppError> {
        let state = self.state.read().await;
        Ok(state.invoices.get(&id).cloned())
    }

    async fn find_open_invoice(
        &self,
        school_id: Uuid,
        enrollment_id: Uuid,
        fee_structure_id: Uuid,
        academic_year: &str,
    ) -> Result<Option<FeeInvoice>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .values()
            .find(|inv| {
                inv.school_id == school_id
                    && inv.enrollment_id == enrollment_id
                    && inv.fee_structure_id == fee_structure_id
                    && inv.academic_year == academic_year
                    && inv.status().is_open()
            })
            .cloned())
    }

    async fn list_invoices(
        &self,
        school_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<FeeInvoice>, AppError> {
        let state = self.state.read().await;
        let mut items: Vec<_> = state
            .invoices
            .values()
            .filter(|inv| inv.school_id == school_id)
            .filter(|inv| {
                filter
                    .enrollment_id
                    .map_or(true, |e| inv.enrollment_id == e)
            })
            .filter(|inv| filter.status.map_or(true, |s| inv.status() == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(items)
    }

    async fn update_invoice_amounts(
        &self,
        id: Uuid,
        paid: Decimal,
        balance: Decimal,
        status: InvoiceStatus,
    ) -> Result<FeeInvoice, AppError> {
        let mut state = self.state.write().await;
        let invoice = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        if paid < Decimal::ZERO || balance < Decimal::ZERO {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Balance invariant violated for invoice {}",
                id
            )));
        }
        invoice.paid = paid;
        invoice.balance = balance;
        invoice.status = status.as_str().to_string();
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn mark_invoice_cancelled(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<FeeInvoice, AppError> {
        let mut state = self.state.write().await;
        let invoice = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        invoice.status = InvoiceStatus::Cancelled.as_str().to_string();
        invoice.cancelled_reason = Some(reason.to_string());
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn list_invoices_due_before(
        &self,
        cutoff: NaiveDate,
    ) -> Result<Vec<FeeInvoice>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .values()
            .filter(|inv| {
                inv.due_date < cutoff
                    && inv.balance > Decimal::ZERO
                    && matches!(
                        inv.status(),
                        InvoiceStatus::Pending | InvoiceStatus::Partial
                    )
            })
            .cloned()
            .collect())
    }

    async fn insert_payment(&self, payment: Payment) -> Result<Payment, AppError> {
        let mut state = self.state.write().await;
        if state
            .payments
            .values()
            .any(|p| p.reference == payment.reference)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment reference {} already exists",
                payment.reference
            )));
        }
        if let Some(ref external_ref) = payment.external_ref {
            if state
                .payments
                .values()
                .any(|p| p.external_ref.as_deref() == Some(external_ref.as_str()))
            {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Payment with external ref {} already exists",
                    external_ref
                )));
            }
        }
        state.payments.insert(payment.payment_id, payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, school_id: Uuid, id: Uuid) -> Result<Option<Payment>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .get(&id)
            .filter(|p| p.school_id == Some(school_id))
            .cloned())
    }

    async fn find_payment_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Payment>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.external_ref.as_deref() == Some(external_ref))
            .cloned())
    }

    async fn complete_payment(
        &self,
        id: Uuid,
        amount: Decimal,
        applied_amount: Decimal,
        review_flag: Option<ReviewFlag>,
    ) -> Result<Payment, AppError> {
        let mut state = self.state.write().await;
        let payment = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;
        payment.amount = amount;
        payment.applied_amount = applied_amount;
        payment.status = PaymentStatus::Completed.as_str().to_string();
        payment.review_flag = review_flag.map(|f| f.as_str().to_string());
        payment.completed_utc = Some(Utc::now());
        Ok(payment.clone())
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> Result<Payment, AppError> {
        let mut state = self.state.write().await;
        let payment = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;
        payment.status = status.as_str().to_string();
        if let Some(reason) = failure_reason {
            payment.failure_reason = Some(reason.to_string());
        }
        if status.is_terminal() && payment.completed_utc.is_none() {
            payment.completed_utc = Some(Utc::now());
        }
        Ok(payment.clone())
    }

    async fn list_payments(
        &self,
        school_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, AppError> {
        let state = self.state.read().await;

        let enrollment_invoices: Option<Vec<Uuid>> = filter.enrollment_id.map(|enrollment_id| {
            state
                .invoices
                .values()
                .filter(|inv| inv.enrollment_id == enrollment_id)
                .map(|inv| inv.invoice_id)
                .collect()
        });

        let mut items: Vec<_> = state
            .payments
            .values()
            .filter(|p| p.school_id == Some(school_id))
            .filter(|p| filter.invoice_id.map_or(true, |id| p.invoice_id == Some(id)))
            .filter(|p| {
                enrollment_invoices.as_ref().map_or(true, |ids| {
                    p.invoice_id.map_or(false, |id| ids.contains(&id))
                })
            })
            .filter(|p| filter.status.map_or(true, |s| p.status() == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.initiated_utc.cmp(&a.initiated_utc));
        Ok(items)
    }

    async fn list_pending_gateway_payments(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Payment>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .filter(|p| {
                p.status() == PaymentStatus::Pending
                    && p.external_ref.is_some()
                    && p.initiated_utc < older_than
            })
            .cloned()
            .collect())
    }

    async fn insert_refund(&self, refund: Refund) -> Result<Refund, AppError> {
        let mut state = self.state.write().await;
        state.refunds.insert(refund.refund_id, refund.clone());
        Ok(refund)
    }

    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .refunds
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect())
    }
}
