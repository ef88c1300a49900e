//! Payment applicator: the only component permitted to mutate an invoice's
//! `paid`/`balance`/`status` in response to money events.
//!
//! The critical section (read balance, decide, write balance) is serialized
//! per invoice through a keyed lock table. Two payments racing for the same
//! invoice never both observe the pre-update balance; unrelated invoices
//! proceed in parallel.

use crate::models::{
    CreateRefund, FeeInvoice, InvoiceStatus, Payment, PaymentMethod, PaymentStatus, Refund,
    RefundStatus, ReviewFlag,
};
use crate::services::invoices::recompute_status;
use crate::services::ledger::LedgerStore;
use crate::services::metrics::{PAYMENTS_APPLIED_TOTAL, PAYMENTS_FLAGGED_TOTAL};
use crate::services::notifier::{Notifier, NotifyEvent};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use service_core::error::AppError;

/// Input for applying a payment against an invoice.
#[derive(Debug, Clone)]
pub struct ApplyPayment {
    pub school_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub external_ref: Option<String>,
    pub payer_ref: Option<String>,
    pub recorded_by: Option<Uuid>,
}

pub struct PaymentApplicator {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PaymentApplicator {
    pub fn new(store: Arc<dyn LedgerStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            locks: DashMap::new(),
        }
    }

    /// Lock scoped to one invoice (or, for orphaned refunds, one payment).
    fn keyed_lock(&self, key: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply a payment to an invoice, exactly once.
    ///
    /// If `external_ref` is present it is the idempotency key: a repeat of
    /// an already-completed confirmation returns the existing payment
    /// without touching the ledger. Manual methods reject overpayment;
    /// gateway methods clamp and flag, since the money has already moved.
    #[instrument(skip(self, cmd), fields(invoice_id = %cmd.invoice_id, method = cmd.method.as_str()))]
    pub async fn apply_payment(&self, cmd: ApplyPayment) -> Result<Payment, AppError> {
        if cmd.amount <= Decimal::ZERO {
            return Err(AppError::validation(
                "amount",
                "Payment amount must be positive",
            ));
        }

        if let Some(existing) = self.find_completed_by_ref(cmd.external_ref.as_deref()).await? {
            return Ok(existing);
        }

        let lock = self.keyed_lock(cmd.invoice_id);
        let _guard = lock.lock().await;

        // A racing delivery may have won the lock first.
        if let Some(existing) = self.find_completed_by_ref(cmd.external_ref.as_deref()).await? {
            return Ok(existing);
        }

        let invoice = self
            .store
            .get_invoice(cmd.school_id, cmd.invoice_id)
            .await?;

        let invoice = match invoice {
            Some(inv) if inv.status() != InvoiceStatus::Cancelled => inv,
            other => {
                let invoice_id = other.as_ref().map(|inv| inv.invoice_id);
                if cmd.method.is_gateway() && cmd.external_ref.is_some() {
                    return self.persist_orphan(&cmd, invoice_id).await;
                }
                return match other {
                    Some(inv) => Err(AppError::Conflict(anyhow::anyhow!(
                        "Invoice {} is cancelled",
                        inv.invoice_number
                    ))),
                    None => Err(AppError::NotFound(anyhow::anyhow!("Invoice not found"))),
                };
            }
        };

        let (applied, review_flag) = if cmd.amount > invoice.balance {
            if cmd.method.is_gateway() {
                (invoice.balance, Some(ReviewFlag::OverConfirmation))
            } else {
                return Err(AppError::Overpayment(anyhow::anyhow!(
                    "Payment of {} exceeds outstanding balance {} on invoice {}",
                    cmd.amount,
                    invoice.balance,
                    invoice.invoice_number
                )));
            }
        } else {
            (cmd.amount, None)
        };

        let now = Utc::now();
        let payment = self
            .store
            .insert_payment(Payment {
                payment_id: Uuid::new_v4(),
                school_id: Some(cmd.school_id),
                invoice_id: Some(invoice.invoice_id),
                reference: Payment::new_reference(),
                amount: cmd.amount,
                applied_amount: applied,
                method: cmd.method.as_str().to_string(),
                status: PaymentStatus::Completed.as_str().to_string(),
                external_ref: cmd.external_ref.clone(),
                payer_ref: cmd.payer_ref.clone(),
                review_flag: review_flag.map(|f| f.as_str().to_string()),
                failure_reason: None,
                recorded_by: cmd.recorded_by,
                initiated_utc: now,
                completed_utc: Some(now),
            })
            .await?;

        self.settle_invoice(&invoice, applied, &payment).await?;
        Ok(payment)
    }

    /// Record a pending gateway payment after a successful `initiate`.
    /// The ledger is untouched until the provider confirms.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, external_ref = %external_ref))]
    pub async fn record_pending_payment(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
        method: PaymentMethod,
        external_ref: String,
        payer_ref: Option<String>,
    ) -> Result<Payment, AppError> {
        if amount <= Decimal::ZERO {
            return Err(AppError::validation(
                "amount",
                "Payment amount must be positive",
            ));
        }
        self.store
            .insert_payment(Payment {
                payment_id: Uuid::new_v4(),
                school_id: Some(school_id),
                invoice_id: Some(invoice_id),
                reference: Payment::new_reference(),
                amount,
                applied_amount: Decimal::ZERO,
                method: method.as_str().to_string(),
                status: PaymentStatus::Pending.as_str().to_string(),
                external_ref: Some(external_ref),
                payer_ref,
                review_flag: None,
                failure_reason: None,
                recorded_by: None,
                initiated_utc: Utc::now(),
                completed_utc: None,
            })
            .await
    }

    /// Drive a verified gateway SUCCESS event through the idempotent apply
    /// path. Used by both webhook delivery and the reconciliation sweep, so
    /// a callback and a poll racing for the same confirmation commit once.
    #[instrument(skip(self), fields(external_ref = %external_ref))]
    pub async fn confirm_gateway_payment(
        &self,
        external_ref: &str,
        method: PaymentMethod,
        confirmed_amount: Option<Decimal>,
    ) -> Result<Payment, AppError> {
        let pending = match self.store.find_payment_by_external_ref(external_ref).await? {
            Some(p) => p,
            None => {
                // Confirmation for money we never asked for. Keep it.
                let amount = confirmed_amount.ok_or_else(|| {
                    AppError::BadRequest(anyhow::anyhow!(
                        "Unmatched confirmation {} carries no amount",
                        external_ref
                    ))
                })?;
                if amount <= Decimal::ZERO {
                    return Err(AppError::validation(
                        "amount",
                        "Confirmed amount must be positive",
                    ));
                }
                warn!(external_ref, "Unmatched gateway confirmation, persisting as orphan");
                PAYMENTS_FLAGGED_TOTAL
                    .with_label_values(&[ReviewFlag::Orphaned.as_str()])
                    .inc();
                let now = Utc::now();
                return self
                    .store
                    .insert_payment(Payment {
                        payment_id: Uuid::new_v4(),
                        school_id: None,
                        invoice_id: None,
                        reference: Payment::new_reference(),
                        amount,
                        applied_amount: Decimal::ZERO,
                        method: method.as_str().to_string(),
                        status: PaymentStatus::Completed.as_str().to_string(),
                        external_ref: Some(external_ref.to_string()),
                        payer_ref: None,
                        review_flag: Some(ReviewFlag::Orphaned.as_str().to_string()),
                        failure_reason: None,
                        recorded_by: None,
                        initiated_utc: now,
                        completed_utc: Some(now),
                    })
                    .await;
            }
        };

        match pending.status() {
            PaymentStatus::Completed | PaymentStatus::Refunded => return Ok(pending),
            PaymentStatus::Failed | PaymentStatus::Cancelled => {
                // Terminal; money moved after we gave up. Surface loudly
                // instead of mutating a closed record.
                tracing::error!(
                    payment_id = %pending.payment_id,
                    external_ref,
                    "Success confirmation arrived for a payment already marked {}; manual reconciliation required",
                    pending.status
                );
                return Ok(pending);
            }
            PaymentStatus::Pending => {}
        }

        let invoice_id = pending
            .invoice_id
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("Pending payment has no invoice")))?;

        let lock = self.keyed_lock(invoice_id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a racing confirmation may have completed it.
        let pending = match self.store.find_payment_by_external_ref(external_ref).await? {
            Some(p) if p.status() == PaymentStatus::Pending => p,
            Some(p) => return Ok(p),
            None => return Err(AppError::NotFound(anyhow::anyhow!("Payment not found"))),
        };

        let confirmed = confirmed_amount.unwrap_or(pending.amount);
        let invoice = self.store.get_invoice_by_id(invoice_id).await?;

        let invoice = match invoice {
            Some(inv) if inv.status() != InvoiceStatus::Cancelled => inv,
            _ => {
                // Invoice vanished or was cancelled mid-flight; the money
                // still moved.
                warn!(
                    payment_id = %pending.payment_id,
                    invoice_id = %invoice_id,
                    "Confirmed payment no longer matches an open invoice, flagging as orphan"
                );
                PAYMENTS_FLAGGED_TOTAL
                    .with_label_values(&[ReviewFlag::Orphaned.as_str()])
                    .inc();
                let payment = self
                    .store
                    .complete_payment(
                        pending.payment_id,
                        confirmed,
                        Decimal::ZERO,
                        Some(ReviewFlag::Orphaned),
                    )
                    .await?;
                self.notifier.notify(
                    NotifyEvent::PaymentCompleted,
                    json!({
                        "payment_id": payment.payment_id,
                        "reference": payment.reference,
                        "amount": payment.amount,
                        "review_flag": payment.review_flag,
                    }),
                );
                return Ok(payment);
            }
        };

        let (applied, review_flag) = if confirmed > invoice.balance {
            (invoice.balance, Some(ReviewFlag::OverConfirmation))
        } else {
            (confirmed, None)
        };

        let payment = self
            .store
            .complete_payment(pending.payment_id, confirmed, applied, review_flag)
            .await?;

        self.settle_invoice(&invoice, applied, &payment).await?;
        Ok(payment)
    }

    /// Mark a pending gateway payment failed, idempotently, by external id.
    /// Never touches the invoice.
    #[instrument(skip(self), fields(external_ref = %external_ref))]
    pub async fn fail_payment(
        &self,
        external_ref: &str,
        reason: &str,
    ) -> Result<Option<Payment>, AppError> {
        match self.store.find_payment_by_external_ref(external_ref).await? {
            None => {
                warn!(external_ref, "Failure report for unknown payment");
                Ok(None)
            }
            Some(p) if p.status() == PaymentStatus::Pending => {
                let failed = self
                    .store
                    .update_payment_status(p.payment_id, PaymentStatus::Failed, Some(reason))
                    .await?;
                self.notifier.notify(
                    NotifyEvent::PaymentFailed,
                    json!({
                        "payment_id": failed.payment_id,
                        "reference": failed.reference,
                        "reason": reason,
                    }),
                );
                Ok(Some(failed))
            }
            Some(p) => Ok(Some(p)),
        }
    }

    /// Reverse part or all of a completed payment through the same
    /// per-invoice critical section as `apply_payment`.
    #[instrument(skip(self, input), fields(payment_id = %payment_id))]
    pub async fn refund_payment(
        &self,
        school_id: Uuid,
        payment_id: Uuid,
        input: CreateRefund,
    ) -> Result<Refund, AppError> {
        if input.amount <= Decimal::ZERO {
            return Err(AppError::validation(
                "amount",
                "Refund amount must be positive",
            ));
        }

        let payment = self
            .store
            .get_payment(school_id, payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

        if payment.status() != PaymentStatus::Completed {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Only completed payments can be refunded; payment {} is {}",
                payment.reference,
                payment.status
            )));
        }

        // Refunds of the same payment serialize on the invoice lock, or on
        // the payment itself when no invoice is attached (orphans).
        let lock = self.keyed_lock(payment.invoice_id.unwrap_or(payment.payment_id));
        let _guard = lock.lock().await;

        let payment = self
            .store
            .get_payment(school_id, payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;
        if payment.status() != PaymentStatus::Completed {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment {} is no longer refundable",
                payment.reference
            )));
        }

        let refunds = self.store.list_refunds_for_payment(payment_id).await?;
        let already_refunded: Decimal = refunds
            .iter()
            .filter(|r| r.status() == RefundStatus::Processed)
            .map(|r| r.amount)
            .sum();

        // Orphans never reached an invoice, so the full confirmed amount is
        // refundable; applied payments are bounded by what actually landed.
        let refundable_base = if payment.invoice_id.is_some() {
            payment.applied_amount
        } else {
            payment.amount
        };
        let remainder = refundable_base - already_refunded;

        if input.amount > remainder {
            return Err(AppError::validation(
                "amount",
                format!(
                    "Refund of {} exceeds refundable remainder {} on payment {}",
                    input.amount, remainder, payment.reference
                ),
            ));
        }

        if let Some(invoice_id) = payment.invoice_id {
            let invoice = self
                .store
                .get_invoice_by_id(invoice_id)
                .await?
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

            let new_paid = invoice.paid - input.amount;
            let new_balance = invoice.total - new_paid;
            let status = recompute_status(
                new_paid,
                invoice.total,
                invoice.due_date,
                Utc::now().date_naive(),
            );
            let updated = self
                .store
                .update_invoice_amounts(invoice_id, new_paid, new_balance, status)
                .await?;
            if updated.status != invoice.status {
                self.notify_status_change(&updated);
            }
        }

        let refund = self
            .store
            .insert_refund(Refund {
                refund_id: Uuid::new_v4(),
                payment_id,
                school_id: Some(school_id),
                amount: input.amount,
                status: RefundStatus::Processed.as_str().to_string(),
                reason: input.reason.clone(),
                processed_by: input.processed_by,
                created_utc: Utc::now(),
            })
            .await?;

        if already_refunded + input.amount >= refundable_base {
            self.store
                .update_payment_status(payment_id, PaymentStatus::Refunded, None)
                .await?;
        }

        self.notifier.notify(
            NotifyEvent::RefundProcessed,
            json!({
                "refund_id": refund.refund_id,
                "payment_id": payment_id,
                "amount": refund.amount,
                "reason": refund.reason,
            }),
        );

        info!(
            refund_id = %refund.refund_id,
            payment_reference = %payment.reference,
            amount = %refund.amount,
            "Refund processed"
        );
        Ok(refund)
    }

    async fn find_completed_by_ref(
        &self,
        external_ref: Option<&str>,
    ) -> Result<Option<Payment>, AppError> {
        let Some(external_ref) = external_ref else {
            return Ok(None);
        };
        let existing = self.store.find_payment_by_external_ref(external_ref).await?;
        Ok(existing.filter(|p| {
            matches!(
                p.status(),
                PaymentStatus::Completed | PaymentStatus::Refunded
            )
        }))
    }

    /// Commit the invoice side of a completed payment and fire notifications.
    async fn settle_invoice(
        &self,
        invoice: &FeeInvoice,
        applied: Decimal,
        payment: &Payment,
    ) -> Result<(), AppError> {
        let new_paid = invoice.paid + applied;
        let new_balance = invoice.total - new_paid;
        let status = recompute_status(
            new_paid,
            invoice.total,
            invoice.due_date,
            Utc::now().date_naive(),
        );
        let updated = self
            .store
            .update_invoice_amounts(invoice.invoice_id, new_paid, new_balance, status)
            .await?;

        PAYMENTS_APPLIED_TOTAL
            .with_label_values(&[payment.method.as_str()])
            .inc();
        if let Some(ref flag) = payment.review_flag {
            PAYMENTS_FLAGGED_TOTAL
                .with_label_values(&[flag.as_str()])
                .inc();
        }

        info!(
            payment_id = %payment.payment_id,
            invoice_number = %updated.invoice_number,
            applied = %applied,
            balance = %updated.balance,
            status = %updated.status,
            "Payment applied"
        );

        self.notifier.notify(
            NotifyEvent::PaymentCompleted,
            json!({
                "payment_id": payment.payment_id,
                "reference": payment.reference,
                "invoice_id": invoice.invoice_id,
                "amount": payment.amount,
                "applied_amount": applied,
                "review_flag": payment.review_flag,
            }),
        );
        if updated.status != invoice.status {
            self.notify_status_change(&updated);
        }
        Ok(())
    }

    fn notify_status_change(&self, invoice: &FeeInvoice) {
        self.notifier.notify(
            NotifyEvent::InvoiceStatusChanged,
            json!({
                "invoice_id": invoice.invoice_id,
                "invoice_number": invoice.invoice_number,
                "status": invoice.status,
                "balance": invoice.balance,
            }),
        );
    }

    /// Persist a gateway confirmation that cannot be applied to an open
    /// invoice. The money has moved; dropping the record is not an option.
    async fn persist_orphan(
        &self,
        cmd: &ApplyPayment,
        invoice_id: Option<Uuid>,
    ) -> Result<Payment, AppError> {
        warn!(
            invoice_id = ?invoice_id,
            external_ref = ?cmd.external_ref,
            "Gateway confirmation without an open invoice, flagging as orphan"
        );
        PAYMENTS_FLAGGED_TOTAL
            .with_label_values(&[ReviewFlag::Orphaned.as_str()])
            .inc();
        let now = Utc::now();
        self.store
            .insert_payment(Payment {
                payment_id: Uuid::new_v4(),
                school_id: Some(cmd.school_id),
                invoice_id,
                reference: Payment::new_reference(),
                amount: cmd.amount,
                applied_amount: Decimal::ZERO,
                method: cmd.method.as_str().to_string(),
                status: PaymentStatus::Completed.as_str().to_string(),
                external_ref: cmd.external_ref.clone(),
                payer_ref: cmd.payer_ref.clone(),
                review_flag: Some(ReviewFlag::Orphaned.as_str().to_string()),
                failure_reason: None,
                recorded_by: cmd.recorded_by,
                initiated_utc: now,
                completed_utc: Some(now),
            })
            .await
    }
}
