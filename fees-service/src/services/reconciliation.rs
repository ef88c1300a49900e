//! Reconciliation scheduler.
//!
//! Callbacks get lost: providers retry for a while and then give up, and a
//! crashed webhook handler leaves a payment pending forever. The scheduler
//! periodically polls the provider for every stale pending payment and
//! drives the result through the same idempotent apply path the webhook
//! uses, so a poll and a late callback can race safely. It also flips
//! invoices past their due date to overdue.

use crate::gateways::{GatewayRegistry, GatewayStatus};
use crate::models::Payment;
use crate::services::applicator::PaymentApplicator;
use crate::services::invoices::InvoiceManager;
use crate::services::ledger::LedgerStore;
use crate::services::metrics::RECONCILIATION_OUTCOMES_TOTAL;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::ReconciliationConfig;

/// Failure reason recorded when a pending payment outlives the maximum age.
pub const TIMEOUT_REASON: &str = "TIMEOUT";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub recovered: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub still_pending: usize,
    pub errors: usize,
    pub overdue_flipped: usize,
}

pub struct ReconciliationScheduler {
    store: Arc<dyn LedgerStore>,
    applicator: Arc<PaymentApplicator>,
    invoices: Arc<InvoiceManager>,
    gateways: Arc<GatewayRegistry>,
    config: ReconciliationConfig,
    shutdown: CancellationToken,
}

impl ReconciliationScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        applicator: Arc<PaymentApplicator>,
        invoices: Arc<InvoiceManager>,
        gateways: Arc<GatewayRegistry>,
        config: ReconciliationConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            applicator,
            invoices,
            gateways,
            config,
            shutdown,
        }
    }

    /// Run the scheduler until the shutdown token fires.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            info!(
                interval_secs = self.config.interval_secs,
                stale_after_secs = self.config.stale_after_secs,
                give_up_after_secs = self.config.give_up_after_secs,
                "Reconciliation scheduler started"
            );

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("Reconciliation scheduler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let summary = self.run_cycle().await;
                        if summary != CycleSummary::default() {
                            info!(
                                recovered = summary.recovered,
                                failed = summary.failed,
                                timed_out = summary.timed_out,
                                still_pending = summary.still_pending,
                                errors = summary.errors,
                                overdue_flipped = summary.overdue_flipped,
                                "Reconciliation cycle completed"
                            );
                        }
                    }
                }
            }
        })
    }

    /// One reconciliation pass. Public so tests (and an operator tool) can
    /// drive it without the timer.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let now = Utc::now();
        let stale_cutoff = now - ChronoDuration::seconds(self.config.stale_after_secs);

        let pending = match self.store.list_pending_gateway_payments(stale_cutoff).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Failed to list pending gateway payments");
                summary.errors += 1;
                return summary;
            }
        };

        for payment in pending {
            self.reconcile_payment(&payment, &mut summary).await;
        }

        match self.invoices.sweep_overdue(now.date_naive()).await {
            Ok(flipped) => summary.overdue_flipped = flipped,
            Err(e) => {
                warn!(error = %e, "Overdue sweep failed");
                summary.errors += 1;
            }
        }

        summary
    }

    async fn reconcile_payment(&self, payment: &Payment, summary: &mut CycleSummary) {
        let Some(external_ref) = payment.external_ref.as_deref() else {
            return;
        };
        let too_old = payment.initiated_utc
            < Utc::now() - ChronoDuration::seconds(self.config.give_up_after_secs);

        let gateway = match self.gateways.for_method(payment.method()) {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!(
                    payment_id = %payment.payment_id,
                    error = %e,
                    "No gateway for pending payment"
                );
                summary.errors += 1;
                return;
            }
        };

        let outcome = match gateway.query_status(external_ref).await {
            Ok(GatewayStatus::Success { amount, .. }) => {
                match self
                    .applicator
                    .confirm_gateway_payment(external_ref, payment.method(), amount)
                    .await
                {
                    Ok(_) => {
                        summary.recovered += 1;
                        "recovered"
                    }
                    Err(e) => {
                        warn!(
                            payment_id = %payment.payment_id,
                            error = %e,
                            "Failed to apply recovered payment"
                        );
                        summary.errors += 1;
                        "error"
                    }
                }
            }
            Ok(GatewayStatus::Failed { reason }) => {
                match self.applicator.fail_payment(external_ref, &reason).await {
                    Ok(_) => {
                        summary.failed += 1;
                        "failed"
                    }
                    Err(e) => {
                        warn!(payment_id = %payment.payment_id, error = %e, "Failed to mark payment failed");
                        summary.errors += 1;
                        "error"
                    }
                }
            }
            Ok(GatewayStatus::Pending) if too_old => {
                match self.applicator.fail_payment(external_ref, TIMEOUT_REASON).await {
                    Ok(_) => {
                        summary.timed_out += 1;
                        "timed_out"
                    }
                    Err(e) => {
                        warn!(payment_id = %payment.payment_id, error = %e, "Failed to time out payment");
                        summary.errors += 1;
                        "error"
                    }
                }
            }
            Ok(GatewayStatus::Pending) => {
                summary.still_pending += 1;
                "still_pending"
            }
            Err(e) if too_old => {
                warn!(
                    payment_id = %payment.payment_id,
                    error = %e,
                    "Status query failing past the maximum age, timing out"
                );
                match self.applicator.fail_payment(external_ref, TIMEOUT_REASON).await {
                    Ok(_) => {
                        summary.timed_out += 1;
                        "timed_out"
                    }
                    Err(e) => {
                        warn!(payment_id = %payment.payment_id, error = %e, "Failed to time out payment");
                        summary.errors += 1;
                        "error"
                    }
                }
            }
            Err(e) => {
                warn!(payment_id = %payment.payment_id, error = %e, "Status query failed");
                summary.errors += 1;
                "error"
            }
        };

        RECONCILIATION_OUTCOMES_TOTAL
            .with_label_values(&[outcome])
            .inc();
    }
}
