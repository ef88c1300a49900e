//! Notification hook fired on ledger events.
//!
//! Delivery (SMS/email/push) belongs to the notification subsystem; the
//! billing core only emits events. Failures are fire-and-forget and never
//! roll back a ledger operation.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    PaymentCompleted,
    PaymentFailed,
    InvoiceStatusChanged,
    RefundProcessed,
}

impl NotifyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyEvent::PaymentCompleted => "payment.completed",
            NotifyEvent::PaymentFailed => "payment.failed",
            NotifyEvent::InvoiceStatusChanged => "invoice.status_changed",
            NotifyEvent::RefundProcessed => "refund.processed",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent, payload: Value);
}

/// Default notifier: emits the event into the structured log stream, where
/// the notification relay picks it up.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: NotifyEvent, payload: Value) {
        tracing::info!(event = event.as_str(), payload = %payload, "Billing event");
    }
}
