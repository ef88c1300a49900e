//! Data models for fees-service.

mod fee_structure;
mod invoice;
mod payment;
mod refund;

pub use fee_structure::{CreateFeeStructure, FeeFrequency, FeeStructure, FeeType};
pub use invoice::{CreateInvoice, FeeInvoice, InvoiceStatus, ListInvoicesFilter};
pub use payment::{
    ListPaymentsFilter, Payment, PaymentMethod, PaymentStatus, ReviewFlag,
};
pub use refund::{CreateRefund, Refund, RefundStatus};
