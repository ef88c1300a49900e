pub mod applicator;
pub mod database;
pub mod invoices;
pub mod ledger;
pub mod metrics;
pub mod notifier;
pub mod reconciliation;

pub use metrics::{get_metrics, init_metrics};
