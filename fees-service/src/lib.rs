//! Fee billing and payment reconciliation service.
//!
//! Maintains money balances across fee invoices, payments and refunds for
//! school enrollments, and keeps them consistent while confirmations arrive
//! concurrently from manual entry, gateway webhooks and the reconciliation
//! sweep. Balance mutation is serialized per invoice; gateway confirmations
//! are deduplicated by the provider's request id.

pub mod config;
pub mod gateways;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
