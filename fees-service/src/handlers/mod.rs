//! HTTP handlers for the administrative surface and gateway webhooks.

pub mod fee_structures;
pub mod invoices;
pub mod payments;
pub mod webhooks;

use serde::Deserialize;
use uuid::Uuid;

/// School scope for reads; passed explicitly rather than held as ambient
/// state.
#[derive(Debug, Deserialize)]
pub struct SchoolQuery {
    pub school_id: Uuid,
}
