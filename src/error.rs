//! Error taxonomy for the collection pipeline.
//!
//! Failures that are absorbed and reported per scope (tenant, user, message)
//! are typed here so outcomes can carry them as values instead of steering
//! control flow. Storage failures stay `anyhow` at the store boundary and
//! abort the whole persist call; duplicate content is not an error at all —
//! it is the expected skip path of the storage uniqueness constraint.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectError {
    /// Token acquisition failed. Isolates to one tenant: the tenant
    /// contributes zero messages and the batch continues.
    #[error("auth failed for tenant {tenant}: {reason}")]
    Auth { tenant: String, reason: String },

    /// A paginated listing returned non-success. Aborts the affected scope:
    /// the whole tenant for user enumeration, the remaining page sequence
    /// for a message listing.
    #[error("listing failed for {scope}: {reason}")]
    Listing { scope: String, reason: String },

    /// A MIME or attachment side fetch failed. Never fatal: the owning
    /// message proceeds with whatever was retrieved.
    #[error("fetch failed for message {message_id}: {reason}")]
    Fetch { message_id: String, reason: String },
}

impl CollectError {
    /// Whether this error aborted collection for its tenant entirely.
    pub fn is_tenant_fatal(&self) -> bool {
        matches!(self, CollectError::Auth { .. })
            || matches!(self, CollectError::Listing { scope, .. } if scope.starts_with("users"))
    }
}
