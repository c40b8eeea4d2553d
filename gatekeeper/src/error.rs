//! Errors surfaced by the admission layer.
//!
//! Capacity exhaustion, permit-race losses and downstream rejections are not errors: they
//! keep the ticket queued. Only coordination failures and misuse reach the caller.

use crate::store::StoreError;
use crate::ticket::RequestId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("admission node is shutting down")]
    ShuttingDown,
    #[error("request {0} is already being admitted")]
    DuplicateRequest(RequestId),
}
