//! Concurrency permits.
//!
//! - [`LeasePermitPool`]: non-blocking acquire/release of TTL-bounded leases in the shared store.
//! - [`AdmissionLease`]: the permit as seen by admitted work, with an exactly-once release.

mod lease;
mod pool;

pub use lease::AdmissionLease;
pub use pool::LeasePermitPool;
