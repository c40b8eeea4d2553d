//! Wake-up plumbing for queued tickets.

mod coordinator;
mod registry;

pub use coordinator::NotificationCoordinator;
pub use registry::{LocalPollRegistry, RetryFn};
