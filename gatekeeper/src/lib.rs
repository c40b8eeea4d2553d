//! gatekeeper: cluster-wide admission control for streaming chat requests.
//!
//! Requests take a ticket, wait in a fair queue shared by every process, and run only while
//! holding a leased permit. Capacity changes are broadcast so waiters wake promptly; a slow
//! fallback sweep covers lost signals. Requests that wait too long get a graceful rejection
//! on their stream instead of an error.

pub mod config;
mod error;
pub mod executor;
pub mod node;
pub mod notify;
pub mod orchestrator;
pub mod permit;
pub mod queue;
pub mod rejection;
mod sequencer;
pub mod sink;
pub mod store;
pub mod ticket;
pub mod transport;

pub use config::{AdmissionConfig, ConfigHandle};
pub use error::AdmissionError;
pub use executor::{AdmittedTask, DispatchJob, Executor, SpawnExecutor, Submission};
pub use node::{AdmissionNode, AdmissionSnapshot, NodeBuilder};
pub use notify::{LocalPollRegistry, NotificationCoordinator};
pub use orchestrator::{
    AdmissionHandle, AdmissionOrchestrator, AdmissionOutcome, AdmissionRequest, CancelOnDrop,
};
pub use permit::{AdmissionLease, LeasePermitPool};
pub use queue::FairQueue;
pub use rejection::{
    MemoryRejectionLog, RecorderError, RejectedRequest, RejectionRecord, RejectionRecorder,
};
pub use sequencer::Sequencer;
pub use sink::{ChannelSink, FrameSink, NullSink, SinkError, StreamFrame};
pub use store::{CoordinationStore, MemoryStore, StoreError};
pub use ticket::{AdmissionTicket, PermitId, RequestId, TicketState};
