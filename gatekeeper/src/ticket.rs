//! Admission tickets and their identifiers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Stand-in deadline for waits too long to represent.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Caller-supplied request identifier. Opaque, globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random id for callers that do not bring their own.
    pub fn generate() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a leased permit.
///
/// Releasing requires the exact id handed out at acquisition, so a stale holder cannot
/// release someone else's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermitId(uuid::Uuid);

impl PermitId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for PermitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PermitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a ticket in the admission state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Enqueued,
    Claimed,
    PermitHeld,
    Dispatched,
    Cancelled,
    TimedOut,
    /// Coordination store failed underneath the ticket.
    Failed,
}

impl TicketState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Dispatched | Self::Cancelled | Self::TimedOut | Self::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Claimed => "claimed",
            Self::PermitHeld => "permit_held",
            Self::Dispatched => "dispatched",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        }
    }
}

/// One request's attempt to obtain a capacity slot.
#[derive(Debug)]
pub struct AdmissionTicket {
    request_id: RequestId,
    sequence: u64,
    enqueued_at: Instant,
    deadline: Instant,
    cancelled: bool,
    held_permit: Option<PermitId>,
    state: TicketState,
}

impl AdmissionTicket {
    pub fn new(request_id: RequestId, sequence: u64, max_wait: Duration) -> Self {
        let enqueued_at = Instant::now();
        Self {
            request_id,
            sequence,
            enqueued_at,
            deadline: enqueued_at
                .checked_add(max_wait)
                .unwrap_or(enqueued_at + UNBOUNDED_WAIT),
            cancelled: false,
            held_permit: None,
            state: TicketState::Enqueued,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.deadline
    }

    pub fn state(&self) -> TicketState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Back to the queue under a fresh sequence. The old position is lost.
    pub(crate) fn requeue(&mut self, sequence: u64) {
        debug_assert!(self.held_permit.is_none(), "requeue while holding a permit");
        self.sequence = sequence;
        self.state = TicketState::Enqueued;
    }

    pub(crate) fn set_claimed(&mut self) {
        self.state = TicketState::Claimed;
    }

    pub(crate) fn set_permit_held(&mut self, permit: PermitId) {
        debug_assert!(self.held_permit.is_none(), "ticket already holds a permit");
        self.held_permit = Some(permit);
        self.state = TicketState::PermitHeld;
    }

    /// Forget the held permit. Returns it so the caller can release it.
    pub(crate) fn take_permit(&mut self) -> Option<PermitId> {
        self.held_permit.take()
    }

    /// The permit moves into the dispatched job's lease.
    pub(crate) fn set_dispatched(&mut self) {
        self.held_permit = None;
        self.state = TicketState::Dispatched;
    }

    pub(crate) fn set_cancelled(&mut self) {
        self.cancelled = true;
        self.state = TicketState::Cancelled;
    }

    pub(crate) fn set_timed_out(&mut self) {
        self.state = TicketState::TimedOut;
    }

    pub(crate) fn set_failed(&mut self) {
        self.state = TicketState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_terminal() {
        assert!(!TicketState::Enqueued.is_terminal());
        assert!(!TicketState::Claimed.is_terminal());
        assert!(!TicketState::PermitHeld.is_terminal());
        assert!(TicketState::Dispatched.is_terminal());
        assert!(TicketState::Cancelled.is_terminal());
        assert!(TicketState::TimedOut.is_terminal());
        assert!(TicketState::Failed.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_strictly_after_max_wait() {
        let ticket = AdmissionTicket::new("r1".into(), 1, Duration::from_secs(2));
        assert!(!ticket.is_expired(ticket.deadline()));
        assert!(ticket.is_expired(ticket.deadline() + Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn zero_wait_expires_immediately_after_enqueue() {
        let ticket = AdmissionTicket::new("r1".into(), 1, Duration::ZERO);
        assert_eq!(ticket.deadline(), ticket.enqueued_at());
    }

    #[tokio::test]
    async fn huge_wait_does_not_overflow() {
        let ticket = AdmissionTicket::new("r1".into(), 1, Duration::MAX);
        assert!(!ticket.is_expired(Instant::now()));
    }

    #[tokio::test]
    async fn requeue_takes_new_sequence() {
        let mut ticket = AdmissionTicket::new("r1".into(), 3, Duration::from_secs(1));
        ticket.set_claimed();
        ticket.requeue(9);
        assert_eq!(ticket.sequence(), 9);
        assert_eq!(ticket.state(), TicketState::Enqueued);
    }

    #[tokio::test]
    async fn cancel_is_sticky() {
        let mut ticket = AdmissionTicket::new("r1".into(), 1, Duration::from_secs(1));
        ticket.set_cancelled();
        assert!(ticket.is_cancelled());
        assert!(ticket.is_terminal());
    }

    #[test]
    fn request_id_generate_is_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}
