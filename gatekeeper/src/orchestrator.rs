//! Admission orchestrator: drives one ticket per caller through
//! `Enqueued -> Claimed -> PermitHeld -> Dispatched`, with the side exits `Cancelled`,
//! `TimedOut` and `Failed`.
//!
//! Each ticket is owned by a [`TicketRunner`] task. The runner serialises every transition
//! behind its own lock, so a sweep retry, the caller's cancel and the deadline timer can race
//! freely: whichever takes the lock first and finds the ticket non-terminal decides the
//! outcome, and the others become no-ops.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ConfigHandle;
use crate::error::AdmissionError;
use crate::executor::{AdmittedTask, DispatchJob, Executor, Submission};
use crate::notify::{NotificationCoordinator, RetryFn};
use crate::permit::{AdmissionLease, LeasePermitPool};
use crate::queue::FairQueue;
use crate::rejection::{RejectedRequest, RejectionRecord, RejectionRecorder, notify_rejection};
use crate::sink::{FrameSink, NullSink, StreamFrame};
use crate::store::StoreError;
use crate::ticket::{AdmissionTicket, RequestId, TicketState};

/// Queue entries outlive the caller's deadline by this much before the store drops them.
const QUEUE_ENTRY_GRACE: Duration = Duration::from_secs(30);

/// Pause before retrying a ticket the executor turned away.
const DOWNSTREAM_BACKOFF: Duration = Duration::from_millis(100);

/// A caller asking for a capacity slot.
pub struct AdmissionRequest {
    pub request_id: RequestId,
    /// Overrides the configured wait when set.
    pub max_wait: Option<Duration>,
    pub conversation_id: Option<String>,
    pub question: String,
    /// Receives the queued and rejection frames.
    pub sink: Arc<dyn FrameSink>,
}

impl AdmissionRequest {
    pub fn new(request_id: impl Into<RequestId>, question: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            max_wait: None,
            conversation_id: None,
            question: question.into(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// How a ticket left the admission layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Holding a permit; the task was handed to the executor.
    Dispatched,
    /// Admission control is disabled; the task ran without a permit.
    Bypassed,
    Cancelled,
    /// Deadline passed while queued. The rejection frames were sent.
    TimedOut(RejectionRecord),
    /// The coordination store failed.
    Failed(String),
}

impl AdmissionOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Bypassed)
    }
}

/// Caller-side view of a ticket.
pub struct AdmissionHandle {
    request_id: RequestId,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<AdmissionOutcome>>,
}

impl AdmissionHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Withdraw the request. Waiting tickets leave the queue; dispatched work is cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Guard that cancels the request when dropped, unless disarmed.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            token: Some(self.cancel.clone()),
        }
    }

    pub fn try_outcome(&self) -> Option<AdmissionOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the ticket to leave the admission layer.
    pub async fn outcome(&self) -> AdmissionOutcome {
        let mut rx = self.outcome.clone();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        settled.or_else(|| self.try_outcome()).unwrap_or_else(|| {
            AdmissionOutcome::Failed("admission task ended without an outcome".to_string())
        })
    }
}

/// Cancels the admission when dropped.
///
/// Move it into whatever lives as long as the caller (a response stream, a connection
/// task); a disconnect then withdraws the request.
pub struct CancelOnDrop {
    token: Option<CancellationToken>,
}

impl CancelOnDrop {
    pub fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

pub struct AdmissionOrchestrator {
    config: ConfigHandle,
    queue: FairQueue,
    pool: LeasePermitPool,
    coordinator: NotificationCoordinator,
    executor: Arc<dyn Executor>,
    recorder: Arc<dyn RejectionRecorder>,
    active: DashMap<RequestId, CancellationToken>,
    runners: TaskTracker,
    shutdown: CancellationToken,
}

impl AdmissionOrchestrator {
    pub(crate) fn new(
        config: ConfigHandle,
        queue: FairQueue,
        pool: LeasePermitPool,
        coordinator: NotificationCoordinator,
        executor: Arc<dyn Executor>,
        recorder: Arc<dyn RejectionRecorder>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            pool,
            coordinator,
            executor,
            recorder,
            active: DashMap::new(),
            runners: TaskTracker::new(),
            shutdown,
        })
    }

    /// Enter the queue and return immediately.
    ///
    /// Only a store failure during enqueue, a duplicate id or shutdown is reported here. All
    /// other outcomes arrive through the handle.
    pub async fn admit(
        self: &Arc<Self>,
        request: AdmissionRequest,
        task: AdmittedTask,
    ) -> Result<AdmissionHandle, AdmissionError> {
        if self.shutdown.is_cancelled() {
            return Err(AdmissionError::ShuttingDown);
        }
        let config = self.config.snapshot();
        let request_id = request.request_id.clone();
        let cancel = self.shutdown.child_token();

        if !config.global_enabled {
            tracing::debug!(%request_id, "Admission control disabled, bypassing queue");
            let lease = AdmissionLease::unmetered(request_id.clone(), cancel.clone());
            tokio::spawn(DispatchJob::new(lease, task).run());
            let (_, outcome) = watch::channel(Some(AdmissionOutcome::Bypassed));
            return Ok(AdmissionHandle {
                request_id,
                cancel,
                outcome,
            });
        }

        match self.active.entry(request_id.clone()) {
            Entry::Occupied(_) => return Err(AdmissionError::DuplicateRequest(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        let max_wait = request.max_wait.unwrap_or(config.max_wait);
        let sequence = match self
            .queue
            .enqueue(&request_id, max_wait.saturating_add(QUEUE_ENTRY_GRACE))
            .await
        {
            Ok(sequence) => sequence,
            Err(e) => {
                self.active.remove(&request_id);
                tracing::error!(%request_id, error = %e, "Failed to enqueue request");
                return Err(e.into());
            }
        };
        let ticket = AdmissionTicket::new(request_id.clone(), sequence, max_wait);
        tracing::debug!(%request_id, sequence, max_wait = ?max_wait, "Ticket enqueued");

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let runner = Arc::new(TicketRunner {
            orchestrator: Arc::clone(self),
            request_id: request_id.clone(),
            conversation_id: request.conversation_id,
            question: request.question,
            sink: request.sink,
            cancel: cancel.clone(),
            outcome: outcome_tx,
            state: Mutex::new(RunnerState {
                ticket,
                task: Some(task),
                not_before: None,
            }),
        });
        let owner = Arc::downgrade(&runner) as Weak<dyn Send + Sync>;
        self.coordinator
            .registry()
            .register(request_id.clone(), sequence, runner.retry_fn(), owner);
        self.runners.spawn(runner.run());

        Ok(AdmissionHandle {
            request_id,
            cancel,
            outcome: outcome_rx,
        })
    }

    /// Cancel a ticket that is still being admitted. Returns whether one was found.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        match self.active.get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Tickets still waiting or mid-transition on this process.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Wait for every ticket runner to finish. Called after the shutdown token fired.
    pub(crate) async fn drain(&self) {
        self.runners.close();
        self.runners.wait().await;
    }
}

struct RunnerState {
    ticket: AdmissionTicket,
    /// Taken on dispatch, handed back if the executor rejects.
    task: Option<AdmittedTask>,
    /// Set after a downstream rejection so the next sweep does not resubmit immediately.
    not_before: Option<Instant>,
}

struct TicketRunner {
    orchestrator: Arc<AdmissionOrchestrator>,
    request_id: RequestId,
    conversation_id: Option<String>,
    question: String,
    sink: Arc<dyn FrameSink>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<AdmissionOutcome>>,
    state: Mutex<RunnerState>,
}

impl TicketRunner {
    /// Sweep hook. Holds the runner weakly so an abandoned registration keeps nothing alive.
    fn retry_fn(self: &Arc<Self>) -> RetryFn {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(runner) = weak.upgrade() {
                    runner.advance(true).await;
                }
            }
            .boxed()
        })
    }

    async fn run(self: Arc<Self>) {
        // Fast path: a free slot may exist already.
        self.advance(false).await;
        if !self.is_settled() {
            self.announce_position().await;
        }

        let deadline = self.state.lock().await.ticket.deadline();
        let mut outcome = self.outcome.subscribe();
        tokio::select! {
            _ = async {
                let _ = outcome.wait_for(Option::is_some).await;
            } => {}
            _ = self.cancel.cancelled() => self.cancel_waiting().await,
            _ = tokio::time::sleep_until(deadline + Duration::from_millis(1)) => {
                self.time_out().await;
            }
        }
        self.orchestrator.active.remove(&self.request_id);
    }

    fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Record the outcome. Only the first call has any effect.
    fn complete(&self, outcome: AdmissionOutcome) -> bool {
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    async fn announce_position(&self) {
        match self.orchestrator.queue.position(&self.request_id).await {
            Ok(Some(position)) => {
                tracing::debug!(request_id = %self.request_id, position, "Waiting for capacity");
                if let Err(e) = self.sink.send(StreamFrame::Queued { position }).await {
                    tracing::debug!(request_id = %self.request_id, error = %e, "Queued frame not delivered");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(request_id = %self.request_id, error = %e, "Queue position unavailable");
            }
        }
    }

    /// One attempt to move the ticket forward. Sweeps call this for every local waiter.
    async fn advance(&self, respect_deadline: bool) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.try_advance(&mut state, respect_deadline).await {
            self.abandon(&mut state, e).await;
        }
    }

    async fn try_advance(
        &self,
        state: &mut RunnerState,
        respect_deadline: bool,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        if state.ticket.state() != TicketState::Enqueued
            || state.ticket.is_cancelled()
            || self.cancel.is_cancelled()
            || (respect_deadline && state.ticket.is_expired(now))
            || state.not_before.is_some_and(|at| now < at)
        {
            return Ok(());
        }

        let orch = &self.orchestrator;
        let available = orch.pool.available_count().await?;
        if available == 0 {
            return Ok(());
        }

        let claim = orch.queue.claim_if_eligible(&self.request_id, available).await?;
        if !claim.claimed {
            if claim.sequence.is_none() {
                tracing::warn!(request_id = %self.request_id, "Queue entry vanished, re-enqueueing");
                self.requeue(state).await?;
            }
            return Ok(());
        }
        state.ticket.set_claimed();

        let lease_ttl = orch.config.snapshot().lease;
        let Some(permit) = orch.pool.acquire(lease_ttl).await? else {
            tracing::warn!(
                request_id = %self.request_id,
                "Claimed but permit pool exhausted, re-enqueueing at the back"
            );
            self.requeue(state).await?;
            return Ok(());
        };
        state.ticket.set_permit_held(permit);

        let Some(task) = state.task.take() else {
            tracing::error!(request_id = %self.request_id, "Ticket holds a permit but has no task");
            state.ticket.set_failed();
            if let Some(permit) = state.ticket.take_permit() {
                orch.pool.release(permit).await?;
            }
            orch.coordinator.registry().deregister(&self.request_id);
            self.complete(AdmissionOutcome::Failed("admitted task missing".to_string()));
            return Ok(());
        };

        let lease = AdmissionLease::new(
            self.request_id.clone(),
            permit,
            orch.pool.clone(),
            orch.coordinator.clone(),
            self.cancel.clone(),
        );
        match orch.executor.submit(DispatchJob::new(lease, task)) {
            Submission::Accepted => {
                let waited = now.saturating_duration_since(state.ticket.enqueued_at());
                state.ticket.set_dispatched();
                orch.coordinator.registry().deregister(&self.request_id);
                tracing::info!(
                    request_id = %self.request_id,
                    sequence = state.ticket.sequence(),
                    waited_ms = waited.as_millis() as u64,
                    "Request admitted"
                );
                self.complete(AdmissionOutcome::Dispatched);
            }
            Submission::Rejected(job) => {
                tracing::warn!(request_id = %self.request_id, "Executor rejected admitted request, re-enqueueing");
                let (lease, task) = job.into_parts();
                state.task = Some(task);
                state.ticket.take_permit();
                lease.release().await;
                self.requeue(state).await?;
                state.not_before = Some(Instant::now() + DOWNSTREAM_BACKOFF);
                self.retry_after(DOWNSTREAM_BACKOFF);
            }
        }
        Ok(())
    }

    /// Back of the queue under a fresh sequence.
    async fn requeue(&self, state: &mut RunnerState) -> Result<(), StoreError> {
        let remaining = state
            .ticket
            .deadline()
            .saturating_duration_since(Instant::now());
        let orch = &self.orchestrator;
        let sequence = orch
            .queue
            .enqueue(&self.request_id, remaining.saturating_add(QUEUE_ENTRY_GRACE))
            .await?;
        state.ticket.requeue(sequence);
        orch.coordinator
            .registry()
            .update_sequence(&self.request_id, sequence);
        Ok(())
    }

    /// Nudge this ticket once the backoff elapsed, independent of other signals.
    fn retry_after(&self, delay: Duration) {
        let registry = Arc::clone(self.orchestrator.coordinator.registry());
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => registry.signal(),
            }
        });
    }

    async fn cancel_waiting(&self) {
        let mut state = self.state.lock().await;
        if state.ticket.is_terminal() {
            // Dispatched work watches the same token.
            return;
        }
        state.ticket.set_cancelled();
        let freed = self.release_slot(&mut state).await;
        drop(state);

        if freed && self.orchestrator.coordinator.publish().await.is_err() {
            tracing::debug!(request_id = %self.request_id, "Release not broadcast, fallback sweep will cover it");
        }
        self.sink.close().await;
        tracing::info!(request_id = %self.request_id, "Request cancelled while waiting");
        self.complete(AdmissionOutcome::Cancelled);
    }

    async fn time_out(&self) {
        let mut state = self.state.lock().await;
        if state.ticket.is_terminal() {
            return;
        }
        state.ticket.set_timed_out();
        let waited = Instant::now().saturating_duration_since(state.ticket.enqueued_at());
        let freed = self.release_slot(&mut state).await;
        drop(state);

        if freed && self.orchestrator.coordinator.publish().await.is_err() {
            tracing::debug!(request_id = %self.request_id, "Release not broadcast, fallback sweep will cover it");
        }
        tracing::info!(
            request_id = %self.request_id,
            waited_ms = waited.as_millis() as u64,
            "Request timed out waiting for capacity"
        );
        let orch = &self.orchestrator;
        let request = RejectedRequest::new(
            self.request_id.clone(),
            self.conversation_id.clone(),
            self.question.clone(),
        );
        let text = orch.config.snapshot().rejection_message;
        let record = notify_rejection(orch.recorder.as_ref(), self.sink.as_ref(), request, &text).await;
        self.complete(AdmissionOutcome::TimedOut(record));
    }

    /// Store failure: leave nothing behind and report it.
    async fn abandon(&self, state: &mut RunnerState, error: StoreError) {
        tracing::error!(request_id = %self.request_id, error = %error, "Coordination store failed, abandoning ticket");
        state.ticket.set_failed();
        self.release_slot(state).await;
        self.sink.close().await;
        self.complete(AdmissionOutcome::Failed(error.to_string()));
    }

    /// Drop the queue entry, any held permit and the local registration.
    ///
    /// Best effort: a failing store is logged and the TTLs clean up later. Returns whether
    /// anything shared was freed.
    async fn release_slot(&self, state: &mut RunnerState) -> bool {
        let orch = &self.orchestrator;
        let mut freed = false;
        match orch.queue.remove(&self.request_id).await {
            Ok(removed) => freed |= removed,
            Err(e) => {
                tracing::warn!(request_id = %self.request_id, error = %e, "Failed to remove queue entry");
            }
        }
        if let Some(permit) = state.ticket.take_permit() {
            match orch.pool.release(permit).await {
                Ok(released) => freed |= released,
                Err(e) => {
                    tracing::warn!(request_id = %self.request_id, error = %e, "Failed to release permit");
                }
            }
        }
        orch.coordinator.registry().deregister(&self.request_id);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_runner_can_run_on_the_tracker() {
        fn spawnable(runner: Arc<TicketRunner>) -> impl Future<Output = ()> + Send + 'static {
            runner.run()
        }
        let _ = spawnable;
    }

    #[test]
    fn cancel_on_drop_fires_unless_disarmed() {
        let token = CancellationToken::new();
        let (_tx, outcome) = watch::channel(None);
        let handle = AdmissionHandle {
            request_id: "r1".into(),
            cancel: token.clone(),
            outcome,
        };

        let mut guard = handle.cancel_on_drop();
        guard.disarm();
        drop(guard);
        assert!(!token.is_cancelled());

        drop(handle.cancel_on_drop());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn outcome_without_sender_reports_failure() {
        let (tx, outcome) = watch::channel(None);
        let handle = AdmissionHandle {
            request_id: "r1".into(),
            cancel: CancellationToken::new(),
            outcome,
        };
        drop(tx);
        assert!(matches!(handle.outcome().await, AdmissionOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn outcome_survives_sender_drop() {
        let (tx, outcome) = watch::channel(None);
        let handle = AdmissionHandle {
            request_id: "r1".into(),
            cancel: CancellationToken::new(),
            outcome,
        };
        tx.send_replace(Some(AdmissionOutcome::Cancelled));
        drop(tx);
        assert_eq!(handle.outcome().await, AdmissionOutcome::Cancelled);
        assert_eq!(handle.try_outcome(), Some(AdmissionOutcome::Cancelled));
    }

    #[test]
    fn admitted_outcomes() {
        assert!(AdmissionOutcome::Dispatched.is_admitted());
        assert!(AdmissionOutcome::Bypassed.is_admitted());
        assert!(!AdmissionOutcome::Cancelled.is_admitted());
        assert!(!AdmissionOutcome::Failed("x".into()).is_admitted());
    }
}
