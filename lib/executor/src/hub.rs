//! Event fan-out and run management.
//!
//! The engine publishes to an [`EventSink`]. In a server, that sink is the
//! [`ExecutionManager`], which folds run-level events into a [`RunSummary`]
//! and forwards every event to the [`EventHub`], where each subscriber has
//! its own unbounded channel. A slow or dropped subscriber never blocks a
//! run.

use crate::engine::Executor;
use crate::envelope::Envelope;
use crate::error::ExecutorError;
use crate::execution::{BlockState, ExecutionEvent, ExecutionState};
use blockflow_core::{BlockId, ExecutionId, Result};
use blockflow_workflow::WorkflowSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Destination for execution events.
///
/// This abstraction lets the engine be tested with an in-memory recorder
/// while the server fans events out to live subscribers.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ExecutionEvent);
}

/// Receiving half of a run subscription.
pub type EventReceiver = mpsc::UnboundedReceiver<Envelope<ExecutionEvent>>;

type Subscribers = HashMap<ExecutionId, Vec<mpsc::UnboundedSender<Envelope<ExecutionEvent>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-run subscriber lists.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Subscribers>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every event of `execution_id` published from now on.
    pub fn subscribe(&self, execution_id: ExecutionId) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers)
            .entry(execution_id)
            .or_default()
            .push(tx);
        rx
    }

    #[must_use]
    pub fn subscriber_count(&self, execution_id: ExecutionId) -> usize {
        lock(&self.subscribers)
            .get(&execution_id)
            .map_or(0, Vec::len)
    }

    /// Delivers an event to the run's subscribers.
    ///
    /// Closed subscribers are dropped. A terminal event closes the run's
    /// channels after delivery.
    pub fn broadcast(&self, event: ExecutionEvent) {
        let execution_id = event.execution_id();
        let terminal = event.is_terminal();
        let envelope = Envelope::new(event);

        let mut subscribers = lock(&self.subscribers);
        if let Some(senders) = subscribers.get_mut(&execution_id) {
            senders.retain(|tx| tx.send(envelope.clone()).is_ok());
            if terminal || senders.is_empty() {
                subscribers.remove(&execution_id);
            }
        }
    }
}

impl EventSink for EventHub {
    fn publish(&self, event: ExecutionEvent) {
        self.broadcast(event);
    }
}

/// What is known about a run, folded from its events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_block: Option<BlockId>,
    /// Latest state of every block that has started or been skipped.
    pub blocks: BTreeMap<BlockId, BlockState>,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    fn queued(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            state: ExecutionState::Queued,
            output: None,
            error: None,
            failed_block: None,
            blocks: BTreeMap::new(),
            queued_at: Utc::now(),
            finished_at: None,
        }
    }

    fn apply(&mut self, event: &ExecutionEvent) {
        if self.state.is_terminal() {
            return;
        }
        if let (Some(block_id), Some(state)) = (event.block_id(), event.block_state()) {
            self.blocks.insert(block_id.clone(), state);
            return;
        }
        let Some(state) = event.run_state() else {
            return;
        };
        self.state = state;
        match event {
            ExecutionEvent::RunCompleted { output, .. } => self.output = Some(output.clone()),
            ExecutionEvent::RunFailed {
                error, block_id, ..
            } => {
                self.error = Some(error.clone());
                self.failed_block.clone_from(block_id);
            }
            _ => {}
        }
        if state.is_terminal() {
            self.finished_at = Some(event.timestamp());
        }
    }
}

struct RunHandle {
    summary: RunSummary,
    cancel: CancellationToken,
}

/// Starts runs in the background and tracks them by execution id.
///
/// Cheap to clone; clones share the same runs.
#[derive(Clone)]
pub struct ExecutionManager {
    executor: Executor,
    hub: Arc<EventHub>,
    runs: Arc<Mutex<HashMap<ExecutionId, RunHandle>>>,
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("executor", &self.executor)
            .field("runs", &lock(&self.runs).len())
            .finish_non_exhaustive()
    }
}

impl ExecutionManager {
    #[must_use]
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            hub: Arc::new(EventHub::new()),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts a run on the current Tokio runtime.
    pub fn start(&self, snapshot: Arc<WorkflowSnapshot>, input: JsonValue) -> ExecutionId {
        let execution_id = ExecutionId::new();
        self.spawn(execution_id, snapshot, input);
        execution_id
    }

    /// Starts a run and subscribes before its first event is published.
    pub fn start_subscribed(
        &self,
        snapshot: Arc<WorkflowSnapshot>,
        input: JsonValue,
    ) -> (ExecutionId, EventReceiver) {
        let execution_id = ExecutionId::new();
        let events = self.hub.subscribe(execution_id);
        self.spawn(execution_id, snapshot, input);
        (execution_id, events)
    }

    fn spawn(&self, execution_id: ExecutionId, snapshot: Arc<WorkflowSnapshot>, input: JsonValue) {
        let cancel = CancellationToken::new();
        lock(&self.runs).insert(
            execution_id,
            RunHandle {
                summary: RunSummary::queued(execution_id),
                cancel: cancel.clone(),
            },
        );

        let executor = self.executor.clone();
        let sink: Arc<dyn EventSink> = Arc::new(self.clone());
        tokio::spawn(async move {
            match executor
                .execute(execution_id, snapshot, input, sink, cancel)
                .await
            {
                Ok(outcome) => {
                    tracing::debug!(%execution_id, state = ?outcome.state, "run task finished");
                }
                Err(report) => {
                    tracing::warn!(%execution_id, error = %report, "run rejected");
                }
            }
        });
    }

    /// Requests cancellation of a running run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown id and `RunAlreadyTerminal` when
    /// the run has already finished.
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        let runs = lock(&self.runs);
        let handle = runs
            .get(&execution_id)
            .ok_or(ExecutorError::RunNotFound { execution_id })?;
        if handle.summary.state.is_terminal() {
            return Err(ExecutorError::RunAlreadyTerminal { execution_id }.into());
        }
        tracing::info!(%execution_id, "cancelling run");
        handle.cancel.cancel();
        Ok(())
    }

    #[must_use]
    pub fn summary(&self, execution_id: ExecutionId) -> Option<RunSummary> {
        lock(&self.runs)
            .get(&execution_id)
            .map(|handle| handle.summary.clone())
    }

    /// Subscribes to the remaining events of a run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown id and `RunAlreadyTerminal` when
    /// no further events will be published.
    pub fn subscribe(&self, execution_id: ExecutionId) -> Result<EventReceiver, ExecutorError> {
        let runs = lock(&self.runs);
        let handle = runs
            .get(&execution_id)
            .ok_or(ExecutorError::RunNotFound { execution_id })?;
        if handle.summary.state.is_terminal() {
            return Err(ExecutorError::RunAlreadyTerminal { execution_id }.into());
        }
        // Held across subscribe so a terminal event cannot slip in between.
        let events = self.hub.subscribe(execution_id);
        tracing::debug!(
            %execution_id,
            subscribers = self.hub.subscriber_count(execution_id),
            "subscribed to run"
        );
        Ok(events)
    }
}

impl EventSink for ExecutionManager {
    fn publish(&self, event: ExecutionEvent) {
        let mut runs = lock(&self.runs);
        if let Some(handle) = runs.get_mut(&event.execution_id()) {
            handle.summary.apply(&event);
        }
        self.hub.broadcast(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::handler::HandlerRegistry;
    use blockflow_workflow::Block;
    use serde_json::json;

    fn manager() -> ExecutionManager {
        ExecutionManager::new(Executor::new(
            HandlerRegistry::with_builtins(),
            ExecutorConfig::default(),
        ))
    }

    fn workflow() -> Arc<WorkflowSnapshot> {
        Arc::new(
            WorkflowSnapshot::new()
                .with_block(Block::new("start", "starter", "Start"))
                .with_block(
                    Block::new("reply", "response", "Reply").with_value("data", json!("<start.name>")),
                )
                .connect("start", "reply"),
        )
    }

    async fn drain(mut events: EventReceiver) -> Vec<ExecutionEvent> {
        let mut received = Vec::new();
        while let Some(envelope) = events.recv().await {
            received.push(envelope.payload);
        }
        received
    }

    #[test]
    fn hub_prunes_closed_subscribers_and_closes_on_terminal() {
        let hub = EventHub::new();
        let id = ExecutionId::new();
        let kept = hub.subscribe(id);
        drop(hub.subscribe(id));
        assert_eq!(hub.subscriber_count(id), 2);

        hub.broadcast(ExecutionEvent::run_started(id));
        assert_eq!(hub.subscriber_count(id), 1);

        hub.broadcast(ExecutionEvent::RunCancelled {
            execution_id: id,
            timestamp: Utc::now(),
        });
        assert_eq!(hub.subscriber_count(id), 0);
        drop(kept);
    }

    #[test]
    fn hub_only_delivers_to_the_matching_run() {
        let hub = EventHub::new();
        let mine = ExecutionId::new();
        let mut events = hub.subscribe(mine);

        hub.broadcast(ExecutionEvent::run_started(ExecutionId::new()));
        hub.broadcast(ExecutionEvent::run_started(mine));

        let envelope = events.try_recv().expect("one event");
        assert_eq!(envelope.payload().execution_id(), mine);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribed_run_streams_every_event() {
        let manager = manager();
        let (id, events) = manager.start_subscribed(workflow(), json!({"name": "Ada"}));

        let received = drain(events).await;
        let kinds: Vec<_> = received.iter().map(ExecutionEvent::kind).collect();
        assert_eq!(kinds.first(), Some(&"run_started"));
        assert_eq!(kinds.last(), Some(&"run_completed"));

        let summary = manager.summary(id).expect("tracked");
        assert_eq!(summary.state, ExecutionState::Completed);
        assert_eq!(summary.output.as_ref().map(|o| &o["data"]), Some(&json!("Ada")));
        assert!(summary.finished_at.is_some());
        assert_eq!(
            summary.blocks,
            BTreeMap::from([
                (BlockId::new("reply"), BlockState::Completed),
                (BlockId::new("start"), BlockState::Completed),
            ])
        );
    }

    #[tokio::test]
    async fn finished_runs_refuse_cancel_and_subscribe() {
        let manager = manager();
        let (id, events) = manager.start_subscribed(workflow(), json!({}));
        drain(events).await;

        assert!(manager.cancel(id).is_err());
        assert!(manager.subscribe(id).is_err());
        assert!(manager.cancel(ExecutionId::new()).is_err());
        assert!(manager.summary(ExecutionId::new()).is_none());
    }

    #[tokio::test]
    async fn invalid_workflow_is_reported_as_failed() {
        let manager = manager();
        let snapshot = Arc::new(
            WorkflowSnapshot::new()
                .with_block(Block::new("start", "starter", "Start"))
                .with_loop(blockflow_workflow::Loop::for_count(
                    "ghost",
                    vec![blockflow_core::BlockId::new("start")],
                    1,
                )),
        );
        let (id, events) = manager.start_subscribed(snapshot, json!({}));

        let received = drain(events).await;
        assert_eq!(received.len(), 1);
        let summary = manager.summary(id).expect("tracked");
        assert_eq!(summary.state, ExecutionState::Failed);
        assert!(summary.failed_block.is_some());
    }
}
