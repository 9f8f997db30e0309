//! The execution engine.
//!
//! A run validates the snapshot, then schedules the top level as one scope.
//! Each scope is driven by a [`RemainingWork`] graph:
//!
//! 1. Ready blocks are admitted: disabled blocks and blocks with no active
//!    incoming edge are skipped, which unblocks (and usually skips) their
//!    successors in turn.
//! 2. Admitted blocks are dispatched concurrently. Loops and parallels are
//!    dispatched like any other block and run their body as nested scopes,
//!    once per iteration, on a copy of the current [`RunScope`].
//! 3. Completed blocks record their output; failed blocks pin everything
//!    downstream of them.
//!
//! Edges leaving a member of a container are treated as leaving the
//! container itself, so the outer scope waits for the whole container.

use crate::condition;
use crate::config::ExecutorConfig;
use crate::error::{BlockError, ExecutorError};
use crate::execution::{ExecutionEvent, ExecutionState};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::hub::EventSink;
use crate::remaining_work::RemainingWork;
use crate::resolve::{BlockScope, Frame, RunScope};
use blockflow_core::{BlockId, ExecutionId};
use blockflow_workflow::{
    BlockType, ContainerIndex, ContainerKind, GraphIndex, LoopType, ParallelType,
    WorkflowSnapshot, WorkflowSource,
};
use chrono::Utc;
use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
    /// The response block's output, or else the last terminal block's.
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub failed_block: Option<BlockId>,
}

/// Runs workflow snapshots.
///
/// Cheap to clone; every run gets its own state.
#[derive(Debug, Clone)]
pub struct Executor {
    handlers: Arc<HandlerRegistry>,
    config: Arc<ExecutorConfig>,
}

impl Executor {
    #[must_use]
    pub fn new(handlers: HandlerRegistry, config: ExecutorConfig) -> Self {
        Self {
            handlers: Arc::new(handlers),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes a snapshot to completion, publishing events to `sink`.
    ///
    /// Cancelling `cancel` stops new blocks from being dispatched; blocks
    /// already running finish and report normally.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWorkflow` if the snapshot's container structure is
    /// malformed. A `run_failed` event naming the block is published first.
    /// Block failures are not errors; they are reported in the outcome.
    #[tracing::instrument(skip_all, fields(%execution_id))]
    pub async fn execute(
        &self,
        execution_id: ExecutionId,
        snapshot: Arc<WorkflowSnapshot>,
        input: JsonValue,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> blockflow_core::Result<RunOutcome, ExecutorError> {
        let containers = match ContainerIndex::build(snapshot.as_ref()) {
            Ok(containers) => containers,
            Err(error) => {
                tracing::warn!(block_id = %error.block_id(), %error, "rejecting workflow");
                sink.publish(ExecutionEvent::RunFailed {
                    execution_id,
                    error: error.to_string(),
                    block_id: Some(error.block_id().clone()),
                    timestamp: Utc::now(),
                });
                return Err(ExecutorError::InvalidWorkflow {
                    block_id: error.block_id().clone(),
                    reason: error.to_string(),
                }
                .into());
            }
        };

        sink.publish(ExecutionEvent::run_started(execution_id));
        tracing::info!(blocks = snapshot.blocks.len(), "run started");

        let top_level = top_level_blocks(snapshot.as_ref(), &containers);
        let scope = RunScope::new(snapshot.as_ref());
        let run = Arc::new(Run {
            execution_id,
            snapshot,
            containers,
            input: Arc::new(input),
            handlers: Arc::clone(&self.handlers),
            config: Arc::clone(&self.config),
            sink: Arc::clone(&sink),
            cancel,
        });

        let scope = execute_scope(run, top_level, scope).await;
        let timestamp = Utc::now();

        let outcome = if scope.cancelled {
            sink.publish(ExecutionEvent::RunCancelled {
                execution_id,
                timestamp,
            });
            RunOutcome {
                execution_id,
                state: ExecutionState::Cancelled,
                output: None,
                error: None,
                failed_block: None,
            }
        } else if let Some((block_id, error)) = scope.failure {
            sink.publish(ExecutionEvent::RunFailed {
                execution_id,
                error: error.to_string(),
                block_id: Some(block_id.clone()),
                timestamp,
            });
            RunOutcome {
                execution_id,
                state: ExecutionState::Failed,
                output: None,
                error: Some(error.to_string()),
                failed_block: Some(block_id),
            }
        } else {
            let output = scope.run_output();
            sink.publish(ExecutionEvent::RunCompleted {
                execution_id,
                output: output.clone(),
                timestamp,
            });
            RunOutcome {
                execution_id,
                state: ExecutionState::Completed,
                output: Some(output),
                error: None,
                failed_block: None,
            }
        };

        tracing::info!(state = ?outcome.state, "run finished");
        Ok(outcome)
    }
}

/// Everything shared by the scopes of one run.
struct Run {
    execution_id: ExecutionId,
    snapshot: Arc<WorkflowSnapshot>,
    containers: ContainerIndex,
    input: Arc<JsonValue>,
    handlers: Arc<HandlerRegistry>,
    config: Arc<ExecutorConfig>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

/// Top-level blocks reachable from the start block.
///
/// Without a start block, every block with no predecessors is an entry.
fn top_level_blocks(snapshot: &WorkflowSnapshot, containers: &ContainerIndex) -> Vec<BlockId> {
    let graph = GraphIndex::build(snapshot);
    let roots: Vec<BlockId> = match snapshot.start_block() {
        Some(start) => vec![start.id.clone()],
        None => graph.entry_blocks().into_iter().cloned().collect(),
    };

    let mut reachable: HashSet<BlockId> = HashSet::new();
    for root in &roots {
        reachable.extend(graph.descendants(root));
        reachable.insert(root.clone());
    }

    let excluded = snapshot.blocks.len().saturating_sub(reachable.len());
    if excluded > 0 {
        tracing::debug!(excluded, "blocks unreachable from the start are not scheduled");
    }

    snapshot
        .blocks
        .keys()
        .filter(|id| reachable.contains(*id) && containers.container_of(id).is_none())
        .cloned()
        .collect()
}

/// An incoming dependency of a block within a scope.
#[derive(Debug, Clone)]
struct Incoming {
    source: BlockId,
    /// Set when the edge leaves one branch of a condition block.
    condition_id: Option<String>,
}

/// The blocks of one scope and the edges between them.
struct ScopePlan {
    blocks: Vec<BlockId>,
    edges: Vec<(BlockId, BlockId)>,
    incoming: HashMap<BlockId, Vec<Incoming>>,
}

impl ScopePlan {
    fn new(run: &Run, blocks: Vec<BlockId>) -> Self {
        let members: HashSet<&BlockId> = blocks.iter().collect();
        // The block itself, or the container holding it that belongs to this scope.
        let representative = |block_id: &BlockId| -> Option<BlockId> {
            if members.contains(block_id) {
                return Some(block_id.clone());
            }
            run.containers
                .enclosing(block_id)
                .into_iter()
                .find(|container| members.contains(*container))
                .cloned()
        };

        let mut edges = Vec::new();
        let mut incoming: HashMap<BlockId, Vec<Incoming>> = HashMap::new();
        for edge in run.snapshot.edges() {
            if edge.is_container_start() {
                continue;
            }
            let (Some(source), Some(target)) =
                (representative(&edge.source), representative(&edge.target))
            else {
                continue;
            };
            if source == target {
                continue;
            }
            let from_condition = source == edge.source
                && run
                    .snapshot
                    .block(&source)
                    .is_some_and(|block| block.block_type == BlockType::Condition);
            let condition_id = edge
                .condition_id()
                .filter(|_| from_condition)
                .map(str::to_string);

            edges.push((source.clone(), target.clone()));
            incoming.entry(target).or_default().push(Incoming {
                source,
                condition_id,
            });
        }

        Self {
            blocks,
            edges,
            incoming,
        }
    }

    fn successors<'a>(&'a self, block_id: &'a BlockId) -> impl Iterator<Item = &'a BlockId> {
        self.edges
            .iter()
            .filter(move |(source, _)| source == block_id)
            .map(|(_, target)| target)
    }
}

/// How a dispatched block ended.
enum BlockResult {
    Completed {
        output: JsonValue,
        /// Variables left by a sequential loop body.
        variables: Option<HashMap<String, JsonValue>>,
    },
    Failed(BlockError),
    /// The run was cancelled while a container body was running.
    Cancelled,
}

impl BlockResult {
    fn completed(output: JsonValue) -> Self {
        Self::Completed {
            output,
            variables: None,
        }
    }
}

struct Dispatched {
    block_id: BlockId,
    result: BlockResult,
    elapsed: Duration,
}

/// The final state of a scope.
struct ScopeOutcome {
    scope: RunScope,
    failure: Option<(BlockId, BlockError)>,
    cancelled: bool,
    /// Completed blocks none of whose successors completed, in completion order.
    terminal: Vec<(BlockId, JsonValue)>,
    response: Option<JsonValue>,
}

impl ScopeOutcome {
    /// Output of a whole run.
    fn run_output(&self) -> JsonValue {
        if let Some(response) = &self.response {
            return response.clone();
        }
        self.terminal
            .last()
            .map_or(JsonValue::Null, |(_, output)| output.clone())
    }

    /// Output of one container iteration.
    ///
    /// A single terminal block gives its output; several are keyed by name.
    fn iteration_output(&self, snapshot: &WorkflowSnapshot) -> JsonValue {
        match self.terminal.as_slice() {
            [] => JsonValue::Null,
            [(_, output)] => output.clone(),
            terminal => {
                let outputs: JsonMap<String, JsonValue> = terminal
                    .iter()
                    .map(|(block_id, output)| {
                        let name = snapshot
                            .block(block_id)
                            .map_or_else(|| block_id.to_string(), |block| block.normalized_name());
                        (name, output.clone())
                    })
                    .collect();
                JsonValue::Object(outputs)
            }
        }
    }
}

/// Schedules one scope to completion.
fn execute_scope(
    run: Arc<Run>,
    blocks: Vec<BlockId>,
    mut scope: RunScope,
) -> BoxFuture<'static, ScopeOutcome> {
    Box::pin(async move {
        let plan = ScopePlan::new(&run, blocks);
        let mut work = RemainingWork::new(&plan.blocks, plan.edges.iter().map(|(s, t)| (s, t)));
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Dispatched>> =
            FuturesUnordered::new();

        let mut completed: HashMap<BlockId, Option<String>> = HashMap::new();
        let mut order: Vec<(BlockId, JsonValue)> = Vec::new();
        let mut failure = None;
        let mut cancelled = false;
        let mut response = None;

        loop {
            if run.cancel.is_cancelled() {
                if !work.is_complete() {
                    cancelled = true;
                }
            } else {
                loop {
                    let ready = work.ready();
                    if ready.is_empty() {
                        break;
                    }
                    for block_id in ready {
                        match skip_reason(&run, &plan, &completed, &block_id) {
                            Some(reason) => {
                                tracing::debug!(%block_id, reason, "skipping block");
                                run.sink.publish(ExecutionEvent::BlockSkipped {
                                    execution_id: run.execution_id,
                                    block_id: block_id.clone(),
                                    reason: reason.to_string(),
                                    iteration: scope.iteration(),
                                    timestamp: Utc::now(),
                                });
                                work.mark_skipped(&block_id);
                            }
                            None => {
                                work.mark_executing(&block_id);
                                in_flight.push(dispatch(&run, block_id, &scope));
                            }
                        }
                    }
                }
            }

            let Some(Dispatched {
                block_id,
                result,
                elapsed,
            }) = in_flight.next().await
            else {
                break;
            };

            match result {
                BlockResult::Completed { output, variables } => {
                    let block_type = run
                        .snapshot
                        .block(&block_id)
                        .map(|block| block.block_type.clone());
                    if let Some(variables) = variables {
                        scope.replace_variables(variables);
                    }
                    if block_type == Some(BlockType::Variables)
                        && let JsonValue::Object(assignments) = &output
                    {
                        for (name, value) in assignments {
                            scope.set_variable(name, value.clone());
                        }
                    }
                    if block_type == Some(BlockType::Response) {
                        response = Some(output.clone());
                    }
                    let selected = (block_type == Some(BlockType::Condition))
                        .then(|| output.get("selectedConditionId"))
                        .flatten()
                        .and_then(JsonValue::as_str)
                        .map(str::to_string);

                    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                    tracing::debug!(%block_id, duration_ms, "block completed");
                    run.sink.publish(ExecutionEvent::BlockCompleted {
                        execution_id: run.execution_id,
                        block_id: block_id.clone(),
                        output: output.clone(),
                        duration_ms,
                        iteration: scope.iteration(),
                        timestamp: Utc::now(),
                    });
                    scope.record_output(block_id.clone(), output.clone());
                    completed.insert(block_id.clone(), selected);
                    order.push((block_id.clone(), output));
                    work.mark_completed(&block_id);
                }
                BlockResult::Failed(error) => {
                    tracing::warn!(%block_id, %error, "block failed");
                    run.sink.publish(ExecutionEvent::BlockFailed {
                        execution_id: run.execution_id,
                        block_id: block_id.clone(),
                        error: error.to_string(),
                        iteration: scope.iteration(),
                        timestamp: Utc::now(),
                    });
                    work.mark_failed(&block_id);
                    if failure.is_none() {
                        failure = Some((block_id, error));
                    }
                }
                BlockResult::Cancelled => {
                    work.mark_failed(&block_id);
                    cancelled = true;
                }
            }
        }

        let held_back = work.remaining_count();
        if held_back > 0 && !cancelled {
            tracing::debug!(held_back, "blocks held back by a failure or a cycle");
        }

        let terminal = order
            .into_iter()
            .filter(|(block_id, _)| {
                !plan
                    .successors(block_id)
                    .any(|successor| completed.contains_key(successor))
            })
            .collect();

        ScopeOutcome {
            scope,
            failure,
            cancelled,
            terminal,
            response,
        }
    })
}

/// Why a ready block should not run, if it should not.
fn skip_reason(
    run: &Run,
    plan: &ScopePlan,
    completed: &HashMap<BlockId, Option<String>>,
    block_id: &BlockId,
) -> Option<&'static str> {
    let Some(block) = run.snapshot.block(block_id) else {
        return Some("block not found");
    };
    if !block.enabled {
        return Some("disabled");
    }
    let incoming = plan.incoming.get(block_id)?;
    let active = incoming.iter().any(|edge| match completed.get(&edge.source) {
        Some(selected) => match &edge.condition_id {
            Some(condition_id) => selected.as_deref() == Some(condition_id.as_str()),
            None => true,
        },
        None => false,
    });
    (!active).then_some("no active incoming edge")
}

/// Starts a block and returns the future that finishes it.
fn dispatch(run: &Arc<Run>, block_id: BlockId, scope: &RunScope) -> BoxFuture<'static, Dispatched> {
    let started = Instant::now();
    let finished = move |block_id: BlockId, result: BlockResult| Dispatched {
        block_id,
        result,
        elapsed: started.elapsed(),
    };

    let Some(block) = run.snapshot.block(&block_id) else {
        let error = BlockError::InvalidConfig {
            message: "block not found".to_string(),
        };
        return Box::pin(future::ready(finished(block_id, BlockResult::Failed(error))));
    };

    tracing::debug!(%block_id, block_type = %block.block_type, "dispatching block");
    run.sink.publish(ExecutionEvent::BlockStarted {
        execution_id: run.execution_id,
        block_id: block_id.clone(),
        block_type: block.block_type.to_string(),
        iteration: scope.iteration(),
        timestamp: Utc::now(),
    });

    if let Some(kind) = run.containers.kind(&block_id) {
        let run = Arc::clone(run);
        let scope = scope.clone();
        return Box::pin(async move {
            let result = run_container(Arc::clone(&run), block_id.clone(), kind, scope).await;
            finished(block_id, result)
        });
    }

    let values = block.values();
    let view = scope.seen_from(&block_id);
    if block.block_type == BlockType::Condition {
        let result = match condition::evaluate(run.snapshot.as_ref(), block, &values, &view) {
            Ok(output) => BlockResult::completed(output),
            Err(error) => BlockResult::Failed(error),
        };
        return Box::pin(future::ready(finished(block_id, result)));
    }

    let inputs = match view.resolve_values(values) {
        Ok(inputs) => inputs,
        Err(error) => {
            return Box::pin(future::ready(finished(block_id, BlockResult::Failed(error))));
        }
    };
    let Some(handler) = run.handlers.get(block.block_type.as_str()) else {
        let error = BlockError::MissingHandler {
            block_type: block.block_type.to_string(),
        };
        return Box::pin(future::ready(finished(block_id, BlockResult::Failed(error))));
    };

    let ctx = HandlerContext::new(
        run.execution_id,
        block_id.clone(),
        block.block_type.clone(),
        block.name.clone(),
        Arc::clone(&run.input),
        Arc::clone(&run.sink),
    )
    .with_iteration(scope.iteration());
    let timeout = run.config.block_timeout();
    let seconds = run.config.block_timeout_seconds;

    Box::pin(async move {
        let result = match tokio::time::timeout(timeout, handler.execute(&ctx, inputs)).await {
            Ok(Ok(output)) => BlockResult::completed(output),
            Ok(Err(error)) => BlockResult::Failed(error.into()),
            Err(_) => BlockResult::Failed(BlockError::Timeout { seconds }),
        };
        finished(block_id, result)
    })
}

/// How many times a container body runs, and what it iterates over.
struct IterationPlan {
    kind: ContainerKind,
    count: usize,
    items: Option<JsonValue>,
    concurrent: bool,
}

impl IterationPlan {
    fn for_container(
        run: &Run,
        container_id: &BlockId,
        kind: ContainerKind,
        scope: &RunScope,
    ) -> Result<Self, BlockError> {
        let missing = || BlockError::InvalidConfig {
            message: format!("no {kind} configuration for {container_id}"),
        };
        let (count, items, concurrent, limit) = match kind {
            ContainerKind::Loop => {
                let config = run.snapshot.loops.get(container_id).ok_or_else(missing)?;
                let (count, items) = match config.loop_type {
                    LoopType::For => (config.iterations, None),
                    LoopType::ForEach => {
                        let items = collection(scope.seen_from(container_id), &config.for_each_items)?;
                        (collection_len(&items), Some(items))
                    }
                };
                (count, items, config.independent, run.config.max_loop_iterations)
            }
            ContainerKind::Parallel => {
                let config = run.snapshot.parallels.get(container_id).ok_or_else(missing)?;
                let (count, items) = match config.parallel_type {
                    ParallelType::Count => (config.count, None),
                    ParallelType::Collection => {
                        let items = collection(scope.seen_from(container_id), &config.distribution)?;
                        (collection_len(&items), Some(items))
                    }
                };
                (count, items, true, run.config.max_parallel_branches)
            }
        };

        if count > limit {
            tracing::warn!(%container_id, count, limit, "clamping container iterations");
        }
        Ok(Self {
            kind,
            count: count.min(limit),
            items,
            concurrent,
        })
    }

    fn frame(&self, container_id: &BlockId, index: usize) -> Frame {
        let frame = Frame::new(self.kind, container_id.clone(), index);
        match &self.items {
            Some(items) => frame.with_items(items.clone()),
            None => frame,
        }
    }
}

/// Resolves a loop or parallel collection to an array or object.
fn collection(scope: BlockScope<'_>, raw: &JsonValue) -> Result<JsonValue, BlockError> {
    let value = match scope.resolve_value(raw)? {
        JsonValue::String(text) if text.trim().is_empty() => JsonValue::Array(Vec::new()),
        JsonValue::String(text) => {
            serde_json::from_str(&text).map_err(|e| BlockError::InvalidConfig {
                message: format!("collection {text:?} is not a list: {e}"),
            })?
        }
        other => other,
    };
    match value {
        JsonValue::Null => Ok(JsonValue::Array(Vec::new())),
        JsonValue::Array(_) | JsonValue::Object(_) => Ok(value),
        other => Err(BlockError::InvalidConfig {
            message: format!("collection {other} is not a list"),
        }),
    }
}

fn collection_len(items: &JsonValue) -> usize {
    match items {
        JsonValue::Array(values) => values.len(),
        JsonValue::Object(entries) => entries.len(),
        _ => 0,
    }
}

/// Runs every iteration of a loop or parallel.
///
/// Output is `{ results: [...] }`, one entry per iteration in index order.
async fn run_container(
    run: Arc<Run>,
    container_id: BlockId,
    kind: ContainerKind,
    scope: RunScope,
) -> BlockResult {
    let plan = match IterationPlan::for_container(&run, &container_id, kind, &scope) {
        Ok(plan) => plan,
        Err(error) => return BlockResult::Failed(error),
    };
    let members = run.containers.members(&container_id).to_vec();
    tracing::debug!(%container_id, %kind, iterations = plan.count, concurrent = plan.concurrent, "running container");

    let mut results = Vec::with_capacity(plan.count);
    let mut variables = None;

    if plan.concurrent {
        let branches = (0..plan.count).map(|index| {
            let child = scope.enter(plan.frame(&container_id, index));
            execute_scope(Arc::clone(&run), members.clone(), child)
        });
        for outcome in future::join_all(branches).await {
            if let Some(result) = iteration_failure(&outcome) {
                return result;
            }
            results.push(outcome.iteration_output(&run.snapshot));
        }
    } else {
        let mut carried = scope;
        for index in 0..plan.count {
            if run.cancel.is_cancelled() {
                return BlockResult::Cancelled;
            }
            let child = carried.enter(plan.frame(&container_id, index));
            let outcome = execute_scope(Arc::clone(&run), members.clone(), child).await;
            if let Some(result) = iteration_failure(&outcome) {
                return result;
            }
            results.push(outcome.iteration_output(&run.snapshot));
            carried.replace_variables(outcome.scope.variables().clone());
        }
        variables = Some(carried.variables().clone());
    }

    let mut output = JsonMap::new();
    output.insert("results".to_string(), JsonValue::Array(results));
    BlockResult::Completed {
        output: JsonValue::Object(output),
        variables,
    }
}

fn iteration_failure(outcome: &ScopeOutcome) -> Option<BlockResult> {
    if outcome.cancelled {
        return Some(BlockResult::Cancelled);
    }
    outcome.failure.as_ref().map(|(block_id, error)| {
        BlockResult::Failed(BlockError::ContainerFailed {
            block_id: block_id.clone(),
            message: error.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::{BlockHandler, HandlerInputs};
    use async_trait::async_trait;
    use blockflow_workflow::{Block, Edge, Loop, Parallel, Variable};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ExecutionEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<ExecutionEvent> {
            self.events.lock().unwrap().clone()
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.events().iter().map(ExecutionEvent::kind).collect()
        }

        fn completed(&self, block: &str) -> Vec<JsonValue> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    ExecutionEvent::BlockCompleted {
                        block_id, output, ..
                    } if block_id.as_str() == block => Some(output),
                    _ => None,
                })
                .collect()
        }

        fn ran(&self, block: &str) -> bool {
            self.events().iter().any(|event| {
                matches!(event, ExecutionEvent::BlockStarted { block_id, .. } if block_id.as_str() == block)
            })
        }

        fn skipped(&self, block: &str) -> bool {
            self.events().iter().any(|event| {
                matches!(event, ExecutionEvent::BlockSkipped { block_id, .. } if block_id.as_str() == block)
            })
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: ExecutionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Returns its resolved inputs.
    struct EchoHandler;

    #[async_trait]
    impl BlockHandler for EchoHandler {
        async fn execute(
            &self,
            ctx: &HandlerContext,
            inputs: HandlerInputs,
        ) -> Result<JsonValue, HandlerError> {
            ctx.emit_chunk("echo");
            Ok(JsonValue::Object(inputs))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl BlockHandler for FailingHandler {
        async fn execute(
            &self,
            _ctx: &HandlerContext,
            _inputs: HandlerInputs,
        ) -> Result<JsonValue, HandlerError> {
            Err(HandlerError::failed("boom"))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl BlockHandler for SlowHandler {
        async fn execute(
            &self,
            _ctx: &HandlerContext,
            _inputs: HandlerInputs,
        ) -> Result<JsonValue, HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    /// Cancels the run from inside a block, then completes normally.
    struct CancellingHandler(CancellationToken);

    #[async_trait]
    impl BlockHandler for CancellingHandler {
        async fn execute(
            &self,
            _ctx: &HandlerContext,
            _inputs: HandlerInputs,
        ) -> Result<JsonValue, HandlerError> {
            self.0.cancel();
            Ok(json!({"done": true}))
        }
    }

    fn handlers() -> HandlerRegistry {
        HandlerRegistry::with_builtins()
            .with_handler("echo", EchoHandler)
            .with_handler("fail", FailingHandler)
            .with_handler("slow", SlowHandler)
    }

    async fn run_with(
        executor: &Executor,
        snapshot: WorkflowSnapshot,
        input: JsonValue,
        cancel: CancellationToken,
    ) -> (RunOutcome, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let outcome = executor
            .execute(
                ExecutionId::new(),
                Arc::new(snapshot),
                input,
                sink.clone(),
                cancel,
            )
            .await
            .expect("valid workflow");
        (outcome, sink)
    }

    async fn run(snapshot: WorkflowSnapshot, input: JsonValue) -> (RunOutcome, Arc<RecordingSink>) {
        let executor = Executor::new(handlers(), ExecutorConfig::default());
        run_with(&executor, snapshot, input, CancellationToken::new()).await
    }

    fn start() -> WorkflowSnapshot {
        WorkflowSnapshot::new().with_block(Block::new("start", "starter", "Start"))
    }

    #[tokio::test]
    async fn linear_run_substitutes_references() {
        let snapshot = start()
            .with_block(Block::new("a", "echo", "Agent 1").with_value("prompt", json!("Hi <start.name>")))
            .with_block(
                Block::new("b", "echo", "Summarize")
                    .with_value("text", json!("<agent1.prompt>"))
                    .with_value("count", json!("<start.count>")),
            )
            .connect("start", "a")
            .connect("a", "b");

        let (outcome, sink) = run(snapshot, json!({"name": "Ada", "count": 2})).await;

        assert_eq!(outcome.state, ExecutionState::Completed);
        assert_eq!(outcome.output, Some(json!({"text": "Hi Ada", "count": 2})));
        assert_eq!(
            sink.kinds(),
            [
                "run_started",
                "block_started",
                "block_completed",
                "block_started",
                "block_chunk",
                "block_completed",
                "block_started",
                "block_chunk",
                "block_completed",
                "run_completed",
            ]
        );
    }

    #[tokio::test]
    async fn condition_activates_only_the_selected_branch() {
        let conditions = json!([
            {"id": "c-big", "title": "if", "value": "<start.n> > 10"},
            {"id": "c-else", "title": "else", "value": ""}
        ]);
        let snapshot = start()
            .with_block(Block::new("cond", "condition", "Check").with_value("conditions", conditions))
            .with_block(Block::new("big", "echo", "Big").with_value("v", json!("big")))
            .with_block(Block::new("small", "echo", "Small").with_value("v", json!("small")))
            .with_block(Block::new("after", "echo", "After Big").with_value("v", json!("<big.v>")))
            .connect("start", "cond")
            .with_edge(Edge::condition_branch("cond", "c-big", "big"))
            .with_edge(Edge::condition_branch("cond", "c-else", "small"))
            .connect("big", "after");

        let (outcome, sink) = run(snapshot, json!({"n": 3})).await;

        assert_eq!(outcome.state, ExecutionState::Completed);
        assert!(sink.ran("small"));
        assert!(sink.skipped("big"));
        assert!(sink.skipped("after"));
        let decision = &sink.completed("cond")[0];
        assert_eq!(decision["selectedConditionId"], "c-else");
        assert_eq!(decision["selectedPath"]["blockId"], "small");
        assert_eq!(outcome.output, Some(json!({"v": "small"})));
    }

    #[tokio::test]
    async fn join_runs_when_any_branch_is_active() {
        let conditions = json!([{"id": "yes", "title": "if", "value": "true"}, {"id": "no", "title": "else"}]);
        let snapshot = start()
            .with_block(Block::new("cond", "condition", "Check").with_value("conditions", conditions))
            .with_block(Block::new("x", "echo", "X"))
            .with_block(Block::new("y", "echo", "Y"))
            .with_block(Block::new("join", "echo", "Join"))
            .connect("start", "cond")
            .with_edge(Edge::condition_branch("cond", "yes", "x"))
            .with_edge(Edge::condition_branch("cond", "no", "y"))
            .connect("x", "join")
            .connect("y", "join");

        let (_, sink) = run(snapshot, json!({})).await;
        assert!(sink.skipped("y"));
        assert!(sink.ran("join"));
    }

    #[tokio::test]
    async fn for_each_loop_collects_iteration_results() {
        let snapshot = start()
            .with_block(Block::new("loop", "loop", "Loop 1"))
            .with_block(
                Block::new("body", "echo", "Body")
                    .with_value("item", json!("<loop.currentItem>"))
                    .with_value("n", json!("<loop.currentIteration>")),
            )
            .with_block(Block::new("after", "echo", "After").with_value("all", json!("<loop1.results>")))
            .connect("start", "loop")
            .with_edge(Edge::new("loop", "body").with_source_handle(blockflow_workflow::edge::LOOP_START_HANDLE))
            .connect("loop", "after")
            .with_loop(Loop::for_each("loop", vec![BlockId::new("body")], json!("<start.items>")));

        let (outcome, sink) = run(snapshot, json!({"items": ["a", "b"]})).await;

        assert_eq!(outcome.state, ExecutionState::Completed);
        assert_eq!(sink.completed("body").len(), 2);
        assert_eq!(
            outcome.output,
            Some(json!({"all": [{"item": "a", "n": 1}, {"item": "b", "n": 2}]}))
        );
        let iterations: Vec<usize> = sink
            .events()
            .iter()
            .filter_map(|event| match event {
                ExecutionEvent::BlockCompleted { iteration: Some(info), .. } => Some(info.index),
                _ => None,
            })
            .collect();
        assert_eq!(iterations, [0, 1]);
    }

    #[tokio::test]
    async fn member_outputs_stay_inside_their_iteration() {
        let snapshot = start()
            .with_block(Block::new("loop", "loop", "Loop"))
            .with_block(Block::new("body", "echo", "Body").with_value("i", json!("<loop.index>")))
            .with_block(Block::new("after", "echo", "After").with_value("leak", json!("<body.i>")))
            .connect("start", "loop")
            .connect("loop", "after")
            .with_loop(Loop::for_count("loop", vec![BlockId::new("body")], 2));

        let (outcome, sink) = run(snapshot, json!({})).await;

        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(outcome.failed_block, Some(BlockId::new("after")));
        assert_eq!(sink.completed("loop")[0], json!({"results": [{"i": 0}, {"i": 1}]}));
    }

    #[tokio::test]
    async fn container_named_after_its_namespace_is_referenceable() {
        let snapshot = start()
            .with_block(Block::new("lp", "loop", "Loop"))
            .with_block(Block::new("body", "echo", "Body").with_value("i", json!("<loop.index>")))
            .with_block(Block::new("after", "echo", "After").with_value("all", json!("<loop.results>")))
            .connect("start", "lp")
            .connect("lp", "after")
            .with_loop(Loop::for_count("lp", vec![BlockId::new("body")], 2));

        let (outcome, _) = run(snapshot, json!({})).await;

        assert_eq!(outcome.state, ExecutionState::Completed);
        assert_eq!(outcome.output, Some(json!({"all": [{"i": 0}, {"i": 1}]})));
    }

    #[tokio::test]
    async fn blocks_on_another_branch_cannot_be_referenced() {
        let snapshot = start()
            .with_block(Block::new("a", "echo", "A").with_value("x", json!("secret")))
            .with_block(Block::new("c", "echo", "C"))
            .with_block(Block::new("b", "echo", "B").with_value("leak", json!("<a.x>")))
            .connect("start", "a")
            .connect("start", "c")
            .connect("c", "b");

        let (outcome, sink) = run(snapshot, json!({})).await;

        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(outcome.failed_block, Some(BlockId::new("b")));
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("a.x")));
        assert!(sink.completed("b").is_empty());
    }

    #[tokio::test]
    async fn sequential_loop_carries_variables() {
        let assign = json!([{"variableName": "total", "value": "<loop.currentIteration>"}]);
        let snapshot = start()
            .with_variable(Variable::new("v1", "total", json!(0)))
            .with_block(Block::new("loop", "loop", "Loop"))
            .with_block(Block::new("set", "variables", "Set").with_value("variables", assign))
            .with_block(Block::new("after", "echo", "After").with_value("total", json!("<variable.total>")))
            .connect("start", "loop")
            .connect("loop", "after")
            .with_loop(Loop::for_count("loop", vec![BlockId::new("set")], 3));

        let (outcome, _) = run(snapshot, json!({})).await;
        assert_eq!(outcome.output, Some(json!({"total": 3})));
    }

    #[tokio::test]
    async fn parallel_branches_run_and_fail_together() {
        let snapshot = start()
            .with_block(Block::new("par", "parallel", "Fan Out"))
            .with_block(Block::new("worker", "echo", "Worker").with_value("item", json!("<parallel.currentItem>")))
            .connect("start", "par")
            .with_parallel(Parallel::over_collection("par", vec![BlockId::new("worker")], json!([1, 2, 3])));

        let (outcome, _) = run(snapshot.clone(), json!({})).await;
        assert_eq!(
            outcome.output,
            Some(json!({"results": [{"item": 1}, {"item": 2}, {"item": 3}]}))
        );

        let failing = snapshot
            .with_block(Block::new("worker", "echo", "Worker"))
            .with_block(Block::new("boom", "fail", "Boom"))
            .with_parallel(Parallel::with_count(
                "par",
                vec![BlockId::new("worker"), BlockId::new("boom")],
                2,
            ));
        let (outcome, sink) = run(failing, json!({})).await;
        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(outcome.failed_block, Some(BlockId::new("par")));
        assert!(sink.events().iter().any(|event| matches!(
            event,
            ExecutionEvent::BlockFailed { block_id, error, .. }
                if block_id.as_str() == "par" && error.contains("boom")
        )));
    }

    #[tokio::test]
    async fn unresolved_reference_fails_block_and_stops_dependents() {
        let snapshot = start()
            .with_block(Block::new("a", "echo", "A").with_value("x", json!("<start.missing>")))
            .with_block(Block::new("b", "echo", "B"))
            .with_block(Block::new("side", "echo", "Side"))
            .connect("start", "a")
            .connect("a", "b")
            .connect("start", "side");

        let (outcome, sink) = run(snapshot, json!({})).await;

        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(outcome.failed_block, Some(BlockId::new("a")));
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("start.missing")));
        assert!(!sink.ran("b"));
        assert!(sink.ran("side"));
        assert_eq!(sink.kinds().last(), Some(&"run_failed"));
    }

    #[tokio::test]
    async fn membership_conflict_is_rejected_before_running() {
        let snapshot = start()
            .with_block(Block::new("l1", "loop", "L1"))
            .with_block(Block::new("l2", "loop", "L2"))
            .with_block(Block::new("b", "echo", "B"))
            .with_loop(Loop::for_count("l1", vec![BlockId::new("b")], 1))
            .with_loop(Loop::for_count("l2", vec![BlockId::new("b")], 1));
        let executor = Executor::new(handlers(), ExecutorConfig::default());
        let sink = Arc::new(RecordingSink::default());

        let result = executor
            .execute(
                ExecutionId::new(),
                Arc::new(snapshot),
                json!({}),
                sink.clone(),
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ExecutionEvent::RunFailed { block_id: Some(id), .. } if id.as_str() == "b"
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_scheduling_but_finishes_running_blocks() {
        let cancel = CancellationToken::new();
        let executor = Executor::new(
            handlers().with_handler("gate", CancellingHandler(cancel.clone())),
            ExecutorConfig::default(),
        );
        let snapshot = start()
            .with_block(Block::new("gate", "gate", "Gate"))
            .with_block(Block::new("next", "echo", "Next"))
            .connect("start", "gate")
            .connect("gate", "next");

        let (outcome, sink) = run_with(&executor, snapshot, json!({}), cancel).await;

        assert_eq!(outcome.state, ExecutionState::Cancelled);
        assert_eq!(sink.completed("gate"), [json!({"done": true})]);
        assert!(!sink.ran("next"));
        assert_eq!(sink.kinds().last(), Some(&"run_cancelled"));
    }

    #[tokio::test]
    async fn disabled_and_unreachable_blocks_do_not_run() {
        let snapshot = start()
            .with_block(Block::new("off", "echo", "Off").disabled())
            .with_block(Block::new("after", "echo", "After"))
            .with_block(Block::new("island", "echo", "Island"))
            .connect("start", "off")
            .connect("off", "after");

        let (outcome, sink) = run(snapshot, json!({})).await;

        assert_eq!(outcome.state, ExecutionState::Completed);
        assert!(sink.skipped("off"));
        assert!(sink.skipped("after"));
        assert!(!sink.ran("island"));
        assert!(!sink.skipped("island"));
    }

    #[tokio::test]
    async fn missing_handler_and_timeout_fail_the_block() {
        let snapshot = start()
            .with_block(Block::new("x", "unknown_kind", "X"))
            .connect("start", "x");
        let (outcome, _) = run(snapshot, json!({})).await;
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("unknown_kind")));

        let executor = Executor::new(
            handlers(),
            ExecutorConfig {
                block_timeout_seconds: 1,
                ..ExecutorConfig::default()
            },
        );
        let snapshot = start()
            .with_block(Block::new("slow", "slow", "Slow"))
            .connect("start", "slow");
        let (outcome, _) = run_with(&executor, snapshot, json!({}), CancellationToken::new()).await;
        assert_eq!(outcome.error.as_deref(), Some("block timed out after 1s"));
    }

    #[tokio::test]
    async fn response_block_is_the_run_output() {
        let snapshot = start()
            .with_block(Block::new("resp", "response", "Reply").with_value("data", json!({"greeting": "<start.name>"})))
            .with_block(Block::new("tail", "echo", "Tail"))
            .connect("start", "resp")
            .connect("resp", "tail");

        let (outcome, _) = run(snapshot, json!({"name": "Ada"})).await;
        assert_eq!(
            outcome.output,
            Some(json!({"data": {"greeting": "Ada"}, "status": 200, "headers": {}}))
        );
    }

    #[tokio::test]
    async fn loop_iterations_are_clamped() {
        let executor = Executor::new(
            handlers(),
            ExecutorConfig {
                max_loop_iterations: 2,
                ..ExecutorConfig::default()
            },
        );
        let snapshot = start()
            .with_block(Block::new("loop", "loop", "Loop"))
            .with_block(Block::new("body", "echo", "Body"))
            .connect("start", "loop")
            .with_loop(Loop::for_count("loop", vec![BlockId::new("body")], 50));

        let (_, sink) = run_with(&executor, snapshot, json!({}), CancellationToken::new()).await;
        assert_eq!(sink.completed("body").len(), 2);
    }
}
