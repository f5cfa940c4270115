use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cycle_check::format_cycle;
use crate::hooks::{try_enhancement_hook, try_fallback_persistence, try_pre_execute};
use crate::{
    BatchSource, DependencyChecker, EnhancementHook, ExecutionOutcome, FallbackStore,
    InMemoryTaskGraph, JsonlFallbackStore, NoopHook, ProcessorConfig, ProcessorError, Readiness,
    RetryDecision, RetryPolicy, RetryQueue, Task, TaskHandle, TaskId, TaskKind, TaskRepository,
    TaskStatus, ToolError, ToolInvoker, find_cycle,
};

/// Aggregated outcome of a static batch, stored as the batch's `result`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Final state of every sub-task, in declaration order.
    pub results: Vec<Task>,
    pub errors: Vec<BatchError>,
    /// Sub-tasks still waiting on dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    pub id: TaskId,
    pub error: String,
}

impl BatchOutcome {
    fn record(&mut self, task: Task, failure: Option<String>) {
        match (task.status, failure) {
            (_, Some(error)) => self.errors.push(BatchError {
                id: task.id.clone(),
                error,
            }),
            (TaskStatus::Error | TaskStatus::Cancelled, None) => self.errors.push(BatchError {
                id: task.id.clone(),
                error: task
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("sub-task {}", task.status)),
            }),
            (status, None) if !status.is_terminal() => self.pending.push(task.id.clone()),
            _ => {}
        }
        self.results.push(task);
    }
}

/// Summary of a [`TaskProcessor::drain_pending`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub passes: usize,
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub cancelled: Vec<TaskId>,
    pub pending: Vec<TaskId>,
}

pub struct TaskProcessorBuilder {
    invoker: Arc<dyn ToolInvoker>,
    repository: Option<Arc<dyn TaskRepository>>,
    hook: Option<Arc<dyn EnhancementHook>>,
    fallback: Option<Arc<dyn FallbackStore>>,
    retry_policy: RetryPolicy,
}

impl TaskProcessorBuilder {
    pub fn repository(mut self, repository: Arc<dyn TaskRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn EnhancementHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn fallback_store(mut self, store: Arc<dyn FallbackStore>) -> Self {
        self.fallback = Some(store);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy.normalized();
        self
    }

    pub fn config(mut self, config: &ProcessorConfig) -> Self {
        self.retry_policy = config.retry.clone().normalized();
        if let Some(path) = &config.fallback_path {
            self.fallback = Some(Arc::new(JsonlFallbackStore::new(path.clone())));
        }
        self
    }

    /// Loads a TOML config file, applies `TASKCUTER_*` environment overrides
    /// and then [`TaskProcessorBuilder::config`].
    pub fn config_file(self, path: impl AsRef<Path>) -> Result<Self, ProcessorError> {
        let config = ProcessorConfig::load(path)?.with_env_overrides()?;
        Ok(self.config(&config))
    }

    pub fn build(self) -> TaskProcessor {
        let repo = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryTaskGraph::new()));

        TaskProcessor {
            checker: DependencyChecker::new(Arc::clone(&repo)),
            repo,
            invoker: self.invoker,
            hook: self.hook.unwrap_or_else(|| Arc::new(NoopHook)),
            fallback: self.fallback,
            retry_policy: self.retry_policy,
            retry_queue: RetryQueue::new(),
            execution_order: Mutex::new(Vec::new()),
        }
    }
}

/// Runs tasks against a repository: dependency gating, tool execution,
/// retries, failure cascade and static batch expansion.
///
/// Calls for different top-level tasks may interleave at await points, but a
/// given task id must not be processed twice concurrently.
pub struct TaskProcessor {
    repo: Arc<dyn TaskRepository>,
    checker: DependencyChecker,
    invoker: Arc<dyn ToolInvoker>,
    hook: Arc<dyn EnhancementHook>,
    fallback: Option<Arc<dyn FallbackStore>>,
    retry_policy: RetryPolicy,
    retry_queue: RetryQueue,
    execution_order: Mutex<Vec<TaskId>>,
}

impl TaskProcessor {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self::builder(invoker).build()
    }

    pub fn builder(invoker: Arc<dyn ToolInvoker>) -> TaskProcessorBuilder {
        TaskProcessorBuilder {
            invoker,
            repository: None,
            hook: None,
            fallback: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repo
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    pub async fn task(&self, id: &TaskId) -> Option<Task> {
        let handle = self.repo.get(id).await?;
        let task = handle.read().await.clone();
        Some(task)
    }

    pub async fn can_execute(&self, task: &Task) -> bool {
        self.checker.can_execute(task).await
    }

    /// Registers `task` and runs it as far as it can go.
    ///
    /// Execution failures are reported through the returned task's status;
    /// `Err` is reserved for malformed tasks. An id already registered with a
    /// terminal status is returned as-is and never overwritten. Any other
    /// incoming status (`running`, `retrying`, `blocked`) starts over as
    /// `pending`.
    pub fn process_task(&self, mut task: Task) -> BoxFuture<'_, Result<Task, ProcessorError>> {
        let span = info_span!("process_task", task_id = %task.id, kind = task.kind.name());
        async move {
            if !task.status.is_terminal() && task.status != TaskStatus::Pending {
                debug!(status = %task.status, "resetting incoming status to pending");
                task.status = TaskStatus::Pending;
            }

            if let Some(existing) = self.repo.get(&task.id).await {
                let current = existing.read().await.clone();
                if current.status.is_terminal() {
                    debug!(status = %current.status, "task already finished, not re-registering");
                    return Ok(current);
                }
            }

            let handle = self.repo.register(task).await;
            self.run(&handle).await
        }
        .instrument(span)
        .boxed()
    }

    /// Re-runs an already registered task, e.g. one left `pending` earlier.
    pub async fn resubmit(&self, id: &TaskId) -> Result<Task, ProcessorError> {
        let handle = self
            .repo
            .get(id)
            .await
            .ok_or_else(|| ProcessorError::UnknownTask(id.clone()))?;
        self.run(&handle)
            .instrument(info_span!("resubmit", task_id = %id))
            .await
    }

    async fn run(&self, handle: &TaskHandle) -> Result<Task, ProcessorError> {
        loop {
            let task = handle.read().await.clone();
            if task.status.is_terminal() {
                return Ok(task);
            }

            let (tool, args) = match &task.kind {
                TaskKind::Batch(BatchSource::Static(_)) => {
                    return self.process_static_batch(handle).await;
                }
                TaskKind::Batch(BatchSource::Dynamic(_)) => {
                    return self.process_dynamic_batch(handle).await;
                }
                TaskKind::Other(kind) => {
                    debug!(kind = %kind, "not a tool or batch task, skipping");
                    let mut task = handle.write().await;
                    task.transition(TaskStatus::Skipped)?;
                    return Ok(task.clone());
                }
                TaskKind::Tool { tool, args } => (tool.clone(), args.clone()),
            };

            if !self.checker.can_execute(&task).await {
                debug!("dependencies not ready, leaving task pending");
                let mut task = handle.write().await;
                if task.status != TaskStatus::Pending {
                    task.transition(TaskStatus::Pending)?;
                }
                return Ok(task.clone());
            }

            self.pre_execute(&task).await;

            handle.write().await.transition(TaskStatus::Running)?;
            self.execution_order.lock().await.push(task.id.clone());
            info!(tool = %tool, attempt = task.retry_count() + 1, "executing tool");

            let failure = match self.invoker.execute(&tool, &args).await {
                Ok(result) => {
                    let done = {
                        let mut task = handle.write().await;
                        task.complete(result)?;
                        task.clone()
                    };
                    info!("task completed");
                    let outcome = ExecutionOutcome::success(done.result.clone().unwrap_or_default());
                    self.post_execute(&done, &outcome).await;
                    return Ok(done);
                }
                Err(err) => err,
            };

            if failure.is_retryable() {
                if self.retry(handle, &failure).await? {
                    continue;
                }
            } else {
                warn!(error = %failure, "tool failed, not retryable");
                handle.write().await.fail(failure.message.clone())?;
            }

            let failed = handle.read().await.clone();
            let message = failed.error.clone().unwrap_or_else(|| failure.message.clone());
            self.post_execute(&failed, &ExecutionOutcome::failure(message.clone()))
                .await;
            self.propagate_error(&failed.id, &message).await?;
            return Ok(handle.read().await.clone());
        }
    }

    /// Applies the retry policy after a retryable failure. Returns `true`
    /// once the scheduled delay has elapsed and the task should run again,
    /// `false` if retries are exhausted and the task is now `error`.
    async fn retry(&self, handle: &TaskHandle, failure: &ToolError) -> Result<bool, ProcessorError> {
        let (id, decision) = {
            let task = handle.read().await;
            (task.id.clone(), self.retry_policy.decide(&task))
        };

        match decision {
            RetryDecision::Exhausted { max_retries } => {
                warn!(error = %failure, max_retries, "retries exhausted");
                handle
                    .write()
                    .await
                    .fail(format!("Failed after {} retries", max_retries))?;
                Ok(false)
            }
            RetryDecision::Retry { retry_count, delay } => {
                {
                    let mut task = handle.write().await;
                    task.transition(TaskStatus::Retrying)?;
                    task.set_retry_count(retry_count);
                    task.transition(TaskStatus::Pending)?;
                }
                warn!(
                    error = %failure,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "tool failed, retry scheduled"
                );
                self.retry_queue.schedule(id.clone(), delay);
                self.retry_queue.wait(&id).await;
                Ok(true)
            }
        }
    }

    async fn pre_execute(&self, task: &Task) {
        match try_pre_execute(self.hook.as_ref(), task).await {
            Ok(recs) if !recs.recommendations.is_empty() => {
                info!(recommendations = ?recs.recommendations, "enhancement recommendations");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "pre-execution hook failed"),
        }
    }

    async fn post_execute(&self, task: &Task, outcome: &ExecutionOutcome) {
        let Err(hook_err) = try_enhancement_hook(self.hook.as_ref(), task, outcome).await else {
            return;
        };
        warn!(task_id = %task.id, error = %hook_err, "post-execution hook failed, using fallback store");

        if let Err(e) = try_fallback_persistence(self.fallback.as_deref(), task, outcome).await {
            warn!(task_id = %task.id, error = %e, "fallback persistence failed");
        }
    }

    /// Cancels every task downstream of `failed_id`.
    ///
    /// Downstream means the failed task's declared `dependents` plus every
    /// registered task listing it in `dependencies`, transitively. One failed
    /// dependency is enough to cancel a task, whatever its other dependencies
    /// look like. Tasks that already finished are left alone, and a task that
    /// is currently `running` keeps its status (its owner finishes it) while
    /// the cascade still continues past it.
    pub async fn propagate_error(
        &self,
        failed_id: &TaskId,
        message: &str,
    ) -> Result<Vec<TaskId>, ProcessorError> {
        let mut cancelled = Vec::new();
        let mut visited: HashSet<TaskId> = HashSet::from([failed_id.clone()]);
        let mut stack = vec![failed_id.clone()];

        while let Some(parent) = stack.pop() {
            let mut downstream = match self.repo.get(&parent).await {
                Some(handle) => handle.read().await.dependents.clone(),
                None => Vec::new(),
            };
            downstream.extend(self.repo.dependents_of(&parent).await);

            for id in downstream {
                if !visited.insert(id.clone()) {
                    continue;
                }
                let Some(handle) = self.repo.get(&id).await else {
                    continue;
                };

                let mut dependent = handle.write().await;
                if dependent.status.is_terminal() {
                    continue;
                }
                if dependent.status == TaskStatus::Running {
                    debug!(task_id = %id, failed = %parent, "dependent is running, not cancelling it");
                    stack.push(id);
                    continue;
                }
                dependent.cancel(format!(
                    "Cancelled due to dependency failure: {} - {}",
                    parent, message
                ))?;
                warn!(task_id = %id, failed = %parent, "task cancelled by failed dependency");

                cancelled.push(id.clone());
                stack.push(id);
            }
        }

        Ok(cancelled)
    }

    /// Runs the sub-tasks of a static batch one after another, in declaration
    /// order, and aggregates them into a [`BatchOutcome`].
    async fn process_static_batch(&self, handle: &TaskHandle) -> Result<Task, ProcessorError> {
        let (batch_id, subtasks) = {
            let batch = handle.read().await;
            let TaskKind::Batch(BatchSource::Static(subtasks)) = &batch.kind else {
                return Err(ProcessorError::Validation(format!(
                    "task {} is not a static batch",
                    batch.id
                )));
            };
            (batch.id.clone(), subtasks.clone())
        };

        if subtasks.is_empty() {
            let message = format!("batch {} has no sub-tasks", batch_id);
            handle.write().await.fail(message.clone())?;
            return Err(ProcessorError::Validation(message));
        }
        if let Some(cycle) = find_cycle(&subtasks) {
            let message = format_cycle(&cycle);
            handle
                .write()
                .await
                .fail(format!("Circular dependency detected: {}", message))?;
            return Err(ProcessorError::CircularDependency(message));
        }

        handle.write().await.transition(TaskStatus::Running)?;
        info!(batch_id = %batch_id, subtasks = subtasks.len(), "processing static batch");

        let mut outcome = BatchOutcome::default();
        for subtask in subtasks {
            let sub_id = subtask.id.clone();
            match self.process_task(subtask).await {
                Ok(done) => outcome.record(done, None),
                Err(e) => {
                    warn!(batch_id = %batch_id, task_id = %sub_id, error = %e, "sub-task rejected");
                    let snapshot = self.task(&sub_id).await;
                    match snapshot {
                        Some(task) => outcome.record(task, Some(e.to_string())),
                        None => outcome.errors.push(BatchError {
                            id: sub_id,
                            error: e.to_string(),
                        }),
                    }
                }
            }
        }

        let aggregated =
            serde_json::to_value(&outcome).map_err(|source| ProcessorError::Serialize {
                id: batch_id.clone(),
                source,
            })?;

        let finished = {
            let mut batch = handle.write().await;
            if batch.status.is_terminal() {
                // finished behind our back while sub-tasks ran
                warn!(batch_id = %batch_id, status = %batch.status, "batch already finished");
                batch.result.get_or_insert(aggregated);
            } else if !outcome.errors.is_empty() {
                batch.fail(format!(
                    "{} of {} sub-tasks failed",
                    outcome.errors.len(),
                    outcome.results.len()
                ))?;
                batch.result = Some(aggregated);
            } else if !outcome.pending.is_empty() {
                batch.transition(TaskStatus::Pending)?;
                batch.result = None;
            } else {
                batch.complete_with(Some(aggregated))?;
            }
            batch.clone()
        };

        info!(
            batch_id = %batch_id,
            status = %finished.status,
            errors = outcome.errors.len(),
            pending = outcome.pending.len(),
            "static batch processed"
        );

        if finished.status == TaskStatus::Error {
            let message = finished.error.clone().unwrap_or_default();
            self.propagate_error(&batch_id, &message).await?;
        }
        Ok(finished)
    }

    /// Generator-driven batches are expanded by the orchestrator that owns the
    /// task store, never here.
    async fn process_dynamic_batch(&self, handle: &TaskHandle) -> Result<Task, ProcessorError> {
        let mut batch = handle.write().await;
        let err = ProcessorError::DynamicBatchUnsupported(batch.id.clone());
        warn!(task_id = %batch.id, "dynamic batch rejected");
        batch.fail(err.to_string())?;
        Err(err)
    }

    /// Re-submits registered `pending` tasks until a full pass changes
    /// nothing. Pending tasks stuck behind a failed dependency are cancelled.
    pub async fn drain_pending(&self) -> Result<DrainReport, ProcessorError> {
        let mut report = DrainReport::default();

        loop {
            report.passes += 1;
            let mut progressed = false;

            for id in self.repo.ids().await {
                let Some(handle) = self.repo.get(&id).await else {
                    continue;
                };
                let task = handle.read().await.clone();
                if task.status != TaskStatus::Pending {
                    continue;
                }

                if task.is_batch() {
                    // a batch whose sub-tasks were rejected already surfaced
                    // that error to its caller; keep draining the rest
                    let status = match self.run(&handle).await {
                        Ok(done) => done.status,
                        Err(e) => {
                            warn!(task_id = %id, error = %e, "batch rejected while draining");
                            handle.read().await.status
                        }
                    };
                    progressed |= status != TaskStatus::Pending;
                    continue;
                }

                match self.checker.readiness(&task).await {
                    Readiness::Ready => {
                        let done = self.run(&handle).await?;
                        progressed |= done.status != TaskStatus::Pending;
                    }
                    Readiness::Blocked {
                        dependency,
                        status,
                        error,
                    } => {
                        let reason = error.unwrap_or_else(|| format!("dependency {}", status));
                        let message = format!(
                            "Cancelled due to dependency failure: {} - {}",
                            dependency, reason
                        );
                        handle.write().await.cancel(message.clone())?;
                        warn!(task_id = %id, dependency = %dependency, "pending task cancelled by failed dependency");
                        self.propagate_error(&id, &message).await?;
                        progressed = true;
                    }
                    Readiness::Waiting { .. } => {}
                }
            }

            if !progressed {
                break;
            }
        }

        for task in self.repo.snapshot().await {
            let bucket = match task.status {
                TaskStatus::Completed => &mut report.completed,
                TaskStatus::Error => &mut report.failed,
                TaskStatus::Cancelled => &mut report.cancelled,
                status if !status.is_terminal() => &mut report.pending,
                _ => continue,
            };
            bucket.push(task.id);
        }

        info!(
            passes = report.passes,
            completed = report.completed.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            pending = report.pending.len(),
            "drain finished"
        );
        Ok(report)
    }

    /// Ids of every tool invocation so far, in order, retries included.
    pub async fn execution_order(&self) -> Vec<TaskId> {
        self.execution_order.lock().await.clone()
    }

    /// Text tree of registered tasks: roots (no dependencies) first, each
    /// followed by the tasks that depend on it.
    pub async fn render_graph(&self) -> String {
        let tasks = self.repo.snapshot().await;
        let mut out = String::new();

        for root in tasks.iter().filter(|t| t.dependencies.is_empty()) {
            let _ = writeln!(out, "{} [{}]", root.id, root.status);
            let mut path = vec![&root.id];
            Self::render_chain(&tasks, &root.id, "  ", &mut path, &mut out);
        }

        out
    }

    fn render_chain<'a>(
        tasks: &'a [Task],
        id: &TaskId,
        prefix: &str,
        path: &mut Vec<&'a TaskId>,
        out: &mut String,
    ) {
        for child in tasks.iter().filter(|t| t.dependencies.contains(id)) {
            if path.contains(&&child.id) {
                let _ = writeln!(out, "{}└─> {} (cycle)", prefix, child.id);
                continue;
            }
            let _ = writeln!(out, "{}└─> {} [{}]", prefix, child.id, child.status);
            path.push(&child.id);
            Self::render_chain(tasks, &child.id, &format!("{}    ", prefix), path, out);
            path.pop();
        }
    }
}
