// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency-aware task scheduler.
//!
//! Jobs arrive as batches of tasks with `depends_on` edges between them.
//! The scheduler owns the dependency graph on its own event loop, so graph
//! mutation needs no locking; workers run on the side, bounded by a
//! semaphore, and report back over the same event channel. Task status is
//! persisted through the [`TaskStore`] at every edge so a restarted
//! coordinator can pick up where it left off via [`Scheduler::recover`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::model::{Job, Task, TaskStatus};
use crate::store::TaskStore;

/// Lower bound on worker parallelism regardless of configuration.
const MIN_CONCURRENT: usize = 4;

const EVENT_QUEUE_DEPTH: usize = 256;

/// Executes one task. Implementations must be idempotent: after a crash the
/// scheduler re-runs tasks that were mid-flight.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: Task) -> Result<()>;

    /// Best-effort interruption of a running task.
    async fn cancel(&self, task: Task, reason: &str);
}

#[derive(Debug)]
enum TaskOutcome {
    Completed,
    Failed { reason: String },
}

#[derive(Debug)]
enum SchedulerEvent {
    AddJob(Job),
    TaskFinished {
        task_id: String,
        job_id: String,
        outcome: TaskOutcome,
    },
    CancelJob {
        job_id: String,
        reason: String,
    },
    Shutdown,
}

/// Cheap clonable handle for feeding the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub async fn add_job(&self, job: Job) -> Result<()> {
        self.send(SchedulerEvent::AddJob(job)).await
    }

    pub async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<()> {
        self.send(SchedulerEvent::CancelJob {
            job_id: job_id.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SchedulerEvent::Shutdown).await;
    }

    async fn send(&self, event: SchedulerEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CoreError::ExecutionFailed {
                action: "schedule".to_string(),
                details: "scheduler is not running".to_string(),
            })
    }
}

struct TaskNode {
    task: Task,
    /// Dependency task ids that have not completed yet.
    live_deps: HashSet<String>,
}

#[derive(Default)]
struct Graph {
    tasks: HashMap<String, TaskNode>,
    /// Task ids per job, in submission order.
    jobs: HashMap<String, Vec<String>>,
    /// Reverse edges: dependency id to the tasks waiting on it.
    dependents: HashMap<String, Vec<String>>,
}

impl Graph {
    fn insert(&mut self, task: Task, live_deps: HashSet<String>) {
        for dep in &live_deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(task.id.clone());
        }
        self.jobs
            .entry(task.job_id.clone())
            .or_default()
            .push(task.id.clone());
        self.tasks
            .insert(task.id.clone(), TaskNode { task, live_deps });
    }

    fn remove(&mut self, task_id: &str) -> Option<TaskNode> {
        self.tasks.remove(task_id)
    }

    /// Dependents of `task_id` whose last live dependency this resolves.
    fn resolve_dep(&mut self, task_id: &str) -> Vec<String> {
        let mut ready = Vec::new();
        for dependent in self.dependents.remove(task_id).unwrap_or_default() {
            if let Some(node) = self.tasks.get_mut(&dependent) {
                node.live_deps.remove(task_id);
                if node.live_deps.is_empty() && node.task.status == TaskStatus::Pending {
                    ready.push(dependent);
                }
            }
        }
        ready
    }

    /// All tasks transitively waiting on `task_id`, in traversal order.
    fn transitive_dependents(&self, task_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut queue = vec![task_id.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop() {
            for dependent in self.dependents.get(&id).into_iter().flatten() {
                if self.tasks.contains_key(dependent) && seen.insert(dependent.clone()) {
                    out.push(dependent.clone());
                    queue.push(dependent.clone());
                }
            }
        }
        out
    }

    /// Whether every task of the job has left the graph.
    fn job_drained(&self, job_id: &str) -> bool {
        self.jobs
            .get(job_id)
            .is_some_and(|ids| ids.iter().all(|id| !self.tasks.contains_key(id)))
    }
}

/// The scheduler's event loop. Construct with [`Scheduler::new`], call
/// [`Scheduler::recover`] once, then drive it with [`Scheduler::run`].
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn TaskRunner>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<SchedulerEvent>,
    rx: mpsc::Receiver<SchedulerEvent>,
    graph: Graph,
    workers: JoinSet<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        runner: Arc<dyn TaskRunner>,
        max_concurrent: usize,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let scheduler = Self {
            store,
            runner,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(MIN_CONCURRENT))),
            tx: tx.clone(),
            rx,
            graph: Graph::default(),
            workers: JoinSet::new(),
        };
        (scheduler, SchedulerHandle { tx })
    }

    /// Rebuild the graph from persisted non-terminal tasks.
    ///
    /// Tasks that were running when the coordinator died are dispatched
    /// again right away. Pending tasks whose dependency already failed or
    /// was cancelled are cancelled here rather than re-entering the graph.
    #[instrument(skip(self))]
    pub async fn recover(&mut self) -> Result<()> {
        let active = self.store.list_active_tasks().await?;
        if active.is_empty() {
            return Ok(());
        }

        let mut by_job: HashMap<String, Vec<Task>> = HashMap::new();
        for task in active {
            by_job.entry(task.job_id.clone()).or_default().push(task);
        }

        let job_count = by_job.len();
        let mut dispatched = 0usize;

        // Statuses of every task in the affected jobs. Dependencies outside
        // these jobs are looked up from the store on demand.
        let mut status_of: HashMap<String, TaskStatus> = HashMap::new();
        for job_id in by_job.keys() {
            for t in self.store.list_job_tasks(job_id).await? {
                status_of.insert(t.id, t.status);
            }
        }

        for (_job_id, tasks) in by_job {
            let mut ready = Vec::new();
            for task in tasks {
                match task.status {
                    TaskStatus::Running | TaskStatus::Cancelling => {
                        // Mid-flight at crash time. Runners are idempotent,
                        // so just run it again.
                        self.graph.insert(task.clone(), HashSet::new());
                        ready.push(task.id);
                    }
                    TaskStatus::Pending => {
                        let mut failed_dep = None;
                        let mut live_deps = HashSet::new();
                        for dep in &task.data.depends_on {
                            let status = match status_of.get(dep.as_str()).copied() {
                                Some(status) => Some(status),
                                None => {
                                    let fetched =
                                        self.store.get_task(dep).await?.map(|t| t.status);
                                    if let Some(status) = fetched {
                                        status_of.insert(dep.clone(), status);
                                    }
                                    fetched
                                }
                            };
                            match status {
                                Some(TaskStatus::Failed | TaskStatus::Cancelled) => {
                                    failed_dep = Some(dep.clone());
                                    break;
                                }
                                Some(TaskStatus::Completed) => {}
                                Some(_) => {
                                    live_deps.insert(dep.clone());
                                }
                                None => {
                                    warn!(
                                        task_id = %task.id,
                                        dep,
                                        "dependency unknown to the store, treating as satisfied"
                                    );
                                }
                            }
                        }
                        if let Some(dep) = failed_dep {
                            let reason = format!("dependency task {} did not complete", dep);
                            self.store
                                .set_task_status(&task.id, TaskStatus::Cancelled, Some(&reason))
                                .await?;
                            continue;
                        }

                        let runnable = live_deps.is_empty();
                        self.graph.insert(task.clone(), live_deps);
                        if runnable {
                            ready.push(task.id);
                        }
                    }
                    _ => {}
                }
            }

            dispatched += ready.len();
            for task_id in ready {
                self.dispatch(&task_id);
            }
        }

        info!(jobs = job_count, dispatched, "recovered unfinished jobs");
        Ok(())
    }

    /// Run the event loop until [`SchedulerHandle::shutdown`] is called or
    /// every handle is dropped. Shutdown drains in-flight workers before
    /// returning, so no task is dropped mid-execution.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            // Reap workers that have already finished.
            while self.workers.try_join_next().is_some() {}
            match event {
                SchedulerEvent::AddJob(job) => self.handle_add_job(job).await,
                SchedulerEvent::TaskFinished {
                    task_id,
                    job_id,
                    outcome,
                } => self.handle_task_finished(&task_id, &job_id, outcome).await,
                SchedulerEvent::CancelJob { job_id, reason } => {
                    self.handle_cancel_job(&job_id, &reason).await
                }
                SchedulerEvent::Shutdown => break,
            }
        }
        // Workers still report completion into the (now closed) queue; their
        // terminal status is persisted before that, so dropping the events
        // is safe.
        self.rx.close();
        while self.workers.join_next().await.is_some() {}
        info!("scheduler stopped");
    }

    async fn handle_add_job(&mut self, job: Job) {
        if self.graph.jobs.contains_key(&job.id) {
            warn!(job_id = %job.id, "ignoring duplicate job submission");
            return;
        }

        let in_job: HashSet<String> = job.tasks.iter().map(|t| t.id.clone()).collect();
        for task in job.tasks {
            // A dependency is live when it is a sibling in this job or a
            // still-tracked task from an earlier job. Anything else has
            // already left the graph and counts as satisfied.
            let live_deps: HashSet<String> = task
                .data
                .depends_on
                .iter()
                .filter(|dep| {
                    in_job.contains(dep.as_str()) || self.graph.tasks.contains_key(dep.as_str())
                })
                .cloned()
                .collect();
            debug!(task_id = %task.id, action = %task.action, deps = live_deps.len(), "queued task");
            self.graph.insert(task, live_deps);
        }

        // Dispatch after the whole job is linked so reverse edges exist.
        let roots: Vec<String> = self
            .graph
            .jobs
            .get(&job.id)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.graph
                    .tasks
                    .get(*id)
                    .is_some_and(|n| n.live_deps.is_empty())
            })
            .cloned()
            .collect();
        info!(job_id = %job.id, roots = roots.len(), "job accepted");
        for task_id in roots {
            self.dispatch(&task_id);
        }
    }

    async fn handle_task_finished(&mut self, task_id: &str, job_id: &str, outcome: TaskOutcome) {
        if self.graph.remove(task_id).is_none() {
            debug!(task_id, "finished task no longer tracked");
            return;
        }

        match outcome {
            TaskOutcome::Completed => {
                for ready in self.graph.resolve_dep(task_id) {
                    self.dispatch(&ready);
                }
            }
            TaskOutcome::Failed { reason } => {
                self.cascade_cancel(task_id, &reason).await;
            }
        }

        if self.graph.job_drained(job_id) {
            self.graph.jobs.remove(job_id);
            info!(job_id, "job finished");
        }
    }

    /// Cancel every pending task transitively waiting on `task_id`.
    ///
    /// Each swept-up task passes through Cancelling, gets its compensating
    /// action from the runner, and lands on Cancelled.
    async fn cascade_cancel(&mut self, task_id: &str, upstream_reason: &str) {
        let reason = format!("dependency task {} failed: {}", task_id, upstream_reason);
        for dependent in self.graph.transitive_dependents(task_id) {
            // Only pending tasks are swept up; anything already running
            // finishes on its own merits.
            let task = match self.graph.tasks.get_mut(&dependent) {
                Some(node) if node.task.status == TaskStatus::Pending => {
                    node.task.status = TaskStatus::Cancelling;
                    node.task.clone()
                }
                _ => continue,
            };
            if let Err(e) = self
                .store
                .set_task_status(&dependent, TaskStatus::Cancelling, Some(&reason))
                .await
            {
                error!(task_id = %dependent, error = %e, "failed to persist cancelling state");
            }
            self.runner.cancel(task, &reason).await;
            if let Err(e) = self
                .store
                .set_task_status(&dependent, TaskStatus::Cancelled, Some(&reason))
                .await
            {
                error!(task_id = %dependent, error = %e, "failed to persist cascade cancellation");
            }
            info!(task_id = %dependent, cause = task_id, "task cancelled, dependency failed");
            self.graph.remove(&dependent);
        }
    }

    async fn handle_cancel_job(&mut self, job_id: &str, reason: &str) {
        let Some(task_ids) = self.graph.jobs.get(job_id).cloned() else {
            warn!(job_id, "cancel for unknown or finished job");
            return;
        };
        info!(job_id, reason, "cancelling job");

        for task_id in task_ids {
            let Some(node) = self.graph.tasks.get_mut(&task_id) else {
                continue;
            };
            match node.task.status {
                TaskStatus::Pending => {
                    if let Err(e) = self
                        .store
                        .set_task_status(&task_id, TaskStatus::Cancelled, Some(reason))
                        .await
                    {
                        error!(task_id = %task_id, error = %e, "failed to persist cancellation");
                    }
                    self.graph.remove(&task_id);
                }
                TaskStatus::Running => {
                    node.task.status = TaskStatus::Cancelling;
                    if let Err(e) = self
                        .store
                        .set_task_status(&task_id, TaskStatus::Cancelling, Some(reason))
                        .await
                    {
                        error!(task_id = %task_id, error = %e, "failed to persist cancelling state");
                    }
                    let runner = self.runner.clone();
                    let task = node.task.clone();
                    let reason = reason.to_string();
                    self.workers.spawn(async move {
                        runner.cancel(task, &reason).await;
                    });
                }
                _ => {}
            }
        }

        if self.graph.job_drained(job_id) {
            self.graph.jobs.remove(job_id);
            info!(job_id, "job finished");
        }
    }

    /// Spawn a worker for a ready task. The worker waits for a concurrency
    /// permit, persists the running state, executes, persists the terminal
    /// state and reports back to the loop.
    fn dispatch(&mut self, task_id: &str) {
        let Some(node) = self.graph.tasks.get_mut(task_id) else {
            return;
        };
        node.task.status = TaskStatus::Running;
        let task = node.task.clone();

        let store = self.store.clone();
        let runner = self.runner.clone();
        let semaphore = self.semaphore.clone();
        let tx = self.tx.clone();

        self.workers.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };

            if let Err(e) = store
                .set_task_status(&task.id, TaskStatus::Running, None)
                .await
            {
                error!(task_id = %task.id, error = %e, "failed to persist running state");
            }
            debug!(task_id = %task.id, action = %task.action, db = %task.db_name, "task started");

            let outcome = match runner.run(task.clone()).await {
                Ok(()) => {
                    if let Err(e) = store
                        .set_task_status(&task.id, TaskStatus::Completed, None)
                        .await
                    {
                        error!(task_id = %task.id, error = %e, "failed to persist completion");
                    }
                    info!(task_id = %task.id, action = %task.action, "task completed");
                    TaskOutcome::Completed
                }
                Err(e) => {
                    let reason = e.to_string();
                    if !e.is_logged() {
                        error!(task_id = %task.id, action = %task.action, error = %reason, "task failed");
                    }
                    if let Err(pe) = store
                        .set_task_status(&task.id, TaskStatus::Failed, Some(&reason))
                        .await
                    {
                        error!(task_id = %task.id, error = %pe, "failed to persist failure");
                    }
                    TaskOutcome::Failed { reason }
                }
            };

            let _ = tx
                .send(SchedulerEvent::TaskFinished {
                    task_id: task.id,
                    job_id: task.job_id,
                    outcome,
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskAction, TaskData};
    use chrono::Utc;

    fn task(id: &str, deps: &[&str]) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            job_id: "j-1".to_string(),
            db_id: "d-1".to_string(),
            db_name: "shop".to_string(),
            instance_name: "pg-1".to_string(),
            action: TaskAction::CreateUser,
            status: TaskStatus::Pending,
            reason: None,
            data: TaskData {
                depends_on: deps.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    fn linked_graph(tasks: Vec<Task>) -> Graph {
        let mut graph = Graph::default();
        let in_job: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        for t in tasks {
            let deps: HashSet<String> = t
                .data
                .depends_on
                .iter()
                .filter(|d| in_job.contains(*d))
                .cloned()
                .collect();
            graph.insert(t, deps);
        }
        graph
    }

    #[test]
    fn test_resolve_dep_releases_only_fully_satisfied_tasks() {
        let mut graph = linked_graph(vec![
            task("a", &[]),
            task("b", &[]),
            task("c", &["a", "b"]),
        ]);

        graph.remove("a");
        assert!(graph.resolve_dep("a").is_empty());

        graph.remove("b");
        assert_eq!(graph.resolve_dep("b"), vec!["c".to_string()]);
    }

    #[test]
    fn test_transitive_dependents_walks_whole_chain() {
        let graph = linked_graph(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &["a"]),
        ]);

        let mut downstream = graph.transitive_dependents("a");
        downstream.sort();
        assert_eq!(downstream, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_job_drained_after_all_tasks_removed() {
        let mut graph = linked_graph(vec![task("a", &[]), task("b", &["a"])]);
        assert!(!graph.job_drained("j-1"));
        graph.remove("a");
        graph.remove("b");
        assert!(graph.job_drained("j-1"));
    }

    #[test]
    fn test_cross_job_link_resolves_like_a_sibling() {
        let mut graph = linked_graph(vec![task("a", &[])]);

        // A later job's task waiting on "a" gets the same reverse edge
        let mut waiter = task("b", &["a"]);
        waiter.job_id = "j-2".to_string();
        graph.insert(waiter, ["a".to_string()].into_iter().collect());

        graph.remove("a");
        assert_eq!(graph.resolve_dep("a"), vec!["b".to_string()]);
    }
}
