use crate::config::Config;
use crate::platform::Platform;
use crate::sync::SyncStack;
use crate::task::{FuncRef, Task, TaskError};
use crate::value::{Kwargs, Value};
use crate::worker::Worker;
use crate::{log, warn};
use color_eyre::eyre::Report;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;

struct ClusterInner {
    config: Config,
    task_queue: RefCell<VecDeque<Task>>,
    processing: RefCell<Vec<Task>>,
    workers: Vec<Worker>,
    sync_stack: SyncStack,
}

impl ClusterInner {
    /// A worker must not receive new user tasks while it is syncing, lags
    /// behind the computed layers, or some layer still has no delta.
    fn need_sync(&self, worker: &Worker) -> bool {
        worker.is_syncing()
            || self.sync_stack.need_sync(worker)
            || self.sync_stack.has_unknown_delta()
    }

    async fn sync_worker(&self, worker: &Worker) {
        if worker.is_syncing() {
            return;
        }
        if self.sync_stack.need_sync(worker) {
            // already behind: apply the precomputed layers
            self.sync_stack.start_sync(worker);
        } else if self.sync_stack.has_unknown_delta()
            && worker.sync_tag() == self.sync_stack.latest_tag()
        {
            // first worker at the head computes the next delta
            match self.sync_stack.update_delta(worker).await {
                Ok(()) => self.sync_stack.start_sync(worker),
                Err(e) => {
                    warn!(
                        "[cluster] error computing delta on {:?}: {:?}",
                        worker, e
                    );
                }
            }
        }
    }
}

/// The top-level controller: owns platforms and their workers, runs the
/// scheduler, accepts task submissions.
///
/// Must be constructed and driven from inside a `tokio::task::LocalSet`.
pub struct Cluster {
    platforms: RefCell<Vec<Box<dyn Platform>>>,
    inner: Rc<ClusterInner>,
    scheduler: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

impl Cluster {
    /// Prepares every platform's services in parallel, collects their
    /// workers and starts the scheduler.
    pub async fn new(
        mut platforms: Vec<Box<dyn Platform>>,
        config: Config,
    ) -> Result<Self, Report> {
        let prepares = platforms
            .iter_mut()
            .map(|platform| platform.prepare_services(&config));
        for result in futures::future::join_all(prepares).await {
            result?;
        }

        // insertion order across platforms and services
        let workers: Vec<Worker> = platforms
            .iter()
            .flat_map(|platform| platform.services())
            .flat_map(|service| service.workers())
            .cloned()
            .collect();

        let inner = Rc::new(ClusterInner {
            config,
            task_queue: RefCell::new(VecDeque::new()),
            processing: RefCell::new(Vec::new()),
            workers,
            sync_stack: SyncStack::new(),
        });

        let scheduler =
            tokio::task::spawn_local(scheduler_task(inner.clone()));

        let cluster = Self {
            platforms: RefCell::new(platforms),
            inner,
            scheduler: RefCell::new(Some(scheduler)),
        };
        if config.sync_current_dir() {
            cluster.sync_dir(".");
        }
        Ok(cluster)
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.inner.workers.clone()
    }

    pub(crate) fn sync_stack(&self) -> &SyncStack {
        &self.inner.sync_stack
    }

    /// Enqueues one task and returns its handle immediately.
    pub fn submit(&self, func: &FuncRef, positional: Vec<Value>) -> Task {
        self.submit_with_kwargs(func, positional, Kwargs::new())
    }

    pub fn submit_with_kwargs(
        &self,
        func: &FuncRef,
        positional: Vec<Value>,
        keyword: Kwargs,
    ) -> Task {
        let task = Task::with_kwargs(func.clone(), positional, keyword);
        log!("[cluster] submitted {:?}", task);
        self.inner.task_queue.borrow_mut().push_back(task.clone());
        task
    }

    /// Submits one task per argument tuple and collects results in
    /// submission order, propagating the first failure.
    pub async fn map(
        &self,
        func: &FuncRef,
        args: impl IntoIterator<Item = Vec<Value>>,
    ) -> Result<Vec<Value>, TaskError> {
        let tasks: Vec<Task> = args
            .into_iter()
            .map(|positional| self.submit(func, positional))
            .collect();
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(task.join().await?);
        }
        Ok(results)
    }

    /// Appends a snapshot of `path`; every worker observes it before
    /// running any task assigned afterwards.
    pub fn sync_dir(&self, path: impl Into<PathBuf>) {
        self.inner.sync_stack.append(path);
    }

    /// Stops the scheduler and pending syncs, then cleans every platform in
    /// parallel. Queued tasks never start; in-flight tasks are killed by
    /// their platform's cleanup.
    pub async fn clean(&self) {
        if let Some(scheduler) = self.scheduler.borrow_mut().take() {
            scheduler.abort();
        }
        self.inner.sync_stack.stop();
        let mut platforms = self.platforms.borrow_mut();
        let cleans =
            platforms.iter_mut().map(|platform| platform.clean());
        for result in futures::future::join_all(cleans).await {
            if let Err(e) = result {
                warn!("[cluster] error cleaning platform: {:?}", e);
            }
        }
    }
}

/// The scheduler: one cooperative task mapping the FIFO queue onto
/// available worker slots, quiescing workers that need sync.
async fn scheduler_task(inner: Rc<ClusterInner>) {
    loop {
        for worker in inner.workers.iter() {
            if inner.need_sync(worker) {
                inner.sync_worker(worker).await;
            } else {
                while worker.is_available() {
                    let task = inner.task_queue.borrow_mut().pop_front();
                    match task {
                        Some(task) => {
                            log!(
                                "[cluster] assigning {:?} to {:?}",
                                task,
                                worker
                            );
                            inner.processing.borrow_mut().push(task.clone());
                            task.assign_to(worker);
                        }
                        None => break,
                    }
                }
            }
        }
        tokio::time::sleep(inner.config.schedule_interval()).await;
    }
}
