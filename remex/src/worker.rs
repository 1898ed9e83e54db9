use crate::agent::AdminOp;
use crate::config::Config;
use crate::protocol::InvocationId;
use crate::task::{FuncRef, Task, TaskError, TaskId};
use crate::value::{FromValue, Value};
use crate::HashMap;
use crate::info;
use color_eyre::eyre::{eyre, Report};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct WorkerInner {
    agent_addr: SocketAddr,
    config: Config,
    capacity: Cell<usize>,
    permits: RefCell<Option<Arc<Semaphore>>>,
    tasks: RefCell<HashMap<TaskId, Task>>,
    sync_tag: Cell<usize>,
    syncing: Cell<bool>,
}

/// Driver-side handle to one agent's execution slots.
///
/// Cheap to clone; all clones observe the same capacity accounting, task
/// set and sync tag.
#[derive(Clone)]
pub struct Worker {
    inner: Rc<WorkerInner>,
}

impl Worker {
    /// Creates a worker with an explicit parallel task limit.
    pub fn with_capacity(
        agent_addr: SocketAddr,
        capacity: usize,
        config: Config,
    ) -> Self {
        let worker = Self::detached(agent_addr, config);
        worker.install_capacity(capacity);
        worker
    }

    /// Creates a worker, asking the agent for its CPU count when no
    /// explicit limit is given.
    pub async fn connect(
        agent_addr: SocketAddr,
        parallel_task_limit: Option<usize>,
        config: Config,
    ) -> Result<Self, Report> {
        let worker = Self::detached(agent_addr, config);
        let capacity = match parallel_task_limit {
            Some(limit) => limit,
            None => worker.cpu_count().await?,
        };
        worker.install_capacity(capacity);
        Ok(worker)
    }

    fn detached(agent_addr: SocketAddr, config: Config) -> Self {
        Self {
            inner: Rc::new(WorkerInner {
                agent_addr,
                config,
                capacity: Cell::new(0),
                permits: RefCell::new(None),
                tasks: RefCell::new(HashMap::new()),
                sync_tag: Cell::new(0),
                syncing: Cell::new(false),
            }),
        }
    }

    fn install_capacity(&self, capacity: usize) {
        self.inner.capacity.set(capacity);
        *self.inner.permits.borrow_mut() =
            Some(Arc::new(Semaphore::new(capacity)));
    }

    pub fn agent_addr(&self) -> SocketAddr {
        self.inner.agent_addr
    }

    pub fn config(&self) -> Config {
        self.inner.config
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.get()
    }

    /// Fraction of capacity taken by non-admin tasks.
    pub fn utilization(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 1.0;
        }
        let running = self
            .inner
            .tasks
            .borrow()
            .values()
            .filter(|task| !task.is_admin())
            .count();
        running as f64 / capacity as f64
    }

    pub fn is_available(&self) -> bool {
        self.utilization() < 1.0
    }

    /// Blocks until a capacity permit is free. Admin tasks never call this.
    pub(crate) async fn wait_until_idle(
        &self,
    ) -> Result<OwnedSemaphorePermit, Report> {
        let permits = self
            .inner
            .permits
            .borrow()
            .clone()
            .ok_or_else(|| eyre!("worker capacity not yet known"))?;
        permits
            .acquire_owned()
            .await
            .map_err(|_| eyre!("worker permits closed"))
    }

    pub(crate) fn add_task(&self, task: &Task) {
        self.inner.tasks.borrow_mut().insert(task.id(), task.clone());
    }

    pub(crate) fn on_finish_task(&self, task: &Task) {
        self.inner.tasks.borrow_mut().remove(&task.id());
    }

    pub fn task_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    pub fn sync_tag(&self) -> usize {
        self.inner.sync_tag.get()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.get()
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        self.inner.syncing.set(syncing);
    }

    /// Kills every tracked task and forgets them.
    pub fn clean(&self) {
        let tasks: Vec<Task> =
            self.inner.tasks.borrow().values().cloned().collect();
        for task in tasks {
            task.kill();
        }
        self.inner.tasks.borrow_mut().clear();
    }

    // ------------------------------------------------------------------
    // admin surface
    // ------------------------------------------------------------------

    /// Runs one admin call on this worker's agent, bypassing capacity.
    pub async fn call_admin(
        &self,
        op: AdminOp,
        positional: Vec<Value>,
    ) -> Result<Value, TaskError> {
        let task = Task::new(admin_func_ref(op), positional);
        task.assign_to(self);
        task.join().await
    }

    pub async fn hello(&self) -> Result<String, TaskError> {
        let value = self.call_admin(AdminOp::Hello, vec![]).await?;
        convert(value)
    }

    pub async fn cpu_count(&self) -> Result<usize, TaskError> {
        let value = self.call_admin(AdminOp::CpuCount, vec![]).await?;
        let count: i64 = convert(value)?;
        Ok(count as usize)
    }

    pub async fn list(&self) -> Result<Vec<String>, TaskError> {
        let value = self.call_admin(AdminOp::List, vec![]).await?;
        let identifiers: Vec<Value> = convert(value)?;
        identifiers
            .into_iter()
            .map(|identifier| {
                String::from_value(identifier)
                    .map_err(|e| TaskError::Protocol(format!("{:?}", e)))
            })
            .collect()
    }

    pub async fn suspend(&self, id: InvocationId) -> Result<(), TaskError> {
        self.call_admin(AdminOp::Suspend, vec![Value::from(id)])
            .await?;
        Ok(())
    }

    pub async fn resume(&self, id: InvocationId) -> Result<(), TaskError> {
        self.call_admin(AdminOp::Resume, vec![Value::from(id)])
            .await?;
        Ok(())
    }

    pub async fn dir_signature(
        &self,
        subpath: &str,
        is_dir: bool,
    ) -> Result<Vec<u8>, TaskError> {
        let value = self
            .call_admin(
                AdminOp::DirSignature,
                vec![Value::from(subpath), Value::from(is_dir)],
            )
            .await?;
        convert(value)
    }

    pub async fn dir_patch(
        &self,
        delta: Vec<u8>,
        subpath: &str,
    ) -> Result<(), TaskError> {
        self.call_admin(
            AdminOp::DirPatch,
            vec![Value::from(delta), Value::from(subpath)],
        )
        .await?;
        Ok(())
    }

    pub async fn clean_cache(&self) -> Result<(), TaskError> {
        self.call_admin(AdminOp::CleanCache, vec![]).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // directory synchronization
    // ------------------------------------------------------------------

    /// Computes the delta that takes this worker's copy of `path` to the
    /// driver's: remote signature, then local delta via the external tool.
    pub async fn calc_dir_delta(&self, path: &Path) -> Result<Vec<u8>, Report> {
        let subpath = path
            .to_str()
            .ok_or_else(|| eyre!("non-utf8 path: {:?}", path))?;
        let sig = self.dir_signature(subpath, path.is_dir()).await?;
        info!(
            "[worker] {}: got signature [size: {}]",
            self.agent_addr(),
            sig.len()
        );
        let delta = crate::rdiff::dir_delta(&sig, path).await?;
        info!(
            "[worker] {}: delta calculated [size: {}]",
            self.agent_addr(),
            delta.len()
        );
        Ok(delta)
    }

    /// Applies one precomputed layer delta and clears the agent's module
    /// cache, advancing this worker's sync tag.
    pub async fn sync_with_delta(
        &self,
        delta: Vec<u8>,
        path: &Path,
    ) -> Result<(), Report> {
        let subpath = path
            .to_str()
            .ok_or_else(|| eyre!("non-utf8 path: {:?}", path))?;
        self.dir_patch(delta, subpath).await?;
        info!("[worker] {}: patch finished", self.agent_addr());
        self.clean_cache().await?;
        info!("[worker] {}: cache cleaned", self.agent_addr());
        self.inner.sync_tag.set(self.inner.sync_tag.get() + 1);
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker[{}]", self.agent_addr())
    }
}

fn admin_func_ref(op: AdminOp) -> FuncRef {
    let func = FuncRef::new(op.identifier());
    match op {
        AdminOp::Hello | AdminOp::CpuCount | AdminOp::List
        | AdminOp::CleanCache => func,
        AdminOp::Suspend | AdminOp::Resume => func.param("uuid"),
        AdminOp::DirSignature => func.param("subpath").param("is_dir"),
        AdminOp::DirPatch => func.param("delta").param("subpath"),
    }
}

fn convert<T: FromValue>(value: Value) -> Result<T, TaskError> {
    T::from_value(value).map_err(|e| TaskError::Protocol(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worker(capacity: usize) -> Worker {
        Worker::with_capacity(
            SocketAddr::from(([127, 0, 0, 1], 8333)),
            capacity,
            Config::new(),
        )
    }

    #[test]
    fn utilization_ignores_admin_tasks() {
        let worker = test_worker(2);
        assert_eq!(worker.utilization(), 0.0);
        assert!(worker.is_available());

        let user = Task::new(FuncRef::new("tasks:sqr").param("x"), vec![]);
        let admin = Task::new(FuncRef::new("_adm_list"), vec![]);
        worker.add_task(&user);
        worker.add_task(&admin);

        assert_eq!(worker.utilization(), 0.5);
        assert!(worker.is_available());
        assert_eq!(worker.task_count(), 2);
    }

    #[test]
    fn full_worker_is_unavailable() {
        let worker = test_worker(1);
        let task = Task::new(FuncRef::new("tasks:sqr").param("x"), vec![]);
        worker.add_task(&task);
        assert_eq!(worker.utilization(), 1.0);
        assert!(!worker.is_available());

        worker.on_finish_task(&task);
        assert!(worker.is_available());
    }

    #[test]
    fn unknown_capacity_is_unavailable() {
        let worker = Worker::detached(
            SocketAddr::from(([127, 0, 0, 1], 8333)),
            Config::new(),
        );
        assert!(!worker.is_available());
    }

    #[test]
    fn admin_func_refs_bind_their_arguments() {
        let bound = admin_func_ref(AdminOp::DirSignature)
            .bind(
                vec![Value::from("code"), Value::from(true)],
                crate::value::Kwargs::new(),
            )
            .unwrap();
        assert_eq!(bound.get::<String>("subpath").unwrap(), "code");
        assert!(bound.get::<bool>("is_dir").unwrap());
    }

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let worker = test_worker(2);
        let first = worker.wait_until_idle().await.unwrap();
        let _second = worker.wait_until_idle().await.unwrap();
        // third acquire would block: try a timed acquire
        let third = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            worker.wait_until_idle(),
        )
        .await;
        assert!(third.is_err());
        drop(first);
        let fourth = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            worker.wait_until_idle(),
        )
        .await;
        assert!(fourth.is_ok());
    }
}
