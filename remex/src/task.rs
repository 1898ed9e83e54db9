use crate::port::Port;
use crate::protocol::{self, InvocationId, Reply, Request};
use crate::value::{Kwargs, Remotable, Value};
use crate::worker::Worker;
use crate::{log, warn};
use color_eyre::eyre::{eyre, Report};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;

/// Driver-side task id, unique within the driver thread.
pub type TaskId = u64;

thread_local! {
    static NEXT_TASK_ID: Cell<TaskId> = Cell::new(0);
}

fn next_task_id() -> TaskId {
    NEXT_TASK_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    })
}

/// Task lifecycle. Transitions only move forward:
/// `Waiting → Ready → Running → {Succeed, Failed}`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum TaskState {
    /// unassigned, sitting in the cluster queue
    Waiting,
    /// assigned and holding a capacity permit
    Ready,
    /// handshake complete, request in flight
    Running,
    Succeed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeed | TaskState::Failed)
    }
}

/// Error a failed task surfaces through `join`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// the remote callable raised; carries its textual form and traceback
    #[error("remote call failed: {exception}")]
    Remote {
        exception: String,
        traceback: String,
    },
    /// the connection failed before a response arrived
    #[error("transport failure: {0}")]
    Transport(String),
    /// malformed exchange: bad arguments or an undecodable frame
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TaskError {
    /// The remote traceback text, when the failure happened remotely.
    pub fn traceback(&self) -> Option<&str> {
        match self {
            TaskError::Remote { traceback, .. } => Some(traceback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Param {
    name: String,
    default: Option<Value>,
}

/// Reference to a remote function: its identifier plus the parameter list
/// positional arguments are bound against.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncRef {
    identifier: String,
    params: Vec<Param>,
}

impl FuncRef {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn param_with_default(
        mut self,
        name: impl Into<String>,
        default: impl Into<Value>,
    ) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: Some(default.into()),
        });
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Binds positional and keyword arguments against the parameter list,
    /// filling declared defaults, like a call-site signature bind.
    pub fn bind(
        &self,
        positional: Vec<Value>,
        keyword: Kwargs,
    ) -> Result<Kwargs, Report> {
        if positional.len() > self.params.len() {
            return Err(eyre!(
                "{} takes {} arguments, {} given",
                self.identifier,
                self.params.len(),
                positional.len()
            ));
        }
        let mut bound = Kwargs::new();
        let mut positional = positional.into_iter();
        for param in &self.params {
            if let Some(value) = positional.next() {
                if keyword.contains(&param.name) {
                    return Err(eyre!(
                        "{} got multiple values for '{}'",
                        self.identifier,
                        param.name
                    ));
                }
                bound.insert(param.name.clone(), value);
            } else if keyword.contains(&param.name) {
                bound.insert(param.name.clone(), keyword.get::<Value>(&param.name)?);
            } else if let Some(default) = &param.default {
                bound.insert(param.name.clone(), default.clone());
            } else {
                return Err(eyre!(
                    "{} missing required argument '{}'",
                    self.identifier,
                    param.name
                ));
            }
        }
        for (name, _) in keyword.iter() {
            if !self.params.iter().any(|param| &param.name == name) {
                return Err(eyre!(
                    "{} got an unexpected argument '{}'",
                    self.identifier,
                    name
                ));
            }
        }
        Ok(bound)
    }
}

struct CallArgs {
    positional: Vec<Value>,
    keyword: Kwargs,
}

struct TaskInner {
    id: TaskId,
    func: FuncRef,
    args: RefCell<Option<CallArgs>>,
    state: Cell<TaskState>,
    result: RefCell<Option<Result<Value, TaskError>>>,
    done: Notify,
    worker_addr: Cell<Option<std::net::SocketAddr>>,
    remote_id: Cell<Option<InvocationId>>,
    assigned: Cell<bool>,
    handle: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

/// One remote call in flight: a cheap handle over the shared state the
/// execute task and the joining caller both observe.
#[derive(Clone)]
pub struct Task {
    inner: Rc<TaskInner>,
}

impl Task {
    pub fn new(func: FuncRef, positional: Vec<Value>) -> Self {
        Self::with_kwargs(func, positional, Kwargs::new())
    }

    pub fn with_kwargs(
        func: FuncRef,
        positional: Vec<Value>,
        keyword: Kwargs,
    ) -> Self {
        Self {
            inner: Rc::new(TaskInner {
                id: next_task_id(),
                func,
                args: RefCell::new(Some(CallArgs {
                    positional,
                    keyword,
                })),
                state: Cell::new(TaskState::Waiting),
                result: RefCell::new(None),
                done: Notify::new(),
                worker_addr: Cell::new(None),
                remote_id: Cell::new(None),
                assigned: Cell::new(false),
                handle: RefCell::new(None),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn identifier(&self) -> &str {
        self.inner.func.identifier()
    }

    pub fn state(&self) -> TaskState {
        self.inner.state.get()
    }

    /// Whether this is an administrative call, exempt from capacity
    /// accounting.
    pub fn is_admin(&self) -> bool {
        protocol::is_admin_identifier(self.identifier())
    }

    /// Id the agent allocated for this call, once the handshake completed.
    pub fn remote_id(&self) -> Option<InvocationId> {
        self.inner.remote_id.get()
    }

    /// Address of the agent this task was assigned to.
    pub fn worker_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.worker_addr.get()
    }

    pub fn result(&self) -> Option<Result<Value, TaskError>> {
        self.inner.result.borrow().clone()
    }

    /// Hands this task to a worker and spawns its execute task. Must be
    /// called exactly once.
    pub fn assign_to(&self, worker: &Worker) {
        assert!(
            !self.inner.assigned.replace(true),
            "task {} assigned twice",
            self.inner.id
        );
        self.inner.worker_addr.set(Some(worker.agent_addr()));
        worker.add_task(self);
        let task = self.clone();
        let worker = worker.clone();
        let handle = tokio::task::spawn_local(execute(task, worker));
        *self.inner.handle.borrow_mut() = Some(handle);
    }

    /// Waits until the task reaches a terminal state, returning its result
    /// or re-raising its failure.
    pub async fn join(&self) -> Result<Value, TaskError> {
        loop {
            let notified = self.inner.done.notified();
            if self.state().is_terminal() {
                return self
                    .result()
                    .expect("terminal task should hold a result");
            }
            notified.await;
        }
    }

    /// Like `join`, but passes the result through its `Remotable::load`
    /// capability.
    pub async fn join_as<T: Remotable>(&self) -> Result<T, TaskError> {
        let value = self.join().await?;
        T::load(value).map_err(|e| TaskError::Protocol(format!("{:?}", e)))
    }

    /// Aborts the execute task. Joiners observe a transport failure.
    pub fn kill(&self) {
        if let Some(handle) = self.inner.handle.borrow_mut().take() {
            handle.abort();
        }
        if !self.state().is_terminal() {
            self.finish(Err(TaskError::Transport("task killed".to_string())));
        }
    }

    fn advance(&self, next: TaskState) {
        let current = self.inner.state.get();
        debug_assert!(next > current, "{:?} -> {:?}", current, next);
        self.inner.state.set(next);
    }

    fn finish(&self, result: Result<Value, TaskError>) {
        let next = if result.is_ok() {
            TaskState::Succeed
        } else {
            TaskState::Failed
        };
        self.advance(next);
        *self.inner.result.borrow_mut() = Some(result);
        self.inner.done.notify_waiters();
    }

    fn take_args(&self) -> CallArgs {
        self.inner
            .args
            .borrow_mut()
            .take()
            .expect("task arguments taken twice")
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[T{}/{:?}]<{}>",
            self.inner.id,
            self.state(),
            self.identifier()
        )
    }
}

async fn execute(task: Task, worker: Worker) {
    // admin tasks bypass the capacity permit
    let permit = if task.is_admin() {
        None
    } else {
        match worker.wait_until_idle().await {
            Ok(permit) => Some(permit),
            Err(e) => {
                warn!("[task] error acquiring permit: {:?}", e);
                task.finish(Err(TaskError::Transport(format!("{:?}", e))));
                worker.on_finish_task(&task);
                return;
            }
        }
    };
    task.advance(TaskState::Ready);

    let result = run_remote(&task, &worker).await;
    log!("[task] {:?} finished: {:?}", task, result);
    task.finish(result);
    worker.on_finish_task(&task);
    drop(permit);
}

async fn run_remote(task: &Task, worker: &Worker) -> Result<Value, TaskError> {
    let config = worker.config();
    let mut port = Port::connect(
        worker.agent_addr(),
        config.connect_retries(),
        config.connect_retry_interval(),
    )
    .await
    .map_err(transport)?;
    let result = exchange(task, worker, &mut port).await;
    port.close().await;
    result
}

async fn exchange(
    task: &Task,
    worker: &Worker,
    port: &mut Port,
) -> Result<Value, TaskError> {
    let config = worker.config();
    let remote_id = wait_for_server(
        port,
        config.handshake_retries(),
        config.handshake_retry_interval(),
    )
    .await?;
    task.inner.remote_id.set(Some(remote_id));
    task.advance(TaskState::Running);

    let CallArgs {
        positional,
        keyword,
    } = task.take_args();
    let kwargs = task
        .inner
        .func
        .bind(positional, keyword)
        .map_err(|e| TaskError::Protocol(format!("{:?}", e)))?;
    let request = Request::new(task.identifier(), kwargs);

    // once the request is out, failures are final: the call may have run
    port.send(&request).await.map_err(transport)?;
    match port.recv::<Reply>().await {
        Some(Reply::Return(value)) => Ok(value),
        Some(Reply::Failure(failure)) => Err(TaskError::Remote {
            exception: failure.exception,
            traceback: failure.traceback,
        }),
        None => Err(TaskError::Transport(
            "no response from function invocation".to_string(),
        )),
    }
}

/// Reads the handshake id, reconnecting a bounded number of times. Safe to
/// retry because no user code has run before the handshake.
async fn wait_for_server(
    port: &mut Port,
    retries: usize,
    interval: Duration,
) -> Result<InvocationId, TaskError> {
    let mut attempts = 0;
    loop {
        if let Some(id) = port.recv::<InvocationId>().await {
            return Ok(id);
        }
        if attempts == retries {
            return Err(TaskError::Transport(format!(
                "no handshake after {} attempts",
                retries + 1
            )));
        }
        attempts += 1;
        tokio::time::sleep(interval).await;
        port.reconnect().await.map_err(transport)?;
    }
}

fn transport(report: Report) -> TaskError {
    TaskError::Transport(format!("{:?}", report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqr_ref() -> FuncRef {
        FuncRef::new("tasks:sqr")
            .param("x")
            .param_with_default("offset", 0i64)
    }

    #[test]
    fn bind_fills_defaults() {
        let bound = sqr_ref().bind(vec![Value::Int(3)], Kwargs::new()).unwrap();
        assert_eq!(bound.get::<i64>("x").unwrap(), 3);
        assert_eq!(bound.get::<i64>("offset").unwrap(), 0);
    }

    #[test]
    fn bind_accepts_keywords() {
        let mut keyword = Kwargs::new();
        keyword.insert("offset", 5i64);
        let bound = sqr_ref().bind(vec![Value::Int(3)], keyword).unwrap();
        assert_eq!(bound.get::<i64>("offset").unwrap(), 5);
    }

    #[test]
    fn bind_rejects_bad_calls() {
        // too many positional
        assert!(sqr_ref()
            .bind(vec![Value::Int(1), Value::Int(2), Value::Int(3)], Kwargs::new())
            .is_err());
        // missing required
        assert!(sqr_ref().bind(vec![], Kwargs::new()).is_err());
        // duplicate
        let mut keyword = Kwargs::new();
        keyword.insert("x", 1i64);
        assert!(sqr_ref().bind(vec![Value::Int(1)], keyword).is_err());
        // unknown keyword
        let mut keyword = Kwargs::new();
        keyword.insert("nope", 1i64);
        assert!(sqr_ref().bind(vec![Value::Int(1)], keyword).is_err());
    }

    #[test]
    fn admin_identifier_detection() {
        let task = Task::new(FuncRef::new("_adm_cpu_count"), vec![]);
        assert!(task.is_admin());
        let task = Task::new(sqr_ref(), vec![Value::Int(1)]);
        assert!(!task.is_admin());
    }

    #[test]
    fn new_task_is_waiting() {
        let task = Task::new(sqr_ref(), vec![Value::Int(1)]);
        assert_eq!(task.state(), TaskState::Waiting);
        assert_eq!(task.result(), None);
        assert_eq!(task.remote_id(), None);
        assert_eq!(task.worker_addr(), None);
    }

    #[test]
    fn states_are_ordered_along_the_dag() {
        assert!(TaskState::Waiting < TaskState::Ready);
        assert!(TaskState::Ready < TaskState::Running);
        assert!(TaskState::Running < TaskState::Succeed);
        assert!(TaskState::Running < TaskState::Failed);
        assert!(TaskState::Succeed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn remote_error_exposes_traceback() {
        let error = TaskError::Remote {
            exception: "ValueError: boom".to_string(),
            traceback: "Traceback: ValueError: boom".to_string(),
        };
        assert!(error.traceback().unwrap().contains("ValueError: boom"));
        assert!(format!("{}", error).contains("ValueError: boom"));
        assert_eq!(TaskError::Transport("x".to_string()).traceback(), None);
    }
}
