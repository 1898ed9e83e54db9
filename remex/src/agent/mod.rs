// This module contains the closed set of admin operations.
pub mod admin;

// This module contains resolution of identifiers from loadable modules.
pub mod dynamic;

// This module contains the isolation seam for non-admin calls.
pub mod invoker;

// This module contains the function store and the `Resolver` seam.
pub mod store;

// Re-exports.
pub use admin::AdminOp;
pub use dynamic::DynamicResolver;
pub use invoker::{child_main, ChildInvoker, Invoker, LocalInvoker, ProcessHandle};
pub use store::{FunctionStore, RegisteredFn, Resolver, StaticResolver};

use crate::config::Config;
use crate::port::{Listener, Port};
use crate::protocol::{CaughtFailure, InvocationId, Reply, Request};
use crate::value::Value;
use crate::HashMap;
use crate::{info, log, warn};
use color_eyre::eyre::{eyre, Report};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

type ProcessTable = Rc<RefCell<HashMap<InvocationId, ProcessHandle>>>;

/// The per-host server: accepts one connection per call, hands each
/// non-admin call to its invoker and answers admin calls inline.
///
/// Must be served from inside a `tokio::task::LocalSet`.
pub struct Agent<R> {
    resolver: R,
    invoker: Box<dyn Invoker>,
    config: Config,
}

/// Agent resolving identifiers from loadable modules under a root path.
pub type DynamicAgent = Agent<DynamicResolver>;

impl<R> Agent<R>
where
    R: Resolver + 'static,
{
    pub fn new(resolver: R, invoker: Box<dyn Invoker>, config: Config) -> Self {
        Self {
            resolver,
            invoker,
            config,
        }
    }

    /// Binds on `port` and serves until the task is aborted.
    pub async fn run(self, port: u16) -> Result<(), Report> {
        let listener = Listener::bind(port).await?;
        info!("[agent] started on {:?}", listener.local_addr());
        self.serve(listener).await
    }

    /// Serve loop: accept, handshake, dispatch.
    pub async fn serve(self, listener: Listener) -> Result<(), Report> {
        let Agent {
            resolver,
            invoker,
            config,
        } = self;
        let resolver = Rc::new(RefCell::new(resolver));
        let invoker: Rc<dyn Invoker> = Rc::from(invoker);
        let processes: ProcessTable = Rc::new(RefCell::new(HashMap::new()));

        tokio::task::spawn_local(pool_cleaner(
            processes.clone(),
            config.process_clean_interval(),
        ));

        loop {
            let port = listener.accept().await?;
            tokio::task::spawn_local(handle_request(
                resolver.clone(),
                invoker.clone(),
                processes.clone(),
                port,
            ));
        }
    }
}

/// Periodically drops process handles whose call has finished. Children are
/// never killed here; only stale uuid references are collected.
async fn pool_cleaner(processes: ProcessTable, interval: std::time::Duration) {
    let mut interval = tokio::time::interval(interval);
    loop {
        interval.tick().await;
        processes
            .borrow_mut()
            .retain(|_, handle| handle.is_alive());
        info!(
            "[agent] cleaner: remaining {} tasks",
            processes.borrow().len()
        );
    }
}

async fn handle_request<R>(
    resolver: Rc<RefCell<R>>,
    invoker: Rc<dyn Invoker>,
    processes: ProcessTable,
    mut port: Port,
) where
    R: Resolver,
{
    let peer = port.peer_addr();
    log!("[agent] request from {}", peer);

    let id = InvocationId::fresh();
    if let Err(e) = port.send(&id).await {
        warn!("[agent] error sending handshake: {:?}", e);
        return;
    }

    let request: Request = match port.recv().await {
        Some(request) => request,
        None => {
            warn!("[agent] cannot receive request from {}", peer);
            return;
        }
    };
    info!("[agent] call {} as {}", request.identifier, id);

    let reply = if request.is_admin() {
        Some(handle_admin(&resolver, &processes, peer, &request).await)
    } else {
        let identifier = request.identifier.clone();
        let resolved = resolver.borrow_mut().resolve(&identifier);
        match resolved {
            Err(e) => {
                warn!("[agent] cannot resolve {}: {:?}", identifier, e);
                Some(failure_reply(e))
            }
            Ok(func) => match invoker.invoke(Some(func), request) {
                Err(e) => {
                    warn!("[agent] cannot invoke {}: {:?}", identifier, e);
                    Some(failure_reply(e))
                }
                Ok((handle, reply_fut)) => {
                    processes.borrow_mut().insert(id, handle);
                    reply_fut.await
                }
            },
        }
    };

    match reply {
        Some(reply) => {
            log!("[agent] result for {}: {:?}", id, reply);
            if let Err(e) = port.send(&reply).await {
                warn!("[agent] error sending reply for {}: {:?}", id, e);
            }
        }
        // the call died without producing a reply; closing the port lets
        // the client observe EOF and fail the task
        None => warn!("[agent] call {} produced no reply", id),
    }
    port.close().await;
}

async fn handle_admin<R>(
    resolver: &Rc<RefCell<R>>,
    processes: &ProcessTable,
    peer: SocketAddr,
    request: &Request,
) -> Reply
where
    R: Resolver,
{
    match admin_call(resolver, processes, peer, request).await {
        Ok(value) => Reply::Return(value),
        Err(e) => {
            warn!("[agent] admin {} failed: {:?}", request.identifier, e);
            failure_reply(e)
        }
    }
}

async fn admin_call<R>(
    resolver: &Rc<RefCell<R>>,
    processes: &ProcessTable,
    peer: SocketAddr,
    request: &Request,
) -> Result<Value, Report>
where
    R: Resolver,
{
    let op = AdminOp::parse(&request.identifier).ok_or_else(|| {
        eyre!("unknown admin identifier: {}", request.identifier)
    })?;
    match op {
        AdminOp::Hello => {
            Ok(Value::Str(format!("Hello, {}:{}!", peer.ip(), peer.port())))
        }
        AdminOp::CpuCount => Ok(Value::Int(num_cpus::get() as i64)),
        AdminOp::List => {
            let mut identifiers: Vec<Value> = AdminOp::ALL
                .iter()
                .map(|op| Value::Str(op.identifier().to_string()))
                .collect();
            identifiers.extend(
                resolver
                    .borrow()
                    .identifiers()
                    .into_iter()
                    .map(Value::Str),
            );
            Ok(Value::List(identifiers))
        }
        AdminOp::Suspend => {
            let raw: i64 = request.kwargs.get("uuid")?;
            if let Some(handle) =
                processes.borrow_mut().get_mut(&InvocationId::from(raw))
            {
                handle.suspend();
            }
            Ok(Value::Bool(true))
        }
        AdminOp::Resume => {
            let raw: i64 = request.kwargs.get("uuid")?;
            if let Some(handle) =
                processes.borrow_mut().get_mut(&InvocationId::from(raw))
            {
                handle.resume();
            }
            Ok(Value::Bool(true))
        }
        AdminOp::DirSignature => {
            let root = agent_root(resolver)?;
            let subpath: String = request.kwargs.get("subpath")?;
            let is_dir: bool = request.kwargs.get("is_dir")?;
            let sig = crate::rdiff::dir_sig(&root.join(&subpath), is_dir).await?;
            Ok(Value::Bytes(sig))
        }
        AdminOp::DirPatch => {
            let root = agent_root(resolver)?;
            let delta: Vec<u8> = request.kwargs.get("delta")?;
            let subpath: String = request.kwargs.get("subpath")?;
            crate::rdiff::dir_patch(&root.join(&subpath), &delta).await?;
            Ok(Value::Bool(true))
        }
        AdminOp::CleanCache => {
            resolver.borrow_mut().clean_cache()?;
            Ok(Value::Bool(true))
        }
    }
}

fn agent_root<R>(
    resolver: &Rc<RefCell<R>>,
) -> Result<std::path::PathBuf, Report>
where
    R: Resolver,
{
    resolver
        .borrow()
        .root_path()
        .map(|path| path.to_path_buf())
        .ok_or_else(|| eyre!("agent has no root directory"))
}

fn failure_reply(report: Report) -> Reply {
    Reply::Failure(CaughtFailure {
        exception: format!("{}", report),
        traceback: format!("{:?}", report),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Kwargs;
    use std::time::Duration;

    fn test_resolver() -> StaticResolver {
        let mut resolver = StaticResolver::default();
        resolver.register("tasks:identity", |kwargs| kwargs.get("x"));
        resolver
    }

    async fn start_agent(resolver: StaticResolver) -> SocketAddr {
        let listener = Listener::bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let agent =
            Agent::new(resolver, Box::new(LocalInvoker), Config::new());
        tokio::task::spawn_local(async move {
            let _ = agent.serve(listener).await;
        });
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    }

    async fn call(addr: SocketAddr, request: Request) -> Reply {
        let mut port =
            Port::connect(addr, 3, Duration::from_millis(50)).await.unwrap();
        let _handshake: InvocationId = port.recv().await.unwrap();
        port.send(&request).await.unwrap();
        port.recv::<Reply>().await.unwrap()
    }

    #[tokio::test]
    async fn serves_registered_function() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let addr = start_agent(test_resolver()).await;
                let mut kwargs = Kwargs::new();
                kwargs.insert("x", 42i64);
                let reply =
                    call(addr, Request::new("tasks:identity", kwargs)).await;
                assert_eq!(reply, Reply::Return(Value::Int(42)));
            })
            .await;
    }

    #[tokio::test]
    async fn unknown_identifier_is_a_caught_failure() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let addr = start_agent(test_resolver()).await;
                let reply =
                    call(addr, Request::new("tasks:missing", Kwargs::new()))
                        .await;
                match reply {
                    Reply::Failure(failure) => {
                        assert!(failure.exception.contains("tasks:missing"))
                    }
                    Reply::Return(_) => panic!("call should have failed"),
                }
            })
            .await;
    }

    #[tokio::test]
    async fn admin_hello_and_list() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let addr = start_agent(test_resolver()).await;

                let reply =
                    call(addr, Request::new("_adm_hello", Kwargs::new())).await;
                match reply {
                    Reply::Return(Value::Str(greeting)) => {
                        assert!(greeting.starts_with("Hello, 127.0.0.1:"));
                        assert!(greeting.ends_with('!'));
                    }
                    other => panic!("unexpected reply: {:?}", other),
                }

                let reply =
                    call(addr, Request::new("_adm_list", Kwargs::new())).await;
                match reply {
                    Reply::Return(Value::List(identifiers)) => {
                        let has = |name: &str| {
                            identifiers
                                .iter()
                                .any(|id| *id == Value::Str(name.to_string()))
                        };
                        assert!(has("_adm_hello"));
                        assert!(has("_adm_cpu_count"));
                        assert!(has("_adm_suspend"));
                        assert!(has("tasks:identity"));
                    }
                    other => panic!("unexpected reply: {:?}", other),
                }
            })
            .await;
    }

    #[tokio::test]
    async fn admin_cpu_count_is_positive() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let addr = start_agent(test_resolver()).await;
                let reply =
                    call(addr, Request::new("_adm_cpu_count", Kwargs::new()))
                        .await;
                match reply {
                    Reply::Return(Value::Int(count)) => assert!(count > 0),
                    other => panic!("unexpected reply: {:?}", other),
                }
            })
            .await;
    }
}
