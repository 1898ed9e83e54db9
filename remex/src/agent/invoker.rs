//! The isolation seam: how a non-admin call is executed.
//!
//! `ChildInvoker` is the production path: one child OS process per call,
//! spawned from a bootstrap command (`remex-agent child <path>`), fed the
//! request frame on stdin and draining the reply frame from stdout. Crash
//! containment and suspend/resume come from the process boundary.
//!
//! `LocalInvoker` runs the callable on the blocking pool instead. It keeps
//! the same contract without a separate binary, which is what the test
//! suites use.

use super::store::RegisteredFn;
use crate::protocol::{CaughtFailure, Reply, Request};
use crate::warn;
use color_eyre::eyre::{eyre, Report, WrapErr};
use futures::future::{FutureExt, LocalBoxFuture};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Handle to one in-flight call, addressable for suspend/resume and reaped
/// by the pool cleaner once the call has finished.
pub enum ProcessHandle {
    Child(Child),
    Local { finished: Arc<AtomicBool> },
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessHandle::Child(child) => child.id(),
            ProcessHandle::Local { .. } => None,
        }
    }

    pub fn is_alive(&mut self) -> bool {
        match self {
            ProcessHandle::Child(child) => {
                matches!(child.try_wait(), Ok(None))
            }
            ProcessHandle::Local { finished } => {
                !finished.load(Ordering::Acquire)
            }
        }
    }

    pub fn suspend(&mut self) {
        self.signal(Signal::Stop);
    }

    pub fn resume(&mut self) {
        self.signal(Signal::Cont);
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: Signal) {
        match self.pid() {
            Some(pid) => {
                let signal = match signal {
                    Signal::Stop => libc::SIGSTOP,
                    Signal::Cont => libc::SIGCONT,
                };
                // Safety: plain kill(2) on a pid we still own; the pool
                // cleaner only drops handles after exit, so the pid has not
                // been reused.
                let res = unsafe { libc::kill(pid as i32, signal) };
                if res != 0 {
                    warn!("[invoker] failed to signal pid {}", pid);
                }
            }
            None => warn!("[invoker] no process to signal"),
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _signal: Signal) {
        warn!("[invoker] suspend/resume is only supported on unix");
    }
}

enum Signal {
    Stop,
    Cont,
}

/// Executes one resolved call, turning panics and errors into the caught
/// failure sentinel. Runs on the agent's blocking pool or inside the child
/// bootstrap.
pub(crate) fn run_call(func: RegisteredFn, request: Request) -> Reply {
    let Request { identifier, kwargs } = request;
    let result =
        std::panic::catch_unwind(AssertUnwindSafe(|| func(kwargs)));
    match result {
        Ok(Ok(value)) => Reply::Return(value),
        Ok(Err(report)) => Reply::Failure(CaughtFailure {
            exception: format!("{}", report),
            traceback: format!("{:?}", report),
        }),
        Err(panic) => {
            let message = panic_message(&panic);
            Reply::Failure(CaughtFailure {
                exception: message.clone(),
                traceback: format!(
                    "panic while calling {}: {}",
                    identifier, message
                ),
            })
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// How a non-admin call is isolated and executed.
pub trait Invoker {
    /// Starts the call and returns its process handle together with the
    /// future resolving to the reply (`None` when the call died without
    /// producing one).
    fn invoke(
        &self,
        func: Option<RegisteredFn>,
        request: Request,
    ) -> Result<(ProcessHandle, LocalBoxFuture<'static, Option<Reply>>), Report>;
}

/// Runs calls on the blocking pool of the serving process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalInvoker;

impl Invoker for LocalInvoker {
    fn invoke(
        &self,
        func: Option<RegisteredFn>,
        request: Request,
    ) -> Result<(ProcessHandle, LocalBoxFuture<'static, Option<Reply>>), Report>
    {
        let func =
            func.ok_or_else(|| eyre!("local invoker needs a resolved callable"))?;
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let join = tokio::task::spawn_blocking(move || {
            let reply = run_call(func, request);
            flag.store(true, Ordering::Release);
            reply
        });
        let reply_fut = async move { join.await.ok() }.boxed_local();
        Ok((ProcessHandle::Local { finished }, reply_fut))
    }
}

/// Spawns one child OS process per call.
#[derive(Debug, Clone)]
pub struct ChildInvoker {
    program: PathBuf,
    args: Vec<String>,
}

impl ChildInvoker {
    /// `program args...` must start the child bootstrap: read one request
    /// frame from stdin, execute it, write one reply frame to stdout.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Bootstrap through the currently running binary.
    pub fn current_exe(args: Vec<String>) -> Result<Self, Report> {
        let program = std::env::current_exe()
            .wrap_err("current executable should be known")?;
        Ok(Self::new(program, args))
    }
}

impl Invoker for ChildInvoker {
    fn invoke(
        &self,
        _func: Option<RegisteredFn>,
        request: Request,
    ) -> Result<(ProcessHandle, LocalBoxFuture<'static, Option<Reply>>), Report>
    {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .wrap_err_with(|| {
                format!("failed to spawn child {:?}", self.program)
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| eyre!("child stdin should be piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("child stdout should be piped"))?;

        let reply_fut = async move {
            use futures::sink::SinkExt;
            use futures::stream::StreamExt;
            let mut writer =
                FramedWrite::new(stdin, crate::port::frame_codec());
            let bytes = match crate::port::serialize(&request) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("[invoker] error encoding request: {:?}", e);
                    return None;
                }
            };
            if let Err(e) = writer.send(bytes).await {
                warn!("[invoker] error writing request to child: {:?}", e);
                return None;
            }
            // closing stdin tells the child no further frames are coming
            drop(writer);

            let mut reader =
                FramedRead::new(stdout, crate::port::frame_codec());
            match reader.next().await {
                Some(Ok(frame)) => crate::port::deserialize::<Reply>(frame),
                Some(Err(e)) => {
                    warn!("[invoker] error reading reply from child: {:?}", e);
                    None
                }
                None => None,
            }
        }
        .boxed_local();

        Ok((ProcessHandle::Child(child), reply_fut))
    }
}

/// Child bootstrap: one request in, one reply out, exit.
pub async fn child_main<R>(mut resolver: R) -> Result<(), Report>
where
    R: super::store::Resolver,
{
    use futures::sink::SinkExt;
    use futures::stream::StreamExt;

    let mut reader =
        FramedRead::new(tokio::io::stdin(), crate::port::frame_codec());
    let request: Request = match reader.next().await {
        Some(Ok(frame)) => crate::port::deserialize(frame)
            .ok_or_else(|| eyre!("malformed request frame"))?,
        _ => return Err(eyre!("no request received on stdin")),
    };

    let reply = match resolver.resolve(&request.identifier) {
        Ok(func) => run_call(func, request),
        Err(e) => Reply::Failure(CaughtFailure {
            exception: format!("{}", e),
            traceback: format!("{:?}", e),
        }),
    };

    let mut writer =
        FramedWrite::new(tokio::io::stdout(), crate::port::frame_codec());
    let bytes = crate::port::serialize(&reply)?;
    writer
        .send(bytes)
        .await
        .wrap_err("error writing reply to stdout")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::store::{Resolver, StaticResolver};
    use crate::value::{Kwargs, Value};

    fn resolved(resolver: &mut StaticResolver, identifier: &str) -> RegisteredFn {
        resolver.resolve(identifier).unwrap()
    }

    #[test]
    fn run_call_returns_value() {
        let mut resolver = StaticResolver::default();
        resolver.register("tasks:sqr", |kwargs| {
            let x: i64 = kwargs.get("x")?;
            Ok(Value::Int(x * x))
        });
        let func = resolved(&mut resolver, "tasks:sqr");
        let mut kwargs = Kwargs::new();
        kwargs.insert("x", 7i64);
        let reply = run_call(func, Request::new("tasks:sqr", kwargs));
        assert_eq!(reply, Reply::Return(Value::Int(49)));
    }

    #[test]
    fn run_call_catches_errors() {
        let mut resolver = StaticResolver::default();
        resolver.register("tasks:bad", |_| {
            Err(eyre!("ValueError: boom"))
        });
        let func = resolved(&mut resolver, "tasks:bad");
        let reply = run_call(func, Request::new("tasks:bad", Kwargs::new()));
        match reply {
            Reply::Failure(failure) => {
                assert!(failure.exception.contains("ValueError: boom"));
                assert!(failure.traceback.contains("boom"));
            }
            Reply::Return(_) => panic!("call should have failed"),
        }
    }

    #[test]
    fn run_call_catches_panics() {
        let mut resolver = StaticResolver::default();
        resolver.register("tasks:explode", |_| panic!("blew up"));
        let func = resolved(&mut resolver, "tasks:explode");
        let reply =
            run_call(func, Request::new("tasks:explode", Kwargs::new()));
        match reply {
            Reply::Failure(failure) => {
                assert!(failure.exception.contains("blew up"));
                assert!(failure.traceback.contains("tasks:explode"));
            }
            Reply::Return(_) => panic!("call should have failed"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_invoker_tracks_the_child_process() {
        // a stand-in bootstrap that swallows the request and exits without
        // replying, like a crashed call
        let invoker = ChildInvoker::new("sh", vec![
            "-c".to_string(),
            "cat > /dev/null".to_string(),
        ]);
        let (mut handle, reply_fut) = invoker
            .invoke(None, Request::new("tasks:noop", Kwargs::new()))
            .unwrap();
        assert!(handle.pid().is_some());

        // no reply frame ever arrives
        assert_eq!(reply_fut.await, None);
        // give the child a moment to be reaped
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn local_invoker_reports_finish() {
        let mut resolver = StaticResolver::default();
        resolver.register("tasks:noop", |_| Ok(Value::Null));
        let func = resolved(&mut resolver, "tasks:noop");

        let (mut handle, reply_fut) = LocalInvoker
            .invoke(Some(func), Request::new("tasks:noop", Kwargs::new()))
            .unwrap();
        let reply = reply_fut.await;
        assert_eq!(reply, Some(Reply::Return(Value::Null)));
        assert!(!handle.is_alive());
        assert_eq!(handle.pid(), None);
    }
}
