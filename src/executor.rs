//! Execution strategies
//!
//! One contract, four ways to run a worker: cooperative tasks on the shared
//! scheduler (default), dedicated OS threads for blocking client libraries,
//! OS processes for CPU-bound transforms needing true parallelism, and a
//! single in-context worker for debugging.
//!
//! The worker *loop* always runs as an async future. `Threaded` drives that
//! future to completion on its own OS thread; `MultiProcess` keeps the loop
//! in the parent as a pump and ships each `process` call to a child running
//! this binary in `worker` mode.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::config::Item;
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::host::{HostBehaviour, HostContext, ProcessOutcome};
use crate::ipc;
use crate::domain::ExecutionMode;

/// Opaque handle to one running worker.
pub enum WorkerHandle {
    Task(tokio::task::JoinHandle<()>),
    Thread(Option<std::thread::JoinHandle<()>>),
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task(_) => f.write_str("WorkerHandle::Task"),
            Self::Thread(_) => f.write_str("WorkerHandle::Thread"),
        }
    }
}

impl WorkerHandle {
    #[must_use]
    pub fn task(handle: tokio::task::JoinHandle<()>) -> Self {
        Self::Task(handle)
    }
}

/// Builds the per-worker behaviour set for a pool.
///
/// Shared-memory strategies reuse the one behaviour instance; the process
/// strategy spawns one child per worker and wraps the behaviour in a proxy
/// whose `process` crosses the boundary.
pub async fn worker_behaviours(
    mode: ExecutionMode,
    pool_size: usize,
    item: &Item,
    behaviour: Arc<dyn HostBehaviour>,
) -> Result<Vec<Arc<dyn HostBehaviour>>> {
    match mode {
        ExecutionMode::Single => Ok(vec![behaviour]),
        ExecutionMode::Cooperative | ExecutionMode::Threaded => {
            Ok((0..pool_size).map(|_| Arc::clone(&behaviour)).collect())
        }
        ExecutionMode::MultiProcess => {
            // More worker processes than cores buys nothing for CPU-bound
            // transforms.
            let pool_size = pool_size.min(num_cpus::get().max(1));
            let mut behaviours: Vec<Arc<dyn HostBehaviour>> = Vec::with_capacity(pool_size);
            for worker_id in 0..pool_size {
                let worker = ProcessWorker::spawn(item).await?;
                debug!(item = %item.name, worker_id, "process worker spawned");
                behaviours.push(Arc::new(ProcessProxyBehaviour {
                    inner: Arc::clone(&behaviour),
                    worker,
                }));
            }
            Ok(behaviours)
        }
    }
}

/// Starts `count` workers under the given strategy. The factory is invoked
/// once per worker index to produce its loop future.
pub fn start_workers<F>(mode: ExecutionMode, count: usize, factory: F) -> Result<Vec<WorkerHandle>>
where
    F: Fn(usize) -> BoxFuture<'static, ()>,
{
    let count = match mode {
        ExecutionMode::Single => 1,
        _ => count.max(1),
    };

    let mut handles = Vec::with_capacity(count);
    match mode {
        ExecutionMode::Cooperative | ExecutionMode::MultiProcess | ExecutionMode::Single => {
            for worker_id in 0..count {
                handles.push(WorkerHandle::Task(tokio::spawn(factory(worker_id))));
            }
        }
        ExecutionMode::Threaded => {
            let runtime = tokio::runtime::Handle::current();
            for worker_id in 0..count {
                let fut = factory(worker_id);
                let runtime = runtime.clone();
                let thread = std::thread::Builder::new()
                    .name(format!("hermes-worker-{worker_id}"))
                    .spawn(move || runtime.block_on(fut))
                    .map_err(|e| EngineError::internal(format!("spawn worker thread: {e}")))?;
                handles.push(WorkerHandle::Thread(Some(thread)));
            }
        }
    }
    Ok(handles)
}

/// Waits up to `timeout` for workers to finish (their cancellation tokens
/// must already be cancelled). Anything still alive afterwards is
/// force-terminated or detached, and the fact recorded.
pub async fn stop_workers(handles: Vec<WorkerHandle>, timeout: Duration) {
    for handle in handles {
        match handle {
            WorkerHandle::Task(task) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(join_err)) => {
                        if join_err.is_panic() {
                            warn!("worker task panicked during shutdown");
                        }
                    }
                    Err(_elapsed) => {
                        // In-flight state stays in the WAL and replays.
                        warn!("worker task exceeded stop timeout; aborting");
                        abort.abort();
                    }
                }
            }
            WorkerHandle::Thread(thread) => {
                if let Some(thread) = thread {
                    let join = tokio::task::spawn_blocking(move || {
                        let _ = thread.join();
                    });
                    if tokio::time::timeout(timeout, join).await.is_err() {
                        warn!("worker thread exceeded stop timeout; detaching");
                    }
                }
            }
        }
    }
}

struct ProcessIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Parent-side handle to one child worker process.
pub struct ProcessWorker {
    io: tokio::sync::Mutex<ProcessIo>,
    child: tokio::sync::Mutex<Child>,
}

impl std::fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorker").finish_non_exhaustive()
    }
}

impl ProcessWorker {
    /// Spawns this binary in `worker` mode with the item document.
    pub async fn spawn(item: &Item) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| EngineError::internal(format!("resolve current exe: {e}")))?;
        let item_json = serde_json::to_string(item)?;

        let mut child = Command::new(exe)
            .arg("worker")
            .arg("--item")
            .arg(item_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::internal(format!("spawn process worker: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::internal("process worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::internal("process worker stdout unavailable"))?;

        Ok(Self {
            io: tokio::sync::Mutex::new(ProcessIo {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: tokio::sync::Mutex::new(child),
        })
    }

    /// One request/response exchange. Calls are serialised per worker; the
    /// queue provides the concurrency.
    pub async fn call(&self, envelope: &Envelope) -> Result<ProcessOutcome> {
        let body = serde_json::to_vec(envelope)?;
        let mut io = self.io.lock().await;
        ipc::write_frame(&mut io.stdin, ipc::FRAME_ENVELOPE, &body).await?;
        match ipc::read_frame(&mut io.stdout).await? {
            Some((frame_type, payload)) => ipc::decode_worker_reply(frame_type, &payload),
            None => Err(EngineError::internal("process worker exited mid-call")),
        }
    }

    /// Orderly shutdown; falls back to SIGKILL after the grace period.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut io = self.io.lock().await;
            let _ = ipc::write_frame(&mut io.stdin, ipc::FRAME_SHUTDOWN, &[]).await;
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {}
            Err(_elapsed) => {
                warn!("process worker ignored shutdown; killing");
                let _ = child.start_kill();
            }
        }
    }
}

/// Behaviour proxy for process workers: hooks run in the parent against the
/// locally constructed behaviour, `process` crosses to the child.
pub struct ProcessProxyBehaviour {
    inner: Arc<dyn HostBehaviour>,
    worker: ProcessWorker,
}

impl std::fmt::Debug for ProcessProxyBehaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProxyBehaviour").finish_non_exhaustive()
    }
}

#[async_trait]
impl HostBehaviour for ProcessProxyBehaviour {
    async fn on_init(&self, ctx: &HostContext) -> Result<()> {
        self.inner.on_init(ctx).await
    }

    async fn on_start(&self, ctx: &HostContext) -> Result<()> {
        self.inner.on_start(ctx).await
    }

    async fn on_stop(&self, ctx: &HostContext) -> Result<()> {
        self.worker.shutdown(Duration::from_secs(5)).await;
        self.inner.on_stop(ctx).await
    }

    async fn on_teardown(&self, ctx: &HostContext) -> Result<()> {
        self.inner.on_teardown(ctx).await
    }

    async fn on_before_process(&self, envelope: Envelope) -> Result<Envelope> {
        self.inner.on_before_process(envelope).await
    }

    async fn process(&self, envelope: Envelope) -> Result<ProcessOutcome> {
        self.worker.call(&envelope).await
    }

    async fn on_after_process(
        &self,
        envelope: &Envelope,
        outcome: ProcessOutcome,
    ) -> Result<ProcessOutcome> {
        self.inner.on_after_process(envelope, outcome).await
    }

    async fn on_process_error(
        &self,
        envelope: &Envelope,
        err: &EngineError,
    ) -> Option<ProcessOutcome> {
        self.inner.on_process_error(envelope, err).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test_log::test(tokio::test)]
    async fn cooperative_workers_run_their_futures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handles = start_workers(ExecutionMode::Cooperative, 3, |_id| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();
        assert_eq!(handles.len(), 3);
        stop_workers(handles, Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn threaded_workers_run_on_their_own_threads() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handles = start_workers(ExecutionMode::Threaded, 2, |_id| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                assert!(
                    std::thread::current()
                        .name()
                        .is_some_and(|n| n.starts_with("hermes-worker-"))
                );
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();
        stop_workers(handles, Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test)]
    async fn single_mode_runs_exactly_one_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handles = start_workers(ExecutionMode::Single, 8, |_id| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();
        assert_eq!(handles.len(), 1);
        stop_workers(handles, Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
