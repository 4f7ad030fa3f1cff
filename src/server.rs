//! Server core.
//!
//! Owns the read-only configuration, the application, the active-connections
//! table and the lifecycle/shutdown signals. Protocol drivers receive a
//! [`Conn`] carrying their identity and a handle back to this state.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

use crate::access::AccessLog;
use crate::asgi::{Application, BoxError};
use crate::config::Config;
use crate::listener;

/// Lifecycle signal published by [`Server`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Started,
    Stopped,
}

/// The protocol server.
pub struct Server {
    state: Arc<ServerState>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Builds a server from configuration and an application.
    pub fn new(config: Config, app: Arc<dyn Application>) -> std::io::Result<Self> {
        let access = AccessLog::from_config(&config.access_log)?;
        let permits = config
            .max_connections
            .map(|cap| Arc::new(Semaphore::new(cap)));
        let (shutdown, _) = watch::channel(false);
        let (lifecycle, _) = watch::channel(Lifecycle::Idle);

        Ok(Self {
            state: Arc::new(ServerState {
                config,
                app,
                access,
                permits,
                connections: Mutex::new(ConnTable::default()),
                next_id: AtomicU64::new(1),
                shutdown,
                lifecycle,
            }),
        })
    }

    /// Handle for observing lifecycle signals and requesting shutdown.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle { state: Arc::clone(&self.state) }
    }

    /// Binds all endpoints and serves until shutdown is requested (or the
    /// process receives ctrl-c), then drains gracefully.
    pub async fn run(self) -> std::io::Result<()> {
        self.run_inner(None).await
    }

    /// [`run`](Self::run), reporting the bound addresses once all listeners
    /// are ready. Used by the test harness.
    pub async fn run_with_ready(
        self,
        ready: oneshot::Sender<Vec<SocketAddr>>,
    ) -> std::io::Result<()> {
        self.run_inner(Some(ready)).await
    }

    async fn run_inner(
        self,
        ready: Option<oneshot::Sender<Vec<SocketAddr>>>,
    ) -> std::io::Result<()> {
        let state = self.state;

        let bound = listener::bind_all(&state.config.endpoints).await?;
        let addrs = bound
            .iter()
            .filter_map(|listener| listener.local_addr())
            .collect::<Vec<_>>();
        for listener in &bound {
            log::info!("listening on {}", listener.describe());
        }

        let mut accept_tasks = Vec::with_capacity(bound.len());
        for listener in bound {
            accept_tasks.push(tokio::spawn(listener::accept_loop(
                listener,
                Arc::clone(&state),
            )));
        }

        state.lifecycle.send_replace(Lifecycle::Started);
        if let Some(ready) = ready {
            let _ = ready.send(addrs);
        }

        let mut shutdown = state.shutdown.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupt received, shutting down");
                let _ = state.shutdown.send(true);
            }
            _ = shutdown.changed() => {}
        }

        for task in &accept_tasks {
            task.abort();
        }
        state.drain(state.config.shutdown_grace).await;
        state.lifecycle.send_replace(Lifecycle::Stopped);
        log::info!("server stopped");
        Ok(())
    }
}

/// Cloneable observer/controller handle.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle").finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Requests a graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.state.shutdown.send(true);
    }

    /// Subscribes to lifecycle signals.
    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.state.lifecycle.subscribe()
    }

    /// Waits for the `server-stopped` signal.
    pub async fn stopped(&self) {
        let mut lifecycle = self.state.lifecycle.subscribe();
        while *lifecycle.borrow_and_update() != Lifecycle::Stopped {
            if lifecycle.changed().await.is_err() {
                return;
            }
        }
    }
}

// ===== Shared state =====

pub(crate) struct ServerState {
    pub(crate) config: Config,
    pub(crate) app: Arc<dyn Application>,
    pub(crate) access: Option<AccessLog>,
    /// Connection cap permits, `None` when unlimited.
    pub(crate) permits: Option<Arc<Semaphore>>,
    connections: Mutex<ConnTable>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    lifecycle: watch::Sender<Lifecycle>,
}

#[derive(Default)]
struct ConnTable {
    active: HashMap<u64, AbortHandle>,
    /// Tasks that finished before their registration landed.
    finished_early: HashSet<u64>,
}

impl ServerState {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Records a connection task. Every accepted connection is either in
    /// this table or already fully torn down.
    pub(crate) fn register(&self, id: u64, abort: AbortHandle) {
        let mut table = self.connections.lock().unwrap();
        if !table.finished_early.remove(&id) {
            table.active.insert(id, abort);
        }
    }

    pub(crate) fn deregister(&self, id: u64) {
        let mut table = self.connections.lock().unwrap();
        if table.active.remove(&id).is_none() {
            table.finished_early.insert(id);
        }
    }

    fn active_count(&self) -> usize {
        self.connections.lock().unwrap().active.len()
    }

    /// Waits up to `grace` for connections to finish, then aborts the rest.
    async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let table = std::mem::take(&mut *self.connections.lock().unwrap());
        if !table.active.is_empty() {
            log::warn!(
                "aborting {} connection(s) still open after shutdown grace",
                table.active.len(),
            );
        }
        for (_, abort) in table.active {
            abort.abort();
        }
    }
}

// ===== Per-connection context =====

/// Identity and shared-state handle given to a protocol driver.
pub(crate) struct Conn {
    pub(crate) id: u64,
    pub(crate) client: Option<(String, u16)>,
    pub(crate) server: Option<(String, u16)>,
    pub(crate) tls: bool,
    pub(crate) state: Arc<ServerState>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Conn {
    pub(crate) fn config(&self) -> &Config {
        &self.state.config
    }

    pub(crate) fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

// ===== Application task reaping =====

/// Collects an application task in the background: waits out the close
/// timeout, then aborts. Errors and panics are logged with the connection
/// id; the connection itself already moved on.
pub(crate) fn reap_app(
    mut task: JoinHandle<Result<(), BoxError>>,
    grace: Duration,
    conn_id: u64,
) {
    tokio::spawn(async move {
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                log::error!("connection {conn_id}: application error: {err}");
            }
            Ok(Err(join)) if join.is_panic() => {
                log::error!("connection {conn_id}: application panicked: {join}");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                task.abort();
                log::warn!(
                    "connection {conn_id}: application task aborted after close timeout",
                );
            }
        }
    });
}

/// Awaits an application task that should already be finishing, returning
/// its outcome. Aborts and reports after `grace`.
pub(crate) async fn join_app(
    mut task: JoinHandle<Result<(), BoxError>>,
    grace: Duration,
) -> Result<(), BoxError> {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(join.into()),
        Err(_) => {
            task.abort();
            Err("application task did not finish within close timeout".into())
        }
    }
}
