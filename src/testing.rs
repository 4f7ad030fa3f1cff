//! Test harness.
//!
//! Runs a whole server on a dedicated runtime thread, bound to an
//! OS-assigned port, and reports readiness through a channel so tests can
//! connect the instant the listeners are up.
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::asgi::Application;
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::server::{Server, ServerHandle};

/// A server running in the background for the duration of a test.
pub struct TestServer {
    addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer").field("addr", &self.addr).finish()
    }
}

impl TestServer {
    /// Starts serving `app` with `config`. Without explicit endpoints the
    /// server binds an ephemeral localhost port.
    pub fn spawn(mut config: Config, app: Arc<dyn Application>) -> std::io::Result<TestServer> {
        if config.endpoints.is_empty() {
            config.endpoints.push(Endpoint::tcp("127.0.0.1", 0));
        }

        let server = Server::new(config, app)?;
        let handle = server.handle();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("daphne-test-server".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let (tx, rx) = oneshot::channel();
                    let run = tokio::spawn(server.run_with_ready(tx));
                    match rx.await {
                        Ok(addrs) => {
                            let _ = ready_tx.send(Ok(addrs));
                        }
                        Err(_) => {
                            // run() failed before signalling readiness
                            let err = match run.await {
                                Ok(Err(err)) => err,
                                _ => std::io::Error::other("server exited before readiness"),
                            };
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    }
                    let _ = run.await;
                });
            })?;

        let addrs = ready_rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| std::io::Error::other("server did not report readiness"))??;
        let addr = addrs
            .into_iter()
            .next()
            .ok_or_else(|| std::io::Error::other("no bound address reported"))?;

        Ok(TestServer {
            addr,
            handle,
            thread: Some(thread),
        })
    }

    /// Address of the first bound listener.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Shuts the server down and joins its thread.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
