//! Listener set.
//!
//! Binds endpoint descriptors, accepts transports and hands each one to
//! the right protocol driver: ALPN picks h2 on TLS listeners, plaintext
//! connections start in the HTTP/1.1 driver which detects the h2 preface
//! and WebSocket upgrades itself.
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

#[cfg(unix)]
use tokio::net::UnixListener;

use crate::endpoint::Endpoint;
use crate::server::{Conn, ServerState};
use crate::{h1, h2, tls};

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// One bound endpoint, accepting transports.
pub(crate) struct Bound {
    acceptor: Acceptor,
    tls: Option<TlsAcceptor>,
    describe: String,
}

impl Bound {
    pub(crate) fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.acceptor {
            Acceptor::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Acceptor::Unix(_) => None,
        }
    }

    pub(crate) fn describe(&self) -> &str {
        &self.describe
    }
}

/// Binds every configured endpoint. Failure of any single bind fails
/// startup as a whole.
pub(crate) async fn bind_all(endpoints: &[Endpoint]) -> io::Result<Vec<Bound>> {
    if endpoints.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no endpoints configured",
        ));
    }

    let mut bound = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        bound.push(bind(endpoint).await?);
    }
    Ok(bound)
}

async fn bind(endpoint: &Endpoint) -> io::Result<Bound> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port)).await?;
            let describe = listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| format!("{host}:{port}"));
            Ok(Bound {
                acceptor: Acceptor::Tcp(listener),
                tls: None,
                describe,
            })
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let listener = UnixListener::bind(path)?;
            Ok(Bound {
                acceptor: Acceptor::Unix(listener),
                tls: None,
                describe: path.display().to_string(),
            })
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )),
        #[cfg(unix)]
        Endpoint::Fd { fd } => {
            use std::os::fd::FromRawFd;
            // SAFETY: the descriptor is handed to us by the supervisor for
            // exclusive use as a listening TCP socket
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(*fd) };
            std_listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(std_listener)?;
            Ok(Bound {
                acceptor: Acceptor::Tcp(listener),
                tls: None,
                describe: format!("fd {fd}"),
            })
        }
        #[cfg(not(unix))]
        Endpoint::Fd { .. } => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "inherited descriptors are not available on this platform",
        )),
        Endpoint::Tls { inner, tls: settings } => {
            let mut bound = Box::pin(bind(inner)).await?;
            if bound.tls.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "nested tls endpoints",
                ));
            }
            bound.tls = Some(tls::build_acceptor(settings)?);
            bound.describe = format!("{} (tls)", bound.describe);
            Ok(bound)
        }
    }
}

/// Accepts until the task is aborted at shutdown.
pub(crate) async fn accept_loop(bound: Bound, state: Arc<ServerState>) {
    loop {
        match &bound.acceptor {
            Acceptor::Tcp(listener) => match listener.accept().await {
                Ok((stream, peer)) => {
                    let client = Some((peer.ip().to_string(), peer.port()));
                    let server = stream
                        .local_addr()
                        .ok()
                        .map(|addr| (addr.ip().to_string(), addr.port()));
                    let _ = stream.set_nodelay(true);
                    dispatch(stream, client, server, bound.tls.clone(), &state);
                }
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            #[cfg(unix)]
            Acceptor::Unix(listener) => match listener.accept().await {
                Ok((stream, _)) => {
                    dispatch(stream, None, None, bound.tls.clone(), &state);
                }
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

fn dispatch<IO>(
    io: IO,
    client: Option<(String, u16)>,
    server: Option<(String, u16)>,
    tls: Option<TlsAcceptor>,
    state: &Arc<ServerState>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // global concurrency cap: excess connections get an immediate 503
    let permit = match &state.permits {
        Some(permits) => match Arc::clone(permits).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                log::warn!("connection limit reached, rejecting");
                tokio::spawn(reject_overloaded(io, tls.is_some()));
                return;
            }
        },
        None => None,
    };

    let id = state.next_id();
    let conn = Conn {
        id,
        client,
        server,
        tls: tls.is_some(),
        state: Arc::clone(state),
        shutdown: state.shutdown_signal(),
    };
    log::debug!("connection {id} accepted");

    let task_state = Arc::clone(state);
    let task = tokio::spawn(async move {
        serve_connection(io, tls, conn).await;
        task_state.deregister(id);
        drop(permit);
        log::debug!("connection {id} closed");
    });
    state.register(id, task.abort_handle());
}

async fn serve_connection<IO>(io: IO, tls: Option<TlsAcceptor>, conn: Conn)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tls {
        Some(acceptor) => {
            let handshake_deadline =
                tokio::time::Instant::now() + conn.config().connect_timeout;
            let stream = match tokio::time::timeout_at(handshake_deadline, acceptor.accept(io))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    log::info!("connection {}: tls handshake failed: {err}", conn.id);
                    return;
                }
                Err(_) => {
                    log::info!("connection {}: tls handshake timed out", conn.id);
                    return;
                }
            };
            let is_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2");
            if is_h2 {
                h2::serve(stream, conn).await;
            } else {
                h1::serve(stream, conn).await;
            }
        }
        None => h1::serve(io, conn).await,
    }
}

async fn reject_overloaded<IO>(mut io: IO, is_tls: bool)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if !is_tls {
        let _ = io
            .write_all(
                b"HTTP/1.1 503 Service Unavailable\r\nretry-after: 1\r\n\
                  content-length: 0\r\nconnection: close\r\n\r\n",
            )
            .await;
    }
    let _ = io.shutdown().await;
}
