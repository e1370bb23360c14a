//! Listener, connection plumbing and shutdown.
//!
//! [`Server::serve`] stops accepting on SIGTERM or Ctrl-C, waits for every
//! open connection to finish its in-flight requests, then returns. The chain
//! for each request runs on its own task.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::app::App;
use crate::dispatch::dispatch;
use crate::error::Error;
use crate::request::Request;
use crate::response::{error_response, Response};
use crate::tls;

enum Listen {
    Addr(String),
    Listener(TcpListener),
}

/// The HTTP server.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use braid::{App, Server};
///
/// # async fn run(app: App) -> Result<(), braid::Error> {
/// Server::bind("0.0.0.0:3000")
///     .request_timeout(Duration::from_secs(15))
///     .serve(app)
///     .await
/// # }
/// ```
pub struct Server {
    listen: Listen,
    request_timeout: Option<Duration>,
    max_body_size: usize,
    tls: Option<(PathBuf, PathBuf)>,
}

/// Default cap on a collected request body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

impl Server {
    /// Configures the server to bind to `addr` (`host:port`) when
    /// [`serve`](Server::serve) is called.
    pub fn bind(addr: impl Into<String>) -> Self {
        Self::new(Listen::Addr(addr.into()))
    }

    /// Serves on a listener that is already bound, e.g. to port `0`.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self::new(Listen::Listener(listener))
    }

    fn new(listen: Listen) -> Self {
        Self { listen, request_timeout: None, max_body_size: DEFAULT_MAX_BODY_SIZE, tls: None }
    }

    /// Answers `500` for requests whose chain has not finished after
    /// `timeout`. The chain itself keeps running until it notices the
    /// cancelled context.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Caps the request body, which is read in full before the chain runs.
    ///
    /// Larger bodies are answered with `413 Payload Too Large` without
    /// running any middleware. Defaults to [`DEFAULT_MAX_BODY_SIZE`].
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Terminates TLS with a PEM certificate chain and private key.
    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = Some((cert.into(), key.into()));
        self
    }

    /// Serves `app` until SIGTERM or Ctrl-C, then drains in-flight
    /// connections.
    pub async fn serve(self, app: App) -> Result<(), Error> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Serves `app` until `signal` resolves, then drains in-flight
    /// connections.
    pub async fn serve_with_shutdown(
        self,
        app: App,
        signal: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let acceptor = match &self.tls {
            Some((cert, key)) => Some(tls::acceptor(cert, key)?),
            None => None,
        };
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await?,
            Listen::Listener(listener) => listener,
        };

        let app = Arc::new(app);
        let limits = Limits { timeout: self.request_timeout, max_body_size: self.max_body_size };

        info!(addr = %listener.local_addr()?, tls = acceptor.is_some(), "braid listening");

        // Every connection task, so shutdown can wait for them.
        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Shutdown first, so a SIGTERM stops accepting even if more
                // connections are queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let acceptor = acceptor.clone();
                    tasks.spawn(async move {
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve_connection(stream, app, remote_addr, limits).await,
                                Err(e) => warn!(peer = %remote_addr, "tls handshake failed: {e}"),
                            },
                            None => serve_connection(stream, app, remote_addr, limits).await,
                        }
                    });
                }

                // Reap finished connections.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("braid stopped");
        Ok(())
    }
}

impl App {
    /// Serves the chain over plain HTTP on `addr`.
    ///
    /// Returns when the listener fails, or after a graceful shutdown.
    pub async fn run(self, addr: &str) -> Result<(), Error> {
        Server::bind(addr).serve(self).await
    }

    /// Serves the chain over HTTPS on `addr`.
    pub async fn run_tls(self, addr: &str, cert: &str, key: &str) -> Result<(), Error> {
        Server::bind(addr).tls(cert, key).serve(self).await
    }
}

// ── Connection & request plumbing ─────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Limits {
    timeout: Option<Duration>,
    max_body_size: usize,
}

async fn serve_connection<S>(stream: S, app: Arc<App>, remote_addr: SocketAddr, limits: Limits)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // `service_fn` is called once per request on the connection, not once per
    // connection.
    let svc = service_fn(move |req| {
        let app = Arc::clone(&app);
        async move { Ok::<_, Infallible>(accept_request(app, req, remote_addr, limits).await) }
    });

    // HTTP/1.1 or HTTP/2, whatever the client negotiates; upgrades enabled so
    // `Context::hijack` has something to hand out.
    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), svc)
        .await
    {
        error!(peer = %remote_addr, "connection error: {e}");
    }
}

async fn accept_request(
    app: Arc<App>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
    limits: Limits,
) -> Response {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, limits.max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(peer = %remote_addr, limit = limits.max_body_size, "request body too large");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE);
        }
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            return error_response(StatusCode::BAD_REQUEST);
        }
    };

    let request = Request::from_parts(parts, body).with_remote_addr(remote_addr);
    dispatch(app, request, limits.timeout).await
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** and **SIGINT** (Ctrl-C).
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}
