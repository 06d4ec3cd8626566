//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`. No new connections are made.
//! 2. Draining the router's [`FiberSet`](crate::FiberSet): in-flight requests
//!    get the drain timeout to finish, then the stragglers are interrupted.
//!    An interrupted request still waits for its business function and then
//!    answers `503`. Readiness reports `503` from here on.
//! 3. Waiting for connection tasks to wind down, then returning from
//!    [`Server::serve`], which lets `main` exit cleanly.
//!
//! Keep the drain timeout below `terminationGracePeriodSeconds`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::context::RequestSettings;
use crate::error::Error;
use crate::method::Method;
use crate::request::RawRequest;
use crate::response::Response;
use crate::router::{Lookup, Router};

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
    settings: RequestSettings,
    drain_timeout: Duration,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string. Use
    /// [`from_config`](Server::from_config) to get an error instead.
    ///
    /// ```rust,no_run
    /// use sluice::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self::at(addr)
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, Error> {
        let mut server = Self::at(config.socket_addr()?).drain_timeout(config.drain_timeout());
        server.settings = config.request_settings();
        Ok(server)
    }

    fn at(addr: SocketAddr) -> Self {
        Self { addr, settings: RequestSettings::default(), drain_timeout: Duration::from_secs(30) }
    }

    /// Log full request and response snapshots for every request.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.settings.verbose = verbose;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Serves `router` until SIGTERM or Ctrl-C, then shuts down gracefully.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Serves `router` until `shutdown` resolves, then shuts down gracefully.
    pub async fn serve_with_shutdown(
        self,
        router: Router,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "sluice listening");
        self.run(listener, router, shutdown).await
    }

    /// Serves on an already bound listener.
    pub async fn run(
        self,
        listener: TcpListener,
        router: Router,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let router = Arc::new(router);
        let settings = self.settings;
        let mut tasks = tokio::task::JoinSet::new();

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(connections = tasks.len(), "shutdown signal received, draining");
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

                    let router = Arc::clone(&router);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let router = Arc::clone(&router);
                            async move { handle(&router, settings, req).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        let interrupted = router.state().fibers().drain(self.drain_timeout).await;
        if interrupted > 0 {
            warn!(interrupted, "interrupted requests that outlived the drain timeout");
        }

        let closed = tokio::time::timeout(self.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if closed.is_err() {
            warn!(connections = tasks.len(), "closing idle connections");
            tasks.shutdown().await;
        }

        info!("sluice stopped");
        Ok(())
    }
}

// ── Request handling ──────────────────────────────────────────────────────────

/// Routes one request and produces one response.
///
/// The error type is [`Infallible`]: every failure becomes a response, so
/// hyper never sees an error.
async fn handle(
    router: &Router,
    settings: RequestSettings,
    req: hyper::Request<Incoming>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let Ok(method) = Method::try_from(req.method()) else {
        return Ok(Response::status(http::StatusCode::METHOD_NOT_ALLOWED).into_http());
    };

    let response = match router.lookup(method, req.uri().path()) {
        Lookup::Found(dispatcher, params) => match RawRequest::from_http(req, params).await {
            // A dropped connection must not cut the pipeline short.
            Some(raw) => match dispatcher.spawn(raw, settings).await {
                Ok(response) => response,
                Err(e) => {
                    error!("dispatch task failed: {e}");
                    Response::status(http::StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
            None => Response::status(http::StatusCode::METHOD_NOT_ALLOWED),
        },
        Lookup::MethodNotAllowed => Response::status(http::StatusCode::METHOD_NOT_ALLOWED),
        Lookup::NotFound => Response::status(http::StatusCode::NOT_FOUND),
    };

    Ok(response.into_http())
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by the Kubernetes control
/// plane) and **SIGINT** (Ctrl-C, for local dev). Elsewhere only Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_carries_settings() {
        let config = ServerConfig {
            addr: "127.0.0.1:8080".to_owned(),
            verbose: true,
            drain_timeout_secs: 3,
            ..ServerConfig::default()
        };
        let server = Server::from_config(&config).unwrap();

        assert_eq!(server.addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert!(server.settings.verbose);
        assert_eq!(server.drain_timeout, Duration::from_secs(3));
    }
}
