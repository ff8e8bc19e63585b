//! HTTP control surface over the [`Manager`]
//!
//! A thin JSON layer: every route maps onto one manager operation and every
//! [`ManagerError`] onto its status code.

use crate::endpoint::Endpoint;
use crate::error::{ErrorResponse, ManagerError};
use crate::manager::Manager;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the manager
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn ok_json<T: Serialize>(value: &T) -> Result<Response<Full<Bytes>>, ManagerError> {
    let body = serde_json::to_string(value).map_err(|e| ManagerError::internal(e.to_string()))?;
    Ok(json_response(StatusCode::OK, body))
}

fn error_response(err: &ManagerError) -> Response<Full<Bytes>> {
    let body = ErrorResponse::from(err);
    json_response(err.code().status_code(), body.to_json())
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ManagerError> {
    serde_json::from_slice(body).map_err(|e| ManagerError::validation(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct BackendSelection {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EndpointUpdate {
    old: Endpoint,
    new: Endpoint,
}

/// Control API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    manager: Arc<Manager>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<Manager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, manager).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, manager: Arc<Manager>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let manager = Arc::clone(&manager);
        async move { handle_request(req, manager).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    manager: Arc<Manager>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await?.to_bytes();

    debug!(%method, %path, "API request");

    let response = match route(&method, &path, &body, &manager).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%method, %path, error = %e, "API request failed");
            error_response(&e)
        }
    };
    Ok(response)
}

async fn route(
    method: &Method,
    path: &str,
    body: &Bytes,
    manager: &Manager,
) -> Result<Response<Full<Bytes>>, ManagerError> {
    let done = || ok_json(&serde_json::json!({ "status": "ok" }));

    match (method, path) {
        (&Method::GET, "/health") => done(),

        (&Method::GET, "/version") => ok_json(&serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
        })),

        (&Method::GET, "/status") => ok_json(&manager.status().await),

        (&Method::GET, "/backends") => ok_json(&manager.backend_descriptors()),

        (&Method::GET, "/backends/current") => ok_json(&manager.current_backend()),

        (&Method::PUT, "/backends/current") => {
            let selection: BackendSelection = parse_body(body)?;
            manager.set_backend(&selection.name)?;
            ok_json(&manager.current_backend())
        }

        (&Method::GET, "/endpoints") => ok_json(&manager.list_endpoints()),

        (&Method::POST, "/endpoints") => {
            manager.add_endpoint(parse_body(body)?).await?;
            done()
        }

        (&Method::PUT, "/endpoints") => {
            let update: EndpointUpdate = parse_body(body)?;
            manager.update_endpoint(&update.old, update.new).await?;
            done()
        }

        (&Method::DELETE, "/endpoints") => {
            let endpoint: Endpoint = parse_body(body)?;
            manager.remove_endpoint(&endpoint).await?;
            done()
        }

        (&Method::DELETE, "/endpoints/all") => ok_json(&manager.clear_endpoints().await?),

        (&Method::GET, "/master") => ok_json(&manager.master()),

        (&Method::PUT, "/master") => {
            manager.set_master(parse_body(body)?).await?;
            done()
        }

        (&Method::GET, "/command") => ok_json(&serde_json::json!({
            "command": manager.command_preview()?,
        })),

        (&Method::POST, "/start") => {
            manager.start().await?;
            done()
        }

        (&Method::POST, "/stop") => {
            manager.stop().await?;
            done()
        }

        (&Method::POST, "/restart") => {
            manager.restart().await?;
            done()
        }

        _ => Err(ManagerError::NotFound(format!("route {} {}", method, path))),
    }
}
