//! HTTP server and service lifecycle
//!
//! One `TcpListener` accept loop per started service, torn down through a
//! `CancellationToken`. Stopping is graceful: the listener closes while
//! in-flight requests run to completion under the configured timeout.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use muxdrive_core::domain::group::generate_api_key;
use muxdrive_core::domain::{ApiLogEntry, ApiLogStatus};
use muxdrive_core::{EngineError, EngineResult};
use muxdrive_router::scope::digest_key;
use muxdrive_router::AccessScope;
use muxdrive_store::Store;

use crate::commands::CommandContext;
use crate::sanitize::{sanitize_payload, summarize_value, truncate, ERROR_CAPTURE_LIMIT};

/// Body shape of `POST /command/<name>`.
#[derive(Debug, Default, Deserialize)]
struct ApiCommandBody {
    #[serde(default)]
    payload: Option<Value>,
}

struct RunningListener {
    cancel: CancellationToken,
    addr: SocketAddr,
}

/// The gateway: command dispatch plus listener lifecycle.
pub struct GatewayService {
    ctx: Arc<CommandContext>,
    store: Arc<Store>,
    running: Mutex<Option<RunningListener>>,
}

impl GatewayService {
    pub fn new(ctx: Arc<CommandContext>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            store,
            running: Mutex::new(None),
        })
    }

    /// Starts the listener from the persisted service config. Idempotent:
    /// an already-running service just reports its status.
    ///
    /// Returns a boxed future (rather than `async fn`) because this method
    /// is reachable, via the command dispatch path, from inside the task it
    /// spawns; an opaque `impl Future` return type creates an unresolvable
    /// cycle when the compiler checks it for `Send`.
    pub fn start(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = EngineResult<Value>> + Send + '_>> {
        Box::pin(async move {
            let mut running = self.running.lock().await;
            if running.is_some() {
                drop(running);
                return self.status().await;
            }
            let config = self.store.config.read().await?.service;
            let addr: SocketAddr = format!("{}:{}", config.listen_host, config.port)
                .parse()
                .map_err(|e| EngineError::InvalidArgument(format!("bad listen address: {e}")))?;
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| EngineError::LocalIo(format!("bind {addr}: {e}")))?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| EngineError::LocalIo(e.to_string()))?;
            let cancel = CancellationToken::new();
            let timeout = Duration::from_secs(config.timeout_secs.max(1));

            let service = Arc::clone(self);
            let loop_cancel = cancel.clone();
            tokio::spawn(async move {
                service.accept_loop(listener, timeout, loop_cancel).await;
            });

            info!(addr = %local_addr, "API gateway listening");
            *running = Some(RunningListener {
                cancel,
                addr: local_addr,
            });
            drop(running);
            self.status().await
        })
    }

    /// Stops accepting connections; in-flight requests finish on their own.
    pub async fn stop(&self) -> EngineResult<Value> {
        let mut running = self.running.lock().await;
        if let Some(listener) = running.take() {
            listener.cancel.cancel();
            info!(addr = %listener.addr, "API gateway stopped");
        }
        drop(running);
        self.status().await
    }

    /// Current lifecycle status plus the persisted service config.
    pub async fn status(&self) -> EngineResult<Value> {
        let config = self.store.config.read().await?.service;
        let running = self.running.lock().await;
        Ok(json!({
            "running": running.is_some(),
            "bound_addr": running.as_ref().map(|r| r.addr.to_string()),
            "listen_host": config.listen_host,
            "port": config.port,
            "timeout_secs": config.timeout_secs,
            "autostart": config.autostart,
        }))
    }

    /// The actual port bound, for tests started on port 0.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "Accept failed");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        let handler = service_fn(move |req| {
                            let service = Arc::clone(&service);
                            async move {
                                Ok::<_, std::convert::Infallible>(
                                    service.handle(req, timeout).await,
                                )
                            }
                        });
                        if let Err(err) = http1::Builder::new().serve_connection(io, handler).await
                        {
                            error!(error = %err, "Gateway connection error");
                        }
                    });
                }
            }
        }
    }

    async fn handle(
        self: &Arc<Self>,
        req: Request<Incoming>,
        timeout: Duration,
    ) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method == Method::GET && path == "/health" {
            return json_response(StatusCode::OK, json!({ "status": "ok" }));
        }

        let command = path
            .strip_prefix("/command/")
            .filter(|name| !name.is_empty() && method == Method::POST)
            .map(str::to_string);
        let command = match command {
            Some(command) => command,
            None => {
                return error_response(&EngineError::NotFound("unknown route".into()));
            }
        };

        let api_key = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                return error_response(&EngineError::LocalIo(format!("body read: {err}")));
            }
        };
        let body: ApiCommandBody = if body.is_empty() {
            ApiCommandBody::default()
        } else {
            match serde_json::from_slice(&body) {
                Ok(parsed) => parsed,
                Err(err) => {
                    return error_response(&EngineError::InvalidArgument(format!(
                        "malformed JSON body: {err}"
                    )));
                }
            }
        };

        self.dispatch_audited(&command, api_key.as_deref(), body.payload, timeout)
            .await
    }

    /// Resolves the scope, runs the command under the request timeout, and
    /// appends the audit entry.
    async fn dispatch_audited(
        self: &Arc<Self>,
        command: &str,
        api_key: Option<&str>,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let sanitized_request = sanitize_payload(&payload);

        let scope = match self.ctx.registry.resolve_scope(api_key).await {
            Ok(scope) => scope,
            Err(err) => {
                self.audit_entry(
                    "unknown",
                    command,
                    ApiLogStatus::Error,
                    started,
                    &err.to_string(),
                    json!({ "request": sanitized_request }),
                )
                .await;
                return error_response(&err);
            }
        };
        let scope_label = scope.label();

        let work = self.dispatch(&scope, command, payload);
        let result = match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "command {command} exceeded {}s",
                timeout.as_secs()
            ))),
        };

        match result {
            Ok(value) => {
                self.audit_entry(
                    &scope_label,
                    command,
                    ApiLogStatus::Success,
                    started,
                    "OK",
                    json!({
                        "request": sanitized_request,
                        "response": summarize_value(&value),
                    }),
                )
                .await;
                json_response(StatusCode::OK, json!({ "ok": true, "data": value }))
            }
            Err(err) => {
                self.audit_entry(
                    &scope_label,
                    command,
                    ApiLogStatus::Error,
                    started,
                    &err.to_string(),
                    json!({
                        "request": sanitized_request,
                        "error": truncate(&err.to_string(), ERROR_CAPTURE_LIMIT),
                    }),
                )
                .await;
                error_response(&err)
            }
        }
    }

    /// Service lifecycle commands are intercepted here; everything else
    /// goes to the command context.
    async fn dispatch(
        self: &Arc<Self>,
        scope: &AccessScope,
        command: &str,
        payload: Option<Value>,
    ) -> EngineResult<Value> {
        match command {
            "start_service" => {
                scope.ensure_admin()?;
                self.start().await
            }
            "stop_service" => {
                scope.ensure_admin()?;
                self.stop().await
            }
            _ => self.ctx.dispatch(scope, command, payload).await,
        }
    }

    async fn audit_entry(
        &self,
        scope: &str,
        command: &str,
        status: ApiLogStatus,
        started: Instant,
        message: &str,
        meta: Value,
    ) {
        let entry = ApiLogEntry::new(
            scope.to_string(),
            command.to_string(),
            status,
            started.elapsed().as_millis() as u64,
        )
        .with_message(message)
        .with_meta(meta);
        self.ctx.audit.append(&entry).await;
    }
}

/// Generates and persists the admin API key on first start.
///
/// Returns the plaintext key when one was created, `None` when a key
/// already exists.
pub async fn ensure_admin_key(store: &Store) -> EngineResult<Option<String>> {
    let config = store.config.read().await?;
    if config.security.admin_key_digest.is_some() {
        return Ok(None);
    }
    let key = generate_api_key();
    store
        .config
        .update(|cfg| {
            cfg.security.admin_key_digest = Some(digest_key(&key));
            cfg.security.admin_key_plain = Some(key.clone());
        })
        .await?;
    info!("Generated admin API key on first start");
    Ok(Some(key))
}

// ---------------------------------------------------------------------------
// Response rendering
// ---------------------------------------------------------------------------

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(err: &EngineError) -> Response<Full<Bytes>> {
    json_response(
        status_for(err),
        json!({
            "ok": false,
            "error": { "kind": err.kind(), "message": err.to_string() },
        }),
    )
}

/// Maps the error taxonomy onto the HTTP surface.
fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::AuthMissing | EngineError::AuthInvalid => StatusCode::UNAUTHORIZED,
        EngineError::ScopeDenied(_) => StatusCode::FORBIDDEN,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::DuplicateName(_) | EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::InvalidArgument(_) | EngineError::InvalidCron(_) => StatusCode::BAD_REQUEST,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::NoWritableTenant { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&EngineError::AuthMissing), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&EngineError::AuthInvalid), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&EngineError::ScopeDenied("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&EngineError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&EngineError::DuplicateName("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EngineError::InvalidCron("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&EngineError::Timeout("x".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&EngineError::LocalIo("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(&EngineError::DuplicateName("a.txt".into()));
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
