//! Getwork HTTP endpoint with `/lp` long polling.
//!
//! Legacy miners speak JSON-RPC over HTTP POST: `getwork` with empty params
//! asks for work, non-empty params submit a solved header. Long polling
//! parks a request until the next clean-jobs broadcast and answers it with
//! fresh work. Every response advertises the native stratum port so capable
//! miners can upgrade themselves.

use crate::constants::GETWORK_AUTH_REALM;
use crate::errors::PoolError;
use crate::job_registry::{JobRegistry, SubmitDecision};
use crate::poolapi::PoolApi;
use crate::prom::{record_getwork_request, record_longpoll_wakeup, record_share};
use crate::share_stats::ShareStats;
use crate::worker_registry::WorkerRegistry;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use axum::routing::{any, post};
use axum::Router;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use triggered::Listener;

pub struct GetworkState {
    pool: Arc<PoolApi>,
    registry: Arc<JobRegistry>,
    workers: Arc<WorkerRegistry>,
    stats: Arc<ShareStats>,
    stratum_port: u16,
    custom_stratum: Option<String>,
    custom_lp: Option<String>,
    custom_user: Option<(String, String)>,
    shutdown: Listener,
}

impl GetworkState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<PoolApi>,
        registry: Arc<JobRegistry>,
        workers: Arc<WorkerRegistry>,
        stats: Arc<ShareStats>,
        stratum_port: u16,
        custom_stratum: Option<String>,
        custom_lp: Option<String>,
        custom_user: Option<(String, String)>,
        shutdown: Listener,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            workers,
            stats,
            stratum_port,
            custom_stratum,
            custom_lp,
            custom_user,
            shutdown,
        })
    }

    /// Bind and serve until shutdown.
    pub async fn listen(self: Arc<Self>, host: &str, port: u16) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        info!("listening for getwork miners on http://{host}:{port}");
        self.serve(listener).await
    }

    /// Serve an already-bound listener until shutdown.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        let shutdown = self.shutdown.clone();
        let app = Router::new()
            .route("/", post(handle_rpc).get(handle_longpoll))
            .route("/lp", any(handle_longpoll))
            .route("/lp/*rest", any(handle_longpoll))
            .fallback(handle_fallback)
            .with_state(self);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.await })
            .await
    }

    fn proxy_headers(&self, request_headers: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let stratum = match &self.custom_stratum {
            Some(custom) => custom.clone(),
            None => {
                let host = request_headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(|h| h.split(':').next().unwrap_or(h))
                    .unwrap_or("localhost");
                format!("stratum+tcp://{host}:{}", self.stratum_port)
            }
        };
        if let Ok(value) = HeaderValue::from_str(&stratum) {
            headers.insert(HeaderName::from_static("x-stratum"), value);
        }

        let lp = self.custom_lp.as_deref().unwrap_or("/lp");
        if let Ok(value) = HeaderValue::from_str(lp) {
            headers.insert(HeaderName::from_static("x-long-polling"), value);
        }
        headers.insert(HeaderName::from_static("x-roll-ntime"), HeaderValue::from_static("1"));
        headers
    }

    /// Worker credentials: `--custom-user` wins, otherwise HTTP Basic auth.
    fn credentials(&self, headers: &HeaderMap) -> Option<(String, String)> {
        if let Some((user, password)) = &self.custom_user {
            return Some((user.clone(), password.clone()));
        }
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some((user.to_string(), password.to_string()))
    }
}

fn json_body(id: Value, result: Value) -> String {
    json!({"id": id, "result": result, "error": Value::Null}).to_string()
}

fn json_error_body(id: Value, code: i64, message: &str) -> String {
    json!({"id": id, "result": Value::Null, "error": {"code": code, "message": message}}).to_string()
}

fn respond(status: StatusCode, headers: HeaderMap, body: String) -> Response {
    let mut response = Response::builder().status(status);
    if let Some(map) = response.headers_mut() {
        map.extend(headers);
    }
    response.body(Body::from(body)).unwrap_or_else(|_| Response::new(Body::empty()))
}

fn unauthorized(mut headers: HeaderMap) -> Response {
    warn!("getwork authorization required");
    let challenge = format!("Basic realm=\"{GETWORK_AUTH_REALM}\"");
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        headers.insert(header::WWW_AUTHENTICATE, value);
    }
    respond(StatusCode::UNAUTHORIZED, headers, "Authorization required".to_string())
}

async fn handle_rpc(
    State(state): State<Arc<GetworkState>>,
    request_headers: HeaderMap,
    body: String,
) -> Response {
    let headers = state.proxy_headers(&request_headers);

    let Some((worker_name, password)) = state.credentials(&request_headers) else {
        return unauthorized(headers);
    };

    let request: Value = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(_) => {
            return respond(
                StatusCode::OK,
                headers,
                json_error_body(Value::from(0), -1, "Unparsable JSON-RPC request"),
            );
        }
    };
    let id = request.get("id").cloned().unwrap_or_else(|| Value::from(0));
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = request.get("params").and_then(Value::as_array).cloned().unwrap_or_default();

    let upstream: Arc<dyn crate::poolapi::SubmitUpstream> = state.pool.clone();
    if !state.workers.authorize(&upstream, &worker_name, &password).await {
        return respond(StatusCode::OK, headers, json_error_body(id, -1, "Bad worker credentials"));
    }

    if !state.registry.has_job() {
        warn!("getwork translator is waiting for a job");
        return respond(
            StatusCode::OK,
            headers,
            json_error_body(id, -1, "Getwork translator is waiting for a job"),
        );
    }

    match method {
        "getwork" | "submit" => {
            if params.is_empty() {
                info!("worker '{worker_name}' asks for new work");
                record_getwork_request();
                let no_midstate = mining_extensions_has_midstate(&request_headers);
                match state.registry.getwork(no_midstate) {
                    Ok(work) => {
                        let result = serde_json::to_value(work).unwrap_or(Value::Null);
                        respond(StatusCode::OK, headers, json_body(id, result))
                    }
                    Err(err) => respond(StatusCode::OK, headers, json_error_body(id, -1, &err.to_string())),
                }
            } else {
                let header_hex = params.first().and_then(Value::as_str).unwrap_or_default();
                let accepted = submit_share(&state, header_hex, &worker_name).await;
                respond(StatusCode::OK, headers, json_body(id, json!(accepted)))
            }
        }
        other => respond(
            StatusCode::OK,
            headers,
            json_error_body(id, -1, &format!("Unsupported method '{other}'")),
        ),
    }
}

async fn submit_share(state: &Arc<GetworkState>, header_hex: &str, worker_name: &str) -> bool {
    let started = Instant::now();

    let decision = match state.registry.submit_parts(header_hex) {
        Ok(decision) => decision,
        Err(err) => {
            state.stats.share_rejected(worker_name, &err.to_string(), started.elapsed());
            record_share(worker_name, false);
            return false;
        }
    };

    match decision {
        SubmitDecision::BelowTarget => {
            // Silently accepted from the miner's point of view; the pool
            // never sees it.
            info!("share from '{worker_name}' under local difficulty, not forwarded");
            record_share(worker_name, true);
            true
        }
        SubmitDecision::JobNotFound => {
            state.stats.share_rejected(worker_name, "job not found", started.elapsed());
            record_share(worker_name, false);
            false
        }
        SubmitDecision::Forward(parts) => {
            let submit_as = state.pool.submit_identity(worker_name);
            let result = state
                .pool
                .rpc(
                    "mining.submit",
                    vec![
                        json!(submit_as),
                        json!(parts.job_id),
                        json!(parts.extranonce2_hex),
                        json!(parts.ntime_hex),
                        json!(parts.nonce_hex),
                    ],
                )
                .await;
            match result {
                Ok(value) => {
                    let accepted = value.as_bool().unwrap_or(false);
                    record_share(worker_name, accepted);
                    if accepted {
                        state.stats.share_accepted(
                            worker_name,
                            &parts.job_id,
                            state.registry.difficulty(),
                            started.elapsed(),
                        );
                    } else {
                        state.stats.share_rejected(worker_name, "pool returned false", started.elapsed());
                    }
                    accepted
                }
                Err(PoolError::Rpc { message, .. }) => {
                    record_share(worker_name, false);
                    state.stats.share_rejected(worker_name, &message, started.elapsed());
                    false
                }
                Err(err) => {
                    record_share(worker_name, false);
                    state.stats.share_rejected(worker_name, &err.to_string(), started.elapsed());
                    false
                }
            }
        }
    }
}

async fn handle_longpoll(
    State(state): State<Arc<GetworkState>>,
    request_headers: HeaderMap,
) -> Response {
    let headers = state.proxy_headers(&request_headers);
    let worker_name = state
        .credentials(&request_headers)
        .map(|(user, _)| user)
        .unwrap_or_else(|| "<unknown>".to_string());
    info!("worker '{worker_name}' subscribed for LP");

    let listener = state.registry.on_block_listener();
    tokio::select! {
        _ = state.shutdown.clone() => {}
        _ = listener => {}
    }

    record_longpoll_wakeup();
    info!("LP broadcast for worker '{worker_name}'");
    let no_midstate = mining_extensions_has_midstate(&request_headers);
    let body = match state.registry.getwork(no_midstate) {
        Ok(work) => json_body(Value::from(0), serde_json::to_value(work).unwrap_or(Value::Null)),
        Err(err) => json_error_body(Value::from(0), -1, &err.to_string()),
    };
    respond(StatusCode::OK, headers, body)
}

/// Any GET parks on long polling, whatever the path; some legacy miners
/// poll odd paths for it. Unknown POSTs are errors.
async fn handle_fallback(
    State(state): State<Arc<GetworkState>>,
    method: Method,
    uri: Uri,
    request_headers: HeaderMap,
) -> Response {
    if method == Method::GET || uri.path().starts_with("/lp") {
        return handle_longpoll(State(state), request_headers).await;
    }
    let headers = state.proxy_headers(&request_headers);
    respond(StatusCode::NOT_FOUND, headers, json_error_body(Value::from(0), -1, "Unsupported endpoint"))
}

fn mining_extensions_has_midstate(headers: &HeaderMap) -> bool {
    headers
        .get(HeaderName::from_static("x-mining-extensions"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("midstate"))
        .unwrap_or(false)
}
