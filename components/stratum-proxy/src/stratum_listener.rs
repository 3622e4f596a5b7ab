//! Downstream stratum TCP service: accept loop, per-client read loop, and
//! the `mining.*` method handlers miners drive.

use crate::client_handler::ClientHandler;
use crate::errors::{PoolError, CODE_UNKNOWN_METHOD, CODE_UPSTREAM};
use crate::job_registry::JobRegistry;
use crate::jsonrpc_event::{unmarshal_message, JsonRpcEvent, JsonRpcMessage, JsonRpcResponse, StratumMethod};
use crate::poolapi::PoolApi;
use crate::prom::record_share;
use crate::share_stats::ShareStats;
use crate::stratum_context::StratumContext;
use crate::worker_registry::WorkerRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use triggered::Listener;

pub struct StratumServer {
    pool: Arc<PoolApi>,
    registry: Arc<JobRegistry>,
    clients: Arc<ClientHandler>,
    workers: Arc<WorkerRegistry>,
    stats: Arc<ShareStats>,
    shutdown: Listener,
}

impl StratumServer {
    pub fn new(
        pool: Arc<PoolApi>,
        registry: Arc<JobRegistry>,
        clients: Arc<ClientHandler>,
        workers: Arc<WorkerRegistry>,
        stats: Arc<ShareStats>,
        shutdown: Listener,
    ) -> Arc<Self> {
        Arc::new(Self { pool, registry, clients, workers, stats, shutdown })
    }

    /// Bind and serve until shutdown.
    pub async fn listen(self: Arc<Self>, host: &str, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("listening for stratum miners on stratum+tcp://{host}:{port}");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.clone() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let (read_half, write_half) = stream.into_split();
                    let ctx = StratumContext::new(self.clients.next_client_id(), remote_addr, write_half);
                    debug!("new stratum client {} ({})", ctx.id, remote_addr);
                    self.clients.on_connect(Arc::clone(&ctx));

                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.client_loop(ctx, read_half).await });
                }
                Err(err) => warn!("failed to accept stratum connection: {err}"),
            }
        }
        Ok(())
    }

    async fn client_loop(&self, ctx: Arc<StratumContext>, read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            if !ctx.connected() {
                break;
            }
            line.clear();
            let read = tokio::select! {
                _ = self.shutdown.clone() => break,
                _ = ctx.aborted() => break,
                read = reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let frame = line.trim();
                    if frame.is_empty() {
                        continue;
                    }
                    match unmarshal_message(frame) {
                        Ok(JsonRpcMessage::Event(event)) => self.handle_event(&ctx, event).await,
                        Ok(JsonRpcMessage::Response(_)) => {
                            debug!("ignoring response frame from miner {}", ctx.remote_addr);
                        }
                        Err(err) => {
                            warn!("unparsable frame from miner {}: {err}", ctx.remote_addr);
                        }
                    }
                }
                Err(err) => {
                    debug!("error reading from miner {}: {err}", ctx.remote_addr);
                    break;
                }
            }
        }

        ctx.close_writer().await;
        self.clients.on_disconnect(&ctx);
    }

    async fn handle_event(&self, ctx: &Arc<StratumContext>, event: JsonRpcEvent) {
        let id = event.id.clone();
        let outcome = match event.method_enum() {
            StratumMethod::Subscribe => self.handle_subscribe(ctx, id).await,
            StratumMethod::Authorize => self.handle_authorize(ctx, id, &event.params).await,
            StratumMethod::Submit => self.handle_submit(ctx, id, &event.params).await,
            StratumMethod::ExtranonceSubscribe => ctx.reply(JsonRpcResponse::success(id, json!(true))).await,
            StratumMethod::GetTransactions => {
                warn!("mining.get_transactions isn't supported by proxy");
                ctx.reply(JsonRpcResponse::success(id, json!([]))).await
            }
            other => {
                debug!("unknown method {other:?} from miner {}", ctx.remote_addr);
                ctx.reply(JsonRpcResponse::error(id, CODE_UNKNOWN_METHOD, "Method not found")).await
            }
        };
        if outcome.is_err() {
            self.clients.on_disconnect(ctx);
        }
    }

    async fn handle_subscribe(
        &self,
        ctx: &Arc<StratumContext>,
        id: Option<Value>,
    ) -> Result<(), crate::stratum_context::ErrorDisconnected> {
        // The first downstream may race the upstream handshake.
        tokio::select! {
            _ = self.shutdown.clone() => return Ok(()),
            _ = self.pool.wait_subscribed() => {}
        }

        let (extranonce1, extranonce2_size) = match self.registry.extranonce() {
            Some(parts) => parts,
            None => {
                return ctx
                    .reply(JsonRpcResponse::error(id, CODE_UPSTREAM, "Not subscribed on upstream yet"))
                    .await;
            }
        };

        let tail = match ctx.tail() {
            // Repeated subscribe keeps the already-assigned tail.
            Some(tail) => tail,
            None => match self.clients.partitioner.allocate(extranonce2_size) {
                Ok(tail) => {
                    ctx.set_tail(tail.clone());
                    tail
                }
                Err(err) => {
                    warn!("{err}");
                    return ctx.reply(JsonRpcResponse::error(id, CODE_UPSTREAM, &err.to_string())).await;
                }
            },
        };

        let subscription_id = format!("{:016x}", ctx.id);
        let result = json!([
            [
                ["mining.set_difficulty", subscription_id],
                ["mining.notify", subscription_id],
            ],
            format!("{extranonce1}{}", tail.hex),
            tail.extranonce2_size,
        ]);
        ctx.reply(JsonRpcResponse::success(id, result)).await?;

        // Emit current difficulty and the latest job right away; the order
        // matters so the miner prices the job correctly.
        ctx.notify("mining.set_difficulty", vec![json!(self.registry.difficulty())]).await?;
        if let Some(params) = self.clients.last_notify_clean() {
            ctx.notify("mining.notify", params).await?;
        }
        Ok(())
    }

    async fn handle_authorize(
        &self,
        ctx: &Arc<StratumContext>,
        id: Option<Value>,
        params: &[Value],
    ) -> Result<(), crate::stratum_context::ErrorDisconnected> {
        let worker_name = params.first().and_then(Value::as_str).unwrap_or_default();
        let password = params.get(1).and_then(Value::as_str).unwrap_or_default();
        if worker_name.is_empty() {
            return ctx
                .reply(JsonRpcResponse::error(id, crate::errors::CODE_BAD_CREDENTIALS, "Bad worker credentials"))
                .await;
        }

        let upstream: Arc<dyn crate::poolapi::SubmitUpstream> = self.pool.clone();
        let authorized = self.workers.authorize(&upstream, worker_name, password).await;
        if authorized {
            ctx.note_authorized(worker_name);
        }
        ctx.reply(JsonRpcResponse::success(id, json!(authorized))).await
    }

    async fn handle_submit(
        &self,
        ctx: &Arc<StratumContext>,
        id: Option<Value>,
        params: &[Value],
    ) -> Result<(), crate::stratum_context::ErrorDisconnected> {
        let started = Instant::now();

        let tail = match ctx.tail() {
            Some(tail) => tail,
            None => {
                return ctx
                    .reply(JsonRpcResponse::error(id, CODE_UPSTREAM, "Connection is not subscribed"))
                    .await;
            }
        };

        let mut fields = params.iter().map(|p| p.as_str().unwrap_or_default());
        let (worker_name, job_id, extranonce2, ntime, nonce) = (
            fields.next().unwrap_or_default().to_string(),
            fields.next().unwrap_or_default().to_string(),
            fields.next().unwrap_or_default().to_string(),
            fields.next().unwrap_or_default().to_string(),
            fields.next().unwrap_or_default().to_string(),
        );
        if job_id.is_empty() || nonce.is_empty() {
            return ctx
                .reply(JsonRpcResponse::error(id, CODE_UPSTREAM, "Malformed mining.submit params"))
                .await;
        }

        // The miner only knows its share of the extranonce space; the tail
        // we carved for it completes the pool-visible extranonce2.
        let full_extranonce2 = format!("{}{extranonce2}", tail.hex);
        let submit_as = self.pool.submit_identity(&worker_name);

        let result = self
            .pool
            .rpc(
                "mining.submit",
                vec![json!(submit_as), json!(job_id), json!(full_extranonce2), json!(ntime), json!(nonce)],
            )
            .await;

        match result {
            Ok(value) => {
                let accepted = value.as_bool().unwrap_or(false);
                record_share(&worker_name, accepted);
                if accepted {
                    self.stats.share_accepted(&worker_name, &job_id, self.registry.difficulty(), started.elapsed());
                } else {
                    self.stats.share_rejected(&worker_name, "pool returned false", started.elapsed());
                }
                ctx.reply(JsonRpcResponse::success(id, json!(accepted))).await
            }
            Err(PoolError::Rpc { message, .. }) => {
                record_share(&worker_name, false);
                self.stats.share_rejected(&worker_name, &message, started.elapsed());
                ctx.reply(JsonRpcResponse::error(id, CODE_UPSTREAM, &message)).await
            }
            Err(err) => {
                record_share(&worker_name, false);
                self.stats.share_rejected(&worker_name, &err.to_string(), started.elapsed());
                ctx.reply(JsonRpcResponse::error(id, CODE_UPSTREAM, "Upstream not connected")).await
            }
        }
    }
}
