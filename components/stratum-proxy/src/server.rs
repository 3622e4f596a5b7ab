//! Glue between the upstream session and the rest of the proxy: pool events
//! land here and fan out to the registry and the downstream miners.

use crate::client_handler::ClientHandler;
use crate::job::Job;
use crate::job_registry::JobRegistry;
use crate::poolapi::PoolEvents;
use crate::prom::{record_job_received, record_pool_difficulty};
use crate::worker_registry::WorkerRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub struct EventBridge {
    registry: Arc<JobRegistry>,
    clients: Arc<ClientHandler>,
    workers: Arc<WorkerRegistry>,
}

impl EventBridge {
    pub fn new(
        registry: Arc<JobRegistry>,
        clients: Arc<ClientHandler>,
        workers: Arc<WorkerRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self { registry, clients, workers })
    }
}

#[async_trait::async_trait]
impl PoolEvents for EventBridge {
    async fn on_connected(&self) {
        // Authorizations don't survive a pool session.
        self.workers.clear_authorizations();
    }

    async fn on_disconnected(&self) {
        // Miners must resubscribe against the new session; dropping them is
        // the one reliable way every stratum client understands.
        self.clients.disconnect_all();
        self.workers.clear_authorizations();
    }

    async fn on_notify(&self, params: &[Value]) {
        record_job_received();

        // Stratum downstreams get the broadcast verbatim, then the getwork
        // side builds its job. add_template fires the long-poll event after
        // the flush, so getwork clients always see a coherent job set.
        self.clients.cache_notify(params);
        self.clients.broadcast("mining.notify", params.to_vec()).await;

        match Job::from_notify(params) {
            Ok((job, clean_jobs)) => {
                info!(
                    "new job {} for prevhash {}, clean_jobs={clean_jobs}",
                    job.job_id,
                    &job.prevhash[..8.min(job.prevhash.len())]
                );
                self.registry.add_template(job, clean_jobs);
            }
            Err(err) => warn!("discarding unusable mining.notify: {err}"),
        }
    }

    async fn on_set_difficulty(&self, difficulty: f64) {
        self.registry.set_difficulty(difficulty);
        record_pool_difficulty(difficulty);
        self.clients.broadcast("mining.set_difficulty", vec![json!(difficulty)]).await;
    }

    async fn on_set_extranonce(&self, extranonce1: &str, extranonce2_size: usize) {
        let changed = match self.registry.extranonce() {
            Some((old_extranonce1, old_size)) => {
                old_extranonce1 != extranonce1 || old_size != extranonce2_size
            }
            None => false,
        };

        if let Err(err) = self.registry.set_extranonce(extranonce1, extranonce2_size) {
            warn!("ignoring unusable extranonce from pool: {err}");
            return;
        }

        if changed {
            // Tails were carved out of the old extranonce space; every
            // downstream has to renegotiate.
            info!("extranonce changed, dropping all stratum downstreams");
            self.clients.disconnect_all();
        }
    }
}
