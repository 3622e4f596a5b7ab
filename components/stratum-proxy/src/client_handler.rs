//! The set of connected downstream stratum miners and the broadcast fan-out.

use crate::extranonce::ExtranoncePartitioner;
use crate::prom::record_stratum_clients;
use crate::stratum_context::StratumContext;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct ClientHandler {
    clients: Mutex<HashMap<u64, Arc<StratumContext>>>,
    client_counter: AtomicU64,
    pub partitioner: ExtranoncePartitioner,
    /// Params of the newest `mining.notify`, replayed to fresh subscribers.
    last_notify: Mutex<Option<Vec<Value>>>,
}

impl ClientHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            client_counter: AtomicU64::new(1),
            partitioner: ExtranoncePartitioner::new(),
            last_notify: Mutex::new(None),
        })
    }

    pub fn next_client_id(&self) -> u64 {
        self.client_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn on_connect(&self, ctx: Arc<StratumContext>) {
        let mut clients = self.clients.lock();
        clients.insert(ctx.id, ctx);
        record_stratum_clients(clients.len() as i64);
    }

    pub fn on_disconnect(&self, ctx: &Arc<StratumContext>) {
        ctx.disconnect();
        if let Some(tail) = ctx.tail() {
            self.partitioner.release(&tail.bytes);
        }
        let mut clients = self.clients.lock();
        if clients.remove(&ctx.id).is_some() {
            debug!("removed client {}", ctx.id);
        }
        record_stratum_clients(clients.len() as i64);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Remember the newest notify for replay to fresh subscribers.
    pub fn cache_notify(&self, params: &[Value]) {
        *self.last_notify.lock() = Some(params.to_vec());
    }

    /// The last notify with `clean_jobs` forced true, so a new subscriber
    /// drops whatever it was doing and starts on current work.
    pub fn last_notify_clean(&self) -> Option<Vec<Value>> {
        let mut params = self.last_notify.lock().clone()?;
        if let Some(last) = params.last_mut() {
            *last = Value::Bool(true);
        }
        Some(params)
    }

    /// Broadcast a notification to every subscribed client. Dead clients
    /// are dropped from the set as they surface.
    pub async fn broadcast(&self, method: &str, params: Vec<Value>) {
        let clients: Vec<Arc<StratumContext>> = self.clients.lock().values().cloned().collect();
        for ctx in clients {
            if !ctx.is_subscribed() {
                continue;
            }
            if ctx.notify(method, params.clone()).await.is_err() {
                self.on_disconnect(&ctx);
            }
        }
    }

    /// Drop every downstream connection. Used when the upstream goes away
    /// (miners must resubscribe against the new session) and when the pool
    /// rotates extranonce1 under our feet.
    pub fn disconnect_all(&self) {
        let clients: Vec<Arc<StratumContext>> = self.clients.lock().values().cloned().collect();
        for ctx in clients {
            self.on_disconnect(&ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_notify_is_replayed_with_clean_jobs() {
        let handler = ClientHandler::new();
        assert!(handler.last_notify_clean().is_none());

        handler.cache_notify(&[json!("job"), json!("prevhash"), json!(false)]);
        let replay = handler.last_notify_clean().unwrap();
        assert_eq!(replay[0], json!("job"));
        assert_eq!(replay.last().unwrap(), &json!(true));
    }
}
