//! Worker authorization cache.
//!
//! Successful authorizations are cached for the lifetime of the upstream
//! connection; failed ones are rate limited so a misconfigured miner farm
//! doesn't flood the pool with `mining.authorize` calls.

use crate::constants::AUTHORIZE_RETRY_DELAY;
use crate::errors::PoolError;
use crate::poolapi::SubmitUpstream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

#[derive(Default)]
struct RegistryState {
    authorized: HashSet<String>,
    unauthorized: HashSet<String>,
    last_failure: Option<Instant>,
}

pub struct WorkerRegistry {
    state: Mutex<RegistryState>,
    /// With a custom user all downstream workers ride its authorization.
    custom_user: bool,
}

impl WorkerRegistry {
    pub fn new(custom_user: bool) -> Self {
        Self { state: Mutex::new(RegistryState::default()), custom_user }
    }

    /// Forget everything; called on upstream connect and disconnect, since
    /// authorizations don't survive the session.
    pub fn clear_authorizations(&self) {
        let mut state = self.state.lock();
        state.authorized.clear();
        state.unauthorized.clear();
        state.last_failure = None;
    }

    pub fn is_authorized(&self, worker_name: &str) -> bool {
        self.custom_user || self.state.lock().authorized.contains(worker_name)
    }

    /// Authorize a worker, consulting the cache first.
    pub async fn authorize(
        &self,
        upstream: &Arc<dyn SubmitUpstream>,
        worker_name: &str,
        password: &str,
    ) -> bool {
        if self.custom_user {
            // Already authorized eagerly on connect.
            return true;
        }

        {
            let state = self.state.lock();
            if state.authorized.contains(worker_name) {
                return true;
            }
            if state.unauthorized.contains(worker_name) {
                let recent = state
                    .last_failure
                    .map(|at| at.elapsed() < AUTHORIZE_RETRY_DELAY)
                    .unwrap_or(false);
                if recent {
                    warn!("authorization of worker '{worker_name}' failed recently, next attempt in a few seconds");
                    return false;
                }
            }
        }

        let result = upstream
            .rpc("mining.authorize", vec![json!(worker_name), json!(password)])
            .await;

        let mut state = self.state.lock();
        match result {
            Ok(Value::Bool(true)) => {
                state.authorized.insert(worker_name.to_string());
                state.unauthorized.remove(worker_name);
                true
            }
            Ok(_) => {
                state.unauthorized.insert(worker_name.to_string());
                state.last_failure = Some(Instant::now());
                false
            }
            Err(PoolError::Disconnected) => false,
            Err(err) => {
                warn!("cannot authorize worker '{worker_name}': {err}");
                state.unauthorized.insert(worker_name.to_string());
                state.last_failure = Some(Instant::now());
                false
            }
        }
    }
}
