//! Per-worker share accounting and the sharenotify hook.

use crate::constants::STATS_PRINT_INTERVAL;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Default, Clone)]
pub struct WorkerStats {
    pub accepted: u64,
    pub rejected: u64,
}

pub struct ShareStats {
    workers: Mutex<HashMap<String, WorkerStats>>,
    /// Command spawned per accepted share with worker, job id and difficulty
    /// appended as arguments.
    sharenotify_cmd: Option<String>,
}

impl ShareStats {
    pub fn new(sharenotify_cmd: Option<String>) -> Arc<Self> {
        Arc::new(Self { workers: Mutex::new(HashMap::new()), sharenotify_cmd })
    }

    /// Record an accepted share and log it the way operators expect.
    pub fn share_accepted(&self, worker_name: &str, job_id: &str, difficulty: f64, elapsed: Duration) {
        info!(
            "[{}ms] share from '{}' accepted, diff {}",
            elapsed.as_millis(),
            worker_name,
            difficulty
        );
        self.workers.lock().entry(worker_name.to_string()).or_default().accepted += 1;
        self.spawn_sharenotify(worker_name, job_id, difficulty);
    }

    pub fn share_rejected(&self, worker_name: &str, reason: &str, elapsed: Duration) {
        warn!("[{}ms] share from '{}' REJECTED: {}", elapsed.as_millis(), worker_name, reason);
        self.workers.lock().entry(worker_name.to_string()).or_default().rejected += 1;
    }

    pub fn worker(&self, worker_name: &str) -> WorkerStats {
        self.workers.lock().get(worker_name).cloned().unwrap_or_default()
    }

    fn spawn_sharenotify(&self, worker_name: &str, job_id: &str, difficulty: f64) {
        if let Some(cmd) = &self.sharenotify_cmd {
            let spawned = tokio::process::Command::new(cmd)
                .arg(worker_name)
                .arg(job_id)
                .arg(difficulty.to_string())
                .spawn();
            if let Err(err) = spawned {
                warn!("cannot spawn sharenotify command {cmd}: {err}");
            }
        }
    }

    /// Periodic one-line share summary for the console.
    pub fn start_print_thread(self: Arc<Self>) {
        let stats = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_PRINT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would print an empty table.
            interval.tick().await;
            loop {
                interval.tick().await;
                let workers = stats.workers.lock().clone();
                if workers.is_empty() {
                    continue;
                }
                let (mut accepted, mut rejected) = (0u64, 0u64);
                for s in workers.values() {
                    accepted += s.accepted;
                    rejected += s.rejected;
                }
                info!("shares: {accepted} accepted / {rejected} rejected across {} workers", workers.len());
            }
        });
    }

}
