//! Per-connection state for a downstream stratum miner.

use crate::extranonce::Tail;
use crate::jsonrpc_event::{marshal_frame, JsonRpcEvent, JsonRpcResponse};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;
use triggered::{trigger, Listener, Trigger};

/// Writes failed because the miner is gone.
#[derive(Debug, thiserror::Error)]
#[error("disconnecting")]
pub struct ErrorDisconnected;

pub struct StratumContext {
    pub id: u64,
    pub remote_addr: SocketAddr,
    tail: Mutex<Option<Tail>>,
    authorized_workers: Mutex<HashSet<String>>,
    disconnecting: AtomicBool,
    abort: Trigger,
    abort_listener: Listener,
    write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl StratumContext {
    pub fn new(id: u64, remote_addr: SocketAddr, write_half: OwnedWriteHalf) -> Arc<Self> {
        let (abort, abort_listener) = trigger();
        Arc::new(Self {
            id,
            remote_addr,
            tail: Mutex::new(None),
            authorized_workers: Mutex::new(HashSet::new()),
            disconnecting: AtomicBool::new(false),
            abort,
            abort_listener,
            write_half: tokio::sync::Mutex::new(Some(write_half)),
        })
    }

    pub fn connected(&self) -> bool {
        !self.disconnecting.load(Ordering::Acquire)
    }

    /// Resolves when the connection is told to die; the read loop selects
    /// on it so `disconnect` cuts even an idle miner loose.
    pub fn aborted(&self) -> Listener {
        self.abort_listener.clone()
    }

    /// The extranonce tail assigned on subscribe; `None` before that.
    pub fn tail(&self) -> Option<Tail> {
        self.tail.lock().clone()
    }

    pub fn set_tail(&self, tail: Tail) {
        *self.tail.lock() = Some(tail);
    }

    pub fn is_subscribed(&self) -> bool {
        self.tail.lock().is_some()
    }

    pub fn note_authorized(&self, worker_name: &str) {
        self.authorized_workers.lock().insert(worker_name.to_string());
    }

    pub fn authorized_workers(&self) -> Vec<String> {
        self.authorized_workers.lock().iter().cloned().collect()
    }

    /// Answer a request.
    pub async fn reply(&self, response: JsonRpcResponse) -> Result<(), ErrorDisconnected> {
        let frame = marshal_frame(&response).map_err(|_| ErrorDisconnected)?;
        self.write_frame(&frame).await
    }

    /// Push a notification (no id) to the miner.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), ErrorDisconnected> {
        let event = JsonRpcEvent {
            id: Some(Value::Null),
            method: method.to_string(),
            params,
        };
        let frame = marshal_frame(&event).map_err(|_| ErrorDisconnected)?;
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &str) -> Result<(), ErrorDisconnected> {
        if !self.connected() {
            return Err(ErrorDisconnected);
        }
        let mut guard = self.write_half.lock().await;
        let writer = guard.as_mut().ok_or(ErrorDisconnected)?;
        writer.write_all(frame.as_bytes()).await.map_err(|_| ErrorDisconnected)
    }

    /// Flush what we can and close the write side; called by the read loop
    /// on its way out.
    pub async fn close_writer(&self) {
        if let Some(mut writer) = self.write_half.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Mark the connection dead and wake its read loop. Idempotent.
    pub fn disconnect(&self) {
        if !self.disconnecting.swap(true, Ordering::AcqRel) {
            debug!("disconnecting client {}", self.remote_addr);
            self.abort.trigger();
        }
    }
}
