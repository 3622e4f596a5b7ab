//! Upstream pool session: one TCP connection speaking newline-delimited
//! JSON-RPC, with automatic resubscription, an inactivity watchdog, backup
//! failover, and control-file driven pool switching.

use crate::constants::{
    BACKUP_RETURN_NOTIFICATIONS, DISCONNECT_STRIKES, POOL_INACTIVITY_TIMEOUT, PROXY_VERSION,
    RECONNECT_DELAY,
};
use crate::control_file::ControlFile;
use crate::errors::PoolError;
use crate::jsonrpc_event::{
    marshal_frame, unmarshal_message, JsonRpcEvent, JsonRpcMessage, JsonRpcResponse, StratumMethod,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use triggered::{trigger, Listener, Trigger};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PoolEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Static session options.
pub struct PoolOptions {
    pub main: PoolEndpoint,
    pub backup: Option<PoolEndpoint>,
    pub socks: Option<PoolEndpoint>,
    pub custom_user: Option<String>,
    pub custom_password: String,
    /// Issue `mining.extranonce.subscribe` after subscribing.
    pub subscribe_extranonce: bool,
    /// Retry forever instead of exiting after repeated dead connections.
    pub idle: bool,
    pub control_file: Option<ControlFile>,
}

/// Callbacks the session raises into the rest of the proxy. The session
/// itself answers `client.*` housekeeping; everything that touches the
/// registry or downstream miners goes through here.
#[async_trait::async_trait]
pub trait PoolEvents: Send + Sync {
    async fn on_connected(&self);
    async fn on_disconnected(&self);
    async fn on_notify(&self, params: &[Value]);
    async fn on_set_difficulty(&self, difficulty: f64);
    async fn on_set_extranonce(&self, extranonce1: &str, extranonce2_size: usize);
}

/// The seam downstream submit paths use, cut so tests can script the pool
/// side.
#[async_trait::async_trait]
pub trait SubmitUpstream: Send + Sync {
    async fn rpc(&self, method: &str, params: Vec<Value>) -> Result<Value, PoolError>;
}

struct SessionState {
    current: PoolEndpoint,
    backup: Option<PoolEndpoint>,
    is_backup_active: bool,
    backup_return_counter: u32,
    controlled_disconnect: bool,
    reconnect_wait: Option<u64>,
    custom_user: Option<String>,
    custom_password: String,
    strikes: u32,
    conn_abort: Option<Trigger>,
}

pub struct PoolApi {
    state: Mutex<SessionState>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, PoolError>>>>,
    next_id: AtomicU64,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    subscribed: watch::Sender<bool>,
    socks: Option<PoolEndpoint>,
    subscribe_extranonce: bool,
    idle: bool,
    control_file: Option<ControlFile>,
    shutdown: Listener,
}

impl PoolApi {
    pub fn new(options: PoolOptions, shutdown: Listener) -> Arc<Self> {
        let (subscribed, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(SessionState {
                current: options.main,
                backup: options.backup,
                is_backup_active: false,
                backup_return_counter: 0,
                controlled_disconnect: false,
                reconnect_wait: None,
                custom_user: options.custom_user,
                custom_password: options.custom_password,
                strikes: DISCONNECT_STRIKES,
                conn_abort: None,
            }),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            writer: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            subscribed,
            socks: options.socks,
            subscribe_extranonce: options.subscribe_extranonce,
            idle: options.idle,
            control_file: options.control_file,
            shutdown,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Suspend until the upstream subscription completed (or return
    /// immediately when it already has).
    pub async fn wait_subscribed(&self) {
        let mut rx = self.subscribed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The worker name submits go out under, honoring `--custom-user` and
    /// control-file overrides.
    pub fn submit_identity(&self, worker_name: &str) -> String {
        let state = self.state.lock();
        match &state.custom_user {
            Some(user) => user.clone(),
            None => worker_name.to_string(),
        }
    }

    pub fn custom_user(&self) -> Option<(String, String)> {
        let state = self.state.lock();
        state.custom_user.as_ref().map(|u| (u.clone(), state.custom_password.clone()))
    }

    /// Issue a JSON-RPC request and suspend until the matching response.
    pub async fn rpc(&self, method: &str, params: Vec<Value>) -> Result<Value, PoolError> {
        if !self.is_connected() {
            return Err(PoolError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = marshal_frame(&JsonRpcEvent::request(id, method, params))
            .map_err(|e| PoolError::Protocol(e.to_string()))?;
        if self.write_frame(&frame).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(PoolError::Disconnected);
        }

        // The sender is dropped (or explicitly failed) when the connection
        // goes down, so this cannot hang on a dead socket.
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Disconnected),
        }
    }

    /// Tear down the current socket and reconnect, optionally to a new
    /// endpoint, after an optional delay. Fall-through semantics: omitted
    /// parts keep their current values.
    pub async fn reconnect(&self, host: Option<String>, port: Option<u16>, wait: Option<u64>) {
        {
            let mut state = self.state.lock();
            if let Some(host) = host {
                state.current.host = host;
            }
            if let Some(port) = port {
                state.current.port = port;
            }
            state.controlled_disconnect = true;
            state.reconnect_wait = wait;
            info!("reconnecting to {}", state.current);
        }
        self.drop_connection().await;
    }

    /// Update credentials from the control file.
    pub fn set_credentials(&self, user: String, password: String) {
        let mut state = self.state.lock();
        state.custom_user = Some(user);
        state.custom_password = password;
    }

    async fn drop_connection(&self) {
        let abort = self.state.lock().conn_abort.take();
        if let Some(abort) = abort {
            abort.trigger();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write_frame(&self, frame: &str) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.write_all(frame.as_bytes()).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "socket down")),
        }
    }

    async fn connect(&self, endpoint: &PoolEndpoint) -> std::io::Result<TcpStream> {
        match &self.socks {
            None => TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await,
            Some(proxy) => {
                let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
                socks5_connect(&mut stream, &endpoint.host, endpoint.port).await?;
                Ok(stream)
            }
        }
    }

    /// Session driver. Runs until shutdown; owns connect, teardown, strike
    /// accounting and backup failover.
    pub async fn run(self: Arc<Self>, events: Arc<dyn PoolEvents>) {
        loop {
            if self.shutdown.clone().now_or_never().is_some() {
                break;
            }

            let endpoint = self.state.lock().current.clone();
            info!("trying to connect to stratum pool at {endpoint}");

            let got_frame = match self.connect(&endpoint).await {
                Ok(stream) => {
                    info!("connected to stratum pool at {endpoint}");
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = Some(write_half);
                    self.connected.store(true, Ordering::Release);

                    let abort_listener = {
                        let (abort, listener) = trigger();
                        self.state.lock().conn_abort = Some(abort);
                        listener
                    };

                    // The handshake runs concurrently with the read loop;
                    // its responses arrive through the pending map.
                    let session = Arc::clone(&self);
                    let handshake_events = Arc::clone(&events);
                    tokio::spawn(async move { session.on_connect(handshake_events).await });

                    let got_frame = self.read_loop(read_half, &events, abort_listener).await;

                    self.connected.store(false, Ordering::Release);
                    self.subscribed.send_replace(false);
                    self.state.lock().conn_abort = None;
                    if let Some(mut writer) = self.writer.lock().await.take() {
                        let _ = writer.shutdown().await;
                    }
                    self.fail_pending();
                    events.on_disconnected().await;
                    info!("disconnected from stratum pool at {endpoint}");
                    got_frame
                }
                Err(err) => {
                    warn!("connection to {endpoint} failed: {err}");
                    false
                }
            };

            let wait = {
                let mut state = self.state.lock();
                let controlled = std::mem::take(&mut state.controlled_disconnect);

                if !controlled {
                    if got_frame {
                        state.strikes = DISCONNECT_STRIKES;
                    } else {
                        state.strikes = state.strikes.saturating_sub(1);
                        if state.strikes == 0 && !self.idle {
                            error!("upstream pool is dead, giving up; restart the proxy when the pool is back");
                            std::process::exit(1);
                        }
                    }

                    // Uncontrolled drop with a backup configured: swap over.
                    if state.backup.is_some() {
                        let backup = state.backup.take().unwrap();
                        let old = std::mem::replace(&mut state.current, backup);
                        state.backup = Some(old);
                        state.is_backup_active = !state.is_backup_active;
                        if state.is_backup_active {
                            state.backup_return_counter = BACKUP_RETURN_NOTIFICATIONS;
                            warn!("failing over to backup pool {}", state.current);
                        } else {
                            info!("returning to primary pool {}", state.current);
                        }
                    }
                }

                state.reconnect_wait.take().map(Duration::from_secs).unwrap_or(RECONNECT_DELAY)
            };

            tokio::select! {
                _ = self.shutdown.clone() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Post-connect handshake: subscribe, optionally announce extranonce
    /// support, eagerly authorize the custom user.
    async fn on_connect(self: Arc<Self>, events: Arc<dyn PoolEvents>) {
        info!("subscribing for mining jobs");
        let result = match self.rpc("mining.subscribe", vec![]).await {
            Ok(result) => result,
            Err(err) => {
                warn!("mining.subscribe failed: {err}");
                self.drop_connection().await;
                return;
            }
        };

        let parsed = result.as_array().and_then(|arr| {
            let extranonce1 = arr.get(1)?.as_str()?.to_string();
            let extranonce2_size = arr.get(2)?.as_u64()? as usize;
            Some((extranonce1, extranonce2_size))
        });
        let (extranonce1, extranonce2_size) = match parsed {
            Some(parts) => parts,
            None => {
                warn!("malformed mining.subscribe response: {result}");
                self.drop_connection().await;
                return;
            }
        };
        events.on_set_extranonce(&extranonce1, extranonce2_size).await;

        if self.subscribe_extranonce {
            if let Err(err) = self.rpc("mining.extranonce.subscribe", vec![]).await {
                warn!("mining.extranonce.subscribe failed: {err}");
            }
        }

        if let Some((user, password)) = self.custom_user() {
            info!("authorizing custom user {user}");
            match self.rpc("mining.authorize", vec![json!(user), json!(password)]).await {
                Ok(Value::Bool(true)) => {}
                Ok(other) => warn!("custom user authorization refused: {other}"),
                Err(err) => warn!("custom user authorization failed: {err}"),
            }
        }

        self.subscribed.send_replace(true);
        events.on_connected().await;
    }

    /// Read frames until the connection dies, the watchdog fires, or the
    /// session aborts it. Returns whether any frame arrived.
    async fn read_loop(
        &self,
        read_half: OwnedReadHalf,
        events: &Arc<dyn PoolEvents>,
        abort: Listener,
    ) -> bool {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let mut got_frame = false;

        loop {
            line.clear();
            let read = tokio::select! {
                _ = abort.clone() => break,
                _ = self.shutdown.clone() => break,
                read = tokio::time::timeout(POOL_INACTIVITY_TIMEOUT, reader.read_line(&mut line)) => read,
            };

            match read {
                // Watchdog: no complete frame for the whole window.
                Err(_) => {
                    error!("connection to upstream pool timed out");
                    break;
                }
                Ok(Ok(0)) => {
                    debug!("upstream closed the connection");
                    break;
                }
                Ok(Ok(_)) => {
                    got_frame = true;
                    let frame = line.trim();
                    if frame.is_empty() {
                        continue;
                    }
                    match unmarshal_message(frame) {
                        Ok(JsonRpcMessage::Response(response)) => self.resolve_pending(response),
                        Ok(JsonRpcMessage::Event(event)) => self.dispatch_event(event, events).await,
                        Err(err) => warn!("unparsable frame from pool: {err} ({frame})"),
                    }
                }
                Ok(Err(err)) => {
                    warn!("error reading from pool: {err}");
                    break;
                }
            }
        }

        got_frame
    }

    fn resolve_pending(&self, response: JsonRpcResponse) {
        let id = match response.id.as_ref().and_then(Value::as_u64) {
            Some(id) => id,
            None => {
                warn!("response with unusable id from pool: {:?}", response.id);
                return;
            }
        };
        let Some(tx) = self.pending.lock().remove(&id) else {
            debug!("response for unknown call id {id}");
            return;
        };
        let outcome = match response.error_parts() {
            Some((code, message)) => Err(PoolError::Rpc { code, message }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }

    fn fail_pending(&self) {
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(PoolError::Disconnected));
        }
    }

    /// Inbound requests and notifications from the pool.
    async fn dispatch_event(&self, event: JsonRpcEvent, events: &Arc<dyn PoolEvents>) {
        let mut reply: Option<Value> = None;

        match event.method_enum() {
            StratumMethod::Notify => {
                self.note_notify().await;
                events.on_notify(&event.params).await;
            }
            StratumMethod::SetDifficulty => match parse_difficulty(event.params.first()) {
                Some(difficulty) => {
                    info!("setting new difficulty: {difficulty}");
                    events.on_set_difficulty(difficulty).await;
                }
                None => warn!("mining.set_difficulty with unusable params: {:?}", event.params),
            },
            StratumMethod::SetExtranonce => {
                let parsed = event.params.first().and_then(Value::as_str).zip(
                    event.params.get(1).and_then(Value::as_u64),
                );
                match parsed {
                    Some((extranonce1, size)) => {
                        info!("pool changed extranonce (size {size})");
                        events.on_set_extranonce(extranonce1, size as usize).await;
                    }
                    None => warn!("mining.set_extranonce with unusable params: {:?}", event.params),
                }
            }
            StratumMethod::ClientReconnect => {
                // Pools have been seen sending junk here; accept only a
                // plausible hostname and port.
                let host = event
                    .params
                    .first()
                    .and_then(Value::as_str)
                    .filter(|h| h.len() > 6)
                    .map(str::to_string);
                let port = event
                    .params
                    .get(1)
                    .and_then(Value::as_u64)
                    .filter(|&p| p > 2 && p <= u16::MAX as u64)
                    .map(|p| p as u16);
                let wait = event.params.get(2).and_then(Value::as_u64);
                info!("pool asked us to reconnect");
                self.reconnect(host, port, wait).await;
                reply = Some(Value::Bool(true));
            }
            StratumMethod::ClientGetVersion => reply = Some(json!(PROXY_VERSION)),
            StratumMethod::ClientShowMessage => {
                let message = event.params.first().and_then(Value::as_str).unwrap_or("");
                warn!("MESSAGE FROM THE SERVER OPERATOR: {message}");
                reply = Some(Value::Bool(true));
            }
            StratumMethod::ClientAddPeers => reply = Some(Value::Bool(false)),
            StratumMethod::GetHashrate | StratumMethod::GetTemperature => reply = Some(json!({})),
            other => error!("unhandled method {other:?} with params {:?}", event.params),
        }

        if !event.is_notification() {
            let response = JsonRpcResponse::success(event.id.clone(), reply.unwrap_or(Value::Null));
            if let Ok(frame) = marshal_frame(&response) {
                let _ = self.write_frame(&frame).await;
            }
        }
    }

    /// Per-notify bookkeeping: backup try-return countdown and the control
    /// file cadence.
    async fn note_notify(&self) {
        let return_home = {
            let mut state = self.state.lock();
            if state.is_backup_active {
                state.backup_return_counter = state.backup_return_counter.saturating_sub(1);
                state.backup_return_counter == 0
            } else {
                false
            }
        };
        if return_home {
            info!("trying to return to the primary pool");
            {
                let mut state = self.state.lock();
                state.is_backup_active = false;
                if let Some(backup) = state.backup.take() {
                    let old = std::mem::replace(&mut state.current, backup);
                    state.backup = Some(old);
                }
                // Controlled, so the swap in run() doesn't bounce us back.
                state.controlled_disconnect = true;
            }
            self.drop_connection().await;
            return;
        }

        if let Some(control_file) = &self.control_file {
            if let Some(entry) = control_file.poll() {
                if let Some((user, pass)) = entry.credentials.clone() {
                    self.set_credentials(user, pass);
                }
                let differs = {
                    let state = self.state.lock();
                    state.current.host != entry.host || state.current.port != entry.port
                };
                if differs {
                    info!(
                        "found new pool configuration in control file, reconnecting to {}:{}",
                        entry.host, entry.port
                    );
                    self.reconnect(Some(entry.host), Some(entry.port), None).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl SubmitUpstream for PoolApi {
    async fn rpc(&self, method: &str, params: Vec<Value>) -> Result<Value, PoolError> {
        PoolApi::rpc(self, method, params).await
    }
}

fn parse_difficulty(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Minimal SOCKS5 CONNECT (no authentication), enough for the classic
/// `--socks 127.0.0.1:9050` Tor setup.
async fn socks5_connect(stream: &mut TcpStream, host: &str, port: u16) -> std::io::Result<()> {
    use std::io::{Error, ErrorKind};

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [0x05, 0x00] {
        return Err(Error::new(ErrorKind::ConnectionRefused, "socks5 proxy requires authentication"));
    }

    if host.len() > 255 {
        return Err(Error::new(ErrorKind::InvalidInput, "hostname too long for socks5"));
    }
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::new(ErrorKind::ConnectionRefused, format!("socks5 connect failed ({})", reply[1])));
    }
    // Drain the bound address, which varies by address type.
    let skip = match reply[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        _ => return Err(Error::new(ErrorKind::InvalidData, "bad socks5 address type")),
    };
    let mut sink = vec![0u8; skip];
    stream.read_exact(&mut sink).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    struct RecordingEvents {
        difficulties: Mutex<Vec<f64>>,
        extranonces: Mutex<Vec<(String, usize)>>,
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl RecordingEvents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                difficulties: Mutex::new(Vec::new()),
                extranonces: Mutex::new(Vec::new()),
                connected: AtomicUsize::new(0),
                disconnected: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl PoolEvents for RecordingEvents {
        async fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_notify(&self, _params: &[Value]) {}
        async fn on_set_difficulty(&self, difficulty: f64) {
            self.difficulties.lock().push(difficulty);
        }
        async fn on_set_extranonce(&self, extranonce1: &str, extranonce2_size: usize) {
            self.extranonces.lock().push((extranonce1.to_string(), extranonce2_size));
        }
    }

    fn options(port: u16) -> PoolOptions {
        PoolOptions {
            main: PoolEndpoint { host: "127.0.0.1".to_string(), port },
            backup: None,
            socks: None,
            custom_user: None,
            custom_password: String::new(),
            subscribe_extranonce: false,
            idle: true,
            control_file: None,
        }
    }

    /// A scripted pool: answers subscribe, then runs the provided script.
    async fn fake_pool<F, Fut>(listener: TcpListener, script: F)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let event: JsonRpcEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(event.method, "mining.subscribe");
        let response = format!(
            r#"{{"id":{},"result":[[],"a0014b",4],"error":null}}"#,
            event.id.unwrap()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        script(stream).await;
    }

    #[tokio::test]
    async fn subscribe_handshake_sets_extranonce_and_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_pool(listener, |stream| async move {
            // Hold the connection open briefly.
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(stream);
        }));

        let (_shutdown, shutdown_listener) = trigger();
        let api = PoolApi::new(options(port), shutdown_listener);
        let events = RecordingEvents::new();
        let runner = tokio::spawn(Arc::clone(&api).run(events.clone()));

        api.wait_subscribed().await;
        assert!(api.is_connected());
        assert_eq!(events.extranonces.lock().as_slice(), &[("a0014b".to_string(), 4)]);
        assert_eq!(events.connected.load(Ordering::SeqCst), 1);

        runner.abort();
    }

    #[tokio::test]
    async fn notifications_are_dispatched() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_pool(listener, |mut stream| async move {
            stream
                .write_all(b"{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[16]}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }));

        let (_shutdown, shutdown_listener) = trigger();
        let api = PoolApi::new(options(port), shutdown_listener);
        let events = RecordingEvents::new();
        let runner = tokio::spawn(Arc::clone(&api).run(events.clone()));

        api.wait_subscribed().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while events.difficulties.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(events.difficulties.lock().as_slice(), &[16.0]);

        runner.abort();
    }

    #[tokio::test]
    async fn rpc_roundtrip_and_error_mapping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_pool(listener, |mut stream| async move {
            let mut reader = BufReader::new(&mut stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let event: JsonRpcEvent = serde_json::from_str(&line).unwrap();
            assert_eq!(event.method, "mining.submit");
            let id = event.id.unwrap();
            let ok = format!("{{\"id\":{id},\"result\":true,\"error\":null}}\n");
            stream.write_all(ok.as_bytes()).await.unwrap();

            line.clear();
            let mut reader = BufReader::new(&mut stream);
            reader.read_line(&mut line).await.unwrap();
            let event: JsonRpcEvent = serde_json::from_str(&line).unwrap();
            let id = event.id.unwrap();
            let err = format!("{{\"id\":{id},\"result\":null,\"error\":[23,\"low difficulty\",null]}}\n");
            stream.write_all(err.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }));

        let (_shutdown, shutdown_listener) = trigger();
        let api = PoolApi::new(options(port), shutdown_listener);
        let runner = tokio::spawn(Arc::clone(&api).run(RecordingEvents::new()));
        api.wait_subscribed().await;

        let result = api.rpc("mining.submit", vec![json!("w"), json!("j")]).await.unwrap();
        assert_eq!(result, json!(true));

        let err = api.rpc("mining.submit", vec![json!("w"), json!("j")]).await.unwrap_err();
        match err {
            PoolError::Rpc { code, message } => {
                assert_eq!(code, 23);
                assert_eq!(message, "low difficulty");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }

        runner.abort();
    }

    #[tokio::test]
    async fn disconnect_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_pool(listener, |mut stream| async move {
            // Swallow the submit and cut the line without answering.
            let mut reader = BufReader::new(&mut stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            drop(stream);
        }));

        let (_shutdown, shutdown_listener) = trigger();
        let api = PoolApi::new(options(port), shutdown_listener);
        let events = RecordingEvents::new();
        let runner = tokio::spawn(Arc::clone(&api).run(events.clone()));
        api.wait_subscribed().await;

        let err = api.rpc("mining.submit", vec![]).await.unwrap_err();
        assert!(matches!(err, PoolError::Disconnected));

        // The teardown raises the disconnect event for the fan-out side.
        tokio::time::timeout(Duration::from_secs(1), async {
            while events.disconnected.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        runner.abort();
    }

    #[tokio::test]
    async fn rpc_while_down_fails_fast() {
        let (_shutdown, shutdown_listener) = trigger();
        let api = PoolApi::new(options(1), shutdown_listener);
        let err = api.rpc("mining.submit", vec![]).await.unwrap_err();
        assert!(matches!(err, PoolError::Disconnected));
    }
}
