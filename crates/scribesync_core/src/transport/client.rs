//! The reconnecting WebSocket client: connection lifecycle, subscription
//! replay, and the FIFO pending queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use indexmap::IndexSet;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::codec;
use crate::error::{Result, SyncCoreError};
use crate::transport::frame::{Frame, FrameType};
use crate::types::{ConnectionState, NoteMetadataUpdate};

/// Reconnect backoff policy. Defaults match the spec's stated behaviour:
/// 1000 ms base delay, doubling per attempt, up to 10 attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(1000),
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        Duration::from_millis(millis)
    }
}

/// Receives events the transport fires as frames arrive or the connection
/// state changes.
pub trait SyncTransportObserver: Send + Sync {
    /// A frame was received and is not one the transport consumed itself.
    fn on_frame(&self, frame: Frame);
    /// The connection's lifecycle state changed.
    fn on_state_change(&self, state: ConnectionState) {
        let _ = state;
    }
    /// A transport-layer error occurred (send/recv/connect failure).
    fn on_sync_error(&self, error: SyncCoreError) {
        let _ = error;
    }
}

/// Everything a `sync_request` frame needs, assembled by the caller (the
/// coordinator, via the Document Manager) before being handed to the
/// transport.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncRequestPayload {
    pub state_vectors: HashMap<String, String>,
    pub updates: HashMap<String, String>,
    pub metadata: Vec<NoteMetadataUpdate>,
}

enum Outbound {
    Frame(Frame),
    Close,
}

/// A reconnecting, single-endpoint full-duplex streaming sync channel.
pub struct SyncTransport {
    server_url: String,
    token: String,
    state: Arc<RwLock<ConnectionState>>,
    subscriptions: Arc<RwLock<IndexSet<String>>>,
    pending: Arc<RwLock<VecDeque<Frame>>>,
    observer: Arc<RwLock<Option<Arc<dyn SyncTransportObserver>>>>,
    reconnect: ReconnectConfig,
    outbound_tx: RwLock<Option<mpsc::UnboundedSender<Outbound>>>,
    generation: Arc<AtomicU32>,
    syncing: AtomicBool,
}

impl SyncTransport {
    /// Construct a transport targeting `server_url` (scheme `ws`/`wss`,
    /// without the `token` query parameter, which is appended on connect).
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            subscriptions: Arc::new(RwLock::new(IndexSet::new())),
            pending: Arc::new(RwLock::new(VecDeque::new())),
            observer: Arc::new(RwLock::new(None)),
            reconnect: ReconnectConfig::default(),
            outbound_tx: RwLock::new(None),
            generation: Arc::new(AtomicU32::new(0)),
            syncing: AtomicBool::new(false),
        }
    }

    /// Override the default reconnect policy.
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Install the observer that receives frames, state changes, and
    /// errors.
    pub fn set_observer(&self, observer: Arc<dyn SyncTransportObserver>) {
        *self.observer.write().expect("lock poisoned") = Some(observer);
    }

    /// Current connection lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.read().expect("lock poisoned").clone()
    }

    /// Frames currently queued for the next reconnect, in FIFO order. Mainly
    /// useful for tests asserting something got enqueued rather than
    /// silently dropped.
    pub fn pending_frames(&self) -> Vec<Frame> {
        self.pending.read().expect("lock poisoned").iter().cloned().collect()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().expect("lock poisoned") = state.clone();
        if let Some(observer) = self.observer.read().expect("lock poisoned").as_ref() {
            observer.on_state_change(state);
        }
    }

    fn build_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| SyncCoreError::network(format!("invalid server url: {e}")))?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }

    /// Open the connection. Idempotent: a second call while connected or
    /// connecting is a no-op.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Syncing => return Ok(()),
            _ => {}
        }
        self.spawn_connection(0)
    }

    fn spawn_connection(self: &Arc<Self>, attempt: u32) -> Result<()> {
        let url = self.build_url()?;
        let my_generation = self.generation.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound_tx.write().expect("lock poisoned") = Some(tx);
        self.set_state(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting { attempt }
        });

        let this = self.clone();
        tokio::spawn(async move {
            this.run_connection(url, rx, my_generation, attempt).await;
        });
        Ok(())
    }

    async fn run_connection(
        self: Arc<Self>,
        url: Url,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        my_generation: u32,
        attempt: u32,
    ) {
        let (ws_stream, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                self.notify_error(SyncCoreError::network(format!("connect failed: {e}")));
                self.schedule_reconnect(attempt + 1);
                return;
            }
        };
        if self.generation.load(Ordering::SeqCst) != my_generation {
            return;
        }

        let (mut write, mut read) = ws_stream.split();
        self.set_state(ConnectionState::Connected);
        self.replay_subscriptions_and_pending(&mut write).await;

        loop {
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_incoming_text(&text),
                        Some(Ok(Message::Binary(_))) => {
                            // The protocol is JSON-only; binary frames are not part
                            // of the closed set and are ignored like any other
                            // unrecognised input.
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let clean = frame.as_ref().map(|f| f.code == CloseCode::Normal).unwrap_or(false);
                            self.on_socket_closed(clean, attempt);
                            return;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            self.notify_error(SyncCoreError::network(format!("socket error: {e}")));
                            self.on_socket_closed(false, attempt);
                            return;
                        }
                        None => {
                            self.on_socket_closed(false, attempt);
                            return;
                        }
                    }
                }
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(Outbound::Frame(frame)) => {
                            if let Err(e) = send_frame(&mut write, &frame).await {
                                self.notify_error(e);
                            }
                        }
                        Some(Outbound::Close) => {
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "client disconnect".into(),
                                })))
                                .await;
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn replay_subscriptions_and_pending(
        &self,
        write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
                  + Unpin),
    ) {
        let subs: Vec<String> = self
            .subscriptions
            .read()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect();
        for note_id in subs {
            let _ = send_frame(write, &Frame::subscribe(note_id)).await;
        }
        let drained: Vec<Frame> = self.pending.write().expect("lock poisoned").drain(..).collect();
        for frame in drained {
            let _ = send_frame(write, &frame).await;
        }
    }

    fn handle_incoming_text(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("dropping malformed sync frame: {e}");
                return;
            }
        };
        if frame.frame_type == FrameType::Awareness || frame.frame_type == FrameType::Other {
            return;
        }
        if frame.frame_type == FrameType::SyncResponse {
            self.syncing.store(false, Ordering::SeqCst);
            self.set_state(ConnectionState::Connected);
        }
        if let Some(observer) = self.observer.read().expect("lock poisoned").as_ref() {
            observer.on_frame(frame);
        }
    }

    fn on_socket_closed(self: &Arc<Self>, clean: bool, attempt: u32) {
        self.syncing.store(false, Ordering::SeqCst);
        if clean {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        self.schedule_reconnect(attempt + 1);
    }

    fn schedule_reconnect(self: &Arc<Self>, next_attempt: u32) {
        if !self.reconnect.enabled || next_attempt > self.reconnect.max_attempts {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        self.set_state(ConnectionState::Reconnecting {
            attempt: next_attempt,
        });
        let delay = self.reconnect.delay_for_attempt(next_attempt - 1);
        let this = self.clone();
        let generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let _ = this.spawn_connection(next_attempt);
        });
    }

    fn notify_error(&self, error: SyncCoreError) {
        log::warn!("sync transport error: {error}");
        if let Some(observer) = self.observer.read().expect("lock poisoned").as_ref() {
            observer.on_sync_error(error);
        }
    }

    /// Close cleanly (code 1000), cancelling any scheduled reconnect. The
    /// pending queue is *not* cleared: it survives to be drained on the
    /// next connect.
    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.outbound_tx.read().expect("lock poisoned").as_ref() {
            let _ = tx.send(Outbound::Close);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Add `note_id` to the subscription set and, if connected, send a
    /// `subscribe` frame immediately. The set itself (not the pending
    /// queue) is what gets replayed on reconnect, so this never enqueues.
    pub fn subscribe(&self, note_id: impl Into<String>) {
        let note_id = note_id.into();
        self.subscriptions.write().expect("lock poisoned").insert(note_id.clone());
        self.send_if_connected(Frame::subscribe(note_id));
    }

    /// Remove `note_id` from the subscription set and, if connected, send
    /// an `unsubscribe` frame immediately. Never enqueues: there is nothing
    /// to replay for a note no longer in the subscription set.
    pub fn unsubscribe(&self, note_id: impl Into<String>) {
        let note_id = note_id.into();
        self.subscriptions.write().expect("lock poisoned").shift_remove(&note_id);
        self.send_if_connected(Frame::unsubscribe(note_id));
    }

    /// Push a CRDT update for `note_id`. Sent immediately if connected,
    /// otherwise queued for the next reconnect.
    pub fn push_update(&self, note_id: impl Into<String>, update: &[u8]) {
        self.send_or_enqueue(Frame::update(note_id, codec::to_base64(update)));
    }

    /// Push a metadata change. Sent immediately if connected, otherwise
    /// queued for the next reconnect.
    pub fn push_metadata(&self, update: &NoteMetadataUpdate) {
        let payload = serde_json::to_string(update).unwrap_or_default();
        self.send_or_enqueue(Frame::note_metadata(update.id.clone(), payload));
    }

    /// Send one `sync_request` frame built from an already-prepared payload.
    /// Fails if a sync is already in flight.
    pub fn request_sync(&self, payload: SyncRequestPayload) -> Result<()> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Err(SyncCoreError::invariant("a sync request is already in flight"));
        }
        let json = serde_json::to_string(&payload)
            .map_err(|e| SyncCoreError::protocol(format!("failed to serialize request: {e}")))?;
        self.set_state(ConnectionState::Syncing);
        self.send_or_enqueue(Frame::sync_request(json));
        Ok(())
    }

    /// Send `frame` immediately if connected; otherwise drop it. Used for
    /// subscribe/unsubscribe, whose durable record is the subscription set
    /// (replayed wholesale on reconnect), not the pending queue.
    fn send_if_connected(&self, frame: Frame) {
        let connected = matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Syncing
        );
        if connected {
            if let Some(tx) = self.outbound_tx.read().expect("lock poisoned").as_ref() {
                let _ = tx.send(Outbound::Frame(frame));
            }
        }
    }

    fn send_or_enqueue(&self, frame: Frame) {
        let connected = matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Syncing
        );
        if connected {
            if let Some(tx) = self.outbound_tx.read().expect("lock poisoned").as_ref() {
                match tx.send(Outbound::Frame(frame)) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(Outbound::Frame(frame))) => {
                        self.pending.write().expect("lock poisoned").push_back(frame);
                        return;
                    }
                    Err(mpsc::error::SendError(_)) => return,
                }
            }
        }
        self.pending.write().expect("lock poisoned").push_back(frame);
    }
}

async fn send_frame(
    write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &Frame,
) -> Result<()> {
    let json = serde_json::to_string(frame)
        .map_err(|e| SyncCoreError::protocol(format!("failed to serialize frame: {e}")))?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| SyncCoreError::network(format!("send failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_doubles_and_is_capped_by_max_attempts() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
    }

    #[test]
    fn fresh_transport_is_disconnected_with_no_pending_frames() {
        let transport = SyncTransport::new("wss://example.test/api/ws", "tok");
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.pending.read().unwrap().is_empty());
    }

    #[test]
    fn subscribe_while_disconnected_joins_the_set_without_enqueuing() {
        let transport = SyncTransport::new("wss://example.test/api/ws", "tok");
        transport.subscribe("n1");
        assert!(transport.subscriptions.read().unwrap().contains("n1"));
        assert!(transport.pending.read().unwrap().is_empty());
    }

    #[test]
    fn pending_updates_preserve_fifo_order() {
        let transport = SyncTransport::new("wss://example.test/api/ws", "tok");
        transport.push_update("n1", b"m1");
        transport.push_update("n1", b"m2");
        let pending = transport.pending.read().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload, Some(codec::to_base64(b"m1")));
        assert_eq!(pending[1].payload, Some(codec::to_base64(b"m2")));
    }
}
