//! The Sync Coordinator: orchestrates full and incremental sync, applies
//! server responses, and reconciles notes against local state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::codec;
use crate::crdt::{DocumentManager, DocumentManagerObserver};
use crate::error::{Result, SyncCoreError};
use crate::http::SyncHttpClient;
use crate::persistence::LocalPersistencePort;
use crate::transport::{Frame, FrameType, SyncRequestPayload, SyncTransport, SyncTransportObserver};
use crate::types::{
    ConnectionState, CrdtSyncRequest, CrdtSyncResponse, FolderFilter, Note, NoteMetadataUpdate,
    SyncState, SyncStatus, UpdateOrigin,
};

/// An empty `yrs` document still encodes to a small non-zero marker;
/// callers deciding whether to transmit a state must compare against this
/// floor, not zero.
const EMPTY_STATE_FLOOR: usize = 2;

/// Default minimum elapsed time between the start of two sync cycles.
pub const DEFAULT_SYNC_DEBOUNCE: Duration = Duration::from_millis(2000);
/// Default debounce for the content-snapshot write-through timer. Kept
/// deliberately separate from `DEFAULT_SYNC_DEBOUNCE`: one paces network
/// sync cycles, the other paces local preview persistence.
pub const DEFAULT_CONTENT_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Owns the bidirectional sync policy: what to push/pull, when, and how
/// server responses get folded back into local state.
pub struct SyncCoordinator<P: LocalPersistencePort, H: SyncHttpClient> {
    persistence: Arc<P>,
    http: Arc<H>,
    manager: Arc<DocumentManager>,
    transport: RwLock<Option<Arc<SyncTransport>>>,

    status: Mutex<HashMap<String, SyncStatus>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    auth_blocked_token: Mutex<Option<String>>,

    syncing: AtomicBool,
    last_cycle_start: Mutex<Option<Instant>>,
    sync_debounce: Duration,

    content_debounce: Duration,
    content_generations: Arc<Mutex<HashMap<String, u64>>>,
}

impl<P, H> SyncCoordinator<P, H>
where
    P: LocalPersistencePort + 'static,
    H: SyncHttpClient + 'static,
{
    /// Construct a coordinator over a persistence port, an HTTP sync
    /// client, and a document manager. The streaming transport is wired in
    /// separately via [`Self::set_transport`], since it is optional.
    pub fn new(persistence: Arc<P>, http: Arc<H>, manager: Arc<DocumentManager>) -> Arc<Self> {
        Self::with_sync_debounce(persistence, http, manager, DEFAULT_SYNC_DEBOUNCE)
    }

    /// Like [`Self::new`], but with an explicit sync-cycle debounce window
    /// instead of [`DEFAULT_SYNC_DEBOUNCE`]. Mainly useful for tests that
    /// need to drive multiple cycles without waiting out the real window.
    pub fn with_sync_debounce(
        persistence: Arc<P>,
        http: Arc<H>,
        manager: Arc<DocumentManager>,
        sync_debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            http,
            manager,
            transport: RwLock::new(None),
            status: Mutex::new(HashMap::new()),
            last_sync: RwLock::new(None),
            last_error: RwLock::new(None),
            auth_blocked_token: Mutex::new(None),
            syncing: AtomicBool::new(false),
            last_cycle_start: Mutex::new(None),
            sync_debounce,
            content_debounce: DEFAULT_CONTENT_DEBOUNCE,
            content_generations: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Wire in the streaming transport and register this coordinator as
    /// both the document manager's and the transport's observer.
    pub fn attach(self: &Arc<Self>, transport: Arc<SyncTransport>) {
        self.manager.set_observer(self.clone());
        transport.set_observer(self.clone());
        *self.transport.write().expect("lock poisoned") = Some(transport);
    }

    /// Register this coordinator as the document manager's observer
    /// without a streaming transport (HTTP-only full-sync use).
    pub fn attach_manager_only(self: &Arc<Self>) {
        self.manager.set_observer(self.clone());
    }

    fn transport(&self) -> Option<Arc<SyncTransport>> {
        self.transport.read().expect("lock poisoned").clone()
    }

    /// The document manager backing this coordinator.
    pub fn manager(&self) -> &Arc<DocumentManager> {
        &self.manager
    }

    /// The persistence port backing this coordinator.
    pub fn persistence(&self) -> &Arc<P> {
        &self.persistence
    }

    /// The HTTP sync client backing this coordinator's full-sync leg.
    pub fn http(&self) -> &Arc<H> {
        &self.http
    }

    /// Current streaming connection state, or `Disconnected` if no
    /// transport is attached.
    pub fn connection_state(&self) -> ConnectionState {
        self.transport()
            .map(|t| t.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// The `server_time` returned by the last successful full sync.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read().expect("lock poisoned")
    }

    /// The message of the last sync-level error, if any.
    pub fn sync_error(&self) -> Option<String> {
        self.last_error.read().expect("lock poisoned").clone()
    }

    /// Reactive per-note sync status; defaults to `Synced` for unknown ids.
    pub fn sync_status(&self, note_id: &str) -> SyncStatus {
        self.status
            .lock()
            .expect("lock poisoned")
            .get(note_id)
            .cloned()
            .unwrap_or_default()
    }

    fn set_status(&self, note_id: &str, state: SyncState) {
        let mut guard = self.status.lock().expect("lock poisoned");
        let entry = guard.entry(note_id.to_string()).or_default();
        entry.state = state;
        if state == SyncState::Synced {
            entry.last_synced_at = Some(Utc::now());
            entry.pending_updates_count = Some(0);
        }
    }

    fn begin_cycle(&self) -> Result<()> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Err(SyncCoreError::invariant("a sync cycle is already running"));
        }
        let mut last_start = self.last_cycle_start.lock().expect("lock poisoned");
        if let Some(started) = *last_start {
            if started.elapsed() < self.sync_debounce {
                self.syncing.store(false, Ordering::SeqCst);
                return Err(SyncCoreError::invariant("sync debounce window not elapsed"));
            }
        }
        *last_start = Some(Instant::now());
        Ok(())
    }

    fn end_cycle(&self) {
        self.syncing.store(false, Ordering::SeqCst);
    }

    /// A request/response full-sync cycle. Works even when the streaming
    /// transport is absent or disconnected.
    pub async fn full_sync(
        &self,
        server_url: &str,
        token: &str,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>> {
        if let Some(blocked) = self.auth_blocked_token.lock().expect("lock poisoned").as_ref() {
            if blocked == token {
                return Err(SyncCoreError::Auth(
                    "sync blocked: previous auth failure with this token, waiting for a new one"
                        .to_string(),
                ));
            }
        }
        self.begin_cycle()?;
        let outcome = self.run_full_sync(server_url, token, last_sync).await;
        self.end_cycle();
        match &outcome {
            Ok(_) => {
                *self.last_error.write().expect("lock poisoned") = None;
                *self.auth_blocked_token.lock().expect("lock poisoned") = None;
            }
            Err(SyncCoreError::Auth(msg)) => {
                *self.last_error.write().expect("lock poisoned") = Some(msg.clone());
                *self.auth_blocked_token.lock().expect("lock poisoned") = Some(token.to_string());
            }
            Err(e) => *self.last_error.write().expect("lock poisoned") = Some(e.to_string()),
        }
        outcome
    }

    async fn run_full_sync(
        &self,
        server_url: &str,
        token: &str,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>> {
        let notes = self.persistence.list_notes(FolderFilter::All).await?;
        let crdt_rows = self.persistence.list_all_crdt().await?;
        let crdt_index: HashMap<String, _> =
            crdt_rows.into_iter().map(|c| (c.note_id.clone(), c)).collect();

        let mut request = CrdtSyncRequest::default();
        let mut should_push_ids = Vec::new();

        for note in &notes {
            let should_push = last_sync.is_none()
                || last_sync.is_some_and(|t| note.updated_at > t)
                || self.manager.has(&note.id);

            let content_snapshot = if self.manager.has(&note.id) {
                self.manager.text_snapshot(&note.id)
            } else {
                note.content.clone()
            };

            let (state_vector, update_payload) = if self.manager.has(&note.id) {
                let sv = self.manager.state_vector(&note.id);
                let state = self.manager.state(&note.id);
                let include = should_push && state.len() > EMPTY_STATE_FLOOR;
                (sv, include.then_some(state))
            } else if let Some(stored) = crdt_index.get(&note.id) {
                let sv = if !stored.state_vector.is_empty() {
                    stored.state_vector.clone()
                } else {
                    self.manager.load(&note.id, &stored.ydoc_state)?;
                    self.manager.state_vector(&note.id)
                };
                (sv, should_push.then(|| stored.ydoc_state.clone()))
            } else if !note.content.is_empty() {
                if let Err(e) = self.manager.seed_html(&note.id, &note.content) {
                    log::warn!("failed to seed replica for {}: {e}", note.id);
                }
                let sv = self.manager.state_vector(&note.id);
                let state = self.manager.state(&note.id);
                let include = should_push && state.len() > EMPTY_STATE_FLOOR;
                let persisted = self
                    .persistence
                    .save_crdt(&note.id, state.clone(), sv.clone())
                    .await;
                if let Err(e) = persisted {
                    log::warn!("failed to persist seeded CRDT state for {}: {e}", note.id);
                }
                (sv, include.then_some(state))
            } else {
                self.manager.get_or_create(&note.id);
                (self.manager.state_vector(&note.id), None)
            };

            request
                .state_vectors
                .insert(note.id.clone(), codec::to_base64(&state_vector));
            if let Some(payload) = update_payload {
                request.updates.insert(note.id.clone(), codec::to_base64(&payload));
            }
            if should_push {
                let mut metadata = NoteMetadataUpdate::from(note);
                metadata.content = content_snapshot;
                request.metadata.push(metadata);
                should_push_ids.push(note.id.clone());
                self.set_status(&note.id, SyncState::Syncing);
            }
        }

        let response = match self.http.post_sync(server_url, token, request).await {
            Ok(response) => response,
            Err(e) => {
                for id in &should_push_ids {
                    self.set_status(id, SyncState::Pending);
                }
                return Err(e);
            }
        };

        self.apply_sync_response(&response).await;

        for id in &should_push_ids {
            self.set_status(id, SyncState::Synced);
        }
        *self.last_sync.write().expect("lock poisoned") = Some(response.server_time);
        Ok(response.server_time)
    }

    /// Apply updates and metadata from a sync response. Shared between
    /// `full_sync`'s HTTP leg and a `sync_response` frame from the
    /// streaming transport so both paths reconcile identically.
    async fn apply_sync_response(&self, response: &CrdtSyncResponse) {
        for (note_id, b64) in &response.updates {
            if b64.is_empty() {
                continue;
            }
            let bytes = match codec::from_base64(b64) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("dropping undecodable update for {note_id}: {e}");
                    continue;
                }
            };
            if let Err(e) = self.manager.apply_remote(note_id, &bytes, UpdateOrigin::Sync) {
                log::warn!("dropping unapplicable update for {note_id}: {e}");
                continue;
            }
            let state = self.manager.state(note_id);
            let sv = self.manager.state_vector(note_id);
            if let Err(e) = self.persistence.save_crdt(note_id, state, sv).await {
                log::warn!("failed to persist merged CRDT state for {note_id}: {e}");
            }
        }

        for entry in &response.metadata {
            if let Err(e) = self.reconcile_metadata(entry).await {
                log::warn!("failed to reconcile metadata for {}: {e}", entry.id);
            }
        }
    }

    async fn reconcile_metadata(&self, entry: &NoteMetadataUpdate) -> Result<()> {
        if entry.is_deleted {
            if let Some(mut local) = self.persistence.get_note(&entry.id).await? {
                local.is_deleted = true;
                local.updated_at = entry.updated_at.max(local.updated_at);
                self.persistence.save_note(local).await?;
            } else {
                let mut tombstone = Note::from(entry.clone());
                tombstone.is_deleted = true;
                self.persistence.save_note(tombstone).await?;
            }
            self.status.lock().expect("lock poisoned").remove(&entry.id);
            return Ok(());
        }

        let chosen_content = if self.manager.has(&entry.id) {
            self.manager.text_snapshot(&entry.id)
        } else {
            entry.content.clone()
        };

        match self.persistence.get_note(&entry.id).await? {
            None => {
                let mut note = Note::from(entry.clone());
                note.content = chosen_content;
                self.persistence.save_note(note).await?;
            }
            Some(local) if entry.updated_at > local.updated_at => {
                let mut note = Note::from(entry.clone());
                note.content = chosen_content;
                self.persistence.save_note(note).await?;
            }
            Some(_) => {
                // Local metadata is newer or tied; strict `>` means no change.
            }
        }
        Ok(())
    }

    /// Ask the transport to request an incremental sync: used on streaming
    /// reconnect. A no-op if there is no transport, it isn't connected, or
    /// a sync is already in flight.
    pub async fn incremental_sync(&self) -> Result<()> {
        let Some(transport) = self.transport() else {
            return Ok(());
        };
        if transport.state() != ConnectionState::Connected {
            return Ok(());
        }

        let known_ids = self.manager.open_note_ids();
        let notes = self.persistence.list_notes(FolderFilter::All).await?;

        let mut payload = SyncRequestPayload::default();
        for note in &notes {
            payload
                .metadata
                .push(NoteMetadataUpdate::from(note));
        }
        for note_id in &known_ids {
            payload
                .state_vectors
                .insert(note_id.clone(), codec::to_base64(&self.manager.state_vector(note_id)));
            let pending = self.manager.flush_pending(note_id);
            if !pending.is_empty() {
                let full_state = self.manager.state(note_id);
                payload.updates.insert(note_id.clone(), codec::to_base64(&full_state));
            }
        }

        transport.request_sync(payload)
    }

    fn content_timers(&self) -> Arc<Mutex<HashMap<String, u64>>> {
        self.content_generations.clone()
    }
}

impl<P, H> DocumentManagerObserver for SyncCoordinator<P, H>
where
    P: LocalPersistencePort + 'static,
    H: SyncHttpClient + 'static,
{
    fn on_local_update(&self, note_id: &str, update: Vec<u8>) {
        self.set_status(note_id, SyncState::Pending);
        {
            let mut guard = self.status.lock().expect("lock poisoned");
            let entry = guard.entry(note_id.to_string()).or_default();
            entry.pending_updates_count = Some(self.manager.pending_count(note_id));
        }
        if let Some(transport) = self.transport() {
            if transport.state() == ConnectionState::Connected {
                transport.push_update(note_id, &update);
            }
        }
    }

    fn on_content_change(&self, note_id: &str, snapshot: String) {
        let mut generations = self.content_generations.lock().expect("lock poisoned");
        let counter = generations.entry(note_id.to_string()).or_insert(0);
        *counter += 1;
        let my_generation = *counter;
        drop(generations);

        let persistence = self.persistence.clone();
        let note_id = note_id.to_string();
        let generations = self.content_timers();
        let delay = self.content_debounce;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = generations
                .lock()
                .expect("lock poisoned")
                .get(&note_id)
                .copied()
                == Some(my_generation);
            if !still_current {
                return;
            }
            match persistence.get_note(&note_id).await {
                Ok(Some(mut note)) => {
                    note.content = snapshot;
                    note.updated_at = Utc::now();
                    if let Err(e) = persistence.save_note(note).await {
                        log::warn!("content snapshot write-through failed for {note_id}: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("content snapshot lookup failed for {note_id}: {e}"),
            }
        });
    }
}

impl<P, H> SyncTransportObserver for SyncCoordinator<P, H>
where
    P: LocalPersistencePort + 'static,
    H: SyncHttpClient + 'static,
{
    fn on_frame(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Update => {
                let (Some(note_id), Some(payload)) = (frame.note_id, frame.payload) else {
                    return;
                };
                let Ok(bytes) = codec::from_base64(&payload) else {
                    log::warn!("dropping undecodable update frame for {note_id}");
                    return;
                };
                if let Err(e) = self.manager.apply_remote(&note_id, &bytes, UpdateOrigin::Remote) {
                    log::warn!("dropping unapplicable update frame for {note_id}: {e}");
                }
            }
            FrameType::SyncResponse => {
                let Some(payload) = frame.payload else { return };
                let Ok(response) = serde_json::from_str::<CrdtSyncResponse>(&payload) else {
                    log::warn!("dropping malformed sync_response frame");
                    return;
                };
                let persistence = self.persistence.clone();
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    apply_sync_response_standalone(&manager, &persistence, &response).await;
                });
            }
            FrameType::NoteMetadata => {
                let Some(payload) = frame.payload else { return };
                let Ok(entry) = serde_json::from_str::<NoteMetadataUpdate>(&payload) else {
                    log::warn!("dropping malformed note_metadata frame");
                    return;
                };
                let persistence = self.persistence.clone();
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = reconcile_metadata_standalone(&manager, &persistence, &entry).await {
                        log::warn!("failed to reconcile live metadata for {}: {e}", entry.id);
                    }
                });
            }
            FrameType::SyncRequest | FrameType::Subscribe | FrameType::Unsubscribe
            | FrameType::Awareness | FrameType::Other => {}
        }
    }

    fn on_state_change(&self, state: ConnectionState) {
        log::info!("sync transport state changed: {state:?}");
    }

    fn on_sync_error(&self, error: SyncCoreError) {
        *self.last_error.write().expect("lock poisoned") = Some(error.to_string());
    }
}

/// A free-function twin of [`SyncCoordinator::apply_sync_response`] used
/// when reacting to a `sync_response` frame from inside a detached task,
/// where borrowing `&self` across the `.await` isn't available.
async fn apply_sync_response_standalone<P: LocalPersistencePort>(
    manager: &DocumentManager,
    persistence: &Arc<P>,
    response: &CrdtSyncResponse,
) {
    for (note_id, b64) in &response.updates {
        if b64.is_empty() {
            continue;
        }
        let bytes = match codec::from_base64(b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("dropping undecodable update for {note_id}: {e}");
                continue;
            }
        };
        if let Err(e) = manager.apply_remote(note_id, &bytes, UpdateOrigin::Sync) {
            log::warn!("dropping unapplicable update for {note_id}: {e}");
            continue;
        }
        let state = manager.state(note_id);
        let sv = manager.state_vector(note_id);
        if let Err(e) = persistence.save_crdt(note_id, state, sv).await {
            log::warn!("failed to persist merged CRDT state for {note_id}: {e}");
        }
    }
}

/// A free-function twin of [`SyncCoordinator::reconcile_metadata`], used
/// when reacting to a `note_metadata` frame from inside a detached task.
async fn reconcile_metadata_standalone<P: LocalPersistencePort>(
    manager: &DocumentManager,
    persistence: &Arc<P>,
    entry: &NoteMetadataUpdate,
) -> Result<()> {
    if entry.is_deleted {
        if let Some(mut local) = persistence.get_note(&entry.id).await? {
            local.is_deleted = true;
            local.updated_at = entry.updated_at.max(local.updated_at);
            persistence.save_note(local).await?;
        } else {
            let mut tombstone = Note::from(entry.clone());
            tombstone.is_deleted = true;
            persistence.save_note(tombstone).await?;
        }
        return Ok(());
    }

    let chosen_content = if manager.has(&entry.id) {
        manager.text_snapshot(&entry.id)
    } else {
        entry.content.clone()
    };

    match persistence.get_note(&entry.id).await? {
        None => {
            let mut note = Note::from(entry.clone());
            note.content = chosen_content;
            persistence.save_note(note).await?;
        }
        Some(local) if entry.updated_at > local.updated_at => {
            let mut note = Note::from(entry.clone());
            note.content = chosen_content;
            persistence.save_note(note).await?;
        }
        Some(_) => {}
    }
    Ok(())
}

impl From<NoteMetadataUpdate> for Note {
    fn from(entry: NoteMetadataUpdate) -> Self {
        Note {
            id: entry.id,
            title: entry.title,
            content: entry.content,
            folder_id: entry.folder_id,
            is_deleted: entry.is_deleted,
            is_canvas: entry.is_canvas,
            updated_at: entry.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryPersistence, LocalPersistencePort};
    use crate::test_support::FakeSyncHttpClient;

    fn new_coordinator() -> Arc<SyncCoordinator<InMemoryPersistence, FakeSyncHttpClient>> {
        let coordinator = SyncCoordinator::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(FakeSyncHttpClient::default()),
            Arc::new(DocumentManager::new()),
        );
        coordinator.attach_manager_only();
        coordinator
    }

    #[tokio::test]
    async fn fresh_push_reports_empty_updates_and_matching_title() {
        let coordinator = new_coordinator();
        let mut note = Note::new("Hello", None, false);
        note.content = "world".to_string();
        coordinator.persistence.save_note(note.clone()).await.unwrap();
        let replica = coordinator.manager.get_or_create(&note.id);
        replica.insert_at(0, "world").unwrap();

        coordinator
            .http
            .responses
            .lock()
            .unwrap()
            .push(Ok(CrdtSyncResponse {
                updates: HashMap::new(),
                metadata: vec![],
                server_time: Utc::now(),
            }));

        coordinator
            .full_sync("https://example.test", "tok", None)
            .await
            .unwrap();

        let sent = coordinator.http.received_requests.lock().unwrap();
        let metadata = &sent[0].metadata;
        assert!(metadata.iter().any(|m| m.id == note.id && m.title == "Hello"));
    }

    #[tokio::test]
    async fn local_edit_moves_status_to_pending_with_a_queue_count() {
        let coordinator = new_coordinator();
        let note = Note::new("Edited", None, false);
        let replica = coordinator.manager.get_or_create(&note.id);

        assert_eq!(coordinator.sync_status(&note.id).state, SyncState::Synced);
        replica.insert_at(0, "hi").unwrap();

        let status = coordinator.sync_status(&note.id);
        assert_eq!(status.state, SyncState::Pending);
        assert_eq!(status.pending_updates_count, Some(1));
    }

    #[tokio::test]
    async fn debounce_rejects_a_second_cycle_within_the_window() {
        let coordinator = new_coordinator();
        coordinator
            .full_sync("https://example.test", "tok", None)
            .await
            .unwrap();
        let second = coordinator.full_sync("https://example.test", "tok", None).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn metadata_tiebreak_keeps_local_row_on_equal_timestamp() {
        let coordinator = new_coordinator();
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut note = Note::new("Local title", None, false);
        note.id = "n1".to_string();
        note.updated_at = ts;
        coordinator.persistence.save_note(note.clone()).await.unwrap();

        let mut server_entry = NoteMetadataUpdate::from(&note);
        server_entry.title = "Server title".to_string();

        coordinator
            .reconcile_metadata(&server_entry)
            .await
            .unwrap();

        let stored = coordinator.persistence.get_note("n1").await.unwrap().unwrap();
        assert_eq!(stored.title, "Local title");
    }

    #[tokio::test]
    async fn soft_delete_metadata_marks_tombstone() {
        let coordinator = new_coordinator();
        let mut note = Note::new("Gone", None, false);
        note.id = "n1".to_string();
        coordinator.persistence.save_note(note.clone()).await.unwrap();

        let mut deletion = NoteMetadataUpdate::from(&note);
        deletion.is_deleted = true;
        deletion.updated_at = Utc::now();

        coordinator.reconcile_metadata(&deletion).await.unwrap();

        let stored = coordinator.persistence.get_note("n1").await.unwrap().unwrap();
        assert!(stored.is_deleted);
    }

    #[tokio::test]
    async fn auth_error_blocks_retries_until_a_new_token_is_used() {
        let coordinator = SyncCoordinator::with_sync_debounce(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(FakeSyncHttpClient::default()),
            Arc::new(DocumentManager::new()),
            Duration::from_millis(0),
        );
        coordinator.attach_manager_only();
        coordinator
            .http
            .responses
            .lock()
            .unwrap()
            .push(Err(SyncCoreError::Auth("token rejected".to_string())));

        let first = coordinator.full_sync("https://example.test", "stale", None).await;
        assert!(matches!(first, Err(SyncCoreError::Auth(_))));

        // Retrying with the same token is blocked without hitting the HTTP client.
        let retry = coordinator.full_sync("https://example.test", "stale", None).await;
        assert!(matches!(retry, Err(SyncCoreError::Auth(_))));
        assert_eq!(coordinator.http.received_requests.lock().unwrap().len(), 1);

        // A fresh token clears the block and the debounce no longer applies to it.
        coordinator
            .http
            .responses
            .lock()
            .unwrap()
            .push(Ok(CrdtSyncResponse {
                updates: HashMap::new(),
                metadata: vec![],
                server_time: Utc::now(),
            }));
        let retried_with_new_token =
            coordinator.full_sync("https://example.test", "fresh", None).await;
        assert!(retried_with_new_token.is_ok());
    }
}
