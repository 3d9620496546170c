//! The public façade: the surface a host application (desktop, mobile, or
//! web shell) embeds instead of talking to the coordinator, manager, and
//! transport directly.

use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::crdt::{DocumentManager, Replica};
use crate::error::{Result, SyncCoreError};
use crate::http::SyncHttpClient;
use crate::persistence::LocalPersistencePort;
use crate::transport::SyncTransport;
use crate::types::{CrdtState, FolderFilter, Note};
use crate::SyncCoordinator;

/// Supplies the current bearer token on demand, so a host can rotate
/// credentials without reconstructing the client.
pub type TokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// The embeddable client a UI layer owns for the lifetime of the app.
pub struct NoteClient<P: LocalPersistencePort + 'static, H: SyncHttpClient + 'static> {
    persistence: Arc<P>,
    manager: Arc<DocumentManager>,
    coordinator: Arc<SyncCoordinator<P, H>>,
    transport: RwLock<Option<Arc<SyncTransport>>>,
    server_url: RwLock<Option<String>>,
    token_provider: RwLock<Option<TokenProvider>>,
}

impl<P, H> NoteClient<P, H>
where
    P: LocalPersistencePort + 'static,
    H: SyncHttpClient + 'static,
{
    /// Construct a client with no streaming sync attached yet. Call
    /// [`Self::init_streaming`] to start one.
    pub fn new(persistence: Arc<P>, http: Arc<H>) -> Arc<Self> {
        let manager = Arc::new(DocumentManager::new());
        let coordinator = SyncCoordinator::new(persistence.clone(), http, manager.clone());
        coordinator.attach_manager_only();
        Arc::new(Self {
            persistence,
            manager,
            coordinator,
            transport: RwLock::new(None),
            server_url: RwLock::new(None),
            token_provider: RwLock::new(None),
        })
    }

    /// The document manager backing open replicas, for callers that need
    /// lower-level access than the façade exposes.
    pub fn manager(&self) -> &Arc<DocumentManager> {
        &self.manager
    }

    /// The sync coordinator, for reading reactive status
    /// ([`SyncCoordinator::sync_status`], [`SyncCoordinator::connection_state`]).
    pub fn coordinator(&self) -> &Arc<SyncCoordinator<P, H>> {
        &self.coordinator
    }

    /// List notes matching `filter`.
    pub async fn list_notes(&self, filter: FolderFilter) -> Result<Vec<Note>> {
        self.persistence.list_notes(filter).await
    }

    /// Create a note, its replica, and (if connected) its subscription.
    pub async fn create_note(
        &self,
        title: impl Into<String>,
        folder_id: Option<String>,
        is_canvas: bool,
    ) -> Result<Note> {
        let note = self
            .persistence
            .save_note(Note::new(title, folder_id, is_canvas))
            .await?;
        self.manager.get_or_create(&note.id);
        if let Some(transport) = self.transport() {
            transport.subscribe(note.id.clone());
        }
        Ok(note)
    }

    /// Persist metadata changes to an existing note, pushing the change live
    /// over the streaming transport when one is attached (the next full
    /// sync would eventually carry it too, but this gets a rename/retitle
    /// to other devices without waiting on the debounce window).
    pub async fn update_note(&self, mut note: Note) -> Result<Note> {
        note.updated_at = Utc::now();
        let saved = self.persistence.save_note(note).await?;
        self.push_metadata_live(&saved);
        Ok(saved)
    }

    /// Move a note to a different folder (or out of any folder).
    pub async fn move_note(&self, note_id: &str, folder_id: Option<String>) -> Result<Note> {
        let mut note = self
            .persistence
            .get_note(note_id)
            .await?
            .ok_or_else(|| SyncCoreError::invariant(format!("unknown note {note_id}")))?;
        note.folder_id = folder_id;
        note.updated_at = Utc::now();
        let saved = self.persistence.save_note(note).await?;
        self.push_metadata_live(&saved);
        Ok(saved)
    }

    /// Soft-delete a note, destroy its replica, and unsubscribe it.
    pub async fn delete_note(&self, note_id: &str) -> Result<bool> {
        let deleted = self.persistence.delete_note(note_id).await?;
        self.manager.destroy(note_id);
        if let Some(transport) = self.transport() {
            transport.unsubscribe(note_id.to_string());
        }
        // If the port tombstoned rather than hard-deleted the row, push the
        // tombstone live so other connected devices don't wait on the next
        // full sync to learn about it.
        if deleted {
            if let Some(note) = self.persistence.get_note(note_id).await? {
                self.push_metadata_live(&note);
            }
        }
        Ok(deleted)
    }

    /// Push a `note_metadata` frame over the streaming transport, if one is
    /// attached. A no-op (frame just enqueues) when disconnected.
    fn push_metadata_live(&self, note: &Note) {
        if let Some(transport) = self.transport() {
            transport.push_metadata(&crate::types::NoteMetadataUpdate::from(note));
        }
    }

    /// Select a note for editing: ensures the full note (fetching it if
    /// `summary` is a listing row without `content`), loads or seeds its
    /// CRDT replica, and subscribes to live updates if connected.
    pub async fn select_note(&self, summary: Note) -> Result<(Note, Arc<Replica>)> {
        let note = if summary.content.is_empty() {
            self.persistence
                .get_note(&summary.id)
                .await?
                .unwrap_or(summary)
        } else {
            summary
        };

        let replica = self.load_or_seed_replica(&note).await?;

        if let Some(transport) = self.transport() {
            transport.subscribe(note.id.clone());
        }

        Ok((note, replica))
    }

    async fn load_or_seed_replica(&self, note: &Note) -> Result<Arc<Replica>> {
        if let Some(replica) = self.manager.get(&note.id) {
            return Ok(replica);
        }
        if let Some(CrdtState { ydoc_state, .. }) = self.persistence.get_crdt(&note.id).await? {
            self.manager.load(&note.id, &ydoc_state)?;
        } else if !note.content.is_empty() {
            self.manager.seed_html(&note.id, &note.content)?;
        }
        Ok(self.manager.get_or_create(&note.id))
    }

    /// Fetch the replica handle for an already-selected note, for binding
    /// to an editor. Returns `None` if the note hasn't been selected.
    pub fn replica_handle(&self, note_id: &str) -> Option<Arc<Replica>> {
        self.manager.get(note_id)
    }

    fn transport(&self) -> Option<Arc<SyncTransport>> {
        self.transport.read().expect("lock poisoned").clone()
    }

    /// Start the streaming sync connection against `server_url`, using
    /// `token_provider` to obtain the bearer token. Idempotent: a second
    /// call tears down the prior transport first.
    pub fn init_streaming(
        self: &Arc<Self>,
        server_url: impl Into<String>,
        token_provider: TokenProvider,
    ) -> Result<()> {
        if let Some(existing) = self.transport() {
            existing.disconnect();
        }
        let server_url = server_url.into();
        let token = token_provider();
        let transport = Arc::new(SyncTransport::new(server_url.clone(), token));
        self.coordinator.attach(transport.clone());
        transport.connect()?;

        *self.server_url.write().expect("lock poisoned") = Some(server_url);
        *self.token_provider.write().expect("lock poisoned") = Some(token_provider);
        *self.transport.write().expect("lock poisoned") = Some(transport);
        Ok(())
    }

    /// Run one request/response full-sync cycle against the server
    /// configured via [`Self::init_streaming`], or an explicit
    /// `(server_url, token)` pair for HTTP-only hosts that never start
    /// streaming.
    pub async fn full_sync(&self) -> Result<chrono::DateTime<Utc>> {
        let server_url = self
            .server_url
            .read()
            .expect("lock poisoned")
            .clone()
            .ok_or_else(|| SyncCoreError::invariant("full_sync called before init_streaming"))?;
        let token = self
            .token_provider
            .read()
            .expect("lock poisoned")
            .as_ref()
            .map(|provider| provider())
            .ok_or_else(|| SyncCoreError::invariant("full_sync called before init_streaming"))?;
        let last_sync = self.coordinator.last_sync_time();
        self.coordinator.full_sync(&server_url, &token, last_sync).await
    }

    /// Disconnect the streaming transport, if any. Does not abort an
    /// in-flight HTTP full sync.
    pub fn disconnect(&self) {
        if let Some(transport) = self.transport() {
            transport.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::test_support::FakeSyncHttpClient;

    fn new_client() -> Arc<NoteClient<InMemoryPersistence, FakeSyncHttpClient>> {
        NoteClient::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(FakeSyncHttpClient::default()),
        )
    }

    #[tokio::test]
    async fn create_note_opens_a_replica() {
        let client = new_client();
        let note = client.create_note("Hello", None, false).await.unwrap();
        assert!(client.manager.has(&note.id));
    }

    #[tokio::test]
    async fn delete_note_destroys_its_replica() {
        let client = new_client();
        let note = client.create_note("Gone", None, false).await.unwrap();
        client.delete_note(&note.id).await.unwrap();
        assert!(!client.manager.has(&note.id));
    }

    #[tokio::test]
    async fn select_note_with_empty_summary_content_refetches_full_note() {
        let client = new_client();
        let mut note = Note::new("Full", None, false);
        note.content = "<p>body</p>".to_string();
        client.persistence.save_note(note.clone()).await.unwrap();

        let summary = Note {
            content: String::new(),
            ..note.clone()
        };
        let (fetched, replica) = client.select_note(summary).await.unwrap();
        assert_eq!(fetched.content, "<p>body</p>");
        assert!(replica.text_snapshot().contains("body"));
    }

    #[tokio::test]
    async fn update_note_pushes_metadata_over_a_disconnected_transport() {
        let client = new_client();
        let note = client.create_note("Original", None, false).await.unwrap();
        client
            .init_streaming("ws://127.0.0.1:9/api/ws", Arc::new(|| "tok".to_string()))
            .unwrap();

        let mut renamed = note.clone();
        renamed.title = "Renamed".to_string();
        client.update_note(renamed).await.unwrap();

        let transport = client.transport().expect("transport attached");
        assert!(transport.pending_frames().iter().any(|f| {
            f.frame_type == crate::transport::FrameType::NoteMetadata
                && f.note_id.as_deref() == Some(note.id.as_str())
        }));
    }

    #[tokio::test]
    async fn move_note_updates_folder() {
        let client = new_client();
        let note = client.create_note("Movable", None, false).await.unwrap();
        let moved = client.move_note(&note.id, Some("f1".to_string())).await.unwrap();
        assert_eq!(moved.folder_id.as_deref(), Some("f1"));
    }
}
