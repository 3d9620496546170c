//! Shared data types: notes, CRDT rows, sync status, and wire payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The scalar metadata + cached content layer of a note.
///
/// The authoritative copy of the rich-text body lives in the CRDT replica;
/// `content` here is a cache used for preview/search and for notes that have
/// never been opened through a CRDT-aware editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Opaque stable identifier (UUID).
    pub id: String,
    /// Display title.
    pub title: String,
    /// Serialized rich-text snapshot, used as a preview cache.
    pub content: String,
    /// Folder this note lives in, if any.
    pub folder_id: Option<String>,
    /// Soft-delete tombstone flag.
    pub is_deleted: bool,
    /// Whether this note is a freeform canvas rather than linear text.
    pub is_canvas: bool,
    /// Tiebreaker for metadata conflicts.
    pub updated_at: DateTime<Utc>,
}

impl Note {
    /// Construct a new note, generating an id and stamping `updated_at = now`.
    pub fn new(title: impl Into<String>, folder_id: Option<String>, is_canvas: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            content: String::new(),
            folder_id,
            is_deleted: false,
            is_canvas,
            updated_at: Utc::now(),
        }
    }

    /// Mark this note as deleted, bumping `updated_at` so the tombstone wins
    /// over any metadata a peer might still be holding.
    pub fn mark_deleted(&mut self) {
        self.is_deleted = true;
        self.updated_at = Utc::now();
    }
}

/// Which notes a [`crate::persistence::LocalPersistencePort::list_notes`]
/// call should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderFilter {
    /// Every note, including soft-deleted ones.
    All,
    /// Notes belonging to a specific folder.
    Folder(String),
    /// Notes with no folder assigned.
    Uncategorised,
}

/// The durable CRDT state persisted alongside a note.
#[derive(Debug, Clone, PartialEq)]
pub struct CrdtState {
    /// The note this blob belongs to.
    pub note_id: String,
    /// Full, self-contained document state.
    pub ydoc_state: Vec<u8>,
    /// Compact summary of observed operations, derivable from `ydoc_state`.
    pub state_vector: Vec<u8>,
    /// Timestamp of last persistence.
    pub updated_at: DateTime<Utc>,
}

/// Where an applied CRDT update came from.
///
/// The document manager uses this to decide whether to re-emit the update as
/// a local edit (only `Local` does) or treat it as already-acknowledged
/// state (everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A local edit made through the replica handle.
    Local,
    /// An update received from the streaming transport.
    Remote,
    /// An update applied while processing a full-sync response.
    Sync,
    /// The initial state loaded from persistence.
    Load,
    /// HTML seed content inserted before the first real edit.
    Populate,
}

/// Per-note sync state the façade can read reactively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Server and local state agree, nothing outstanding.
    Synced,
    /// Local changes exist that have not been sent yet.
    Pending,
    /// A sync cycle covering this note is in flight.
    Syncing,
    /// The note needs manual conflict resolution.
    ///
    /// Not produced by this crate's own logic (metadata is last-writer-wins
    /// and bodies always converge), but reserved for callers layering
    /// stricter policies on top.
    Conflict,
}

/// The reactive sync status the façade exposes per note.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    /// Current state.
    pub state: SyncState,
    /// When this note last completed a sync cycle successfully.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Number of locally-produced updates not yet flushed to the transport.
    pub pending_updates_count: Option<usize>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Synced,
            last_synced_at: None,
            pending_updates_count: None,
        }
    }
}

/// One entry of the metadata half of a sync request/response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteMetadataUpdate {
    /// Note id.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Cached content snapshot.
    pub content: String,
    /// Folder id, if any.
    pub folder_id: Option<String>,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// Canvas flag.
    pub is_canvas: bool,
    /// Tiebreaker timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&Note> for NoteMetadataUpdate {
    fn from(note: &Note) -> Self {
        Self {
            id: note.id.clone(),
            title: note.title.clone(),
            content: note.content.clone(),
            folder_id: note.folder_id.clone(),
            is_deleted: note.is_deleted,
            is_canvas: note.is_canvas,
            updated_at: note.updated_at,
        }
    }
}

/// The body of `POST /api/sync/crdt`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrdtSyncRequest {
    /// Per-note state vectors, base64-encoded.
    pub state_vectors: std::collections::HashMap<String, String>,
    /// Per-note update payloads, base64-encoded.
    pub updates: std::collections::HashMap<String, String>,
    /// Metadata for every note that satisfies `should_push`.
    pub metadata: Vec<NoteMetadataUpdate>,
}

/// The response body of `POST /api/sync/crdt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrdtSyncResponse {
    /// Per-note update payloads the server has that the client didn't.
    pub updates: std::collections::HashMap<String, String>,
    /// Metadata entries the server considers authoritative.
    pub metadata: Vec<NoteMetadataUpdate>,
    /// The server's clock at response time; becomes the new `last_sync`.
    pub server_time: DateTime<Utc>,
}

/// The streaming transport's connection lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket, no reconnect scheduled.
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Socket open, idle.
    Connected,
    /// Socket open, a `request_sync` is outstanding.
    Syncing,
    /// Socket closed uncleanly; a reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number about to be made.
        attempt: u32,
    },
}
