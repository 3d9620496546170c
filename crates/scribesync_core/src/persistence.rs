//! The Local Persistence Port: the capability interface the coordinator
//! consumes from whatever storage backs the client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{CrdtState, FolderFilter, Note};

/// A capability interface over notes + CRDT blob storage.
///
/// Every method has a default implementation that degrades gracefully
/// ("feature disabled"): an adapter only needs to override the operations
/// it actually backs. The coordinator never fails an outer flow because a
/// capability is absent; it just gets empty results back.
pub trait LocalPersistencePort: Send + Sync {
    /// List notes matching `filter`.
    fn list_notes(&self, filter: FolderFilter) -> impl Future<Output = Result<Vec<Note>>> + Send {
        let _ = filter;
        async { Ok(Vec::new()) }
    }

    /// Fetch a single note by id.
    fn get_note(&self, id: &str) -> impl Future<Output = Result<Option<Note>>> + Send {
        let _ = id;
        async { Ok(None) }
    }

    /// Upsert a note, assigning an id if the input has none.
    fn save_note(&self, note: Note) -> impl Future<Output = Result<Note>> + Send {
        async move { Ok(note) }
    }

    /// Hard-delete or tombstone a note, at the implementation's discretion.
    fn delete_note(&self, id: &str) -> impl Future<Output = Result<bool>> + Send {
        let _ = id;
        async { Ok(false) }
    }

    /// Notes (including tombstones) touched at or after `since`.
    fn notes_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Note>>> + Send {
        let _ = since;
        async { Ok(Vec::new()) }
    }

    /// Bulk-upsert notes pulled from the server, respecting `updated_at`
    /// monotonicity.
    fn apply_pulled_notes(&self, notes: Vec<Note>) -> impl Future<Output = Result<()>> + Send {
        let _ = notes;
        async { Ok(()) }
    }

    /// Persist a note's CRDT state and state vector.
    fn save_crdt(
        &self,
        note_id: &str,
        ydoc_state: Vec<u8>,
        state_vector: Vec<u8>,
    ) -> impl Future<Output = Result<CrdtState>> + Send {
        let note_id = note_id.to_string();
        async move {
            Ok(CrdtState {
                note_id,
                ydoc_state,
                state_vector,
                updated_at: Utc::now(),
            })
        }
    }

    /// Fetch a note's stored CRDT state, if any.
    fn get_crdt(&self, note_id: &str) -> impl Future<Output = Result<Option<CrdtState>>> + Send {
        let _ = note_id;
        async { Ok(None) }
    }

    /// Every stored CRDT row.
    fn list_all_crdt(&self) -> impl Future<Output = Result<Vec<CrdtState>>> + Send {
        async { Ok(Vec::new()) }
    }

    /// CRDT rows touched at or after `since`.
    fn crdt_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<CrdtState>>> + Send {
        let _ = since;
        async { Ok(Vec::new()) }
    }

    /// Apply a server-delivered diff to the stored CRDT blob for `note_id`.
    fn apply_crdt_update(
        &self,
        note_id: &str,
        update: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send {
        let _ = (note_id, update);
        async { Ok(()) }
    }
}

/// An in-memory `LocalPersistencePort`, used by tests and by hosts that
/// have not wired up durable storage yet.
#[derive(Default)]
pub struct InMemoryPersistence {
    notes: Mutex<HashMap<String, Note>>,
    crdt: Mutex<HashMap<String, CrdtState>>,
}

impl InMemoryPersistence {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalPersistencePort for InMemoryPersistence {
    fn list_notes(&self, filter: FolderFilter) -> impl Future<Output = Result<Vec<Note>>> + Send {
        let notes = self.notes.lock().expect("lock poisoned");
        let result: Vec<Note> = notes
            .values()
            .filter(|n| match &filter {
                FolderFilter::All => true,
                FolderFilter::Folder(id) => n.folder_id.as_deref() == Some(id.as_str()),
                FolderFilter::Uncategorised => n.folder_id.is_none(),
            })
            .cloned()
            .collect();
        async { Ok(result) }
    }

    fn get_note(&self, id: &str) -> impl Future<Output = Result<Option<Note>>> + Send {
        let result = self.notes.lock().expect("lock poisoned").get(id).cloned();
        async { Ok(result) }
    }

    fn save_note(&self, mut note: Note) -> impl Future<Output = Result<Note>> + Send {
        if note.id.is_empty() {
            note.id = uuid::Uuid::new_v4().to_string();
        }
        self.notes
            .lock()
            .expect("lock poisoned")
            .insert(note.id.clone(), note.clone());
        async { Ok(note) }
    }

    fn delete_note(&self, id: &str) -> impl Future<Output = Result<bool>> + Send {
        let existed = if let Some(note) = self.notes.lock().expect("lock poisoned").get_mut(id) {
            note.mark_deleted();
            true
        } else {
            false
        };
        async move { Ok(existed) }
    }

    fn notes_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Note>>> + Send {
        let result: Vec<Note> = self
            .notes
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|n| n.updated_at >= since)
            .cloned()
            .collect();
        async { Ok(result) }
    }

    fn apply_pulled_notes(&self, notes: Vec<Note>) -> impl Future<Output = Result<()>> + Send {
        let mut guard = self.notes.lock().expect("lock poisoned");
        for incoming in notes {
            match guard.get(&incoming.id) {
                Some(existing) if existing.updated_at >= incoming.updated_at => {}
                _ => {
                    guard.insert(incoming.id.clone(), incoming);
                }
            }
        }
        async { Ok(()) }
    }

    fn save_crdt(
        &self,
        note_id: &str,
        ydoc_state: Vec<u8>,
        state_vector: Vec<u8>,
    ) -> impl Future<Output = Result<CrdtState>> + Send {
        let state = CrdtState {
            note_id: note_id.to_string(),
            ydoc_state,
            state_vector,
            updated_at: Utc::now(),
        };
        self.crdt
            .lock()
            .expect("lock poisoned")
            .insert(note_id.to_string(), state.clone());
        async { Ok(state) }
    }

    fn get_crdt(&self, note_id: &str) -> impl Future<Output = Result<Option<CrdtState>>> + Send {
        let result = self.crdt.lock().expect("lock poisoned").get(note_id).cloned();
        async { Ok(result) }
    }

    fn list_all_crdt(&self) -> impl Future<Output = Result<Vec<CrdtState>>> + Send {
        let result: Vec<CrdtState> = self.crdt.lock().expect("lock poisoned").values().cloned().collect();
        async { Ok(result) }
    }

    fn crdt_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<CrdtState>>> + Send {
        let result: Vec<CrdtState> = self
            .crdt
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|c| c.updated_at >= since)
            .cloned()
            .collect();
        async { Ok(result) }
    }

    fn apply_crdt_update(
        &self,
        note_id: &str,
        update: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send {
        let mut guard = self.crdt.lock().expect("lock poisoned");
        let entry = guard.entry(note_id.to_string()).or_insert_with(|| CrdtState {
            note_id: note_id.to_string(),
            ydoc_state: Vec::new(),
            state_vector: Vec::new(),
            updated_at: Utc::now(),
        });
        entry.ydoc_state = update;
        entry.updated_at = Utc::now();
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = InMemoryPersistence::new();
        let note = Note::new("Hello", None, false);
        let saved = store.save_note(note.clone()).await.unwrap();
        let fetched = store.get_note(&saved.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Hello");
    }

    #[tokio::test]
    async fn apply_pulled_notes_respects_monotonicity() {
        let store = InMemoryPersistence::new();
        let mut note = Note::new("Old title", None, false);
        note.id = "n1".to_string();
        note.updated_at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        store.save_note(note.clone()).await.unwrap();

        let mut stale = note.clone();
        stale.title = "Should not apply".to_string();
        store.apply_pulled_notes(vec![stale]).await.unwrap();

        let unchanged = store.get_note("n1").await.unwrap().unwrap();
        assert_eq!(unchanged.title, "Old title");
    }

    #[tokio::test]
    async fn list_notes_filters_by_folder() {
        let store = InMemoryPersistence::new();
        store
            .save_note(Note::new("A", Some("f1".into()), false))
            .await
            .unwrap();
        store.save_note(Note::new("B", None, false)).await.unwrap();

        let in_folder = store
            .list_notes(FolderFilter::Folder("f1".to_string()))
            .await
            .unwrap();
        assert_eq!(in_folder.len(), 1);

        let uncategorised = store.list_notes(FolderFilter::Uncategorised).await.unwrap();
        assert_eq!(uncategorised.len(), 1);
    }
}
