//! The CRDT Document Manager: owns every open replica and mediates the
//! observer events the rest of the core reacts to.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::codec;
use crate::crdt::replica::Replica;
use crate::error::Result;
use crate::types::UpdateOrigin;

/// Receives the two events the manager's observers fire.
///
/// The coordinator is the production implementation; tests substitute a
/// recording fake, the same seam the rest of this crate uses for its other
/// capability interfaces.
pub trait DocumentManagerObserver: Send + Sync {
    /// A local edit produced `update` for `note_id`.
    fn on_local_update(&self, note_id: &str, update: Vec<u8>);
    /// The root fragment for `note_id` now renders as `snapshot`.
    fn on_content_change(&self, note_id: &str, snapshot: String);
}

/// Owns in-memory replicas for every note currently open, and the single
/// observer that reacts to their local-update and content-change events.
pub struct DocumentManager {
    replicas: RwLock<HashMap<String, Arc<Replica>>>,
    observer: Arc<RwLock<Option<Arc<dyn DocumentManagerObserver>>>>,
}

impl DocumentManager {
    /// Create an empty manager with no observer registered.
    pub fn new() -> Self {
        Self {
            replicas: RwLock::new(HashMap::new()),
            observer: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the observer that will receive every future local-update and
    /// content-change event, including from replicas already open.
    pub fn set_observer(&self, observer: Arc<dyn DocumentManagerObserver>) {
        *self.observer.write().expect("lock poisoned") = Some(observer);
    }

    /// Idempotently fetch or create the replica for `note_id`, installing
    /// its observers on first creation.
    pub fn get_or_create(&self, note_id: &str) -> Arc<Replica> {
        if let Some(existing) = self.replicas.read().expect("lock poisoned").get(note_id) {
            return existing.clone();
        }
        let mut guard = self.replicas.write().expect("lock poisoned");
        if let Some(existing) = guard.get(note_id) {
            return existing.clone();
        }
        let replica = Arc::new(Replica::new());
        self.install_callbacks(note_id, &replica);
        guard.insert(note_id.to_string(), replica.clone());
        replica
    }

    fn install_callbacks(&self, note_id: &str, replica: &Arc<Replica>) {
        let id_for_update = note_id.to_string();
        let id_for_content = note_id.to_string();

        // Each callback holds its own clone of the manager's observer slot,
        // looked up at fire time, so a later `set_observer` call still
        // reaches replicas that were created earlier.
        let observer_for_update = self.observer.clone();
        let observer_for_content = self.observer.clone();

        replica.set_callbacks(
            Box::new(move |update| {
                if let Some(observer) = observer_for_update.read().expect("lock poisoned").as_ref() {
                    observer.on_local_update(&id_for_update, update);
                }
            }),
            Box::new(move |snapshot| {
                if let Some(observer) = observer_for_content.read().expect("lock poisoned").as_ref()
                {
                    observer.on_content_change(&id_for_content, snapshot);
                }
            }),
        );
    }

    /// Whether a replica for `note_id` is currently open in memory.
    pub fn has(&self, note_id: &str) -> bool {
        self.replicas.read().expect("lock poisoned").contains_key(note_id)
    }

    /// Fetch the replica for `note_id` if it is already open, without
    /// creating one. Used for editor binding, where opening a replica the
    /// caller hasn't selected yet would be surprising.
    pub fn get(&self, note_id: &str) -> Option<Arc<Replica>> {
        self.replicas.read().expect("lock poisoned").get(note_id).cloned()
    }

    /// Apply a full state as origin `load`. Does not emit a local-update
    /// event.
    pub fn load(&self, note_id: &str, ydoc_state: &[u8]) -> Result<()> {
        self.get_or_create(note_id).load(ydoc_state)
    }

    /// Apply a remote or sync update. Origin must not be `Local`.
    pub fn apply_remote(&self, note_id: &str, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        debug_assert_ne!(origin, UpdateOrigin::Local);
        self.get_or_create(note_id).apply_update(update, origin)
    }

    /// Full state, suitable for persistence or transmission.
    pub fn state(&self, note_id: &str) -> Vec<u8> {
        self.get_or_create(note_id).state()
    }

    /// Compact state vector summary.
    pub fn state_vector(&self, note_id: &str) -> Vec<u8> {
        self.get_or_create(note_id).state_vector()
    }

    /// Update containing only what `remote_state_vector` is missing.
    pub fn diff_since(&self, note_id: &str, remote_state_vector: &[u8]) -> Vec<u8> {
        self.get_or_create(note_id).diff_since(remote_state_vector)
    }

    /// Serialized text snapshot of the replica's root fragment.
    pub fn text_snapshot(&self, note_id: &str) -> String {
        self.get_or_create(note_id).text_snapshot()
    }

    /// Seed an (assumed freshly created) replica from HTML.
    pub fn seed_html(&self, note_id: &str, html: &str) -> Result<()> {
        codec::seed_document_from_html(&self.get_or_create(note_id), html)
    }

    /// Drain the pending-update queue accumulated for `note_id`.
    pub fn flush_pending(&self, note_id: &str) -> Vec<Vec<u8>> {
        match self.replicas.read().expect("lock poisoned").get(note_id) {
            Some(replica) => replica.flush_pending(),
            None => Vec::new(),
        }
    }

    /// Number of locally-produced updates queued but not yet flushed for
    /// `note_id`. Zero for a note with no open replica.
    pub fn pending_count(&self, note_id: &str) -> usize {
        match self.replicas.read().expect("lock poisoned").get(note_id) {
            Some(replica) => replica.pending_count(),
            None => 0,
        }
    }

    /// Remove the replica for `note_id`, dropping its observers and any
    /// queued updates along with it.
    pub fn destroy(&self, note_id: &str) {
        self.replicas.write().expect("lock poisoned").remove(note_id);
    }

    /// Ids of every replica currently held in memory.
    pub fn open_note_ids(&self) -> Vec<String> {
        self.replicas.read().expect("lock poisoned").keys().cloned().collect()
    }
}

impl Default for DocumentManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(String, Vec<u8>)>>,
        content: Mutex<Vec<(String, String)>>,
    }

    impl DocumentManagerObserver for Recorder {
        fn on_local_update(&self, note_id: &str, update: Vec<u8>) {
            self.updates.lock().unwrap().push((note_id.to_string(), update));
        }
        fn on_content_change(&self, note_id: &str, snapshot: String) {
            self.content.lock().unwrap().push((note_id.to_string(), snapshot));
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let manager = DocumentManager::new();
        let a = manager.get_or_create("n1");
        let b = manager.get_or_create("n1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn local_edits_notify_observer() {
        let manager = DocumentManager::new();
        let recorder = Arc::new(Recorder::default());
        manager.set_observer(recorder.clone());

        let replica = manager.get_or_create("n1");
        replica.insert_at(0, "hi").unwrap();

        assert_eq!(recorder.updates.lock().unwrap().len(), 1);
        assert!(!recorder.content.lock().unwrap().is_empty());
    }

    #[test]
    fn destroy_drops_the_replica() {
        let manager = DocumentManager::new();
        manager.get_or_create("n1");
        assert!(manager.has("n1"));
        manager.destroy("n1");
        assert!(!manager.has("n1"));
    }
}
