//! A single note's in-memory CRDT replica.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use yrs::types::xml::{XmlFragment, XmlOut};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, Transact, TransactionMut,
    Update, Xml, XmlElementPrelim, XmlFragmentRef, XmlTextPrelim,
};

use crate::codec::HtmlNode;
use crate::error::{Result, SyncCoreError};
use crate::types::UpdateOrigin;

const ROOT_FRAGMENT: &str = "body";
const TAG_REMOTE: &str = "remote";
const TAG_SYNC: &str = "sync";
const TAG_LOAD: &str = "load";
const TAG_POPULATE: &str = "populate";

fn origin_tag(origin: UpdateOrigin) -> Option<&'static str> {
    match origin {
        UpdateOrigin::Local => None,
        UpdateOrigin::Remote => Some(TAG_REMOTE),
        UpdateOrigin::Sync => Some(TAG_SYNC),
        UpdateOrigin::Load => Some(TAG_LOAD),
        UpdateOrigin::Populate => Some(TAG_POPULATE),
    }
}

/// True when a transaction's origin marks it as non-local (remote, sync,
/// load, or populate) per the manager's observer contract.
fn is_non_local(origin: Option<&Origin>) -> bool {
    match origin {
        None => false,
        Some(origin) => {
            let bytes = origin.as_ref();
            bytes == TAG_REMOTE.as_bytes()
                || bytes == TAG_SYNC.as_bytes()
                || bytes == TAG_LOAD.as_bytes()
                || bytes == TAG_POPULATE.as_bytes()
        }
    }
}

/// Fired once per local-edit transaction, with the emitted update bytes.
pub type UpdateCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;
/// Fired on every committed transaction that touches the root fragment.
pub type ContentCallback = Box<dyn Fn(String) + Send + Sync>;

/// In-memory CRDT state for one note, backed by a `yrs` document.
///
/// Installs an update observer (feeds the pending-update queue and
/// `on_local_update`) and a content observer (`on_content_change`) the
/// first time callbacks are registered; registration is idempotent.
pub struct Replica {
    doc: Doc,
    root: XmlFragmentRef,
    applying_remote: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<Vec<u8>>>>,
    update_sub: RwLock<Option<Subscription>>,
    content_sub: RwLock<Option<Subscription>>,
}

impl Replica {
    /// Create a fresh, empty replica.
    pub fn new() -> Self {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment(ROOT_FRAGMENT);
        Self {
            doc,
            root,
            applying_remote: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(Vec::new())),
            update_sub: RwLock::new(None),
            content_sub: RwLock::new(None),
        }
    }

    /// Whether the root fragment has no children yet.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.root.len(&txn) == 0
    }

    /// Register the update and content observers. Subsequent calls are a
    /// no-op so callers never end up with duplicate firing.
    pub fn set_callbacks(&self, on_update: UpdateCallback, on_content: ContentCallback) {
        {
            let mut guard = self.update_sub.write().expect("lock poisoned");
            if guard.is_none() {
                let pending = self.pending.clone();
                let applying = self.applying_remote.clone();
                let sub = self.doc.observe_update_v1(move |txn, event| {
                    if is_non_local(txn.origin()) || applying.load(Ordering::SeqCst) {
                        return;
                    }
                    let bytes = event.update.clone();
                    pending.lock().expect("lock poisoned").push(bytes.clone());
                    on_update(bytes);
                });
                match sub {
                    Ok(sub) => *guard = Some(sub),
                    Err(e) => log::warn!("failed to install update observer: {e}"),
                }
            }
        }
        {
            let mut guard = self.content_sub.write().expect("lock poisoned");
            if guard.is_none() {
                let root = self.root.clone();
                let sub = self.doc.observe_update_v1(move |txn, _event| {
                    let snapshot = root.get_string(txn);
                    on_content(snapshot);
                });
                match sub {
                    Ok(sub) => *guard = Some(sub),
                    Err(e) => log::warn!("failed to install content observer: {e}"),
                }
            }
        }
    }

    fn transact_with_origin(&self, origin: UpdateOrigin) -> TransactionMut<'_> {
        match origin_tag(origin) {
            None => self.doc.transact_mut(),
            Some(tag) => self.doc.transact_mut_with(tag),
        }
    }

    /// Insert `text` as a new leaf run at the end of the root fragment.
    ///
    /// This crate's replica keeps rich structure (elements with attributes)
    /// for HTML-seeded content but falls back to a single flat text leaf
    /// for content created directly through the API, which is all the
    /// editor binding (out of scope here) needs to drive.
    pub fn insert_at(&self, index: u32, text: &str) -> Result<()> {
        let mut txn = self.transact_with_origin(UpdateOrigin::Local);
        let run = self.text_leaf(&mut txn);
        run.insert(&mut txn, index, text);
        Ok(())
    }

    /// Delete `len` UTF-16 code units starting at `index` from the flat
    /// text leaf.
    pub fn delete_range(&self, index: u32, len: u32) -> Result<()> {
        let mut txn = self.transact_with_origin(UpdateOrigin::Local);
        let run = self.text_leaf(&mut txn);
        run.remove_range(&mut txn, index, len);
        Ok(())
    }

    fn text_leaf(&self, txn: &mut TransactionMut<'_>) -> yrs::XmlTextRef {
        if let Some(XmlOut::Text(existing)) = self.root.get(txn, 0) {
            return existing;
        }
        self.root.push_back(txn, XmlTextPrelim::new(""))
    }

    /// Render the root fragment as a serialized XML-ish string snapshot.
    pub fn text_snapshot(&self) -> String {
        let txn = self.doc.transact();
        self.root.get_string(&txn)
    }

    /// Populate the (assumed-empty) replica from a parsed HTML node forest
    /// under a single `populate`-origin transaction.
    pub(crate) fn populate(&self, nodes: &[HtmlNode]) -> Result<()> {
        let mut txn = self.transact_with_origin(UpdateOrigin::Populate);
        for node in nodes {
            insert_html_node(&mut txn, &self.root, node);
        }
        Ok(())
    }

    /// Full, self-contained state. Suitable for persistence or transmission.
    pub fn state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Compact summary of everything this replica has observed.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Update containing only the operations `remote_state_vector` is
    /// missing. Produces a valid (if larger) update even for an unknown or
    /// malformed vector.
    pub fn diff_since(&self, remote_state_vector: &[u8]) -> Vec<u8> {
        let sv = StateVector::decode_v1(remote_state_vector).unwrap_or_default();
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&sv)
    }

    /// Load a full state, applied with origin `load`. Merges rather than
    /// replaces when the replica is already non-empty; never fails because
    /// the CRDT algebra is commutative and idempotent.
    pub fn load(&self, ydoc_state: &[u8]) -> Result<()> {
        self.apply_update(ydoc_state, UpdateOrigin::Load)
    }

    /// Apply a remote/sync/load update. Never emits a local-update event:
    /// the `applying_remote` guard suppresses the update observer for the
    /// duration of the transaction.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let update = Update::decode_v1(update)
            .map_err(|e| SyncCoreError::decode(format!("corrupt CRDT update: {e}")))?;
        self.applying_remote.store(true, Ordering::SeqCst);
        let result = {
            let mut txn = self.transact_with_origin(origin);
            txn.apply_update(update)
                .map_err(|e| SyncCoreError::invariant(format!("update rejected: {e}")))
        };
        self.applying_remote.store(false, Ordering::SeqCst);
        result
    }

    /// Drain the pending local updates accumulated since the last flush.
    pub fn flush_pending(&self) -> Vec<Vec<u8>> {
        let mut guard = self.pending.lock().expect("lock poisoned");
        std::mem::take(&mut *guard)
    }

    /// Number of updates currently queued but not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("state_len", &self.state().len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn insert_html_node(txn: &mut TransactionMut<'_>, parent: &XmlFragmentRef, node: &HtmlNode) {
    match node {
        HtmlNode::Text(text) => {
            parent.push_back(txn, XmlTextPrelim::new(text.as_str()));
        }
        HtmlNode::Element {
            tag,
            attrs,
            children,
        } => {
            let element = parent.push_back(txn, XmlElementPrelim::empty(tag.as_str()));
            for (key, value) in attrs {
                element.insert_attribute(txn, key.as_str(), value.as_str());
            }
            for child in children {
                insert_html_node_into_element(txn, &element, child);
            }
        }
    }
}

fn insert_html_node_into_element(
    txn: &mut TransactionMut<'_>,
    parent: &yrs::XmlElementRef,
    node: &HtmlNode,
) {
    match node {
        HtmlNode::Text(text) => {
            parent.push_back(txn, XmlTextPrelim::new(text.as_str()));
        }
        HtmlNode::Element {
            tag,
            attrs,
            children,
        } => {
            let element = parent.push_back(txn, XmlElementPrelim::empty(tag.as_str()));
            for (key, value) in attrs {
                element.insert_attribute(txn, key.as_str(), value.as_str());
            }
            for child in children {
                insert_html_node_into_element(txn, &element, child);
            }
        }
    }
}
