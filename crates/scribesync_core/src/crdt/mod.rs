//! The CRDT document layer: per-note replicas and the manager that owns
//! them.

pub mod manager;
pub mod replica;

pub use manager::{DocumentManager, DocumentManagerObserver};
pub use replica::{ContentCallback, Replica, UpdateCallback};
