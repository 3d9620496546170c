//! Client-side synchronization core for a multi-device note-taking app.
//!
//! Splits each note into a CRDT-backed rich-text body (see [`crdt`]) and a
//! scalar metadata layer (see [`types::Note`]), kept in sync with a remote
//! server over a reconnecting WebSocket stream (see [`transport`]) with an
//! HTTP request/response fallback (see [`http`]) orchestrated by the
//! [`coordinator`]. [`facade`] is the surface a host application embeds.

pub mod codec;
pub mod crdt;
pub mod error;
pub mod http;
pub mod persistence;
pub mod test_support;
pub mod transport;
pub mod types;

#[cfg(feature = "native-sync")]
pub mod coordinator;
#[cfg(feature = "native-sync")]
pub mod facade;

pub use error::{Result, SyncCoreError};
pub use persistence::{InMemoryPersistence, LocalPersistencePort};
pub use types::{
    ConnectionState, CrdtState, FolderFilter, Note, NoteMetadataUpdate, SyncState, SyncStatus,
    UpdateOrigin,
};

pub use http::SyncHttpClient;
#[cfg(feature = "native-sync")]
pub use http::ReqwestSyncHttpClient;

#[cfg(feature = "native-sync")]
pub use coordinator::SyncCoordinator;
#[cfg(feature = "native-sync")]
pub use facade::NoteClient;
#[cfg(feature = "native-sync")]
pub use transport::{ReconnectConfig, SyncRequestPayload, SyncTransport, SyncTransportObserver};
