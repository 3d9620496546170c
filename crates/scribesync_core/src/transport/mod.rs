//! The Streaming Sync Transport: a reconnecting WebSocket channel that
//! multiplexes subscribe/unsubscribe, update, and sync-request/response
//! frames.

#[cfg(feature = "native-sync")]
pub mod client;
pub mod frame;

#[cfg(feature = "native-sync")]
pub use client::{ReconnectConfig, SyncRequestPayload, SyncTransport, SyncTransportObserver};
pub use frame::{Frame, FrameType};
