//! The HTTP leg of the Sync Coordinator's full-sync request/response cycle.

use std::future::Future;

use crate::error::{Result, SyncCoreError};
use crate::types::{CrdtSyncRequest, CrdtSyncResponse};

/// A capability interface over the `POST /api/sync/crdt` endpoint, kept
/// behind a trait so the coordinator's full-sync algorithm is testable
/// without a live server.
pub trait SyncHttpClient: Send + Sync {
    /// POST `request` to `<server_url>/api/sync/crdt` with the given bearer
    /// token. Non-2xx responses surface as [`SyncCoreError::Http`]; a
    /// missing/rejected token surfaces as [`SyncCoreError::Auth`].
    fn post_sync(
        &self,
        server_url: &str,
        token: &str,
        request: CrdtSyncRequest,
    ) -> impl Future<Output = Result<CrdtSyncResponse>> + Send;
}

/// The production [`SyncHttpClient`], backed by `reqwest`.
#[cfg(feature = "native-sync")]
pub struct ReqwestSyncHttpClient {
    client: reqwest::Client,
}

#[cfg(feature = "native-sync")]
impl ReqwestSyncHttpClient {
    /// Build a client using `reqwest`'s default configuration.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "native-sync")]
impl Default for ReqwestSyncHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "native-sync")]
impl SyncHttpClient for ReqwestSyncHttpClient {
    fn post_sync(
        &self,
        server_url: &str,
        token: &str,
        request: CrdtSyncRequest,
    ) -> impl Future<Output = Result<CrdtSyncResponse>> + Send {
        let client = self.client.clone();
        let url = format!("{}/api/sync/crdt", server_url.trim_end_matches('/'));
        let token = token.to_string();
        async move {
            let response = client
                .post(&url)
                .bearer_auth(token)
                .json(&request)
                .send()
                .await
                .map_err(|e| SyncCoreError::network(format!("sync request failed: {e}")))?;

            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(SyncCoreError::Auth(format!(
                    "sync endpoint rejected credentials ({status})"
                )));
            }
            if !status.is_success() {
                return Err(SyncCoreError::Http(status.as_u16()));
            }

            response
                .json::<CrdtSyncResponse>()
                .await
                .map_err(|e| SyncCoreError::protocol(format!("invalid sync response body: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSyncHttpClient;

    #[tokio::test]
    async fn fake_client_defaults_to_an_empty_response() {
        let client = FakeSyncHttpClient::default();
        let response = client
            .post_sync("https://example.test", "tok", CrdtSyncRequest::default())
            .await
            .unwrap();
        assert!(response.updates.is_empty());
    }
}
