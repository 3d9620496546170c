//! Shared test fakes, used by this crate's own unit and integration tests
//! and exported for host applications to test their own sync wiring
//! against without standing up a real server.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use crate::error::Result;
use crate::http::SyncHttpClient;
use crate::types::{CrdtSyncRequest, CrdtSyncResponse};

/// A [`SyncHttpClient`] returning pre-scripted responses, in reverse-push
/// order (the last pushed response is returned first, matching the teacher
/// pack's usual `Vec::pop`-as-queue test fixture shape).
#[derive(Default)]
pub struct FakeSyncHttpClient {
    pub responses: Mutex<Vec<Result<CrdtSyncResponse>>>,
    pub received_requests: Mutex<Vec<CrdtSyncRequest>>,
}

impl FakeSyncHttpClient {
    /// Queue a response to be returned by the next `post_sync` call.
    pub fn push_response(&self, response: Result<CrdtSyncResponse>) {
        self.responses.lock().unwrap().push(response);
    }

    /// The most recently received request, if any.
    pub fn last_request(&self) -> Option<CrdtSyncRequest> {
        self.received_requests.lock().unwrap().last().cloned()
    }
}

impl SyncHttpClient for FakeSyncHttpClient {
    fn post_sync(
        &self,
        _server_url: &str,
        _token: &str,
        request: CrdtSyncRequest,
    ) -> impl Future<Output = Result<CrdtSyncResponse>> + Send {
        self.received_requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop();
        async move {
            next.unwrap_or_else(|| {
                Ok(CrdtSyncResponse {
                    updates: HashMap::new(),
                    metadata: Vec::new(),
                    server_time: chrono::Utc::now(),
                })
            })
        }
    }
}
