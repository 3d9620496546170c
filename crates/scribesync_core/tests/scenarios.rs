//! End-to-end scenarios exercised against in-memory fakes: a note client
//! talking to a scripted `SyncHttpClient` plays the role of the server side
//! of a full sync, and a real local WebSocket listener plays the server
//! side of the streaming transport for the reconnect-replay scenario.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use scribesync_core::coordinator::SyncCoordinator;
use scribesync_core::crdt::DocumentManager;
use scribesync_core::persistence::{InMemoryPersistence, LocalPersistencePort};
use scribesync_core::test_support::FakeSyncHttpClient;
use scribesync_core::transport::{Frame, SyncTransport};
use scribesync_core::types::{CrdtSyncResponse, FolderFilter, Note};

fn new_coordinator() -> Arc<SyncCoordinator<InMemoryPersistence, FakeSyncHttpClient>> {
    let coordinator = SyncCoordinator::new(
        Arc::new(InMemoryPersistence::new()),
        Arc::new(FakeSyncHttpClient::default()),
        Arc::new(DocumentManager::new()),
    );
    coordinator.attach_manager_only();
    coordinator
}

fn empty_response() -> CrdtSyncResponse {
    CrdtSyncResponse {
        updates: HashMap::new(),
        metadata: Vec::new(),
        server_time: Utc::now(),
    }
}

#[tokio::test]
async fn fresh_push() {
    let coordinator = new_coordinator();
    let mut note = Note::new("Hello", None, false);
    let replica = coordinator.manager().get_or_create(&note.id);
    replica.insert_at(0, "world").unwrap();
    note.content = replica.text_snapshot();
    coordinator.persistence().save_note(note.clone()).await.unwrap();

    coordinator.http().push_response(Ok(empty_response()));

    coordinator
        .full_sync("https://example.test", "tok", None)
        .await
        .unwrap();

    let sent = coordinator.http().last_request().expect("a request was sent");
    assert!(sent.updates.get(&note.id).is_none() || sent.updates[&note.id].is_empty());
    let entry = sent
        .metadata
        .iter()
        .find(|m| m.id == note.id)
        .expect("note metadata present");
    assert_eq!(entry.title, "Hello");
    assert!(entry.updated_at >= note.updated_at);
}

#[tokio::test]
async fn offline_merge() {
    let coordinator_a = new_coordinator();
    let coordinator_b = new_coordinator();

    let mut note = Note::new("Shared", None, false);
    let replica_a = coordinator_a.manager().get_or_create(&note.id);
    replica_a.insert_at(0, "base").unwrap();
    let base_state = replica_a.state();
    note.content = replica_a.text_snapshot();
    coordinator_a.persistence().save_note(note.clone()).await.unwrap();

    let replica_b = coordinator_b.manager().get_or_create(&note.id);
    replica_b.load(&base_state).unwrap();
    coordinator_b.persistence().save_note(note.clone()).await.unwrap();

    replica_a.insert_at(0, " from A").unwrap();
    replica_b.insert_at(0, " from B").unwrap();

    // A syncs first: its update becomes the server's canonical state.
    coordinator_a.http().push_response(Ok(empty_response()));
    coordinator_a
        .full_sync("https://example.test", "tok", None)
        .await
        .unwrap();
    let a_request = coordinator_a.http().last_request().unwrap();
    let a_update_b64 = a_request.updates.get(&note.id).cloned().unwrap();

    // B syncs second: server hands back A's update, merges into B.
    coordinator_b.http().push_response(Ok(CrdtSyncResponse {
        updates: HashMap::from([(note.id.clone(), a_update_b64)]),
        metadata: Vec::new(),
        server_time: Utc::now(),
    }));
    coordinator_b
        .full_sync("https://example.test", "tok", None)
        .await
        .unwrap();
    let b_request = coordinator_b.http().last_request().unwrap();
    let b_update_b64 = b_request.updates.get(&note.id).cloned().unwrap();

    // A syncs a second time, receiving B's update back.
    coordinator_a.http().push_response(Ok(CrdtSyncResponse {
        updates: HashMap::from([(note.id.clone(), b_update_b64)]),
        metadata: Vec::new(),
        server_time: Utc::now(),
    }));
    coordinator_a
        .full_sync("https://example.test", "tok", None)
        .await
        .unwrap();

    let snapshot_a = replica_a.text_snapshot().replace(char::is_whitespace, "");
    let snapshot_b = replica_b.text_snapshot().replace(char::is_whitespace, "");
    assert!(snapshot_a.contains("fromA") && snapshot_a.contains("fromB"));
    assert!(snapshot_b.contains("fromA") && snapshot_b.contains("fromB"));
    assert_eq!(replica_a.state(), replica_b.state());
}

#[tokio::test]
async fn soft_delete_propagation() {
    let coordinator_b = new_coordinator();
    let mut note = Note::new("Folder note", Some("f1".to_string()), false);
    coordinator_b.persistence().save_note(note.clone()).await.unwrap();

    note.is_deleted = true;
    note.updated_at = Utc::now();
    let metadata_entry = scribesync_core::types::NoteMetadataUpdate::from(&note);

    coordinator_b.http().push_response(Ok(CrdtSyncResponse {
        updates: HashMap::new(),
        metadata: vec![metadata_entry],
        server_time: Utc::now(),
    }));
    coordinator_b
        .full_sync("https://example.test", "tok", None)
        .await
        .unwrap();

    let all = coordinator_b.persistence().list_notes(FolderFilter::All).await.unwrap();
    let stored = all.iter().find(|n| n.id == note.id).unwrap();
    assert!(stored.is_deleted);

    let in_folder = coordinator_b
        .persistence()
        .list_notes(FolderFilter::Folder("f1".to_string()))
        .await
        .unwrap();
    assert!(in_folder.is_empty());
}

#[tokio::test]
async fn content_only_seeding() {
    let coordinator = new_coordinator();
    let mut note = Note::new("Seeded", None, false);
    note.content = "<p>hi</p>".to_string();
    coordinator.persistence().save_note(note.clone()).await.unwrap();

    coordinator.http().push_response(Ok(empty_response()));
    coordinator
        .full_sync("https://example.test", "tok", None)
        .await
        .unwrap();

    let sent = coordinator.http().last_request().unwrap();
    assert!(sent.state_vectors.contains_key(&note.id));
    assert!(!sent.updates.get(&note.id).unwrap_or(&String::new()).is_empty());

    let rows = coordinator.persistence().list_all_crdt().await.unwrap();
    let row = rows.iter().find(|r| r.note_id == note.id).expect("crdt row persisted");
    assert!(row.ydoc_state.len() > 2);
}

#[tokio::test]
async fn metadata_tiebreak() {
    let coordinator = new_coordinator();
    let ts: DateTime<Utc> = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    let mut note = Note::new("Local", None, false);
    note.id = "n1".to_string();
    note.updated_at = ts;
    coordinator.persistence().save_note(note.clone()).await.unwrap();

    let mut server_entry = scribesync_core::types::NoteMetadataUpdate::from(&note);
    server_entry.title = "Server".to_string();
    server_entry.updated_at = ts;

    coordinator.http().push_response(Ok(CrdtSyncResponse {
        updates: HashMap::new(),
        metadata: vec![server_entry],
        server_time: Utc::now(),
    }));
    coordinator
        .full_sync("https://example.test", "tok", None)
        .await
        .unwrap();

    let stored = coordinator.persistence().get_note("n1").await.unwrap().unwrap();
    assert_eq!(stored.title, "Local");
}

#[tokio::test]
async fn reconnect_replay() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let received: Arc<std::sync::Mutex<Vec<Vec<Frame>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let received_for_server = received.clone();

    tokio::spawn(async move {
        for attempt in 0..2 {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            received_for_server.lock().unwrap().push(Vec::new());

            if attempt == 0 {
                // Read exactly one frame (the live subscribe), then drop the
                // socket without a close frame to simulate an abnormal close.
                if let Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) =
                    ws.next().await
                {
                    let frame: Frame = serde_json::from_str(&text).unwrap();
                    received_for_server.lock().unwrap()[attempt].push(frame);
                }
                drop(ws);
            } else {
                for _ in 0..2 {
                    match ws.next().await {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                            let frame: Frame = serde_json::from_str(&text).unwrap();
                            received_for_server.lock().unwrap()[attempt].push(frame);
                        }
                        _ => break,
                    }
                }
            }
        }
    });

    let transport = Arc::new(SyncTransport::new(format!("ws://{addr}/api/ws"), "tok"));
    transport.connect().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.subscribe("n1");

    // Give the server time to read the subscribe and drop the connection,
    // then give the client time to reconnect and replay.
    tokio::time::sleep(Duration::from_millis(1700)).await;

    let log = received.lock().unwrap();
    assert!(log.len() >= 2, "expected a reconnect to have occurred");
    let replayed = &log[1];
    assert!(!replayed.is_empty(), "expected the reconnect to replay the subscription");
    assert_eq!(replayed[0].frame_type, scribesync_core::transport::FrameType::Subscribe);
    assert_eq!(replayed[0].note_id.as_deref(), Some("n1"));
}
