//! End-to-end tests: a real server on ephemeral ports, the real client

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use tablecast_core::client::{
    BackoffPolicy, ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager,
};
use tablecast_core::server::{self, HubOptions, RunningServer};
use tablecast_core::{ServerMessage, SyncConfig};

struct Fixture {
    server: RunningServer,
    dir: TempDir,
}

impl Fixture {
    /// Server driven by explicit refreshes only
    async fn start() -> Self {
        Self::start_with(false, Duration::from_millis(20)).await
    }

    async fn start_with(watch_filesystem: bool, debounce: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let options = HubOptions {
            debounce,
            watch_filesystem,
            session_ping_interval: Duration::from_secs(3600),
            session_timeout: Duration::from_secs(7200),
            upload_dir: dir.path().join("uploads"),
            ..HubOptions::default()
        };
        let server = server::start(options, "127.0.0.1:0", "127.0.0.1:0")
            .await
            .unwrap();
        Self { server, dir }
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn register(&self, id: &str, name: &str, content: &str) -> PathBuf {
        let path = self.write(name, content);
        self.server
            .hub
            .register_file(id, id, path.clone())
            .await
            .unwrap();
        path
    }

    async fn client(&self) -> (ConnectionHandle, broadcast::Receiver<ConnectionEvent>) {
        let manager = ConnectionManager::new(ConnectionConfig {
            url: self.server.ws_url(),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        });
        let mut events = manager.subscribe();
        let handle = manager.connect();
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Connected { .. })).await;
        (handle, events)
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    pick: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pick(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn next_message(events: &mut broadcast::Receiver<ConnectionEvent>) -> ServerMessage {
    match wait_for(events, |e| matches!(e, ConnectionEvent::Message(_))).await {
        ConnectionEvent::Message(message) => message,
        other => panic!("Expected a message, got {:?}", other),
    }
}

async fn expect_sync_started(events: &mut broadcast::Receiver<ConnectionEvent>) {
    match next_message(events).await {
        ServerMessage::SyncStarted { .. } => {}
        other => panic!("Expected sync-started, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cell_edit_reaches_subscriber() {
    let fx = Fixture::start().await;
    let path = fx
        .register("colors", "colors.csv", "Name,Color\nApple,#FF0000\n")
        .await;

    let (client, mut events) = fx.client().await;
    client
        .start_sync("colors", "collection-1", SyncConfig::default())
        .unwrap();
    expect_sync_started(&mut events).await;

    std::fs::write(&path, "Name,Color\nApple,#00FF00\n").unwrap();
    fx.server.hub.refresh("colors").await.unwrap();

    match next_message(&mut events).await {
        ServerMessage::SheetUpdate {
            data_source_id,
            collection_id,
            changes,
            headers,
            ..
        } => {
            assert_eq!(data_source_id, "colors");
            assert_eq!(collection_id, "collection-1");
            assert_eq!(changes.len(), 1);
            assert_eq!(changes.get(0, 1), Some("#00FF00"));
            assert!(headers.is_none());
        }
        other => panic!("Expected sheet-update, got {:?}", other),
    }

    client.close().await;
    fx.server.shutdown();
}

#[tokio::test]
async fn test_saved_file_is_pushed_once_per_burst() {
    let fx = Fixture::start_with(true, Duration::from_millis(300)).await;
    let path = fx
        .register("colors", "colors.csv", "Name,Color\nApple,#FF0000\n")
        .await;

    let (client, mut events) = fx.client().await;
    client
        .start_sync("colors", "collection-1", SyncConfig::default())
        .unwrap();
    expect_sync_started(&mut events).await;

    // Several saves inside one debounce window, no manual refresh
    std::fs::write(&path, "Name,Color\nApple,#111111\n").unwrap();
    std::fs::write(&path, "Name,Color\nApple,#222222\n").unwrap();
    std::fs::write(&path, "Name,Color\nApple,#00FF00\n").unwrap();

    match next_message(&mut events).await {
        ServerMessage::SheetUpdate { changes, .. } => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes.get(0, 1), Some("#00FF00"));
        }
        other => panic!("Expected sheet-update, got {:?}", other),
    }

    // Nothing else arrives before a later pong
    tokio::time::sleep(Duration::from_millis(1000)).await;
    client.send(tablecast_core::ClientMessage::Ping).unwrap();
    loop {
        match next_message(&mut events).await {
            ServerMessage::Pong { .. } => break,
            ServerMessage::SheetUpdate { changes, .. } => {
                panic!("Unexpected second update: {:?}", changes)
            }
            _ => {}
        }
    }

    client.close().await;
    fx.server.shutdown();
}

#[tokio::test]
async fn test_updates_only_reach_subscribers_of_that_source() {
    let fx = Fixture::start().await;
    let s1 = fx.register("S1", "s1.csv", "Name,Size\nBox,10\n").await;
    fx.register("S2", "s2.csv", "Name,Size\nBag,20\n").await;

    let (a, mut a_events) = fx.client().await;
    let (b, mut b_events) = fx.client().await;
    a.start_sync("S1", "C1", SyncConfig::default()).unwrap();
    b.start_sync("S2", "C2", SyncConfig::default()).unwrap();
    expect_sync_started(&mut a_events).await;
    expect_sync_started(&mut b_events).await;

    std::fs::write(&s1, "Name,Size\nBox,11\n").unwrap();
    fx.server.hub.refresh("S1").await.unwrap();

    match next_message(&mut a_events).await {
        ServerMessage::SheetUpdate { changes, .. } => {
            assert_eq!(changes.get(0, 1), Some("11"));
        }
        other => panic!("Expected sheet-update, got {:?}", other),
    }

    // B is still served, and saw nothing for S1
    b.send(tablecast_core::ClientMessage::Ping).unwrap();
    assert!(matches!(
        next_message(&mut b_events).await,
        ServerMessage::Pong { .. }
    ));

    a.close().await;
    b.close().await;
    fx.server.shutdown();
}

#[tokio::test]
async fn test_request_data_and_unknown_source() {
    let fx = Fixture::start().await;
    fx.register("colors", "colors.csv", "Name,Color\nApple,\"#FF0000, bright\"\n")
        .await;

    let (client, mut events) = fx.client().await;

    client
        .send(tablecast_core::ClientMessage::RequestData {
            data_source_id: "colors".to_string(),
        })
        .unwrap();
    match next_message(&mut events).await {
        ServerMessage::SheetData { headers, rows, .. } => {
            assert_eq!(headers, vec!["Name", "Color"]);
            assert_eq!(rows, vec![vec!["Apple", "#FF0000, bright"]]);
        }
        other => panic!("Expected sheet-data, got {:?}", other),
    }

    client
        .start_sync("missing", "C1", SyncConfig::default())
        .unwrap();
    match next_message(&mut events).await {
        ServerMessage::Error { error, .. } => assert!(error.contains("missing")),
        other => panic!("Expected error, got {:?}", other),
    }

    client.close().await;
    fx.server.shutdown();
}

#[tokio::test]
async fn test_http_side_channel() {
    let fx = Fixture::start().await;
    let base = fx.server.http_url();
    let http = reqwest::Client::new();

    let health: serde_json::Value = http
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["sources"], 0);

    let response = http
        .post(format!("{}/api/sources", base))
        .json(&serde_json::json!({
            "fileName": "colors.csv",
            "content": "Name,Color\nApple,#FF0000\n",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let summary: serde_json::Value = response.json().await.unwrap();
    let id = summary["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("local-colors_csv-"));
    assert_eq!(summary["title"], "colors");
    assert!(fx.dir.path().join("uploads").join(format!("{}.csv", id)).exists());

    let snapshot: serde_json::Value = http
        .get(format!("{}/api/sources/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["rows"][0][1], "#FF0000");

    let listed: Vec<serde_json::Value> = http
        .get(format!("{}/api/sources", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let refreshed = http
        .post(format!("{}/api/sources/{}/refresh", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(refreshed.status(), reqwest::StatusCode::ACCEPTED);

    let missing = http
        .get(format!("{}/api/sources/nope", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(body["error"], "NOT_FOUND");

    let invalid = http
        .post(format!("{}/api/sources", base))
        .json(&serde_json::json!({
            "fileName": "broken.csv",
            "content": "Name\n\"unterminated\n",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), reqwest::StatusCode::BAD_REQUEST);

    fx.server.shutdown();
}

#[tokio::test]
async fn test_client_gives_up_when_server_is_gone() {
    let fx = Fixture::start().await;
    let url = fx.server.ws_url();
    fx.server.shutdown();
    // Let the aborted listener release the port
    tokio::time::sleep(Duration::from_millis(50)).await;

    let manager = ConnectionManager::new(ConnectionConfig {
        url,
        connect_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            max_attempts: 2,
        },
    });
    let mut events = manager.subscribe();
    let handle = manager.connect();

    match wait_for(&mut events, |e| {
        matches!(e, ConnectionEvent::Error(msg) if msg.contains("Gave up"))
    })
    .await
    {
        ConnectionEvent::Error(msg) => assert!(msg.contains("2 attempts")),
        other => panic!("Expected exhaustion error, got {:?}", other),
    }
    assert_eq!(
        handle.state(),
        tablecast_core::client::ConnectionState::Failed
    );
}
