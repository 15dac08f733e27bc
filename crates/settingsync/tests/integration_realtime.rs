use serde_json::{Map, json};
use settingsync::client::{RespTransport, SettingsTransport};
use settingsync::config::StorageConfig;
use settingsync::proto::realtime::{Ack, Frame, frame::Body};
use settingsync::realtime::{read_frame, write_frame};
use settingsync::{
    ApiServer, Authenticator, Document, FanoutBus, LogicalClock, Patch, RealtimeClient,
    RealtimeEvent, RealtimeListener, Scope, Server, ServerWrapper, SettingsCipher, SqliteStorage,
    SyncError, VersionStamp, WriteOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;

const MAX_BYTES: usize = 1024 * 1024;
const SECRET: &str = "integration-secret";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One node with both listeners bound to ephemeral ports
struct TestNode {
    _temp: TempDir,
    api_addr: String,
    realtime_addr: String,
    auth: Authenticator,
}

async fn start_node() -> TestNode {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let temp = TempDir::new().unwrap();
    let storage_config = StorageConfig {
        sqlite_cache_size: 1000,
        sqlite_busy_timeout: 5000,
    };
    let storage = Arc::new(SqliteStorage::open(temp.path().join("node.db"), &storage_config).unwrap());
    let server = Arc::new(
        Server::new(storage, SettingsCipher::new(&[9u8; 32]))
            .await
            .unwrap(),
    );
    let auth = Arc::new(Authenticator::new(SECRET).unwrap());
    let wrapper = Arc::new(ServerWrapper::new(server, FanoutBus::new(64), auth));

    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let realtime_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = api_listener.local_addr().unwrap().to_string();
    let realtime_addr = realtime_listener.local_addr().unwrap().to_string();

    let api = ApiServer::new(Arc::clone(&wrapper), MAX_BYTES);
    tokio::spawn(async move { api.serve(api_listener).await });
    let realtime = RealtimeListener::new(wrapper, MAX_BYTES);
    tokio::spawn(async move { realtime.serve(realtime_listener).await });

    TestNode {
        _temp: temp,
        api_addr,
        realtime_addr,
        auth: Authenticator::new(SECRET).unwrap(),
    }
}

impl TestNode {
    fn token(&self, owner: &str) -> String {
        self.auth.issue(owner, Duration::from_secs(300))
    }

    fn api(&self, token: Option<String>) -> RespTransport {
        RespTransport::new(self.api_addr.clone(), token, MAX_BYTES)
    }

    async fn subscribe(&self, scope: &Scope, token: Option<&str>) -> settingsync::Result<RealtimeClient> {
        RealtimeClient::connect(&self.realtime_addr, scope, token, MAX_BYTES, REQUEST_TIMEOUT).await
    }
}

async fn next_event(client: &mut RealtimeClient) -> RealtimeEvent {
    timeout(Duration::from_secs(5), client.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed")
}

async fn assert_quiet(client: &mut RealtimeClient) {
    assert!(
        timeout(Duration::from_millis(200), client.next_event())
            .await
            .is_err(),
        "unexpected event"
    );
}

fn doc(theme: &str) -> Document {
    let mut doc = Document::new();
    doc.set_setting("theme", json!(theme));
    doc
}

fn photo(src: &str) -> Map<String, serde_json::Value> {
    let mut item = Map::new();
    item.insert("src".into(), json!(src));
    item
}

#[tokio::test]
async fn test_resp_fetch_and_replace() {
    let node = start_node().await;
    let api = node.api(None);

    api.ping().await.unwrap();
    assert_eq!(api.fetch(&Scope::Public).await.unwrap(), None);

    let outcome = api
        .replace(&Scope::Public, &doc("dusk"), None, Some(1000))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WriteOutcome::Accepted(VersionStamp {
            version: 1,
            updated_at: 1000
        })
    );

    let snapshot = api.fetch(&Scope::Public).await.unwrap().unwrap();
    assert_eq!(snapshot.document, doc("dusk"));
    assert_eq!(snapshot.version, 1);

    // An older timestamp gets the stored copy back
    match api
        .replace(&Scope::Public, &doc("dawn"), Some(1), Some(500))
        .await
        .unwrap()
    {
        WriteOutcome::Conflict(current) => assert_eq!(current, snapshot),
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_resp_owner_scope() {
    let node = start_node().await;
    let scope = Scope::owner("5");

    let err = node.api(None).fetch(&scope).await.unwrap_err();
    assert!(matches!(err, SyncError::Authorization(_)));

    let err = node
        .api(Some("not-a-token".into()))
        .replace(&scope, &doc("x"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Authorization(_)));

    let owner = node.api(Some(node.token("5")));
    assert!(matches!(
        owner.replace(&scope, &doc("mine"), None, None).await.unwrap(),
        WriteOutcome::Accepted(stamp) if stamp.version == 1
    ));
    assert_eq!(owner.fetch(&scope).await.unwrap().unwrap().document, doc("mine"));
}

#[tokio::test]
async fn test_patch_reaches_other_subscribers_only() {
    let node = start_node().await;
    let mut alice = node.subscribe(&Scope::Public, None).await.unwrap();
    let mut bob = node.subscribe(&Scope::Public, None).await.unwrap();
    assert_eq!(alice.subscribed_at().version, 0);

    let patch = Patch::add("gallery", "p1", photo("a.jpg"), LogicalClock::new(1000, "alice"));
    let stamp = alice.submit(&patch).await.unwrap();
    assert_eq!(stamp, VersionStamp { version: 1, updated_at: 1000 });

    assert_eq!(
        next_event(&mut bob).await,
        RealtimeEvent::Patch {
            patch,
            stamp
        }
    );
    assert_eq!(next_event(&mut bob).await, RealtimeEvent::VersionBumped(stamp));

    // The sender only hears about the new version
    assert_eq!(next_event(&mut alice).await, RealtimeEvent::VersionBumped(stamp));
    assert_quiet(&mut alice).await;

    let api = node.api(None);
    let gallery = api.fetch(&Scope::Public).await.unwrap().unwrap().document;
    let item = gallery.collection("gallery").unwrap().item("p1").unwrap();
    assert_eq!(item.get("src"), Some(&json!("a.jpg")));
}

#[tokio::test]
async fn test_redelivered_patch_is_not_rebroadcast() {
    let node = start_node().await;
    let mut alice = node.subscribe(&Scope::Public, None).await.unwrap();
    let mut bob = node.subscribe(&Scope::Public, None).await.unwrap();

    let remove = Patch::remove("gallery", "p1", LogicalClock::new(3000, "alice"));
    let first = alice.submit(&remove).await.unwrap();
    assert_eq!(
        next_event(&mut bob).await,
        RealtimeEvent::Patch {
            patch: remove.clone(),
            stamp: first
        }
    );
    assert_eq!(next_event(&mut bob).await, RealtimeEvent::VersionBumped(first));

    let again = alice.submit(&remove).await.unwrap();
    assert_eq!(again, first);
    assert_quiet(&mut bob).await;
}

#[tokio::test]
async fn test_invalid_patch_is_rejected() {
    let node = start_node().await;
    let mut alice = node.subscribe(&Scope::Public, None).await.unwrap();
    let mut bob = node.subscribe(&Scope::Public, None).await.unwrap();

    let bad = Patch::update("gallery", "p1", "caption", json!("x"), LogicalClock::new(10, ""));
    let err = alice.submit(&bad).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert_quiet(&mut bob).await;

    // The session stays usable after a rejected patch
    let good = Patch::add("gallery", "p1", photo("b.jpg"), LogicalClock::new(11, "alice"));
    assert_eq!(alice.submit(&good).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_owner_subscription_requires_token() {
    let node = start_node().await;
    let scope = Scope::owner("12");

    let err = node.subscribe(&scope, None).await.unwrap_err();
    assert!(matches!(err, SyncError::Authorization(_)));

    let other = node.token("13");
    let err = node.subscribe(&scope, Some(&other)).await.unwrap_err();
    assert!(matches!(err, SyncError::Authorization(_)));

    let token = node.token("12");
    let client = node.subscribe(&scope, Some(&token)).await.unwrap();
    assert_eq!(client.scope(), &scope);
}

#[tokio::test]
async fn test_replace_bumps_realtime_subscribers() {
    let node = start_node().await;
    let api = node.api(None);
    api.replace(&Scope::Public, &doc("one"), None, Some(100))
        .await
        .unwrap();

    let mut watcher = node.subscribe(&Scope::Public, None).await.unwrap();
    assert_eq!(
        watcher.subscribed_at(),
        VersionStamp {
            version: 1,
            updated_at: 100
        }
    );

    let WriteOutcome::Accepted(stamp) = api
        .replace(&Scope::Public, &doc("two"), Some(1), Some(200))
        .await
        .unwrap()
    else {
        panic!("replace should be accepted");
    };
    assert_eq!(next_event(&mut watcher).await, RealtimeEvent::VersionBumped(stamp));

    // Other scopes stay quiet
    let token = node.token("1");
    let mut owner_watcher = node.subscribe(&Scope::owner("1"), Some(&token)).await.unwrap();
    api.replace(&Scope::Public, &doc("three"), None, Some(300))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut watcher).await,
        RealtimeEvent::VersionBumped(s) if s.version == 3
    ));
    assert_quiet(&mut owner_watcher).await;
}

/// Accepts one connection, acks its Subscribe if asked to, then never
/// answers again while keeping the socket open
async fn silent_server(ack_subscribe: bool) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = socket.into_split();
        let _subscribe = read_frame(&mut reader, MAX_BYTES).await.unwrap();
        if ack_subscribe {
            let ack = Frame::new(Body::Ack(Ack {
                request_id: 0,
                ok: true,
                ..Default::default()
            }));
            write_frame(&mut writer, &ack).await.unwrap();
        }
        // Swallow whatever arrives without replying
        while let Ok(Some(_)) = read_frame(&mut reader, MAX_BYTES).await {}
    });
    (addr, handle)
}

#[tokio::test]
async fn test_submit_without_ack_times_out() {
    let (addr, server) = silent_server(true).await;
    let mut client = RealtimeClient::connect(
        &addr,
        &Scope::Public,
        None,
        MAX_BYTES,
        Duration::from_millis(200),
    )
    .await
    .unwrap();

    let patch = Patch::remove("gallery", "p1", LogicalClock::new(1, "alice"));
    let result = timeout(Duration::from_secs(3), client.submit(&patch))
        .await
        .expect("submit was not bounded");
    assert!(matches!(result, Err(SyncError::TransientIo(_))));

    // The client is still usable and times out again rather than hanging
    let again = timeout(Duration::from_secs(3), client.submit(&patch))
        .await
        .expect("second submit was not bounded");
    assert!(matches!(again, Err(SyncError::TransientIo(_))));
    server.abort();
}

#[tokio::test]
async fn test_unacknowledged_subscribe_times_out() {
    let (addr, server) = silent_server(false).await;
    let result = timeout(
        Duration::from_secs(3),
        RealtimeClient::connect(&addr, &Scope::Public, None, MAX_BYTES, Duration::from_millis(200)),
    )
    .await
    .expect("connect was not bounded");
    assert!(matches!(result, Err(SyncError::TransientIo(_))));
    server.abort();
}

#[tokio::test]
async fn test_submit_after_disconnect_fails_fast() {
    let (addr, server) = silent_server(true).await;
    let mut client = RealtimeClient::connect(&addr, &Scope::Public, None, MAX_BYTES, REQUEST_TIMEOUT)
        .await
        .unwrap();

    // Dropping the server task closes its socket halves
    server.abort();
    let _ = server.await;
    assert_eq!(timeout(Duration::from_secs(3), client.next_event()).await.unwrap(), None);

    let patch = Patch::remove("gallery", "p1", LogicalClock::new(1, "alice"));
    let result = timeout(Duration::from_secs(1), client.submit(&patch))
        .await
        .expect("submit on a closed connection hung");
    assert!(matches!(result, Err(SyncError::TransientIo(_))));
}
