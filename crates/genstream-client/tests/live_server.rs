use futures_util::StreamExt;
use genstream_client::{
    connect_to, ClientError, ClientEvent, ClientOutcome, HttpClient, MemorySessionStore,
    SessionStatus, SessionStore,
};
use genstream_server::{GenStreamServer, JobUpdate, ScriptedExecutor, ServerConfig};
use genstream_types::{Event, GenerateRequest};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct TestServer {
    base_url: String,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<genstream_server::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let executor = ScriptedExecutor::new(vec![
            JobUpdate::phase("research", "Researching"),
            JobUpdate::tool_start("web_fetch", "tool-1", json!({})),
            JobUpdate::tool_end("tool-1", true),
        ])
        .with_step_delay(Duration::from_millis(20));
        let server = GenStreamServer::with_config(
            Arc::new(executor),
            ServerConfig::default().with_logging(false),
        );

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_listener(listener, async {
            let _ = stopped.await;
        }));

        Self {
            base_url: format!("http://{}", addr),
            stop: Some(stop),
            handle,
        }
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn reconnector_follows_a_live_session() {
    let server = TestServer::start().await;
    let store = Arc::new(MemorySessionStore::new());
    let (reconnector, mut events) = connect_to(&server.base_url, store.clone());

    let outcome = reconnector
        .start("P", Some("S1".to_string()))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ClientOutcome::Completed {
            session_id: "S1".to_string(),
            image_count: 0
        }
    );
    assert!(store.active_session().await.unwrap().is_none());

    let mut ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Server(message) = event {
            ids.extend(message.id);
        }
    }
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    drop(reconnector);
    server.shutdown().await;
}

#[tokio::test]
async fn http_client_streams_and_resumes() {
    let server = TestServer::start().await;
    let http = HttpClient::new(&server.base_url);
    http.health_check().await.unwrap();

    let mut stream = http
        .generate(&GenerateRequest::new("P").with_session_id("S2"))
        .await
        .unwrap();
    let mut ids = Vec::new();
    while let Some(message) = stream.next().await {
        let message = message.unwrap();
        ids.extend(message.id);
        if message.id.is_some() && message.event.is_terminal() {
            break;
        }
    }
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    let snapshot = http.status("S2").await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Completed);
    assert_eq!(snapshot.latest_event_id, 5);
    assert_eq!(http.list().await.unwrap().len(), 1);

    let resumed: Vec<_> = http
        .resume("S2", 3)
        .await
        .unwrap()
        .map(|message| message.unwrap())
        .collect()
        .await;
    assert_eq!(resumed[0].id, Some(4));
    assert!(matches!(resumed[1].event, Event::Complete { .. }));

    assert!(!http.cancel("S2").await.unwrap());
    assert!(matches!(
        http.status("ghost").await,
        Err(ClientError::SessionNotFound(_))
    ));
    assert!(matches!(
        http.resume("ghost", 0).await,
        Err(ClientError::SessionNotFound(_))
    ));

    server.shutdown().await;
}
