use genstream_server::{
    AbortRegistry, ClientChannel, ClientMessage, Event, EventLog, GenStreamServer, JobUpdate,
    Multiplexer, ScriptedExecutor, ServerConfig, ServerMessage, SessionRegistry, TransportKind,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn research_run() -> ScriptedExecutor {
    ScriptedExecutor::new(vec![
        JobUpdate::phase("research", "Researching"),
        JobUpdate::tool_start("web_fetch", "tool-1", json!({"url": "https://example.com"})),
        JobUpdate::tool_end("tool-1", true),
    ])
    .with_step_delay(Duration::from_secs(10))
}

fn ids(messages: &[ServerMessage]) -> Vec<u64> {
    messages.iter().filter_map(|m| m.id).collect()
}

#[tokio::test(start_paused = true)]
async fn reconnect_after_disconnect_receives_only_missed_events() {
    let registry = SessionRegistry::new(ServerConfig::default(), Arc::new(research_run()));

    let (first, mut first_rx) = ClientChannel::new(TransportKind::WebSocket);
    registry
        .start_generation("P", Some("S1".to_string()), Some(&first))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(15)).await;
    let seen = first_rx.drain_messages();
    assert_eq!(ids(&seen), vec![1, 2]);
    assert!(matches!(
        seen.last().unwrap().event,
        Event::Phase { ref phase, .. } if phase == "research"
    ));

    registry.multiplexer().detach(&first);
    drop(first_rx);

    // The job keeps running with nobody attached.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(registry.event_log().latest_id("S1"), 5);

    let (second, mut second_rx) = ClientChannel::new(TransportKind::WebSocket);
    let replayed = registry.multiplexer().subscribe(&second, "S1", 2).unwrap();
    assert_eq!(replayed, 3);

    let messages = second_rx.drain_messages();
    assert_eq!(ids(&messages), vec![3, 4, 5]);
    assert!(matches!(messages[0].event, Event::ToolStart { ref tool, .. } if tool == "web_fetch"));
    assert!(matches!(messages[1].event, Event::ToolEnd { success: true, .. }));
    assert!(matches!(messages[2].event, Event::Complete { .. }));
    assert_eq!(
        messages[3].event,
        Event::Subscribed {
            session_id: "S1".to_string(),
            message: "Replayed 3 events".to_string(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_cuts_deliver_every_event_exactly_once() {
    let updates = (0..10).map(|i| JobUpdate::message(format!("m{}", i))).collect();
    let registry = SessionRegistry::new(
        ServerConfig::default(),
        Arc::new(ScriptedExecutor::new(updates).with_step_delay(Duration::from_secs(1))),
    );

    let (mut channel, mut rx) = ClientChannel::new(TransportKind::WebSocket);
    registry
        .start_generation("S-cut", Some("S-cut".to_string()), Some(&channel))
        .unwrap();

    let mut received = Vec::new();
    for cut in [2_500u64, 3_000, 1_700, 4_000] {
        tokio::time::sleep(Duration::from_millis(cut)).await;
        received.extend(ids(&rx.drain_messages()));

        registry.multiplexer().detach(&channel);
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let last = received.last().copied().unwrap_or(0);
        let (next, next_rx) = ClientChannel::new(TransportKind::WebSocket);
        registry.multiplexer().subscribe(&next, "S-cut", last).unwrap();
        channel = next;
        rx = next_rx;
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    received.extend(ids(&rx.drain_messages()));
    registry.multiplexer().detach(&channel);

    let expected: Vec<u64> = (1..=registry.event_log().latest_id("S-cut")).collect();
    assert_eq!(expected.len(), 12);
    assert_eq!(received, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_cuts_racing_live_emits_match_the_uninterrupted_log() {
    for seed in 0..32u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mux = Arc::new(Multiplexer::new(
            Arc::new(EventLog::default()),
            Arc::new(AbortRegistry::new()),
        ));
        mux.event_log().create("S-rand");

        let (mut channel, mut rx) = ClientChannel::new(TransportKind::WebSocket);
        mux.attach(&channel, "S-rand");

        let total: usize = rng.gen_range(50..200);
        let emitter = tokio::spawn({
            let mux = mux.clone();
            async move {
                for n in 0..total {
                    mux.emit("S-rand", Event::message(format!("m{}", n)));
                    if n % 3 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }
        });

        let mut received = Vec::new();
        for _ in 0..rng.gen_range(3..12) {
            for _ in 0..rng.gen_range(0..20) {
                tokio::task::yield_now().await;
            }
            received.extend(ids(&rx.drain_messages()));

            // Whatever is still queued on the old channel is lost with it.
            mux.detach(&channel);
            let last = received.last().copied().unwrap_or(0);
            let (next, next_rx) = ClientChannel::new(TransportKind::WebSocket);
            mux.subscribe(&next, "S-rand", last).unwrap();
            channel = next;
            rx = next_rx;
        }

        emitter.await.unwrap();
        received.extend(ids(&rx.drain_messages()));
        mux.detach(&channel);

        let baseline: Vec<u64> = mux
            .event_log()
            .since("S-rand", 0)
            .iter()
            .map(|event| event.id)
            .collect();
        assert_eq!(baseline.len(), total, "seed {}", seed);
        assert_eq!(received, baseline, "seed {}", seed);
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_from_a_resubscribed_channel_stops_the_job() {
    let registry = SessionRegistry::new(
        ServerConfig::default(),
        Arc::new(
            ScriptedExecutor::new(vec![JobUpdate::message("slow")])
                .with_step_delay(Duration::from_secs(600)),
        ),
    );

    let (first, _first_rx) = ClientChannel::new(TransportKind::WebSocket);
    registry
        .start_generation("P", Some("S1".to_string()), Some(&first))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.multiplexer().detach(&first);

    let (second, mut rx) = ClientChannel::new(TransportKind::WebSocket);
    genstream_server::ws::dispatch(
        &registry,
        &second,
        ClientMessage::Subscribe {
            session_id: Some("S1".to_string()),
            last_event_id: Some(1),
        },
    );
    genstream_server::ws::dispatch(&registry, &second, ClientMessage::Cancel);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let events: Vec<Event> = rx.drain_messages().into_iter().map(|m| m.event).collect();
    assert!(events.contains(&Event::ack_for_session("Cancel requested", "S1")));
    assert_eq!(events.last(), Some(&Event::cancelled()));
    assert_eq!(
        registry.snapshot("S1").unwrap().status,
        genstream_server::SessionStatus::Cancelled
    );
}

#[tokio::test]
async fn sse_resume_honours_last_event_id_header() {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    let server = GenStreamServer::new(Arc::new(ScriptedExecutor::new(vec![
        JobUpdate::phase("research", "Researching"),
        JobUpdate::tool_start("web_fetch", "tool-1", json!({})),
        JobUpdate::tool_end("tool-1", true),
    ])));
    let registry = server.registry().clone();
    registry
        .start_generation("P", Some("S1".to_string()), None)
        .unwrap();
    for _ in 0..100 {
        if registry.event_log().latest_id("S1") == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = server
        .build_router()
        .oneshot(
            Request::builder()
                .uri("/sessions/S1/events")
                .header("Last-Event-ID", "2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(!text.contains("id: 2\n"));
    let tool_start = text.find("id: 3").unwrap();
    let tool_end = text.find("id: 4").unwrap();
    let complete = text.find("id: 5").unwrap();
    assert!(tool_start < tool_end && tool_end < complete);
}

mod websocket {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn next_message(socket: &mut Socket) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = frame {
                return ServerMessage::from_json(text.as_str()).unwrap();
            }
        }
    }

    async fn send(socket: &mut Socket, message: ClientMessage) {
        socket
            .send(Message::Text(message.to_json().unwrap().into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn generate_then_resubscribe_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = GenStreamServer::with_config(
            Arc::new(research_run().with_step_delay(Duration::from_millis(20))),
            ServerConfig::default().with_logging(false),
        );
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_listener(listener, async {
            let _ = stop_rx.await;
        }));

        let url = format!("ws://{}/ws", addr);
        let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(
            next_message(&mut socket).await.event,
            Event::ack("Connected to generation server")
        );

        send(
            &mut socket,
            ClientMessage::Generate {
                prompt: "P".to_string(),
                session_id: Some("S1".to_string()),
            },
        )
        .await;
        assert_eq!(
            next_message(&mut socket).await.event,
            Event::ack_for_session("Generation started", "S1")
        );

        let mut live = Vec::new();
        loop {
            let message = next_message(&mut socket).await;
            let terminal = message.event.is_terminal();
            live.push(message.id.unwrap());
            if terminal {
                break;
            }
        }
        assert_eq!(live, vec![1, 2, 3, 4, 5]);
        socket.close(None).await.unwrap();

        let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
        next_message(&mut socket).await;
        send(
            &mut socket,
            ClientMessage::Subscribe {
                session_id: Some("S1".to_string()),
                last_event_id: Some(3),
            },
        )
        .await;
        assert_eq!(next_message(&mut socket).await.id, Some(4));
        assert_eq!(next_message(&mut socket).await.id, Some(5));
        assert!(matches!(
            next_message(&mut socket).await.event,
            Event::Subscribed { .. }
        ));

        send(&mut socket, ClientMessage::Ping).await;
        assert_eq!(next_message(&mut socket).await.event, Event::Pong);

        socket
            .send(Message::Text("not json".to_string().into()))
            .await
            .unwrap();
        match next_message(&mut socket).await.event {
            Event::Error { code, .. } => {
                assert_eq!(code, Some(genstream_server::ErrorCode::ProtocolError))
            }
            other => panic!("Expected error, got {:?}", other),
        }

        let _ = stop_tx.send(());
        drop(socket);
        handle.await.unwrap().unwrap();
    }
}
