//! Keeps a client attached to its generation session across connection loss
//! and process restarts.
//!
//! The reconnector persists the active session and the highest sequence id it
//! has seen. After a dropped connection it reconnects with exponential backoff
//! and resubscribes from that id, so the server replays exactly the missed
//! events. Once the reconnect budget is spent it falls back to polling the
//! status endpoint, provided the job is known to be running.

use genstream_types::{
    ClientMessage, ErrorCode, Event, ImageArtifact, ServerMessage, SessionSnapshot,
    SessionStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::backoff::{PollPolicy, ReconnectPolicy};
use crate::error::{ClientError, Result};
use crate::poller::{StatusPoller, StatusSource};
use crate::store::{PersistedSession, SessionStore};
use crate::transport::{Connection, Incoming, Transport};

/// Interval of client keepalive pings while connected.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Polling,
    Disconnected,
}

/// Everything the reconnector reports while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    State(ConnectionState),
    /// A message received over the push channel.
    Server(ServerMessage),
    /// A snapshot read while polling.
    Snapshot(SessionSnapshot),
    /// Images first reported by a poll.
    Images(Vec<ImageArtifact>),
}

/// How following a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutcome {
    Completed { session_id: String, image_count: u32 },
    Failed { session_id: String, error: String },
    Cancelled { session_id: String },
    /// The server does not know the session; it has to be started again.
    SessionNotFound { session_id: String },
    /// Reconnects and polling were exhausted. Persisted state is kept.
    Disconnected { session_id: String },
    /// The caller closed the connection.
    Closed { session_id: String },
}

impl ClientOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            ClientOutcome::Completed { session_id, .. }
            | ClientOutcome::Failed { session_id, .. }
            | ClientOutcome::Cancelled { session_id }
            | ClientOutcome::SessionNotFound { session_id }
            | ClientOutcome::Disconnected { session_id }
            | ClientOutcome::Closed { session_id } => session_id,
        }
    }
}

/// Lets another task cancel the job or close the connection.
#[derive(Debug, Clone)]
pub struct ReconnectorHandle {
    cancel: CancellationToken,
    close: CancellationToken,
}

impl ReconnectorHandle {
    /// Ask the server to cancel the job. Persisted state is cleared at once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close cleanly without cancelling. The job keeps running server side.
    pub fn close(&self) {
        self.close.cancel();
    }
}

/// Progress of one followed session.
struct Run {
    session_id: String,
    /// Prompt to send with `generate` until the server confirms the job.
    pending_prompt: Option<String>,
    last_event_id: u64,
    /// The server has confirmed the job exists.
    confirmed: bool,
    seen_images: Vec<String>,
}

impl Run {
    fn confirm(&mut self) {
        self.pending_prompt = None;
        self.confirmed = true;
    }

    fn opening_message(&self) -> ClientMessage {
        match &self.pending_prompt {
            Some(prompt) => ClientMessage::Generate {
                prompt: prompt.clone(),
                session_id: Some(self.session_id.clone()),
            },
            None => ClientMessage::Subscribe {
                session_id: Some(self.session_id.clone()),
                last_event_id: Some(self.last_event_id),
            },
        }
    }
}

enum DriveEnd {
    Finished(ClientOutcome),
    /// `progressed` is set when the connection delivered new events or first
    /// confirmed the job; greetings alone do not count.
    Dropped { progressed: bool },
    Closed,
}

pub struct Reconnector {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    status: Option<Arc<dyn StatusSource>>,
    policy: ReconnectPolicy,
    poll_policy: PollPolicy,
    ping_interval: Duration,
    events: mpsc::UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
    close: CancellationToken,
}

impl Reconnector {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let reconnector = Self {
            transport,
            store,
            status: None,
            policy: ReconnectPolicy::default(),
            poll_policy: PollPolicy::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            events,
            cancel: CancellationToken::new(),
            close: CancellationToken::new(),
        };
        (reconnector, receiver)
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = policy;
        self
    }

    /// Enable the polling fallback.
    pub fn with_status_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.status = Some(source);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn handle(&self) -> ReconnectorHandle {
        ReconnectorHandle {
            cancel: self.cancel.clone(),
            close: self.close.clone(),
        }
    }

    /// Start a new job and follow it to the end.
    pub async fn start(&self, prompt: &str, session_id: Option<String>) -> Result<ClientOutcome> {
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("gen-{}", uuid::Uuid::new_v4()));

        self.store
            .set_active_session(&PersistedSession::new(&session_id, prompt))
            .await?;
        log::info!("Starting session {}", session_id);

        self.follow(Run {
            session_id,
            pending_prompt: Some(prompt.to_string()),
            last_event_id: 0,
            confirmed: false,
            seen_images: Vec::new(),
        })
        .await
    }

    /// Resume the persisted session, if there is one.
    pub async fn resume(&self) -> Result<Option<ClientOutcome>> {
        let Some(active) = self.store.active_session().await? else {
            return Ok(None);
        };
        let last_event_id = self.store.last_event_id(&active.session_id).await?;
        log::info!(
            "Resuming session {} after event {}",
            active.session_id,
            last_event_id
        );

        self.follow(Run {
            session_id: active.session_id,
            pending_prompt: None,
            last_event_id,
            confirmed: true,
            seen_images: Vec::new(),
        })
        .await
        .map(Some)
    }

    fn report(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("Connection state: {:?}", state);
        self.report(ClientEvent::State(state));
    }

    async fn follow(&self, mut run: Run) -> Result<ClientOutcome> {
        let mut attempt = 0u32;

        loop {
            if attempt == 0 {
                self.set_state(ConnectionState::Connecting);
            }

            let connected = tokio::select! {
                _ = self.close.cancelled() => return Ok(self.closed(&run)),
                connected = self.transport.connect() => connected,
            };

            match connected {
                Ok(mut connection) => {
                    self.set_state(ConnectionState::Connected);
                    match self.drive(connection.as_mut(), &mut run).await? {
                        DriveEnd::Finished(outcome) => return Ok(outcome),
                        DriveEnd::Closed => return Ok(self.closed(&run)),
                        DriveEnd::Dropped { progressed } => {
                            log::warn!("Connection for session {} dropped", run.session_id);
                            if progressed {
                                attempt = 0;
                            }
                        }
                    }
                }
                Err(e) => log::warn!("Connect failed for session {}: {}", run.session_id, e),
            }

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                break;
            };
            self.set_state(ConnectionState::Reconnecting { attempt, delay });
            tokio::select! {
                _ = self.close.cancelled() => return Ok(self.closed(&run)),
                _ = self.cancel.cancelled() => return self.cancel_offline(&run).await,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log::warn!(
            "Giving up on the push channel for session {} after {} attempts",
            run.session_id,
            self.policy.max_attempts
        );
        if self.cancel.is_cancelled() {
            return self.cancel_offline(&run).await;
        }
        match (&self.status, run.confirmed) {
            (Some(source), true) => self.poll(source.as_ref(), &run).await,
            _ => {
                self.set_state(ConnectionState::Disconnected);
                Ok(ClientOutcome::Disconnected {
                    session_id: run.session_id,
                })
            }
        }
    }

    /// Cancel without a push channel: tell the server over the status source
    /// if there is one, and forget the session either way.
    async fn cancel_offline(&self, run: &Run) -> Result<ClientOutcome> {
        self.store.clear(&run.session_id).await?;
        match &self.status {
            Some(source) => match source.cancel(&run.session_id).await {
                Ok(cancelled) => log::info!(
                    "Cancel request for session {} sent, job was running: {}",
                    run.session_id,
                    cancelled
                ),
                Err(e) => log::warn!(
                    "Cancel request for session {} failed: {}",
                    run.session_id,
                    e
                ),
            },
            None => log::warn!(
                "No channel to the server; session {} is only cancelled locally",
                run.session_id
            ),
        }
        Ok(ClientOutcome::Cancelled {
            session_id: run.session_id.clone(),
        })
    }

    fn closed(&self, run: &Run) -> ClientOutcome {
        log::info!("Connection for session {} closed by the caller", run.session_id);
        ClientOutcome::Closed {
            session_id: run.session_id.clone(),
        }
    }

    async fn drive(&self, connection: &mut dyn Connection, run: &mut Run) -> Result<DriveEnd> {
        if let Err(e) = connection.send(&run.opening_message()).await {
            log::debug!("Failed to send opening message: {}", e);
            return Ok(DriveEnd::Dropped { progressed: false });
        }

        let start_id = run.last_event_id;
        let was_confirmed = run.confirmed;
        let progressed = |run: &Run| {
            run.last_event_id > start_id || (run.confirmed && !was_confirmed)
        };
        let mut cancel_sent = false;
        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);

        loop {
            tokio::select! {
                _ = self.close.cancelled() => {
                    if let Err(e) = connection.close().await {
                        log::debug!("Close handshake failed: {}", e);
                    }
                    return Ok(DriveEnd::Closed);
                }
                _ = self.cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    self.store.clear(&run.session_id).await?;
                    if connection.send(&ClientMessage::Cancel).await.is_err() {
                        return Ok(DriveEnd::Dropped { progressed: progressed(&*run) });
                    }
                }
                _ = ping.tick() => {
                    if connection.send(&ClientMessage::Ping).await.is_err() {
                        return Ok(DriveEnd::Dropped { progressed: progressed(&*run) });
                    }
                }
                incoming = connection.recv() => match incoming {
                    Incoming::Message(message) => {
                        if let Some(outcome) = self.handle_message(run, message).await? {
                            return Ok(DriveEnd::Finished(outcome));
                        }
                    }
                    Incoming::Closed { code } => {
                        log::debug!("Connection closed by server (code {:?})", code);
                        return Ok(DriveEnd::Dropped { progressed: progressed(&*run) });
                    }
                },
            }
        }
    }

    async fn handle_message(
        &self,
        run: &mut Run,
        message: ServerMessage,
    ) -> Result<Option<ClientOutcome>> {
        if let Some(id) = message.id {
            if id <= run.last_event_id {
                log::debug!("Skipping already seen event {}", id);
                return Ok(None);
            }
            run.last_event_id = id;
            run.confirm();
            if !self.cancel.is_cancelled() {
                self.store.set_last_event_id(&run.session_id, id).await?;
            }
        }

        match &message.event {
            Event::Ack {
                session_id: Some(session_id),
                ..
            } if *session_id == run.session_id => run.confirm(),
            Event::Subscribed { .. } => run.confirm(),
            Event::Image { url_path, .. } => run.seen_images.push(url_path.clone()),
            _ => {}
        }

        let outcome = self.outcome_of(run, &message);
        self.report(ClientEvent::Server(message));

        if let Some(ref outcome) = outcome {
            log::info!("Session {} finished: {:?}", run.session_id, outcome);
            self.store.clear(&run.session_id).await?;
        }
        Ok(outcome)
    }

    fn outcome_of(&self, run: &Run, message: &ServerMessage) -> Option<ClientOutcome> {
        let session_id = run.session_id.clone();

        if message.id.is_some() {
            return match &message.event {
                Event::Complete { image_count, .. } => Some(ClientOutcome::Completed {
                    session_id,
                    image_count: *image_count,
                }),
                Event::Error { error, .. } => Some(ClientOutcome::Failed {
                    session_id,
                    error: error.clone(),
                }),
                event if event.is_terminal() => Some(ClientOutcome::Cancelled { session_id }),
                _ => None,
            };
        }

        // Unbuffered errors are replies to our own requests.
        match &message.event {
            Event::Error {
                code: Some(ErrorCode::SessionNotFound),
                ..
            } => Some(ClientOutcome::SessionNotFound { session_id }),
            Event::Error {
                error,
                code: Some(ErrorCode::InvalidRequest),
            } if run.pending_prompt.is_some() => Some(ClientOutcome::Failed {
                session_id,
                error: error.clone(),
            }),
            _ => None,
        }
    }

    async fn poll(&self, source: &dyn StatusSource, run: &Run) -> Result<ClientOutcome> {
        self.set_state(ConnectionState::Polling);
        let mut poller = StatusPoller::new(source, self.poll_policy.clone())
            .with_known_images(run.seen_images.iter().cloned());

        let events = self.events.clone();
        let polled = tokio::select! {
            _ = self.close.cancelled() => return Ok(self.closed(run)),
            _ = self.cancel.cancelled() => return self.cancel_offline(run).await,
            polled = poller.run(&run.session_id, |snapshot, fresh| {
                let _ = events.send(ClientEvent::Snapshot(snapshot.clone()));
                if !fresh.is_empty() {
                    let _ = events.send(ClientEvent::Images(fresh));
                }
            }) => polled,
        };

        let session_id = run.session_id.clone();
        let outcome = match polled {
            Ok(snapshot) => match snapshot.status {
                SessionStatus::Completed => ClientOutcome::Completed {
                    session_id,
                    image_count: snapshot.image_count,
                },
                SessionStatus::Cancelled => ClientOutcome::Cancelled { session_id },
                SessionStatus::Failed | SessionStatus::Running => ClientOutcome::Failed {
                    session_id,
                    error: snapshot
                        .error
                        .unwrap_or_else(|| "Generation failed".to_string()),
                },
            },
            Err(ClientError::SessionNotFound(_)) => ClientOutcome::SessionNotFound { session_id },
            Err(ClientError::PollLimit { polls, .. }) => {
                log::warn!("Session {} still running after {} polls", run.session_id, polls);
                self.set_state(ConnectionState::Disconnected);
                return Ok(ClientOutcome::Disconnected { session_id });
            }
            Err(e) => return Err(e),
        };

        self.store.clear(&run.session_id).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::tests::{snapshot, ScriptedStatus};
    use crate::store::MemorySessionStore;
    use async_trait::async_trait;
    use genstream_types::BufferedEvent;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    enum Step {
        Message(ServerMessage),
        Drop,
    }

    struct FakeConnection {
        steps: mpsc::UnboundedReceiver<Step>,
        sent: Arc<Mutex<Vec<ClientMessage>>>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn send(&mut self, message: &ClientMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Incoming {
            match self.steps.recv().await {
                Some(Step::Message(message)) => Incoming::Message(message),
                Some(Step::Drop) | None => Incoming::Closed { code: None },
            }
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Hands out queued connections; refuses once the queue is empty.
    #[derive(Default)]
    struct FakeTransport {
        queue: Mutex<VecDeque<FakeConnection>>,
        connects: AtomicU32,
    }

    struct Peer {
        steps: mpsc::UnboundedSender<Step>,
        sent: Arc<Mutex<Vec<ClientMessage>>>,
    }

    impl Peer {
        fn buffered(&self, id: u64, event: Event) -> &Self {
            let message = BufferedEvent {
                id,
                event,
                timestamp: chrono::Utc::now(),
            }
            .to_message();
            let _ = self.steps.send(Step::Message(message));
            self
        }

        fn unbuffered(&self, event: Event) -> &Self {
            let _ = self.steps.send(Step::Message(ServerMessage::unbuffered(event)));
            self
        }

        fn drop_connection(&self) {
            let _ = self.steps.send(Step::Drop);
        }

        fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl FakeTransport {
        fn peer(&self) -> Peer {
            let (steps, rx) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            self.queue.lock().unwrap().push_back(FakeConnection {
                steps: rx,
                sent: sent.clone(),
            });
            Peer { steps, sent }
        }

        fn connects(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.queue.lock().unwrap().pop_front() {
                Some(connection) => Ok(Box::new(connection)),
                None => Err(ClientError::channel_unavailable("connection refused")),
            }
        }
    }

    fn complete(image_count: u32) -> Event {
        Event::Complete {
            session_id: "S1".to_string(),
            duration: 1000,
            image_count,
            message: "Generation complete in 1.0s".to_string(),
        }
    }

    fn setup() -> (
        Arc<FakeTransport>,
        Arc<MemorySessionStore>,
        Reconnector,
        mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let transport = Arc::new(FakeTransport::default());
        let store = Arc::new(MemorySessionStore::new());
        let (reconnector, events) = Reconnector::new(transport.clone(), store.clone());
        (transport, store, reconnector, events)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_start_follows_to_completion() {
        let (transport, store, reconnector, mut events) = setup();
        let peer = transport.peer();
        peer.unbuffered(Event::ack_for_session("Generation started", "S1"))
            .buffered(1, Event::phase("parse", "Parsing Request"))
            .buffered(2, Event::message("working"))
            .buffered(3, complete(0));

        let outcome = reconnector.start("P", Some("S1".to_string())).await.unwrap();
        assert_eq!(
            outcome,
            ClientOutcome::Completed {
                session_id: "S1".to_string(),
                image_count: 0
            }
        );
        assert_eq!(
            peer.sent()[0],
            ClientMessage::Generate {
                prompt: "P".to_string(),
                session_id: Some("S1".to_string())
            }
        );
        assert!(store.active_session().await.unwrap().is_none());
        assert_eq!(store.last_event_id("S1").await.unwrap(), 0);

        let events = drain(&mut events);
        assert_eq!(events[0], ClientEvent::State(ConnectionState::Connecting));
        assert_eq!(events[1], ClientEvent::State(ConnectionState::Connected));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ClientEvent::Server(_)))
                .count(),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_resubscribes_from_last_event() {
        let (transport, _store, reconnector, mut events) = setup();
        let first = transport.peer();
        first
            .unbuffered(Event::ack_for_session("Generation started", "S1"))
            .buffered(1, Event::phase("parse", "Parsing Request"))
            .buffered(2, Event::phase("research", "Researching"))
            .drop_connection();
        let second = transport.peer();
        second
            .buffered(3, Event::message("tool"))
            .buffered(4, complete(0))
            .unbuffered(Event::Subscribed {
                session_id: "S1".to_string(),
                message: "Replayed 2 events".to_string(),
            });

        let outcome = reconnector.start("P", Some("S1".to_string())).await.unwrap();
        assert!(matches!(outcome, ClientOutcome::Completed { .. }));
        assert_eq!(transport.connects(), 2);
        assert_eq!(
            second.sent()[0],
            ClientMessage::Subscribe {
                session_id: Some("S1".to_string()),
                last_event_id: Some(2)
            }
        );

        let ids: Vec<u64> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Server(message) => message.id,
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_resume_with_expired_session_clears_state() {
        let (transport, store, reconnector, _events) = setup();
        store
            .set_active_session(&PersistedSession::new("S1", "P"))
            .await
            .unwrap();
        store.set_last_event_id("S1", 4).await.unwrap();

        let peer = transport.peer();
        peer.unbuffered(Event::error(
            "Session not found or expired",
            ErrorCode::SessionNotFound,
        ));

        let outcome = reconnector.resume().await.unwrap();
        assert_eq!(
            outcome,
            Some(ClientOutcome::SessionNotFound {
                session_id: "S1".to_string()
            })
        );
        assert_eq!(
            peer.sent()[0],
            ClientMessage::Subscribe {
                session_id: Some("S1".to_string()),
                last_event_id: Some(4)
            }
        );
        assert!(store.active_session().await.unwrap().is_none());
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_resume_without_persisted_session() {
        let (transport, _store, reconnector, _events) = setup();
        assert_eq!(reconnector.resume().await.unwrap(), None);
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_job_gives_up_without_polling() {
        let (transport, store, reconnector, mut events) = setup();
        let status = Arc::new(ScriptedStatus::new(vec![]));
        let reconnector = reconnector.with_status_source(status.clone());

        let outcome = reconnector.start("P", Some("S1".to_string())).await.unwrap();
        assert_eq!(
            outcome,
            ClientOutcome::Disconnected {
                session_id: "S1".to_string()
            }
        );
        assert_eq!(transport.connects(), 6);
        assert_eq!(*status.calls.lock().unwrap(), 0);
        assert!(store.active_session().await.unwrap().is_some());

        let events = drain(&mut events);
        assert!(events.contains(&ClientEvent::State(ConnectionState::Reconnecting {
            attempt: 5,
            delay: Duration::from_secs(30)
        })));
        assert_eq!(
            events.last(),
            Some(&ClientEvent::State(ConnectionState::Disconnected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_polling_for_running_job() {
        let (transport, store, reconnector, mut events) = setup();
        let status = Arc::new(ScriptedStatus::new(vec![
            Ok(snapshot(SessionStatus::Running, &["/a.png"])),
            Ok(snapshot(SessionStatus::Completed, &["/a.png", "/b.png"])),
        ]));
        let reconnector = reconnector.with_status_source(status.clone());

        let peer = transport.peer();
        peer.unbuffered(Event::ack_for_session("Generation started", "S1"))
            .buffered(1, Event::phase("parse", "Parsing Request"))
            .drop_connection();

        let outcome = reconnector.start("P", Some("S1".to_string())).await.unwrap();
        assert_eq!(
            outcome,
            ClientOutcome::Completed {
                session_id: "S1".to_string(),
                image_count: 2
            }
        );
        assert_eq!(*status.calls.lock().unwrap(), 2);
        assert!(store.active_session().await.unwrap().is_none());

        let images: Vec<Vec<String>> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Images(images) => {
                    Some(images.into_iter().map(|i| i.url_path).collect())
                }
                _ => None,
            })
            .collect();
        assert_eq!(images, vec![vec!["/a.png"], vec!["/b.png"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_while_idle_and_closes_cleanly() {
        let (transport, _store, reconnector, _events) = setup();
        let peer = transport.peer();
        peer.unbuffered(Event::ack_for_session("Generation started", "S1"));

        let handle = reconnector.handle();
        let task =
            tokio::spawn(async move { reconnector.start("P", Some("S1".to_string())).await });

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert!(peer.sent().contains(&ClientMessage::Ping));

        handle.close();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ClientOutcome::Closed {
                session_id: "S1".to_string()
            }
        );
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_sends_request_and_clears_state() {
        let (transport, store, reconnector, _events) = setup();
        let peer = transport.peer();
        peer.unbuffered(Event::ack_for_session("Generation started", "S1"))
            .buffered(1, Event::phase("parse", "Parsing Request"));

        let handle = reconnector.handle();
        let task =
            tokio::spawn(async move { reconnector.start("P", Some("S1".to_string())).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peer.sent().contains(&ClientMessage::Cancel));
        assert!(store.active_session().await.unwrap().is_none());

        peer.unbuffered(Event::ack_for_session("Cancel requested", "S1"))
            .buffered(2, Event::cancelled());
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ClientOutcome::Cancelled {
                session_id: "S1".to_string()
            }
        );
        assert_eq!(store.last_event_id("S1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_then_drop_does_not_reset_backoff() {
        let (transport, store, reconnector, _events) = setup();
        for _ in 0..10 {
            transport
                .peer()
                .unbuffered(Event::ack("Connected to generation server"))
                .drop_connection();
        }

        let outcome = tokio::time::timeout(
            Duration::from_secs(3600),
            reconnector.start("P", Some("S1".to_string())),
        )
        .await
        .expect("reconnector should give up")
        .unwrap();
        assert_eq!(
            outcome,
            ClientOutcome::Disconnected {
                session_id: "S1".to_string()
            }
        );
        assert_eq!(transport.connects(), 6);
        assert!(store.active_session().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_without_new_events_still_exhausts_backoff() {
        let (transport, store, reconnector, _events) = setup();
        let status = Arc::new(ScriptedStatus::new(vec![Ok(snapshot(
            SessionStatus::Completed,
            &[],
        ))]));
        let reconnector = reconnector.with_status_source(status.clone());
        store
            .set_active_session(&PersistedSession::new("S1", "P"))
            .await
            .unwrap();
        store.set_last_event_id("S1", 2).await.unwrap();
        for _ in 0..10 {
            transport
                .peer()
                .unbuffered(Event::Subscribed {
                    session_id: "S1".to_string(),
                    message: "Replayed 0 events".to_string(),
                })
                .drop_connection();
        }

        let outcome = reconnector.resume().await.unwrap();
        assert!(matches!(outcome, Some(ClientOutcome::Completed { .. })));
        assert_eq!(transport.connects(), 6);
        assert_eq!(*status.calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_cancels_over_http() {
        let (transport, store, reconnector, _events) = setup();
        let status = Arc::new(ScriptedStatus::new(vec![]));
        let reconnector = reconnector.with_status_source(status.clone());
        transport
            .peer()
            .unbuffered(Event::ack_for_session("Generation started", "S1"))
            .buffered(1, Event::phase("parse", "Parsing Request"))
            .drop_connection();

        let handle = reconnector.handle();
        let task =
            tokio::spawn(async move { reconnector.start("P", Some("S1".to_string())).await });

        // First retry fails at 2s; the second waits until 6s.
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.cancel();
        let outcome = task.await.unwrap().unwrap();

        assert_eq!(
            outcome,
            ClientOutcome::Cancelled {
                session_id: "S1".to_string()
            }
        );
        assert_eq!(transport.connects(), 2);
        assert_eq!(*status.cancels.lock().unwrap(), 1);
        assert_eq!(*status.calls.lock().unwrap(), 0);
        assert!(store.active_session().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_polling_cancels_over_http() {
        let (transport, store, reconnector, _events) = setup();
        let status = Arc::new(ScriptedStatus::new(vec![
            Ok(snapshot(SessionStatus::Running, &[])),
            Ok(snapshot(SessionStatus::Running, &[])),
            Ok(snapshot(SessionStatus::Completed, &["/a.png"])),
        ]));
        let reconnector = reconnector.with_status_source(status.clone());
        transport
            .peer()
            .unbuffered(Event::ack_for_session("Generation started", "S1"))
            .buffered(1, Event::phase("parse", "Parsing Request"))
            .drop_connection();

        let handle = reconnector.handle();
        let task =
            tokio::spawn(async move { reconnector.start("P", Some("S1".to_string())).await });

        // Backoff ends at 60s; polls run at 60s, 65s and 70s.
        tokio::time::sleep(Duration::from_secs(67)).await;
        handle.cancel();
        let outcome = task.await.unwrap().unwrap();

        assert_eq!(
            outcome,
            ClientOutcome::Cancelled {
                session_id: "S1".to_string()
            }
        );
        assert_eq!(*status.calls.lock().unwrap(), 2);
        assert_eq!(*status.cancels.lock().unwrap(), 1);
        assert!(store.active_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_generate_fails() {
        let (transport, store, reconnector, _events) = setup();
        let peer = transport.peer();
        peer.unbuffered(Event::error(
            "Invalid input: Prompt cannot be empty",
            ErrorCode::InvalidRequest,
        ));

        let outcome = reconnector.start(" ", Some("S1".to_string())).await.unwrap();
        assert!(matches!(outcome, ClientOutcome::Failed { .. }));
        assert!(store.active_session().await.unwrap().is_none());
    }
}
