//! Degraded delivery: poll the status endpoint until the session finishes.

use async_trait::async_trait;
use genstream_types::{ImageArtifact, SessionSnapshot};
use std::collections::HashSet;

use crate::backoff::PollPolicy;
use crate::error::{ClientError, Result};
use crate::http_client::HttpClient;

/// Request/response access to a session, used when the push channel is gone.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn status(&self, session_id: &str) -> Result<SessionSnapshot>;

    /// Ask the server to cancel the job. `false` if it was not running.
    async fn cancel(&self, session_id: &str) -> Result<bool>;
}

#[async_trait]
impl StatusSource for HttpClient {
    async fn status(&self, session_id: &str) -> Result<SessionSnapshot> {
        HttpClient::status(self, session_id).await
    }

    async fn cancel(&self, session_id: &str) -> Result<bool> {
        HttpClient::cancel(self, session_id).await
    }
}

/// Polls one session and reconciles the images it reports.
pub struct StatusPoller<'a> {
    source: &'a dyn StatusSource,
    policy: PollPolicy,
    seen: HashSet<String>,
}

impl<'a> StatusPoller<'a> {
    pub fn new(source: &'a dyn StatusSource, policy: PollPolicy) -> Self {
        Self {
            source,
            policy,
            seen: HashSet::new(),
        }
    }

    /// Treat these images as already delivered.
    pub fn with_known_images(mut self, url_paths: impl IntoIterator<Item = String>) -> Self {
        self.seen.extend(url_paths);
        self
    }

    /// Images in `snapshot` not reported before, keyed by URL path.
    pub fn reconcile(&mut self, snapshot: &SessionSnapshot) -> Vec<ImageArtifact> {
        snapshot
            .images
            .iter()
            .filter(|image| self.seen.insert(image.url_path.clone()))
            .cloned()
            .collect()
    }

    /// Poll until the session is terminal. `on_update` receives every
    /// snapshot together with the images it newly reports.
    ///
    /// Transient poll failures count against the poll budget and are
    /// otherwise ignored; `SessionNotFound` ends polling immediately.
    pub async fn run<F>(&mut self, session_id: &str, mut on_update: F) -> Result<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot, Vec<ImageArtifact>) + Send,
    {
        for poll in 1..=self.policy.max_polls {
            match self.source.status(session_id).await {
                Ok(snapshot) => {
                    let fresh = self.reconcile(&snapshot);
                    log::debug!(
                        "Poll {} for session {}: {:?}, {} new images",
                        poll,
                        session_id,
                        snapshot.status,
                        fresh.len()
                    );
                    on_update(&snapshot, fresh);
                    if snapshot.status.is_terminal() {
                        return Ok(snapshot);
                    }
                }
                Err(e @ ClientError::SessionNotFound(_)) => return Err(e),
                Err(e) => log::warn!(
                    "Status poll {} for session {} failed: {}",
                    poll,
                    session_id,
                    e
                ),
            }
            if poll < self.policy.max_polls {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        Err(ClientError::PollLimit {
            session_id: session_id.to_string(),
            polls: self.policy.max_polls,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use genstream_types::SessionStatus;
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) fn snapshot(status: SessionStatus, images: &[&str]) -> SessionSnapshot {
        SessionSnapshot {
            session_id: "S1".to_string(),
            status,
            phase: None,
            prompt: "P".to_string(),
            created_at: Utc::now(),
            finished_at: None,
            image_count: images.len() as u32,
            images: images
                .iter()
                .enumerate()
                .map(|(i, path)| ImageArtifact::new(format!("img-{}", i), *path))
                .collect(),
            latest_event_id: 0,
            error: None,
        }
    }

    /// Replays a fixed list of responses, repeating the last one.
    pub(crate) struct ScriptedStatus {
        responses: Mutex<Vec<Result<SessionSnapshot>>>,
        pub(crate) calls: Mutex<u32>,
        pub(crate) cancels: Mutex<u32>,
    }

    impl ScriptedStatus {
        pub(crate) fn new(responses: Vec<Result<SessionSnapshot>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
                cancels: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedStatus {
        async fn status(&self, _session_id: &str) -> Result<SessionSnapshot> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                match responses.first() {
                    Some(Ok(snapshot)) => Ok(snapshot.clone()),
                    _ => Err(ClientError::channel_unavailable("down")),
                }
            }
        }

        async fn cancel(&self, _session_id: &str) -> Result<bool> {
            *self.cancels.lock().unwrap() += 1;
            Ok(true)
        }
    }

    fn fast() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(5),
            max_polls: 4,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_terminal_and_dedupes_images() {
        let source = ScriptedStatus::new(vec![
            Ok(snapshot(SessionStatus::Running, &["/a.png"])),
            Err(ClientError::channel_unavailable("blip")),
            Ok(snapshot(SessionStatus::Completed, &["/a.png", "/b.png"])),
        ]);
        let mut poller = StatusPoller::new(&source, fast());

        let mut delivered = Vec::new();
        let last = poller
            .run("S1", |_, fresh| {
                delivered.extend(fresh.into_iter().map(|image| image.url_path))
            })
            .await
            .unwrap();

        assert_eq!(last.status, SessionStatus::Completed);
        assert_eq!(delivered, vec!["/a.png", "/b.png"]);
        assert_eq!(*source.calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_polls() {
        let source = ScriptedStatus::new(vec![Ok(snapshot(SessionStatus::Running, &[]))]);
        let mut poller = StatusPoller::new(&source, fast());
        let result = poller.run("S1", |_, _| {}).await;
        assert!(matches!(result, Err(ClientError::PollLimit { polls: 4, .. })));
        assert_eq!(*source.calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_session_not_found_stops_polling() {
        let source = ScriptedStatus::new(vec![
            Err(ClientError::SessionNotFound("S1".to_string())),
            Ok(snapshot(SessionStatus::Running, &[])),
        ]);
        let mut poller = StatusPoller::new(&source, fast());
        let result = poller.run("S1", |_, _| {}).await;
        assert!(matches!(result, Err(ClientError::SessionNotFound(_))));
    }

    #[test]
    fn test_known_images_are_not_redelivered() {
        let source = ScriptedStatus::new(vec![]);
        let mut poller =
            StatusPoller::new(&source, fast()).with_known_images(vec!["/a.png".to_string()]);
        let fresh = poller.reconcile(&snapshot(SessionStatus::Running, &["/a.png", "/b.png"]));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].url_path, "/b.png");
    }
}
