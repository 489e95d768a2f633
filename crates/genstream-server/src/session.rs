//! Background unit of work driving one generation.
//!
//! A [`GenerationSession`] runs on its own task, independent of any client
//! connection. It emits through the multiplexer, so every event is buffered
//! whether or not a client is attached, and it always ends with exactly one
//! terminal event: `complete`, `error`, or the cancellation `status`.

use futures_util::{FutureExt, StreamExt};
use genstream_types::{ErrorCode, Event, SessionStatus};
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::executor::{JobRequest, JobUpdate};
use crate::phase::{PhaseTracker, PHASE_COMPLETE, PHASE_PARSE};
use crate::registry::SessionRegistry;

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed(String),
    TimedOut,
    Cancelled,
}

impl SessionOutcome {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionOutcome::Completed => SessionStatus::Completed,
            SessionOutcome::Failed(_) | SessionOutcome::TimedOut => SessionStatus::Failed,
            SessionOutcome::Cancelled => SessionStatus::Cancelled,
        }
    }
}

pub struct GenerationSession {
    session_id: String,
    prompt: String,
    cancel: CancellationToken,
    registry: SessionRegistry,
    phases: PhaseTracker,
    image_count: u32,
}

impl GenerationSession {
    pub fn new(
        registry: SessionRegistry,
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let infer = registry.config().phase_inference;
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            cancel,
            registry,
            phases: PhaseTracker::new(infer),
            image_count: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run on a dedicated task.
    pub fn spawn(self) -> JoinHandle<SessionOutcome> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> SessionOutcome {
        let started = Instant::now();
        let deadline = started + self.registry.config().session_timeout;
        log::info!("Generation session {} started", self.session_id);

        let (phase, label) = PHASE_PARSE;
        self.phases.set(phase);
        self.emit(Event::phase(phase, label));

        let outcome = match AssertUnwindSafe(self.drive(deadline)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "executor panicked".to_string());
                log::error!("Executor panicked in session {}: {}", self.session_id, reason);
                SessionOutcome::Failed(format!("Executor panicked: {}", reason))
            }
        };

        self.finish(&outcome, started);
        outcome
    }

    async fn drive(&mut self, deadline: Instant) -> SessionOutcome {
        let request = JobRequest {
            session_id: self.session_id.clone(),
            prompt: self.prompt.clone(),
            cancel: self.cancel.clone(),
        };
        let executor = self.registry.executor();
        let cancel = self.cancel.clone();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            _ = sleep_until(deadline) => return SessionOutcome::TimedOut,
            started = executor.start(request) => match started {
                Ok(stream) => stream,
                Err(e) => return SessionOutcome::Failed(e.to_string()),
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionOutcome::Cancelled,
                _ = sleep_until(deadline) => return SessionOutcome::TimedOut,
                item = stream.next() => match item {
                    Some(Ok(update)) => self.apply(update),
                    Some(Err(e)) => return SessionOutcome::Failed(e.to_string()),
                    None => return SessionOutcome::Completed,
                },
            }
        }
    }

    fn apply(&mut self, update: JobUpdate) {
        let inferred = self.phases.observe(&update);

        match &update {
            JobUpdate::Phase { phase, .. } => {
                let phase = phase.clone();
                self.registry
                    .update_record(&self.session_id, |record| record.phase = Some(phase));
            }
            JobUpdate::Image(artifact) => {
                self.image_count += 1;
                let artifact = artifact.clone();
                self.registry
                    .update_record(&self.session_id, |record| record.images.push(artifact));
            }
            _ => {}
        }

        self.emit(update.into_event());

        if let Some(event) = inferred {
            if let Event::Phase { phase, .. } = &event {
                let phase = phase.clone();
                self.registry
                    .update_record(&self.session_id, |record| record.phase = Some(phase));
            }
            self.emit(event);
        }
    }

    fn emit(&self, event: Event) -> u64 {
        self.registry.multiplexer().emit(&self.session_id, event)
    }

    fn finish(&self, outcome: &SessionOutcome, started: Instant) {
        let elapsed = started.elapsed();
        let (event, error) = match outcome {
            SessionOutcome::Completed => (
                Event::Complete {
                    session_id: self.session_id.clone(),
                    duration: elapsed.as_millis() as u64,
                    image_count: self.image_count,
                    message: format!("Generation complete in {:.1}s", elapsed.as_secs_f64()),
                },
                None,
            ),
            SessionOutcome::Failed(reason) => (
                Event::error(reason.clone(), ErrorCode::ExecutorFailure),
                Some(reason.clone()),
            ),
            SessionOutcome::TimedOut => {
                let reason =
                    ServerError::Timeout(self.registry.config().session_timeout).to_string();
                (Event::error(reason.clone(), ErrorCode::Timeout), Some(reason))
            }
            SessionOutcome::Cancelled => (Event::cancelled(), None),
        };

        self.emit(event);

        let status = outcome.status();
        self.registry.update_record(&self.session_id, |record| {
            record.status = status;
            record.finished_at = Some(chrono::Utc::now());
            record.error = error;
            if status == SessionStatus::Completed {
                record.phase = Some(PHASE_COMPLETE.to_string());
            }
        });
        self.registry.aborts().unregister(&self.session_id);

        match outcome {
            SessionOutcome::Completed => log::info!(
                "Generation session {} completed in {:.1}s with {} images",
                self.session_id,
                elapsed.as_secs_f64(),
                self.image_count
            ),
            SessionOutcome::Cancelled => {
                log::info!("Generation session {} cancelled", self.session_id)
            }
            SessionOutcome::Failed(reason) => {
                log::warn!("Generation session {} failed: {}", self.session_id, reason)
            }
            SessionOutcome::TimedOut => log::warn!(
                "Generation session {} timed out after {:?}",
                self.session_id,
                elapsed
            ),
        }

        self.registry.schedule_release(&self.session_id);
    }
}
