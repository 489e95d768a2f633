//! Job executor trait and utilities for the session server.

use async_trait::async_trait;
use futures_util::Stream;
use genstream_types::{Event, ImageArtifact};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ServerError};

/// Type alias for executor update streams.
///
/// The stream ending means the job succeeded; an `Err` item means it failed.
pub type JobStream = Pin<Box<dyn Stream<Item = Result<JobUpdate>> + Send>>;

/// What the session hands the executor when a job starts.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub session_id: String,
    pub prompt: String,
    /// Signalled when the session is cancelled. Executors may watch it to stop early.
    pub cancel: CancellationToken,
}

/// Non-terminal progress reported by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobUpdate {
    Phase {
        phase: String,
        label: String,
    },
    ToolStart {
        tool: String,
        tool_id: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolEnd {
        tool_id: String,
        success: bool,
    },
    Message {
        text: String,
    },
    Status {
        message: String,
    },
    Image(ImageArtifact),
}

impl JobUpdate {
    pub fn phase(phase: impl Into<String>, label: impl Into<String>) -> Self {
        JobUpdate::Phase {
            phase: phase.into(),
            label: label.into(),
        }
    }

    pub fn tool_start(
        tool: impl Into<String>,
        tool_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        JobUpdate::ToolStart {
            tool: tool.into(),
            tool_id: tool_id.into(),
            input,
        }
    }

    pub fn tool_end(tool_id: impl Into<String>, success: bool) -> Self {
        JobUpdate::ToolEnd {
            tool_id: tool_id.into(),
            success,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        JobUpdate::Message { text: text.into() }
    }

    pub fn into_event(self) -> Event {
        match self {
            JobUpdate::Phase { phase, label } => Event::Phase { phase, label },
            JobUpdate::ToolStart {
                tool,
                tool_id,
                input,
            } => Event::ToolStart {
                tool,
                tool_id,
                input,
            },
            JobUpdate::ToolEnd { tool_id, success } => Event::ToolEnd { tool_id, success },
            JobUpdate::Message { text } => Event::Message { text },
            JobUpdate::Status { message } => Event::Status {
                message,
                success: None,
            },
            JobUpdate::Image(artifact) => Event::image(&artifact),
        }
    }
}

/// Trait for the external collaborator that performs the actual generation.
///
/// The session layer treats the executor as opaque: it starts a job, consumes
/// the update stream, and turns the end of the stream into a terminal event.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    /// Start a job and return its update stream.
    async fn start(&self, request: JobRequest) -> Result<JobStream>;

    /// Optional method to validate a prompt before a session is created.
    ///
    /// The default implementation rejects empty prompts.
    fn validate_prompt(&self, prompt: &str) -> Result<()> {
        if prompt.trim().is_empty() {
            return Err(ServerError::invalid_input("Prompt cannot be empty"));
        }
        Ok(())
    }

    /// Name used in logs and the health endpoint.
    fn name(&self) -> &str {
        "executor"
    }
}

/// An executor that plays back a fixed list of updates.
#[derive(Debug, Clone)]
pub struct ScriptedExecutor {
    updates: Vec<JobUpdate>,
    step_delay: std::time::Duration,
    failure: Option<String>,
}

impl ScriptedExecutor {
    pub fn new(updates: Vec<JobUpdate>) -> Self {
        Self {
            updates,
            step_delay: std::time::Duration::ZERO,
            failure: None,
        }
    }

    /// A short research, hooks, art and images run used by the demo binary.
    pub fn demo() -> Self {
        Self::new(streams::demo_updates()).with_step_delay(std::time::Duration::from_millis(750))
    }

    pub fn with_step_delay(mut self, delay: std::time::Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Fail with `error` after all updates have been played.
    pub fn failing_with(mut self, error: impl Into<String>) -> Self {
        self.failure = Some(error.into());
        self
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn start(&self, request: JobRequest) -> Result<JobStream> {
        log::debug!(
            "Scripted executor starting session {} with {} updates",
            request.session_id,
            self.updates.len()
        );
        let stream = streams::scripted(self.updates.clone(), self.step_delay);
        Ok(match &self.failure {
            Some(error) => streams::then_fail(stream, error.clone()),
            None => stream,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Utility functions for creating common update streams.
pub mod streams {
    use super::*;
    use async_stream::stream;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Emit `updates` in order, sleeping `delay` before each one.
    pub fn scripted(updates: Vec<JobUpdate>, delay: Duration) -> JobStream {
        Box::pin(stream! {
            for update in updates {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                yield Ok(update);
            }
        })
    }

    /// Run `inner` to completion, then fail.
    pub fn then_fail(inner: JobStream, error: String) -> JobStream {
        Box::pin(stream! {
            let mut inner = inner;
            while let Some(item) = inner.next().await {
                yield item;
            }
            yield Err(ServerError::executor(error));
        })
    }

    /// Never yields and never ends.
    pub fn stalled() -> JobStream {
        Box::pin(futures_util::stream::pending())
    }

    pub fn demo_updates() -> Vec<JobUpdate> {
        vec![
            JobUpdate::phase("research", "Researching"),
            JobUpdate::tool_start("web_fetch", "tool-1", json!({"url": "https://example.com"})),
            JobUpdate::tool_end("tool-1", true),
            JobUpdate::message("Drafting hook and headline copy"),
            JobUpdate::tool_start("Skill", "tool-2", json!({"skill": "art-style"})),
            JobUpdate::tool_end("tool-2", true),
            JobUpdate::tool_start(
                "mcp__nano-banana__generate_ad_images",
                "tool-3",
                json!({"count": 2}),
            ),
            JobUpdate::Image(
                ImageArtifact::new("img-1", "/images/demo/hero-1.png").with_prompt("hero shot"),
            ),
            JobUpdate::Image(
                ImageArtifact::new("img-2", "/images/demo/hero-2.png").with_prompt("hero shot"),
            ),
            JobUpdate::tool_end("tool-3", true),
        ]
    }
}
