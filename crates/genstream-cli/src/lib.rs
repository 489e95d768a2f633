//! Terminal front end for following generation sessions
//!
//! The binary drives a session through the reconnecting client and prints
//! what happens. Rendering lives here so it can be tested without a server.

use genstream_client::{ClientEvent, ClientOutcome, ConnectionState, SessionSnapshot};
use genstream_types::Event;

/// One line of terminal output for a client event, if it is worth showing.
pub fn render_event(event: &ClientEvent) -> Option<String> {
    match event {
        ClientEvent::State(state) => render_state(state),
        ClientEvent::Server(message) => {
            let line = render_server_event(&message.event)?;
            Some(match message.id {
                Some(id) => format!("[{:>3}] {}", id, line),
                None => format!("[  -] {}", line),
            })
        }
        ClientEvent::Snapshot(snapshot) => Some(format!(
            "[poll] {:?}, phase {}, {} images",
            snapshot.status,
            snapshot.phase.as_deref().unwrap_or("-"),
            snapshot.image_count
        )),
        ClientEvent::Images(images) => Some(
            images
                .iter()
                .map(|image| format!("[poll] image {}", image.url_path))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

fn render_state(state: &ConnectionState) -> Option<String> {
    match state {
        ConnectionState::Connecting | ConnectionState::Connected => None,
        ConnectionState::Reconnecting { attempt, delay } => Some(format!(
            "connection lost, reconnect attempt {} in {:?}",
            attempt, delay
        )),
        ConnectionState::Polling => {
            Some("realtime channel unavailable, polling for status".to_string())
        }
        ConnectionState::Disconnected => Some("disconnected".to_string()),
    }
}

fn render_server_event(event: &Event) -> Option<String> {
    Some(match event {
        Event::Ack { message, .. } => message.clone(),
        Event::Subscribed { message, .. } => message.clone(),
        Event::Phase { label, .. } => format!("== {} ==", label),
        Event::ToolStart { tool, .. } => format!("tool {} started", tool),
        Event::ToolEnd { tool_id, success } => format!(
            "tool {} {}",
            tool_id,
            if *success { "finished" } else { "failed" }
        ),
        Event::Message { text } => text.clone(),
        Event::Status { message, .. } => message.clone(),
        Event::Image { url_path, .. } => format!("image {}", url_path),
        Event::Complete { message, .. } => message.clone(),
        Event::Error { error, .. } => format!("error: {}", error),
        Event::Pong => return None,
    })
}

/// Final line for a finished session.
pub fn render_outcome(outcome: &ClientOutcome) -> String {
    match outcome {
        ClientOutcome::Completed {
            session_id,
            image_count,
        } => format!("Session {} completed with {} images", session_id, image_count),
        ClientOutcome::Failed { session_id, error } => {
            format!("Session {} failed: {}", session_id, error)
        }
        ClientOutcome::Cancelled { session_id } => format!("Session {} cancelled", session_id),
        ClientOutcome::SessionNotFound { session_id } => format!(
            "Session {} is no longer known to the server; start a new generation",
            session_id
        ),
        ClientOutcome::Disconnected { session_id } => format!(
            "Lost the server while session {} was running; run `genstream resume` later",
            session_id
        ),
        ClientOutcome::Closed { session_id } => format!(
            "Detached from session {}; it keeps running, run `genstream resume` to reattach",
            session_id
        ),
    }
}

/// Process exit code for an outcome.
pub fn exit_code(outcome: &ClientOutcome) -> i32 {
    match outcome {
        ClientOutcome::Completed { .. } | ClientOutcome::Cancelled { .. } => 0,
        ClientOutcome::Closed { .. } => 130,
        _ => 1,
    }
}

pub fn render_snapshot(snapshot: &SessionSnapshot) -> String {
    let mut lines = vec![
        format!("session:  {}", snapshot.session_id),
        format!("status:   {:?}", snapshot.status),
        format!("phase:    {}", snapshot.phase.as_deref().unwrap_or("-")),
        format!("created:  {}", snapshot.created_at),
        format!("events:   {}", snapshot.latest_event_id),
        format!("images:   {}", snapshot.image_count),
    ];
    lines.extend(
        snapshot
            .images
            .iter()
            .map(|image| format!("  {}", image.url_path)),
    );
    if let Some(ref error) = snapshot.error {
        lines.push(format!("error:    {}", error));
    }
    lines.join("\n")
}
