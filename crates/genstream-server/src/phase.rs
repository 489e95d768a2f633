//! Phase inference from executor progress.
//!
//! Executors that do not report phases explicitly still mention what they are
//! doing in their messages and tool calls. The tracker maps those hints to the
//! coarse phases shown to clients and reports a phase only when it changes.

use genstream_types::Event;

use crate::executor::JobUpdate;

pub const PHASE_PARSE: (&str, &str) = ("parse", "Parsing Request");
pub const PHASE_RESEARCH: (&str, &str) = ("research", "Researching");
pub const PHASE_HOOKS: (&str, &str) = ("hooks", "Generating Hooks");
pub const PHASE_ART: (&str, &str) = ("art", "Creating Art Direction");
pub const PHASE_IMAGES: (&str, &str) = ("images", "Generating Images");
pub const PHASE_COMPLETE: &str = "complete";

/// Phase suggested by free-form progress text, checked in priority order.
pub fn detect_from_text(text: &str) -> Option<(&'static str, &'static str)> {
    let lower = text.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|word| lower.contains(word));

    if mentions(&["research", "analyzing", "webpage"]) {
        Some(PHASE_RESEARCH)
    } else if mentions(&["hook", "headline", "copy"]) {
        Some(PHASE_HOOKS)
    } else if mentions(&["visual", "art", "style", "prompt"]) {
        Some(PHASE_ART)
    } else if mentions(&["image", "generat", "nano_banana"]) {
        Some(PHASE_IMAGES)
    } else {
        None
    }
}

/// Phase suggested by a tool invocation.
pub fn detect_from_tool(
    tool: &str,
    input: &serde_json::Value,
) -> Option<(&'static str, &'static str)> {
    match tool {
        "Task" => {
            let explore = input.get("subagent_type").and_then(|v| v.as_str()) == Some("Explore");
            let research = input
                .get("description")
                .and_then(|v| v.as_str())
                .map(|d| d.to_lowercase().contains("research"))
                .unwrap_or(false);
            (explore || research).then_some(PHASE_RESEARCH)
        }
        "Skill" => match input.get("skill").and_then(|v| v.as_str()) {
            Some("hook-methodology") => Some(PHASE_HOOKS),
            Some("art-style") => Some(PHASE_ART),
            _ => None,
        },
        "mcp__nano-banana__generate_ad_images" => Some(PHASE_IMAGES),
        _ => None,
    }
}

/// Tracks the current phase of one session.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    current: Option<String>,
    infer: bool,
}

impl PhaseTracker {
    pub fn new(infer: bool) -> Self {
        Self {
            current: None,
            infer,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Record an explicitly reported phase.
    pub fn set(&mut self, phase: &str) {
        self.current = Some(phase.to_string());
    }

    /// Phase event to emit after `update`, if it implies a new phase.
    pub fn observe(&mut self, update: &JobUpdate) -> Option<Event> {
        let detected = match update {
            JobUpdate::Phase { phase, .. } => {
                self.set(phase);
                return None;
            }
            _ if !self.infer => None,
            JobUpdate::Message { text } => detect_from_text(text),
            JobUpdate::ToolStart { tool, input, .. } => detect_from_tool(tool, input),
            _ => None,
        };

        let (phase, label) = detected?;
        if self.current.as_deref() == Some(phase) {
            return None;
        }
        self.set(phase);
        Some(Event::phase(phase, label))
    }
}
