//! Binds client channels to sessions and routes events between them.
//!
//! Each session has a slot holding at most one bound channel. Appending an
//! event to the log and forwarding it to the bound channel happen under the
//! slot lock, and so do replay and the binding switch in [`Multiplexer::subscribe`].
//! An event is therefore either part of the replay or delivered live, never
//! both and never neither.

use genstream_types::{Event, ServerMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::abort::AbortRegistry;
use crate::channel::ClientChannel;
use crate::error::{Result, ServerError};
use crate::event_log::EventLog;

#[derive(Default)]
struct Slot {
    binding: Option<ClientChannel>,
}

type SlotRef = Arc<Mutex<Slot>>;

fn lock_slot(slot: &SlotRef) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Multiplexer {
    log: Arc<EventLog>,
    aborts: Arc<AbortRegistry>,
    slots: Mutex<HashMap<String, SlotRef>>,
}

impl Multiplexer {
    pub fn new(log: Arc<EventLog>, aborts: Arc<AbortRegistry>) -> Self {
        Self {
            log,
            aborts,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn aborts(&self) -> &Arc<AbortRegistry> {
        &self.aborts
    }

    fn slot(&self, session_id: &str) -> SlotRef {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, session_id: &str) -> Option<SlotRef> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Drop the channel's binding to a session other than `next`.
    fn leave_previous(&self, channel: &ClientChannel, next: &str) {
        if let Some(previous) = channel.session_id() {
            if previous != next {
                self.unbind(channel, &previous);
            }
        }
    }

    fn unbind(&self, channel: &ClientChannel, session_id: &str) -> bool {
        let Some(slot) = self.existing_slot(session_id) else {
            return false;
        };
        let mut slot = lock_slot(&slot);
        match &slot.binding {
            Some(bound) if bound.same_as(channel) => {
                slot.binding = None;
                true
            }
            _ => false,
        }
    }

    /// Bind `channel` to a freshly started session.
    ///
    /// Any channel previously bound to the session is replaced silently.
    pub fn attach(&self, channel: &ClientChannel, session_id: &str) {
        self.leave_previous(channel, session_id);
        let slot = self.slot(session_id);
        let mut slot = lock_slot(&slot);
        if let Some(previous) = slot.binding.replace(channel.clone()) {
            if !previous.same_as(channel) {
                log::debug!(
                    "Channel {} superseded by {} on session {}",
                    previous.id(),
                    channel.id(),
                    session_id
                );
            }
        }
        channel.bind(session_id, self.aborts.lookup(session_id));
        log::info!(
            "Channel {} ({}) attached to session {}",
            channel.id(),
            channel.kind(),
            session_id
        );
    }

    /// Reattach `channel` to an existing session.
    ///
    /// Replays every event after `last_event_id`, sends `subscribed`, then
    /// binds the channel for live delivery. Returns the number of replayed events.
    pub fn subscribe(
        &self,
        channel: &ClientChannel,
        session_id: &str,
        last_event_id: u64,
    ) -> Result<usize> {
        if !self.log.exists(session_id) {
            log::info!(
                "Subscribe from channel {} to unknown session {}",
                channel.id(),
                session_id
            );
            return Err(ServerError::session_not_found(session_id));
        }

        self.leave_previous(channel, session_id);
        let slot = self.slot(session_id);
        let mut slot = lock_slot(&slot);

        let missed = self.log.since(session_id, last_event_id);
        let replayed = missed.len();
        for event in &missed {
            channel.deliver(event.to_message());
        }
        // Queued behind the replay when the channel is paused.
        channel.deliver(ServerMessage::unbuffered(Event::Subscribed {
            session_id: session_id.to_string(),
            message: format!("Replayed {} events", replayed),
        }));

        slot.binding = Some(channel.clone());
        channel.bind(session_id, self.aborts.lookup(session_id));

        log::info!(
            "Channel {} resubscribed to session {} after event {}, replayed {}",
            channel.id(),
            session_id,
            last_event_id,
            replayed
        );
        Ok(replayed)
    }

    /// Remove the channel's binding. The session and its log are untouched.
    pub fn detach(&self, channel: &ClientChannel) {
        let Some(session_id) = channel.session_id() else {
            return;
        };
        if self.unbind(channel, &session_id) {
            log::info!(
                "Client disconnected from session {}, generation continues in background",
                session_id
            );
        }
    }

    /// Append an event to the session's log and forward it to the bound channel.
    ///
    /// Returns the assigned sequence id. Delivery failures are swallowed; a
    /// dead channel is unbound.
    pub fn emit(&self, session_id: &str, event: Event) -> u64 {
        let slot = self.slot(session_id);
        let mut slot = lock_slot(&slot);
        let buffered = self.log.append(session_id, event);

        if let Some(channel) = &slot.binding {
            if !channel.deliver(buffered.to_message()) {
                log::debug!(
                    "Dropping dead channel {} from session {}",
                    channel.id(),
                    session_id
                );
                slot.binding = None;
            }
        }
        buffered.id
    }

    /// Send an unbuffered event to one channel.
    pub fn send_direct(&self, channel: &ClientChannel, event: Event) -> bool {
        channel.send_direct(event)
    }

    pub fn pause(&self, channel: &ClientChannel) {
        channel.pause();
        channel.send_direct(Event::ack("Stream paused"));
    }

    /// Flush withheld events, then acknowledge.
    pub fn resume(&self, channel: &ClientChannel) -> usize {
        let flushed = channel.resume();
        channel.send_direct(Event::ack("Stream resumed"));
        flushed
    }

    /// Cancel the generation the channel is bound to.
    ///
    /// The registry's handle for the bound session wins over the handle the
    /// channel captured at bind time. Returns false if there was nothing to cancel.
    pub fn cancel(&self, channel: &ClientChannel) -> bool {
        let session_id = channel.session_id();
        let handle = session_id
            .as_deref()
            .and_then(|id| self.aborts.lookup(id))
            .or_else(|| channel.abort_handle());

        match handle {
            Some(handle) if !handle.is_cancelled() => {
                handle.cancel();
                log::info!(
                    "Cancel requested for session {}",
                    session_id.as_deref().unwrap_or("<unbound>")
                );
                let ack = match session_id {
                    Some(id) => Event::ack_for_session("Cancel requested", id),
                    None => Event::ack("Cancel requested"),
                };
                channel.send_direct(ack);
                true
            }
            _ => {
                log::info!("No active generation to cancel on channel {}", channel.id());
                false
            }
        }
    }

    /// Id of the channel currently bound to a session.
    pub fn bound_channel(&self, session_id: &str) -> Option<String> {
        let slot = self.existing_slot(session_id)?;
        let slot = lock_slot(&slot);
        slot.binding.as_ref().map(|channel| channel.id().to_string())
    }

    /// Forget a session's slot. Used when the session is reclaimed.
    pub fn release(&self, session_id: &str) {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
    }
}
