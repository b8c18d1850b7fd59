//! Client-side view of a relay call: coalesces deltas into at most one repaint per frame.

use crate::constants::EMPTY_RESPONSE_PLACEHOLDER;
use crate::relay::{CompletionOutcome, RelayEvent, RelayFailure};
use crate::types::Role;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub streaming: bool,
    pub is_error: bool,
}

impl DisplayMessage {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            streaming: false,
            is_error: false,
        }
    }
}

/// Raised on terminal errors, separate from the message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    /// Quota or subscription exhausted. Shown as an upgrade prompt, not a generic error.
    Paywall { message: String },
    Error {
        message: String,
        code: String,
        request_id: String,
        partial_content: Option<String>,
    },
}

// Owned by the call; dropped when the call ends.
struct Accumulator {
    message_id: String,
    text: String,
    dirty: bool,
}

pub struct Reconciler {
    messages: Vec<DisplayMessage>,
    in_progress: Option<Accumulator>,
    signals: mpsc::UnboundedSender<ClientSignal>,
    repaints: u64,
}

impl Reconciler {
    pub fn new(history: Vec<DisplayMessage>) -> (Self, mpsc::UnboundedReceiver<ClientSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        (
            Self {
                messages: history,
                in_progress: None,
                signals,
                repaints: 0,
            },
            rx,
        )
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn repaints(&self) -> u64 {
        self.repaints
    }

    pub fn is_streaming(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Pushes the streaming placeholder. A second call while one is open is ignored.
    pub fn begin(&mut self, message_id: impl Into<String>) {
        if self.in_progress.is_some() {
            return;
        }
        let message_id = message_id.into();
        let mut placeholder = DisplayMessage::new(message_id.clone(), Role::Assistant, "");
        placeholder.streaming = true;
        self.messages.push(placeholder);
        self.in_progress = Some(Accumulator {
            message_id,
            text: String::new(),
            dirty: false,
        });
    }

    /// Appends to the accumulator only; the placeholder changes on the next [`flush`](Self::flush).
    pub fn push_delta(&mut self, delta: &str) {
        if self.in_progress.is_none() {
            self.begin(format!("pending-{}", uuid::Uuid::new_v4()));
        }
        if let Some(acc) = self.in_progress.as_mut() {
            acc.text.push_str(delta);
            acc.dirty = true;
        }
    }

    /// Copies pending text into the placeholder. Returns whether anything changed.
    pub fn flush(&mut self) -> bool {
        let acc = match self.in_progress.as_mut() {
            Some(acc) if acc.dirty => acc,
            _ => return false,
        };
        acc.dirty = false;
        let id = acc.message_id.clone();
        let text = acc.text.clone();
        if let Some(placeholder) = self.placeholder_mut(&id) {
            placeholder.content = text;
        }
        self.repaints += 1;
        true
    }

    /// Replaces the placeholder with the finalized message.
    pub fn complete(&mut self, outcome: &CompletionOutcome) {
        let id = match self.in_progress.take() {
            Some(acc) => acc.message_id,
            None => {
                self.begin(outcome.request_id.0.clone());
                match self.in_progress.take() {
                    Some(acc) => acc.message_id,
                    None => return,
                }
            }
        };
        let final_id = outcome
            .persistence
            .message_id
            .clone()
            .unwrap_or_else(|| id.clone());

        if let Some(message) = self.placeholder_mut(&id) {
            message.id = final_id;
            message.streaming = false;
            if outcome.content.trim().is_empty() {
                message.content = EMPTY_RESPONSE_PLACEHOLDER.to_string();
                message.is_error = true;
            } else {
                message.content = outcome.content.clone();
            }
        }
    }

    /// Removes the placeholder and raises the matching signal.
    pub fn fail(&mut self, failure: &RelayFailure) {
        if let Some(acc) = self.in_progress.take() {
            self.messages.retain(|m| m.id != acc.message_id);
        }
        let signal = if failure.is_quota_exceeded() {
            ClientSignal::Paywall {
                message: failure.message(),
            }
        } else {
            ClientSignal::Error {
                message: failure.message(),
                code: failure.code().to_string(),
                request_id: failure.request_id.0.clone(),
                partial_content: if failure.partial_content.is_empty() {
                    None
                } else {
                    Some(failure.partial_content.clone())
                },
            }
        };
        if self.signals.send(signal).is_err() {
            tracing::debug!("[🖥️ ] Signal receiver dropped");
        }
    }

    /// The call ended without a terminal event (cancelled). The placeholder is discarded.
    pub fn abandon(&mut self) {
        if let Some(acc) = self.in_progress.take() {
            self.messages.retain(|m| m.id != acc.message_id);
        }
    }

    fn placeholder_mut(&mut self, id: &str) -> Option<&mut DisplayMessage> {
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }

    /// Applies one relay event. Returns true for terminal events.
    pub fn apply(&mut self, event: RelayEvent) -> bool {
        match event {
            RelayEvent::Started { request_id, .. } => {
                self.begin(request_id.0);
                false
            }
            RelayEvent::Delta(text) => {
                self.push_delta(&text);
                false
            }
            RelayEvent::Completed(outcome) => {
                self.complete(&outcome);
                true
            }
            RelayEvent::Failed(failure) => {
                self.fail(&failure);
                true
            }
        }
    }
}

/// Consumes a call's events, repainting at most once per `frame` plus once at the end.
pub async fn drive<F>(
    reconciler: &mut Reconciler,
    events: &mut mpsc::Receiver<RelayEvent>,
    frame: Duration,
    mut paint: F,
) where
    F: FnMut(&[DisplayMessage]),
{
    let mut ticker = tokio::time::interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if reconciler.apply(event) {
                        paint(reconciler.messages());
                        return;
                    }
                }
                None => {
                    reconciler.abandon();
                    paint(reconciler.messages());
                    return;
                }
            },
            _ = ticker.tick() => {
                if reconciler.flush() {
                    paint(reconciler.messages());
                }
            }
        }
    }
}
