//! Per-tab outbound event buffer with long-poll pairing
//!
//! Events are buffered as serialized `{"type", "value"}` envelopes until a
//! poll request is attached, then delivered together as one JSON array and
//! cleared. At most one poll request is attached at a time.

use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::DeliveryError;

/// Default buffer budget in bytes of serialized envelopes
pub const DEFAULT_QUEUE_BUDGET: usize = 12_000;

/// Replaces a delivery cycle's events once they exceed the budget
pub const OVERFLOW_EVENT: &str = r#"{"type":"error","value":"overflow"}"#;

/// Sent to a poll that arrives while another poll is still attached
pub const CLASH_EVENT: &str = r#"{"type":"error","value":"clash"}"#;

static NEXT_POLL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one poll request, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollId(u64);

/// Server side of one long-poll: completing it answers the HTTP request
#[derive(Debug)]
pub struct PollRequest {
    id: PollId,
    sender: oneshot::Sender<String>,
}

/// Client side of one long-poll, awaited by the HTTP handler
#[derive(Debug)]
pub struct PollResponse {
    id: PollId,
    receiver: oneshot::Receiver<String>,
}

impl PollRequest {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (PollRequest, PollResponse) {
        let id = PollId(NEXT_POLL_ID.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        (PollRequest { id, sender }, PollResponse { id, receiver })
    }

    pub fn id(&self) -> PollId {
        self.id
    }

    /// Hand `payload` to the waiting client
    pub fn complete(self, payload: String) -> Result<(), DeliveryError> {
        self.sender
            .send(payload)
            .map_err(|_| DeliveryError::ReceiverGone)
    }
}

impl PollResponse {
    pub fn id(&self) -> PollId {
        self.id
    }

    /// Wait for the payload. `None` means the request was dropped without
    /// an answer, which happens when its tab closes.
    pub async fn wait(self) -> Option<String> {
        self.receiver.await.ok()
    }
}

/// What [`EventQueue::add_request`] did with a new request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRequestOutcome {
    /// Buffered events were delivered straight away
    Delivered,
    /// Nothing to send yet; the request is now the listener
    Parked,
    /// Another request is attached; the new one got a clash event
    Clash,
    /// Buffered events could not be handed over; the buffer is kept
    Failed,
}

#[derive(Debug)]
pub struct EventQueue {
    items: Vec<String>,
    size: usize,
    budget: usize,
    overflow: bool,
    listener: Option<PollRequest>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_BUDGET)
    }
}

impl EventQueue {
    pub fn new(budget: usize) -> Self {
        Self {
            items: Vec::new(),
            size: 0,
            budget,
            overflow: false,
            listener: None,
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Number of buffered envelopes
    pub fn queue_size(&self) -> usize {
        self.items.len()
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflow
    }

    /// Buffer one event, delivering immediately if a listener is attached.
    pub fn append(&mut self, kind: &str, value: Value) {
        if self.overflow {
            debug!(kind, "event queue overflowed, dropping event");
        } else {
            let envelope = json!({ "type": kind, "value": value }).to_string();
            if self.size + envelope.len() > self.budget {
                warn!(
                    discarded = self.items.len() + 1,
                    budget = self.budget,
                    "event queue overflow"
                );
                self.items.clear();
                self.items.push(OVERFLOW_EVENT.to_string());
                self.size = OVERFLOW_EVENT.len();
                self.overflow = true;
            } else {
                self.size += envelope.len();
                self.items.push(envelope);
            }
        }
        self.complete_now();
    }

    pub fn add_request(&mut self, request: PollRequest) -> AddRequestOutcome {
        if self.listener.is_some() {
            warn!("second concurrent poll on one tab, answering with clash");
            if request.complete(format!("[{CLASH_EVENT}]")).is_err() {
                debug!("clashing poll client already gone");
            }
            return AddRequestOutcome::Clash;
        }
        if self.items.is_empty() {
            self.listener = Some(request);
            return AddRequestOutcome::Parked;
        }
        if self.deliver(request) {
            AddRequestOutcome::Delivered
        } else {
            AddRequestOutcome::Failed
        }
    }

    /// Detach the listener if it is `id`. Stale ids are ignored.
    pub fn cancel_request(&mut self, id: PollId) -> bool {
        match &self.listener {
            Some(listener) if listener.id == id => {
                self.listener = None;
                true
            }
            _ => false,
        }
    }

    /// Deliver whatever is buffered, possibly nothing, to the attached
    /// listener and detach it. Returns whether a delivery happened.
    pub fn complete_now(&mut self) -> bool {
        match self.listener.take() {
            Some(request) => self.deliver(request),
            None => false,
        }
    }

    /// Detach the listener without answering it
    pub fn take_listener(&mut self) -> Option<PollRequest> {
        self.listener.take()
    }

    fn deliver(&mut self, request: PollRequest) -> bool {
        let payload = format!("[{}]", self.items.join(","));
        match request.complete(payload) {
            Ok(()) => {
                self.items.clear();
                self.size = 0;
                self.overflow = false;
                true
            }
            Err(e) => {
                // keep the buffer for the next poll
                warn!(queued = self.items.len(), "dropping poll request: {}", e);
                false
            }
        }
    }
}
