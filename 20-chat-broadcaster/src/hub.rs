//! The broadcast hub: sole owner of room membership.
//!
//! Sessions never touch the member list. They submit [`HubEvent`]s through a
//! cloneable [`HubHandle`], and a single task drains the queue one event at a
//! time. Because nothing else mutates `members`, every event observes a
//! consistent room and all deliveries follow one total order.
//!
//! A member record holds the only sender of that session's outbound queue.
//! Removing the record drops the sender, which is how a queue gets closed, so
//! "close" can only ever happen once and only after removal.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info};

pub type SessionId = u64;

/// Sender half of a session's outbound queue.
pub type Outbound = mpsc::UnboundedSender<String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is no longer processing events")]
    Closed,
}

/// Events consumed by the hub loop, in arrival order.
#[derive(Debug)]
pub enum HubEvent {
    Register(Member),
    Unregister(SessionId),
    Broadcast(String),
    Whisper {
        id: SessionId,
        text: String,
    },
    Members {
        respond_to: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

#[derive(Debug)]
pub struct Member {
    id: SessionId,
    name: String,
    outbound: Outbound,
}

impl Member {
    fn deliver(&self, text: String) {
        // The receiver is gone once the session's writer stops; its own
        // unregister is already on the way.
        if self.outbound.send(text).is_err() {
            debug!(id = self.id, name = %self.name, "outbound receiver already dropped");
        }
    }
}

#[derive(Clone, Debug)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hands `outbound` to the hub. From here on the hub is its only writer.
    pub fn register(
        &self,
        id: SessionId,
        name: impl Into<String>,
        outbound: Outbound,
    ) -> Result<(), HubError> {
        self.send(HubEvent::Register(Member {
            id,
            name: name.into(),
            outbound,
        }))
    }

    pub fn unregister(&self, id: SessionId) -> Result<(), HubError> {
        self.send(HubEvent::Unregister(id))
    }

    pub fn broadcast(&self, text: impl Into<String>) -> Result<(), HubError> {
        self.send(HubEvent::Broadcast(text.into()))
    }

    /// Delivers `text` to a single member only.
    pub fn whisper(&self, id: SessionId, text: impl Into<String>) -> Result<(), HubError> {
        self.send(HubEvent::Whisper {
            id,
            text: text.into(),
        })
    }

    /// Names of the current members, in registration order.
    pub async fn members(&self) -> Result<Vec<String>, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubEvent::Members { respond_to })?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Stops the hub. Every remaining outbound queue is closed.
    pub fn shutdown(&self) -> Result<(), HubError> {
        self.send(HubEvent::Shutdown)
    }

    fn send(&self, event: HubEvent) -> Result<(), HubError> {
        self.events.send(event).map_err(|_| HubError::Closed)
    }
}

pub struct Hub {
    events: mpsc::UnboundedReceiver<HubEvent>,
    members: Vec<Member>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let hub = Self {
            events: events_rx,
            members: Vec::new(),
        };
        let handle = HubHandle {
            events: events_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Creates a hub and runs it on its own task.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new();
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Processes events until [`HubEvent::Shutdown`] arrives or every handle
    /// has been dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        info!(remaining = self.members.len(), "hub stopped");
    }

    fn handle_event(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Register(member) => self.handle_register(member),
            HubEvent::Unregister(id) => self.handle_unregister(id),
            HubEvent::Broadcast(text) => self.handle_broadcast(text),
            HubEvent::Whisper { id, text } => self.handle_whisper(id, text),
            HubEvent::Members { respond_to } => {
                let names = self.members.iter().map(|m| m.name.clone()).collect();
                let _ = respond_to.send(names);
            }
            HubEvent::Shutdown => return false,
        }
        true
    }

    fn handle_register(&mut self, member: Member) {
        // Roster is taken before insertion, so the arrival never sees itself.
        for existing in &self.members {
            member.deliver(format!("{} is here.", existing.name));
        }
        info!(
            id = member.id,
            name = %member.name,
            members = self.members.len() + 1,
            "session registered"
        );
        self.members.push(member);
    }

    fn handle_unregister(&mut self, id: SessionId) {
        match self.members.iter().position(|m| m.id == id) {
            Some(index) => {
                // Dropping the record closes the outbound queue.
                let member = self.members.remove(index);
                info!(
                    id,
                    name = %member.name,
                    members = self.members.len(),
                    "session unregistered"
                );
            }
            None => debug!(id, "unregister for unknown session"),
        }
    }

    fn handle_broadcast(&self, text: String) {
        for member in &self.members {
            member.deliver(text.clone());
        }
    }

    fn handle_whisper(&self, id: SessionId, text: String) {
        match self.members.iter().find(|m| m.id == id) {
            Some(member) => member.deliver(text),
            None => debug!(id, "whisper for unknown session"),
        }
    }
}
