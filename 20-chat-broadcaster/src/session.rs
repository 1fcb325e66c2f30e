//! Per-client lifecycle: `Connecting -> Active -> Draining -> Closed`.
//!
//! A session resolves its display name, hands its outbound queue to the hub,
//! then runs two duties. The inbound duty turns each received line into a
//! broadcast; the outbound duty runs on its own task and writes whatever the
//! hub queues for this client. Departure (disconnect, read failure, idle
//! timeout, or the writer giving up) drives a single pass through Draining.

use std::time::Duration;

use tokio::{
    select,
    sync::mpsc,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{Connection, LineReader, LineWriter},
    hub::{HubError, HubHandle, SessionId},
};

/// Private notice sent to a client evicted for inactivity.
pub const TIMED_OUT_NOTICE: &str = "Timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Longest gap between inbound lines before the session is evicted.
    pub idle_timeout: Duration,
    /// How long a timed-out client gets to receive its notice before it is
    /// unregistered.
    pub timeout_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            timeout_grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    fn can_enter(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active) | (Active, Draining) | (Draining, Closed)
        )
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Disconnected,
    ReadFailed,
    TimedOut,
    /// The outbound duty stopped first, either on a write error or because
    /// the hub closed the queue.
    WriterStopped,
    /// The hub stopped accepting events while the session was active.
    HubClosed,
}

/// Picks the display name from the first line a client sends.
///
/// The first whitespace-separated word wins. Blank input, or a word made only
/// of `-` placeholders, falls back to `default`.
pub fn resolve_name(line: &str, default: &str) -> String {
    match line.split_whitespace().next() {
        Some(word) if !word.trim_matches('-').is_empty() => word.to_string(),
        _ => default.to_string(),
    }
}

struct Session {
    id: SessionId,
    name: String,
    state: SessionState,
    hub: HubHandle,
    config: SessionConfig,
}

impl Session {
    fn new(hub: HubHandle, config: SessionConfig) -> Self {
        Self {
            id: hub.next_session_id(),
            name: String::new(),
            state: SessionState::Connecting,
            hub,
            config,
        }
    }

    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_enter(next) {
            error!(id = self.id, from = ?self.state, to = ?next, "rejected session transition");
            return false;
        }
        debug!(id = self.id, from = ?self.state, to = ?next, "session transition");
        self.state = next;
        true
    }

    /// Reads the handshake line.
    ///
    /// A client that sends nothing still joins under `peer`; the returned
    /// departure is then already decided and is acted on once it is active.
    async fn resolve<R: LineReader>(
        &self,
        reader: &mut R,
        peer: &str,
    ) -> (String, Option<Departure>) {
        let ended = match timeout(self.config.idle_timeout, reader.read_line()).await {
            Ok(Ok(Some(line))) => return (resolve_name(&line, peer), None),
            Ok(Ok(None)) => Departure::Disconnected,
            Ok(Err(err)) => {
                debug!(peer, error = ?err, "failed to read client name");
                Departure::ReadFailed
            }
            Err(_) => {
                debug!(peer, "client sent no name before the idle timeout");
                Departure::TimedOut
            }
        };
        (resolve_name("", peer), Some(ended))
    }

    /// Welcome privately, announce publicly, then join the room.
    fn activate(
        &mut self,
        name: String,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<(), HubError> {
        if !self.transition(SessionState::Active) {
            return Ok(());
        }
        self.name = name;
        // The hub does not own the queue yet, so this is still the only writer.
        let _ = outbound.send(format!("You are {}", self.name));
        self.hub.broadcast(format!("{} has arrived", self.name))?;
        self.hub.register(self.id, self.name.clone(), outbound)?;
        info!(id = self.id, name = %self.name, "session active");
        Ok(())
    }

    /// Inbound duty, unless the handshake already ended the connection.
    async fn attend<R: LineReader>(
        &self,
        reader: &mut R,
        ended: Option<Departure>,
    ) -> Departure {
        match ended {
            Some(Departure::TimedOut) => self.evict().await,
            Some(departure) => departure,
            None => self.read_loop(reader).await,
        }
    }

    async fn read_loop<R: LineReader>(&self, reader: &mut R) -> Departure {
        loop {
            match timeout(self.config.idle_timeout, reader.read_line()).await {
                Ok(Ok(Some(line))) => {
                    if self.hub.broadcast(format!("{}: {}", self.name, line)).is_err() {
                        return Departure::HubClosed;
                    }
                }
                Ok(Ok(None)) => return Departure::Disconnected,
                Ok(Err(err)) => {
                    debug!(id = self.id, error = ?err, "read failed");
                    return Departure::ReadFailed;
                }
                Err(_) => return self.evict().await,
            }
        }
    }

    /// Best-effort private notice, then a grace period before Draining.
    async fn evict(&self) -> Departure {
        info!(id = self.id, name = %self.name, "session idle, evicting");
        if self.hub.whisper(self.id, TIMED_OUT_NOTICE).is_err() {
            return Departure::HubClosed;
        }
        sleep(self.config.timeout_grace).await;
        Departure::TimedOut
    }

    /// Announces the departure and leaves the room. Runs at most once.
    fn drain(&mut self) {
        if !self.transition(SessionState::Draining) {
            return;
        }
        let result = self
            .hub
            .broadcast(format!("{} has left", self.name))
            .and_then(|()| self.hub.unregister(self.id));
        if let Err(err) = result {
            debug!(id = self.id, error = %err, "hub gone while draining");
        }
    }
}

/// Drives one client connection from accept to close.
pub async fn run_session<C: Connection>(
    connection: C,
    hub: HubHandle,
    config: SessionConfig,
) -> Departure {
    let peer = connection.peer().to_string();
    let (mut reader, writer) = connection.split();
    let mut session = Session::new(hub, config);

    let (name, ended) = session.resolve(&mut reader, &peer).await;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let mut delivery = tokio::spawn(deliver(writer, outbound_rx));

    if let Err(err) = session.activate(name, outbound_tx) {
        warn!(peer, error = %err, "hub unavailable, dropping connection");
    }

    let mut finished_writer = None;
    // Inbound endings win ties so a peer that already hung up is reported
    // as a disconnect rather than a failed write.
    let departure = select! {
        biased;
        departure = session.attend(&mut reader, ended) => departure,
        writer = &mut delivery => {
            finished_writer = Some(writer);
            Departure::WriterStopped
        }
    };
    info!(id = session.id, name = %session.name, ?departure, "session departing");

    session.drain();

    // The hub closes the queue once it processes the unregister, which lets
    // the outbound duty flush what is left and hand the writer back.
    let writer = match finished_writer {
        Some(writer) => writer,
        None => delivery.await,
    };
    session.transition(SessionState::Closed);
    match writer {
        Ok(mut writer) => close_writer(&mut writer, &peer).await,
        Err(err) => warn!(peer, error = ?err, "outbound duty panicked"),
    }

    departure
}

/// Outbound duty: writes queued lines until the hub closes the queue.
async fn deliver<W: LineWriter>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> W {
    while let Some(line) = outbound.recv().await {
        if let Err(err) = writer.write_line(&line).await {
            debug!(error = ?err, "failed to deliver line");
            break;
        }
    }
    writer
}

async fn close_writer<W: LineWriter>(writer: &mut W, peer: &str) {
    if let Err(err) = writer.close().await {
        debug!(peer, error = ?err, "failed to close connection cleanly");
    }
}
