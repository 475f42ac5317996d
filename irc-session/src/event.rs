//! Events published by a connection for the UI layer to consume.
//!
//! There is one enum per category: connection-wide events, channel events
//! and private-conversation events. All of them are wrapped in [`Event`] and
//! delivered through an [`EventBus`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::channel::{PartReason, Topic};
use crate::status::TransitionHistory;

/// Process-unique identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServerId(pub u64);

impl ServerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ServerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Anything published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum Event {
    Connection {
        server: ServerId,
        event: ConnectionEvent,
    },
    Channel {
        server: ServerId,
        channel: String,
        event: ChannelEvent,
    },
    Query {
        server: ServerId,
        nickname: String,
        event: QueryEvent,
    },
}

impl Event {
    pub fn server(&self) -> ServerId {
        match self {
            Event::Connection { server, .. }
            | Event::Channel { server, .. }
            | Event::Query { server, .. } => *server,
        }
    }

    /// JSON rendering, for log sinks.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

/// Connection-wide events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// No transport is registered for the address scheme.
    UnknownProtocol { scheme: String },
    /// A connection attempt started.
    Connecting { address: String },
    /// Registration finished.
    Connected { network: String },
    /// The socket closed.
    Disconnected,
    /// The connection attempt failed.
    ConnectError { description: String },
    /// A reconnect will be attempted after `delay_ms`.
    ReconnectScheduled { delay_ms: u64 },
    /// A dispatch path broke an invariant. Always a bug.
    InternalError {
        message: String,
        history: TransitionHistory,
    },
    /// Our own away state changed.
    AwayChanged { message: Option<String> },
    /// Our own nickname changed.
    NickChanged { old: String, new: String },
    /// The server rejected a nickname during registration.
    NickInUse { nickname: String },
    ServerNotice { source: String, text: String },
    ServerError { message: String },
    Numeric { code: u16, params: Vec<String> },
    UserModes { modes: String },
    /// A CTCP request arrived outside any channel.
    CtcpRequest {
        source: String,
        kind: String,
        args: String,
    },
    CtcpReply {
        source: String,
        kind: String,
        args: String,
    },
    InviteReceived { channel: String, source: String },
    InviteExpired { channel: String, source: String },
    PingSent,
    PingSuccess { latency_ms: u64 },
    PingFailed { elapsed_ms: u64 },
    /// The server has not answered pings for longer than the configured timeout.
    Unresponsive { elapsed_ms: u64 },
    ParserError { line: String, message: String },
}

/// Per-channel events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// We joined. `focus` is false for background joins.
    SelfJoin { focus: bool },
    SelfPart { reason: PartReason, message: String },
    SelfMessage { text: String },
    SelfAction { text: String },
    Message { source: String, text: String },
    Action { source: String, text: String },
    Notice { source: String, text: String },
    Join { client: String },
    Part { client: String, message: String },
    Kick {
        kicker: String,
        victim: String,
        reason: String,
    },
    Quit { client: String, message: String },
    NickChange { old: String, new: String },
    ModeChange { source: String, modes: String },
    ModesDiscovered { modes: String },
    ListModes { mode: char, entries: Vec<String> },
    /// A topic was set live or discovered on join. `None` means unset.
    Topic {
        topic: Option<Topic>,
        discovered: bool,
    },
    /// The member list was replaced.
    RosterUpdated { members: usize },
    /// The member list was emptied.
    RosterCleared,
    Ctcp {
        source: String,
        kind: String,
        args: String,
    },
    CtcpReply {
        source: String,
        kind: String,
        args: String,
    },
    UserAway { nickname: String, away: bool },
    Closed,
}

/// Events of one private conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Opened,
    Message { text: String },
    Action { text: String },
    Notice { text: String },
    SelfMessage { text: String },
    SelfAction { text: String },
    NickChange { old: String, new: String },
    Quit { message: String },
    UserAway { away: bool },
    Closed,
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// In-process publish/subscribe bus.
///
/// Inline listeners run on the publishing thread before any subscriber sees
/// the event. They may be called while the connection's state lock is held,
/// so they must not call back into lifecycle operations.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Register a synchronous listener.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn publish(&self, event: Event) {
        let listeners: Vec<Listener> = self.listeners.read().clone();
        for listener in &listeners {
            listener(&event);
        }
        // Dropped receivers are pruned here.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}
