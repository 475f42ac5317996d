//! Connection lifecycle states and the transition table that guards them.
//!
//! [`ServerStatus`] is owned by a single connection and is only ever mutated
//! through [`ServerStatus::transition`]. Every transition, legal or not, is
//! checked against a fixed table; illegal ones come back as
//! [`IllegalTransition`] together with the recent history so the dispatch bug
//! that caused them can be traced.

use std::collections::VecDeque;
use std::fmt;
use std::panic::Location;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Number of transitions kept for diagnostics.
pub const HISTORY_SIZE: usize = 10;

/// Lifecycle state of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// A transport exists and is opening its socket or registering.
    Connecting,
    /// Registration finished; the connection is usable.
    Connected,
    /// The connection dropped without being asked to.
    TransientlyDisconnected,
    /// Idle, no transport.
    Disconnected,
    /// We asked the transport to close and are waiting for the socket.
    Disconnecting,
    /// A reconnect timer is pending.
    ReconnectWait,
    /// The connection is being torn down for good.
    Closing,
}

impl ServerState {
    pub const ALL: [ServerState; 7] = [
        ServerState::Connecting,
        ServerState::Connected,
        ServerState::TransientlyDisconnected,
        ServerState::Disconnected,
        ServerState::Disconnecting,
        ServerState::ReconnectWait,
        ServerState::Closing,
    ];

    /// Whether no socket is (or is about to be) open in this state.
    pub fn is_disconnected(self) -> bool {
        matches!(
            self,
            ServerState::TransientlyDisconnected
                | ServerState::Disconnected
                | ServerState::ReconnectWait
                | ServerState::Closing
        )
    }

    /// The fixed transition table.
    pub fn can_transition_to(self, to: ServerState) -> bool {
        use ServerState::*;
        match (self, to) {
            (Closing, _) => false,
            (_, Closing) => true,
            (Disconnected | TransientlyDisconnected | ReconnectWait, Connecting) => true,
            (Connecting, Connected | TransientlyDisconnected | Disconnecting) => true,
            (Connected, Disconnecting | TransientlyDisconnected) => true,
            (Disconnecting, Disconnected) => true,
            (TransientlyDisconnected, ReconnectWait) => true,
            (ReconnectWait, TransientlyDisconnected | Disconnected) => true,
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ServerState::Connecting => "connecting",
            ServerState::Connected => "connected",
            ServerState::TransientlyDisconnected => "transiently disconnected",
            ServerState::Disconnected => "disconnected",
            ServerState::Disconnecting => "disconnecting",
            ServerState::ReconnectWait => "waiting to reconnect",
            ServerState::Closing => "closing",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub from: ServerState,
    pub to: ServerState,
    /// `file:line` of the code that asked for the transition.
    pub caller: String,
    /// Name (or id) of the thread that performed it.
    pub thread: String,
    pub at: DateTime<Utc>,
    /// False for rejected transitions.
    pub accepted: bool,
}

impl fmt::Display for TransitionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}{} (at {} on {})",
            self.at.format("%H:%M:%S%.3f"),
            self.from,
            self.to,
            if self.accepted { "" } else { " [REJECTED]" },
            self.caller,
            self.thread,
        )
    }
}

/// Snapshot of the most recent transitions, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransitionHistory(pub Vec<TransitionRecord>);

impl TransitionHistory {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn last(&self) -> Option<&TransitionRecord> {
        self.0.last()
    }
}

impl fmt::Display for TransitionHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(no transitions)");
        }
        for (i, record) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{record}")?;
        }
        Ok(())
    }
}

/// A transition that is not in the table.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal state transition {from} -> {to}\n\nTransition history:\n{history}")]
pub struct IllegalTransition {
    pub from: ServerState,
    pub to: ServerState,
    pub history: TransitionHistory,
}

struct StatusInner {
    state: ServerState,
    history: VecDeque<TransitionRecord>,
}

/// Current state plus a bounded transition log.
pub struct ServerStatus {
    inner: Mutex<StatusInner>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                state: ServerState::Disconnected,
                history: VecDeque::with_capacity(HISTORY_SIZE),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.lock().state
    }

    /// Move to `to`, or reject the move if the table forbids it.
    ///
    /// Rejected transitions are recorded too, so the returned history always
    /// ends with the offending edge.
    #[track_caller]
    pub fn transition(&self, to: ServerState) -> Result<ServerState, IllegalTransition> {
        let caller = Location::caller();
        let mut inner = self.inner.lock();
        let from = inner.state;
        let accepted = from.can_transition_to(to);

        if inner.history.len() == HISTORY_SIZE {
            inner.history.pop_front();
        }
        inner.history.push_back(TransitionRecord {
            from,
            to,
            caller: format!("{}:{}", caller.file(), caller.line()),
            thread: current_thread_label(),
            at: Utc::now(),
            accepted,
        });

        if !accepted {
            tracing::error!(%from, %to, "illegal state transition");
            return Err(IllegalTransition {
                from,
                to,
                history: TransitionHistory(inner.history.iter().cloned().collect()),
            });
        }

        tracing::debug!(%from, %to, "state transition");
        inner.state = to;
        Ok(from)
    }

    pub fn transition_history(&self) -> TransitionHistory {
        TransitionHistory(self.inner.lock().history.iter().cloned().collect())
    }
}

impl fmt::Debug for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ServerStatus")
            .field("state", &inner.state)
            .field("transitions", &inner.history.len())
            .finish()
    }
}

fn current_thread_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServerState::*;

    const LEGAL: &[(ServerState, ServerState)] = &[
        (Disconnected, Connecting),
        (TransientlyDisconnected, Connecting),
        (ReconnectWait, Connecting),
        (Connecting, Connected),
        (Connecting, TransientlyDisconnected),
        (Connecting, Disconnecting),
        (Connected, Disconnecting),
        (Connected, TransientlyDisconnected),
        (Disconnecting, Disconnected),
        (TransientlyDisconnected, ReconnectWait),
        (ReconnectWait, TransientlyDisconnected),
        (ReconnectWait, Disconnected),
        (Connecting, Closing),
        (Connected, Closing),
        (TransientlyDisconnected, Closing),
        (Disconnected, Closing),
        (Disconnecting, Closing),
        (ReconnectWait, Closing),
    ];

    #[test]
    fn table_matches_exact_edge_set() {
        for from in ServerState::ALL {
            for to in ServerState::ALL {
                let expected = LEGAL.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "edge {from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn closing_is_terminal() {
        for to in ServerState::ALL {
            assert!(!Closing.can_transition_to(to));
        }
    }

    #[test]
    fn starts_disconnected() {
        let status = ServerStatus::new();
        assert_eq!(status.state(), Disconnected);
        assert!(status.transition_history().is_empty());
    }

    #[test]
    fn legal_transition_is_recorded() {
        let status = ServerStatus::new();
        let previous = status.transition(Connecting).unwrap();
        assert_eq!(previous, Disconnected);
        assert_eq!(status.state(), Connecting);

        let history = status.transition_history();
        assert_eq!(history.len(), 1);
        let record = history.last().unwrap();
        assert_eq!((record.from, record.to), (Disconnected, Connecting));
        assert!(record.accepted);
        assert!(record.caller.contains("status.rs"));
    }

    #[test]
    fn illegal_transition_carries_history() {
        let status = ServerStatus::new();
        status.transition(Connecting).unwrap();
        let err = status.transition(ReconnectWait).unwrap_err();
        assert_eq!(err.from, Connecting);
        assert_eq!(err.to, ReconnectWait);
        assert_eq!(err.history.len(), 2);
        assert!(!err.history.last().unwrap().accepted);
        assert_eq!(status.state(), Connecting);
        assert!(err.to_string().contains("REJECTED"));
    }

    #[test]
    fn history_is_bounded() {
        let status = ServerStatus::new();
        for _ in 0..8 {
            status.transition(Connecting).unwrap();
            status.transition(TransientlyDisconnected).unwrap();
        }
        let history = status.transition_history();
        assert_eq!(history.len(), HISTORY_SIZE);
        assert_eq!(history.last().unwrap().to, TransientlyDisconnected);
    }

    #[test]
    fn disconnected_states() {
        assert!(Disconnected.is_disconnected());
        assert!(TransientlyDisconnected.is_disconnected());
        assert!(ReconnectWait.is_disconnected());
        assert!(Closing.is_disconnected());
        assert!(!Connected.is_disconnected());
        assert!(!Connecting.is_disconnected());
        assert!(!Disconnecting.is_disconnected());
    }
}
