//! One IRC server connection and its lifecycle.
//!
//! # Locking
//!
//! `lifecycle` is the state lock. It is held for the whole of `connect`,
//! `disconnect`, `reconnect`, `close` and the socket-closed, connect-error
//! and registration handlers. Helpers named `*_locked` take the held guard.
//! The transport slot inside [`ConnectionCore`] is only ever locked after
//! `lifecycle`, never before it.
//!
//! Transport callbacks never arrive while `lifecycle` is held by the same
//! thread: they are queued and applied by the [`EventPump`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;

use crate::config::{ConnectionConfig, Profile, ServerAddress};
use crate::core::{ConnectionCore, ctcp_reply};
use crate::dispatch::EventPump;
use crate::error::SessionError;
use crate::event::{ConnectionEvent, EventBus, QueryEvent, ServerId};
use crate::group_chat::GroupChatManager;
use crate::ignore::IgnoreList;
use crate::invite::InviteManager;
use crate::network::network_from_host;
use crate::query::Query;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::split::split_line;
use crate::status::{ServerState, ServerStatus, TransitionHistory};
use crate::transport::{
    ClientInfo, ErrorInfo, EventSink, Transport, TransportContext, TransportEvent, TransportId,
    TransportRegistry,
};

/// Guarded by the state lock.
#[derive(Default)]
pub(crate) struct Lifecycle {
    reconnect_timer: Option<ScheduledTask>,
}

/// Where we connect to and as whom. Written under the state lock.
#[derive(Clone)]
struct Target {
    address: ServerAddress,
    profile: Profile,
}

pub struct Server {
    pub(crate) core: Arc<ConnectionCore>,
    lifecycle: Mutex<Lifecycle>,
    state_changed: Condvar,
    target: RwLock<Option<Target>>,
    registry: TransportRegistry,
    event_tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    pub(crate) groups: Arc<GroupChatManager>,
    pub(crate) invites: Arc<InviteManager>,
    queries: RwLock<HashMap<String, Arc<Query>>>,
    pub(crate) weak_self: Weak<Server>,
}

impl Server {
    /// Build a connection. The returned pump must be run (or drained) for
    /// transport events to be applied.
    pub fn new(
        config: Arc<ConnectionConfig>,
        registry: TransportRegistry,
        scheduler: Scheduler,
    ) -> (Arc<Server>, EventPump) {
        Self::with_event_bus(config, registry, scheduler, Arc::new(EventBus::new()))
    }

    /// Like [`Server::new`], publishing onto a shared bus.
    pub fn with_event_bus(
        config: Arc<ConnectionConfig>,
        registry: TransportRegistry,
        scheduler: Scheduler,
        events: Arc<EventBus>,
    ) -> (Arc<Server>, EventPump) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ConnectionCore::new(events, config, scheduler));
        let invites = Arc::new(InviteManager::new(core.clone()));
        let groups = Arc::new(GroupChatManager::new(core.clone(), invites.clone()));

        let server = Arc::new_cyclic(|weak_self| Server {
            core,
            lifecycle: Mutex::new(Lifecycle::default()),
            state_changed: Condvar::new(),
            target: RwLock::new(None),
            registry,
            event_tx,
            groups,
            invites,
            queries: RwLock::new(HashMap::new()),
            weak_self: weak_self.clone(),
        });
        let pump = EventPump::new(event_rx, Arc::downgrade(&server));
        (server, pump)
    }

    pub fn id(&self) -> ServerId {
        self.core.id
    }

    pub fn state(&self) -> ServerState {
        self.core.state()
    }

    pub fn status(&self) -> &ServerStatus {
        &self.core.status
    }

    pub fn transition_history(&self) -> TransitionHistory {
        self.core.status.transition_history()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.core.events
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.core.config
    }

    pub fn group_chat_manager(&self) -> &Arc<GroupChatManager> {
        &self.groups
    }

    pub fn invite_manager(&self) -> &Arc<InviteManager> {
        &self.invites
    }

    pub fn address(&self) -> Option<ServerAddress> {
        self.target.read().as_ref().map(|t| t.address.clone())
    }

    pub fn profile(&self) -> Option<Profile> {
        self.target.read().as_ref().map(|t| t.profile.clone())
    }

    /// Id of the transport events are currently accepted from.
    pub fn transport_id(&self) -> Option<TransportId> {
        self.core.active_id()
    }

    /// Move to `to` and wake anyone waiting on the state.
    #[track_caller]
    fn transition(
        &self,
        _guard: &MutexGuard<'_, Lifecycle>,
        to: ServerState,
    ) -> Result<ServerState, SessionError> {
        let from = self.core.status.transition(to)?;
        self.state_changed.notify_all();
        Ok(from)
    }

    fn unexpected_state(&self, operation: &'static str, expected: ServerState) -> SessionError {
        SessionError::UnexpectedState {
            operation,
            expected,
            actual: self.core.state(),
            history: self.core.status.transition_history(),
        }
    }

    fn cancel_reconnect_timer(&self, guard: &mut MutexGuard<'_, Lifecycle>) {
        if let Some(timer) = guard.reconnect_timer.take() {
            tracing::debug!(server = %self.core.id, "Cancelling reconnect timer");
            timer.cancel();
        }
    }

    /// Start a new connection attempt, replacing any current one.
    pub fn connect(&self, address: ServerAddress, profile: Profile) -> Result<(), SessionError> {
        let mut guard = self.lifecycle.lock();
        self.connect_locked(&mut guard, address, profile)
    }

    /// Connect again to the last address, as the last profile.
    pub fn connect_default(&self) -> Result<(), SessionError> {
        let mut guard = self.lifecycle.lock();
        let Some(target) = self.target.read().clone() else {
            tracing::warn!(server = %self.core.id, "No previous address to connect to");
            return Ok(());
        };
        self.connect_locked(&mut guard, target.address, target.profile)
    }

    fn connect_locked(
        &self,
        guard: &mut MutexGuard<'_, Lifecycle>,
        address: ServerAddress,
        profile: Profile,
    ) -> Result<(), SessionError> {
        let state = self.core.state();
        tracing::info!(server = %self.core.id, ?state, %address, "Connecting");
        match state {
            ServerState::Closing => return Ok(()),
            ServerState::ReconnectWait => self.cancel_reconnect_timer(guard),
            ServerState::Connected | ServerState::Connecting => {
                self.disconnect_locked(guard, &self.core.config.quit_message)?;
            }
            _ => {}
        }

        self.wait_for_disconnect(guard)?;
        let state = self.core.state();
        if state == ServerState::Closing {
            return Ok(());
        }
        if self.core.has_transport() {
            return Err(SessionError::TransportStillActive { state });
        }

        *self.target.write() = Some(Target {
            address: address.clone(),
            profile: profile.clone(),
        });

        let Some(factory) = self.registry.get(address.scheme()) else {
            tracing::warn!(server = %self.core.id, scheme = address.scheme(), "No transport for scheme");
            self.core.publish_connection(ConnectionEvent::UnknownProtocol {
                scheme: address.scheme().to_string(),
            });
            return Ok(());
        };

        let id = TransportId::next();
        let transport = factory.create(TransportContext {
            id,
            sink: EventSink::new(id, self.event_tx.clone()),
            address: address.clone(),
            profile,
            config: self.core.config.clone(),
        });

        self.transition(guard, ServerState::Connecting)?;
        self.core.install_transport(transport.clone());
        self.update_away_state(None);
        self.invites.remove_invites();
        transport.connect();

        self.core.publish_connection(ConnectionEvent::Connecting {
            address: address.to_string(),
        });
        Ok(())
    }

    /// Block until a pending disconnect finishes, for at most
    /// `disconnect_wait_ms`. On timeout the transport is retired as if its
    /// socket had closed.
    fn wait_for_disconnect(&self, guard: &mut MutexGuard<'_, Lifecycle>) -> Result<(), SessionError> {
        if self.core.state() != ServerState::Disconnecting {
            return Ok(());
        }
        tracing::debug!(server = %self.core.id, "Waiting for transport to close");
        let deadline = Instant::now() + self.core.config.disconnect_wait();
        while self.core.state() == ServerState::Disconnecting {
            if self.state_changed.wait_until(guard, deadline).timed_out() {
                if self.core.state() == ServerState::Disconnecting {
                    tracing::warn!(server = %self.core.id, "Transport did not close in time, retiring it");
                    self.socket_closed_locked(guard)?;
                }
                break;
            }
        }
        Ok(())
    }

    /// Disconnect from the server. Does nothing if already disconnected.
    pub fn disconnect(&self, reason: &str) -> Result<(), SessionError> {
        let mut guard = self.lifecycle.lock();
        self.disconnect_locked(&mut guard, reason)
    }

    fn disconnect_locked(
        &self,
        guard: &mut MutexGuard<'_, Lifecycle>,
        reason: &str,
    ) -> Result<(), SessionError> {
        let state = self.core.state();
        tracing::info!(server = %self.core.id, ?state, "Disconnecting");
        if matches!(
            state,
            ServerState::Closing
                | ServerState::Disconnecting
                | ServerState::Disconnected
                | ServerState::TransientlyDisconnected
        ) {
            return Ok(());
        }

        self.cancel_reconnect_timer(guard);
        self.groups.handle_disconnect();

        match self.core.active_transport() {
            Some(transport) => {
                self.transition(guard, ServerState::Disconnecting)?;
                self.invites.remove_invites();
                transport.disconnect(reason);
            }
            None => {
                self.transition(guard, ServerState::Disconnected)?;
            }
        }

        if self.core.config.close_queries_on_quit {
            self.close_queries();
        }
        Ok(())
    }

    /// Disconnect, then connect to the last address, as one operation.
    pub fn reconnect(&self, reason: &str) -> Result<(), SessionError> {
        let mut guard = self.lifecycle.lock();
        self.reconnect_locked(&mut guard, reason)
    }

    fn reconnect_locked(
        &self,
        guard: &mut MutexGuard<'_, Lifecycle>,
        reason: &str,
    ) -> Result<(), SessionError> {
        if self.core.state() == ServerState::Closing {
            return Ok(());
        }
        self.disconnect_locked(guard, reason)?;
        let Some(target) = self.target.read().clone() else {
            tracing::warn!(server = %self.core.id, "No previous address to reconnect to");
            return Ok(());
        };
        self.connect_locked(guard, target.address, target.profile)
    }

    /// Tear the connection down for good.
    pub fn close(&self) -> Result<(), SessionError> {
        let mut guard = self.lifecycle.lock();
        if self.core.state() == ServerState::Closing {
            return Ok(());
        }
        tracing::info!(server = %self.core.id, "Closing");
        self.cancel_reconnect_timer(&mut guard);
        self.groups.stop();
        self.disconnect_locked(&mut guard, &self.core.config.quit_message)?;
        self.transition(&guard, ServerState::Closing)?;
        self.core.retire_transport();
        self.groups.close_all();
        self.close_queries();
        self.invites.remove_invites();
        Ok(())
    }

    /// The active transport's socket closed.
    pub(crate) fn on_socket_closed(&self, origin: TransportId) -> Result<(), SessionError> {
        let mut guard = self.lifecycle.lock();
        if self.core.active_id() != Some(origin) {
            tracing::debug!(server = %self.core.id, transport = %origin, "Socket closed for retired transport");
            return Ok(());
        }
        self.socket_closed_locked(&mut guard)
    }

    fn socket_closed_locked(&self, guard: &mut MutexGuard<'_, Lifecycle>) -> Result<(), SessionError> {
        let state = self.core.state();
        tracing::info!(server = %self.core.id, ?state, "Socket closed");
        self.core.publish_connection(ConnectionEvent::Disconnected);
        if matches!(state, ServerState::Closing | ServerState::Disconnected) {
            return Ok(());
        }

        let next = if state == ServerState::Disconnecting {
            ServerState::Disconnected
        } else {
            ServerState::TransientlyDisconnected
        };
        self.transition(guard, next)?;

        self.groups.handle_socket_closed();
        self.core.retire_transport();
        if self.core.config.close_queries_on_disconnect {
            self.close_queries();
        }
        self.invites.remove_invites();
        self.update_away_state(None);

        if self.core.config.reconnect_on_disconnect && next == ServerState::TransientlyDisconnected {
            self.schedule_reconnect(guard)?;
        }
        Ok(())
    }

    /// The active transport failed to connect.
    pub(crate) fn on_connect_error(&self, origin: TransportId, error: ErrorInfo) -> Result<(), SessionError> {
        let mut guard = self.lifecycle.lock();
        if self.core.active_id() != Some(origin) {
            return Ok(());
        }
        let state = self.core.state();
        tracing::info!(server = %self.core.id, ?state, "Connect error");
        match state {
            ServerState::Closing | ServerState::Disconnecting => return Ok(()),
            ServerState::Connecting => {}
            _ => return Err(self.unexpected_state("on_connect_error", ServerState::Connecting)),
        }

        self.transition(&guard, ServerState::TransientlyDisconnected)?;
        self.core.retire_transport();

        let description = error.description();
        tracing::warn!(server = %self.core.id, %description, "Failed to connect");
        self.core
            .publish_connection(ConnectionEvent::ConnectError { description });

        if self.core.config.reconnect_on_connect_failure {
            self.schedule_reconnect(&mut guard)?;
        }
        Ok(())
    }

    /// Registration finished on the active transport.
    pub(crate) fn on_registration_complete(&self, origin: TransportId) -> Result<(), SessionError> {
        let guard = self.lifecycle.lock();
        let Some(transport) = self.core.active_transport().filter(|t| t.id() == origin) else {
            return Ok(());
        };
        let state = self.core.state();
        tracing::info!(server = %self.core.id, ?state, "Registration complete");
        if state != ServerState::Connecting {
            return Err(self.unexpected_state("on_registration_complete", ServerState::Connecting));
        }

        self.transition(&guard, ServerState::Connected)?;
        self.core.set_case_mapping(transport.case_mapping());
        self.refresh_ignore_list();
        self.groups.handle_connected();
        let network = self.network_of(transport.as_ref());
        drop(guard);

        self.core
            .publish_connection(ConnectionEvent::Connected { network });
        Ok(())
    }

    /// Schedule a reconnect after the configured delay.
    fn schedule_reconnect(&self, guard: &mut MutexGuard<'_, Lifecycle>) -> Result<(), SessionError> {
        if self.core.state() != ServerState::TransientlyDisconnected {
            return Err(self.unexpected_state(
                "schedule_reconnect",
                ServerState::TransientlyDisconnected,
            ));
        }
        let delay = self.core.config.reconnect_delay();
        tracing::info!(server = %self.core.id, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.core.publish_connection(ConnectionEvent::ReconnectScheduled {
            delay_ms: delay.as_millis() as u64,
        });

        let weak = self.weak_self.clone();
        let timer = self.core.scheduler.schedule(delay, move || {
            if let Some(server) = weak.upgrade() {
                server.reconnect_timer_fired();
            }
        });
        self.cancel_reconnect_timer(guard);
        guard.reconnect_timer = Some(timer);
        self.transition(guard, ServerState::ReconnectWait)?;
        Ok(())
    }

    fn reconnect_timer_fired(&self) {
        let mut guard = self.lifecycle.lock();
        guard.reconnect_timer = None;
        let state = self.core.state();
        if state != ServerState::ReconnectWait {
            tracing::debug!(server = %self.core.id, ?state, "Reconnect timer fired late, ignoring");
            return;
        }
        let result = self
            .transition(&guard, ServerState::TransientlyDisconnected)
            .and_then(|_| {
                let reason = self.core.config.reconnect_message.clone();
                self.reconnect_locked(&mut guard, &reason)
            });
        if let Err(err) = result {
            self.report_internal_error(&err);
        }
    }

    /// Log and publish a broken invariant.
    pub(crate) fn report_internal_error(&self, err: &SessionError) {
        tracing::error!(server = %self.core.id, error = %err, "Internal error");
        let history = err
            .history()
            .cloned()
            .unwrap_or_else(|| self.core.status.transition_history());
        self.core.publish_connection(ConnectionEvent::InternalError {
            message: err.to_string(),
            history,
        });
    }

    fn refresh_ignore_list(&self) {
        match IgnoreList::from_patterns(&self.core.config.ignore_list) {
            Ok(list) => self.core.set_ignore_list(list),
            Err(e) => tracing::warn!(server = %self.core.id, error = %e, "Bad ignore list"),
        }
    }

    pub fn ignore_list(&self) -> IgnoreList {
        self.core.ignore_list()
    }

    pub fn set_ignore_list(&self, list: IgnoreList) {
        self.core.set_ignore_list(list);
    }

    fn network_of(&self, transport: &dyn Transport) -> String {
        if let Some(network) = transport.network_name().filter(|n| !n.is_empty()) {
            return network;
        }
        let host = transport
            .server_name()
            .or_else(|| self.address().map(|a| a.host().to_string()))
            .unwrap_or_default();
        network_from_host(&host)
    }

    /// Network name, as announced or guessed from the host name.
    pub fn network(&self) -> Result<String, SessionError> {
        let transport = self
            .core
            .active_transport()
            .ok_or(SessionError::NoTransport {
                operation: "network",
                state: self.core.state(),
            })?;
        Ok(self.network_of(transport.as_ref()))
    }

    pub fn is_network(&self, name: &str) -> bool {
        self.network()
            .map(|n| n.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }

    pub fn protocol(&self) -> Option<String> {
        self.core.active_transport().map(|t| t.protocol().to_string())
    }

    pub fn local_nickname(&self) -> Option<String> {
        self.core.active_transport().map(|t| t.local_nickname())
    }

    pub fn set_nickname(&self, nickname: &str) {
        if let Some(transport) = self.core.active_transport() {
            transport.set_nickname(nickname);
        }
    }

    fn connected_transport(&self) -> Option<Arc<dyn Transport>> {
        if self.core.state() != ServerState::Connected {
            return None;
        }
        self.core.active_transport()
    }

    /// Send a raw protocol line. Dropped unless connected.
    pub fn send_line(&self, line: &str) {
        if let Some(transport) = self.connected_transport() {
            transport.send_raw(line);
        }
    }

    /// Send `text` to `target`, split to fit.
    pub fn send_message(&self, target: &str, text: &str) {
        let Some(transport) = self.connected_transport() else {
            return;
        };
        for chunk in split_line(text, transport.max_length("PRIVMSG", target)) {
            transport.send_message(target, &chunk);
        }
    }

    pub fn max_line_length(&self) -> usize {
        self.core
            .active_transport()
            .map(|t| t.max_length("PRIVMSG", ""))
            .unwrap_or(0)
    }

    /// Answer a CTCP request from `source`. Returns false for unknown kinds.
    pub fn send_ctcp_reply(&self, source: &str, kind: &str, args: &str) -> bool {
        let Some(transport) = self.core.active_transport() else {
            return false;
        };
        match ctcp_reply(&self.core.config, kind, args) {
            Some(reply) => {
                transport.send_ctcp_reply(source, &kind.to_ascii_uppercase(), &reply);
                true
            }
            None => false,
        }
    }

    pub fn request_user_info(&self, nickname: &str) {
        if let Some(transport) = self.connected_transport() {
            transport.send_whois(nickname);
        }
    }

    /// Record our away state as reported by the server.
    pub fn update_away_state(&self, message: Option<String>) {
        if self.core.set_away_message(message.clone()) {
            self.core
                .publish_connection(ConnectionEvent::AwayChanged { message });
        }
    }

    pub fn away_message(&self) -> Option<String> {
        self.core.away_message()
    }

    pub fn is_away(&self) -> bool {
        self.core.away_message().is_some()
    }

    /// The query with `host` (`nick!ident@host` or a bare nickname),
    /// opened if needed. `None` while closing.
    pub fn get_query(&self, host: &str) -> Option<Arc<Query>> {
        if self.core.state() == ServerState::Closing {
            return None;
        }
        let user = ClientInfo::parse(host);
        let key = self.core.normalize(&user.nickname);
        if let Some(query) = self.queries.read().get(&key) {
            query.update_user(&user);
            return Some(query.clone());
        }

        let (query, created) = {
            let mut queries = self.queries.write();
            match queries.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let query = Arc::new(Query::new(&self.core, user.clone()));
                    queries.insert(key, query.clone());
                    (query, true)
                }
            }
        };
        if created {
            tracing::debug!(server = %self.core.id, nickname = %user.nickname, "Opened query");
            self.core.publish_query(&user.nickname, QueryEvent::Opened);
        }
        Some(query)
    }

    pub fn has_query(&self, host: &str) -> bool {
        let key = self.core.normalize(&ClientInfo::parse(host).nickname);
        self.queries.read().contains_key(&key)
    }

    pub(crate) fn existing_query(&self, nickname: &str) -> Option<Arc<Query>> {
        self.queries.read().get(&self.core.normalize(nickname)).cloned()
    }

    pub fn queries(&self) -> Vec<Arc<Query>> {
        self.queries.read().values().cloned().collect()
    }

    pub fn close_query(&self, nickname: &str) {
        let removed = self.queries.write().remove(&self.core.normalize(nickname));
        if let Some(query) = removed {
            query.close();
        }
    }

    fn close_queries(&self) {
        let removed: Vec<Arc<Query>> = self.queries.write().drain().map(|(_, q)| q).collect();
        for query in removed {
            query.close();
        }
    }

    /// Re-key a query after a nickname change.
    pub(crate) fn rename_query(&self, old: &str, new: &str) -> bool {
        let moved = {
            let mut queries = self.queries.write();
            match queries.remove(&self.core.normalize(old)) {
                Some(query) => {
                    query.rename(new);
                    queries.insert(self.core.normalize(new), query);
                    true
                }
                None => false,
            }
        };
        if moved {
            self.core.publish_query(
                new,
                QueryEvent::NickChange {
                    old: old.to_string(),
                    new: new.to_string(),
                },
            );
        }
        moved
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.groups.stop();
        if let Some(timer) = self.lifecycle.get_mut().reconnect_timer.take() {
            timer.cancel();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .field("transport", &self.core.active_id())
            .finish()
    }
}
