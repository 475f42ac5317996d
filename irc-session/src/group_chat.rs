//! Join bookkeeping across a connection's channels.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::channel_map::ChannelMap;
use crate::core::ConnectionCore;
use crate::event::ChannelEvent;
use crate::invite::InviteManager;
use crate::scheduler::ScheduledTask;
use crate::status::ServerState;
use crate::transport::{JoinRequest, Transport, TransportId};

/// Channel prefixes assumed when no transport is available.
pub const DEFAULT_CHANNEL_PREFIXES: &str = "#&";

pub struct GroupChatManager {
    core: Arc<ConnectionCore>,
    invites: Arc<InviteManager>,
    channels: ChannelMap,
    /// Normalised names of channels joined without focus.
    background: Mutex<HashSet<String>>,
    /// Joins requested before registration finished.
    pending_joins: Mutex<Vec<JoinRequest>>,
    who_timer: Mutex<Option<ScheduledTask>>,
}

impl GroupChatManager {
    pub(crate) fn new(core: Arc<ConnectionCore>, invites: Arc<InviteManager>) -> Self {
        Self {
            core,
            invites,
            channels: ChannelMap::new(),
            background: Mutex::new(HashSet::new()),
            pending_joins: Mutex::new(Vec::new()),
            who_timer: Mutex::new(None),
        }
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name)
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.all()
    }

    pub fn channel_prefixes(&self) -> String {
        self.core
            .active_transport()
            .map(|t| t.channel_prefixes())
            .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIXES.to_string())
    }

    /// Known channel, or a name the transport accepts as a channel.
    pub fn is_valid_channel_name(&self, name: &str) -> bool {
        self.channels.contains(name)
            || self
                .core
                .active_transport()
                .is_some_and(|t| t.is_valid_channel_name(name))
    }

    /// Joins waiting for registration to finish.
    pub fn queued_joins(&self) -> Vec<JoinRequest> {
        self.pending_joins.lock().clone()
    }

    pub fn is_background_join(&self, name: &str) -> bool {
        self.background.lock().contains(&self.core.normalize(name))
    }

    fn normalize_name(&self, name: &str, transport: Option<&dyn Transport>) -> String {
        let (valid, prefixes) = match transport {
            Some(t) => (t.is_valid_channel_name(name), t.channel_prefixes()),
            None => (
                name.starts_with(|c: char| DEFAULT_CHANNEL_PREFIXES.contains(c)),
                DEFAULT_CHANNEL_PREFIXES.to_string(),
            ),
        };
        if valid {
            return name.to_string();
        }
        match prefixes.chars().next() {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        }
    }

    /// Join channels. With `focus` false the joins happen in the background.
    ///
    /// Before registration the requests are queued and sent by
    /// [`GroupChatManager::handle_connected`].
    pub fn join(&self, focus: bool, requests: &[JoinRequest]) {
        let transport = self.core.active_transport();
        let mut pending: Vec<JoinRequest> = Vec::new();
        for request in requests {
            self.invites.remove_invites_for(&request.name);
            let name = self.normalize_name(&request.name, transport.as_deref());
            if self.channel(&name).is_some_and(|c| c.is_on_channel()) {
                continue;
            }
            let key = self.core.normalize(&name);
            if pending.iter().any(|p| self.core.normalize(&p.name) == key) {
                continue;
            }
            if !focus {
                self.background.lock().insert(key);
            }
            pending.push(JoinRequest {
                name,
                key: request.key.clone(),
            });
        }
        if pending.is_empty() {
            return;
        }

        // Deciding between send and queue happens under the queue lock, which
        // `handle_connected` also takes after the transition to Connected.
        let mut queued = self.pending_joins.lock();
        match self.core.active_transport() {
            Some(transport) if self.core.state() == ServerState::Connected => {
                drop(queued);
                tracing::debug!(server = %self.core.id, count = pending.len(), "Joining channels");
                transport.join_channels(&pending);
            }
            _ => {
                tracing::debug!(
                    server = %self.core.id,
                    count = pending.len(),
                    "Not connected, queueing joins"
                );
                for request in pending {
                    let key = self.core.normalize(&request.name);
                    if !queued.iter().any(|q| self.core.normalize(&q.name) == key) {
                        queued.push(request);
                    }
                }
            }
        }
    }

    /// Register (or rebind) a channel we just joined.
    pub(crate) fn add_channel(self: &Arc<Self>, name: &str, origin: TransportId) -> Option<Arc<Channel>> {
        if self.core.state() == ServerState::Closing {
            return None;
        }
        let background = self.background.lock().remove(&self.core.normalize(name));
        let focus = !background || self.core.config.hide_channels;

        let channel = match self.channels.get(name) {
            Some(existing) => {
                existing.rebind(origin);
                existing
            }
            None => {
                let channel = Arc::new(Channel::new(&self.core, Arc::downgrade(self), name, origin));
                self.channels.add(channel.clone());
                channel
            }
        };
        tracing::info!(server = %self.core.id, channel = %channel.name(), focus, "Joined channel");
        self.core
            .publish_channel(channel.name(), ChannelEvent::SelfJoin { focus });
        self.invites.remove_invites_for(name);
        Some(channel)
    }

    fn cancel_who_timer(&self) {
        if let Some(timer) = self.who_timer.lock().take() {
            tracing::debug!(server = %self.core.id, "Cancelling who timer");
            timer.cancel();
        }
    }

    /// Forget background marks, except for joins still waiting in the queue.
    fn clear_background(&self) {
        let queued = self.pending_joins.lock();
        let keep: HashSet<String> = queued.iter().map(|q| self.core.normalize(&q.name)).collect();
        self.background.lock().retain(|key| keep.contains(key));
    }

    /// We asked to disconnect.
    pub(crate) fn handle_disconnect(&self) {
        self.channels.reset_all();
        self.clear_background();
        self.cancel_who_timer();
        if self.core.config.close_channels_on_quit {
            self.close_all();
        }
    }

    /// The socket closed.
    pub(crate) fn handle_socket_closed(&self) {
        self.cancel_who_timer();
        self.channels.reset_all();
        self.clear_background();
        if self.core.config.close_channels_on_disconnect {
            self.close_all();
        }
    }

    /// Registration finished: rejoin, flush queued joins, start the who timer.
    pub(crate) fn handle_connected(self: &Arc<Self>) {
        self.channels.set_case_mapping(self.core.case_mapping());

        let mut requests: Vec<JoinRequest> = std::mem::take(&mut *self.pending_joins.lock());
        if self.core.config.rejoin_channels {
            requests.extend(self.channels.rejoin_requests());
        }
        if !requests.is_empty() {
            self.join(true, &requests);
        }

        self.cancel_who_timer();
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = self
            .core
            .scheduler
            .schedule_repeating(self.core.config.who_interval(), move || {
                if let Some(manager) = weak.upgrade() {
                    manager.channels.check_who();
                }
            });
        *self.who_timer.lock() = Some(timer);
    }

    pub fn close_channel(&self, name: &str) {
        if let Some(channel) = self.channels.remove(name) {
            channel.close();
        }
    }

    pub fn close_all(&self) {
        self.pending_joins.lock().clear();
        self.channels.close_all();
    }

    pub(crate) fn stop(&self) {
        self.cancel_who_timer();
    }
}
