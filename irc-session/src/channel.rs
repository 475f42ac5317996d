//! A joined (or formerly joined) channel.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::core::ConnectionCore;
use crate::event::ChannelEvent;
use crate::group_chat::GroupChatManager;
use crate::split::split_line;
use crate::status::ServerState;
use crate::transport::{JoinRequest, Transport, TransportId};

/// Bytes taken by `\x01ACTION ` and the closing `\x01`.
const ACTION_OVERHEAD: usize = 9;

/// One channel topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topic {
    pub text: String,
    pub setter: String,
    pub time: DateTime<Utc>,
}

/// Why we last left a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartReason {
    /// We parted.
    LocalPart,
    /// The server told us we left.
    RemotePart,
    Kicked,
    /// The connection went away.
    Disconnected,
}

/// A channel member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub nickname: String,
    /// Prefix characters, highest first (`@+`).
    pub modes: String,
}

impl Member {
    pub fn new(nickname: &str, modes: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            modes: modes.to_string(),
        }
    }

    /// Parse a `NAMES` entry such as `@+nick` or `nick!ident@host`.
    pub fn from_names_entry(entry: &str, prefixes: &str) -> Self {
        let split = entry
            .char_indices()
            .find(|(_, c)| !prefixes.contains(*c))
            .map(|(i, _)| i)
            .unwrap_or(entry.len());
        let (modes, rest) = entry.split_at(split);
        let nickname = rest.split(['!', '@']).next().unwrap_or(rest);
        Self::new(nickname, modes)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.modes.chars().next().map(String::from).unwrap_or_default(), self.nickname)
    }
}

struct ChannelState {
    on_channel: bool,
    transport: Option<TransportId>,
    topics: VecDeque<Topic>,
    part_reason: Option<PartReason>,
    /// Keyed by normalised nickname.
    members: HashMap<String, Member>,
    modes: Option<String>,
    list_modes: HashMap<char, Vec<String>>,
}

pub struct Channel {
    name: String,
    core: Weak<ConnectionCore>,
    groups: Weak<GroupChatManager>,
    state: RwLock<ChannelState>,
}

impl Channel {
    pub(crate) fn new(
        core: &Arc<ConnectionCore>,
        groups: Weak<GroupChatManager>,
        name: &str,
        transport: TransportId,
    ) -> Self {
        Self {
            name: name.to_string(),
            core: Arc::downgrade(core),
            groups,
            state: RwLock::new(ChannelState {
                on_channel: true,
                transport: Some(transport),
                topics: VecDeque::new(),
                part_reason: None,
                members: HashMap::new(),
                modes: None,
                list_modes: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_on_channel(&self) -> bool {
        self.state.read().on_channel
    }

    pub fn part_reason(&self) -> Option<PartReason> {
        self.state.read().part_reason
    }

    /// The transport this channel is bound to.
    pub fn transport_id(&self) -> Option<TransportId> {
        self.state.read().transport
    }

    pub(crate) fn is_bound_to(&self, transport: TransportId) -> bool {
        self.state.read().transport == Some(transport)
    }

    /// Topic history, oldest first.
    pub fn topics(&self) -> Vec<Topic> {
        self.state.read().topics.iter().cloned().collect()
    }

    pub fn current_topic(&self) -> Option<Topic> {
        self.state.read().topics.back().cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.state.read().members.values().cloned().collect();
        members.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        members
    }

    pub fn has_member(&self, nickname: &str) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        self.state.read().members.contains_key(&core.normalize(nickname))
    }

    /// Modes last reported by the server.
    pub fn modes(&self) -> Option<String> {
        self.state.read().modes.clone()
    }

    pub fn list_mode(&self, mode: char) -> Vec<String> {
        self.state
            .read()
            .list_modes
            .get(&mode)
            .cloned()
            .unwrap_or_default()
    }

    /// The bound transport, if it is still the active one.
    fn bound_transport(&self) -> Option<(Arc<ConnectionCore>, Arc<dyn Transport>)> {
        let core = self.core.upgrade()?;
        let transport = core.active_transport()?;
        if self.state.read().transport != Some(transport.id()) {
            return None;
        }
        Some((core, transport))
    }

    /// The bound transport, if we are connected and it still has us joined.
    fn live_transport(&self) -> Option<(Arc<ConnectionCore>, Arc<dyn Transport>)> {
        let (core, transport) = self.bound_transport()?;
        if core.state() != ServerState::Connected || !transport.is_on_channel(&self.name) {
            tracing::debug!(channel = %self.name, "Dropping outbound channel command, not joined");
            return None;
        }
        Some((core, transport))
    }

    /// Join again. Goes through the group-chat manager, so the request is
    /// queued until registration completes.
    pub fn join(&self) {
        if self.is_on_channel() {
            return;
        }
        if let Some(groups) = self.groups.upgrade() {
            groups.join(true, &[JoinRequest::new(&self.name)]);
        }
    }

    pub fn part(&self, reason: &str) {
        if let Some((_, transport)) = self.bound_transport() {
            transport.part_channel(&self.name, reason);
        }
        self.reset(PartReason::LocalPart);
    }

    /// Largest message body that fits in one line.
    pub fn max_line_length(&self) -> usize {
        self.bound_transport()
            .map(|(_, t)| t.max_length("PRIVMSG", &self.name))
            .unwrap_or(0)
    }

    pub fn send_line(&self, text: &str) {
        let Some((core, transport)) = self.live_transport() else {
            return;
        };
        let max = transport.max_length("PRIVMSG", &self.name);
        for chunk in split_line(text, max) {
            core.publish_channel(&self.name, ChannelEvent::SelfMessage { text: chunk.clone() });
            transport.send_message(&self.name, &chunk);
        }
    }

    pub fn send_action(&self, text: &str) {
        let Some((core, transport)) = self.live_transport() else {
            return;
        };
        let max = transport
            .max_length("PRIVMSG", &self.name)
            .saturating_sub(ACTION_OVERHEAD);
        for chunk in split_line(text, max) {
            core.publish_channel(&self.name, ChannelEvent::SelfAction { text: chunk.clone() });
            transport.send_action(&self.name, &chunk);
        }
    }

    pub fn set_topic(&self, text: &str) {
        if let Some((_, transport)) = self.live_transport() {
            transport.set_topic(&self.name, text);
        }
    }

    /// Kick `nickname`, using the configured kick message when `reason` is `None`.
    pub fn kick(&self, nickname: &str, reason: Option<&str>) {
        if let Some((core, transport)) = self.live_transport() {
            let reason = reason.unwrap_or(&core.config.kick_message);
            transport.kick(&self.name, nickname, reason);
        }
    }

    pub fn set_mode(&self, mode: char, value: Option<&str>) {
        if let Some((_, transport)) = self.live_transport() {
            transport.alter_mode(&self.name, true, mode, value);
        }
    }

    pub fn remove_mode(&self, mode: char, value: Option<&str>) {
        if let Some((_, transport)) = self.live_transport() {
            transport.alter_mode(&self.name, false, mode, value);
        }
    }

    pub fn request_member_list(&self) {
        if let Some((_, transport)) = self.live_transport() {
            transport.send_raw(&format!("NAMES {}", self.name));
        }
    }

    pub fn retrieve_list_modes(&self) {
        if let Some((_, transport)) = self.live_transport() {
            transport.request_list_modes(&self.name);
        }
    }

    /// Refresh the member list with WHO, if enabled.
    pub(crate) fn check_who(&self) {
        let Some((core, transport)) = self.live_transport() else {
            return;
        };
        if core.config.send_who {
            transport.request_who(&self.name);
        }
    }

    /// Part (when still joined) and announce the channel as closed.
    ///
    /// Removal from the registry is done by the group-chat manager.
    pub(crate) fn close(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if self.is_on_channel() && core.state() != ServerState::Closing {
            self.part(&core.config.part_message);
        }
        core.publish_channel(&self.name, ChannelEvent::Closed);
    }

    /// Mark the channel as left and clear the roster.
    ///
    /// `RosterCleared` is published before returning so consumers see an
    /// empty roster before the transport goes away.
    pub(crate) fn reset(&self, reason: PartReason) {
        {
            let mut state = self.state.write();
            if state.on_channel {
                state.part_reason = Some(reason);
                state.on_channel = false;
            }
            state.members.clear();
        }
        if let Some(core) = self.core.upgrade() {
            core.publish_channel(&self.name, ChannelEvent::RosterCleared);
        }
    }

    /// Bind to a new transport after joining again.
    pub(crate) fn rebind(&self, transport: TransportId) {
        let mut state = self.state.write();
        state.transport = Some(transport);
        state.on_channel = true;
    }

    /// Record a topic unless it repeats what a join already told us.
    /// Returns true if the topic was added.
    pub(crate) fn apply_topic(&self, topic: Topic, discovered: bool) -> bool {
        let limit = self
            .core
            .upgrade()
            .map(|core| core.config.topic_history_size)
            .unwrap_or(10)
            .max(1);
        let mut state = self.state.write();
        let current = state.topics.back();
        let add = !discovered
            || (current.is_none() && !topic.text.is_empty())
            || current.is_some_and(|c| c.text != topic.text);
        if add {
            state.topics.push_back(topic);
            while state.topics.len() > limit {
                state.topics.pop_front();
            }
        }
        add
    }

    pub(crate) fn set_members(&self, members: Vec<Member>, normalize: impl Fn(&str) -> String) -> usize {
        let mut state = self.state.write();
        state.members = members
            .into_iter()
            .map(|m| (normalize(&m.nickname), m))
            .collect();
        state.members.len()
    }

    pub(crate) fn add_member(&self, member: Member, key: String) {
        self.state.write().members.insert(key, member);
    }

    pub(crate) fn remove_member(&self, key: &str) -> bool {
        self.state.write().members.remove(key).is_some()
    }

    pub(crate) fn rename_member(&self, old_key: &str, new_nickname: &str, new_key: String) -> bool {
        let mut state = self.state.write();
        match state.members.remove(old_key) {
            Some(mut member) => {
                member.nickname = new_nickname.to_string();
                state.members.insert(new_key, member);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_modes(&self, modes: &str) {
        self.state.write().modes = Some(modes.to_string());
    }

    pub(crate) fn set_list_mode(&self, mode: char, entries: Vec<String>) {
        self.state.write().list_modes.insert(mode, entries);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("on_channel", &state.on_channel)
            .field("transport", &state.transport)
            .field("members", &state.members.len())
            .field("part_reason", &state.part_reason)
            .finish()
    }
}
