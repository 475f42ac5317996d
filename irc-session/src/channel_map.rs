//! Registry of channels keyed by case-normalised name.
//!
//! Keys are normalised with the case mapping in force when they were
//! inserted. Changing the mapping while channels are registered can leave two
//! keys for one logical channel; callers adopt the server's mapping before
//! registering channels for a new connection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::{Channel, PartReason};
use crate::transport::{CaseMapping, JoinRequest};

pub struct ChannelMap {
    mapping: RwLock<CaseMapping>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMap {
    pub fn new() -> Self {
        Self {
            mapping: RwLock::new(CaseMapping::default()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_case_mapping(&self, mapping: CaseMapping) {
        *self.mapping.write() = mapping;
    }

    fn key(&self, name: &str) -> String {
        self.mapping.read().to_lower(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        let key = self.key(name);
        self.channels.read().get(&key).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let key = self.key(name);
        self.channels.read().contains_key(&key)
    }

    /// Register a fully constructed channel.
    pub fn add(&self, channel: Arc<Channel>) {
        let key = self.key(channel.name());
        self.channels.write().insert(key, channel);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Channel>> {
        let key = self.key(name);
        self.channels.write().remove(&key)
    }

    /// Snapshot of every channel.
    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Reset every channel as lost to a disconnect.
    pub fn reset_all(&self) {
        for channel in self.all() {
            channel.reset(PartReason::Disconnected);
        }
    }

    /// Remove and close every channel.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Channel>> = self.channels.write().drain().map(|(_, c)| c).collect();
        for channel in drained {
            channel.close();
        }
    }

    /// Join requests for channels we lost to a disconnect.
    pub fn rejoin_requests(&self) -> Vec<JoinRequest> {
        let mut requests: Vec<JoinRequest> = self
            .all()
            .into_iter()
            .filter(|c| !c.is_on_channel() && c.part_reason() == Some(PartReason::Disconnected))
            .map(|c| JoinRequest::new(c.name()))
            .collect();
        requests.sort_by(|a, b| a.name.cmp(&b.name));
        requests
    }

    /// Run the WHO refresh on every joined channel.
    pub fn check_who(&self) {
        for channel in self.all() {
            if channel.is_on_channel() {
                channel.check_who();
            }
        }
    }
}
