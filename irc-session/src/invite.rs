//! Outstanding channel invitations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::ConnectionCore;
use crate::event::ConnectionEvent;
use crate::group_chat::GroupChatManager;
use crate::transport::{ClientInfo, JoinRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invite {
    pub channel: String,
    /// `nick!ident@host` of the inviting user.
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Invite {
    pub fn new(channel: &str, source: &ClientInfo) -> Self {
        Self {
            channel: channel.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// At most one outstanding invite per channel.
pub struct InviteManager {
    core: Arc<ConnectionCore>,
    invites: Mutex<Vec<Invite>>,
}

impl InviteManager {
    pub(crate) fn new(core: Arc<ConnectionCore>) -> Self {
        Self {
            core,
            invites: Mutex::new(Vec::new()),
        }
    }

    pub fn invites(&self) -> Vec<Invite> {
        self.invites.lock().clone()
    }

    /// Add `invite`, expiring any earlier invite to the same channel.
    pub fn add_invite(&self, invite: Invite) {
        self.remove_invites_for(&invite.channel);
        tracing::debug!(server = %self.core.id, channel = %invite.channel, "Invite received");
        self.invites.lock().push(invite.clone());
        self.core.publish_connection(ConnectionEvent::InviteReceived {
            channel: invite.channel,
            source: invite.source,
        });
    }

    /// Join the channels of `invites` in one batch.
    pub fn accept_invites(&self, groups: &GroupChatManager, invites: &[Invite]) {
        let requests: Vec<JoinRequest> = invites
            .iter()
            .map(|invite| JoinRequest::new(&invite.channel))
            .collect();
        groups.join(true, &requests);
    }

    pub fn accept_all(&self, groups: &GroupChatManager) {
        let invites = self.invites();
        self.accept_invites(groups, &invites);
    }

    /// Expire every invite.
    pub fn remove_invites(&self) {
        let removed: Vec<Invite> = std::mem::take(&mut *self.invites.lock());
        for invite in removed {
            self.expired(invite);
        }
    }

    /// Expire invites to `channel`.
    pub fn remove_invites_for(&self, channel: &str) {
        let mapping = self.core.case_mapping();
        let removed: Vec<Invite> = {
            let mut invites = self.invites.lock();
            let (removed, kept) = std::mem::take(&mut *invites)
                .into_iter()
                .partition(|i| mapping.equals(&i.channel, channel));
            *invites = kept;
            removed
        };
        for invite in removed {
            self.expired(invite);
        }
    }

    /// Decline one invite.
    pub fn remove_invite(&self, invite: &Invite) {
        let removed = {
            let mut invites = self.invites.lock();
            let before = invites.len();
            invites.retain(|i| i != invite);
            invites.len() != before
        };
        if removed {
            self.expired(invite.clone());
        }
    }

    fn expired(&self, invite: Invite) {
        self.core.publish_connection(ConnectionEvent::InviteExpired {
            channel: invite.channel,
            source: invite.source,
        });
    }
}
