//! Private one-to-one conversations.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::core::ConnectionCore;
use crate::event::QueryEvent;
use crate::split::split_line;
use crate::status::ServerState;
use crate::transport::{ClientInfo, Transport};

const ACTION_OVERHEAD: usize = 9;

pub struct Query {
    core: Weak<ConnectionCore>,
    user: RwLock<ClientInfo>,
}

impl Query {
    pub(crate) fn new(core: &Arc<ConnectionCore>, user: ClientInfo) -> Self {
        Self {
            core: Arc::downgrade(core),
            user: RwLock::new(user),
        }
    }

    pub fn nickname(&self) -> String {
        self.user.read().nickname.clone()
    }

    /// `nick!ident@host` as last seen.
    pub fn host(&self) -> String {
        self.user.read().to_string()
    }

    fn transport(&self) -> Option<(Arc<ConnectionCore>, Arc<dyn Transport>)> {
        let core = self.core.upgrade()?;
        if core.state() != ServerState::Connected {
            return None;
        }
        let transport = core.active_transport()?;
        Some((core, transport))
    }

    pub fn max_line_length(&self) -> usize {
        self.transport()
            .map(|(_, t)| t.max_length("PRIVMSG", &self.nickname()))
            .unwrap_or(0)
    }

    pub fn send_line(&self, text: &str) {
        let Some((core, transport)) = self.transport() else {
            return;
        };
        let nickname = self.nickname();
        let max = transport.max_length("PRIVMSG", &nickname);
        for chunk in split_line(text, max) {
            core.publish_query(&nickname, QueryEvent::SelfMessage { text: chunk.clone() });
            transport.send_message(&nickname, &chunk);
        }
    }

    pub fn send_action(&self, text: &str) {
        let Some((core, transport)) = self.transport() else {
            return;
        };
        let nickname = self.nickname();
        let max = transport
            .max_length("PRIVMSG", &nickname)
            .saturating_sub(ACTION_OVERHEAD);
        for chunk in split_line(text, max) {
            core.publish_query(&nickname, QueryEvent::SelfAction { text: chunk.clone() });
            transport.send_action(&nickname, &chunk);
        }
    }

    /// Refresh ident and host from a newer sighting.
    pub(crate) fn update_user(&self, user: &ClientInfo) {
        let mut current = self.user.write();
        if user.ident.is_some() {
            current.ident = user.ident.clone();
        }
        if user.host.is_some() {
            current.host = user.host.clone();
        }
    }

    pub(crate) fn rename(&self, nickname: &str) -> String {
        let mut user = self.user.write();
        std::mem::replace(&mut user.nickname, nickname.to_string())
    }

    /// Announce the query as closed. Removal is done by the server.
    pub(crate) fn close(&self) {
        if let Some(core) = self.core.upgrade() {
            core.publish_query(&self.nickname(), QueryEvent::Closed);
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").field("user", &*self.user.read()).finish()
    }
}
