//! State shared between a connection and its conversations.
//!
//! Lock order: the server's state lock (when held) is always taken before
//! `transport`. Nothing in here ever takes the state lock.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::ConnectionConfig;
use crate::event::{ChannelEvent, ConnectionEvent, Event, EventBus, QueryEvent, ServerId};
use crate::ignore::IgnoreList;
use crate::scheduler::Scheduler;
use crate::status::{ServerState, ServerStatus};
use crate::transport::{CaseMapping, ClientInfo, Transport, TransportId};

/// Active transport plus the one it replaced.
#[derive(Default)]
pub(crate) struct TransportSlot {
    pub(crate) active: Option<Arc<dyn Transport>>,
    pub(crate) previous: Option<Arc<dyn Transport>>,
}

pub(crate) struct ConnectionCore {
    pub(crate) id: ServerId,
    pub(crate) status: ServerStatus,
    transport: RwLock<TransportSlot>,
    case_mapping: RwLock<CaseMapping>,
    ignore: RwLock<IgnoreList>,
    away: Mutex<Option<String>>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) config: Arc<ConnectionConfig>,
    pub(crate) scheduler: Scheduler,
}

impl ConnectionCore {
    pub(crate) fn new(
        events: Arc<EventBus>,
        config: Arc<ConnectionConfig>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            id: ServerId::next(),
            status: ServerStatus::new(),
            transport: RwLock::new(TransportSlot::default()),
            case_mapping: RwLock::new(CaseMapping::default()),
            ignore: RwLock::new(IgnoreList::new()),
            away: Mutex::new(None),
            events,
            config,
            scheduler,
        }
    }

    pub(crate) fn state(&self) -> ServerState {
        self.status.state()
    }

    pub(crate) fn active_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().active.clone()
    }

    pub(crate) fn active_id(&self) -> Option<TransportId> {
        self.transport.read().active.as_ref().map(|t| t.id())
    }

    /// The retired transport, if `id` names it.
    pub(crate) fn previous_transport(&self, id: TransportId) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .previous
            .as_ref()
            .filter(|t| t.id() == id)
            .cloned()
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.transport.read().active.is_some()
    }

    pub(crate) fn install_transport(&self, transport: Arc<dyn Transport>) {
        self.transport.write().active = Some(transport);
    }

    /// Move the active transport to `previous`.
    pub(crate) fn retire_transport(&self) -> Option<Arc<dyn Transport>> {
        let mut slot = self.transport.write();
        let retired = slot.active.take();
        if let Some(transport) = &retired {
            tracing::debug!(server = %self.id, transport = %transport.id(), "Retiring transport");
            slot.previous = Some(transport.clone());
        }
        retired
    }

    pub(crate) fn case_mapping(&self) -> CaseMapping {
        *self.case_mapping.read()
    }

    pub(crate) fn set_case_mapping(&self, mapping: CaseMapping) {
        *self.case_mapping.write() = mapping;
    }

    pub(crate) fn normalize(&self, name: &str) -> String {
        self.case_mapping().to_lower(name)
    }

    pub(crate) fn ignore_list(&self) -> IgnoreList {
        self.ignore.read().clone()
    }

    pub(crate) fn set_ignore_list(&self, list: IgnoreList) {
        *self.ignore.write() = list;
    }

    pub(crate) fn is_ignored(&self, client: &ClientInfo) -> bool {
        self.ignore.read().matches(&client.to_string())
    }

    pub(crate) fn away_message(&self) -> Option<String> {
        self.away.lock().clone()
    }

    /// Returns true if the state changed.
    pub(crate) fn set_away_message(&self, message: Option<String>) -> bool {
        let mut away = self.away.lock();
        if *away == message {
            return false;
        }
        *away = message;
        true
    }

    /// Whether `nickname` is our own nickname on `transport`.
    pub(crate) fn is_local(&self, transport: &dyn Transport, nickname: &str) -> bool {
        self.case_mapping()
            .equals(&transport.local_nickname(), nickname)
    }

    pub(crate) fn publish_connection(&self, event: ConnectionEvent) {
        self.events.publish(Event::Connection {
            server: self.id,
            event,
        });
    }

    pub(crate) fn publish_channel(&self, channel: &str, event: ChannelEvent) {
        self.events.publish(Event::Channel {
            server: self.id,
            channel: channel.to_string(),
            event,
        });
    }

    pub(crate) fn publish_query(&self, nickname: &str, event: QueryEvent) {
        self.events.publish(Event::Query {
            server: self.id,
            nickname: nickname.to_string(),
            event,
        });
    }

    /// Answer the CTCP requests we know. Returns true if a reply was sent.
    pub(crate) fn auto_reply_ctcp(
        &self,
        transport: &dyn Transport,
        source: &ClientInfo,
        kind: &str,
        args: &str,
    ) -> bool {
        if !self.config.ctcp_auto_reply {
            return false;
        }
        match ctcp_reply(&self.config, kind, args) {
            Some(reply) => {
                transport.send_ctcp_reply(&source.nickname, kind, &reply);
                true
            }
            None => false,
        }
    }
}

/// Reply body for the CTCP requests answered automatically.
pub(crate) fn ctcp_reply(config: &ConnectionConfig, kind: &str, args: &str) -> Option<String> {
    match kind.to_ascii_uppercase().as_str() {
        "VERSION" => Some(config.version.clone()),
        "PING" => Some(args.to_string()),
        "CLIENTINFO" => Some("VERSION PING CLIENTINFO ACTION".to_string()),
        _ => None,
    }
}
