//! irc-session: connection and session core for an IRC client.
//!
//! A [`Server`] owns one connection: its lifecycle state machine, the active
//! transport, channels, queries and invites. Transports report through an
//! event queue drained by an [`EventPump`]; everything observable is
//! published on the [`EventBus`].

pub mod channel;
mod channel_events;
pub mod channel_map;
pub mod config;
mod core;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod group_chat;
pub mod ignore;
pub mod invite;
pub mod network;
pub mod query;
pub mod scheduler;
pub mod server;
pub mod split;
pub mod status;
pub mod transport;

pub use channel::{Channel, Member, PartReason, Topic};
pub use config::{ConnectionConfig, Profile, ServerAddress};
pub use dispatch::EventPump;
pub use error::{ConfigError, SessionError};
pub use event::{ChannelEvent, ConnectionEvent, Event, EventBus, QueryEvent, ServerId};
pub use group_chat::GroupChatManager;
pub use ignore::IgnoreList;
pub use invite::{Invite, InviteManager};
pub use query::Query;
pub use scheduler::Scheduler;
pub use server::Server;
pub use status::{IllegalTransition, ServerState, ServerStatus, TransitionHistory, TransitionRecord};
pub use transport::{
    CaseMapping, ClientInfo, EventSink, JoinRequest, Transport, TransportContext, TransportEvent,
    TransportFactory, TransportId, TransportRegistry,
};
