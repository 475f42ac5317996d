//! Routes transport events to the connection, its channels and queries.

use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use crate::channel_events;
use crate::error::SessionError;
use crate::event::{ConnectionEvent, QueryEvent};
use crate::invite::Invite;
use crate::server::Server;
use crate::transport::{ClientInfo, Transport, TransportEvent, TransportId};

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

impl Server {
    /// Apply one transport event. Events from anything but the active
    /// transport are dropped, and a retired transport still talking is told
    /// to stop.
    pub fn dispatch(&self, origin: TransportId, event: TransportEvent) {
        let Some(transport) = self.core.active_transport().filter(|t| t.id() == origin) else {
            match self.core.previous_transport(origin) {
                Some(stale) => {
                    tracing::debug!(server = %self.core.id, transport = %origin, "Event from retired transport, disconnecting it");
                    stale.disconnect("");
                }
                None => {
                    tracing::debug!(server = %self.core.id, transport = %origin, "Event from unknown transport dropped");
                }
            }
            return;
        };

        if let Err(err) = self.handle_event(transport, origin, event) {
            self.report_internal_error(&err);
        }
    }

    fn handle_event(
        &self,
        transport: Arc<dyn Transport>,
        origin: TransportId,
        event: TransportEvent,
    ) -> Result<(), SessionError> {
        let core = &self.core;
        match event {
            TransportEvent::ServerReady => self.on_registration_complete(origin)?,
            TransportEvent::SocketClosed => self.on_socket_closed(origin)?,
            TransportEvent::ConnectError(info) => self.on_connect_error(origin, info)?,

            TransportEvent::SelfJoin { channel } => {
                self.groups.add_channel(&channel, origin);
            }
            TransportEvent::Channel { channel, event } => match self.groups.channel(&channel) {
                Some(target) => {
                    channel_events::handle(core, transport.as_ref(), &target, origin, event);
                }
                None => {
                    tracing::debug!(server = %core.id, %channel, "Event for unknown channel dropped");
                }
            },

            TransportEvent::PrivateMessage { source, text } => {
                if core.is_ignored(&source) {
                    return Ok(());
                }
                if self.get_query(&source.to_string()).is_some() {
                    core.publish_query(&source.nickname, QueryEvent::Message { text });
                }
            }
            TransportEvent::PrivateAction { source, text } => {
                if core.is_ignored(&source) {
                    return Ok(());
                }
                if self.get_query(&source.to_string()).is_some() {
                    core.publish_query(&source.nickname, QueryEvent::Action { text });
                }
            }
            TransportEvent::PrivateNotice { source, text } => {
                if core.is_ignored(&source) {
                    return Ok(());
                }
                match self.existing_query(&source.nickname) {
                    Some(query) => {
                        query.update_user(&source);
                        core.publish_query(&source.nickname, QueryEvent::Notice { text });
                    }
                    None => core.publish_connection(ConnectionEvent::ServerNotice {
                        source: source.to_string(),
                        text,
                    }),
                }
            }
            TransportEvent::PrivateCtcp { source, kind, args } => {
                if core.is_ignored(&source) {
                    return Ok(());
                }
                core.auto_reply_ctcp(transport.as_ref(), &source, &kind, &args);
                core.publish_connection(ConnectionEvent::CtcpRequest {
                    source: source.to_string(),
                    kind,
                    args,
                });
            }
            TransportEvent::PrivateCtcpReply { source, kind, args } => {
                if core.is_ignored(&source) {
                    return Ok(());
                }
                core.publish_connection(ConnectionEvent::CtcpReply {
                    source: source.to_string(),
                    kind,
                    args,
                });
            }

            TransportEvent::NickChange { client, new_nickname } => {
                self.on_nick_change(transport.as_ref(), origin, &client, &new_nickname);
            }
            TransportEvent::Quit { client, message } => {
                channel_events::on_quit(
                    core,
                    transport.as_ref(),
                    &self.groups.channels(),
                    origin,
                    &client,
                    &message,
                );
                if self.existing_query(&client.nickname).is_some() {
                    core.publish_query(&client.nickname, QueryEvent::Quit { message });
                }
            }
            TransportEvent::Invite { channel, source } => {
                if core.is_ignored(&source) {
                    return Ok(());
                }
                self.invites.add_invite(Invite::new(&channel, &source));
            }
            TransportEvent::AwayState { message } => self.update_away_state(message),
            TransportEvent::OtherAwayState { nickname, away } => {
                channel_events::on_user_away(core, &self.groups.channels(), origin, &nickname, away);
                if self.existing_query(&nickname).is_some() {
                    core.publish_query(&nickname, QueryEvent::UserAway { away });
                }
            }
            TransportEvent::NickInUse { nickname } => {
                self.on_nick_in_use(transport.as_ref(), &nickname);
            }

            TransportEvent::ServerNotice { source, text } => {
                core.publish_connection(ConnectionEvent::ServerNotice { source, text });
            }
            TransportEvent::ServerError { message } => {
                tracing::warn!(server = %core.id, %message, "Server error");
                core.publish_connection(ConnectionEvent::ServerError { message });
            }
            TransportEvent::Numeric { code, params } => {
                core.publish_connection(ConnectionEvent::Numeric { code, params });
            }
            TransportEvent::UserModes { modes } => {
                core.publish_connection(ConnectionEvent::UserModes { modes });
            }

            TransportEvent::PingSent => core.publish_connection(ConnectionEvent::PingSent),
            TransportEvent::PingSuccess { latency } => {
                core.publish_connection(ConnectionEvent::PingSuccess {
                    latency_ms: millis(latency),
                });
            }
            TransportEvent::PingFailed { elapsed } => self.on_ping_failed(elapsed),
            TransportEvent::ParserError { line, message } => {
                tracing::warn!(server = %core.id, %line, %message, "Unparseable line from server");
                core.publish_connection(ConnectionEvent::ParserError { line, message });
            }
        }
        Ok(())
    }

    fn on_nick_change(
        &self,
        transport: &dyn Transport,
        origin: TransportId,
        client: &ClientInfo,
        new_nickname: &str,
    ) {
        let core = &self.core;
        let old = client.nickname.as_str();
        if core.is_local(transport, old) || core.is_local(transport, new_nickname) {
            tracing::info!(server = %core.id, %old, new = %new_nickname, "Our nickname changed");
            core.publish_connection(ConnectionEvent::NickChanged {
                old: old.to_string(),
                new: new_nickname.to_string(),
            });
        }
        channel_events::on_nick_change(core, &self.groups.channels(), origin, old, new_nickname);
        self.rename_query(old, new_nickname);
    }

    /// Pick another nickname when ours was rejected.
    fn on_nick_in_use(&self, transport: &dyn Transport, nickname: &str) {
        let core = &self.core;
        let current = transport.local_nickname();
        if !core.case_mapping().equals(&current, nickname) {
            return;
        }
        let mapping = core.case_mapping();
        let next = self
            .profile()
            .and_then(|p| p.next_nickname(&current, |a, b| mapping.equals(a, b)).map(str::to_string))
            .unwrap_or_else(|| format!("{current}{}", rand::thread_rng().gen_range(0..10)));

        tracing::info!(server = %core.id, rejected = %nickname, next = %next, "Nickname in use");
        transport.set_nickname(&next);
        core.publish_connection(ConnectionEvent::NickInUse {
            nickname: nickname.to_string(),
        });
    }

    fn on_ping_failed(&self, elapsed: Duration) {
        let core = &self.core;
        core.publish_connection(ConnectionEvent::PingFailed {
            elapsed_ms: millis(elapsed),
        });
        if millis(elapsed) < core.config.ping_timeout_ms {
            return;
        }

        tracing::warn!(server = %core.id, elapsed_ms = millis(elapsed), "Server appears to be stoned, reconnecting");
        core.publish_connection(ConnectionEvent::Unresponsive {
            elapsed_ms: millis(elapsed),
        });
        // connect() may wait for the old socket to close, which needs the pump.
        let weak = self.weak_self.clone();
        core.scheduler.spawn_blocking(move || {
            let Some(server) = weak.upgrade() else {
                return;
            };
            let reason = server.core.config.reconnect_message.clone();
            if let Err(err) = server.reconnect(&reason) {
                server.report_internal_error(&err);
            }
        });
    }
}

/// Drains queued transport events into a [`Server`].
///
/// Run it on a task with [`EventPump::run`], or call [`EventPump::drain`]
/// to apply whatever is queued right now.
pub struct EventPump {
    rx: mpsc::UnboundedReceiver<(TransportId, TransportEvent)>,
    server: Weak<Server>,
}

impl EventPump {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<(TransportId, TransportEvent)>,
        server: Weak<Server>,
    ) -> Self {
        Self { rx, server }
    }

    /// Apply events until every sender is gone or the server is dropped.
    pub async fn run(mut self) {
        while let Some((origin, event)) = self.rx.recv().await {
            let Some(server) = self.server.upgrade() else {
                break;
            };
            server.dispatch(origin, event);
        }
        tracing::debug!("Event pump stopped");
    }

    /// Apply every event already queued. Returns how many were applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok((origin, event)) = self.rx.try_recv() {
            let Some(server) = self.server.upgrade() else {
                break;
            };
            server.dispatch(origin, event);
            applied += 1;
        }
        applied
    }
}
