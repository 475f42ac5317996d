//! Applies transport events to channels.

use chrono::Utc;

use crate::channel::{Channel, Member, PartReason, Topic};
use crate::core::ConnectionCore;
use crate::event::ChannelEvent;
use crate::transport::{ChannelTransportEvent, ClientInfo, Transport, TransportId};

/// Apply `event` to `channel`. Events from a transport the channel is not
/// bound to are dropped.
pub(crate) fn handle(
    core: &ConnectionCore,
    transport: &dyn Transport,
    channel: &Channel,
    origin: TransportId,
    event: ChannelTransportEvent,
) {
    if !channel.is_bound_to(origin) {
        tracing::debug!(channel = %channel.name(), transport = %origin, "Event for unbound channel ignored");
        return;
    }
    let name = channel.name();

    match event {
        ChannelTransportEvent::Message { source, text } => {
            if core.is_ignored(&source) {
                return;
            }
            core.publish_channel(name, ChannelEvent::Message { source: source.to_string(), text });
        }
        ChannelTransportEvent::Action { source, text } => {
            if core.is_ignored(&source) {
                return;
            }
            core.publish_channel(name, ChannelEvent::Action { source: source.to_string(), text });
        }
        ChannelTransportEvent::Notice { source, text } => {
            if core.is_ignored(&source) {
                return;
            }
            core.publish_channel(name, ChannelEvent::Notice { source: source.to_string(), text });
        }
        ChannelTransportEvent::Ctcp { source, kind, args } => {
            if core.is_ignored(&source) {
                return;
            }
            core.auto_reply_ctcp(transport, &source, &kind, &args);
            core.publish_channel(
                name,
                ChannelEvent::Ctcp {
                    source: source.to_string(),
                    kind,
                    args,
                },
            );
        }
        ChannelTransportEvent::CtcpReply { source, kind, args } => {
            if core.is_ignored(&source) {
                return;
            }
            core.publish_channel(
                name,
                ChannelEvent::CtcpReply {
                    source: source.to_string(),
                    kind,
                    args,
                },
            );
        }
        ChannelTransportEvent::Names { members } => {
            let count = channel.set_members(members, |nick| core.normalize(nick));
            core.publish_channel(name, ChannelEvent::RosterUpdated { members: count });
        }
        ChannelTransportEvent::Topic {
            topic,
            setter,
            time,
            discovered,
        } => {
            let topic = Topic {
                text: topic,
                setter,
                time: time.unwrap_or_else(Utc::now),
            };
            let published = (!topic.text.is_empty()).then(|| topic.clone());
            core.publish_channel(
                name,
                ChannelEvent::Topic {
                    topic: published,
                    discovered,
                },
            );
            channel.apply_topic(topic, discovered);
        }
        ChannelTransportEvent::Join { client } => {
            channel.add_member(Member::new(&client.nickname, ""), core.normalize(&client.nickname));
            core.publish_channel(name, ChannelEvent::Join { client: client.to_string() });
        }
        ChannelTransportEvent::Part { client, message } => {
            if core.is_local(transport, &client.nickname) {
                core.publish_channel(
                    name,
                    ChannelEvent::SelfPart {
                        reason: PartReason::RemotePart,
                        message,
                    },
                );
                channel.reset(PartReason::RemotePart);
            } else {
                channel.remove_member(&core.normalize(&client.nickname));
                core.publish_channel(
                    name,
                    ChannelEvent::Part {
                        client: client.to_string(),
                        message,
                    },
                );
            }
        }
        ChannelTransportEvent::Kick {
            kicker,
            victim,
            reason,
        } => {
            core.publish_channel(
                name,
                ChannelEvent::Kick {
                    kicker: kicker.to_string(),
                    victim: victim.clone(),
                    reason: reason.clone(),
                },
            );
            if core.is_local(transport, &victim) {
                tracing::info!(channel = %name, kicker = %kicker, "Kicked from channel");
                core.publish_channel(
                    name,
                    ChannelEvent::SelfPart {
                        reason: PartReason::Kicked,
                        message: reason,
                    },
                );
                channel.reset(PartReason::Kicked);
            } else {
                channel.remove_member(&core.normalize(&victim));
            }
        }
        ChannelTransportEvent::Mode { source, modes } => {
            core.publish_channel(
                name,
                ChannelEvent::ModeChange {
                    source: source.to_string(),
                    modes,
                },
            );
        }
        ChannelTransportEvent::ModesDiscovered { modes } => {
            channel.set_modes(&modes);
            core.publish_channel(name, ChannelEvent::ModesDiscovered { modes });
        }
        ChannelTransportEvent::ListModes { mode, entries } => {
            channel.set_list_mode(mode, entries.clone());
            core.publish_channel(name, ChannelEvent::ListModes { mode, entries });
        }
    }
}

/// `client` quit: drop them from every bound channel they were on.
pub(crate) fn on_quit(
    core: &ConnectionCore,
    transport: &dyn Transport,
    channels: &[std::sync::Arc<Channel>],
    origin: TransportId,
    client: &ClientInfo,
    message: &str,
) {
    let is_self = core.is_local(transport, &client.nickname);
    let key = core.normalize(&client.nickname);
    for channel in channels.iter().filter(|c| c.is_bound_to(origin)) {
        if is_self {
            channel.reset(PartReason::RemotePart);
        } else if channel.remove_member(&key) {
            core.publish_channel(
                channel.name(),
                ChannelEvent::Quit {
                    client: client.to_string(),
                    message: message.to_string(),
                },
            );
        }
    }
}

/// Rename a member in every bound channel they are on.
pub(crate) fn on_nick_change(
    core: &ConnectionCore,
    channels: &[std::sync::Arc<Channel>],
    origin: TransportId,
    old: &str,
    new: &str,
) {
    let old_key = core.normalize(old);
    for channel in channels.iter().filter(|c| c.is_bound_to(origin)) {
        if channel.rename_member(&old_key, new, core.normalize(new)) {
            core.publish_channel(
                channel.name(),
                ChannelEvent::NickChange {
                    old: old.to_string(),
                    new: new.to_string(),
                },
            );
        }
    }
}

/// Announce a member's away state on every bound channel they are on.
pub(crate) fn on_user_away(
    core: &ConnectionCore,
    channels: &[std::sync::Arc<Channel>],
    origin: TransportId,
    nickname: &str,
    away: bool,
) {
    let key = core.normalize(nickname);
    for channel in channels.iter().filter(|c| c.is_bound_to(origin)) {
        if channel.has_member(&key) {
            core.publish_channel(
                channel.name(),
                ChannelEvent::UserAway {
                    nickname: nickname.to_string(),
                    away,
                },
            );
        }
    }
}
