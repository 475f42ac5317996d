//! Channel state driven by transport events, and outbound channel commands.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use common::{Harness, client, test_config};
use irc_session::transport::ChannelTransportEvent;
use irc_session::{
    ChannelEvent, ConnectionConfig, Event, Invite, JoinRequest, Member, PartReason, TransportEvent,
};

fn channel_events(events: &[Event], name: &str) -> Vec<ChannelEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Channel { channel, event, .. } if channel == name => Some(event.clone()),
            _ => None,
        })
        .collect()
}

fn topic_event(text: &str, discovered: bool) -> ChannelTransportEvent {
    ChannelTransportEvent::Topic {
        topic: text.to_string(),
        setter: "op!o@host".to_string(),
        time: Some(Utc::now()),
        discovered,
    }
}

fn names(nicks: &[&str]) -> ChannelTransportEvent {
    ChannelTransportEvent::Names {
        members: nicks
            .iter()
            .map(|n| Member::from_names_entry(n, "@+"))
            .collect(),
    }
}

#[test]
fn self_join_creates_channel() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    h.pump();

    let channel = h.server.group_chat_manager().channel("#TEST").unwrap();
    assert!(channel.is_on_channel());
    assert_eq!(channel.transport_id(), h.server.transport_id());
    assert_eq!(
        channel_events(&h.take_events(), "#test"),
        vec![ChannelEvent::SelfJoin { focus: true }]
    );
}

#[test]
fn roster_follows_names_join_part_quit_and_nick() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    transport.channel_event("#test", names(&["@alice", "+bob", "me"]));
    h.pump();
    let channel = h.server.group_chat_manager().channel("#test").unwrap();
    assert_eq!(channel.members().len(), 3);
    assert_eq!(channel.members()[0], Member::new("alice", "@"));

    transport.channel_event("#test", ChannelTransportEvent::Join { client: client("carol!c@host") });
    transport.channel_event(
        "#test",
        ChannelTransportEvent::Part {
            client: client("bob!b@host"),
            message: "bye".into(),
        },
    );
    transport.emit(TransportEvent::Quit {
        client: client("alice!a@host"),
        message: "gone".into(),
    });
    transport.emit(TransportEvent::NickChange {
        client: client("carol!c@host"),
        new_nickname: "Caroline".into(),
    });
    h.pump();

    let nicks: Vec<String> = channel.members().into_iter().map(|m| m.nickname).collect();
    assert_eq!(nicks, vec!["Caroline".to_string(), "me".to_string()]);
    assert!(channel.has_member("CAROLINE"));

    let events = channel_events(&h.take_events(), "#test");
    assert!(events.contains(&ChannelEvent::RosterUpdated { members: 3 }));
    assert!(events.contains(&ChannelEvent::Quit {
        client: "alice!a@host".into(),
        message: "gone".into()
    }));
    assert!(events.contains(&ChannelEvent::NickChange {
        old: "carol".into(),
        new: "Caroline".into()
    }));
}

#[test]
fn discovered_then_live_topic_both_recorded() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    transport.channel_event("#test", topic_event("T1", true));
    transport.channel_event("#test", topic_event("T2", false));
    h.pump();

    let channel = h.server.group_chat_manager().channel("#test").unwrap();
    let texts: Vec<String> = channel.topics().into_iter().map(|t| t.text).collect();
    assert_eq!(texts, vec!["T1".to_string(), "T2".to_string()]);
    assert_eq!(channel.current_topic().unwrap().text, "T2");
}

#[test]
fn rediscovered_topic_recorded_once() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    transport.channel_event("#test", topic_event("T1", true));
    h.pump();

    let channel = h.server.group_chat_manager().channel("#test").unwrap();
    channel.part("later");
    transport.joined("#test");
    transport.channel_event("#test", topic_event("T1", true));
    h.pump();

    assert_eq!(channel.topics().len(), 1);
}

#[test]
fn kicked_and_remote_part_record_reason() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#kick");
    transport.joined("#part");
    transport.channel_event("#kick", names(&["me", "op"]));
    h.pump();

    transport.channel_event(
        "#kick",
        ChannelTransportEvent::Kick {
            kicker: client("op!o@host"),
            victim: "ME".into(),
            reason: "out".into(),
        },
    );
    transport.channel_event(
        "#part",
        ChannelTransportEvent::Part {
            client: client("me!i@host"),
            message: String::new(),
        },
    );
    h.pump();

    let groups = h.server.group_chat_manager();
    let kicked = groups.channel("#kick").unwrap();
    assert!(!kicked.is_on_channel());
    assert!(kicked.members().is_empty());
    assert_eq!(kicked.part_reason(), Some(PartReason::Kicked));
    assert_eq!(
        groups.channel("#part").unwrap().part_reason(),
        Some(PartReason::RemotePart)
    );

    let events = channel_events(&h.take_events(), "#kick");
    assert!(events.contains(&ChannelEvent::SelfPart {
        reason: PartReason::Kicked,
        message: "out".into()
    }));
    assert!(events.contains(&ChannelEvent::RosterCleared));
}

#[test]
fn messages_respect_ignore_list() {
    let config = ConnectionConfig {
        ignore_list: vec![r"troll!.*@.*".to_string()],
        ..test_config()
    };
    let mut h = Harness::with_config(config);
    let transport = h.connected();
    transport.joined("#test");
    transport.channel_event(
        "#test",
        ChannelTransportEvent::Message {
            source: client("troll!t@host"),
            text: "spam".into(),
        },
    );
    transport.channel_event(
        "#test",
        ChannelTransportEvent::Message {
            source: client("friend!f@host"),
            text: "hi".into(),
        },
    );
    h.pump();

    let events = channel_events(&h.take_events(), "#test");
    let messages: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ChannelEvent::Message { .. }))
        .collect();
    assert_eq!(
        messages,
        vec![&ChannelEvent::Message {
            source: "friend!f@host".into(),
            text: "hi".into()
        }]
    );
}

#[test]
fn channel_ctcp_version_is_answered() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    transport.channel_event(
        "#test",
        ChannelTransportEvent::Ctcp {
            source: client("bob!b@host"),
            kind: "VERSION".into(),
            args: String::new(),
        },
    );
    h.pump();
    assert_eq!(
        transport.lines_starting("NOTICE"),
        vec!["NOTICE bob :\u{1}VERSION irc-session test\u{1}".to_string()]
    );
}

#[test]
fn long_text_is_split_on_char_boundaries() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    h.pump();
    transport.max_len.store(7, Ordering::SeqCst);
    h.take_events();

    let text = "héllo wörld ✓ ok";
    let channel = h.server.group_chat_manager().channel("#test").unwrap();
    channel.send_line(text);

    let chunks: Vec<String> = transport
        .lines_starting("PRIVMSG")
        .into_iter()
        .map(|l| l.trim_start_matches("PRIVMSG #test :").to_string())
        .collect();
    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|c| c.len() <= 7));
    assert_eq!(chunks.concat(), text);

    let published: Vec<String> = channel_events(&h.take_events(), "#test")
        .into_iter()
        .filter_map(|e| match e {
            ChannelEvent::SelfMessage { text } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(published, chunks);
}

#[test]
fn multi_line_text_sends_each_line() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    h.pump();
    let channel = h.server.group_chat_manager().channel("#test").unwrap();
    channel.send_line("one\n\ntwo");
    channel.send_action("waves");
    assert_eq!(
        transport.lines(),
        vec![
            "PRIVMSG #test :one".to_string(),
            "PRIVMSG #test :two".to_string(),
            "PRIVMSG #test :\u{1}ACTION waves\u{1}".to_string(),
        ]
    );
}

#[test]
fn off_channel_sends_nothing() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    h.pump();
    let channel = h.server.group_chat_manager().channel("#test").unwrap();
    channel.part("bye");
    transport.clear_lines();
    h.take_events();

    channel.send_line("hello?");
    channel.send_action("pokes");
    channel.set_topic("nope");
    channel.kick("bob", None);

    assert!(transport.lines().is_empty());
    let events = channel_events(&h.take_events(), "#test");
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, ChannelEvent::SelfMessage { .. } | ChannelEvent::SelfAction { .. }))
    );
}

#[test]
fn channel_commands_go_through_transport() {
    let mut h = Harness::new();
    let transport = h.connected();
    transport.joined("#test");
    h.pump();
    let channel = h.server.group_chat_manager().channel("#test").unwrap();

    channel.set_topic("new topic");
    channel.kick("bob", None);
    channel.kick("eve", Some("spam"));
    channel.set_mode('o', Some("bob"));
    channel.remove_mode('m', None);
    channel.request_member_list();
    channel.retrieve_list_modes();

    assert_eq!(
        transport.lines(),
        vec![
            "TOPIC #test :new topic",
            "KICK #test bob :Kicked",
            "KICK #test eve :spam",
            "MODE #test +o bob",
            "MODE #test -m",
            "NAMES #test",
            "MODE #test b",
            "MODE #test e",
            "MODE #test I",
        ]
    );
}

#[test]
fn socket_close_resets_and_reconnect_rejoins() {
    let mut h = Harness::new();
    let first = h.connected();
    first.joined("#keep");
    first.joined("#left");
    first.channel_event("#keep", names(&["me", "alice"]));
    h.pump();
    h.server.group_chat_manager().channel("#left").unwrap().part("bye");

    first.close_socket();
    h.pump();
    let keep = h.server.group_chat_manager().channel("#keep").unwrap();
    assert!(!keep.is_on_channel());
    assert!(keep.members().is_empty());
    assert_eq!(keep.part_reason(), Some(PartReason::Disconnected));

    let second = h.connected();
    assert_eq!(second.lines_starting("JOIN"), vec!["JOIN #keep".to_string()]);

    second.joined("#keep");
    h.pump();
    assert!(keep.is_on_channel());
    assert_eq!(keep.transport_id(), h.server.transport_id());
}

#[test]
fn close_channels_on_disconnect_removes_them() {
    let config = ConnectionConfig {
        close_channels_on_disconnect: true,
        ..test_config()
    };
    let mut h = Harness::with_config(config);
    let transport = h.connected();
    transport.joined("#gone");
    h.pump();

    transport.close_socket();
    h.pump();
    assert!(h.server.group_chat_manager().channels().is_empty());
    assert!(channel_events(&h.take_events(), "#gone").contains(&ChannelEvent::Closed));
}

#[test]
fn stale_transport_events_are_discarded() {
    let mut h = Harness::new();
    let old = h.connected();
    old.joined("#test");
    old.channel_event("#test", names(&["me", "alice"]));
    h.pump();
    let channel = h.server.group_chat_manager().channel("#test").unwrap();

    old.set_close_on_disconnect(false);
    let new = h.connect();
    new.ready();
    h.pump();
    h.take_events();

    old.channel_event("#test", ChannelTransportEvent::Join { client: client("mallory!m@host") });
    old.emit(TransportEvent::PrivateMessage {
        source: client("mallory!m@host"),
        text: "psst".into(),
    });
    h.pump();

    assert!(!channel.has_member("mallory"));
    assert!(!h.server.has_query("mallory"));
    assert!(h.take_events().is_empty());
    assert_eq!(old.disconnects.lock().last().map(String::as_str), Some(""));
}

#[test]
fn event_for_channel_bound_elsewhere_is_ignored() {
    let mut h = Harness::new();
    let old = h.connected();
    old.joined("#test");
    h.pump();

    old.set_close_on_disconnect(false);
    let new = h.connect();
    new.ready();
    h.pump();
    h.take_events();

    // The channel is still bound to the old transport until rejoined.
    new.channel_event("#test", topic_event("hijack", false));
    h.pump();
    let channel = h.server.group_chat_manager().channel("#test").unwrap();
    assert!(channel.topics().is_empty());
    assert!(channel_events(&h.take_events(), "#test").is_empty());
}

#[tokio::test(start_paused = true)]
async fn who_timer_sends_who_when_enabled() {
    let config = ConnectionConfig {
        send_who: true,
        who_interval_ms: 1_000,
        ..test_config()
    };
    let mut h = Harness::with_config(config);
    let transport = h.connected();
    transport.joined("#test");
    h.pump();

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(transport.lines_starting("WHO"), vec!["WHO #test".to_string()]);

    transport.close_socket();
    h.pump();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.lines_starting("WHO").len(), 1);
}

#[test]
fn channel_join_waits_for_registration() {
    let mut h = Harness::new();
    let first = h.connected();
    first.joined("#test");
    h.pump();
    let groups = h.server.group_chat_manager().clone();
    let channel = groups.channel("#test").unwrap();
    channel.part("bye");
    first.close_socket();
    h.pump();

    let second = h.connect();
    h.server
        .invite_manager()
        .add_invite(Invite::new("#TEST", &client("alice!a@host")));
    channel.join();
    assert!(second.lines().is_empty());
    assert_eq!(groups.queued_joins(), vec![JoinRequest::new("#test")]);
    assert!(h.server.invite_manager().invites().is_empty());

    second.ready();
    h.pump();
    assert_eq!(second.lines_starting("JOIN"), vec!["JOIN #test".to_string()]);
    assert!(groups.queued_joins().is_empty());
}
