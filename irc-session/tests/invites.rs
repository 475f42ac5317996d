mod common;

use common::{Harness, client, test_config};
use irc_session::{ConnectionConfig, ConnectionEvent, Event, Invite, TransportEvent};

fn invite_events(events: Vec<Event>) -> Vec<ConnectionEvent> {
    events
        .into_iter()
        .filter_map(|e| match e {
            Event::Connection {
                event: event @ (ConnectionEvent::InviteReceived { .. } | ConnectionEvent::InviteExpired { .. }),
                ..
            } => Some(event),
            _ => None,
        })
        .collect()
}

fn invited(h: &mut Harness, channel: &str, source: &str) {
    h.network.latest().emit(TransportEvent::Invite {
        channel: channel.to_string(),
        source: client(source),
    });
    h.pump();
}

#[test]
fn newer_invite_replaces_older_one() {
    let mut h = Harness::new();
    h.connected();
    h.take_events();

    invited(&mut h, "#party", "alice!a@host");
    invited(&mut h, "#PARTY", "bob!b@host");

    let invites = h.server.invite_manager().invites();
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].source, "bob!b@host");
    assert_eq!(
        invite_events(h.take_events()),
        vec![
            ConnectionEvent::InviteReceived {
                channel: "#party".into(),
                source: "alice!a@host".into()
            },
            ConnectionEvent::InviteExpired {
                channel: "#party".into(),
                source: "alice!a@host".into()
            },
            ConnectionEvent::InviteReceived {
                channel: "#PARTY".into(),
                source: "bob!b@host".into()
            },
        ]
    );
}

#[test]
fn accept_all_joins_every_invited_channel() {
    let mut h = Harness::new();
    let transport = h.connected();
    invited(&mut h, "#one", "alice!a@host");
    invited(&mut h, "#two", "bob!b@host");

    let server = &h.server;
    server.invite_manager().accept_all(server.group_chat_manager());

    assert_eq!(transport.lines_starting("JOIN"), vec!["JOIN #one,#two".to_string()]);
    assert!(server.invite_manager().invites().is_empty());
}

#[test]
fn declined_invite_expires() {
    let mut h = Harness::new();
    h.connected();
    invited(&mut h, "#one", "alice!a@host");
    h.take_events();

    let manager = h.server.invite_manager().clone();
    let invite = manager.invites().remove(0);
    manager.remove_invite(&invite);
    assert!(manager.invites().is_empty());
    assert_eq!(invite_events(h.take_events()).len(), 1);

    // Declining twice does nothing.
    manager.remove_invite(&invite);
    let stranger = Invite::new("#never", &client("eve!e@host"));
    manager.remove_invite(&stranger);
    assert!(invite_events(h.take_events()).is_empty());
}

#[test]
fn disconnect_expires_all_invites() {
    let mut h = Harness::new();
    h.connected();
    invited(&mut h, "#one", "alice!a@host");
    invited(&mut h, "#two", "bob!b@host");
    h.take_events();

    h.server.disconnect("bye").unwrap();
    assert!(h.server.invite_manager().invites().is_empty());
    let expired = invite_events(h.take_events());
    assert_eq!(expired.len(), 2);
    assert!(
        expired
            .iter()
            .all(|e| matches!(e, ConnectionEvent::InviteExpired { .. }))
    );
}

#[test]
fn socket_close_expires_invites() {
    let mut h = Harness::new();
    let transport = h.connected();
    invited(&mut h, "#one", "alice!a@host");
    transport.close_socket();
    h.pump();
    assert!(h.server.invite_manager().invites().is_empty());
}

#[test]
fn invites_from_ignored_users_are_dropped() {
    let config = ConnectionConfig {
        ignore_list: vec![r"spammer!.*".to_string()],
        ..test_config()
    };
    let mut h = Harness::with_config(config);
    h.connected();
    invited(&mut h, "#spam", "spammer!s@host");
    assert!(h.server.invite_manager().invites().is_empty());
    assert!(invite_events(h.take_events()).is_empty());
}
