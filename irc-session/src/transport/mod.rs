//! The protocol transport boundary.
//!
//! A [`Transport`] is one live protocol session to a server. It is created
//! fresh for every connection attempt and thrown away on every disconnect.
//! Transports never call into the connection directly: they push
//! `(TransportId, TransportEvent)` pairs through their [`EventSink`], and a
//! single pump task applies them in order.

pub mod irc;
pub mod message;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::channel::Member;
use crate::config::{ConnectionConfig, Profile, ServerAddress};

/// Identity of one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransportId(pub u64);

impl TransportId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TransportId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// Case-folding rules announced by the server in `CASEMAPPING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseMapping {
    /// `A-Z[]\~` fold to `a-z{}|^`.
    #[default]
    Rfc1459,
    /// `A-Z[]\` fold to `a-z{}|`.
    StrictRfc1459,
    /// Only `A-Z` fold.
    Ascii,
}

impl CaseMapping {
    pub fn from_isupport(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "rfc1459" => Some(CaseMapping::Rfc1459),
            "strict-rfc1459" => Some(CaseMapping::StrictRfc1459),
            "ascii" => Some(CaseMapping::Ascii),
            _ => None,
        }
    }

    pub fn fold_char(self, c: char) -> char {
        match (self, c) {
            (_, 'A'..='Z') => c.to_ascii_lowercase(),
            (CaseMapping::Ascii, _) => c,
            (_, '[') => '{',
            (_, ']') => '}',
            (_, '\\') => '|',
            (CaseMapping::Rfc1459, '~') => '^',
            _ => c,
        }
    }

    pub fn to_lower(self, s: &str) -> String {
        s.chars().map(|c| self.fold_char(c)).collect()
    }

    pub fn equals(self, a: &str, b: &str) -> bool {
        a.len() == b.len()
            && a
                .chars()
                .zip(b.chars())
                .all(|(x, y)| self.fold_char(x) == self.fold_char(y))
    }
}

/// `nick!ident@host`, any part of which may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ClientInfo {
    pub nickname: String,
    pub ident: Option<String>,
    pub host: Option<String>,
}

impl ClientInfo {
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            ..Self::default()
        }
    }

    /// Parse a message prefix.
    pub fn parse(prefix: &str) -> Self {
        let (nick_ident, host) = match prefix.split_once('@') {
            Some((left, host)) => (left, Some(host.to_string())),
            None => (prefix, None),
        };
        let (nickname, ident) = match nick_ident.split_once('!') {
            Some((nick, ident)) => (nick, Some(ident.to_string())),
            None => (nick_ident, None),
        };
        Self {
            nickname: nickname.to_string(),
            ident,
            host,
        }
    }
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nickname)?;
        if let Some(ident) = &self.ident {
            write!(f, "!{ident}")?;
        }
        if let Some(host) = &self.host {
            write!(f, "@{host}")?;
        }
        Ok(())
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectErrorKind {
    UnknownHost,
    NoRouteToHost,
    Timeout,
    Socket,
    Tls,
    Other,
}

/// Connect failure as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// `None` when the transport could not attribute a cause.
    pub kind: Option<ConnectErrorKind>,
    /// Message of the underlying error.
    pub message: String,
    /// Raw error data, used when there is no cause.
    pub data: String,
}

impl ErrorInfo {
    pub fn new(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: Some(kind),
            data: message.clone(),
            message,
        }
    }

    pub fn without_cause(data: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            kind: None,
            message: String::new(),
            data,
        }
    }

    /// User-facing description.
    pub fn description(&self) -> String {
        match self.kind {
            None => self.data.clone(),
            Some(ConnectErrorKind::UnknownHost) => "Unknown host (unable to resolve)".to_string(),
            Some(ConnectErrorKind::NoRouteToHost) => "No route to host".to_string(),
            Some(ConnectErrorKind::Timeout) => "Connection attempt timed out".to_string(),
            Some(ConnectErrorKind::Socket | ConnectErrorKind::Tls) => self.message.clone(),
            Some(ConnectErrorKind::Other) => format!("Unknown error: {}", self.message),
        }
    }
}

/// One channel in a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub name: String,
    pub key: Option<String>,
}

impl JoinRequest {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key: None,
        }
    }

    pub fn with_key(name: &str, key: &str) -> Self {
        Self {
            name: name.to_string(),
            key: Some(key.to_string()),
        }
    }
}

/// Build a single `JOIN` line for a batch of requests. Keyed channels go first.
pub fn join_line(requests: &[JoinRequest]) -> Option<String> {
    if requests.is_empty() {
        return None;
    }
    let (keyed, open): (Vec<&JoinRequest>, Vec<&JoinRequest>) =
        requests.iter().partition(|r| r.key.is_some());
    let names: Vec<&str> = keyed.iter().chain(open.iter()).map(|r| r.name.as_str()).collect();
    let keys: Vec<&str> = keyed.iter().filter_map(|r| r.key.as_deref()).collect();
    Some(if keys.is_empty() {
        format!("JOIN {}", names.join(","))
    } else {
        format!("JOIN {} {}", names.join(","), keys.join(","))
    })
}

/// Events applied to one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelTransportEvent {
    Message { source: ClientInfo, text: String },
    Action { source: ClientInfo, text: String },
    Notice { source: ClientInfo, text: String },
    Ctcp {
        source: ClientInfo,
        kind: String,
        args: String,
    },
    CtcpReply {
        source: ClientInfo,
        kind: String,
        args: String,
    },
    /// The complete member list, sent once `NAMES` finishes.
    Names { members: Vec<Member> },
    Topic {
        topic: String,
        setter: String,
        time: Option<DateTime<Utc>>,
        /// True when the topic was reported on join rather than changed live.
        discovered: bool,
    },
    Join { client: ClientInfo },
    Part { client: ClientInfo, message: String },
    Kick {
        kicker: ClientInfo,
        victim: String,
        reason: String,
    },
    Mode { source: ClientInfo, modes: String },
    /// Modes reported by `RPL_CHANNELMODEIS`.
    ModesDiscovered { modes: String },
    ListModes { mode: char, entries: Vec<String> },
}

/// Everything a transport can report.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Registration finished.
    ServerReady,
    SocketClosed,
    ConnectError(ErrorInfo),
    /// We joined a channel.
    SelfJoin { channel: String },
    Channel {
        channel: String,
        event: ChannelTransportEvent,
    },
    PrivateMessage { source: ClientInfo, text: String },
    PrivateAction { source: ClientInfo, text: String },
    PrivateNotice { source: ClientInfo, text: String },
    PrivateCtcp {
        source: ClientInfo,
        kind: String,
        args: String,
    },
    PrivateCtcpReply {
        source: ClientInfo,
        kind: String,
        args: String,
    },
    NickChange { client: ClientInfo, new_nickname: String },
    Quit { client: ClientInfo, message: String },
    Invite { channel: String, source: ClientInfo },
    /// Our own away state. `None` means back.
    AwayState { message: Option<String> },
    OtherAwayState { nickname: String, away: bool },
    NickInUse { nickname: String },
    ServerNotice { source: String, text: String },
    ServerError { message: String },
    Numeric { code: u16, params: Vec<String> },
    UserModes { modes: String },
    PingSent,
    PingSuccess { latency: Duration },
    PingFailed { elapsed: Duration },
    ParserError { line: String, message: String },
}

/// Where a transport delivers its events.
#[derive(Clone, Debug)]
pub struct EventSink {
    id: TransportId,
    tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
}

impl EventSink {
    pub fn new(id: TransportId, tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Queue an event. Returns false once the connection is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }
}

/// Everything a factory needs to build a transport.
#[derive(Clone, Debug)]
pub struct TransportContext {
    pub id: TransportId,
    pub sink: EventSink,
    pub address: ServerAddress,
    pub profile: Profile,
    pub config: Arc<ConnectionConfig>,
}

/// One live protocol session.
///
/// Calls must not block: `connect` and `disconnect` start work and report
/// completion through the sink. Most commands default to raw lines built on
/// [`Transport::send_raw`].
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Start opening the connection.
    fn connect(&self);

    /// Send `QUIT` and close. Must eventually produce `SocketClosed`.
    fn disconnect(&self, reason: &str);

    fn send_raw(&self, line: &str);

    fn max_length(&self, command: &str, target: &str) -> usize;

    fn case_mapping(&self) -> CaseMapping;

    fn local_nickname(&self) -> String;

    /// Channel types from `CHANTYPES`.
    fn channel_prefixes(&self) -> String {
        "#&".to_string()
    }

    /// Whether we are currently joined to `channel`.
    fn is_on_channel(&self, channel: &str) -> bool;

    fn send_message(&self, target: &str, text: &str) {
        self.send_raw(&format!("PRIVMSG {target} :{text}"));
    }

    fn send_action(&self, target: &str, text: &str) {
        self.send_raw(&format!("PRIVMSG {target} :\u{1}ACTION {text}\u{1}"));
    }

    fn send_notice(&self, target: &str, text: &str) {
        self.send_raw(&format!("NOTICE {target} :{text}"));
    }

    fn send_ctcp_reply(&self, target: &str, kind: &str, args: &str) {
        if args.is_empty() {
            self.send_raw(&format!("NOTICE {target} :\u{1}{kind}\u{1}"));
        } else {
            self.send_raw(&format!("NOTICE {target} :\u{1}{kind} {args}\u{1}"));
        }
    }

    fn is_valid_channel_name(&self, name: &str) -> bool {
        let prefixes = self.channel_prefixes();
        name.chars().next().is_some_and(|c| prefixes.contains(c))
            && !name.contains([' ', ',', '\u{7}'])
    }

    fn set_nickname(&self, nickname: &str) {
        self.send_raw(&format!("NICK {nickname}"));
    }

    fn join_channels(&self, requests: &[JoinRequest]) {
        if let Some(line) = join_line(requests) {
            self.send_raw(&line);
        }
    }

    fn part_channel(&self, channel: &str, reason: &str) {
        if reason.is_empty() {
            self.send_raw(&format!("PART {channel}"));
        } else {
            self.send_raw(&format!("PART {channel} :{reason}"));
        }
    }

    fn set_topic(&self, channel: &str, topic: &str) {
        self.send_raw(&format!("TOPIC {channel} :{topic}"));
    }

    fn kick(&self, channel: &str, nickname: &str, reason: &str) {
        self.send_raw(&format!("KICK {channel} {nickname} :{reason}"));
    }

    fn alter_mode(&self, target: &str, add: bool, mode: char, value: Option<&str>) {
        let sign = if add { '+' } else { '-' };
        match value {
            Some(v) => self.send_raw(&format!("MODE {target} {sign}{mode} {v}")),
            None => self.send_raw(&format!("MODE {target} {sign}{mode}")),
        }
    }

    fn request_who(&self, target: &str) {
        self.send_raw(&format!("WHO {target}"));
    }

    /// Ask for the list modes (bans, exceptions, invite masks).
    fn request_list_modes(&self, channel: &str) {
        for mode in ['b', 'e', 'I'] {
            self.send_raw(&format!("MODE {channel} {mode}"));
        }
    }

    fn send_whois(&self, nickname: &str) {
        self.send_raw(&format!("WHOIS {nickname}"));
    }

    fn server_name(&self) -> Option<String> {
        None
    }

    /// Network name from `NETWORK`, if the server sent one.
    fn network_name(&self) -> Option<String> {
        None
    }

    fn server_latency(&self) -> Option<Duration> {
        None
    }

    /// Protocol label, e.g. `irc`.
    fn protocol(&self) -> &str {
        "irc"
    }
}

/// Builds transports for one URL scheme.
pub trait TransportFactory: Send + Sync {
    fn create(&self, context: TransportContext) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(TransportContext) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self, context: TransportContext) -> Arc<dyn Transport> {
        self(context)
    }
}

/// Transport factories keyed by lower-case URL scheme.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `irc://` and `ircs://` backed by the tokio transport.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let factory: Arc<dyn TransportFactory> = Arc::new(irc::IrcTransportFactory);
        registry.register_arc("irc", factory.clone());
        registry.register_arc("ircs", factory);
        registry
    }

    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: TransportFactory + 'static,
    {
        self.register_arc(scheme, Arc::new(factory));
    }

    pub fn register_arc(&mut self, scheme: &str, factory: Arc<dyn TransportFactory>) {
        self.factories.insert(scheme.to_ascii_lowercase(), factory);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories.get(&scheme.to_ascii_lowercase()).cloned()
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1459_folds_brackets_and_tilde() {
        let cm = CaseMapping::Rfc1459;
        assert_eq!(cm.to_lower("Nick[Away]\\~"), "nick{away}|^");
        assert!(cm.equals("#Foo[1]", "#foo{1}"));
    }

    #[test]
    fn strict_and_ascii_mappings() {
        assert_eq!(CaseMapping::StrictRfc1459.to_lower("A~["), "a~{");
        assert_eq!(CaseMapping::Ascii.to_lower("A~[]"), "a~[]");
        assert_eq!(CaseMapping::from_isupport("ASCII"), Some(CaseMapping::Ascii));
        assert_eq!(CaseMapping::from_isupport("unicode"), None);
    }

    #[test]
    fn client_info_round_trip() {
        let client = ClientInfo::parse("nick!ident@host.example");
        assert_eq!(client.nickname, "nick");
        assert_eq!(client.ident.as_deref(), Some("ident"));
        assert_eq!(client.host.as_deref(), Some("host.example"));
        assert_eq!(client.to_string(), "nick!ident@host.example");
        assert_eq!(ClientInfo::parse("server.example").to_string(), "server.example");
    }

    #[test]
    fn error_descriptions() {
        let cases = [
            (ConnectErrorKind::UnknownHost, "Unknown host (unable to resolve)"),
            (ConnectErrorKind::NoRouteToHost, "No route to host"),
            (ConnectErrorKind::Timeout, "Connection attempt timed out"),
            (ConnectErrorKind::Socket, "connection refused"),
            (ConnectErrorKind::Tls, "connection refused"),
            (ConnectErrorKind::Other, "Unknown error: connection refused"),
        ];
        for (kind, expected) in cases {
            assert_eq!(ErrorInfo::new(kind, "connection refused").description(), expected);
        }
        assert_eq!(ErrorInfo::without_cause("raw data").description(), "raw data");
    }

    #[test]
    fn join_line_puts_keyed_channels_first() {
        let line = join_line(&[
            JoinRequest::new("#open"),
            JoinRequest::with_key("#secret", "hunter2"),
        ]);
        assert_eq!(line.as_deref(), Some("JOIN #secret,#open hunter2"));
        assert_eq!(join_line(&[]), None);
    }

    #[test]
    fn registry_is_case_insensitive() {
        let registry = TransportRegistry::with_defaults();
        assert!(registry.get("IRC").is_some());
        assert!(registry.get("ircs").is_some());
        assert!(registry.get("xmpp").is_none());
        assert_eq!(registry.schemes(), vec!["irc", "ircs"]);
    }
}
