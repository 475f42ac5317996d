//! Plain IRC over TCP, optionally TLS.
//!
//! Each [`IrcTransport`] owns one spawned task that opens the socket, runs
//! registration and translates server lines into [`TransportEvent`]s. The
//! transport handle only queues commands for that task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use super::message::{Message, ParseError, parse_ctcp};
use super::{
    CaseMapping, ChannelTransportEvent, ClientInfo, ConnectErrorKind, ErrorInfo, EventSink,
    Transport, TransportContext, TransportEvent, TransportFactory, TransportId,
};
use crate::channel::Member;
use crate::config::ServerAddress;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Longest host name we assume the server will prefix our messages with.
const ASSUMED_HOST_LEN: usize = 63;
const MAX_LINE_BYTES: usize = 510;

/// Builds [`IrcTransport`]s for `irc://` and `ircs://`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrcTransportFactory;

impl TransportFactory for IrcTransportFactory {
    fn create(&self, context: TransportContext) -> Arc<dyn Transport> {
        Arc::new(IrcTransport::new(context))
    }
}

#[derive(Debug)]
enum Command {
    Raw(String),
    Quit(String),
}

/// What the connection task has learned about the server.
#[derive(Debug)]
struct SharedState {
    nickname: String,
    registered: bool,
    server_name: Option<String>,
    network: Option<String>,
    case_mapping: CaseMapping,
    chantypes: String,
    /// Member prefix characters from `PREFIX`, highest first.
    prefixes: String,
    /// Normalised names of joined channels.
    channels: HashSet<String>,
    latency: Option<Duration>,
}

impl SharedState {
    fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            registered: false,
            server_name: None,
            network: None,
            case_mapping: CaseMapping::default(),
            chantypes: "#&".to_string(),
            prefixes: "@+".to_string(),
            channels: HashSet::new(),
            latency: None,
        }
    }
}

pub struct IrcTransport {
    context: TransportContext,
    shared: Arc<RwLock<SharedState>>,
    commands: mpsc::UnboundedSender<Command>,
    /// Taken by `connect`.
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl IrcTransport {
    pub fn new(context: TransportContext) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(RwLock::new(SharedState::new(context.profile.primary_nickname())));
        Self {
            context,
            shared,
            commands,
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

impl Transport for IrcTransport {
    fn id(&self) -> TransportId {
        self.context.id
    }

    fn connect(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            tracing::debug!(transport = %self.context.id, "Transport already started");
            return;
        };
        let sink = self.context.sink.clone();
        let Ok(handle) = Handle::try_current() else {
            sink.send(TransportEvent::ConnectError(ErrorInfo::new(
                ConnectErrorKind::Other,
                "no async runtime to run the connection on",
            )));
            sink.send(TransportEvent::SocketClosed);
            return;
        };
        handle.spawn(run_transport(self.context.clone(), self.shared.clone(), receiver));
    }

    fn disconnect(&self, reason: &str) {
        if self.receiver.lock().take().is_some() {
            // Never started: nothing to close.
            self.context.sink.send(TransportEvent::SocketClosed);
            return;
        }
        let _ = self.commands.send(Command::Quit(reason.to_string()));
    }

    fn send_raw(&self, line: &str) {
        let line: String = line.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        let _ = self.commands.send(Command::Raw(line));
    }

    fn max_length(&self, command: &str, target: &str) -> usize {
        let shared = self.shared.read();
        // ":nick!ident@host COMMAND target :"
        let overhead = 1
            + shared.nickname.len()
            + 1
            + self.context.profile.ident().len()
            + 1
            + ASSUMED_HOST_LEN
            + 1
            + command.len()
            + 1
            + target.len()
            + 2;
        MAX_LINE_BYTES.saturating_sub(overhead)
    }

    fn case_mapping(&self) -> CaseMapping {
        self.shared.read().case_mapping
    }

    fn local_nickname(&self) -> String {
        self.shared.read().nickname.clone()
    }

    fn channel_prefixes(&self) -> String {
        self.shared.read().chantypes.clone()
    }

    fn is_on_channel(&self, channel: &str) -> bool {
        let shared = self.shared.read();
        shared.channels.contains(&shared.case_mapping.to_lower(channel))
    }

    fn set_nickname(&self, nickname: &str) {
        {
            // The server only echoes NICK once we are registered.
            let mut shared = self.shared.write();
            if !shared.registered {
                shared.nickname = nickname.to_string();
            }
        }
        self.send_raw(&format!("NICK {nickname}"));
    }

    fn server_name(&self) -> Option<String> {
        self.shared.read().server_name.clone()
    }

    fn network_name(&self) -> Option<String> {
        self.shared.read().network.clone()
    }

    fn server_latency(&self) -> Option<Duration> {
        self.shared.read().latency
    }
}

/// A connection that has completed TCP (and optionally TLS) but hasn't
/// started IRC registration yet.
enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

async fn run_transport(
    context: TransportContext,
    shared: Arc<RwLock<SharedState>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let sink = context.sink.clone();
    let mut pending = Vec::new();

    let established = tokio::select! {
        result = establish_connection(&context.address) => result,
        _ = wait_for_quit(&mut commands, &mut pending) => {
            tracing::debug!(transport = %context.id, "Quit before the socket opened");
            sink.send(TransportEvent::SocketClosed);
            return;
        }
    };

    let connection = match established {
        Ok(connection) => connection,
        Err(error) => {
            tracing::warn!(transport = %context.id, address = %context.address, error = %error.description(), "Connect failed");
            sink.send(TransportEvent::ConnectError(error));
            sink.send(TransportEvent::SocketClosed);
            return;
        }
    };

    let session = Session::new(sink.clone(), shared.clone());
    let result = match connection {
        EstablishedConnection::Plain(tcp) => {
            let (reader, writer) = tokio::io::split(tcp);
            run_irc(BufReader::new(reader), writer, &context, session, commands, pending).await
        }
        EstablishedConnection::Tls(tls) => {
            let (reader, writer) = tokio::io::split(*tls);
            run_irc(BufReader::new(reader), writer, &context, session, commands, pending).await
        }
    };
    if let Err(e) = result {
        tracing::info!(transport = %context.id, error = %e, "Connection lost");
    }

    shared.write().channels.clear();
    sink.send(TransportEvent::SocketClosed);
}

/// Resolves once a quit is queued or the transport is dropped. Raw lines
/// queued meanwhile are kept for after the socket opens.
async fn wait_for_quit(commands: &mut mpsc::UnboundedReceiver<Command>, pending: &mut Vec<String>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Raw(line) => pending.push(line),
            Command::Quit(_) => return,
        }
    }
}

/// Resolve, connect and (for `ircs://`) run the TLS handshake.
async fn establish_connection(address: &ServerAddress) -> Result<EstablishedConnection, ErrorInfo> {
    let target = address.socket_addr();
    tracing::debug!("Resolving {target}...");
    let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| ErrorInfo::new(ConnectErrorKind::UnknownHost, e.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(ErrorInfo::new(
            ConnectErrorKind::UnknownHost,
            format!("{target} has no addresses"),
        ));
    }

    let tcp = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addrs[..])).await {
        Err(_) => {
            return Err(ErrorInfo::new(
                ConnectErrorKind::Timeout,
                format!("TCP connect to {target} timed out"),
            ));
        }
        Ok(Err(e)) => return Err(classify_io_error(&target, &e)),
        Ok(Ok(tcp)) => tcp,
    };
    tracing::debug!("TCP connected to {target}");

    if !address.is_secure() {
        return Ok(EstablishedConnection::Plain(tcp));
    }

    let connector = TlsConnector::from(Arc::new(rustls_default_config()));
    let dns_name = rustls::pki_types::ServerName::try_from(address.host().to_string())
        .map_err(|e| ErrorInfo::new(ConnectErrorKind::Tls, format!("Invalid TLS server name: {e}")))?;
    let tls = connector.connect(dns_name, tcp).await.map_err(|e| {
        ErrorInfo::new(
            ConnectErrorKind::Tls,
            format!("TLS handshake with {target} failed: {e}"),
        )
    })?;
    tracing::debug!("TLS handshake complete");
    Ok(EstablishedConnection::Tls(Box::new(tls)))
}

fn classify_io_error(target: &str, error: &std::io::Error) -> ErrorInfo {
    use std::io::ErrorKind;
    let kind = match error.kind() {
        ErrorKind::TimedOut => ConnectErrorKind::Timeout,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => ConnectErrorKind::NoRouteToHost,
        _ => ConnectErrorKind::Socket,
    };
    ErrorInfo::new(kind, format!("TCP connect to {target} failed: {error}"))
}

fn install_crypto_provider() {
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    Ok(())
}

async fn run_irc<R, W>(
    mut reader: R,
    mut writer: W,
    context: &TransportContext,
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
    pending: Vec<String>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let profile = &context.profile;
    write_line(&mut writer, &format!("NICK {}", session.nickname())).await?;
    write_line(
        &mut writer,
        &format!("USER {} 0 * :{}", profile.ident(), profile.realname),
    )
    .await?;
    for line in pending {
        session.note_outgoing(&line);
        write_line(&mut writer, &line).await?;
    }

    let mut buf = Vec::new();
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = reader.read_until(b'\n', &mut buf) => {
                let n = result?;
                if n == 0 {
                    tracing::debug!(transport = %context.id, "Server closed the connection");
                    break;
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                buf.clear();
                if let Some(reply) = session.handle_line(&line) {
                    write_line(&mut writer, &reply).await?;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Raw(line)) => {
                    session.note_outgoing(&line);
                    write_line(&mut writer, &line).await?;
                }
                Some(Command::Quit(reason)) => {
                    let quit = if reason.is_empty() {
                        "QUIT".to_string()
                    } else {
                        format!("QUIT :{reason}")
                    };
                    write_line(&mut writer, &quit).await?;
                    writer.shutdown().await?;
                    break;
                }
                None => {
                    tracing::debug!(transport = %context.id, "Transport dropped, closing");
                    break;
                }
            },
            _ = ping.tick() => {
                if let Some(line) = session.on_ping_tick(Instant::now()) {
                    write_line(&mut writer, &line).await?;
                }
            }
        }
    }

    Ok(())
}

/// Per-connection protocol state: turns lines into events.
struct Session {
    sink: EventSink,
    shared: Arc<RwLock<SharedState>>,
    ready: bool,
    /// `353` entries waiting for `366`.
    names: HashMap<String, Vec<Member>>,
    /// `332` texts waiting for `333`.
    topics: HashMap<String, String>,
    /// List mode entries waiting for their end numeric.
    list_modes: HashMap<(String, char), Vec<String>>,
    ping_sent: Option<Instant>,
    away_message: Option<String>,
}

impl Session {
    fn new(sink: EventSink, shared: Arc<RwLock<SharedState>>) -> Self {
        Self {
            sink,
            shared,
            ready: false,
            names: HashMap::new(),
            topics: HashMap::new(),
            list_modes: HashMap::new(),
            ping_sent: None,
            away_message: None,
        }
    }

    fn emit(&self, event: TransportEvent) {
        self.sink.send(event);
    }

    fn emit_channel(&self, channel: &str, event: ChannelTransportEvent) {
        self.emit(TransportEvent::Channel {
            channel: channel.to_string(),
            event,
        });
    }

    fn nickname(&self) -> String {
        self.shared.read().nickname.clone()
    }

    fn is_self(&self, nickname: &str) -> bool {
        let shared = self.shared.read();
        shared.case_mapping.equals(&shared.nickname, nickname)
    }

    fn is_channel(&self, name: &str) -> bool {
        let shared = self.shared.read();
        name.chars().next().is_some_and(|c| shared.chantypes.contains(c))
    }

    fn normalize(&self, name: &str) -> String {
        self.shared.read().case_mapping.to_lower(name)
    }

    /// Remember what we asked for so `306` can report it.
    fn note_outgoing(&mut self, line: &str) {
        let Ok(msg) = Message::parse(line) else {
            return;
        };
        if msg.command == "AWAY" {
            self.away_message = msg.params.first().cloned().filter(|m| !m.is_empty());
        }
    }

    fn on_ping_tick(&mut self, now: Instant) -> Option<String> {
        if !self.shared.read().registered {
            return None;
        }
        match self.ping_sent {
            Some(sent) => {
                self.emit(TransportEvent::PingFailed {
                    elapsed: now.duration_since(sent),
                });
                None
            }
            None => {
                self.ping_sent = Some(now);
                self.emit(TransportEvent::PingSent);
                Some("PING :irc-session".to_string())
            }
        }
    }

    fn on_pong(&mut self) {
        if let Some(sent) = self.ping_sent.take() {
            let latency = sent.elapsed();
            self.shared.write().latency = Some(latency);
            self.emit(TransportEvent::PingSuccess { latency });
        }
    }

    /// Handle one server line. Returns a line to send back, if any.
    fn handle_line(&mut self, line: &str) -> Option<String> {
        let msg = match Message::parse(line) {
            Ok(msg) => msg,
            Err(ParseError::Empty) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable line");
                self.emit(TransportEvent::ParserError {
                    line: line.trim_end().to_string(),
                    message: e.to_string(),
                });
                return None;
            }
        };
        let source = msg.prefix.as_deref().map(ClientInfo::parse).unwrap_or_default();

        match msg.command.as_str() {
            "PING" => return Some(format!("PONG :{}", msg.param(0))),
            "PONG" => self.on_pong(),
            "ERROR" => self.emit(TransportEvent::ServerError {
                message: msg.param(0).to_string(),
            }),
            "001" => {
                {
                    let mut shared = self.shared.write();
                    shared.registered = true;
                    shared.nickname = msg.param(0).to_string();
                    shared.server_name = msg.prefix.clone();
                }
                self.emit_numeric(&msg);
            }
            "005" => {
                self.apply_isupport(&msg.params);
                self.emit_numeric(&msg);
            }
            "376" | "422" => {
                self.emit_numeric(&msg);
                if !self.ready {
                    self.ready = true;
                    self.emit(TransportEvent::ServerReady);
                }
            }
            "433" => self.emit(TransportEvent::NickInUse {
                nickname: msg.param(1).to_string(),
            }),
            "JOIN" => {
                let channel = msg.param(0);
                if self.is_self(&source.nickname) {
                    let key = self.normalize(channel);
                    self.shared.write().channels.insert(key);
                    self.emit(TransportEvent::SelfJoin {
                        channel: channel.to_string(),
                    });
                } else {
                    self.emit_channel(channel, ChannelTransportEvent::Join { client: source });
                }
            }
            "PART" => {
                let channel = msg.param(0);
                if self.is_self(&source.nickname) {
                    let key = self.normalize(channel);
                    self.shared.write().channels.remove(&key);
                }
                self.emit_channel(
                    channel,
                    ChannelTransportEvent::Part {
                        client: source,
                        message: msg.param(1).to_string(),
                    },
                );
            }
            "KICK" => {
                let channel = msg.param(0);
                let victim = msg.param(1);
                if self.is_self(victim) {
                    let key = self.normalize(channel);
                    self.shared.write().channels.remove(&key);
                }
                self.emit_channel(
                    channel,
                    ChannelTransportEvent::Kick {
                        kicker: source,
                        victim: victim.to_string(),
                        reason: msg.param(2).to_string(),
                    },
                );
            }
            "QUIT" => self.emit(TransportEvent::Quit {
                client: source,
                message: msg.param(0).to_string(),
            }),
            "NICK" => {
                let new_nickname = msg.param(0).to_string();
                if self.is_self(&source.nickname) {
                    self.shared.write().nickname = new_nickname.clone();
                }
                self.emit(TransportEvent::NickChange {
                    client: source,
                    new_nickname,
                });
            }
            "MODE" => {
                let target = msg.param(0);
                let modes = msg.params.get(1..).unwrap_or_default().join(" ");
                if self.is_channel(target) {
                    self.emit_channel(target, ChannelTransportEvent::Mode { source, modes });
                } else if self.is_self(target) {
                    self.emit(TransportEvent::UserModes { modes });
                }
            }
            "TOPIC" => self.emit_channel(
                msg.param(0),
                ChannelTransportEvent::Topic {
                    topic: msg.param(1).to_string(),
                    setter: source.to_string(),
                    time: None,
                    discovered: false,
                },
            ),
            "PRIVMSG" => self.on_privmsg(&msg, source),
            "NOTICE" => self.on_notice(&msg, source),
            "INVITE" => self.emit(TransportEvent::Invite {
                channel: msg.param(1).to_string(),
                source,
            }),
            "AWAY" => self.emit(TransportEvent::OtherAwayState {
                nickname: source.nickname,
                away: !msg.params.is_empty(),
            }),
            _ => match msg.numeric() {
                Some(code) => self.on_numeric(code, &msg),
                None => tracing::debug!(command = %msg.command, "Unhandled command"),
            },
        }
        None
    }

    fn emit_numeric(&self, msg: &Message) {
        if let Some(code) = msg.numeric() {
            self.emit(TransportEvent::Numeric {
                code,
                params: msg.params.clone(),
            });
        }
    }

    fn apply_isupport(&self, params: &[String]) {
        // First param is our nick, last is the "are supported" text.
        let tokens = params.get(1..params.len().saturating_sub(1)).unwrap_or_default();
        let mut shared = self.shared.write();
        for token in tokens {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            match key {
                "NETWORK" if !value.is_empty() => shared.network = Some(value.to_string()),
                "CASEMAPPING" => {
                    if let Some(mapping) = CaseMapping::from_isupport(value) {
                        shared.case_mapping = mapping;
                    }
                }
                "CHANTYPES" if !value.is_empty() => shared.chantypes = value.to_string(),
                "PREFIX" => {
                    if let Some((_, chars)) = value.split_once(')') {
                        shared.prefixes = chars.to_string();
                    }
                }
                _ => {}
            }
        }
    }

    fn on_privmsg(&self, msg: &Message, source: ClientInfo) {
        let target = msg.param(0);
        let text = msg.param(1).to_string();
        let in_channel = self.is_channel(target);
        let event = match (parse_ctcp(&text), in_channel) {
            (Some((kind, args)), true) if kind == "ACTION" => {
                return self.emit_channel(target, ChannelTransportEvent::Action { source, text: args });
            }
            (Some((kind, args)), false) if kind == "ACTION" => {
                TransportEvent::PrivateAction { source, text: args }
            }
            (Some((kind, args)), true) => {
                return self.emit_channel(target, ChannelTransportEvent::Ctcp { source, kind, args });
            }
            (Some((kind, args)), false) => TransportEvent::PrivateCtcp { source, kind, args },
            (None, true) => {
                return self.emit_channel(target, ChannelTransportEvent::Message { source, text });
            }
            (None, false) => TransportEvent::PrivateMessage { source, text },
        };
        self.emit(event);
    }

    fn on_notice(&self, msg: &Message, source: ClientInfo) {
        let target = msg.param(0);
        let text = msg.param(1).to_string();
        if source.ident.is_none() && source.host.is_none() {
            self.emit(TransportEvent::ServerNotice {
                source: source.nickname,
                text,
            });
            return;
        }
        let in_channel = self.is_channel(target);
        match (parse_ctcp(&text), in_channel) {
            (Some((kind, args)), true) => {
                self.emit_channel(target, ChannelTransportEvent::CtcpReply { source, kind, args });
            }
            (Some((kind, args)), false) => {
                self.emit(TransportEvent::PrivateCtcpReply { source, kind, args });
            }
            (None, true) => self.emit_channel(target, ChannelTransportEvent::Notice { source, text }),
            (None, false) => self.emit(TransportEvent::PrivateNotice { source, text }),
        }
    }

    fn flush_topic(&mut self, channel: &str, setter: &str, time: Option<DateTime<Utc>>) {
        let key = self.normalize(channel);
        if let Some(topic) = self.topics.remove(&key) {
            self.emit_channel(
                channel,
                ChannelTransportEvent::Topic {
                    topic,
                    setter: setter.to_string(),
                    time,
                    discovered: true,
                },
            );
        }
    }

    fn on_numeric(&mut self, code: u16, msg: &Message) {
        match code {
            // RPL_AWAY
            301 => self.emit(TransportEvent::OtherAwayState {
                nickname: msg.param(1).to_string(),
                away: true,
            }),
            // RPL_UNAWAY
            305 => {
                self.away_message = None;
                self.emit(TransportEvent::AwayState { message: None });
            }
            // RPL_NOWAWAY
            306 => self.emit(TransportEvent::AwayState {
                message: Some(self.away_message.clone().unwrap_or_default()),
            }),
            // RPL_CHANNELMODEIS
            324 => self.emit_channel(
                msg.param(1),
                ChannelTransportEvent::ModesDiscovered {
                    modes: msg.params.get(2..).unwrap_or_default().join(" "),
                },
            ),
            // RPL_NOTOPIC
            331 => self.emit_channel(
                msg.param(1),
                ChannelTransportEvent::Topic {
                    topic: String::new(),
                    setter: String::new(),
                    time: None,
                    discovered: true,
                },
            ),
            // RPL_TOPIC
            332 => {
                let key = self.normalize(msg.param(1));
                self.topics.insert(key, msg.param(2).to_string());
            }
            // RPL_TOPICWHOTIME
            333 => {
                let time = msg
                    .param(3)
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0));
                self.flush_topic(msg.param(1), msg.param(2), time);
            }
            // RPL_NAMREPLY
            353 => {
                let prefixes = self.shared.read().prefixes.clone();
                let key = self.normalize(msg.param(2));
                let members = self.names.entry(key).or_default();
                members.extend(
                    msg.param(3)
                        .split_whitespace()
                        .map(|entry| Member::from_names_entry(entry, &prefixes)),
                );
            }
            // RPL_ENDOFNAMES
            366 => {
                let channel = msg.param(1).to_string();
                let members = self.names.remove(&self.normalize(&channel)).unwrap_or_default();
                self.emit_channel(&channel, ChannelTransportEvent::Names { members });
                self.flush_topic(&channel, "", None);
            }
            // Ban, exception and invite lists.
            367 | 348 | 346 => {
                let mode = list_mode_for(code);
                let key = (self.normalize(msg.param(1)), mode);
                self.list_modes
                    .entry(key)
                    .or_default()
                    .push(msg.param(2).to_string());
            }
            368 | 349 | 347 => {
                let mode = list_mode_for(code);
                let channel = msg.param(1);
                let entries = self
                    .list_modes
                    .remove(&(self.normalize(channel), mode))
                    .unwrap_or_default();
                self.emit_channel(channel, ChannelTransportEvent::ListModes { mode, entries });
            }
            _ => self.emit_numeric(msg),
        }
    }
}

fn list_mode_for(code: u16) -> char {
    match code {
        348 | 349 => 'e',
        346 | 347 => 'I',
        _ => 'b',
    }
}
