//! Shared test harness: a recording transport and a server wired to it.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use irc_session::transport::{ChannelTransportEvent, ErrorInfo};
use irc_session::{
    CaseMapping, ClientInfo, ConnectionConfig, Event, EventPump, EventSink, Profile, Scheduler,
    Server, ServerAddress, Transport, TransportContext, TransportEvent, TransportId,
    TransportRegistry,
};

pub const ADDRESS: &str = "irc://example.test:6667";
pub const NICK: &str = "me";

/// Records every call; events are pushed by the test.
pub struct MockTransport {
    id: TransportId,
    sink: EventSink,
    pub lines: Mutex<Vec<String>>,
    pub disconnects: Mutex<Vec<String>>,
    pub connects: AtomicUsize,
    nickname: Mutex<String>,
    channels: Mutex<HashSet<String>>,
    close_on_disconnect: AtomicBool,
    closed: AtomicBool,
    pub network: Mutex<Option<String>>,
    pub max_len: AtomicUsize,
}

impl MockTransport {
    fn new(context: TransportContext, close_on_disconnect: bool) -> Self {
        Self {
            id: context.id,
            sink: context.sink,
            lines: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            nickname: Mutex::new(context.profile.primary_nickname().to_string()),
            channels: Mutex::new(HashSet::new()),
            close_on_disconnect: AtomicBool::new(close_on_disconnect),
            closed: AtomicBool::new(false),
            network: Mutex::new(None),
            max_len: AtomicUsize::new(400),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        self.sink.send(event);
    }

    pub fn ready(&self) {
        self.emit(TransportEvent::ServerReady);
    }

    pub fn close_socket(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::SocketClosed);
    }

    pub fn fail(&self, error: ErrorInfo) {
        self.emit(TransportEvent::ConnectError(error));
    }

    /// The server confirms we joined `channel`.
    pub fn joined(&self, channel: &str) {
        self.channels.lock().insert(channel.to_ascii_lowercase());
        self.emit(TransportEvent::SelfJoin {
            channel: channel.to_string(),
        });
    }

    pub fn channel_event(&self, channel: &str, event: ChannelTransportEvent) {
        self.emit(TransportEvent::Channel {
            channel: channel.to_string(),
            event,
        });
    }

    pub fn set_close_on_disconnect(&self, close: bool) {
        self.close_on_disconnect.store(close, Ordering::SeqCst);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn lines_starting(&self, prefix: &str) -> Vec<String> {
        self.lines().into_iter().filter(|l| l.starts_with(prefix)).collect()
    }

    pub fn clear_lines(&self) {
        self.lines.lock().clear();
    }
}

impl Transport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self, reason: &str) {
        self.disconnects.lock().push(reason.to_string());
        // A socket closes once; later disconnects are recorded only.
        if self.close_on_disconnect.load(Ordering::SeqCst) && !self.closed.swap(true, Ordering::SeqCst) {
            self.sink.send(TransportEvent::SocketClosed);
        }
    }

    fn send_raw(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    fn max_length(&self, _command: &str, _target: &str) -> usize {
        self.max_len.load(Ordering::SeqCst)
    }

    fn case_mapping(&self) -> CaseMapping {
        CaseMapping::Rfc1459
    }

    fn local_nickname(&self) -> String {
        self.nickname.lock().clone()
    }

    fn set_nickname(&self, nickname: &str) {
        *self.nickname.lock() = nickname.to_string();
        self.send_raw(&format!("NICK {nickname}"));
    }

    fn is_on_channel(&self, channel: &str) -> bool {
        self.channels.lock().contains(&channel.to_ascii_lowercase())
    }

    fn part_channel(&self, channel: &str, reason: &str) {
        self.channels.lock().remove(&channel.to_ascii_lowercase());
        self.send_raw(&format!("PART {channel} :{reason}"));
    }

    fn network_name(&self) -> Option<String> {
        self.network.lock().clone()
    }
}

/// Factory that remembers every transport it built.
#[derive(Default)]
pub struct MockNetwork {
    pub transports: Mutex<Vec<Arc<MockTransport>>>,
    /// When false, transports never report their socket closing on their own.
    pub hang_on_disconnect: AtomicBool,
}

impl MockNetwork {
    pub fn latest(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .last()
            .cloned()
            .expect("no transport created yet")
    }

    pub fn count(&self) -> usize {
        self.transports.lock().len()
    }
}

/// Log to the test writer when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        disconnect_wait_ms: 50,
        version: "irc-session test".to_string(),
        ..ConnectionConfig::default()
    }
}

pub fn client(mask: &str) -> ClientInfo {
    ClientInfo::parse(mask)
}

/// A pump draining on its own thread; stopped on drop.
pub struct PumpThread {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PumpThread {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("pump thread panicked");
        }
    }
}

impl Drop for PumpThread {
    fn drop(&mut self) {
        self.halt();
    }
}

pub struct Harness {
    pub server: Arc<Server>,
    pump: Option<EventPump>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub network: Arc<MockNetwork>,
    _runtime: Option<tokio::runtime::Runtime>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Inside a tokio runtime the server schedules on it; otherwise the
    /// harness owns an idle one so timers can be created but never fire.
    pub fn with_config(config: ConnectionConfig) -> Self {
        init_tracing();
        let (scheduler, runtime) = match Scheduler::current() {
            Some(scheduler) => (scheduler, None),
            None => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("runtime");
                (Scheduler::new(runtime.handle().clone()), Some(runtime))
            }
        };

        let network = Arc::new(MockNetwork::default());
        let mut registry = TransportRegistry::new();
        let factory_network = network.clone();
        registry.register("irc", move |context: TransportContext| -> Arc<dyn Transport> {
            let close = !factory_network.hang_on_disconnect.load(Ordering::SeqCst);
            let transport = Arc::new(MockTransport::new(context, close));
            factory_network.transports.lock().push(transport.clone());
            transport
        });

        let (server, pump) = Server::new(Arc::new(config), registry, scheduler);
        let events = server.events().subscribe();
        Self {
            server,
            pump: Some(pump),
            events,
            network,
            _runtime: runtime,
        }
    }

    pub fn address() -> ServerAddress {
        ServerAddress::parse(ADDRESS).expect("address")
    }

    pub fn profile() -> Profile {
        Profile {
            nicknames: vec![NICK.to_string(), "me_".to_string()],
            ident: Some("ident".to_string()),
            realname: "Test User".to_string(),
        }
    }

    /// Start connecting; returns the new transport.
    pub fn connect(&self) -> Arc<MockTransport> {
        self.server
            .connect(Self::address(), Self::profile())
            .expect("connect");
        self.network.latest()
    }

    /// Connect and finish registration.
    pub fn connected(&mut self) -> Arc<MockTransport> {
        let transport = self.connect();
        transport.ready();
        self.pump();
        transport
    }

    /// Apply queued transport events on this thread. Does nothing once the
    /// pump has moved to its own thread.
    pub fn pump(&mut self) -> usize {
        self.pump.as_mut().map(EventPump::drain).unwrap_or(0)
    }

    /// Move the pump to a thread of its own, as an application would run it.
    pub fn spawn_pump(&mut self) -> PumpThread {
        let mut pump = self.pump.take().expect("pump already running");
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                if pump.drain() == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            pump.drain();
        });
        PumpThread {
            stop,
            handle: Some(handle),
        }
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
