//! MQTT bus client.
//!
//! Thin, thread-based session over a `TcpStream` using the `mqtt` packet
//! codec. Each session owns a reader thread (dispatching subscription
//! callbacks and answering the QoS handshakes) and a keepalive thread.
//! An unexpected drop triggers linear-backoff reconnection (5·n seconds),
//! replays every subscription, and fires the on-reconnect hook so owners can
//! republish retained state.
//!
//! Jobs run two independent sessions: a publisher (no last-will) and a
//! subscriber carrying the `$state = lost` last-will. The split keeps
//! callbacks free to publish while the receive loop is busy.

use std::io::Write;
use std::net::TcpStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::{
    ConnackPacket, ConnectPacket, DisconnectPacket, PingreqPacket, PubackPacket, PubcompPacket,
    PublishPacket, PubrecPacket, PubrelPacket, QoSWithPacketIdentifier, SubscribePacket,
    UnsubscribePacket, VariablePacket,
};
use mqtt::{Decodable, Encodable, QualityOfService, TopicFilter, TopicName};

use crate::error::{Error, Result};

/// Broker TCP port.
pub const BROKER_PORT: u16 = 1883;

/// Delivery guarantee for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    fn to_protocol(self) -> QualityOfService {
        match self {
            Qos::AtMostOnce => QualityOfService::Level0,
            Qos::AtLeastOnce => QualityOfService::Level1,
            Qos::ExactlyOnce => QualityOfService::Level2,
        }
    }

    fn with_packet_id(self, pkid: u16) -> QoSWithPacketIdentifier {
        match self {
            Qos::AtMostOnce => QoSWithPacketIdentifier::Level0,
            Qos::AtLeastOnce => QoSWithPacketIdentifier::Level1(pkid),
            Qos::ExactlyOnce => QoSWithPacketIdentifier::Level2(pkid),
        }
    }
}

/// An inbound message handed to subscription callbacks.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker served this from its retained store.
    pub retained: bool,
}

impl Message {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn payload_f64(&self) -> Option<f64> {
        self.payload_str().trim().parse().ok()
    }
}

/// Testament the broker publishes if this session dies without a DISCONNECT.
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub keepalive_secs: u16,
    pub clean_session: bool,
    pub last_will: Option<LastWill>,
    /// Linear-backoff attempts before the initial `connect` gives up.
    /// `publish` is not bounded by this; it retries until the broker
    /// returns or the session shuts down.
    pub max_retries: u32,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            keepalive_secs: 20,
            clean_session: true,
            last_will: None,
            max_retries: 10,
        }
    }
}

/// Backoff before retry `attempt` (1-based): 5·n seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(5 * u64::from(attempt))
}

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Subscription {
    filter: String,
    qos: Qos,
    allow_retained: bool,
    callback: Callback,
}

struct Inner {
    host: String,
    client_id: String,
    options: BusOptions,
    writer: Mutex<Option<TcpStream>>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_packet_id: AtomicU16,
    connected: AtomicBool,
    shutting_down: AtomicBool,
    on_reconnect: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// One client session against the leader's broker.
pub struct BusClient {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Connect to `host`, retrying with linear backoff up to the option cap.
    pub fn connect(host: &str, client_id: &str, options: BusOptions) -> Result<Self> {
        let inner = Arc::new(Inner {
            host: host.to_string(),
            client_id: client_id.to_string(),
            options,
            writer: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            next_packet_id: AtomicU16::new(1),
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            on_reconnect: Mutex::new(None),
        });

        let mut attempt = 0u32;
        let stream = loop {
            attempt += 1;
            match open_session(&inner) {
                Ok(stream) => break stream,
                Err(e) if attempt < inner.options.max_retries => {
                    log::warn!(
                        "attempt {attempt}: unable to reach broker at {}: {e}",
                        inner.host
                    );
                    std::thread::sleep(backoff_delay(attempt));
                }
                Err(e) => return Err(e),
            }
        };

        let client = Self {
            inner: Arc::clone(&inner),
            reader: Mutex::new(None),
            pinger: Mutex::new(None),
        };
        client.spawn_reader(stream);
        client.spawn_pinger();
        Ok(client)
    }

    /// Register the hook invoked after every successful reconnection.
    pub fn set_on_reconnect<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        *self.inner.on_reconnect.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Publish, retrying connectivity failures indefinitely with linear
    /// backoff (the delay is capped, the attempts are not). The leader may
    /// be down or restarting; messages must not be dropped because of it.
    /// Only a malformed topic or a session shutdown ends the loop early.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: Qos, retain: bool) -> Result<()> {
        let name = TopicName::new(topic.to_string())
            .map_err(|e| Error::Bus(format!("bad topic {topic}: {e}")))?;
        let mut attempt = 0u32;
        loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(Error::Bus(format!(
                    "session closed before publish to {topic} went out"
                )));
            }
            attempt += 1;
            let pkid = self.inner.take_packet_id();
            let mut packet =
                PublishPacket::new(name.clone(), qos.with_packet_id(pkid), payload.to_vec());
            packet.set_retain(retain);
            match self.inner.send(&packet) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("attempt {attempt}: publish to {topic} failed: {e}");
                    std::thread::sleep(backoff_delay(attempt.min(12)));
                }
            }
        }
    }

    /// Attach `callback` to every message matching `filters`.
    ///
    /// Callbacks run on the session's reader thread; a panic inside one is
    /// caught and logged without killing the loop. With `allow_retained`
    /// false, broker-replayed retained messages are dropped before dispatch.
    pub fn subscribe_callback<F>(
        &self,
        filters: &[&str],
        qos: Qos,
        allow_retained: bool,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        for filter in filters {
            TopicFilter::new(filter.to_string())
                .map_err(|e| Error::Bus(format!("bad filter {filter}: {e}")))?;
            self.inner.subscriptions.lock().unwrap().push(Subscription {
                filter: filter.to_string(),
                qos,
                allow_retained,
                callback: Arc::clone(&callback),
            });
            self.inner.send_subscribe(filter, qos)?;
        }
        Ok(())
    }

    /// Drop every subscription whose filter string equals `filter`.
    pub fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .retain(|s| s.filter != filter);
        let parsed = TopicFilter::new(filter.to_string())
            .map_err(|e| Error::Bus(format!("bad filter {filter}: {e}")))?;
        let packet = UnsubscribePacket::new(self.inner.take_packet_id(), vec![parsed]);
        self.inner.send(&packet)
    }

    /// Wait up to `timeout` for a single message on `topic`. `None` on expiry.
    pub fn subscribe_once(
        &self,
        topic: &str,
        qos: Qos,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        let (tx, rx) = mpsc::channel::<Message>();
        let tx = Mutex::new(tx);
        self.subscribe_callback(&[topic], qos, true, move |m| {
            let _ = tx.lock().unwrap().send(m.clone());
        })?;
        let received = rx.recv_timeout(timeout).ok();
        let _ = self.unsubscribe(topic);
        Ok(received)
    }

    /// Graceful teardown: DISCONNECT, close the socket, join the loops.
    ///
    /// Safe to call from a subscription callback (the reader thread itself):
    /// the self-join is skipped and the loop exits once the callback returns.
    pub fn disconnect(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.inner.send(&DisconnectPacket::new());
        if let Some(stream) = self.inner.writer.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(h) = self.reader.lock().unwrap().take() {
            if h.thread().id() != std::thread::current().id() {
                let _ = h.join();
            }
        }
        if let Some(h) = self.pinger.lock().unwrap().take() {
            if h.thread().id() != std::thread::current().id() {
                let _ = h.join();
            }
        }
    }

    fn spawn_reader(&self, stream: TcpStream) {
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name(format!("{}-bus-read", inner.client_id))
            .spawn(move || reader_loop(inner, stream))
            .expect("spawn bus reader");
        *self.reader.lock().unwrap() = Some(handle);
    }

    fn spawn_pinger(&self) {
        let inner = Arc::clone(&self.inner);
        let period = Duration::from_secs(u64::from(inner.options.keepalive_secs.max(2)) / 2);
        let handle = std::thread::Builder::new()
            .name(format!("{}-bus-ping", inner.client_id))
            .spawn(move || {
                while !inner.shutting_down.load(Ordering::SeqCst) {
                    std::thread::sleep(period);
                    if inner.connected.load(Ordering::SeqCst) {
                        let _ = inner.send(&PingreqPacket::new());
                    }
                }
            })
            .expect("spawn bus pinger");
        *self.pinger.lock().unwrap() = Some(handle);
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        if !self.inner.shutting_down.load(Ordering::SeqCst) {
            self.disconnect();
        }
    }
}

impl Inner {
    fn take_packet_id(&self) -> u16 {
        // 0 is not a legal packet identifier
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    fn send<P: Encodable>(&self, packet: &P) -> Result<()> {
        let mut buf = Vec::new();
        packet
            .encode(&mut buf)
            .map_err(|e| Error::Bus(format!("encode: {e}")))?;
        let mut writer = self.writer.lock().unwrap();
        match writer.as_mut() {
            Some(stream) => stream.write_all(&buf).map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                Error::Bus(format!("write: {e}"))
            }),
            None => Err(Error::Bus("not connected".into())),
        }
    }

    fn send_subscribe(&self, filter: &str, qos: Qos) -> Result<()> {
        let parsed = TopicFilter::new(filter.to_string())
            .map_err(|e| Error::Bus(format!("bad filter {filter}: {e}")))?;
        let packet =
            SubscribePacket::new(self.take_packet_id(), vec![(parsed, qos.to_protocol())]);
        self.send(&packet)
    }

    fn dispatch(&self, publish: &PublishPacket) {
        let message = Message {
            topic: publish.topic_name().to_string(),
            payload: publish.payload().to_vec(),
            retained: publish.retain(),
        };
        let callbacks: Vec<(bool, Callback)> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter()
                .filter(|s| filter_matches(&s.filter, &message.topic))
                .map(|s| (s.allow_retained, Arc::clone(&s.callback)))
                .collect()
        };
        for (allow_retained, callback) in callbacks {
            if message.retained && !allow_retained {
                continue;
            }
            // a broken callback must not take the read loop down with it
            if catch_unwind(AssertUnwindSafe(|| callback(&message))).is_err() {
                log::error!(
                    "subscription callback for {} panicked; continuing",
                    message.topic
                );
            }
        }
    }
}

fn filter_matches(filter: &str, topic: &str) -> bool {
    match TopicFilter::new(filter.to_string()) {
        Ok(parsed) => {
            let matcher = parsed.get_matcher();
            mqtt::TopicNameRef::new(topic)
                .map(|name| matcher.is_match(name))
                .unwrap_or(false)
        }
        Err(_) => false,
    }
}

/// Open a TCP session and complete the CONNECT/CONNACK handshake.
fn open_session(inner: &Inner) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((inner.host.as_str(), BROKER_PORT))
        .map_err(|e| Error::Bus(format!("connect {}: {e}", inner.host)))?;
    stream.set_nodelay(true).ok();
    // a silent broker past two keepalive periods means the link is dead
    stream
        .set_read_timeout(Some(Duration::from_secs(
            u64::from(inner.options.keepalive_secs.max(2)) * 2,
        )))
        .ok();

    let mut connect = ConnectPacket::new(inner.client_id.clone());
    connect.set_clean_session(inner.options.clean_session);
    connect.set_keep_alive(inner.options.keepalive_secs);
    if let Some(will) = &inner.options.last_will {
        let name = TopicName::new(will.topic.clone())
            .map_err(|e| Error::Bus(format!("bad will topic: {e}")))?;
        connect.set_will(Some((name, will.payload.clone())));
        connect.set_will_qos(match will.qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        });
        connect.set_will_retain(will.retain);
    }

    let mut buf = Vec::new();
    connect
        .encode(&mut buf)
        .map_err(|e| Error::Bus(format!("encode connect: {e}")))?;
    stream.write_all(&buf)?;

    let connack =
        ConnackPacket::decode(&mut stream).map_err(|e| Error::Bus(format!("connack: {e}")))?;
    if connack.connect_return_code() != ConnectReturnCode::ConnectionAccepted {
        return Err(Error::Bus(format!(
            "broker refused connection: {:?}",
            connack.connect_return_code()
        )));
    }

    let writer = stream
        .try_clone()
        .map_err(|e| Error::Bus(format!("clone stream: {e}")))?;
    *inner.writer.lock().unwrap() = Some(writer);
    inner.connected.store(true, Ordering::SeqCst);
    Ok(stream)
}

fn reader_loop(inner: Arc<Inner>, mut stream: TcpStream) {
    loop {
        match VariablePacket::decode(&mut stream) {
            Ok(packet) => handle_packet(&inner, packet),
            Err(_) if inner.shutting_down.load(Ordering::SeqCst) => return,
            Err(e) => {
                inner.connected.store(false, Ordering::SeqCst);
                log::debug!("{}: bus read failed ({e}); reconnecting", inner.client_id);
                match reconnect(&inner) {
                    Some(fresh) => stream = fresh,
                    None => return,
                }
            }
        }
        if inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
    }
}

fn handle_packet(inner: &Inner, packet: VariablePacket) {
    match packet {
        VariablePacket::PublishPacket(publish) => {
            match publish.qos() {
                QoSWithPacketIdentifier::Level0 => {}
                QoSWithPacketIdentifier::Level1(pkid) => {
                    let _ = inner.send(&PubackPacket::new(pkid));
                }
                QoSWithPacketIdentifier::Level2(pkid) => {
                    let _ = inner.send(&PubrecPacket::new(pkid));
                }
            }
            inner.dispatch(&publish);
        }
        // outgoing QoS 2 continuation
        VariablePacket::PubrecPacket(pubrec) => {
            let _ = inner.send(&PubrelPacket::new(pubrec.packet_identifier()));
        }
        // incoming QoS 2 completion
        VariablePacket::PubrelPacket(pubrel) => {
            let _ = inner.send(&PubcompPacket::new(pubrel.packet_identifier()));
        }
        VariablePacket::PingrespPacket(..)
        | VariablePacket::PubackPacket(..)
        | VariablePacket::PubcompPacket(..)
        | VariablePacket::SubackPacket(..)
        | VariablePacket::UnsubackPacket(..) => {}
        other => {
            log::debug!("{}: ignoring unexpected packet {other:?}", inner.client_id);
        }
    }
}

/// Re-establish the session, replay subscriptions, fire the hook.
/// Returns `None` when the client is shutting down.
fn reconnect(inner: &Arc<Inner>) -> Option<TcpStream> {
    let mut attempt = 0u32;
    loop {
        if inner.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        attempt += 1;
        match open_session(inner) {
            Ok(stream) => {
                let filters: Vec<(String, Qos)> = {
                    let subs = inner.subscriptions.lock().unwrap();
                    subs.iter().map(|s| (s.filter.clone(), s.qos)).collect()
                };
                for (filter, qos) in filters {
                    let _ = inner.send_subscribe(&filter, qos);
                }
                if let Some(hook) = inner.on_reconnect.lock().unwrap().as_ref() {
                    hook();
                }
                log::debug!("{}: reconnected to {}", inner.client_id, inner.host);
                return Some(stream);
            }
            Err(e) => {
                log::warn!(
                    "{}: reconnect attempt {attempt} failed: {e}",
                    inner.client_id
                );
                std::thread::sleep(backoff_delay(attempt.min(12)));
            }
        }
    }
}
