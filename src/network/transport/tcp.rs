//! Blocking TCP transport.
//!
//! Frames are length-prefixed: a 4-byte LE frame length, a 1-byte kind
//! (data / subscribe / unsubscribe), a 2-byte LE topic length, the topic
//! bytes, then the payload. Subscribe/unsubscribe frames flow from
//! subscribers to publishers as control traffic on the same connection.
//!
//! Role shapes:
//!
//! - send-recv: the receiver binds a listener and drains every accepted peer
//!   into one bounded channel; the sender connects a single stream.
//! - pub-sub: the publisher binds and fans data frames out to every accepted
//!   connection whose topic set matches; subscribers connect to each
//!   publisher URI, maintain those links across churn, and merge all
//!   publisher streams into one bounded channel.
//!
//! Wildcard host/port bind to `0.0.0.0`/ephemeral and the actually-bound
//! address is reported back so the network manager can advertise it.

use super::{
    ConnectSpec, PluginRole, ReceiverPlugin, TransportError, TransportReceiver, TransportSender,
    TransportSubscriber, Uri,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const FRAME_DATA: u8 = 0;
const FRAME_SUBSCRIBE: u8 = 1;
const FRAME_UNSUBSCRIBE: u8 = 2;

/// Upper bound on a single frame; anything larger is treated as corruption.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Depth of the per-plugin incoming channel.
const INCOMING_DEPTH: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_POLL: Duration = Duration::from_millis(25);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

pub(super) fn make_sender(role: PluginRole) -> Arc<dyn TransportSender> {
    match role {
        PluginRole::Publisher => Arc::new(TcpPublisher::default()),
        _ => Arc::new(TcpSender::default()),
    }
}

pub(super) fn make_receiver(role: PluginRole) -> ReceiverPlugin {
    match role {
        PluginRole::Subscriber => {
            let subscriber = Arc::new(TcpSubscriber::new());
            ReceiverPlugin {
                receiver: subscriber.clone(),
                subscriber: Some(subscriber),
            }
        }
        _ => ReceiverPlugin {
            receiver: Arc::new(TcpReceiver::default()),
            subscriber: None,
        },
    }
}

fn write_frame<W: Write>(mut w: W, kind: u8, topic: &str, payload: &[u8]) -> io::Result<()> {
    let topic = topic.as_bytes();
    let len = 1 + 2 + topic.len() + payload.len();
    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(&(topic.len() as u16).to_le_bytes());
    buf.extend_from_slice(topic);
    buf.extend_from_slice(payload);
    w.write_all(&buf)?;
    w.flush()
}

fn read_frame<R: Read>(mut r: R) -> io::Result<(u8, String, Vec<u8>)> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if !(3..=MAX_FRAME).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} out of range", len),
        ));
    }

    let mut frame = vec![0u8; len];
    r.read_exact(&mut frame)?;
    let kind = frame[0];
    let topic_len = u16::from_le_bytes([frame[1], frame[2]]) as usize;
    if 3 + topic_len > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "topic length exceeds frame",
        ));
    }
    let topic = String::from_utf8_lossy(&frame[3..3 + topic_len]).into_owned();
    let payload = frame[3 + topic_len..].to_vec();
    Ok((kind, topic, payload))
}

fn is_timeout_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn resolve(uri: &Uri) -> Result<SocketAddr, TransportError> {
    let host = if uri.host_is_wildcard() {
        "0.0.0.0"
    } else {
        uri.host.as_str()
    };
    let port = if uri.port_is_wildcard() {
        "0"
    } else {
        uri.port.as_str()
    };
    format!("{}:{}", host, port)
        .to_socket_addrs()
        .map_err(TransportError::Io)?
        .next()
        .ok_or_else(|| TransportError::BadUri(uri.to_string()))
}

/// Bind a reusable listener and report the bound URI (wildcard host replaced
/// by a routable local address).
fn bind_listener(uri: &Uri) -> Result<(TcpListener, String), TransportError> {
    let addr = resolve(uri)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;

    let local = listener.local_addr()?;
    let host = if local.ip().is_unspecified() {
        local_ip()
    } else {
        local.ip().to_string()
    };
    Ok((listener, format!("tcp://{}:{}", host, local.port())))
}

/// Best-effort routable address of this host; never sends a packet.
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn connect_stream(uri: &Uri) -> Result<TcpStream, TransportError> {
    let addr = resolve(uri)?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Point-to-point send side: one stream to the bound receiver.
#[derive(Default)]
struct TcpSender {
    stream: Mutex<Option<TcpStream>>,
}

impl TransportSender for TcpSender {
    fn connect_for_sends(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        let uri = spec.uris().first().cloned().unwrap_or_default();
        let parsed = Uri::parse(&uri)?;
        let stream = connect_stream(&parsed)?;
        debug!("sender connected to {}", uri);
        *self.stream.lock() = Some(stream);
        Ok(uri)
    }

    fn send(&self, data: &[u8], timeout: Duration, topic: &str) -> Result<(), TransportError> {
        let mut guard = self.stream.lock();
        let stream = guard
            .as_ref()
            .ok_or_else(|| TransportError::NotConnected("tcp sender".to_string()))?;

        stream.set_write_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match write_frame(stream, FRAME_DATA, topic, data) {
            Ok(()) => Ok(()),
            Err(e) if is_timeout_io(&e) => {
                // A half-written frame poisons the stream; force a reconnect.
                *guard = None;
                Err(TransportError::SendTimeout {
                    timeout_ms: timeout.as_millis(),
                })
            }
            Err(e) => {
                *guard = None;
                Err(TransportError::Io(e))
            }
        }
    }
}

/// Point-to-point receive side: a listener whose accepted peers are drained
/// into one bounded channel by per-peer pump threads.
struct TcpReceiver {
    running: Arc<AtomicBool>,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    peers: Arc<Mutex<Vec<TcpStream>>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TcpReceiver {
    fn default() -> Self {
        let (tx, rx) = channel::bounded(INCOMING_DEPTH);
        TcpReceiver {
            running: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
            peers: Arc::new(Mutex::new(Vec::new())),
            accept_thread: Mutex::new(None),
        }
    }
}

fn pump_peer(stream: TcpStream, tx: Sender<Vec<u8>>) {
    loop {
        match read_frame(&stream) {
            Ok((FRAME_DATA, _topic, payload)) => {
                if tx.send(payload).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!("peer pump stopping: {}", e);
                return;
            }
        }
    }
}

impl TransportReceiver for TcpReceiver {
    fn connect_for_receives(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        let uri = spec.uris().first().cloned().unwrap_or_default();
        let parsed = Uri::parse(&uri)?;
        let (listener, bound) = bind_listener(&parsed)?;
        debug!("receiver bound to {}", bound);

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let peers = Arc::clone(&self.peers);
        let tx = self.tx.clone();
        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        let _ = stream.set_nodelay(true);
                        let _ = stream.set_nonblocking(false);
                        if let Ok(clone) = stream.try_clone() {
                            peers.lock().push(clone);
                        }
                        let tx = tx.clone();
                        thread::spawn(move || pump_peer(stream, tx));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        });
        *self.accept_thread.lock() = Some(handle);
        Ok(bound)
    }

    fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::ReceiveTimeout {
                timeout_ms: timeout.as_millis(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::NotConnected("tcp receiver".to_string()))
            }
        }
    }
}

impl Drop for TcpReceiver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for peer in self.peers.lock().drain(..) {
            let _ = peer.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

struct PubConn {
    stream: TcpStream,
    topics: Arc<Mutex<HashSet<String>>>,
    alive: Arc<AtomicBool>,
}

/// Publish side: a listener fanning data frames out to every subscribed
/// connection.
struct TcpPublisher {
    running: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<PubConn>>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TcpPublisher {
    fn default() -> Self {
        TcpPublisher {
            running: Arc::new(AtomicBool::new(false)),
            conns: Arc::new(Mutex::new(Vec::new())),
            accept_thread: Mutex::new(None),
        }
    }
}

/// Reads subscribe/unsubscribe control frames from one subscriber link.
fn pump_control(stream: TcpStream, topics: Arc<Mutex<HashSet<String>>>, alive: Arc<AtomicBool>) {
    loop {
        match read_frame(&stream) {
            Ok((FRAME_SUBSCRIBE, topic, _)) => {
                debug!("subscriber added topic '{}'", topic);
                topics.lock().insert(topic);
            }
            Ok((FRAME_UNSUBSCRIBE, topic, _)) => {
                topics.lock().remove(&topic);
            }
            Ok(_) => {}
            Err(_) => {
                alive.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

impl TransportSender for TcpPublisher {
    fn connect_for_sends(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        let uri = spec.uris().first().cloned().unwrap_or_default();
        let parsed = Uri::parse(&uri)?;
        let (listener, bound) = bind_listener(&parsed)?;
        debug!("publisher bound to {}", bound);

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let conns = Arc::clone(&self.conns);
        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("subscriber connected from {}", peer);
                        let _ = stream.set_nodelay(true);
                        let _ = stream.set_nonblocking(false);
                        let topics = Arc::new(Mutex::new(HashSet::new()));
                        let alive = Arc::new(AtomicBool::new(true));
                        if let Ok(reader) = stream.try_clone() {
                            let topics = Arc::clone(&topics);
                            let alive = Arc::clone(&alive);
                            thread::spawn(move || pump_control(reader, topics, alive));
                        }
                        conns.lock().push(PubConn {
                            stream,
                            topics,
                            alive,
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!("publisher accept failed: {}", e);
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        });
        *self.accept_thread.lock() = Some(handle);
        Ok(bound)
    }

    fn send(&self, data: &[u8], timeout: Duration, topic: &str) -> Result<(), TransportError> {
        let mut conns = self.conns.lock();
        conns.retain(|c| c.alive.load(Ordering::SeqCst));
        for conn in conns.iter() {
            let subscribed = conn
                .topics
                .lock()
                .iter()
                .any(|sub| topic.starts_with(sub.as_str()));
            if !subscribed {
                continue;
            }
            let _ = conn
                .stream
                .set_write_timeout(Some(timeout.max(Duration::from_millis(1))));
            if let Err(e) = write_frame(&conn.stream, FRAME_DATA, topic, data) {
                // Slow or vanished subscriber: best-effort drop of the link.
                debug!("dropping subscriber link: {}", e);
                conn.alive.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for conn in self.conns.lock().drain(..) {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

struct SubLink {
    wanted: Arc<AtomicBool>,
    writer: Arc<Mutex<Option<TcpStream>>>,
    thread: JoinHandle<()>,
}

/// Subscribe side: one worker per publisher URI, reconnecting on failure and
/// merging every publisher stream into one channel.
struct TcpSubscriber {
    running: Arc<AtomicBool>,
    topics: Arc<Mutex<HashSet<String>>>,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    links: Mutex<HashMap<String, SubLink>>,
}

impl TcpSubscriber {
    fn new() -> Self {
        let (tx, rx) = channel::bounded(INCOMING_DEPTH);
        TcpSubscriber {
            running: Arc::new(AtomicBool::new(true)),
            topics: Arc::new(Mutex::new(HashSet::new())),
            tx,
            rx,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_link(&self, uri: String) -> Result<SubLink, TransportError> {
        let parsed = Uri::parse(&uri)?;
        let wanted = Arc::new(AtomicBool::new(true));
        let writer = Arc::new(Mutex::new(None::<TcpStream>));
        let running = Arc::clone(&self.running);
        let topics = Arc::clone(&self.topics);
        let tx = self.tx.clone();

        let thread = {
            let wanted = Arc::clone(&wanted);
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                while wanted.load(Ordering::SeqCst) && running.load(Ordering::SeqCst) {
                    let stream = match connect_stream(&parsed) {
                        Ok(s) => s,
                        Err(e) => {
                            debug!("subscriber connect to {} failed: {}", parsed, e);
                            thread::sleep(RECONNECT_BACKOFF);
                            continue;
                        }
                    };
                    debug!("subscriber connected to {}", parsed);
                    if let Ok(clone) = stream.try_clone() {
                        *writer.lock() = Some(clone);
                    }
                    let snapshot: Vec<String> = topics.lock().iter().cloned().collect();
                    for topic in snapshot {
                        let _ = write_frame(&stream, FRAME_SUBSCRIBE, &topic, &[]);
                    }

                    loop {
                        match read_frame(&stream) {
                            Ok((FRAME_DATA, _topic, payload)) => {
                                if tx.send(payload).is_err() {
                                    *writer.lock() = None;
                                    return;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!("subscriber link to {} dropped: {}", parsed, e);
                                break;
                            }
                        }
                    }
                    *writer.lock() = None;
                    thread::sleep(RECONNECT_BACKOFF);
                }
            })
        };

        Ok(SubLink {
            wanted,
            writer,
            thread,
        })
    }

    fn stop_link(link: SubLink) {
        link.wanted.store(false, Ordering::SeqCst);
        if let Some(stream) = link.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let _ = link.thread.join();
    }

    fn broadcast_control(&self, kind: u8, topic: &str) {
        for link in self.links.lock().values() {
            if let Some(stream) = link.writer.lock().as_ref() {
                if let Err(e) = write_frame(stream, kind, topic, &[]) {
                    debug!("control frame failed: {}", e);
                }
            }
        }
    }
}

impl TransportReceiver for TcpSubscriber {
    fn connect_for_receives(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        let wanted: HashSet<String> = spec.uris().iter().cloned().collect();

        let mut stopped = Vec::new();
        {
            let mut links = self.links.lock();
            let vanished: Vec<String> = links
                .keys()
                .filter(|uri| !wanted.contains(*uri))
                .cloned()
                .collect();
            for uri in vanished {
                if let Some(link) = links.remove(&uri) {
                    stopped.push(link);
                }
            }
            for uri in &wanted {
                if !links.contains_key(uri) {
                    let link = self.spawn_link(uri.clone())?;
                    links.insert(uri.clone(), link);
                }
            }
        }
        for link in stopped {
            Self::stop_link(link);
        }

        Ok(spec.uris().first().cloned().unwrap_or_default())
    }

    fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::ReceiveTimeout {
                timeout_ms: timeout.as_millis(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::NotConnected("tcp subscriber".to_string()))
            }
        }
    }
}

impl TransportSubscriber for TcpSubscriber {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.topics.lock().insert(topic.to_string());
        self.broadcast_control(FRAME_SUBSCRIBE, topic);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.topics.lock().remove(topic);
        self.broadcast_control(FRAME_UNSUBSCRIBE, topic);
        Ok(())
    }
}

impl Drop for TcpSubscriber {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let links: Vec<SubLink> = {
            let mut guard = self.links.lock();
            guard.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            Self::stop_link(link);
        }
    }
}
