use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tracing::{debug, error, info, warn};

use super::codec::{CodecRegistry, WirePayload};
use super::framing::{encode_frame, FrameAssembler, FramingError};
use super::{TransportError, TransportStats};
use crate::bus::{Bus, Route, Subscription};
use crate::config::TransportConfig;
use crate::message::Message;
use crate::queued::QueuedHandler;
use crate::recent::RecentIds;
use crate::sync::lock;

const RECEIVED_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) connections_opened: AtomicU64,
    pub(crate) connect_failures: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) filtered: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) encode_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the server and the client: bus subscriptions, the live
/// connections and the echo filter.
pub(crate) struct TransportCore {
    role: &'static str,
    bus: Bus,
    codecs: Arc<CodecRegistry>,
    config: TransportConfig,
    inbound: HashSet<String>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    received: Mutex<RecentIds<()>>,
    next_connection: AtomicU64,
    closing: AtomicBool,
    pub(crate) counters: Arc<Counters>,
}

impl TransportCore {
    pub(crate) fn new(
        role: &'static str,
        bus: Bus,
        codecs: Arc<CodecRegistry>,
        config: TransportConfig,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            role,
            inbound: config.inbound.iter().cloned().collect(),
            bus,
            codecs,
            config,
            connections: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            received: Mutex::new(RecentIds::with_capacity(RECEIVED_CAPACITY)),
            next_connection: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        });
        core.subscribe_outbound();
        core
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn role(&self) -> &'static str {
        self.role
    }

    fn subscribe_outbound(self: &Arc<Self>) {
        let registry = self.bus.registry();
        let mut subscriptions = lock(&self.subscriptions);

        for name in &self.config.outbound {
            let Some(tag) = registry.tag_by_name(name) else {
                warn!(
                    role = self.role,
                    type_name = %name,
                    "outbound type is not registered; register its codec before starting the transport"
                );
                continue;
            };
            if !self.codecs.knows(name) {
                warn!(role = self.role, type_name = %name, "outbound type has no codec");
            }

            let core: Weak<TransportCore> = Arc::downgrade(self);
            let route: Route = Arc::new(move |message: &Arc<dyn Message>| {
                if let Some(core) = core.upgrade() {
                    core.forward(message);
                }
            });
            subscriptions.push(self.bus.subscribe_tag(tag, route));
            debug!(role = self.role, type_name = %name, "forwarding to peers");
        }
    }

    /// Hand a local message to every connection's writer.
    fn forward(&self, message: &Arc<dyn Message>) {
        if lock(&self.received).contains(&message.id()) {
            return;
        }
        let connections: Vec<Arc<Connection>> = lock(&self.connections).values().cloned().collect();
        for connection in connections {
            connection.outbound.enqueue(Arc::clone(message));
        }
    }

    /// Whether `type_name` or any of its ancestors is allowed in.
    fn admits(&self, type_name: &str) -> bool {
        if self.inbound.contains(type_name) {
            return true;
        }
        let registry = self.bus.registry();
        registry
            .tag_by_name(type_name)
            .map(|tag| {
                registry
                    .lineage_names(tag)
                    .iter()
                    .any(|name| self.inbound.contains(*name))
            })
            .unwrap_or(false)
    }

    fn accept_frame(&self, frame: &[u8], inbound: &QueuedHandler<dyn Message>) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

        let payload = match WirePayload::from_bytes(frame) {
            Ok(payload) => payload,
            Err(err) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(role = self.role, error = %err, "dropping undecodable frame");
                return;
            }
        };

        if !self.admits(&payload.type_name) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            debug!(role = self.role, type_name = %payload.type_name, "inbound type not allowed; dropped");
            return;
        }

        let message = match self.codecs.decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(role = self.role, type_name = %payload.type_name, error = %err, "dropping frame");
                return;
            }
        };

        lock(&self.received).insert(message.id(), ());
        inbound.enqueue(message);
    }

    /// Wrap an established stream. The returned reader half is for
    /// [`Connection::serve`].
    pub(crate) fn open(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(Arc<Connection>, TcpStream), TransportError> {
        if self.closing.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(TransportError::Closed);
        }

        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(self, id, peer, stream, writer)?);

        lock(&self.connections).insert(id, Arc::clone(&connection));
        self.counters.connections_opened.fetch_add(1, Ordering::Relaxed);
        info!(role = self.role, connection = id, %peer, "connection established");

        // Lost a race with close_all.
        if self.closing.load(Ordering::SeqCst) {
            connection.close();
            self.forget(id);
            return Err(TransportError::Closed);
        }

        Ok((connection, reader))
    }

    pub(crate) fn forget(&self, id: u64) {
        lock(&self.connections).remove(&id);
    }

    pub(crate) fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub(crate) fn close_all(&self) {
        self.closing.store(true, Ordering::SeqCst);
        for subscription in lock(&self.subscriptions).drain(..) {
            self.bus.unsubscribe(&subscription);
        }
        let connections: Vec<Arc<Connection>> = lock(&self.connections).values().cloned().collect();
        for connection in connections {
            connection.close();
        }
    }

    pub(crate) fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

/// One live peer: a reader loop plus two queued handlers.
///
/// ```text
/// socket ─► reader ─► FrameAssembler ─► filter ─► inbound queue ─► bus
/// bus ─► outbound route ─► outbound queue ─► encode + frame ─► socket
/// ```
pub(crate) struct Connection {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    outbound: QueuedHandler<dyn Message>,
    inbound: QueuedHandler<dyn Message>,
    closed: AtomicBool,
}

impl Connection {
    fn new(
        core: &Arc<TransportCore>,
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        mut writer: TcpStream,
    ) -> Result<Self, TransportError> {
        let role = core.role;
        let queue_config = core.config.queue.clone();

        let codecs = Arc::clone(&core.codecs);
        let max_frame_len = core.config.max_frame_len;
        let counters = Arc::clone(&core.counters);
        let outbound = QueuedHandler::spawn(
            format!("{role}-{id}-out"),
            queue_config.clone(),
            move |message: Arc<dyn Message>| {
                match write_message(&codecs, &mut writer, message.as_ref(), max_frame_len) {
                    Ok(()) => {
                        counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TransportError::Io(err)) => {
                        warn!(role, connection = id, error = %err, "write failed; closing connection");
                        let _ = writer.shutdown(Shutdown::Both);
                    }
                    Err(err) => {
                        counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(role, connection = id, type_name = message.type_name(), error = %err, "message not sent");
                    }
                }
            },
        )?;

        let bus = core.bus.clone();
        let inbound = QueuedHandler::spawn(
            format!("{role}-{id}-in"),
            queue_config,
            move |message: Arc<dyn Message>| {
                bus.publish_arc(message);
            },
        )?;

        Ok(Self {
            id,
            peer,
            stream,
            outbound,
            inbound,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Read until the peer goes away, a protocol violation, or
    /// [`close`](Self::close). Blocks the calling thread.
    pub(crate) fn serve(&self, core: &TransportCore, mut reader: TcpStream) {
        let config = core.config();
        let mut assembler = FrameAssembler::new(config.max_frame_len);
        let mut buffer = vec![0u8; config.read_buffer_size.max(1)];

        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!(role = core.role, connection = self.id, "peer closed the connection");
                    break;
                }
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        warn!(role = core.role, connection = self.id, error = %err, "read failed");
                    }
                    break;
                }
            };

            if let Ok(frames) = assembler.push(&buffer[..read]) {
                for frame in frames {
                    core.accept_frame(&frame, &self.inbound);
                }
            }
            if let Some(err) = assembler.violation() {
                error!(role = core.role, connection = self.id, error = %err, "protocol violation; closing connection");
                break;
            }
        }

        self.close();
        core.forget(self.id);
        info!(role = core.role, connection = self.id, peer = %self.peer, "connection closed");
    }

    /// Shut the socket and stop both queues. Frames already read are
    /// still published; pending writes are abandoned.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.outbound.abort();
        self.inbound.request_stop();
    }

    /// Run [`serve`](Self::serve) on its own thread.
    pub(crate) fn spawn_reader(
        self: &Arc<Self>,
        core: &Arc<TransportCore>,
        reader: TcpStream,
    ) -> Result<(), TransportError> {
        let connection = Arc::clone(self);
        let core = Arc::clone(core);
        thread::Builder::new()
            .name(format!("{}-{}-read", core.role, self.id))
            .spawn(move || connection.serve(&core, reader))
            .map(|_| ())
            .map_err(|source| TransportError::Spawn {
                what: "connection reader",
                source,
            })
    }
}

fn write_message(
    codecs: &CodecRegistry,
    writer: &mut TcpStream,
    message: &dyn Message,
    max_frame_len: usize,
) -> Result<(), TransportError> {
    let bytes = codecs.encode(message)?.to_bytes()?;
    if bytes.len() > max_frame_len {
        return Err(FramingError::TooLarge {
            len: bytes.len(),
            max: max_frame_len,
        }
        .into());
    }
    let frame = encode_frame(&bytes)?;
    writer.write_all(&frame)?;
    Ok(())
}
