use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::mpsc::{self, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::codec::CodecRegistry;
use super::connection::TransportCore;
use super::{TransportError, TransportStats};
use crate::bus::Bus;
use crate::config::TransportConfig;

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// Listens for peers and bridges each one to the local bus.
///
/// # Example
///
/// ```ignore
/// let codecs = Arc::new(CodecRegistry::for_bus(&bus)?);
/// codecs.register::<PlaceOrder>()?;
///
/// let server = TcpBusServer::bind(
///     bus.clone(),
///     codecs,
///     TransportConfig::new("127.0.0.1:0")
///         .with_inbound(["orders.PlaceOrder"])
///         .with_outbound(["courier.CommandResponse"]),
/// )?;
/// println!("listening on {}", server.local_addr());
/// ```
pub struct TcpBusServer {
    core: Arc<TransportCore>,
    local_addr: SocketAddr,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TcpBusServer {
    pub fn bind(
        bus: Bus,
        codecs: Arc<CodecRegistry>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let address = resolve(&config.address)?;
        let listener = TcpListener::bind(address).map_err(|source| TransportError::Bind {
            address: config.address.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let thread_name = format!("{}-accept", bus.name());
        let core = TransportCore::new("server", bus, codecs, config);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let accept_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                loop {
                    match stop_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }

                    match listener.accept() {
                        Ok((stream, peer)) => {
                            if let Err(err) = accept(&accept_core, stream, peer) {
                                warn!(%peer, error = %err, "failed to set up connection");
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
                debug!("accept loop stopped");
            })
            .map_err(|source| TransportError::Spawn {
                what: "accept loop",
                source,
            })?;

        info!(%local_addr, "bus server listening");
        Ok(Self {
            core,
            local_addr,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// The bound address; resolves port `0` to the real port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }

    /// Poll until at least `count` peers are connected.
    pub fn wait_connections(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.connection_count() >= count)
    }

    pub fn stats(&self) -> TransportStats {
        self.core.stats()
    }

    /// Stop accepting, close every connection and return final counters.
    pub fn shutdown(mut self) -> TransportStats {
        self.stop();
        self.core.stats()
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.core.close_all();
    }
}

impl Drop for TcpBusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TcpBusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpBusServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn accept(
    core: &Arc<TransportCore>,
    stream: std::net::TcpStream,
    peer: SocketAddr,
) -> Result<(), TransportError> {
    stream.set_nonblocking(false)?;
    let (connection, reader) = core.open(stream, peer)?;
    debug!(role = core.role(), connection = connection.id(), "starting reader");
    if let Err(err) = connection.spawn_reader(core, reader) {
        connection.close();
        core.forget(connection.id());
        return Err(err);
    }
    Ok(())
}

pub(crate) fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
    let invalid = |source| TransportError::Address {
        address: address.to_string(),
        source,
    };
    address
        .to_socket_addrs()
        .map_err(invalid)?
        .next()
        .ok_or_else(|| {
            invalid(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "address resolved to nothing",
            ))
        })
}

pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
