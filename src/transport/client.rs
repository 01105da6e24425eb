use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::codec::CodecRegistry;
use super::connection::TransportCore;
use super::server::{resolve, wait_until};
use super::{TransportError, TransportStats};
use crate::bus::Bus;
use crate::config::TransportConfig;

/// Keeps one connection to a [`TcpBusServer`](super::TcpBusServer) alive,
/// reconnecting with jittered exponential backoff whenever it drops.
///
/// Messages published locally while disconnected are not buffered.
pub struct TcpBusClient {
    core: Arc<TransportCore>,
    server: SocketAddr,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TcpBusClient {
    /// Resolve the server address and start the supervisor thread. Returns
    /// immediately; use [`wait_connected`](Self::wait_connected) to block
    /// until the first connection is up.
    pub fn connect(
        bus: Bus,
        codecs: Arc<CodecRegistry>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let server = resolve(&config.address)?;
        let thread_name = format!("{}-client", bus.name());
        let core = TransportCore::new("client", bus, codecs, config);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let supervisor_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || supervise(&supervisor_core, server, &stop_rx))
            .map_err(|source| TransportError::Spawn {
                what: "client supervisor",
                source,
            })?;

        Ok(Self {
            core,
            server,
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn is_connected(&self) -> bool {
        self.core.connection_count() > 0
    }

    pub fn wait_connected(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.is_connected())
    }

    pub fn stats(&self) -> TransportStats {
        self.core.stats()
    }

    /// Disconnect, stop reconnecting and return final counters.
    pub fn shutdown(mut self) -> TransportStats {
        self.stop();
        self.core.stats()
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        self.core.close_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpBusClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TcpBusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpBusClient")
            .field("server", &self.server)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn supervise(core: &Arc<TransportCore>, server: SocketAddr, stop_rx: &Receiver<()>) {
    let mut backoff = Backoff::new(&core.config().backoff);
    let connect_timeout = core.config().connect_timeout();

    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match TcpStream::connect_timeout(&server, connect_timeout) {
            Ok(stream) => match core.open(stream, server) {
                Ok((connection, reader)) => {
                    backoff.reset();
                    connection.serve(core, reader);
                    info!(%server, connection = connection.id(), "disconnected from server");
                }
                Err(TransportError::Closed) => break,
                Err(err) => warn!(%server, error = %err, "failed to set up connection"),
            },
            Err(err) => {
                core.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%server, error = %err, "connect failed");
            }
        }

        let delay = backoff.next_duration();
        debug!(%server, delay_ms = delay.as_millis() as u64, "reconnecting");
        match stop_rx.recv_timeout(delay) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    debug!(%server, "client supervisor stopped");
}
