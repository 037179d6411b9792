//! The broker: listening socket, acceptor loop, and per-session workers
//!
//! One tokio task per accepted connection runs the frame decode loop; a
//! second per-session task owns the write half and drains a channel of
//! pre-framed bytes, so writes to one peer are serialized no matter how
//! many broadcast passes target it concurrently.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::BrokerConfig;
use crate::core::connection::Connection;
use crate::core::envelope::Envelope;
use crate::core::frame;
use crate::core::router::{BroadcastRouter, Disposition};
use crate::core::session::{create_registry, lock_registry, Registry};
use crate::error::{RelayError, Result};
use crate::event_log::{log_connection_event, ConnectionEvent};
use crate::storage::{BlobSink, DiskBlobSink};

/// Counters reported when the broker shuts down
#[derive(Debug, Clone)]
pub struct BrokerSummary {
    pub total_connections: u64,
    pub total_messages: u64,
    pub sessions_drained: usize,
}

/// The TCP message broker
pub struct ChatBroker {
    config: BrokerConfig,
    registry: Registry,
    router: Arc<BroadcastRouter>,
    shutdown_tx: watch::Sender<bool>,
    next_session_id: AtomicU64,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    local_addr: OnceLock<SocketAddr>,
    session_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChatBroker {
    /// Create a broker persisting images to the configured upload directory
    pub fn new(config: BrokerConfig) -> Self {
        let blob_sink = Arc::new(DiskBlobSink::new(config.upload_dir.clone()));
        Self::with_blob_sink(config, blob_sink)
    }

    /// Create a broker with a custom blob sink
    pub fn with_blob_sink(config: BrokerConfig, blob_sink: Arc<dyn BlobSink>) -> Self {
        let registry = create_registry();
        let router = Arc::new(BroadcastRouter::new(
            registry.clone(),
            blob_sink,
            config.bind_address(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            router,
            shutdown_tx,
            next_session_id: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            local_addr: OnceLock::new(),
            session_tasks: StdMutex::new(Vec::new()),
        }
    }

    /// The address the listener actually bound, available once `start`
    /// has bound the socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Number of currently registered sessions
    pub fn connection_count(&self) -> usize {
        lock_registry(&self.registry)
            .map(|registry| registry.client_count())
            .unwrap_or(0)
    }

    /// Bind the listening socket and accept connections until shutdown.
    ///
    /// A bind failure is fatal and returned immediately; accept failures
    /// while running are logged and the loop continues.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let bind_address = self.config.bind_address();
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|e| RelayError::Bind(format!("{}: {}", bind_address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::Bind(e.to_string()))?;
        let _ = self.local_addr.set(local_addr);

        info!("Chat relay listening on {}", local_addr);
        info!("Image upload directory: {}", self.config.upload_dir);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => Self::spawn_session(&self, stream, addr),
                        Err(e) => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Accept loop stopped");
        Ok(())
    }

    /// Drain every live session, stop the accept loop, and report counts
    pub async fn shutdown(&self) -> BrokerSummary {
        info!("Shutting down chat relay...");
        let _ = self.shutdown_tx.send(true);

        // Dropping every registered sender ends every writer task, which
        // closes the transports; read loops observe the watch signal.
        let drained = match lock_registry(&self.registry) {
            Ok(mut registry) => registry.drain(),
            Err(e) => {
                error!("Failed to lock registry during shutdown: {}", e);
                Vec::new()
            }
        };
        let sessions_drained = drained.len();
        drop(drained);

        let tasks: Vec<JoinHandle<()>> = match self.session_tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(e) => {
                error!("Failed to lock session task list during shutdown: {}", e);
                Vec::new()
            }
        };
        join_all(tasks).await;

        let summary = BrokerSummary {
            total_connections: self.total_connections.load(Ordering::SeqCst),
            total_messages: self.total_messages.load(Ordering::SeqCst),
            sessions_drained,
        };
        log_connection_event(ConnectionEvent::ServerShutdown {
            total_connections: summary.total_connections,
            total_messages: summary.total_messages,
            sessions_drained: summary.sessions_drained,
        })
        .await;
        info!(
            "Server shutdown complete: {} connections, {} messages, {} sessions drained",
            summary.total_connections, summary.total_messages, summary.sessions_drained
        );
        summary
    }

    fn spawn_session(broker: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let session_broker = Arc::clone(broker);
        let handle = tokio::spawn(async move {
            session_broker.run_session(stream, addr).await;
        });
        if let Ok(mut tasks) = broker.session_tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    /// One session's whole lifecycle: register, welcome, decode loop,
    /// teardown
    async fn run_session(&self, stream: TcpStream, addr: SocketAddr) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total_connections.fetch_add(1, Ordering::SeqCst) + 1;

        let (mut reader, writer) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();
        let writer_task = self.spawn_writer(session_id, writer, receiver);

        match lock_registry(&self.registry) {
            Ok(mut registry) => registry.add(Connection::new(session_id, addr, sender.clone())),
            Err(e) => {
                error!("Failed to register session CONN_{}: {}", session_id, e);
                return;
            }
        }

        info!("New client connection: {} -> CONN_{}", addr, session_id);
        log_connection_event(ConnectionEvent::ClientConnected {
            session_id,
            addr,
            total_connections: total,
        })
        .await;

        // The welcome goes out before any input is processed
        let welcome = Envelope::system(format!(
            "Welcome to the chat server! Current time: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        ));
        match welcome.serialize().and_then(|payload| frame::encode(&payload)) {
            Ok(frame_bytes) => {
                let _ = sender.send(frame_bytes);
            }
            Err(e) => error!("Failed to build welcome frame: {}", e),
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Wait for the first byte of the next frame under the idle
            // timeout; a timeout between frames is recoverable, and a
            // single-byte read keeps cancellation from discarding any
            // partially received length field.
            let mut first = [0u8; 1];
            let started = tokio::select! {
                result = timeout(self.config.read_timeout, reader.read(&mut first)) => result,
                _ = shutdown_rx.changed() => break,
            };
            match started {
                Err(_) => continue, // idle; check shutdown and keep waiting
                Ok(Ok(0)) => break, // peer closed
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("CONN_{}: socket read failed: {}", session_id, e);
                    break;
                }
            }

            // A frame has started; it must complete within the timeout
            let completed = timeout(
                self.config.read_timeout,
                frame::resume_frame(&mut reader, first[0], self.config.max_frame_bytes),
            )
            .await;
            let payload = match completed {
                Err(_) => {
                    warn!("CONN_{}: peer stalled mid-frame", session_id);
                    break;
                }
                Ok(Ok(payload)) => payload,
                Ok(Err(RelayError::ConnectionClosed)) => break,
                Ok(Err(RelayError::FrameTooLarge(declared))) => {
                    log_connection_event(ConnectionEvent::FrameRejected {
                        session_id,
                        declared_len: declared,
                    })
                    .await;
                    break;
                }
                Ok(Err(e)) => {
                    error!("CONN_{}: frame read failed: {}", session_id, e);
                    break;
                }
            };

            self.total_messages.fetch_add(1, Ordering::SeqCst);
            let envelope = Envelope::parse(&payload);
            match self.router.route(session_id, envelope).await {
                Ok(Disposition::Continue) => {}
                Ok(Disposition::Disconnect) => break,
                Err(e) => {
                    error!("CONN_{}: routing failed: {}", session_id, e);
                    break;
                }
            }
        }

        if let Err(e) = self.router.disconnect(session_id).await {
            error!("CONN_{}: teardown failed: {}", session_id, e);
        }

        // With the registry entry gone and this handle dropped, the writer
        // drains whatever is still queued (a farewell, a left notice for
        // others already went out) and closes the transport.
        drop(sender);
        let _ = writer_task.await;
    }

    /// The single writer for one session's transport
    fn spawn_writer(
        &self,
        session_id: u64,
        mut writer: OwnedWriteHalf,
        mut receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let write_timeout = self.config.write_timeout;
        tokio::spawn(async move {
            while let Some(frame_bytes) = receiver.recv().await {
                let delivery = timeout(write_timeout, async {
                    writer.write_all(&frame_bytes).await?;
                    writer.flush().await
                })
                .await;
                match delivery {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("CONN_{}: write failed: {}", session_id, e);
                        break;
                    }
                    Err(_) => {
                        warn!("CONN_{}: write timed out", session_id);
                        break;
                    }
                }
            }
            receiver.close();

            // A write failure can precede the read loop noticing anything;
            // whichever teardown path runs first wins, the other no-ops.
            if let Err(e) = router.disconnect(session_id).await {
                debug!("CONN_{}: writer teardown: {}", session_id, e);
            }
            let _ = writer.shutdown().await;
        })
    }
}
