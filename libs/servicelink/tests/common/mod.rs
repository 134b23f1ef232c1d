//! Common test utilities for servicelink integration tests
//!
//! Provides a mock relay server that speaks the binary service protocol.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use servicelink::protocol::{HandshakeError, ServiceCodec, ServiceEnvelope, ServiceMessage};
use servicelink::registry::ClientConnectionContext;
use servicelink::traits::dispatch::HubDispatcher;
use servicelink::traits::error::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, Notify};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// A mock relay server speaking the binary service protocol
pub struct MockRelayServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    kick: Arc<Notify>,
    inject: broadcast::Sender<ServiceEnvelope>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<ServiceEnvelope>>,
    handshakes: Arc<AtomicUsize>,
}

impl MockRelayServer {
    /// Start a server that accepts every handshake
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Start a server that answers every handshake with the given verdict
    pub async fn start_with(handshake_error: Option<HandshakeError>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let kick = Arc::new(Notify::new());
        let (inject, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let handshakes = Arc::new(AtomicUsize::new(0));

        let shutdown_accept = shutdown.clone();
        let kick_accept = kick.clone();
        let inject_accept = inject.clone();
        let handshakes_accept = handshakes.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        let handshake_error = handshake_error.clone();
                        let inbound = inbound_tx.clone();
                        let inject_rx = inject_accept.subscribe();
                        let kick = kick_accept.clone();
                        let handshakes = handshakes_accept.clone();
                        tokio::spawn(async move {
                            handle_connection(
                                stream,
                                handshake_error,
                                inbound,
                                inject_rx,
                                kick,
                                handshakes,
                            )
                            .await;
                        });
                    }
                    _ = shutdown_accept.notified() => break,
                }
            }
        });

        Self {
            addr,
            shutdown,
            kick,
            inject,
            inbound: AsyncMutex::new(inbound_rx),
            handshakes,
        }
    }

    /// HTTP base URL for building an [`servicelink::Endpoint`]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of completed protocol handshakes so far
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::Acquire)
    }

    /// Push a service frame to every connected gateway connection
    pub fn send(&self, message: ServiceMessage) {
        let _ = self.inject.send(ServiceEnvelope::new(message));
    }

    /// Next non-ping frame the server received from the gateway
    pub async fn recv(&self) -> Option<ServiceEnvelope> {
        let mut inbound = self.inbound.lock().await;
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
                .await
                .ok()??;
            if !matches!(envelope.message, ServiceMessage::Ping) {
                return Some(envelope);
            }
        }
    }

    /// Drop every open connection without stopping the listener
    pub fn drop_connections(&self) {
        self.kick.notify_waiters();
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
        self.kick.notify_waiters();
    }
}

impl Drop for MockRelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(
    stream: TcpStream,
    handshake_error: Option<HandshakeError>,
    inbound: mpsc::UnboundedSender<ServiceEnvelope>,
    mut inject_rx: broadcast::Receiver<ServiceEnvelope>,
    kick: Arc<Notify>,
    handshakes: Arc<AtomicUsize>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let codec = ServiceCodec::default();
    let mut buffer = BytesMut::new();
    let mut reject = false;

    'conn: loop {
        tokio::select! {
            msg = read.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break 'conn,
                    Some(Ok(_)) => continue,
                };
                buffer.extend_from_slice(&data);
                while let Ok(Some(envelope)) = codec.decode(&mut buffer) {
                    if let ServiceMessage::HandshakeRequest { .. } = envelope.message {
                        let response = ServiceEnvelope::new(ServiceMessage::HandshakeResponse {
                            error: handshake_error.clone(),
                        });
                        let mut out = BytesMut::new();
                        codec.encode(&response, &mut out).unwrap();
                        if write.send(Message::Binary(out.to_vec())).await.is_err() {
                            break 'conn;
                        }
                        if handshake_error.is_some() {
                            reject = true;
                        } else {
                            handshakes.fetch_add(1, Ordering::AcqRel);
                        }
                        continue;
                    }
                    let _ = inbound.send(envelope);
                }
                if reject {
                    break 'conn;
                }
            }
            envelope = inject_rx.recv() => {
                let envelope = match envelope {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break 'conn,
                };
                let mut out = BytesMut::new();
                codec.encode(&envelope, &mut out).unwrap();
                if write.send(Message::Binary(out.to_vec())).await.is_err() {
                    break 'conn;
                }
            }
            _ = kick.notified() => break 'conn,
        }
    }
}

/// A listener that accepts and immediately drops every TCP connection,
/// counting the attempts. Connecting to it fails fast and retryably.
pub struct RefusingServer {
    pub addr: SocketAddr,
    attempts: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
}

impl RefusingServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(Notify::new());

        let attempts_accept = attempts.clone();
        let shutdown_accept = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        attempts_accept.fetch_add(1, Ordering::AcqRel);
                        drop(stream);
                    }
                    _ = shutdown_accept.notified() => break,
                }
            }
        });

        Self {
            addr,
            attempts,
            shutdown,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

impl Drop for RefusingServer {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

/// Hub that records every callback for later assertions
#[derive(Default)]
pub struct RecordingHub {
    events: Mutex<Vec<String>>,
}

impl RecordingHub {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn has_event(&self, needle: &str) -> bool {
        self.events.lock().iter().any(|e| e.contains(needle))
    }
}

#[async_trait]
impl HubDispatcher for RecordingHub {
    async fn on_client_connected(&self, ctx: Arc<ClientConnectionContext>) -> Result<()> {
        self.events
            .lock()
            .push(format!("connected:{}", ctx.connection_id()));
        Ok(())
    }

    async fn on_client_disconnected(
        &self,
        connection_id: &str,
        _error: Option<String>,
    ) -> Result<()> {
        self.events
            .lock()
            .push(format!("disconnected:{}", connection_id));
        Ok(())
    }

    async fn on_client_message(&self, connection_id: &str, payload: Bytes) -> Result<()> {
        self.events.lock().push(format!(
            "message:{}:{}",
            connection_id,
            String::from_utf8_lossy(&payload)
        ));
        Ok(())
    }

    async fn on_clients_migrated(&self, connection_ids: &[String], from_slot: usize, to_slot: usize) {
        self.events.lock().push(format!(
            "migrated:{}:{}->{}",
            connection_ids.len(),
            from_slot,
            to_slot
        ));
    }
}

/// Poll until `condition` holds or two seconds elapse
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
