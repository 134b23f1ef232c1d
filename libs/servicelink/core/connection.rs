//! One multiplexed WebSocket link to one relay endpoint.
//!
//! A [`ServiceConnection`] owns exactly two tasks: a reader that decodes
//! inbound frames and hands them to the dispatcher, and a single writer that
//! drains a bounded queue (serialized writes, backpressure by awaiting the
//! enqueue). The connection never reconnects itself; when either task exits
//! it marks itself disconnected and fires its cancellation token so the
//! owning container can decide what to do.

use super::config::ContainerConfig;
use super::dispatcher::{DispatchContext, MessageDispatcher};
use crate::endpoint::Endpoint;
use crate::protocol::codec::ServiceCodec;
use crate::protocol::message::{HandshakeError, HandshakeErrorKind, ServiceEnvelope, ServiceMessage};
use crate::traits::error::{Result, ServiceLinkError};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle state of one physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
}

struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn get(&self) -> ConnectionStatus {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionStatus::Connecting,
            1 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    fn set(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Transport knobs one connection needs, extracted from the container config
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub protocol_version: i32,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub stale_timeout: Duration,
    pub outbound_queue_size: usize,
    pub max_frame_size: usize,
}

impl From<&ContainerConfig> for ConnectionSettings {
    fn from(config: &ContainerConfig) -> Self {
        Self {
            protocol_version: config.protocol_version,
            handshake_timeout: config.handshake_timeout,
            keepalive_interval: config.keepalive_interval,
            stale_timeout: config.stale_timeout,
            outbound_queue_size: config.outbound_queue_size,
            max_frame_size: config.max_frame_size,
        }
    }
}

pub struct ServiceConnection {
    id: String,
    endpoint: Arc<Endpoint>,
    status: StatusCell,
    outbound: mpsc::Sender<ServiceEnvelope>,
    cancel: CancellationToken,
    last_inbound: Mutex<Instant>,
}

impl ServiceConnection {
    /// Connect, authenticate and handshake with the endpoint, then start the
    /// reader and writer tasks.
    ///
    /// Fails without side effects: no tasks are left behind on any error
    /// path. Version mismatch and credential rejection come back as
    /// non-retryable errors so the container stops retrying them.
    pub async fn establish(
        id: String,
        endpoint: Arc<Endpoint>,
        settings: ConnectionSettings,
        dispatcher: Arc<MessageDispatcher>,
        dispatch_ctx: DispatchContext,
    ) -> Result<Arc<Self>> {
        let url = endpoint.server_url();
        let token = endpoint.credential().access_token(&url).await?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ServiceLinkError::Configuration(format!("bad endpoint url {}: {}", url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ServiceLinkError::Configuration(format!("credential not header-safe: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(connection = %id, url = %url, "connecting");
        let (mut ws, _response) = connect_async(request)
            .await
            .map_err(|e| ServiceLinkError::Transport(format!("connect to {} failed: {}", url, e)))?;

        let codec = ServiceCodec::new(settings.max_frame_size);
        handshake(&mut ws, &codec, &settings).await?;
        info!(connection = %id, endpoint = %endpoint.name(), "handshake complete");

        let (outbound, outbound_rx) = mpsc::channel(settings.outbound_queue_size);
        let connection = Arc::new(Self {
            id,
            endpoint,
            status: StatusCell::new(ConnectionStatus::Connected),
            outbound,
            cancel: CancellationToken::new(),
            last_inbound: Mutex::new(Instant::now()),
        });

        let (sink, stream) = ws.split();
        tokio::spawn(write_loop(
            connection.clone(),
            sink,
            outbound_rx,
            codec.clone(),
            settings.clone(),
        ));
        tokio::spawn(read_loop(
            connection.clone(),
            stream,
            codec,
            dispatcher,
            dispatch_ctx,
        ));

        Ok(connection)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn is_connected(&self) -> bool {
        self.status.get() == ConnectionStatus::Connected
    }

    /// Enqueue an envelope for the writer task.
    ///
    /// Awaits when the queue is full, which is the backpressure mechanism:
    /// a slow socket slows its producers instead of growing a buffer.
    pub async fn write(&self, envelope: ServiceEnvelope) -> Result<()> {
        if !self.is_connected() {
            return Err(ServiceLinkError::ConnectionClosed(format!(
                "connection {} is not connected",
                self.id
            )));
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ServiceLinkError::ChannelClosed(format!("connection {} writer gone", self.id)))
    }

    /// Tear the connection down; idempotent
    pub fn stop(&self) {
        self.mark_disconnected();
    }

    /// Resolves once the connection is fully torn down
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    fn mark_disconnected(&self) {
        self.status.set(ConnectionStatus::Disconnected);
        self.cancel.cancel();
    }

    fn touch_inbound(&self) {
        *self.last_inbound.lock() = Instant::now();
    }

    fn inbound_age(&self) -> Duration {
        self.last_inbound.lock().elapsed()
    }
}

/// Send the version request and wait (bounded) for the service's verdict
async fn handshake(ws: &mut WsStream, codec: &ServiceCodec, settings: &ConnectionSettings) -> Result<()> {
    let request = ServiceEnvelope::new(ServiceMessage::HandshakeRequest {
        version: settings.protocol_version,
    });
    let mut buf = BytesMut::new();
    codec.encode(&request, &mut buf)?;
    ws.send(Message::Binary(buf.to_vec()))
        .await
        .map_err(|e| ServiceLinkError::Transport(format!("handshake send failed: {}", e)))?;

    let verdict = tokio::time::timeout(settings.handshake_timeout, read_handshake_response(ws, codec))
        .await
        .map_err(|_| {
            ServiceLinkError::Timeout(format!(
                "no handshake response within {:?}",
                settings.handshake_timeout
            ))
        })??;

    match verdict {
        None => Ok(()),
        Some(HandshakeError { kind, message }) => Err(match kind {
            HandshakeErrorKind::VersionNotSupported => ServiceLinkError::ProtocolVersionNotSupported {
                requested: settings.protocol_version,
                message,
            },
            HandshakeErrorKind::Unauthorized => ServiceLinkError::Unauthorized(message),
            HandshakeErrorKind::Other => ServiceLinkError::Handshake(message),
        }),
    }
}

async fn read_handshake_response(
    ws: &mut WsStream,
    codec: &ServiceCodec,
) -> Result<Option<HandshakeError>> {
    let mut buffer = BytesMut::new();
    loop {
        let frame = ws.next().await.ok_or_else(|| {
            ServiceLinkError::ConnectionClosed("socket closed during handshake".into())
        })?;
        let message = frame.map_err(|e| ServiceLinkError::Transport(e.to_string()))?;
        let data = match message {
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                return Err(ServiceLinkError::ConnectionClosed(
                    "socket closed during handshake".into(),
                ))
            }
            other => {
                return Err(ServiceLinkError::Protocol(format!(
                    "unexpected {:?} frame during handshake",
                    other
                )))
            }
        };
        buffer.extend_from_slice(&data);
        if let Some(envelope) = codec.decode(&mut buffer)? {
            return match envelope.message {
                ServiceMessage::HandshakeResponse { error } => Ok(error),
                other => Err(ServiceLinkError::Protocol(format!(
                    "expected handshake response, got {}",
                    other.kind()
                ))),
            };
        }
    }
}

/// Single writer: drains the outbound queue and owns the keepalive timer
async fn write_loop(
    connection: Arc<ServiceConnection>,
    mut sink: futures::stream::SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::Receiver<ServiceEnvelope>,
    codec: ServiceCodec,
    settings: ConnectionSettings,
) {
    let mut keepalive = tokio::time::interval(settings.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = connection.cancel.cancelled() => break,

            _ = keepalive.tick() => {
                if connection.inbound_age() > settings.stale_timeout {
                    warn!(
                        connection = %connection.id,
                        age = ?connection.inbound_age(),
                        "no inbound traffic, considering connection dead"
                    );
                    break;
                }
                let ping = ServiceEnvelope::new(ServiceMessage::Ping);
                let mut buf = BytesMut::new();
                if codec.encode(&ping, &mut buf).is_ok() {
                    if let Err(e) = sink.send(Message::Binary(buf.to_vec())).await {
                        warn!(connection = %connection.id, "keepalive send failed: {}", e);
                        break;
                    }
                }
            }

            maybe = outbound_rx.recv() => {
                let Some(envelope) = maybe else { break };
                let mut buf = BytesMut::with_capacity(64);
                match codec.encode(&envelope, &mut buf) {
                    Ok(()) => {
                        if let Err(e) = sink.send(Message::Binary(buf.to_vec())).await {
                            warn!(connection = %connection.id, "send failed: {}", e);
                            break;
                        }
                    }
                    // An oversized frame fails that frame only, not the link
                    Err(e) => warn!(connection = %connection.id, "dropping frame: {}", e),
                }
            }
        }
    }

    let _ = sink.close().await;
    connection.mark_disconnected();
    debug!(connection = %connection.id, "writer stopped");
}

/// Reader: accumulates socket chunks, decodes frames, dispatches them
async fn read_loop(
    connection: Arc<ServiceConnection>,
    mut stream: futures::stream::SplitStream<WsStream>,
    codec: ServiceCodec,
    dispatcher: Arc<MessageDispatcher>,
    ctx: DispatchContext,
) {
    let mut buffer = BytesMut::new();

    'read: loop {
        tokio::select! {
            _ = connection.cancel.cancelled() => break 'read,

            frame = stream.next() => {
                let Some(frame) = frame else {
                    info!(connection = %connection.id, "socket closed by peer");
                    break 'read;
                };
                let message = match frame {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(connection = %connection.id, "read error: {}", e);
                        break 'read;
                    }
                };
                connection.touch_inbound();
                let data = match message {
                    Message::Binary(data) => data,
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        info!(connection = %connection.id, "close frame received");
                        break 'read;
                    }
                    other => {
                        warn!(connection = %connection.id, "ignoring non-binary frame: {:?}", other);
                        continue;
                    }
                };

                buffer.extend_from_slice(&data);
                loop {
                    match codec.decode(&mut buffer) {
                        Ok(Some(envelope)) => {
                            match dispatcher.dispatch(envelope, &ctx).await {
                                Ok(Some(reply)) => {
                                    if connection.outbound.send(reply).await.is_err() {
                                        break 'read;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(connection = %connection.id, "dispatch failed: {}", e)
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // A corrupt stream cannot be resynchronized
                            error!(connection = %connection.id, "protocol violation: {}", e);
                            break 'read;
                        }
                    }
                }
            }
        }
    }

    connection.mark_disconnected();
    debug!(connection = %connection.id, "reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_round_trips() {
        let cell = StatusCell::new(ConnectionStatus::Connecting);
        assert_eq!(cell.get(), ConnectionStatus::Connecting);
        cell.set(ConnectionStatus::Connected);
        assert_eq!(cell.get(), ConnectionStatus::Connected);
        cell.set(ConnectionStatus::Disconnected);
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn settings_derive_from_container_config() {
        let config = ContainerConfig::default();
        let settings = ConnectionSettings::from(&config);
        assert_eq!(settings.protocol_version, config.protocol_version);
        assert_eq!(settings.outbound_queue_size, config.outbound_queue_size);
    }
}
