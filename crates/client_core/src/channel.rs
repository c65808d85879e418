use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::UserId,
    protocol::{InboundEvent, OutboundEvent},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ChannelError;

/// The bidirectional push channel, independent of any transport. The
/// adapter owns (re)connection and user registration; callers only see
/// typed events.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Emits one event. At-most-once: an event accepted while the
    /// connection is going down may be lost and is never retried.
    async fn send(&self, event: OutboundEvent) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<InboundEvent>;
    async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Full `ws://` or `wss://` endpoint.
    pub endpoint: String,
    pub reconnect_delay: Duration,
    pub inbound_buffer: usize,
    pub outbound_buffer: usize,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect_delay: Duration::from_secs(3),
            inbound_buffer: 256,
            outbound_buffer: 64,
        }
    }

    /// Derives the websocket endpoint from the REST base url, so hosts
    /// configure one server address and get both surfaces from it.
    pub fn from_server_url(server_url: &str) -> Result<Self, ChannelError> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(ChannelError::InvalidEndpoint(server_url.to_string()));
        };
        Ok(Self::new(format!("{}/ws", ws_url.trim_end_matches('/'))))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// tokio-tungstenite implementation of [`EventChannel`].
///
/// A background task owns the connection: it registers the user on
/// every successful (re)connection, decodes inbound frames into typed
/// events, and forwards queued outbound events. Nothing is buffered
/// across a disconnect; `send` fails while the connection is down and
/// events caught mid-teardown are dropped with a warning.
pub struct WebSocketEventChannel {
    outbound_tx: mpsc::Sender<OutboundEvent>,
    inbound_tx: broadcast::Sender<InboundEvent>,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketEventChannel {
    /// Establishes the initial connection. Later disconnects are
    /// retried internally with `reconnect_delay` between attempts; only
    /// the first connection failure is surfaced to the caller.
    pub async fn connect(config: ChannelConfig, user_id: UserId) -> Result<Arc<Self>> {
        let url = Url::parse(&config.endpoint)
            .map_err(|_| ChannelError::InvalidEndpoint(config.endpoint.clone()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChannelError::InvalidEndpoint(config.endpoint.clone()).into());
        }

        let (stream, _) = connect_async(config.endpoint.as_str())
            .await
            .with_context(|| format!("failed to connect event channel: {}", config.endpoint))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer);
        let (inbound_tx, _) = broadcast::channel(config.inbound_buffer);
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_connection(
            stream,
            config,
            user_id,
            outbound_rx,
            inbound_tx.clone(),
            Arc::clone(&connected),
        ));

        Ok(Arc::new(Self {
            outbound_tx,
            inbound_tx,
            connected,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventChannel for WebSocketEventChannel {
    async fn send(&self, event: OutboundEvent) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected.into());
        }
        self.outbound_tx
            .send(event)
            .await
            .map_err(|_| ChannelError::Closed)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inbound_tx.subscribe()
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

enum PumpExit {
    Disconnected,
    Shutdown,
}

async fn run_connection(
    stream: WsStream,
    config: ChannelConfig,
    user_id: UserId,
    mut outbound_rx: mpsc::Receiver<OutboundEvent>,
    inbound_tx: broadcast::Sender<InboundEvent>,
    connected: Arc<AtomicBool>,
) {
    let (mut sink, mut reader) = stream.split();
    loop {
        match register(&mut sink, user_id).await {
            Ok(()) => {
                connected.store(true, Ordering::SeqCst);
                info!(user_id = user_id.0, "channel: connected and registered");
                let exit = pump(&mut sink, &mut reader, &mut outbound_rx, &inbound_tx).await;
                connected.store(false, Ordering::SeqCst);
                if let PumpExit::Shutdown = exit {
                    return;
                }
            }
            Err(err) => {
                connected.store(false, Ordering::SeqCst);
                warn!("channel: registration failed: {err}");
            }
        }

        // at-most-once: anything queued while the connection dropped is
        // lost, not replayed on the next connection
        let mut dropped = 0usize;
        while outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "channel: discarded outbound events queued across disconnect");
        }

        loop {
            tokio::time::sleep(config.reconnect_delay).await;
            match connect_async(config.endpoint.as_str()).await {
                Ok((stream, _)) => {
                    (sink, reader) = stream.split();
                    break;
                }
                Err(err) => {
                    debug!("channel: reconnect attempt failed: {err}");
                }
            }
        }
    }
}

async fn register(sink: &mut WsSink, user_id: UserId) -> Result<()> {
    let frame = OutboundEvent::RegisterUser { user_id }.encode()?;
    sink.send(WsMessage::Text(frame)).await?;
    Ok(())
}

async fn pump(
    sink: &mut WsSink,
    reader: &mut WsReader,
    outbound_rx: &mut mpsc::Receiver<OutboundEvent>,
    inbound_tx: &broadcast::Sender<InboundEvent>,
) -> PumpExit {
    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match InboundEvent::decode(&text) {
                    Ok(event) => {
                        let _ = inbound_tx.send(event);
                    }
                    Err(err) => debug!("channel: dropping unrecognized frame: {err}"),
                },
                Some(Ok(WsMessage::Close(_))) | None => return PumpExit::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("channel: receive failed: {err}");
                    return PumpExit::Disconnected;
                }
            },
            event = outbound_rx.recv() => match event {
                Some(event) => {
                    let frame = match event.encode() {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!("channel: failed to encode outbound event: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(WsMessage::Text(frame)).await {
                        warn!("channel: send failed: {err}");
                        return PumpExit::Disconnected;
                    }
                }
                None => return PumpExit::Shutdown,
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
