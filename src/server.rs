//! WebSocket endpoint subscribers connect to. Each accepted connection is
//! registered with the `Hub` and removed again when it closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::{DeliveryError, Endpoint, Hub, SubscriberId};
use crate::signal::{StatusBus, StatusEvent};


type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub struct WsEndpoint {
    sink: Mutex<WsSink>,
    send_timeout: Duration,
}

impl WsEndpoint {
    pub fn new(sink: WsSink, send_timeout: Duration) -> Self {
        WsEndpoint {
            sink: Mutex::new(sink),
            send_timeout,
        }
    }
}

#[async_trait]
impl Endpoint for WsEndpoint {
    async fn send(&self, payload: &str) -> Result<(), DeliveryError> {
        let mut sink = self.sink.lock().await;
        let sent = tokio::time::timeout(self.send_timeout, sink.send(Message::text(payload.to_owned()))).await;

        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Err(DeliveryError::Closed),
            Ok(Err(err)) => Err(DeliveryError::Transport(err.to_string())),
            Err(_elapsed) => Err(DeliveryError::TimedOut),
        }
    }
}


pub struct SubscriberServer {
    listener: TcpListener,
    hub: Arc<Hub>,
    bus: StatusBus,
    send_timeout: Duration,
}

impl SubscriberServer {
    pub async fn bind(addr: &str, hub: Arc<Hub>, bus: StatusBus, send_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding subscriber server to {addr}"))?;

        Ok(SubscriberServer {
            listener,
            hub,
            bus,
            send_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts subscribers until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "subscriber server listening");
            self.bus.emit(StatusEvent::Listening { addr });
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_subscriber(
                        stream,
                        peer,
                        Arc::clone(&self.hub),
                        self.bus.clone(),
                        self.send_timeout,
                        cancel.child_token(),
                    ));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }

        info!("subscriber server stopped");
    }
}

async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    bus: StatusBus,
    send_timeout: Duration,
    cancel: CancellationToken,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(%peer, error = %err, "websocket handshake failed");
            return;
        }
    };

    let (sink, mut incoming) = ws.split();
    let id = hub.accept(Arc::new(WsEndpoint::new(sink, send_timeout))).await;
    info!(subscriber = %id, %peer, "subscriber connected");

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = incoming.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => on_text(&bus, id, text.as_str()),
            Some(Ok(Message::Binary(data))) => {
                warn!(subscriber = %id, len = data.len(), "ignoring binary message from subscriber");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(subscriber = %id, error = %err, "subscriber read failed");
                break;
            }
        }
    }

    hub.remove(id).await;
    info!(subscriber = %id, %peer, "subscriber disconnected");
}

/// Subscribers have nothing to say to us; anything they send is only logged.
fn on_text(bus: &StatusBus, id: SubscriberId, text: &str) {
    info!(subscriber = %id, text, "message from subscriber");
    bus.emit(StatusEvent::SubscriberMessage {
        subscriber: id,
        text: text.to_string(),
    });
}
