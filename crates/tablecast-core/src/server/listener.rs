//! WebSocket listener
//!
//! Accepts connections and runs one task per connection. Each connection
//! gets a bounded outbound queue drained by a writer, and a reader that
//! decodes client frames and forwards them to the hub.

use std::io;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::hub::HubHandle;
use super::session::{new_session_id, ChannelTransport, Outbound, Session};
use crate::error::ProtocolError;
use crate::protocol::ClientMessage;

/// WebSocket server bound to an address
pub struct WsServer {
    listener: TcpListener,
    hub: HubHandle,
}

impl WsServer {
    /// Bind the listening socket; port 0 picks an ephemeral port
    pub async fn bind(addr: impl ToSocketAddrs, hub: HubHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, hub })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop on a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept connections until the hub stops
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(address = %addr, "WebSocket server listening");
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if !self.hub.is_running() {
                        break;
                    }
                    let hub = self.hub.clone();
                    tokio::spawn(handle_connection(stream, peer, hub));
                }
                Err(e) => warn!(error = %e, "WebSocket accept error"),
            }
        }

        info!("WebSocket server stopped");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: HubHandle) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let session_id = new_session_id();
    let (transport, outbound) = ChannelTransport::new(hub.session_queue_capacity());
    if hub
        .connect(Session::new(session_id.clone(), Box::new(transport)))
        .is_err()
    {
        return;
    }
    debug!(peer = %peer, session = %session_id, "Connection accepted");

    let (write, read) = ws.split();
    let reason = tokio::select! {
        reason = write_frames(write, outbound) => reason,
        reason = read_frames(read, &session_id, &hub) => reason,
    };

    hub.disconnect(&session_id, reason);
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// Drain the session's outbound queue onto the socket
async fn write_frames(mut write: WsSink, mut outbound: mpsc::Receiver<Outbound>) -> String {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Outbound::Message(message) => match message.encode() {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    warn!(error = %e, "Failed to encode message");
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Close => {
                write.send(Message::Close(None)).await.ok();
                return "closed by server".to_string();
            }
        };

        if let Err(e) = write.send(message).await {
            return format!("write failed: {}", e);
        }
    }

    // Session was released by the hub
    write.close().await.ok();
    "session released".to_string()
}

/// Decode client frames and forward them to the hub
async fn read_frames(mut read: WsStream, session_id: &str, hub: &HubHandle) -> String {
    while let Some(frame) = read.next().await {
        let forwarded = match frame {
            Ok(Message::Text(text)) => match ClientMessage::decode(&text) {
                Ok(message) => hub.inbound(session_id, message),
                Err(e) => hub.protocol_violation(session_id, e),
            },
            Ok(Message::Binary(_)) => hub.protocol_violation(session_id, ProtocolError::BinaryFrame),
            Ok(Message::Pong(_)) => {
                hub.heartbeat(session_id);
                Ok(())
            }
            Ok(Message::Close(_)) => return "closed by client".to_string(),
            // Pings are answered by tungstenite itself
            Ok(_) => Ok(()),
            Err(e) => return format!("read failed: {}", e),
        };

        if forwarded.is_err() {
            return "hub stopped".to_string();
        }
    }

    "connection dropped".to_string()
}
