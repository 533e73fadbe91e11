//! Server side: hub, sessions, dispatch, and the network listeners
//!
//! [`start`] wires everything together: it spawns the hub, binds the
//! WebSocket listener and the HTTP side channel, and returns a
//! [`RunningServer`] carrying the bound addresses.

pub mod api;
mod dispatch;
mod hub;
mod listener;
mod registry;
mod session;

pub use api::{build_router, ApiError, ApiServer, AppState};
pub use dispatch::{dispatch, DispatchReport};
pub use hub::{spawn_hub, HubHandle, HubOptions, HubStats};
pub use listener::WsServer;
pub use registry::SessionRegistry;
pub use session::{
    new_session_id, ChannelTransport, Outbound, Session, SessionTimers, Subscription, Transport,
};

use std::io;
use std::net::SocketAddr;

use tokio::task::JoinHandle;

/// A started server
#[derive(Debug)]
pub struct RunningServer {
    pub hub: HubHandle,
    pub ws_addr: SocketAddr,
    pub http_addr: SocketAddr,
    ws_task: JoinHandle<()>,
    http_task: JoinHandle<io::Result<()>>,
}

impl RunningServer {
    /// WebSocket URL clients should connect to
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.ws_addr)
    }

    /// Base URL of the HTTP side channel
    pub fn http_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    /// Wait until either listener exits
    pub async fn wait(&mut self) -> io::Result<()> {
        tokio::select! {
            result = &mut self.ws_task => {
                result.map_err(io::Error::other)
            }
            result = &mut self.http_task => {
                result.map_err(io::Error::other)?
            }
        }
    }

    /// Stop the listeners and the hub
    pub fn shutdown(self) {
        self.ws_task.abort();
        self.http_task.abort();
        self.hub.shutdown();
    }
}

/// Spawn the hub and bind both listeners
pub async fn start(options: HubOptions, ws_addr: &str, http_addr: &str) -> io::Result<RunningServer> {
    let hub = spawn_hub(options);

    let bound = async {
        let ws = WsServer::bind(ws_addr, hub.clone()).await?;
        let http = ApiServer::bind(http_addr, hub.clone()).await?;
        Ok::<_, io::Error>((ws, http))
    }
    .await;
    let (ws, http) = match bound {
        Ok(listeners) => listeners,
        Err(e) => {
            hub.shutdown();
            return Err(e);
        }
    };

    Ok(RunningServer {
        ws_addr: ws.local_addr()?,
        http_addr: http.local_addr()?,
        hub,
        ws_task: ws.spawn(),
        http_task: http.spawn(),
    })
}
