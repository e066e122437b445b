//! Side-channel signaling with the in-browser extensions.
//!
//! The proxy-bridge extension connects back to a local TCP port and speaks a
//! JSON-lines protocol: one `{"event": ..., "data": ...}` object per line in
//! either direction. Outbound events (`setProxy`) are fanned out to every
//! connected extension; inbound confirmations (`finishProxy`,
//! `finishCookiePurge`) are broadcast to whoever is waiting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Inbound: the extension finished switching the upstream proxy
pub const FINISH_PROXY: &str = "finishProxy";
/// Inbound: the extension finished purging cookies for a fresh tab
pub const FINISH_COOKIE_PURGE: &str = "finishCookiePurge";
/// Outbound: tell the extension which upstream proxy to use
pub const SET_PROXY: &str = "setProxy";

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("bridge IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct WireEvent {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Publish/await semantics over named events.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Send a named event to every connected peer.
    async fn publish(&self, event: &str, payload: serde_json::Value) -> Result<(), SignalError>;

    /// Wait for the next occurrence of `event`. Returns false when `timeout`
    /// expires first.
    async fn await_event(&self, event: &str, timeout: Duration) -> bool;
}

/// TCP JSON-lines bridge to the browser extensions.
pub struct ExtensionBridge {
    port: u16,
    inbound: broadcast::Sender<WireEvent>,
    peers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl ExtensionBridge {
    pub fn new(port: u16) -> Self {
        let (inbound, _) = broadcast::channel(64);
        Self {
            port,
            inbound,
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Bind the bridge port and serve connections until the task is aborted.
    pub async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Extension bridge listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve connections on an already-bound listener.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!("Extension connected from {}", peer_addr);
            let bridge = self.clone();
            tokio::spawn(async move {
                bridge.handle_connection(stream, peer_addr).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let (read_half, mut write_half) = stream.into_split();

        // Writer: drain the outbound queue for this peer
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.peers.lock().push(tx);

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        // Reader: parse inbound lines and broadcast them
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WireEvent>(line) {
                        Ok(event) => {
                            debug!("Bridge event from extension: {}", event.event);
                            let _ = self.inbound.send(event);
                        }
                        Err(e) => warn!("Unparsable bridge line from {}: {}", peer_addr, e),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Bridge read error from {}: {}", peer_addr, e);
                    break;
                }
            }
        }

        debug!("Extension disconnected: {}", peer_addr);
    }
}

#[async_trait]
impl SignalChannel for ExtensionBridge {
    async fn publish(&self, event: &str, payload: serde_json::Value) -> Result<(), SignalError> {
        let line = serde_json::to_string(&WireEvent {
            event: event.to_string(),
            data: payload,
        })?;

        let mut peers = self.peers.lock();
        peers.retain(|tx| tx.send(line.clone()).is_ok());
        if peers.is_empty() {
            warn!("Published '{}' with no extension connected", event);
        }
        Ok(())
    }

    async fn await_event(&self, event: &str, timeout: Duration) -> bool {
        let mut rx = self.inbound.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return false,
                Ok(Ok(incoming)) if incoming.event == event => return true,
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn bridge_on_ephemeral_port() -> (Arc<ExtensionBridge>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bridge = Arc::new(ExtensionBridge::new(addr.port()));
        tokio::spawn(bridge.clone().serve_listener(listener));
        (bridge, addr)
    }

    #[tokio::test]
    async fn test_inbound_event_wakes_waiter() {
        let (bridge, addr) = bridge_on_ephemeral_port().await;

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .await_event(FINISH_PROXY, Duration::from_secs(5))
                    .await
            })
        };
        // give the waiter a chance to subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"event\":\"finishProxy\",\"data\":{}}\n")
            .await
            .unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_await_event_times_out() {
        let (bridge, _addr) = bridge_on_ephemeral_port().await;
        assert!(
            !bridge
                .await_event(FINISH_COOKIE_PURGE, Duration::from_millis(50))
                .await
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_connected_peer() {
        let (bridge, addr) = bridge_on_ephemeral_port().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        bridge
            .publish(SET_PROXY, serde_json::json!({"host": "10.0.0.1"}))
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        assert!(line.contains("setProxy"));
        assert!(line.contains("10.0.0.1"));
    }
}
