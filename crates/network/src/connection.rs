//! Outbound connection pool with topology gate.
//!
//! One authenticated stream per remote peer, opened lazily on first send
//! and dropped on error. Every dial checks the current topology; when the
//! topology is replaced, streams to peers that left are shut down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{NodeKey, SharedTopology};
use threshold_types::PeerId;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::frame::Frame;
use crate::handshake;

/// Connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Writer = Arc<Mutex<WriteHalf<TcpStream>>>;

pub struct ConnectionManager {
    key: NodeKey,
    topology: SharedTopology,
    /// Active connections: peer -> write half of the stream.
    connections: RwLock<HashMap<PeerId, Writer>>,
}

impl ConnectionManager {
    pub fn new(key: NodeKey, topology: SharedTopology) -> Self {
        Self {
            key,
            topology,
            connections: RwLock::new(HashMap::new()),
        }
    }

    async fn connect(&self, peer: &PeerId) -> Result<Writer, NetworkError> {
        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(peer) {
                return Ok(conn.clone());
            }
        }

        let addr = {
            let topology = self.topology.borrow();
            topology
                .address_of(peer)
                .map(|a| a.dial_addr())
                .ok_or(NetworkError::NotInTopology { peer: *peer })?
        };
        debug!("Connecting to peer {} at {}", peer.short(), addr);

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connecting to peer {}", peer)))?
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: *peer,
                source: e,
            })?;

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true).ok();

        tokio::time::timeout(CONNECT_TIMEOUT, handshake::dial(&mut stream, &self.key, peer))
            .await
            .map_err(|_| NetworkError::Timeout(format!("handshake with peer {}", peer)))??;

        info!("Connected to peer {} at {}", peer.short(), addr);

        // Outbound streams only carry our frames; the remote's frames come in
        // on the stream it dials to our listener.
        let (_read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(write_half));

        let mut connections = self.connections.write().await;
        // Another task may have raced us; keep the first.
        let entry = connections.entry(*peer).or_insert_with(|| writer.clone());
        Ok(entry.clone())
    }

    pub async fn send(&self, peer: &PeerId, frame: &Frame) -> Result<(), NetworkError> {
        let encoded = frame.encode()?;
        let conn = self.connect(peer).await?;

        let result = {
            let mut writer = conn.lock().await;
            match writer.write_all(&encoded).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = result {
            self.remove_connection(peer).await;
            return Err(NetworkError::SendFailed {
                peer: *peer,
                source: e,
            });
        }

        debug!(
            "Sent {} to peer {}: session={}, {} bytes",
            frame.msg_type,
            peer.short(),
            frame.session_id,
            encoded.len()
        );
        Ok(())
    }

    pub async fn remove_connection(&self, peer: &PeerId) {
        let removed = self.connections.write().await.remove(peer);
        if let Some(conn) = removed {
            let mut writer = conn.lock().await;
            writer.shutdown().await.ok();
            debug!("Removed connection to peer {}", peer.short());
        }
    }

    /// Close streams to peers that are no longer in the topology.
    pub async fn prune(&self) {
        let stale: Vec<PeerId> = {
            let topology = self.topology.borrow().clone();
            let connections = self.connections.read().await;
            connections
                .keys()
                .filter(|p| !topology.contains(p))
                .copied()
                .collect()
        };
        for peer in stale {
            warn!("Peer {} left the topology, closing stream", peer.short());
            self.remove_connection(&peer).await;
        }
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().await.keys().copied().collect()
    }
}
