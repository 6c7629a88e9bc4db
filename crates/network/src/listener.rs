//! Inbound stream acceptor.
//!
//! Accepts TCP connections, authenticates them, and routes every frame to
//! the subscription registry tagged with the authenticated sender.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{NodeKey, SharedTopology};
use threshold_types::PeerId;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Envelope, SubscriptionRegistry};
use crate::error::NetworkError;
use crate::frame::{read_prefixed, Frame};
use crate::handshake;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind and spawn the accept loop. Returns the bound address.
pub async fn spawn_listener(
    listen_addr: &str,
    key: NodeKey,
    topology: SharedTopology,
    registry: Arc<SubscriptionRegistry>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), NetworkError> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| NetworkError::BindFailed {
            address: listen_addr.to_string(),
            source: e,
        })?;
    let local = listener.local_addr()?;
    info!("Peer listener bound to {} as {}", local, key.peer_id().short());

    let handle = tokio::spawn(async move {
        run_listener(listener, key, topology, registry, cancel).await;
        info!("Peer listener stopped");
    });

    Ok((local, handle))
}

async fn run_listener(
    listener: TcpListener,
    key: NodeKey,
    topology: SharedTopology,
    registry: Arc<SubscriptionRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                stream.set_nodelay(true).ok();
                let key = key.clone();
                let topology = topology.clone();
                let registry = registry.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_connection(stream, key, topology, registry, cancel).await
                    {
                        warn!("Connection from {} closed: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    key: NodeKey,
    mut topology: SharedTopology,
    registry: Arc<SubscriptionRegistry>,
    cancel: CancellationToken,
) -> Result<(), NetworkError> {
    let peer: PeerId = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        handshake::accept(&mut stream, &key, &topology),
    )
    .await
    .map_err(|_| NetworkError::Timeout("inbound handshake".to_string()))??;

    info!("Peer {} connected", peer.short());

    let reader = read_frames(&mut stream, peer, &registry);

    let gate = async {
        loop {
            if topology.changed().await.is_err() {
                // Publisher gone: the topology can no longer change.
                std::future::pending::<()>().await;
            }
            if !topology.borrow_and_update().contains(&peer) {
                return;
            }
        }
    };

    // The reader is only dropped when the connection ends, so a partially
    // read frame is never resumed mid-stream.
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        _ = gate => {
            warn!("Peer {} left the topology, closing inbound stream", peer.short());
            Ok(())
        }
        result = reader => result,
    }
}

/// Deliver frames from an authenticated stream until it ends.
///
/// A frame that fails to decode is skipped; the length prefix keeps the
/// stream aligned. Read errors and oversized prefixes end the stream.
async fn read_frames<R: AsyncRead + Unpin>(
    reader: &mut R,
    peer: PeerId,
    registry: &SubscriptionRegistry,
) -> Result<(), NetworkError> {
    loop {
        let body = match read_prefixed(reader).await {
            Ok(body) => body,
            Err(NetworkError::ReceiveFailed(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Peer {} closed connection", peer.short());
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match Frame::decode(&body) {
            Ok(frame) => {
                registry.deliver(Envelope {
                    from: peer,
                    session_id: frame.session_id,
                    msg_type: frame.msg_type,
                    payload: frame.payload,
                });
            }
            Err(e) => warn!("Dropping malformed frame from {}: {}", peer.short(), e),
        }
    }
}
