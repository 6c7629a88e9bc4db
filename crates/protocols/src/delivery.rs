//! Bridge between session traffic and `round_based` parties.
//!
//! Inbound bytes handed to a process by the coordinator land in an [`Inbox`]
//! until the party starts. Each payload starts with a one-byte phase tag so
//! a process running several protocols back to back (keygen then aux info)
//! can buffer the next phase's early messages while the current one runs.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{Sink, Stream};
use round_based::{Incoming, MessageDestination, MessageType, Outgoing};
use serde::{de::DeserializeOwned, Serialize};
use threshold_types::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::Outbound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInbound {
    pub from: PeerId,
    pub is_broadcast: bool,
    pub data: Vec<u8>,
}

/// Buffer for round messages that arrive before the party exists.
pub struct Inbox {
    tx: mpsc::UnboundedSender<RawInbound>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RawInbound>>>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn push(&self, data: &[u8], from: PeerId, is_broadcast: bool) {
        let _ = self.tx.send(RawInbound {
            from,
            is_broadcast,
            data: data.to_vec(),
        });
    }

    /// The receiving end; `None` once a party has claimed it.
    pub fn take(&self) -> Option<mpsc::UnboundedReceiver<RawInbound>> {
        match self.rx.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Split tagged traffic into one queue per phase. Queues exist up front, so
/// messages for a later phase wait there until that phase connects.
pub fn demux(
    mut raw: mpsc::UnboundedReceiver<RawInbound>,
    phases: u8,
    cancel: CancellationToken,
) -> Vec<mpsc::UnboundedReceiver<RawInbound>> {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..phases).map(|_| mpsc::unbounded_channel()).unzip();

    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return,
                msg = raw.recv() => match msg {
                    Some(m) => m,
                    None => return,
                },
            };
            let Some((&phase, body)) = msg.data.split_first() else {
                warn!(peer = %msg.from.short(), "Empty round message");
                continue;
            };
            match senders.get(phase as usize) {
                Some(tx) => {
                    let _ = tx.send(RawInbound {
                        from: msg.from,
                        is_broadcast: msg.is_broadcast,
                        data: body.to_vec(),
                    });
                }
                None => warn!(peer = %msg.from.short(), phase, "Round message for unknown phase"),
            }
        }
    });

    receivers
}

pub struct IncomingStream<M> {
    rx: mpsc::UnboundedReceiver<Incoming<M>>,
}

pub struct OutgoingSink<M> {
    tx: mpsc::UnboundedSender<Outgoing<M>>,
}

/// Wire one protocol phase to the session.
///
/// `parties[i]` is the peer playing protocol index `i`. The returned handle
/// finishes once every outgoing message has been handed to `outbound`; await
/// it after the protocol completes so the final round is not lost.
pub fn connect<M>(
    phase: u8,
    parties: Arc<Vec<PeerId>>,
    mut inbound: mpsc::UnboundedReceiver<RawInbound>,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
) -> (IncomingStream<M>, OutgoingSink<M>, JoinHandle<()>)
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing<M>>();

    let in_parties = parties.clone();
    let in_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut next_id = 0u64;
        loop {
            let raw = tokio::select! {
                _ = in_cancel.cancelled() => return,
                raw = inbound.recv() => match raw {
                    Some(r) => r,
                    None => return,
                },
            };
            let Some(sender) = in_parties.iter().position(|p| *p == raw.from) else {
                debug!(peer = %raw.from.short(), "Round message from non-participant");
                continue;
            };
            let msg: M = match serde_json::from_slice(&raw.data) {
                Ok(m) => m,
                Err(e) => {
                    warn!(peer = %raw.from.short(), "Undecodable round message: {}", e);
                    continue;
                }
            };
            let incoming = Incoming {
                id: next_id,
                sender: sender as u16,
                msg_type: if raw.is_broadcast {
                    MessageType::Broadcast
                } else {
                    MessageType::P2P
                },
                msg,
            };
            next_id += 1;
            if incoming_tx.send(incoming).is_err() {
                return;
            }
        }
    });

    let flush = tokio::spawn(async move {
        while let Some(out) = outgoing_rx.recv().await {
            let to = match out.recipient {
                MessageDestination::AllParties => None,
                MessageDestination::OneParty(idx) => match parties.get(idx as usize) {
                    Some(p) => Some(*p),
                    None => {
                        warn!(idx, "Round message for unknown party index");
                        continue;
                    }
                },
            };
            let mut payload = vec![phase];
            match serde_json::to_writer(&mut payload, &out.msg) {
                Ok(()) => {
                    if outbound.send(Outbound { to, payload }).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Failed to encode round message: {}", e),
            }
        }
    });

    (
        IncomingStream { rx: incoming_rx },
        OutgoingSink { tx: outgoing_tx },
        flush,
    )
}

impl<M> Stream for IncomingStream<M>
where
    M: Unpin,
{
    type Item = Result<Incoming<M>, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(msg)) => Poll::Ready(Some(Ok(msg))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<M> Sink<Outgoing<M>> for OutgoingSink<M>
where
    M: Unpin,
{
    type Error = std::io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Unbounded
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Outgoing<M>) -> Result<(), Self::Error> {
        self.tx.send(item).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session outbound closed")
        })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 32])
    }

    #[tokio::test]
    async fn test_inbound_maps_sender_to_party_index() {
        let parties = Arc::new(vec![peer(1), peer(2), peer(3)]);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (mut incoming, _sink, _flush) =
            connect::<u32>(0, parties, raw_rx, out_tx, CancellationToken::new());

        raw_tx
            .send(RawInbound {
                from: peer(3),
                is_broadcast: true,
                data: b"7".to_vec(),
            })
            .unwrap();
        let msg = incoming.next().await.unwrap().unwrap();
        assert_eq!(msg.sender, 2);
        assert_eq!(msg.msg, 7);
        assert_eq!(msg.msg_type, MessageType::Broadcast);
    }

    #[tokio::test]
    async fn test_outbound_is_tagged_and_addressed() {
        let parties = Arc::new(vec![peer(1), peer(2)]);
        let (_raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_incoming, mut sink, flush) =
            connect::<u32>(1, parties, raw_rx, out_tx, CancellationToken::new());

        sink.send(Outgoing {
            recipient: MessageDestination::OneParty(1),
            msg: 5u32,
        })
        .await
        .unwrap();
        drop(sink);
        flush.await.unwrap();

        let out = out_rx.recv().await.unwrap();
        assert_eq!(out.to, Some(peer(2)));
        assert_eq!(out.payload, b"\x015".to_vec());
    }

    #[tokio::test]
    async fn test_demux_buffers_later_phase() {
        let inbox = Inbox::new();
        inbox.push(b"\x01late", peer(1), false);
        inbox.push(b"\x00now", peer(2), true);
        let mut phases = demux(inbox.take().unwrap(), 2, CancellationToken::new());
        assert!(inbox.take().is_none());

        let first = phases[0].recv().await.unwrap();
        assert_eq!(first.data, b"now");
        let second = phases[1].recv().await.unwrap();
        assert_eq!(second.data, b"late");
        assert_eq!(second.from, peer(1));
    }
}
