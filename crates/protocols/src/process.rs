//! Contract between the session coordinator and an MPC process.

use async_trait::async_trait;
use threshold_types::{MessageType, PeerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;

/// A message produced by the local party. `to == None` is a broadcast to
/// every other session participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: Option<PeerId>,
    pub payload: Vec<u8>,
}

pub struct StartContext {
    pub cancel: CancellationToken,
    pub is_coordinator: bool,
    /// Opaque bytes produced by the leader's `start_params`.
    pub params: Vec<u8>,
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
pub trait TssProcess: Send + Sync + 'static {
    type Output: Send + 'static;

    fn session_id(&self) -> &str;

    /// Bus message type carrying this process's round traffic.
    fn message_type(&self) -> MessageType;

    /// Short protocol label for logs.
    fn protocol(&self) -> &'static str;

    /// Whether the leader may start with the peers in `ready` (self included).
    fn ready(&self, ready: &[PeerId]) -> bool;

    /// Parameters fixing the party set, identical on every participant.
    fn start_params(&self, ready: &[PeerId]) -> Result<Vec<u8>, ProtocolError>;

    /// Run the party to completion.
    async fn start(&self, ctx: StartContext) -> Result<Self::Output, ProtocolError>;

    /// Feed one inbound round message.
    fn update_from_bytes(&self, bytes: &[u8], from: PeerId, is_broadcast: bool);

    fn stop(&self);
}
