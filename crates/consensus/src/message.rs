//! Election wire messages.

use serde::{Deserialize, Serialize};
use threshold_types::{MessageType, PeerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionMessage {
    Ping,
    /// Carries the coordinator the responder already settled on, if any, so
    /// a late node can adopt it without a full election.
    PingResponse { coordinator: Option<PeerId> },
    Election,
    Alive,
    Select { coordinator: PeerId },
    Leave,
}

impl ElectionMessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            ElectionMessage::Ping => MessageType::CoordinatorPingMsg,
            ElectionMessage::PingResponse { .. } => MessageType::CoordinatorPingResponseMsg,
            ElectionMessage::Election => MessageType::CoordinatorElectionMsg,
            ElectionMessage::Alive => MessageType::CoordinatorAliveMsg,
            ElectionMessage::Select { .. } => MessageType::CoordinatorSelectMsg,
            ElectionMessage::Leave => MessageType::CoordinatorLeaveMsg,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing a plain enum into a Vec cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_carries_coordinator() {
        let coordinator = PeerId::from_bytes([3; 32]);
        let msg = ElectionMessage::Select { coordinator };
        assert_eq!(msg.msg_type(), MessageType::CoordinatorSelectMsg);
        assert_eq!(ElectionMessage::decode(&msg.encode()), Some(msg));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_eq!(ElectionMessage::decode(b"\x00\x01"), None);
    }
}
