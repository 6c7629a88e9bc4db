//! Wire message type registry.
//!
//! The numeric code travels in every bus frame header so the receiver can
//! route a frame to its `(session_id, type)` subscription without touching
//! the payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown message type code {0}")]
pub struct UnknownMessageType(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    // TSS session traffic
    TssKeyGenMsg,
    TssKeySignMsg,
    TssInitiateMsg,
    TssStartMsg,
    TssReadyMsg,
    TssFailMsg,
    TssReshareMsg,

    // Bully election
    CoordinatorElectionMsg,
    CoordinatorAliveMsg,
    CoordinatorLeaveMsg,
    CoordinatorSelectMsg,
    CoordinatorPingMsg,
    CoordinatorPingResponseMsg,

    // Signature gossip
    SignatureMsg,

    // Intent families
    AcrossMsg,
    LifiEscrowMsg,
    LifiUnlockMsg,
}

impl MessageType {
    pub const ALL: [MessageType; 17] = [
        MessageType::TssKeyGenMsg,
        MessageType::TssKeySignMsg,
        MessageType::TssInitiateMsg,
        MessageType::TssStartMsg,
        MessageType::TssReadyMsg,
        MessageType::TssFailMsg,
        MessageType::TssReshareMsg,
        MessageType::CoordinatorElectionMsg,
        MessageType::CoordinatorAliveMsg,
        MessageType::CoordinatorLeaveMsg,
        MessageType::CoordinatorSelectMsg,
        MessageType::CoordinatorPingMsg,
        MessageType::CoordinatorPingResponseMsg,
        MessageType::SignatureMsg,
        MessageType::AcrossMsg,
        MessageType::LifiEscrowMsg,
        MessageType::LifiUnlockMsg,
    ];

    pub fn code(self) -> u16 {
        match self {
            MessageType::TssKeyGenMsg => 1,
            MessageType::TssKeySignMsg => 2,
            MessageType::TssInitiateMsg => 3,
            MessageType::TssStartMsg => 4,
            MessageType::TssReadyMsg => 5,
            MessageType::TssFailMsg => 6,
            MessageType::TssReshareMsg => 7,
            MessageType::CoordinatorElectionMsg => 10,
            MessageType::CoordinatorAliveMsg => 11,
            MessageType::CoordinatorLeaveMsg => 12,
            MessageType::CoordinatorSelectMsg => 13,
            MessageType::CoordinatorPingMsg => 14,
            MessageType::CoordinatorPingResponseMsg => 15,
            MessageType::SignatureMsg => 20,
            MessageType::AcrossMsg => 30,
            MessageType::LifiEscrowMsg => 31,
            MessageType::LifiUnlockMsg => 32,
        }
    }

    /// Intent family topics carried between handlers on different peers.
    pub fn is_intent(self) -> bool {
        matches!(
            self,
            MessageType::AcrossMsg | MessageType::LifiEscrowMsg | MessageType::LifiUnlockMsg
        )
    }
}

impl TryFrom<u16> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or(UnknownMessageType(code))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_unique_and_reversible() {
        let mut seen = HashSet::new();
        for t in MessageType::ALL {
            assert!(seen.insert(t.code()), "duplicate code for {}", t);
            assert_eq!(MessageType::try_from(t.code()).unwrap(), t);
        }
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(MessageType::try_from(999), Err(UnknownMessageType(999)));
    }

    #[test]
    fn test_intent_topics() {
        assert!(MessageType::LifiEscrowMsg.is_intent());
        assert!(!MessageType::SignatureMsg.is_intent());
    }
}
