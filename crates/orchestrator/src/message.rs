//! Intent messages passed from the HTTP surface and the bus to handlers.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use threshold_types::{Error, MessageType, PeerId};
use tokio::sync::oneshot;

/// Bus session id carrying gossiped intents.
pub const INTENT_TOPIC: &str = "intents";
/// Bus session id carrying finished signatures.
pub const SIGNATURE_TOPIC: &str = "signatures";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum Intent {
    /// Spoke pool deposit on `chain_id` (the origin chain).
    Across { chain_id: u64, deposit_id: U256 },
    /// Escrow order whose input is locked on `chain_id`.
    LifiEscrow { chain_id: u64, order_id: B256 },
    /// Unlock of an escrow order's input on `chain_id`.
    LifiUnlock {
        chain_id: u64,
        order_id: B256,
        settler: Address,
    },
}

impl Intent {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Intent::Across { .. } => MessageType::AcrossMsg,
            Intent::LifiEscrow { .. } => MessageType::LifiEscrowMsg,
            Intent::LifiUnlock { .. } => MessageType::LifiUnlockMsg,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Intent::Across { chain_id, .. }
            | Intent::LifiEscrow { chain_id, .. }
            | Intent::LifiUnlock { chain_id, .. } => *chain_id,
        }
    }

    /// Session id shared by every node signing this intent.
    pub fn session_id(&self) -> String {
        match self {
            Intent::Across {
                chain_id,
                deposit_id,
            } => format!("{}-{}", chain_id, deposit_id),
            Intent::LifiEscrow { chain_id, order_id } => format!("{}-{}", chain_id, order_id),
            Intent::LifiUnlock {
                chain_id, order_id, ..
            } => format!("unlock-{}-{}", chain_id, order_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMessage {
    pub intent: Intent,
    /// Set once a node has taken the leader role for this intent.
    #[serde(default)]
    pub coordinator: Option<PeerId>,
}

impl IntentMessage {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            coordinator: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// What a handler committed to sign once an intent passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub session_id: String,
    pub digest: B256,
}

/// Resolves once the handler has accepted or rejected the intent.
pub type AckSender = oneshot::Sender<Result<Accepted, Error>>;

#[derive(Debug)]
pub struct IntentRequest {
    pub message: IntentMessage,
    /// Present for HTTP-originated intents only.
    pub ack: Option<AckSender>,
}

/// One-shot acknowledgement wrapper; the first verdict wins.
#[derive(Debug, Default)]
pub struct Ack(Option<AckSender>);

impl Ack {
    pub fn new(sender: Option<AckSender>) -> Self {
        Self(sender)
    }

    pub fn accept(&mut self, accepted: Accepted) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Ok(accepted));
        }
    }

    pub fn reject(&mut self, err: Error) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Err(err));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMessage {
    pub id: String,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl SignatureMessage {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
