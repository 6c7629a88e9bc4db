//! Peer-to-peer transport and communication bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Node                               │
//! │  ┌────────────┐   ┌──────────┐   ┌──────────────────────┐    │
//! │  │  CommBus   │──>│ Outboxes │──>│  ConnectionManager   │────┼──> Peers
//! │  │ (P2pBus)   │   │(per peer)│   │ (gate + handshake)   │    │
//! │  └─────┬──────┘   └──────────┘   └──────────────────────┘    │
//! │        │ subscribe(session_id, type)                         │
//! │  ┌─────▼────────────────┐        ┌──────────────────────┐    │
//! │  │ SubscriptionRegistry │<───────│      Listener        │<───┼─── Peers
//! │  └──────────────────────┘        └──────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every stream is authenticated with the peers' ed25519 identity keys and
//! gated on the current topology. Outbound streams carry frames one way;
//! each peer dials the others for its own sends.

pub mod bus;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod local;
pub mod p2p;
pub mod queue;

pub use bus::{CommBus, Envelope, Subscription, SubscriptionId, SubscriptionRegistry};
pub use connection::ConnectionManager;
pub use error::NetworkError;
pub use frame::{Frame, FRAME_VERSION, MAX_FRAME_SIZE};
pub use handshake::PROTOCOL_ID;
pub use local::{LocalBus, LocalNetwork};
pub use p2p::P2pBus;
pub use queue::DeliveryQueue;
