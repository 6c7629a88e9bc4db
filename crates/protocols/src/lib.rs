//! Threshold session protocols.
//!
//! - [`coordinator`]: drives `Initiate → Ready → Start → Run` for one session
//!   and routes wire traffic between the bus and the MPC party.
//! - [`signing`], [`keygen`]: CGGMP24 processes plugged into the coordinator.
//! - [`delivery`]: adapts bus traffic to `round_based` streams and sinks.

pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod keygen;
pub mod process;
pub mod session;
pub mod signing;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::ProtocolError;
pub use keygen::{KeygenProcess, ReshareProcess};
pub use process::{Outbound, StartContext, TssProcess};
pub use session::SessionMessage;
pub use signing::{SignatureResult, SigningProcess};
