//! Per-session coordinator election.
//!
//! This crate implements a Bully election over the communication bus. Every
//! node ranks the session's peers with `hash(peer_id || session_id)`, so all
//! honest nodes agree on the preferred coordinator without talking. Traffic
//! is only needed to detect that better-ranked peers are gone:
//!
//! - **Ping**: a node pings its closest live better-ranked peer. A missing
//!   `PingResponse` makes it a candidate.
//! - **Election**: a candidate asks every better-ranked peer. Any `Alive`
//!   cancels the candidacy.
//! - **Select**: an unopposed candidate announces itself. Receivers keep the
//!   best-ranked `Select` seen during the bully window.
//!
//! The returned [`Election`] keeps answering pings and election requests for
//! the rest of the session and sends `Leave` when released.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use common::ElectionConfig;
//! use threshold_consensus::{BullyElector, LeaderElector};
//! use threshold_network::CommBus;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(bus: Arc<dyn CommBus>, peers: Vec<threshold_types::PeerId>) {
//! let elector = BullyElector::new(bus, ElectionConfig::default());
//! let election = elector
//!     .elect("1-42", &peers, &CancellationToken::new())
//!     .await
//!     .unwrap();
//! println!("coordinator: {}", election.coordinator());
//! election.leave().await;
//! # }
//! ```

pub mod bully;
pub mod error;
pub mod message;

pub use bully::{BullyElector, Election, LeaderElector};
pub use error::ElectionError;
pub use message::ElectionMessage;
