//! Common building blocks shared between signer components.

pub mod config;
pub mod identity;
pub mod observability;
pub mod selection;
pub mod topology;

pub use config::{
    AppConfig, ChainConfig, ConfigError, ConfirmationBucket, ElectionConfig, HttpConfig,
    LifiConfig, LoggingConfig, NodeConfig, PriceConfig, TokenConfig, TokenDeployment,
    TopologyConfig, TssConfig,
};
pub use identity::{IdentityError, NodeKey};
pub use observability::{init_tracing, EventType, LogEvent, SessionSpan};
pub use selection::{compare_rank, rank, select_signers, sort_by_rank, SelectionError};
pub use topology::{
    PeerAddress, SharedTopology, Topology, TopologyError, TopologyHandle, TopologyProvider,
};
