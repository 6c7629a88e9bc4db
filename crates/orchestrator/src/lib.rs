//! Intent orchestration for the signer.
//!
//! ```text
//!  HTTP ──submit──┐                          ┌──> AcrossPipeline
//!                 ├──> Relayer ──by type──> ├──> LifiEscrowPipeline
//!  bus (intents) ─┘                          └──> LifiUnlockPipeline
//!                                                     │ digest
//!                                                     ▼
//!                                     Coordinator + SigningProcess
//!                                                     │ signature
//!                                                     ▼
//!                                 SignatureCache <──gossip──> peers
//! ```

pub mod cache;
pub mod ceremony;
pub mod confirmations;
pub mod digest;
pub mod handlers;
pub mod listener;
pub mod message;
pub mod relayer;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::SignatureCache;
pub use ceremony::{run_keygen, run_refresh, KEYGEN_SESSION, REFRESH_SESSION};
pub use confirmations::ConfirmationWatcher;
pub use handlers::{HandlerContext, IntentHandler, IntentPipeline, PipelineHandler};
pub use message::{Accepted, Intent, IntentMessage, IntentRequest, SignatureMessage};
pub use relayer::Relayer;
pub use service::{
    Health, RunningService, ServiceConfig, ServiceDeps, SignatureResponse, SigningService,
};
