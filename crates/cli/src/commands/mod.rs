//! CLI command implementations.
//!
//! - `node`: the long-running signer (`run`)
//! - `peer`: node identity
//! - `topology`: topology encryption and verification
//! - `keygen`: key generation and refresh ceremonies

pub mod keygen;
pub mod node;
pub mod peer;
pub mod topology;

pub use keygen::*;
pub use node::*;
pub use peer::*;
pub use topology::*;
