//! In-memory stream provider for Strata
//!
//! Provides:
//! - `SimNetwork` - shared broker routing samples between endpoints
//! - `SimProvider` - `StreamProvider` impl for one node, with optional clock skew
//!
//! Used by tests and by the `strata-node` binary to run several nodes in one
//! process without a real streaming library.

mod network;
mod provider;

pub use network::{SimNetwork, SimStats};
pub use provider::{SimInlet, SimOutlet, SimProvider};
