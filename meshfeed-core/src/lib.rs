//! meshfeed: swarm networking and credentialed feed replication
//!
//! Peers find each other per topic through a signaling rendezvous
//! ([`core_signal`]), the [`core_swarm`] manager keeps connections alive, and
//! [`core_teleport`] multiplexes named channels over each one. Every device
//! appends to its own signed feed ([`core_feed`]); feeds of a space replicate
//! over a `replication` channel ([`core_replication`]), ordered causally by
//! [`core_timeframe`] and admitted by the [`core_credentials`] chain.
//! [`core_node`] ties it together.

pub mod config;
pub mod core_credentials;
pub mod core_feed;
pub mod core_identity;
pub mod core_node;
pub mod core_replication;
pub mod core_runtime;
pub mod core_signal;
pub mod core_swarm;
pub mod core_teleport;
pub mod core_timeframe;
pub mod core_transport;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod wire;

#[doc(hidden)]
pub mod test_utils;

pub use config::MeshConfig;
pub use core_identity::{Keypair, PublicKey};
pub use core_node::Node;
pub use error::{ErrorClass, MeshError, MeshResult};
pub use logging::{init_logging, LogConfig, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = MeshConfig::default();
        assert!(ErrorClass::Transient.is_retryable());
    }
}
