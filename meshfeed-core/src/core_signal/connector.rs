//! Connection to a signaling rendezvous service
//!
//! A [`SignalConnector`] opens one duplex stream of JSON messages to the
//! rendezvous. The stream ends (inbound yields `None`, outbound send fails)
//! when the service drops us; the client then reconnects.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::SignalResult;
use crate::core_identity::PublicKey;

#[derive(Debug)]
pub struct SignalConnection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait SignalConnector: Send + Sync + std::fmt::Debug {
    /// Connect as `local`.
    async fn connect(&self, local: PublicKey) -> SignalResult<SignalConnection>;
}
