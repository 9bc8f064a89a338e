//! Signaling wire protocol
//!
//! One JSON object per message:
//!
//! ```json
//! {"type":"offer","topic":"<hex>","from":"<hex>","to":"<hex>","session":"<uuid>","payload":"<hex>"}
//! ```
//!
//! `to`, `session` and `payload` only appear on the routed messages
//! (offer, answer, candidate). An answer with an empty payload is a
//! rejection.

use serde::{Deserialize, Serialize};

use super::{SignalError, SignalResult};
use crate::core_identity::PublicKey;
use crate::core_transport::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Announce {
        topic: PublicKey,
        from: PublicKey,
    },
    Lookup {
        topic: PublicKey,
        from: PublicKey,
    },
    Offer {
        topic: PublicKey,
        from: PublicKey,
        to: PublicKey,
        session: SessionId,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },
    Answer {
        topic: PublicKey,
        from: PublicKey,
        to: PublicKey,
        session: SessionId,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },
    Candidate {
        topic: PublicKey,
        from: PublicKey,
        to: PublicKey,
        session: SessionId,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },
    Withdraw {
        topic: PublicKey,
        from: PublicKey,
    },
}

impl SignalMessage {
    pub fn topic(&self) -> &PublicKey {
        match self {
            SignalMessage::Announce { topic, .. }
            | SignalMessage::Lookup { topic, .. }
            | SignalMessage::Offer { topic, .. }
            | SignalMessage::Answer { topic, .. }
            | SignalMessage::Candidate { topic, .. }
            | SignalMessage::Withdraw { topic, .. } => topic,
        }
    }

    pub fn from(&self) -> &PublicKey {
        match self {
            SignalMessage::Announce { from, .. }
            | SignalMessage::Lookup { from, .. }
            | SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::Candidate { from, .. }
            | SignalMessage::Withdraw { from, .. } => from,
        }
    }

    /// Recipient of routed messages
    pub fn to(&self) -> Option<&PublicKey> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::Candidate { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn to_json(&self) -> SignalResult<String> {
        serde_json::to_string(self).map_err(|e| SignalError::Encoding(e.to_string()))
    }

    pub fn from_json(json: &str) -> SignalResult<Self> {
        serde_json::from_str(json).map_err(|e| SignalError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::Keypair;

    #[test]
    fn test_announce_shape() {
        let topic = Keypair::derive("topic").public_key();
        let from = Keypair::derive("peer").public_key();
        let json = SignalMessage::Announce { topic, from }.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "announce");
        assert_eq!(value["topic"], topic.to_hex());
        assert_eq!(value["from"], from.to_hex());
        assert!(value.get("to").is_none());
    }

    #[test]
    fn test_offer_shape_and_parse() {
        let msg = SignalMessage::Offer {
            topic: Keypair::derive("topic").public_key(),
            from: Keypair::derive("a").public_key(),
            to: Keypair::derive("b").public_key(),
            session: SessionId::new(),
            payload: vec![0xde, 0xad],
        };
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["payload"], "dead");
        assert_eq!(SignalMessage::from_json(&json).unwrap(), msg);
        assert!(msg.to().is_some());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = SignalMessage::from_json(r#"{"type":"shout","topic":"00"}"#).unwrap_err();
        assert!(matches!(err, SignalError::Encoding(_)));
    }
}
