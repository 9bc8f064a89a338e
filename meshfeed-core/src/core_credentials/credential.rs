/*
    credential.rs - Credential payloads

    Wire layout (first byte is the tag):

        0x01 AdmitKey   subject 32 | role u8
        0x02 AdmitFeed  feed 32 | identity 32 | proof 64
        0x03 UpdateKey  subject 32 | role u8

    AdmitFeed binds a device feed to an identity. It is double-signed: the
    proof is the identity key's signature over (space, feed), and the feed
    key's signature comes from the FeedMessage that carries the credential.
*/

use super::Role;
use crate::core_identity::{Keypair, PublicKey, Signature};
use crate::wire::{DecodeError, WireReader};

const TAG_ADMIT_KEY: u8 = 0x01;
const TAG_ADMIT_FEED: u8 = 0x02;
const TAG_UPDATE_KEY: u8 = 0x03;

const ADMIT_FEED_DOMAIN: &[u8] = b"meshfeed/admit-feed/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    AdmitKey {
        subject: PublicKey,
        role: Role,
    },
    AdmitFeed {
        feed: PublicKey,
        identity: PublicKey,
        proof: Signature,
    },
    UpdateKey {
        subject: PublicKey,
        role: Role,
    },
}

impl Credential {
    fn proof_bytes(space: &PublicKey, feed: &PublicKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(ADMIT_FEED_DOMAIN.len() + 64);
        out.extend_from_slice(ADMIT_FEED_DOMAIN);
        out.extend_from_slice(space.as_bytes());
        out.extend_from_slice(feed.as_bytes());
        out
    }

    /// Build an AdmitFeed signed by `identity` for `feed` in `space`.
    pub fn admit_feed(space: &PublicKey, feed: PublicKey, identity: &Keypair) -> Self {
        Credential::AdmitFeed {
            feed,
            identity: identity.public_key(),
            proof: identity.sign(&Self::proof_bytes(space, &feed)),
        }
    }

    /// Whether an AdmitFeed proof was produced by its identity key. Always
    /// true for the other variants.
    pub fn verify_proof(&self, space: &PublicKey) -> bool {
        match self {
            Credential::AdmitFeed {
                feed,
                identity,
                proof,
            } => identity.verify(&Self::proof_bytes(space, feed), proof),
            _ => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::AdmitKey { .. } => "admit_key",
            Credential::AdmitFeed { .. } => "admit_feed",
            Credential::UpdateKey { .. } => "update_key",
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Credential::AdmitKey { subject, role } => {
                buf.push(TAG_ADMIT_KEY);
                buf.extend_from_slice(subject.as_bytes());
                buf.push(role.rank());
            }
            Credential::AdmitFeed {
                feed,
                identity,
                proof,
            } => {
                buf.push(TAG_ADMIT_FEED);
                buf.extend_from_slice(feed.as_bytes());
                buf.extend_from_slice(identity.as_bytes());
                buf.extend_from_slice(proof.as_bytes());
            }
            Credential::UpdateKey { subject, role } => {
                buf.push(TAG_UPDATE_KEY);
                buf.extend_from_slice(subject.as_bytes());
                buf.push(role.rank());
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(129);
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode_from(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        match reader.read_u8()? {
            TAG_ADMIT_KEY => Ok(Credential::AdmitKey {
                subject: reader.read_key()?,
                role: Role::from_rank(reader.read_u8()?)?,
            }),
            TAG_ADMIT_FEED => Ok(Credential::AdmitFeed {
                feed: reader.read_key()?,
                identity: reader.read_key()?,
                proof: reader.read_signature()?,
            }),
            TAG_UPDATE_KEY => Ok(Credential::UpdateKey {
                subject: reader.read_key()?,
                role: Role::from_rank(reader.read_u8()?)?,
            }),
            tag => Err(DecodeError::UnknownTag {
                what: "credential",
                tag,
            }),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(bytes);
        let credential = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_feed_proof() {
        let space = Keypair::derive("space").public_key();
        let identity = Keypair::derive("identity");
        let feed = Keypair::derive("device feed").public_key();
        let cred = Credential::admit_feed(&space, feed, &identity);
        assert!(cred.verify_proof(&space));

        let other_space = Keypair::derive("other").public_key();
        assert!(!cred.verify_proof(&other_space));
    }

    #[test]
    fn test_admit_feed_proof_by_wrong_identity() {
        let space = Keypair::derive("space").public_key();
        let feed = Keypair::derive("device feed").public_key();
        let Credential::AdmitFeed { proof, .. } =
            Credential::admit_feed(&space, feed, &Keypair::derive("mallory"))
        else {
            unreachable!()
        };
        let forged = Credential::AdmitFeed {
            feed,
            identity: Keypair::derive("victim").public_key(),
            proof,
        };
        assert!(!forged.verify_proof(&space));
    }

    #[test]
    fn test_wire_tags() {
        let subject = Keypair::derive("s").public_key();
        let admit = Credential::AdmitKey {
            subject,
            role: Role::Admin,
        }
        .encode();
        assert_eq!(admit[0], 0x01);
        assert_eq!(admit[33], 3);
        assert_eq!(admit.len(), 34);

        let update = Credential::UpdateKey {
            subject,
            role: Role::Removed,
        };
        let bytes = update.encode();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(Credential::decode(&bytes).unwrap(), update);
    }

    #[test]
    fn test_decode_rejects_unknown_tag_and_role() {
        assert!(matches!(
            Credential::decode(&[0x09]),
            Err(DecodeError::UnknownTag { what: "credential", tag: 0x09 })
        ));
        let mut bytes = vec![0x01];
        bytes.extend_from_slice(&[7u8; 32]);
        bytes.push(9);
        assert!(matches!(
            Credential::decode(&bytes),
            Err(DecodeError::UnknownTag { what: "role", .. })
        ));
    }
}
