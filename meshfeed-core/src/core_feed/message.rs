/*
    message.rs - Signed feed entries and their wire codec

    Wire layout:

        feed_key    32 bytes
        seq         LEB128 varint
        payload_len u32 BE
        payload     payload_len bytes
        signature   64 bytes

    The signature covers a domain-separated form of (feed_key, seq, payload)
    so a signature over one seq can never be replayed at another.
*/

use crate::core_identity::{Keypair, PublicKey, Signature};
use crate::core_timeframe::{Position, MAX_SEQ};
use crate::wire::{put_varint, DecodeError, WireReader};

/// Largest payload accepted on the wire
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Longest possible encoding: key, ten byte varint, length, payload, signature
pub const MAX_ENCODED_SIZE: usize = 32 + 10 + 4 + MAX_PAYLOAD_SIZE + 64;

const SIGNING_DOMAIN: &[u8] = b"meshfeed/feed-message/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub feed_key: PublicKey,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl FeedMessage {
    pub fn signing_bytes(feed_key: &PublicKey, seq: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNING_DOMAIN.len() + 40 + payload.len());
        out.extend_from_slice(SIGNING_DOMAIN);
        out.extend_from_slice(feed_key.as_bytes());
        out.extend_from_slice(&seq.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Sign `payload` as entry `seq` of the feed owned by `keypair`.
    pub fn sign(keypair: &Keypair, seq: u64, payload: Vec<u8>) -> Self {
        let feed_key = keypair.public_key();
        let signature = keypair.sign(&Self::signing_bytes(&feed_key, seq, &payload));
        Self {
            feed_key,
            seq,
            payload,
            signature,
        }
    }

    pub fn verify(&self) -> bool {
        self.feed_key.verify(
            &Self::signing_bytes(&self.feed_key, self.seq, &self.payload),
            &self.signature,
        )
    }

    pub fn position(&self) -> Position {
        Position::new(self.feed_key, self.seq)
    }

    pub fn encoded_len(&self) -> usize {
        32 + 10 + 4 + self.payload.len() + 64
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.feed_key.as_bytes());
        put_varint(buf, self.seq);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(self.signature.as_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode_from(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let feed_key = reader.read_key()?;
        let seq = reader.read_varint()?;
        if seq > MAX_SEQ {
            return Err(DecodeError::Invalid(format!("seq {} out of range", seq)));
        }
        let payload = reader.read_len_prefixed(MAX_PAYLOAD_SIZE)?.to_vec();
        let signature = reader.read_signature()?;
        Ok(Self {
            feed_key,
            seq,
            payload,
            signature,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(bytes);
        let message = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(message)
    }
}
