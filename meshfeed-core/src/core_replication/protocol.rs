/*
    protocol.rs - Messages of the replication channel

        tag 0x01 Hello      space 32 | timeframe
        tag 0x02 Message    FeedMessage encoding
        tag 0x03 Request    feed 32 | from_seq varint
        tag 0x04 Timeframe  timeframe

    Hello is the first message in each direction and only that. After it,
    either side may send any of the others at any time.
*/

use crate::core_feed::{FeedMessage, MAX_ENCODED_SIZE};
use crate::core_identity::PublicKey;
use crate::core_timeframe::{Timeframe, MAX_TIMEFRAME_ENTRIES};
use crate::wire::{put_varint, DecodeError, WireReader};

/// Name of the teleport channel the protocol runs on
pub const REPLICATION_CHANNEL: &str = "replication";

/// Largest encoded message: a Message carrying a full feed entry, or a
/// Hello with a full timeframe, whichever is bigger
pub const MAX_MESSAGE_SIZE: usize = {
    let message = 1 + MAX_ENCODED_SIZE;
    let hello = 1 + 32 + 10 + MAX_TIMEFRAME_ENTRIES as usize * (32 + 10);
    if message > hello {
        message
    } else {
        hello
    }
};

const TAG_HELLO: u8 = 0x01;
const TAG_MESSAGE: u8 = 0x02;
const TAG_REQUEST: u8 = 0x03;
const TAG_TIMEFRAME: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    Hello { space: PublicKey, timeframe: Timeframe },
    Message(FeedMessage),
    /// Re-send `feed` starting at `from_seq`
    Request { feed: PublicKey, from_seq: u64 },
    /// Progress update: what the sender has replicated so far
    Timeframe(Timeframe),
}

impl ReplicationMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ReplicationMessage::Hello { space, timeframe } => {
                buf.push(TAG_HELLO);
                buf.extend_from_slice(space.as_bytes());
                timeframe.encode_into(&mut buf);
            }
            ReplicationMessage::Message(message) => {
                buf.reserve(1 + message.encoded_len());
                buf.push(TAG_MESSAGE);
                message.encode_into(&mut buf);
            }
            ReplicationMessage::Request { feed, from_seq } => {
                buf.push(TAG_REQUEST);
                buf.extend_from_slice(feed.as_bytes());
                put_varint(&mut buf, *from_seq);
            }
            ReplicationMessage::Timeframe(timeframe) => {
                buf.push(TAG_TIMEFRAME);
                timeframe.encode_into(&mut buf);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(bytes);
        let message = match reader.read_u8()? {
            TAG_HELLO => ReplicationMessage::Hello {
                space: reader.read_key()?,
                timeframe: Timeframe::decode_from(&mut reader)?,
            },
            TAG_MESSAGE => ReplicationMessage::Message(FeedMessage::decode_from(&mut reader)?),
            TAG_REQUEST => ReplicationMessage::Request {
                feed: reader.read_key()?,
                from_seq: reader.read_varint()?,
            },
            TAG_TIMEFRAME => ReplicationMessage::Timeframe(Timeframe::decode_from(&mut reader)?),
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "replication message",
                    tag,
                })
            }
        };
        reader.finish()?;
        Ok(message)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReplicationMessage::Hello { .. } => "hello",
            ReplicationMessage::Message(_) => "message",
            ReplicationMessage::Request { .. } => "request",
            ReplicationMessage::Timeframe(_) => "timeframe",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::Keypair;

    #[test]
    fn test_each_variant_roundtrips() {
        let feed = Keypair::derive("feed");
        let mut tf = Timeframe::new();
        tf.set(feed.public_key(), 7);
        let messages = [
            ReplicationMessage::Hello {
                space: Keypair::derive("space").public_key(),
                timeframe: tf.clone(),
            },
            ReplicationMessage::Message(FeedMessage::sign(&feed, 3, b"payload".to_vec())),
            ReplicationMessage::Request {
                feed: feed.public_key(),
                from_seq: 300,
            },
            ReplicationMessage::Timeframe(tf),
        ];
        for message in messages {
            let bytes = message.encode();
            assert_eq!(ReplicationMessage::decode(&bytes).unwrap(), message, "{}", message.name());
        }
    }

    #[test]
    fn test_request_layout() {
        let feed = Keypair::derive("feed").public_key();
        let bytes = ReplicationMessage::Request { feed, from_seq: 4 }.encode();
        assert_eq!(bytes[0], TAG_REQUEST);
        assert_eq!(&bytes[1..33], feed.as_bytes());
        assert_eq!(&bytes[33..], &[4]);
    }

    #[test]
    fn test_rejects_unknown_tag_and_truncation() {
        assert!(matches!(
            ReplicationMessage::decode(&[0x7f]),
            Err(DecodeError::UnknownTag { tag: 0x7f, .. })
        ));
        assert!(matches!(
            ReplicationMessage::decode(&[TAG_REQUEST, 1, 2]),
            Err(DecodeError::UnexpectedEof { .. })
        ));
        assert!(ReplicationMessage::decode(&[]).is_err());
    }
}
