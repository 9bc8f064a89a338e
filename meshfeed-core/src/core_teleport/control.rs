//! Control channel messages (channel 0)
//!
//! `0x01 Open  | id u16 BE | name_len u8 | name (utf-8)`
//! `0x02 Close | id u16 BE`

use crate::wire::{DecodeError, WireReader};

pub const CONTROL_CHANNEL: u16 = 0;
pub const MAX_CHANNEL_NAME: usize = 255;

const TAG_OPEN: u8 = 0x01;
const TAG_CLOSE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Open { id: u16, name: String },
    Close { id: u16 },
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::Open { id, name } => {
                let mut buf = Vec::with_capacity(4 + name.len());
                buf.push(TAG_OPEN);
                buf.extend_from_slice(&id.to_be_bytes());
                // Callers reject longer names before encoding.
                buf.push(name.len().min(MAX_CHANNEL_NAME) as u8);
                buf.extend_from_slice(&name.as_bytes()[..name.len().min(MAX_CHANNEL_NAME)]);
                buf
            }
            ControlMessage::Close { id } => {
                let mut buf = vec![TAG_CLOSE];
                buf.extend_from_slice(&id.to_be_bytes());
                buf
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(bytes);
        let message = match reader.read_u8()? {
            TAG_OPEN => {
                let id = reader.read_u16()?;
                let len = reader.read_u8()? as usize;
                let name = std::str::from_utf8(reader.read_bytes(len)?)
                    .map_err(|e| DecodeError::Invalid(format!("channel name: {}", e)))?
                    .to_string();
                ControlMessage::Open { id, name }
            }
            TAG_CLOSE => ControlMessage::Close {
                id: reader.read_u16()?,
            },
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "control message",
                    tag,
                })
            }
        };
        reader.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_layout() {
        let bytes = ControlMessage::Open {
            id: 6,
            name: "replication".to_string(),
        }
        .encode();
        assert_eq!(&bytes[..4], &[0x01, 0, 6, 11]);
        assert_eq!(&bytes[4..], b"replication");
        assert_eq!(
            ControlMessage::decode(&bytes).unwrap(),
            ControlMessage::Open {
                id: 6,
                name: "replication".to_string()
            }
        );
    }

    #[test]
    fn test_close_layout() {
        let bytes = ControlMessage::Close { id: 0x0203 }.encode();
        assert_eq!(bytes, vec![0x02, 0x02, 0x03]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ControlMessage::decode(&[0x07]).is_err());
        assert!(ControlMessage::decode(&[0x01, 0, 2, 3, b'a']).is_err());
        assert!(ControlMessage::decode(&[0x02, 0, 2, 9]).is_err());
        assert!(ControlMessage::decode(&[0x01, 0, 2, 2, 0xff, 0xfe]).is_err());
    }
}
