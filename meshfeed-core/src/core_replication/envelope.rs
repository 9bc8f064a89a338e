/*
    envelope.rs - Framing of every feed payload in a space

        timeframe   Timeframe encoding (author's processed timeframe)
        body_tag    u8: 0x00 data, 0x01 credential
        body        data bytes to the end, or a Credential encoding

    The timeframe is the causal position of the entry: everything it
    covers was processed by the author before writing.
*/

use crate::core_credentials::Credential;
use crate::core_timeframe::Timeframe;
use crate::wire::{DecodeError, WireReader};

const TAG_DATA: u8 = 0x00;
const TAG_CREDENTIAL: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Data(Vec<u8>),
    Credential(Credential),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Data(_) => "data",
            Body::Credential(credential) => credential.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub timeframe: Timeframe,
    pub body: Body,
}

impl Envelope {
    pub fn new(timeframe: Timeframe, body: Body) -> Self {
        Self { timeframe, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.timeframe.encode_into(&mut buf);
        match &self.body {
            Body::Data(data) => {
                buf.push(TAG_DATA);
                buf.extend_from_slice(data);
            }
            Body::Credential(credential) => {
                buf.push(TAG_CREDENTIAL);
                credential.encode_into(&mut buf);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(bytes);
        let timeframe = Timeframe::decode_from(&mut reader)?;
        let body = match reader.read_u8()? {
            TAG_DATA => Body::Data(reader.read_bytes(reader.remaining())?.to_vec()),
            TAG_CREDENTIAL => Body::Credential(Credential::decode_from(&mut reader)?),
            tag => return Err(DecodeError::UnknownTag { what: "envelope body", tag }),
        };
        reader.finish()?;
        Ok(Self { timeframe, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_credentials::Role;
    use crate::core_identity::Keypair;

    fn timeframe() -> Timeframe {
        let mut tf = Timeframe::new();
        tf.set(Keypair::derive("f1").public_key(), 3);
        tf.set(Keypair::derive("f2").public_key(), 0);
        tf
    }

    #[test]
    fn test_data_envelope_roundtrip() {
        let envelope = Envelope::new(timeframe(), Body::Data(b"hello".to_vec()));
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
    }

    #[test]
    fn test_empty_data_is_allowed() {
        let envelope = Envelope::new(Timeframe::new(), Body::Data(Vec::new()));
        let bytes = envelope.encode();
        assert_eq!(bytes, vec![0x00, TAG_DATA]);
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_credential_envelope_roundtrip() {
        let envelope = Envelope::new(
            timeframe(),
            Body::Credential(Credential::AdmitKey {
                subject: Keypair::derive("bob").public_key(),
                role: Role::Member,
            }),
        );
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded.body.kind(), "admit_key");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_unknown_body_tag() {
        let mut bytes = Vec::new();
        Timeframe::new().encode_into(&mut bytes);
        bytes.push(0x09);
        assert_eq!(
            Envelope::decode(&bytes),
            Err(DecodeError::UnknownTag { what: "envelope body", tag: 0x09 })
        );
    }

    #[test]
    fn test_credential_with_trailing_bytes_rejected() {
        let envelope = Envelope::new(
            Timeframe::new(),
            Body::Credential(Credential::UpdateKey {
                subject: Keypair::derive("x").public_key(),
                role: Role::Removed,
            }),
        );
        let mut bytes = envelope.encode();
        bytes.push(0);
        assert!(matches!(Envelope::decode(&bytes), Err(DecodeError::TrailingBytes(1))));
    }
}
