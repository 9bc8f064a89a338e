/*
    frame.rs - Teleport frame codec

    Frame layout:

        channel  u16 BE
        length   u32 BE      (length of data)
        flags    u8          (bit 0: credit field present,
                              bit 1: more fragments of this message follow)
        credit   u32 BE      (only if bit 0 set)
        data     length bytes

    A zero-length frame carrying credit is a pure flow-control grant.
    A channel message larger than the credit window travels as several
    fragments; every fragment but the last has bit 1 set.
    FrameDecoder accepts input in arbitrary chunks and yields whole frames.
*/

use super::{TeleportError, TeleportResult};

pub const FLAG_CREDIT: u8 = 0x01;
pub const FLAG_MORE: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_CREDIT | FLAG_MORE;

const BASE_HEADER: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u16,
    pub credit: Option<u32>,
    /// Not the last fragment of its message
    pub more: bool,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn data(channel: u16, data: Vec<u8>) -> Self {
        Self::fragment(channel, data, false)
    }

    pub fn fragment(channel: u16, data: Vec<u8>, more: bool) -> Self {
        Self {
            channel,
            credit: None,
            more,
            data,
        }
    }

    pub fn credit(channel: u16, credit: u32) -> Self {
        Self {
            channel,
            credit: Some(credit),
            more: false,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BASE_HEADER + 4 + self.data.len());
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        let more = if self.more { FLAG_MORE } else { 0 };
        match self.credit {
            Some(credit) => {
                buf.push(FLAG_CREDIT | more);
                buf.extend_from_slice(&credit.to_be_bytes());
            }
            None => buf.push(more),
        }
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// Streaming decoder
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `Ok(None)` if more input is needed.
    pub fn next_frame(&mut self) -> TeleportResult<Option<Frame>> {
        if self.buf.len() < BASE_HEADER {
            return Ok(None);
        }
        let channel = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let length = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]);
        let flags = self.buf[6];

        if length > self.max_frame_size {
            return Err(TeleportError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }
        if flags & !KNOWN_FLAGS != 0 {
            return Err(TeleportError::ProtocolViolation(format!(
                "unknown frame flags {:#04x}",
                flags
            )));
        }

        let header = if flags & FLAG_CREDIT != 0 {
            BASE_HEADER + 4
        } else {
            BASE_HEADER
        };
        let total = header + length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let credit = (flags & FLAG_CREDIT != 0).then(|| {
            u32::from_be_bytes([self.buf[7], self.buf[8], self.buf[9], self.buf[10]])
        });
        let data = self.buf[header..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(Frame {
            channel,
            credit,
            more: flags & FLAG_MORE != 0,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_layout() {
        let bytes = Frame::data(0x0102, b"abc".to_vec()).encode();
        assert_eq!(bytes, vec![0x01, 0x02, 0, 0, 0, 3, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_credit_frame_layout() {
        let bytes = Frame::credit(4, 0x0000_1000).encode();
        assert_eq!(bytes, vec![0, 4, 0, 0, 0, 0, FLAG_CREDIT, 0, 0, 0x10, 0]);
    }

    #[test]
    fn test_fragment_flag() {
        let bytes = Frame::fragment(2, vec![7], true).encode();
        assert_eq!(bytes, vec![0, 2, 0, 0, 0, 1, FLAG_MORE, 7]);
    }

    #[test]
    fn test_decoder_handles_byte_by_byte_input() {
        let frames = vec![
            Frame::fragment(2, b"hel".to_vec(), true),
            Frame::data(2, b"lo".to_vec()),
            Frame::credit(3, 77),
            Frame::data(0, Vec::new()),
        ];
        let stream: Vec<u8> = frames.iter().flat_map(Frame::encode).collect();

        let mut decoder = FrameDecoder::new(1024);
        let mut out = Vec::new();
        for byte in stream {
            decoder.push(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                out.push(frame);
            }
        }
        assert_eq!(out, frames);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_handles_coalesced_input() {
        let mut stream = Frame::data(2, vec![1; 10]).encode();
        stream.extend(Frame::data(4, vec![2; 3]).encode());
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&stream);
        assert_eq!(decoder.next_frame().unwrap().unwrap().channel, 2);
        assert_eq!(decoder.next_frame().unwrap().unwrap().channel, 4);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected_from_header() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&Frame::data(2, vec![0; 17]).encode()[..7]);
        assert!(matches!(
            decoder.next_frame(),
            Err(TeleportError::FrameTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&[0, 2, 0, 0, 0, 0, 0x84]);
        assert!(matches!(
            decoder.next_frame(),
            Err(TeleportError::ProtocolViolation(_))
        ));
    }
}
