//! Message framing
//!
//! Every ring slot carries one frame: a 16-byte little-endian header
//! followed by `len` payload bytes.
//!
//! ```text
//! 0:  src u32 | 4: dst u32 | 8: reserved u32 | 12: len u16 | 14: flags u16
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use multicore_ipc_core::{IpcError, ProcId, Result, MESSAGE_HEADER_SIZE};

/// Frame header (16 bytes, fixed layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub src: u32,
    pub dst: u32,
    pub reserved: u32,
    pub len: u16,
    pub flags: u16,
}

impl MessageHeader {
    pub fn new(src: u32, dst: u32, len: u16) -> Self {
        Self {
            src,
            dst,
            reserved: 0,
            len,
            flags: 0,
        }
    }

    /// Serialize header to bytes (little-endian)
    pub fn to_bytes(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut bytes = [0u8; MESSAGE_HEADER_SIZE];
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE);

        buf.put_u32_le(self.src);
        buf.put_u32_le(self.dst);
        buf.put_u32_le(self.reserved);
        buf.put_u16_le(self.len);
        buf.put_u16_le(self.flags);

        bytes.copy_from_slice(&buf[..MESSAGE_HEADER_SIZE]);
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(IpcError::Malformed(format!(
                "frame of {} bytes is shorter than the header",
                bytes.len()
            )));
        }

        Ok(Self {
            src: bytes.get_u32_le(),
            dst: bytes.get_u32_le(),
            reserved: bytes.get_u32_le(),
            len: bytes.get_u16_le(),
            flags: bytes.get_u16_le(),
        })
    }
}

/// A delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Processor the message came from
    pub from: ProcId,
    /// Sender's endpoint address
    pub src: u32,
    /// Receiving endpoint address
    pub dst: u32,
    pub flags: u16,
    pub payload: Bytes,
}

impl Message {
    /// Split a received frame into header fields and payload, without copying
    pub fn decode(from: ProcId, frame: Bytes) -> Result<Self> {
        let header = MessageHeader::from_bytes(&frame)?;
        let end = MESSAGE_HEADER_SIZE + header.len as usize;
        if frame.len() < end {
            return Err(IpcError::Malformed(format!(
                "header declares {} payload bytes, frame holds {}",
                header.len,
                frame.len() - MESSAGE_HEADER_SIZE
            )));
        }

        Ok(Self {
            from,
            src: header.src,
            dst: header.dst,
            flags: header.flags,
            payload: frame.slice(MESSAGE_HEADER_SIZE..end),
        })
    }

    /// A zero-length payload asks the receiving loop to stop
    pub fn is_teardown(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = MessageHeader {
            src: 1024,
            dst: 53,
            reserved: 0,
            len: 40,
            flags: 0x0102,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &1024u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &53u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
        assert_eq!(&bytes[12..14], &40u16.to_le_bytes());
        assert_eq!(&bytes[14..16], &[0x02, 0x01]);

        assert_eq!(MessageHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_decode_frame() {
        let mut frame = BytesMut::new();
        frame.put_slice(&MessageHeader::new(1025, 100, 5).to_bytes());
        frame.put_slice(b"hello");

        let msg = Message::decode(ProcId(1), frame.freeze()).unwrap();
        assert_eq!(msg.from, ProcId(1));
        assert_eq!((msg.src, msg.dst), (1025, 100));
        assert_eq!(msg.payload.as_ref(), b"hello");
        assert!(!msg.is_teardown());
    }

    #[test]
    fn test_decode_rejects_short_frames() {
        assert!(matches!(
            Message::decode(ProcId(0), Bytes::from_static(&[0u8; 10])),
            Err(IpcError::Malformed(_))
        ));

        let mut frame = BytesMut::new();
        frame.put_slice(&MessageHeader::new(1, 2, 8).to_bytes());
        frame.put_slice(b"abc");
        assert!(Message::decode(ProcId(0), frame.freeze()).is_err());
    }

    #[test]
    fn test_empty_payload_is_teardown() {
        let frame = Bytes::copy_from_slice(&MessageHeader::new(1, 2, 0).to_bytes());
        let msg = Message::decode(ProcId(0), frame).unwrap();
        assert!(msg.is_teardown());
        assert_eq!(msg.len(), 0);
    }
}
