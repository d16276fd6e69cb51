use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, ErrorKind, Result},
    msg::{Header, Message, MessageType},
};

/// `len:u32 | crc:u32`, both big-endian.
pub const FRAME_PREFIX_SIZE: usize = 8;

/// `session_id:u64 | type:u8 | priority:u8 | attachment_count:u16`.
const FIXED_HEADER_SIZE: usize = 12;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

/// Length-prefixed, checksummed frame codec.
///
/// ```text
/// | len u32 | crc u32 | session_id u64 | type u8 | priority u8 | n u16 |
/// | (key_len u32, key, value_len u32, value) * n | body ... |
/// ```
///
/// `len` counts every byte after the 8-byte prefix and `crc` is the CRC-32C
/// of those bytes.
#[derive(Debug, Clone, Copy)]
pub struct WalleCodec {
    max_frame_size: usize,
}

impl Default for WalleCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

fn framing_error(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::FramingError, msg)
}

impl WalleCodec {
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encodes `msg` into a standalone buffer. The frame prefix carries the
    /// computed length and checksum; `msg.header` is not updated.
    ///
    /// # Errors
    pub fn encode_to_bytes(&self, msg: &Message) -> Result<Bytes> {
        let capacity = FRAME_PREFIX_SIZE + FIXED_HEADER_SIZE + msg.body.len();
        let mut dst = BytesMut::with_capacity(capacity);
        self.encode_message(msg, &mut dst)?;
        Ok(dst.freeze())
    }

    fn encode_message(&self, msg: &Message, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        dst.put_u64(0); // reserve for len and crc.
        dst.put_u64(msg.header.session_id);
        dst.put_u8(msg.header.msg_type.as_u8());
        dst.put_u8(msg.header.priority);
        dst.put_u16(u16::try_from(msg.header.attachment.len())?);
        for (key, value) in &msg.header.attachment {
            dst.put_u32(u32::try_from(key.len())?);
            dst.put_slice(key.as_bytes());
            dst.put_u32(u32::try_from(value.len())?);
            dst.put_slice(value.as_bytes());
        }
        dst.put_slice(&msg.body);

        let len = dst.len() - start - FRAME_PREFIX_SIZE;
        if len > self.max_frame_size {
            dst.truncate(start);
            return Err(framing_error(format!(
                "frame is too long: {len} > {}",
                self.max_frame_size
            )));
        }
        let crc = crc32c::crc32c(&dst[start + FRAME_PREFIX_SIZE..]);
        dst[start..start + 4].copy_from_slice(&u32::try_from(len)?.to_be_bytes());
        dst[start + 4..start + FRAME_PREFIX_SIZE].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    fn parse_frame(length: u32, checksum: u32, mut frame: Bytes) -> Result<Message> {
        let session_id = frame.get_u64();
        let raw_type = frame.get_u8();
        let msg_type = MessageType::from_u8(raw_type)
            .ok_or_else(|| framing_error(format!("unknown message type: {raw_type}")))?;
        let priority = frame.get_u8();
        let count = frame.get_u16();

        let mut attachment = BTreeMap::new();
        for _ in 0..count {
            let key = Self::read_string(&mut frame)?;
            let value = Self::read_string(&mut frame)?;
            attachment.insert(key, value);
        }

        Ok(Message {
            header: Header {
                checksum,
                length,
                session_id,
                msg_type,
                priority,
                attachment,
            },
            body: frame,
        })
    }

    fn read_string(frame: &mut Bytes) -> Result<String> {
        if frame.remaining() < 4 {
            return Err(framing_error("truncated attachment"));
        }
        let len = usize::try_from(frame.get_u32())?;
        if frame.remaining() < len {
            return Err(framing_error("truncated attachment"));
        }
        String::from_utf8(frame.split_to(len).to_vec())
            .map_err(|e| framing_error(format!("attachment is not utf-8: {e}")))
    }
}

impl Decoder for WalleCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let checksum = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);

        let len = usize::try_from(length)?;
        if len < FIXED_HEADER_SIZE {
            return Err(framing_error(format!("frame is too short: {len}")));
        }
        if len > self.max_frame_size {
            return Err(framing_error(format!(
                "frame is too long: {len} > {}",
                self.max_frame_size
            )));
        }

        if src.len() < FRAME_PREFIX_SIZE + len {
            src.reserve(FRAME_PREFIX_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_PREFIX_SIZE);
        let frame = src.split_to(len).freeze();
        let actual = crc32c::crc32c(&frame);
        if actual != checksum {
            return Err(framing_error(format!(
                "checksum mismatch: expect {checksum:08X}, got {actual:08X}"
            )));
        }
        Self::parse_frame(length, checksum, frame).map(Some)
    }
}

impl Encoder<Message> for WalleCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        self.encode_message(&msg, dst)
    }
}

impl Encoder<&Message> for WalleCodec {
    type Error = Error;

    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<()> {
        self.encode_message(msg, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut header = Header::new(MessageType::Request, 0x0102_0304_0506_0708);
        header.priority = 7;
        header.attachment.insert("trace".into(), "abc".into());
        header.attachment.insert("zone".into(), "".into());
        Message::new(header, Bytes::from_static(b"{\"requestId\":\"1\"}"))
    }

    fn decode_all(codec: &mut WalleCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut out = vec![];
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_encode_sets_length_and_checksum() {
        let codec = WalleCodec::default();
        let bytes = codec.encode_to_bytes(&sample()).unwrap();
        let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(len, bytes.len() - FRAME_PREFIX_SIZE);
        assert_eq!(crc, crc32c::crc32c(&bytes[8..]));
    }

    #[test]
    fn test_header_checksum_and_length_are_computed() {
        let mut codec = WalleCodec::default();
        let mut msg = sample();
        let expected = codec.encode_to_bytes(&msg).unwrap();
        msg.header.checksum = 0xDEAD_BEEF;
        msg.header.length = 7;
        assert_eq!(codec.encode_to_bytes(&msg).unwrap(), expected);
        assert_eq!(msg.header.checksum, 0xDEAD_BEEF);

        let decoded = decode_all(&mut codec, &mut BytesMut::from(&expected[..]));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].header.checksum, crc32c::crc32c(&expected[8..]));
        assert_eq!(decoded[0].header.length as usize, expected.len() - FRAME_PREFIX_SIZE);
    }

    #[test]
    fn test_fragmented_decode() {
        let mut codec = WalleCodec::default();
        let mut heartbeat = Message::heartbeat(5, MessageType::HeartbeatRsp);
        heartbeat.header.priority = 1;
        let mut stream = BytesMut::new();
        codec.encode(&sample(), &mut stream).unwrap();
        codec.encode(&heartbeat, &mut stream).unwrap();
        let stream = stream.freeze();

        for chunk_size in [1, 3, 8, 13, stream.len()] {
            let mut buf = BytesMut::new();
            let mut decoded = vec![];
            for chunk in stream.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                decoded.extend(decode_all(&mut codec, &mut buf));
            }
            assert!(buf.is_empty());
            assert_eq!(decoded.len(), 2);

            let expected = sample();
            assert_eq!(decoded[0].header.session_id, expected.header.session_id);
            assert_eq!(decoded[0].header.msg_type, expected.header.msg_type);
            assert_eq!(decoded[0].header.priority, expected.header.priority);
            assert_eq!(decoded[0].header.attachment, expected.header.attachment);
            assert_eq!(decoded[0].body, expected.body);
            assert_eq!(decoded[1].header.msg_type, MessageType::HeartbeatRsp);
            assert_eq!(decoded[1].header.priority, 1);
            assert!(decoded[1].body.is_empty());
        }
    }

    #[test]
    fn test_corruption_is_framing_error() {
        let codec = WalleCodec::default();
        let bytes = codec.encode_to_bytes(&sample()).unwrap();
        // every checksum byte, then every byte covered by the checksum.
        for idx in 4..bytes.len() {
            for flip in [0x01u8, 0x80, 0xFF] {
                let mut corrupted = BytesMut::from(&bytes[..]);
                corrupted[idx] ^= flip;
                let err = WalleCodec::default().decode(&mut corrupted).unwrap_err();
                assert_eq!(err.kind, ErrorKind::FramingError, "byte {idx} flip {flip:02X}");
            }
        }
    }

    #[test]
    fn test_invalid_length() {
        let mut codec = WalleCodec::new(64);
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u32(0);
        assert_eq!(codec.decode(&mut buf).unwrap_err().kind, ErrorKind::FramingError);

        let mut buf = BytesMut::new();
        buf.put_u32(65);
        buf.put_u32(0);
        assert_eq!(codec.decode(&mut buf).unwrap_err().kind, ErrorKind::FramingError);

        let big = Message::new(
            Header::new(MessageType::Request, 1),
            Bytes::from(vec![b'x'; 128]),
        );
        let mut buf = BytesMut::new();
        assert_eq!(codec.encode(&big, &mut buf).unwrap_err().kind, ErrorKind::FramingError);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_attachment() {
        let mut frame = BytesMut::new();
        frame.put_u64(1);
        frame.put_u8(MessageType::Request.as_u8());
        frame.put_u8(0);
        frame.put_u16(1);
        frame.put_u32(100);
        frame.put_slice(b"key");

        let mut buf = BytesMut::new();
        buf.put_u32(frame.len() as u32);
        buf.put_u32(crc32c::crc32c(&frame));
        buf.extend_from_slice(&frame);
        let err = WalleCodec::default().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FramingError);
    }
}
