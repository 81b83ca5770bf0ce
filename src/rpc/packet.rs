//! RPC包格式
//!
//! ```text
//! offset 0..3   : seq      (u32, big-endian)
//! offset 4..7   : type tag ("AUTH" | "RESP" | "CALL" | "RETN" | "EXCP")
//! offset 8..11  : payload length N (u32, big-endian)
//! offset 12..   : N bytes payload
//! ```

use crate::{
    error::{Error, Result},
    rpc::auth::{Digest, DIGEST_LEN},
};

pub const HEADER_SIZE: usize = 12;

/// AUTH / RESP 的payload长度：challenge | response | salt
pub const AUTH_PAYLOAD_SIZE: usize = 3 * DIGEST_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Auth,
    Resp,
    Call,
    Retn,
    Excp,
}

impl PacketType {
    pub fn tag(self) -> [u8; 4] {
        *match self {
            PacketType::Auth => b"AUTH",
            PacketType::Resp => b"RESP",
            PacketType::Call => b"CALL",
            PacketType::Retn => b"RETN",
            PacketType::Excp => b"EXCP",
        }
    }

    pub fn from_tag(tag: [u8; 4]) -> Option<Self> {
        Some(match &tag {
            b"AUTH" => PacketType::Auth,
            b"RESP" => PacketType::Resp,
            b"CALL" => PacketType::Call,
            b"RETN" => PacketType::Retn,
            b"EXCP" => PacketType::Excp,
            _ => return None,
        })
    }

    pub fn is_auth(self) -> bool {
        matches!(self, PacketType::Auth | PacketType::Resp)
    }
}

/// 包头。`tag`保持原样，未知的类型交给上层决定怎么处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub seq: u32,
    pub tag: [u8; 4],
    pub len: u32,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Header {
            seq: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            tag: [buf[4], buf[5], buf[6], buf[7]],
            len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_tag(self.tag)
    }

    /// 用于日志的tag
    pub fn tag_str(&self) -> String {
        String::from_utf8_lossy(&self.tag).into_owned()
    }
}

/// 编码一个完整的包
pub fn encode(seq: u32, packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Protocol(format!("payload of {} bytes is too large", payload.len())))?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&packet_type.tag());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// 把读到的数据拼接成完整的包
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// 取出下一个完整的包；数据不够时返回`None`
    pub fn next_frame(&mut self) -> Option<(Header, Vec<u8>)> {
        let header = Header::parse(&self.buf)?;
        let end = HEADER_SIZE.checked_add(header.len as usize)?;
        if self.buf.len() < end {
            return None;
        }
        let payload = self.buf[HEADER_SIZE..end].to_vec();
        self.buf.drain(..end);
        Some((header, payload))
    }
}

/// AUTH / RESP 的payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthPayload {
    pub challenge: Digest,
    pub response: Digest,
    pub salt: Digest,
}

impl AuthPayload {
    pub fn encode(&self) -> [u8; AUTH_PAYLOAD_SIZE] {
        let mut out = [0; AUTH_PAYLOAD_SIZE];
        out[..DIGEST_LEN].copy_from_slice(&self.challenge);
        out[DIGEST_LEN..2 * DIGEST_LEN].copy_from_slice(&self.response);
        out[2 * DIGEST_LEN..].copy_from_slice(&self.salt);
        out
    }

    /// 长度不对的payload是协议错误
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != AUTH_PAYLOAD_SIZE {
            return Err(Error::Protocol(format!(
                "malformed authentication packet ({} bytes)",
                payload.len()
            )));
        }
        let field = |n: usize| {
            let mut digest = [0; DIGEST_LEN];
            digest.copy_from_slice(&payload[n * DIGEST_LEN..(n + 1) * DIGEST_LEN]);
            digest
        };
        Ok(Self {
            challenge: field(0),
            response: field(1),
            salt: field(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let frame = encode(0x0102_0304, PacketType::Call, b"xyz").unwrap();
        assert_eq!(&frame[..4], &[1, 2, 3, 4]);
        assert_eq!(&frame[4..8], b"CALL");
        assert_eq!(&frame[8..12], &[0, 0, 0, 3]);
        assert_eq!(&frame[12..], b"xyz");
    }

    #[test]
    fn frames_reassemble_across_chunks() {
        let mut bytes = encode(1, PacketType::Retn, b"first").unwrap();
        bytes.extend(encode(2, PacketType::Excp, b"").unwrap());
        bytes.extend(encode(3, PacketType::Call, b"third").unwrap());

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(5) {
            buffer.extend(chunk);
            while let Some(frame) = buffer.next_frame() {
                frames.push(frame);
            }
        }
        assert!(buffer.is_empty());
        let seqs: Vec<_> = frames.iter().map(|(h, _)| h.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(frames[1].0.packet_type(), Some(PacketType::Excp));
        assert!(frames[1].1.is_empty());
        assert_eq!(frames[2].1, b"third");
    }

    #[test]
    fn unknown_tags_are_preserved() {
        let mut frame = encode(9, PacketType::Call, b"").unwrap();
        frame[4..8].copy_from_slice(b"PING");
        let header = Header::parse(&frame).unwrap();
        assert_eq!(header.packet_type(), None);
        assert_eq!(header.tag_str(), "PING");
    }

    #[test]
    fn auth_payload_must_be_sixty_bytes() {
        let payload = AuthPayload {
            challenge: [1; DIGEST_LEN],
            response: [2; DIGEST_LEN],
            salt: [3; DIGEST_LEN],
        };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 60);
        assert_eq!(AuthPayload::decode(&bytes).unwrap(), payload);
        assert!(matches!(AuthPayload::decode(&bytes[..59]), Err(Error::Protocol(_))));
        assert!(matches!(AuthPayload::decode(&[0; 61]), Err(Error::Protocol(_))));
    }
}
