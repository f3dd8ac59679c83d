//! The 11-byte control message exchanged between clients and the RDV
//! server, and between peers during hole punching.
//!
//! Wire layout, all multi-byte fields network-order:
//! `{ type: u8, port: u16, ip1: u32, ip2: u32 }`.

use std::net::Ipv4Addr;

/// Size in bytes of an encoded [`ControlMessage`]. The RDV server and the
/// client both use this to disambiguate a control datagram from a DTLS
/// record purely by length.
pub const MESSAGE_LEN: usize = 11;

/// First byte of a DTLS record. Any datagram whose first byte falls in
/// this range is never a [`ControlMessage`], regardless of length.
pub const DTLS_CONTENT_TYPES: [u8; 4] = [20, 21, 22, 23];

pub fn looks_like_dtls(first_byte: u8) -> bool {
    DTLS_CONTENT_TYPES.contains(&first_byte)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0,
    Ping = 1,
    AskConnection = 2,
    Pong = 3,
    Ok = 4,
    Nok = 5,
    FwdConnection = 6,
    AnsConnection = 7,
    RejConnection = 8,
    Punch = 9,
    PunchKeepAlive = 10,
    Bye = 11,
    Reconnect = 12,
    CloseConnection = 13,
}

impl MessageType {
    fn from_byte(b: u8) -> Option<Self> {
        use MessageType::*;
        Some(match b {
            0 => Hello,
            1 => Ping,
            2 => AskConnection,
            3 => Pong,
            4 => Ok,
            5 => Nok,
            6 => FwdConnection,
            7 => AnsConnection,
            8 => RejConnection,
            9 => Punch,
            10 => PunchKeepAlive,
            11 => Bye,
            12 => Reconnect,
            13 => CloseConnection,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub ty: MessageType,
    pub port: u16,
    pub ip1: Ipv4Addr,
    pub ip2: Ipv4Addr,
}

impl ControlMessage {
    pub fn new(ty: MessageType, ip1: Ipv4Addr, ip2: Ipv4Addr) -> Self {
        Self {
            ty,
            port: 0,
            ip1,
            ip2,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut buf = [0u8; MESSAGE_LEN];
        buf[0] = self.ty as u8;
        buf[1..3].copy_from_slice(&self.port.to_be_bytes());
        buf[3..7].copy_from_slice(&self.ip1.octets());
        buf[7..11].copy_from_slice(&self.ip2.octets());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != MESSAGE_LEN {
            return Err(CodecError::BadLength(buf.len()));
        }
        let ty = MessageType::from_byte(buf[0]).ok_or(CodecError::UnknownType(buf[0]))?;
        let port = u16::from_be_bytes([buf[1], buf[2]]);
        let ip1 = Ipv4Addr::new(buf[3], buf[4], buf[5], buf[6]);
        let ip2 = Ipv4Addr::new(buf[7], buf[8], buf[9], buf[10]);
        Ok(Self { ty, port, ip1, ip2 })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("control message must be exactly {MESSAGE_LEN} bytes, got {0}")]
    BadLength(usize),
    #[error("unknown control message type byte {0}")]
    UnknownType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_types() -> Vec<MessageType> {
        use MessageType::*;
        vec![
            Hello,
            Ping,
            AskConnection,
            Pong,
            Ok,
            Nok,
            FwdConnection,
            AnsConnection,
            RejConnection,
            Punch,
            PunchKeepAlive,
            Bye,
            Reconnect,
            CloseConnection,
        ]
    }

    #[test]
    fn round_trip_every_type() {
        for ty in all_types() {
            let msg = ControlMessage::new(ty, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3))
                .with_port(30000);
            let encoded = msg.encode();
            assert_eq!(encoded.len(), MESSAGE_LEN);
            let decoded = ControlMessage::decode(&encoded).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn network_byte_order() {
        let msg = ControlMessage::new(MessageType::Hello, Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::UNSPECIFIED)
            .with_port(0x1234);
        let encoded = msg.encode();
        assert_eq!(&encoded[1..3], &[0x12, 0x34]);
        assert_eq!(&encoded[3..7], &[1, 2, 3, 4]);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            ControlMessage::decode(&[0u8; 10]),
            Err(CodecError::BadLength(10))
        ));
        assert!(matches!(
            ControlMessage::decode(&[0u8; 12]),
            Err(CodecError::BadLength(12))
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = [0u8; MESSAGE_LEN];
        buf[0] = 99;
        assert!(matches!(
            ControlMessage::decode(&buf),
            Err(CodecError::UnknownType(99))
        ));
    }

    #[test]
    fn dtls_content_types_are_disjoint_from_control() {
        // A control message's type byte never collides with a DTLS content-type byte,
        // so size is the only disambiguator that's actually needed, but the content-type
        // check guards against any 11-byte DTLS record (there are none in practice for
        // the handshake content types we care about, but keep the guard explicit).
        for b in DTLS_CONTENT_TYPES {
            assert!(MessageType::from_byte(b).is_none());
        }
    }
}
