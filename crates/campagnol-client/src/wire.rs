//! Small helpers shared by every thread that talks to the RDV server or a
//! peer's real endpoint over the single shared UDP socket.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};

use campagnol_proto::ControlMessage;

pub fn send_control(socket: &UdpSocket, to: SocketAddrV4, message: ControlMessage) {
    if let Err(error) = socket.send_to(&message.encode(), SocketAddr::V4(to)) {
        tracing::warn!(%error, %to, ty = ?message.ty, "failed to send control message");
    }
}

/// First byte of a DTLS record identifying it as an alert.
pub const DTLS_ALERT_CONTENT_TYPE: u8 = 21;
/// First byte of a DTLS record identifying it as application data.
pub const DTLS_APPLICATION_DATA: u8 = 23;
/// `ContentType(1) + ProtocolVersion(2) + Epoch(2) + SequenceNumber(6) + Length(2)`.
pub const DTLS_RECORD_HEADER_LEN: usize = 13;

/// Builds a fatal "internal_error" DTLS alert record reusing the
/// version/epoch/sequence fields of `incoming`, per `spec.md` §4.6: sent
/// to an unrecognized peer sending application data, to encourage a
/// clean teardown on their side without this process creating any state.
pub fn synthetic_fatal_alert(incoming: &[u8]) -> Option<[u8; DTLS_RECORD_HEADER_LEN + 2]> {
    if incoming.len() < DTLS_RECORD_HEADER_LEN {
        return None;
    }
    let mut record = [0u8; DTLS_RECORD_HEADER_LEN + 2];
    record[0] = DTLS_ALERT_CONTENT_TYPE;
    record[1..11].copy_from_slice(&incoming[1..11]);
    record[11..13].copy_from_slice(&2u16.to_be_bytes());
    record[13] = 2; // AlertLevel::fatal
    record[14] = 80; // AlertDescription::internal_error
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_alert_reuses_version_epoch_sequence() {
        let mut incoming = [0u8; 40];
        incoming[0] = DTLS_APPLICATION_DATA;
        incoming[1..11].copy_from_slice(&[0xfe, 0xfd, 0, 1, 0, 0, 0, 0, 0, 7]);
        let alert = synthetic_fatal_alert(&incoming).unwrap();
        assert_eq!(alert[0], DTLS_ALERT_CONTENT_TYPE);
        assert_eq!(&alert[1..11], &incoming[1..11]);
        assert_eq!(&alert[11..13], &2u16.to_be_bytes());
        assert_eq!(&alert[13..15], &[2, 80]);
    }

    #[test]
    fn too_short_incoming_yields_no_alert() {
        assert!(synthetic_fatal_alert(&[23, 1, 2]).is_none());
    }
}
