use tokio::net::UdpSocket;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::sdp::{PAYLOAD_TYPE_AUDIO, PAYLOAD_TYPE_VIDEO};
use crate::sfu::RecordingSink;

/// Forwards RTP copies to the muxer's loopback UDP ports, rewriting each
/// packet's payload type to the fixed value advertised in the SDP. The
/// sockets are connected, so sends are addressless and never allocate.
#[derive(Debug)]
pub struct UdpSink {
    video: UdpSocket,
    audio: UdpSocket,
}

impl UdpSink {
    pub fn new(video: UdpSocket, audio: UdpSocket) -> Self {
        Self { video, audio }
    }
}

/// Rewrite the payload-type byte in place, preserving the marker bit.
pub(crate) fn rewrite_payload_type(packet: &mut [u8], payload_type: u8) {
    if packet.len() < 2 {
        return;
    }
    packet[1] = (packet[1] & 0x80) | (payload_type & 0x7F);
}

impl RecordingSink for UdpSink {
    fn write_rtp(&self, kind: RTPCodecType, mut packet: Vec<u8>) {
        if packet.len() < 2 {
            return;
        }
        let (payload_type, socket) = match kind {
            RTPCodecType::Audio => (PAYLOAD_TYPE_AUDIO, &self.audio),
            _ => (PAYLOAD_TYPE_VIDEO, &self.video),
        };
        rewrite_payload_type(&mut packet, payload_type);
        // Dropped packets are tolerated; the forwarding loop must not block.
        let _ = socket.try_send(&packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_sets_payload_type() {
        let mut packet = vec![0x80, 0x6F, 0x00, 0x01];
        rewrite_payload_type(&mut packet, PAYLOAD_TYPE_VIDEO);
        assert_eq!(packet[1] & 0x7F, 96);
        assert_eq!(packet[1] & 0x80, 0);
    }

    #[test]
    fn rewrite_preserves_marker_bit() {
        let mut packet = vec![0x80, 0xEF, 0x00, 0x01];
        rewrite_payload_type(&mut packet, PAYLOAD_TYPE_AUDIO);
        assert_eq!(packet[1] & 0x80, 0x80);
        assert_eq!(packet[1] & 0x7F, 97);
    }

    #[test]
    fn short_packet_is_left_alone() {
        let mut packet = vec![0x80];
        rewrite_payload_type(&mut packet, PAYLOAD_TYPE_VIDEO);
        assert_eq!(packet, vec![0x80]);
    }
}
