use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::sdp::description::common::{Address, Attribute, ConnectionInformation};
use webrtc::sdp::description::media::{MediaName, RangedPort};
use webrtc::sdp::description::session::{Origin, TimeDescription, Timing};
use webrtc::sdp::{MediaDescription, SessionDescription};

use crate::sfu::TrackInfo;

/// Fixed payload types advertised to the muxer; the sink rewrites every
/// packet to match.
pub const PAYLOAD_TYPE_VIDEO: u8 = 96;
pub const PAYLOAD_TYPE_AUDIO: u8 = 97;

/// Minimal receive-side SDP describing the publisher tracks on the given
/// loopback ports.
pub fn build_sdp(tracks: &[TrackInfo], video_port: u16, audio_port: u16) -> String {
    let media_descriptions = tracks
        .iter()
        .map(|track| {
            let (port, payload_type) = match track.kind {
                RTPCodecType::Audio => (audio_port, PAYLOAD_TYPE_AUDIO),
                _ => (video_port, PAYLOAD_TYPE_VIDEO),
            };
            let (codec, clock_rate, channels) = codec_entry(track);
            MediaDescription {
                media_name: MediaName {
                    media: kind_name(track.kind).to_owned(),
                    port: RangedPort {
                        value: port as isize,
                        range: None,
                    },
                    protos: vec!["RTP/AVP".to_owned()],
                    formats: vec![payload_type.to_string()],
                },
                media_title: None,
                connection_information: None,
                bandwidth: vec![],
                encryption_key: None,
                attributes: vec![Attribute::new(
                    "rtpmap".to_owned(),
                    Some(rtpmap(payload_type, codec, clock_rate, channels)),
                )],
            }
        })
        .collect();

    let session_description = SessionDescription {
        version: 0,
        origin: Origin {
            username: "-".to_owned(),
            session_id: 0,
            session_version: 0,
            network_type: "IN".to_owned(),
            address_type: "IP4".to_owned(),
            unicast_address: "127.0.0.1".to_owned(),
        },
        session_name: "livecast recording".to_owned(),
        session_information: None,
        uri: None,
        email_address: None,
        phone_number: None,
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_owned(),
            address_type: "IP4".to_owned(),
            address: Some(Address {
                address: "127.0.0.1".to_owned(),
                ttl: None,
                range: None,
            }),
        }),
        bandwidth: vec![],
        time_descriptions: vec![TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: vec![],
        }],
        time_zones: vec![],
        encryption_key: None,
        attributes: vec![],
        media_descriptions,
    };

    session_description.marshal()
}

fn kind_name(kind: RTPCodecType) -> &'static str {
    match kind {
        RTPCodecType::Audio => "audio",
        _ => "video",
    }
}

/// Codec name, clock rate, and channel count for the rtpmap line. Unknown
/// mime types fall back to the kind's default codec.
fn codec_entry(track: &TrackInfo) -> (&'static str, u32, u16) {
    match track.mime_type.to_ascii_lowercase().as_str() {
        "video/vp8" => ("VP8", 90_000, 0),
        "video/vp9" => ("VP9", 90_000, 0),
        "video/h264" => ("H264", 90_000, 0),
        "audio/opus" => ("opus", 48_000, 2),
        "audio/pcmu" => ("PCMU", 8_000, 0),
        _ if track.kind == RTPCodecType::Audio => ("opus", 48_000, 2),
        _ => ("VP8", 90_000, 0),
    }
}

fn rtpmap(payload_type: u8, codec: &str, clock_rate: u32, channels: u16) -> String {
    if channels > 0 {
        format!("{payload_type} {codec}/{clock_rate}/{channels}")
    } else {
        format!("{payload_type} {codec}/{clock_rate}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(kind: RTPCodecType, mime_type: &str, clock_rate: u32) -> TrackInfo {
        TrackInfo {
            kind,
            mime_type: mime_type.to_owned(),
            clock_rate,
        }
    }

    #[test]
    fn vp8_and_opus_sdp() {
        let tracks = vec![
            track(RTPCodecType::Video, "video/VP8", 90_000),
            track(RTPCodecType::Audio, "audio/opus", 48_000),
        ];
        let sdp = build_sdp(&tracks, 5000, 5002);
        assert!(sdp.contains("c=IN IP4 127.0.0.1"));
        assert!(sdp.contains("m=video 5000 RTP/AVP 96"));
        assert!(sdp.contains("a=rtpmap:96 VP8/90000"));
        assert!(sdp.contains("m=audio 5002 RTP/AVP 97"));
        assert!(sdp.contains("a=rtpmap:97 opus/48000/2"));
    }

    #[test]
    fn h264_maps_to_90khz() {
        let tracks = vec![track(RTPCodecType::Video, "video/H264", 90_000)];
        let sdp = build_sdp(&tracks, 6000, 6002);
        assert!(sdp.contains("a=rtpmap:96 H264/90000"));
    }

    #[test]
    fn pcmu_maps_to_8khz() {
        let tracks = vec![track(RTPCodecType::Audio, "audio/PCMU", 8_000)];
        let sdp = build_sdp(&tracks, 6000, 6002);
        assert!(sdp.contains("m=audio 6002 RTP/AVP 97"));
        assert!(sdp.contains("a=rtpmap:97 PCMU/8000"));
    }

    #[test]
    fn unknown_codec_falls_back_by_kind() {
        let tracks = vec![
            track(RTPCodecType::Video, "video/AV1", 90_000),
            track(RTPCodecType::Audio, "audio/G722", 8_000),
        ];
        let sdp = build_sdp(&tracks, 6000, 6002);
        assert!(sdp.contains("a=rtpmap:96 VP8/90000"));
        assert!(sdp.contains("a=rtpmap:97 opus/48000/2"));
    }
}
