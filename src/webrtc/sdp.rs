//! SDP offer parsing and answer writing.
//!
//! Only the parts of RFC 4566/8866 a browser offer exercises are understood;
//! everything else is ignored on parse and never echoed in the answer.

use super::error::{Error, Result};
use super::transceiver::{Codec, Direction};

pub const MID_EXTENSION_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";

#[derive(Debug, Clone, PartialEq)]
pub struct Extmap {
    pub id: u8,
    pub uri: String,
}

impl Extmap {
    /// `a=extmap:<id>[/<direction>] <uri> [<attributes>]`
    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let id = parts.next()?.split('/').next()?.parse().ok()?;
        let uri = parts.next()?.to_string();
        Some(Self { id, uri })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub algorithm: String,
    pub value: String,
}

/// Transport attributes that may appear at session or media level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportInfo {
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub setup: Option<String>,
}

impl TransportInfo {
    /// Returns false when `line` is not a transport attribute.
    fn parse_attribute(&mut self, line: &str) -> bool {
        if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
            self.ice_ufrag = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
            self.ice_pwd = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("a=fingerprint:") {
            if let Some((algorithm, value)) = v.trim().split_once(' ') {
                self.fingerprint = Some(Fingerprint {
                    algorithm: algorithm.to_ascii_lowercase(),
                    value: value.trim().to_string(),
                });
            }
        } else if let Some(v) = line.strip_prefix("a=setup:") {
            self.setup = Some(v.trim().to_string());
        } else {
            return false;
        }
        true
    }

    fn or(&self, session: &TransportInfo) -> TransportInfo {
        TransportInfo {
            ice_ufrag: self.ice_ufrag.clone().or_else(|| session.ice_ufrag.clone()),
            ice_pwd: self.ice_pwd.clone().or_else(|| session.ice_pwd.clone()),
            fingerprint: self
                .fingerprint
                .clone()
                .or_else(|| session.fingerprint.clone()),
            setup: self.setup.clone().or_else(|| session.setup.clone()),
        }
    }
}

/// One `m=` section of an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    pub media_type: String,
    pub protocol: String,
    pub formats: Vec<String>,
    pub mid: Option<String>,
    pub direction: Option<Direction>,
    pub codecs: Vec<Codec>,
    pub extmaps: Vec<Extmap>,
    pub rtcp_mux: bool,
    pub rtcp_rsize: bool,
    /// Media-level values, with session-level ones filled in.
    pub transport: TransportInfo,
    pub candidates: Vec<String>,
}

impl MediaDescription {
    fn new(m_line: &str) -> Result<Self> {
        let mut parts = m_line.split_whitespace();
        let media_type = parts
            .next()
            .ok_or_else(|| Error::malformed("empty m= line"))?
            .to_string();
        let _port = parts.next();
        let protocol = parts
            .next()
            .ok_or_else(|| Error::malformed(format!("m={} without protocol", media_type)))?
            .to_string();
        Ok(Self {
            media_type,
            protocol,
            formats: parts.map(str::to_string).collect(),
            mid: None,
            direction: None,
            codecs: Vec::new(),
            extmaps: Vec::new(),
            rtcp_mux: false,
            rtcp_rsize: false,
            transport: TransportInfo::default(),
            candidates: Vec::new(),
        })
    }

    fn parse_attribute(&mut self, line: &str) {
        if self.transport.parse_attribute(line) {
            return;
        }
        if let Some(v) = line.strip_prefix("a=mid:") {
            self.mid = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("a=rtpmap:") {
            match Codec::parse_rtpmap(v) {
                Some(codec) => self.codecs.push(codec),
                None => tracing::debug!("Ignoring bad rtpmap {}", v),
            }
        } else if let Some(v) = line.strip_prefix("a=rtcp-fb:") {
            if let Some((pt, fb)) = v.trim().split_once(' ') {
                let pt = pt.parse::<u8>().ok();
                if let Some(codec) = self.codecs.iter_mut().find(|c| Some(c.payload_type) == pt) {
                    codec.feedback.push(fb.trim().to_string());
                }
            }
        } else if let Some(v) = line.strip_prefix("a=extmap:") {
            if let Some(ext) = Extmap::parse(v) {
                self.extmaps.push(ext);
            }
        } else if let Some(v) = line.strip_prefix("a=candidate:") {
            self.candidates.push(v.trim().to_string());
        } else if line == "a=rtcp-mux" {
            self.rtcp_mux = true;
        } else if line == "a=rtcp-rsize" {
            self.rtcp_rsize = true;
        } else if let Some(d) = line.strip_prefix("a=").and_then(Direction::parse) {
            self.direction = Some(d);
        }
    }

    /// Offered direction, `sendrecv` when absent.
    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or(Direction::SendRecv)
    }

    pub fn mid_extension_id(&self) -> Option<u8> {
        self.extmaps
            .iter()
            .find(|e| e.uri == MID_EXTENSION_URI)
            .map(|e| e.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDescription {
    pub bundle_groups: Vec<Vec<String>>,
    pub transport: TransportInfo,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut session = SessionDescription::default();
        let mut current: Option<MediaDescription> = None;

        for line in sdp.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            if let Some(m_line) = line.strip_prefix("m=") {
                if let Some(media) = current.take() {
                    session.media.push(media);
                }
                current = Some(MediaDescription::new(m_line)?);
                continue;
            }
            match &mut current {
                Some(media) => media.parse_attribute(line),
                None => {
                    if let Some(v) = line.strip_prefix("a=group:BUNDLE") {
                        session
                            .bundle_groups
                            .push(v.split_whitespace().map(str::to_string).collect());
                    } else {
                        session.transport.parse_attribute(line);
                    }
                }
            }
        }
        if let Some(media) = current.take() {
            session.media.push(media);
        }
        if session.media.is_empty() {
            return Err(Error::NegotiationRejected("offer has no media sections".into()));
        }

        let session_transport = session.transport.clone();
        for media in &mut session.media {
            media.transport = media.transport.or(&session_transport);
        }
        Ok(session)
    }

    /// Whether the offer asks for DTLS-SRTP.
    pub fn has_fingerprint(&self) -> bool {
        self.media.iter().any(|m| m.transport.fingerprint.is_some())
    }
}

// ---------------------------------------------------------------------------
// Answer
// ---------------------------------------------------------------------------

/// ICE/DTLS attributes written once per bundle, on its first m-line.
#[derive(Debug, Clone)]
pub struct AnswerTransport {
    pub candidates: Vec<String>,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// Our certificate fingerprint; `None` when running unencrypted.
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnswerSsrc {
    pub ssrc: u32,
    pub stream_id: String,
    pub track_id: String,
}

impl AnswerSsrc {
    /// `stream_<mid/2>`/`track_<mid%2>` so an audio+video pair shares a stream.
    pub fn for_mid(mid: &str, ssrc: u32) -> Self {
        let (stream_id, track_id) = match mid.parse::<u32>() {
            Ok(n) => (format!("stream_{}", n / 2), format!("track_{}", n % 2)),
            Err(_) => (format!("stream_{}", mid), format!("track_{}", mid)),
        };
        Self {
            ssrc,
            stream_id,
            track_id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AnswerMedia {
    Accepted {
        media_type: String,
        mid: String,
        direction: Direction,
        codecs: Vec<Codec>,
        extmaps: Vec<Extmap>,
        rtcp_mux: bool,
        rtcp_rsize: bool,
        transport: Option<AnswerTransport>,
        ssrc: Option<AnswerSsrc>,
    },
    /// Port 0 with the offered protocol and formats.
    Rejected {
        media_type: String,
        protocol: String,
        formats: Vec<String>,
        mid: Option<String>,
    },
}

pub fn write_answer(groups: &[Vec<String>], media: &[AnswerMedia]) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str("o=- 0 0 IN IP4 127.0.0.1\r\n");
    sdp.push_str("s=NODEPEER\r\n");
    sdp.push_str("t=0 0\r\n");
    for group in groups {
        sdp.push_str(&format!("a=group:BUNDLE {}\r\n", group.join(" ")));
    }

    for m in media {
        match m {
            AnswerMedia::Rejected {
                media_type,
                protocol,
                formats,
                mid,
            } => {
                sdp.push_str(&format!("m={} 0 {} {}\r\n", media_type, protocol, formats.join(" ")));
                sdp.push_str("c=IN IP4 0.0.0.0\r\n");
                if let Some(mid) = mid {
                    sdp.push_str(&format!("a=mid:{}\r\n", mid));
                }
                sdp.push_str("a=inactive\r\n");
            }
            AnswerMedia::Accepted {
                media_type,
                mid,
                direction,
                codecs,
                extmaps,
                rtcp_mux,
                rtcp_rsize,
                transport,
                ssrc,
            } => {
                let pts: Vec<String> = codecs.iter().map(|c| c.payload_type.to_string()).collect();
                sdp.push_str(&format!(
                    "m={} 9 UDP/TLS/RTP/SAVPF {}\r\n",
                    media_type,
                    pts.join(" ")
                ));
                sdp.push_str("c=IN IP4 0.0.0.0\r\n");
                sdp.push_str(&format!("a=mid:{}\r\n", mid));
                for ext in extmaps {
                    sdp.push_str(&format!("a=extmap:{} {}\r\n", ext.id, ext.uri));
                }
                sdp.push_str(&format!("a={}\r\n", direction));
                if *rtcp_mux {
                    sdp.push_str("a=rtcp-mux\r\n");
                }
                if *rtcp_rsize {
                    sdp.push_str("a=rtcp-rsize\r\n");
                }
                for codec in codecs {
                    sdp.push_str(&format!(
                        "a=rtpmap:{} {}\r\n",
                        codec.payload_type,
                        codec.encoding()
                    ));
                    for fb in codec.feedback.iter().filter(|fb| fb.starts_with("nack")) {
                        sdp.push_str(&format!("a=rtcp-fb:{} {}\r\n", codec.payload_type, fb));
                    }
                }
                if let Some(t) = transport {
                    for candidate in &t.candidates {
                        sdp.push_str(&format!("a={}\r\n", candidate));
                    }
                    sdp.push_str(&format!("a=ice-ufrag:{}\r\n", t.ice_ufrag));
                    sdp.push_str(&format!("a=ice-pwd:{}\r\n", t.ice_pwd));
                    if let Some(fp) = &t.fingerprint {
                        sdp.push_str(&format!("a=fingerprint:sha-256 {}\r\n", fp));
                        sdp.push_str("a=setup:passive\r\n");
                    }
                }
                if let Some(s) = ssrc {
                    sdp.push_str(&format!(
                        "a=ssrc:{} msid:{} {}\r\n",
                        s.ssrc, s.stream_id, s.track_id
                    ));
                    sdp.push_str(&format!("a=msid:{} {}\r\n", s.stream_id, s.track_id));
                }
            }
        }
    }
    sdp
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const FINGERPRINT: &str = "sha-256 AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89";

    /// A trimmed browser offer: BUNDLE of audio (mid 0) and video (mid 1).
    pub(crate) fn browser_offer(audio_direction: &str, with_fingerprint: bool) -> String {
        let mut sdp = String::new();
        sdp.push_str("v=0\r\n");
        sdp.push_str("o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n");
        sdp.push_str("s=-\r\n");
        sdp.push_str("t=0 0\r\n");
        sdp.push_str("a=group:BUNDLE 0 1\r\n");
        sdp.push_str("a=msid-semantic: WMS\r\n");
        sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n");
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str("a=ice-ufrag:rUfr\r\n");
        sdp.push_str("a=ice-pwd:remote-password-remote\r\n");
        if with_fingerprint {
            sdp.push_str(&format!("a=fingerprint:{}\r\n", FINGERPRINT));
        }
        sdp.push_str("a=setup:actpass\r\n");
        sdp.push_str("a=mid:0\r\n");
        sdp.push_str("a=extmap:4 urn:ietf:params:rtp-hdrext:sdes:mid\r\n");
        sdp.push_str("a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n");
        sdp.push_str(&format!("a={}\r\n", audio_direction));
        sdp.push_str("a=rtcp-mux\r\n");
        sdp.push_str("a=rtpmap:111 opus/48000/2\r\n");
        sdp.push_str("a=rtcp-fb:111 transport-cc\r\n");
        sdp.push_str("a=fmtp:111 minptime=10;useinbandfec=1\r\n");
        sdp.push_str("a=rtpmap:0 PCMU/8000\r\n");
        sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n");
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str("a=ice-ufrag:rUfr\r\n");
        sdp.push_str("a=ice-pwd:remote-password-remote\r\n");
        if with_fingerprint {
            sdp.push_str(&format!("a=fingerprint:{}\r\n", FINGERPRINT));
        }
        sdp.push_str("a=setup:actpass\r\n");
        sdp.push_str("a=mid:1\r\n");
        sdp.push_str("a=extmap:4 urn:ietf:params:rtp-hdrext:sdes:mid\r\n");
        sdp.push_str("a=sendrecv\r\n");
        sdp.push_str("a=rtcp-mux\r\n");
        sdp.push_str("a=rtcp-rsize\r\n");
        sdp.push_str("a=rtpmap:96 VP8/90000\r\n");
        sdp.push_str("a=rtcp-fb:96 goog-remb\r\n");
        sdp.push_str("a=rtcp-fb:96 nack\r\n");
        sdp.push_str("a=rtcp-fb:96 nack pli\r\n");
        sdp.push_str("a=rtpmap:97 rtx/90000\r\n");
        sdp.push_str("a=fmtp:97 apt=96\r\n");
        sdp
    }

    #[test]
    fn test_parse_browser_offer() {
        let offer = SessionDescription::parse(&browser_offer("sendonly", true)).unwrap();
        assert_eq!(offer.bundle_groups, vec![vec!["0".to_string(), "1".to_string()]]);
        assert_eq!(offer.media.len(), 2);
        assert!(offer.has_fingerprint());

        let audio = &offer.media[0];
        assert_eq!(audio.media_type, "audio");
        assert_eq!(audio.mid.as_deref(), Some("0"));
        assert_eq!(audio.direction(), Direction::SendOnly);
        assert_eq!(audio.formats, vec!["111", "0"]);
        assert_eq!(audio.codecs.len(), 2);
        assert_eq!(audio.codecs[0].feedback, vec!["transport-cc"]);
        assert_eq!(audio.mid_extension_id(), Some(4));
        assert_eq!(audio.transport.ice_ufrag.as_deref(), Some("rUfr"));
        assert_eq!(audio.transport.setup.as_deref(), Some("actpass"));
        let fp = audio.transport.fingerprint.as_ref().unwrap();
        assert_eq!(fp.algorithm, "sha-256");
        assert!(fp.value.starts_with("AB:CD"));

        let video = &offer.media[1];
        assert!(video.rtcp_rsize);
        assert!(video.codecs[0].supports_nack());
        assert!(!video.codecs[1].supports_nack());
    }

    #[test]
    fn test_session_level_transport_inherited() {
        let sdp = "v=0\r\na=ice-ufrag:sess\r\na=ice-pwd:sesspwd\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:a\r\na=ice-ufrag:media\r\n";
        let offer = SessionDescription::parse(sdp).unwrap();
        assert_eq!(offer.media[0].transport.ice_ufrag.as_deref(), Some("media"));
        assert_eq!(offer.media[0].transport.ice_pwd.as_deref(), Some("sesspwd"));
        assert!(offer.bundle_groups.is_empty());
    }

    #[test]
    fn test_offer_without_media_rejected() {
        assert!(matches!(
            SessionDescription::parse("v=0\r\ns=-\r\n"),
            Err(Error::NegotiationRejected(_))
        ));
    }

    #[test]
    fn test_write_answer_sections() {
        let mut codec = Codec::parse_rtpmap("96 VP8/90000").unwrap();
        codec.feedback = vec!["goog-remb".into(), "nack".into(), "nack pli".into()];
        let media = vec![
            AnswerMedia::Accepted {
                media_type: "video".into(),
                mid: "1".into(),
                direction: Direction::RecvOnly,
                codecs: vec![codec],
                extmaps: vec![Extmap {
                    id: 4,
                    uri: MID_EXTENSION_URI.into(),
                }],
                rtcp_mux: true,
                rtcp_rsize: false,
                transport: Some(AnswerTransport {
                    candidates: vec!["candidate:121418589 1 udp 2122260224 10.0.0.1 5000 typ host".into()],
                    ice_ufrag: "lUfr".into(),
                    ice_pwd: "local-password".into(),
                    fingerprint: Some("AA:BB".into()),
                }),
                ssrc: Some(AnswerSsrc::for_mid("1", 1234)),
            },
            AnswerMedia::Rejected {
                media_type: "application".into(),
                protocol: "UDP/DTLS/SCTP".into(),
                formats: vec!["webrtc-datachannel".into()],
                mid: Some("2".into()),
            },
        ];
        let sdp = write_answer(&[vec!["1".into()]], &media);
        assert!(sdp.starts_with("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=NODEPEER\r\nt=0 0\r\n"));
        assert!(sdp.contains("a=group:BUNDLE 1\r\n"));
        assert!(sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"));
        assert!(sdp.contains("a=recvonly\r\n"));
        assert!(sdp.contains("a=rtcp-fb:96 nack\r\na=rtcp-fb:96 nack pli\r\n"));
        assert!(!sdp.contains("goog-remb"));
        assert!(!sdp.contains("a=rtcp-rsize"));
        assert!(sdp.contains("a=candidate:121418589 1 udp"));
        assert!(sdp.contains("a=fingerprint:sha-256 AA:BB\r\na=setup:passive\r\n"));
        assert!(sdp.contains("a=ssrc:1234 msid:stream_0 track_1\r\na=msid:stream_0 track_1\r\n"));
        assert!(sdp.contains("m=application 0 UDP/DTLS/SCTP webrtc-datachannel\r\n"));
    }
}
