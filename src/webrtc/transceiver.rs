//! Transceiver: one negotiated m-line inside a bundle.
//!
//! Every transceiver sits between three parties. Its *client* is the browser
//! on the other end of this bundle. Media the client sends is published to
//! *consumers* (other peers' transceivers subscribed to it). Media the client
//! receives comes from a single *producer* transceiver chosen by `subscribe`.
//!
//! ```text
//!                                   +----------+
//!                        RTP-o <----| producer |
//!  +--------+            +-------------+        +----------+
//!  | client | <--------> | transceiver |        +----------+
//!  +--------+            +-------------+ RTP-i->| consumer |
//!                                               +----------+
//! ```
//!
//! Feedback flows against the media: NACK/PLI from the client about RTP-o is
//! relayed to the producer, feedback from consumers about RTP-i is sent to
//! the client.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use super::crypto::crc32;
use super::error::Result;
use super::receiver::RtpReceiver;
use super::rtcp::{self, RtcpPacket, PT_PSFB};
use super::rtp::{self, RtpHeader};
use super::sender::RtpSender;
use super::stream::{CodecId, Feedback, FeedbackTarget, MediaPacket, MEDIA_CHANNEL_CAPACITY};
use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    /// The answerer's direction for an offered one.
    pub fn flipped(self) -> Self {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => other,
        }
    }

    pub fn sends(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::RecvOnly)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// One `a=rtpmap` entry plus its `a=rtcp-fb` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct Codec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    pub feedback: Vec<String>,
}

impl Codec {
    /// Parse the value of `a=rtpmap:`, e.g. `111 opus/48000/2`.
    pub fn parse_rtpmap(value: &str) -> Option<Self> {
        let (pt, encoding) = value.trim().split_once(' ')?;
        let mut parts = encoding.trim().split('/');
        let name = parts.next()?.to_string();
        let clock_rate = parts.next()?.parse().ok()?;
        let channels = parts.next().and_then(|c| c.parse().ok());
        Some(Self {
            payload_type: pt.parse().ok()?,
            name,
            clock_rate,
            channels,
            feedback: Vec::new(),
        })
    }

    pub fn id(&self) -> CodecId {
        CodecId {
            name: self.name.to_ascii_lowercase().into(),
            clock_rate: self.clock_rate,
        }
    }

    pub fn encoding(&self) -> String {
        match self.channels {
            Some(ch) => format!("{}/{}/{}", self.name, self.clock_rate, ch),
            None => format!("{}/{}", self.name, self.clock_rate),
        }
    }

    /// Whether this codec is one of the configured `name/clock` entries.
    pub fn is_supported_by(&self, supported: &[String]) -> bool {
        let encoding = self.encoding().to_ascii_lowercase();
        supported
            .iter()
            .any(|s| encoding.starts_with(&s.to_ascii_lowercase()))
    }

    pub fn supports_nack(&self) -> bool {
        self.feedback.iter().any(|fb| fb.starts_with("nack"))
    }
}

/// SSRC we send on for `mid`; stable across sessions.
pub fn outgoing_ssrc_for_mid(mid: &str) -> u32 {
    let ssrc = crc32(format!("mid:{}", mid).as_bytes());
    // 0 and 1 are commonly treated as "unset" by receivers
    if ssrc <= 1 {
        ssrc + 2
    } else {
        ssrc
    }
}

/// Negotiated parameters a transceiver is built from.
#[derive(Debug, Clone)]
pub struct TransceiverParams {
    pub mid: String,
    pub kind: MediaKind,
    pub direction: Direction,
    pub codecs: Vec<Codec>,
    pub mid_extension_id: Option<u8>,
}

pub struct Transceiver {
    mid: String,
    kind: MediaKind,
    direction: Direction,
    codecs: Vec<Codec>,
    mid_extension_id: Option<u8>,
    outgoing_ssrc: u32,
    inbound_ssrc: Option<u32>,

    receiver: RtpReceiver,
    sender: RtpSender,
    media: broadcast::Sender<MediaPacket>,
    source: Option<FeedbackTarget>,

    rtcp_out: VecDeque<Vec<u8>>,
    feedback_out: VecDeque<(FeedbackTarget, Feedback)>,
}

impl Transceiver {
    pub fn new(params: TransceiverParams, config: &ServerConfig) -> Self {
        let outgoing_ssrc = outgoing_ssrc_for_mid(&params.mid);
        let clock_rate = params.codecs.first().map(|c| c.clock_rate).unwrap_or(90000);
        let (media, _) = broadcast::channel(MEDIA_CHANNEL_CAPACITY);
        tracing::debug!(
            "Transceiver mid={} kind={} direction={} ssrc={} codecs={:?}",
            params.mid,
            params.kind.as_str(),
            params.direction,
            outgoing_ssrc,
            params.codecs.iter().map(|c| c.encoding()).collect::<Vec<_>>()
        );
        Self {
            receiver: RtpReceiver::new(
                outgoing_ssrc,
                clock_rate,
                config.nack_wait(),
                config.nack_retry_interval(),
            ),
            sender: RtpSender::new(outgoing_ssrc, clock_rate),
            mid: params.mid,
            kind: params.kind,
            direction: params.direction,
            codecs: params.codecs,
            mid_extension_id: params.mid_extension_id,
            outgoing_ssrc,
            inbound_ssrc: None,
            media,
            source: None,
            rtcp_out: VecDeque::new(),
            feedback_out: VecDeque::new(),
        }
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn outgoing_ssrc(&self) -> u32 {
        self.outgoing_ssrc
    }

    pub fn inbound_ssrc(&self) -> Option<u32> {
        self.inbound_ssrc
    }

    /// Fan-out channel of the media our client sends on this m-line.
    pub fn media_sender(&self) -> broadcast::Sender<MediaPacket> {
        self.media.clone()
    }

    pub fn set_source(&mut self, source: Option<FeedbackTarget>) {
        self.source = source;
    }

    // -----------------------------------------------------------------------
    // From the client
    // -----------------------------------------------------------------------

    /// Decrypted RTP from the client: account for it and publish it.
    /// Returns the inbound SSRC this packet replaced, if any.
    pub fn handle_rtp(&mut self, data: Vec<u8>, header: &RtpHeader, now: Instant) -> Option<u32> {
        let Some(codec) = self
            .codecs
            .iter()
            .find(|c| c.payload_type == header.payload_type)
        else {
            tracing::trace!(
                "mid={} dropping RTP with unnegotiated PT {}",
                self.mid,
                header.payload_type
            );
            return None;
        };

        let mut replaced = None;
        if self.inbound_ssrc != Some(header.ssrc) {
            tracing::info!("mid={} inbound SSRC is now {}", self.mid, header.ssrc);
            replaced = self.inbound_ssrc.replace(header.ssrc);
            if let Some(old) = replaced {
                self.receiver.remove_source(old);
            }
        }
        self.receiver.set_clock_rate(codec.clock_rate);
        self.receiver.handle_rtp(header, now);

        // No subscribers is not an error
        let _ = self.media.send(MediaPacket::Rtp {
            codec: codec.id(),
            data: Arc::from(data),
        });
        replaced
    }

    /// One RTCP sub-packet from the client routed to this m-line.
    pub fn handle_rtcp(&mut self, packet: &[u8], now: Instant) -> Result<()> {
        match rtcp::parse(packet)? {
            RtcpPacket::SenderReport(sr) => {
                self.receiver.handle_sender_report(&sr, now);
                let _ = self
                    .media
                    .send(MediaPacket::SenderReport(Arc::from(packet)));
            }
            RtcpPacket::Nack {
                media_ssrc, lost, ..
            } if media_ssrc == self.outgoing_ssrc => {
                let translated = self.sender.translate_nack(&lost);
                self.relay_feedback(Feedback::Nack(translated));
            }
            RtcpPacket::Pli { media_ssrc, .. } | RtcpPacket::Fir { media_ssrc, .. }
                if media_ssrc == self.outgoing_ssrc =>
            {
                self.relay_feedback(Feedback::KeyFrame);
            }
            RtcpPacket::TransportCc | RtcpPacket::Remb => {
                tracing::trace!("mid={} ignoring congestion feedback", self.mid);
            }
            other => {
                tracing::trace!("mid={} RTCP {:?}", self.mid, other);
            }
        }
        Ok(())
    }

    fn relay_feedback(&mut self, feedback: Feedback) {
        match &self.source {
            Some(target) => self.feedback_out.push_back((target.clone(), feedback)),
            None => tracing::debug!("mid={} has no producer for {:?}", self.mid, feedback),
        }
    }

    // -----------------------------------------------------------------------
    // To the client
    // -----------------------------------------------------------------------

    /// Prepare a producer's packet for our client. `None` when this m-line
    /// does not carry it.
    pub fn forward_media(&mut self, packet: &MediaPacket, now: Instant) -> Result<Option<Vec<u8>>> {
        if !self.direction.sends() {
            return Ok(None);
        }
        match packet {
            MediaPacket::Rtp { codec, data } => {
                let Some(local) = self.codecs.iter().find(|c| c.id() == *codec) else {
                    tracing::trace!("mid={} has no codec {:?}", self.mid, codec);
                    return Ok(None);
                };
                let pt = local.payload_type;
                self.sender.set_clock_rate(local.clock_rate);
                let mid = self.mid_extension_id.map(|id| (id, self.mid.as_str()));
                let mut out = rtp::rewrite_extensions(data, mid)?;
                rtp::set_payload_type(&mut out, pt)?;
                self.sender.rewrite_rtp(&mut out, now)?;
                Ok(Some(out))
            }
            MediaPacket::SenderReport(data) => self.sender.rewrite_sender_report(data),
        }
    }

    /// Feedback a consumer sent about the stream our client produces.
    pub fn apply_feedback(&mut self, feedback: Feedback) {
        match feedback {
            Feedback::KeyFrame => self.receiver.request_key_frame(),
            Feedback::Nack(lost) => {
                let Some(ssrc) = self.inbound_ssrc else {
                    return;
                };
                self.rtcp_out
                    .extend(rtcp::build_nacks(self.outgoing_ssrc, ssrc, &lost));
            }
        }
    }

    pub fn request_key_frame(&mut self) {
        self.receiver.request_key_frame();
    }

    /// Next plaintext RTCP packet for the client.
    pub fn poll_rtcp(&mut self) -> Option<Vec<u8>> {
        if let Some(packet) = self.rtcp_out.pop_front() {
            return Some(packet);
        }
        while let Some(mut packet) = self.receiver.poll_rtcp() {
            if packet.get(1) != Some(&PT_PSFB) {
                return Some(packet);
            }
            match self.inbound_ssrc {
                Some(ssrc) if rtcp::set_media_ssrc(&mut packet, ssrc).is_ok() => {
                    return Some(packet)
                }
                _ => tracing::debug!("mid={} no inbound SSRC yet, dropping PLI", self.mid),
            }
        }
        None
    }

    pub fn poll_feedback(&mut self) -> Option<(FeedbackTarget, Feedback)> {
        self.feedback_out.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.receiver.poll_timeout()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.receiver.handle_timeout(now);
    }
}
