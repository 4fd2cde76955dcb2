//! RTCP packet parsing and building (RFC 3550, RFC 4585, RFC 5104).
//!
//! Compound packets are split into sub-packets by their self-described
//! length; each sub-packet is classified and routed by a single SSRC. The
//! builders cover what the receive side emits: Receiver Reports, generic
//! NACKs and PLIs.

use std::time::Duration;

use super::cursor::{self, Reader, WriteExt};
use super::error::{Error, Result};

/// RTCP packet types (RFC 3550 section 12.1, RFC 4585).
pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;

/// Feedback message types.
const FMT_NACK: u8 = 1;
const FMT_TWCC: u8 = 15;
const FMT_PLI: u8 = 1;
const FMT_FIR: u8 = 4;
const FMT_AFB: u8 = 15;

/// Sender Report sender-info block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// One classified RTCP sub-packet.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport { ssrc: u32 },
    SourceDescription,
    Goodbye,
    Nack { sender_ssrc: u32, media_ssrc: u32, lost: Vec<u16> },
    TransportCc,
    Pli { sender_ssrc: u32, media_ssrc: u32 },
    Fir { sender_ssrc: u32, media_ssrc: u32 },
    Remb,
    Other(u8),
}

/// Split a compound packet by walking each header's `(length + 1) * 4`.
pub fn split_compound(data: &[u8]) -> Result<Vec<&[u8]>> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::malformed(format!(
                "{} trailing bytes after RTCP packets",
                rest.len()
            )));
        }
        if rest[0] >> 6 != 2 {
            return Err(Error::malformed("RTCP version is not 2"));
        }
        let len = (cursor::get_u16(rest, 2)? as usize + 1) * 4;
        if len > rest.len() {
            return Err(Error::malformed(format!(
                "RTCP packet claims {} bytes, {} available",
                len,
                rest.len()
            )));
        }
        let (packet, tail) = rest.split_at(len);
        packets.push(packet);
        rest = tail;
    }
    Ok(packets)
}

/// Classify one sub-packet.
pub fn parse(packet: &[u8]) -> Result<RtcpPacket> {
    let mut r = Reader::new(packet);
    let b0 = r.read_u8()?;
    let fmt = b0 & 0x1F;
    let pt = r.read_u8()?;
    let _len = r.read_u16()?;

    Ok(match pt {
        PT_SR => RtcpPacket::SenderReport(SenderReport {
            ssrc: r.read_u32()?,
            ntp_timestamp: r.read_u64()?,
            rtp_timestamp: r.read_u32()?,
            packet_count: r.read_u32()?,
            octet_count: r.read_u32()?,
        }),
        PT_RR => RtcpPacket::ReceiverReport {
            ssrc: r.read_u32()?,
        },
        PT_SDES => RtcpPacket::SourceDescription,
        PT_BYE => RtcpPacket::Goodbye,
        PT_RTPFB if fmt == FMT_NACK => {
            let sender_ssrc = r.read_u32()?;
            let media_ssrc = r.read_u32()?;
            let mut lost = Vec::new();
            while r.remaining() >= 4 {
                let pid = r.read_u16()?;
                let blp = r.read_u16()?;
                lost.push(pid);
                for bit in 0..16u16 {
                    if blp & (1 << bit) != 0 {
                        lost.push(pid.wrapping_add(bit + 1));
                    }
                }
            }
            RtcpPacket::Nack {
                sender_ssrc,
                media_ssrc,
                lost,
            }
        }
        PT_RTPFB if fmt == FMT_TWCC => RtcpPacket::TransportCc,
        PT_PSFB if fmt == FMT_PLI => RtcpPacket::Pli {
            sender_ssrc: r.read_u32()?,
            media_ssrc: r.read_u32()?,
        },
        PT_PSFB if fmt == FMT_FIR => {
            let sender_ssrc = r.read_u32()?;
            let _media = r.read_u32()?;
            // FCI: SSRC of the target, then seq nr + reserved
            RtcpPacket::Fir {
                sender_ssrc,
                media_ssrc: r.read_u32()?,
            }
        }
        PT_PSFB if fmt == FMT_AFB && packet.get(12..16) == Some(b"REMB") => RtcpPacket::Remb,
        other => RtcpPacket::Other(other),
    })
}

/// The SSRC a sub-packet is routed by: the media source for feedback
/// messages, the sender for everything else.
pub fn routing_ssrc(packet: &[u8]) -> Result<u32> {
    let pt = packet
        .get(1)
        .copied()
        .ok_or_else(|| Error::malformed("RTCP packet too short"))?;
    let fmt = packet[0] & 0x1F;
    match pt {
        PT_PSFB if fmt == FMT_FIR => cursor::get_u32(packet, 12),
        PT_RTPFB | PT_PSFB => cursor::get_u32(packet, 8),
        _ => cursor::get_u32(packet, 4),
    }
}

/// Overwrite the sender SSRC (bytes 4..8) of any RTCP packet.
pub fn set_sender_ssrc(packet: &mut [u8], ssrc: u32) -> Result<()> {
    cursor::set_u32(packet, 4, ssrc)
}

/// Overwrite the media-source SSRC of a feedback packet.
pub fn set_media_ssrc(packet: &mut [u8], ssrc: u32) -> Result<()> {
    let fmt = packet.first().map(|b| b & 0x1F);
    let pt = packet.get(1).copied();
    match (pt, fmt) {
        (Some(PT_PSFB), Some(FMT_FIR)) => {
            cursor::set_u32(packet, 8, 0)?;
            cursor::set_u32(packet, 12, ssrc)
        }
        (Some(PT_RTPFB), _) | (Some(PT_PSFB), _) => cursor::set_u32(packet, 8, ssrc),
        _ => Err(Error::malformed("not a feedback packet")),
    }
}

/// Report block for one source (RFC 3550 section 6.4.1).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// Cumulative lost, clamped to 24-bit signed range.
    pub cumulative_lost: i32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// Build a Receiver Report with one report block (length 7 words).
pub fn build_receiver_report(sender_ssrc: u32, block: &ReportBlock) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::with_capacity(32);
    buf.put_u8(0x81); // V=2, RC=1
    buf.put_u8(PT_RR);
    buf.put_u16(7);
    buf.put_u32(sender_ssrc);
    buf.put_u32(block.ssrc);
    buf.put_u8(block.fraction_lost);
    let lost = block.cumulative_lost.clamp(-0x80_0000, 0x7F_FFFF);
    buf.put_u24(lost as u32 & 0x00FF_FFFF);
    buf.put_u32(block.extended_highest_seq);
    buf.put_u32(block.jitter);
    buf.put_u32(block.last_sr);
    buf.put_u32(block.delay_since_last_sr);
    buf
}

/// Group lost sequence numbers into `(PID, BLP)` pairs, in arrival order of
/// the lowest missing sequence. Input must be sorted in RTP order.
pub fn nack_pairs(lost: &[u16]) -> Vec<(u16, u16)> {
    let mut pairs: Vec<(u16, u16)> = Vec::new();
    for &seq in lost {
        if let Some((pid, blp)) = pairs.last_mut() {
            let offset = seq.wrapping_sub(*pid);
            if (1..=16).contains(&offset) {
                *blp |= 1 << (offset - 1);
                continue;
            }
        }
        pairs.push((seq, 0));
    }
    pairs
}

/// Build generic NACKs, one feedback packet per `(PID, BLP)` pair.
pub fn build_nacks(sender_ssrc: u32, media_ssrc: u32, lost: &[u16]) -> Vec<Vec<u8>> {
    nack_pairs(lost)
        .into_iter()
        .map(|(pid, blp)| {
            let mut buf: Vec<u8> = Vec::with_capacity(16);
            buf.put_u8(0x80 | FMT_NACK);
            buf.put_u8(PT_RTPFB);
            buf.put_u16(3);
            buf.put_u32(sender_ssrc);
            buf.put_u32(media_ssrc);
            buf.put_u16(pid);
            buf.put_u16(blp);
            buf
        })
        .collect()
}

/// Build a Picture Loss Indication.
pub fn build_pli(sender_ssrc: u32, media_ssrc: u32) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::with_capacity(12);
    buf.put_u8(0x80 | FMT_PLI);
    buf.put_u8(PT_PSFB);
    buf.put_u16(2);
    buf.put_u32(sender_ssrc);
    buf.put_u32(media_ssrc);
    buf
}

/// Middle 32 bits of an NTP timestamp (the LSR field).
pub fn ntp_middle32(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// A duration in 1/65536-second units (the DLSR field).
pub fn to_dlsr_units(elapsed: Duration) -> u32 {
    (elapsed.as_secs_f64() * 65536.0) as u32
}
