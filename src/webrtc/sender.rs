//! Send-side RTP session.
//!
//! A consumer's outbound stream is stitched together from whatever producer
//! stream currently feeds it. SSRC, sequence number and timestamp are
//! rewritten so the remote receiver sees one continuous timeline, even when
//! the source SSRC changes mid-stream.

use std::time::Instant;

use super::crypto::random_u32;
use super::cursor;
use super::error::{Error, Result};
use super::rtcp::{self, PT_SR};
use super::rtp::{self, RtpHeader};

/// Header plus sender info, without report blocks.
const SR_LEN: usize = 28;

/// Statistics for tracking sent RTP packets (used for relayed SRs).
#[derive(Debug, Clone, Copy, Default)]
pub struct RtpSendStats {
    pub packets_sent: u32,
    pub octets_sent: u32,
}

pub struct RtpSender {
    ssrc: u32,
    clock_rate: u32,
    source_ssrc: Option<u32>,
    seq_offset: u16,
    ts_offset: u32,
    last_seq: u16,
    last_ts: u32,
    last_sent_at: Option<Instant>,
    stats: RtpSendStats,
}

impl RtpSender {
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        let initial_seq = random_u32() as u16;
        Self {
            ssrc,
            clock_rate,
            source_ssrc: None,
            seq_offset: 0,
            ts_offset: 0,
            // The first packet continues from here
            last_seq: initial_seq.wrapping_sub(1),
            last_ts: random_u32(),
            last_sent_at: None,
            stats: RtpSendStats::default(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        self.clock_rate = clock_rate;
    }

    pub fn source_ssrc(&self) -> Option<u32> {
        self.source_ssrc
    }

    pub fn stats(&self) -> RtpSendStats {
        self.stats
    }

    /// Rewrite SSRC, sequence number and timestamp of a forwarded RTP packet
    /// in place.
    pub fn rewrite_rtp(&mut self, packet: &mut [u8], now: Instant) -> Result<()> {
        let header = RtpHeader::parse(packet)?;

        if self.source_ssrc != Some(header.ssrc) {
            self.switch_source(&header, now);
        }

        let seq = header.sequence_number.wrapping_add(self.seq_offset);
        let ts = header.timestamp.wrapping_add(self.ts_offset);
        rtp::set_ssrc(packet, self.ssrc)?;
        rtp::set_sequence_number(packet, seq)?;
        rtp::set_timestamp(packet, ts)?;

        // Only newer packets move the timeline forward
        let delta = seq.wrapping_sub(self.last_seq);
        if delta != 0 && delta < 0x8000 {
            self.last_seq = seq;
            self.last_ts = ts;
            self.last_sent_at = Some(now);
        }

        self.stats.packets_sent = self.stats.packets_sent.wrapping_add(1);
        self.stats.octets_sent = self
            .stats
            .octets_sent
            .wrapping_add(packet.len().saturating_sub(header.header_len) as u32);
        Ok(())
    }

    fn switch_source(&mut self, header: &RtpHeader, now: Instant) {
        let elapsed_ticks = match self.last_sent_at {
            // Truncating keeps the offset modulo 2^32
            Some(at) => {
                (now.duration_since(at).as_micros() * u128::from(self.clock_rate) / 1_000_000)
                    as u32
            }
            None => 0,
        };
        self.ts_offset = self
            .last_ts
            .wrapping_sub(header.timestamp)
            .wrapping_add(elapsed_ticks);
        self.seq_offset = self
            .last_seq
            .wrapping_add(1)
            .wrapping_sub(header.sequence_number);
        tracing::debug!(
            "Outbound SSRC {} now fed by {} (seq offset {}, ts offset {})",
            self.ssrc,
            header.ssrc,
            self.seq_offset,
            self.ts_offset
        );
        self.source_ssrc = Some(header.ssrc);
    }

    /// Rewrite a producer's Sender Report for this stream. Returns `None`
    /// when the report belongs to a source we are not currently forwarding.
    pub fn rewrite_sender_report(&self, packet: &[u8]) -> Result<Option<Vec<u8>>> {
        if packet.get(1) != Some(&PT_SR) || packet.len() < SR_LEN {
            return Err(Error::malformed("not a Sender Report"));
        }
        let ssrc = cursor::get_u32(packet, 4)?;
        if self.source_ssrc != Some(ssrc) {
            return Ok(None);
        }
        // Report blocks describe the producer's own reception; drop them
        let mut sr = packet[..SR_LEN].to_vec();
        sr[0] &= 0xE0;
        cursor::set_u16(&mut sr, 2, (SR_LEN / 4 - 1) as u16)?;
        rtcp::set_sender_ssrc(&mut sr, self.ssrc)?;
        let rtp_ts = cursor::get_u32(&sr, 16)?;
        cursor::set_u32(&mut sr, 16, rtp_ts.wrapping_add(self.ts_offset))?;
        cursor::set_u32(&mut sr, 20, self.stats.packets_sent)?;
        cursor::set_u32(&mut sr, 24, self.stats.octets_sent)?;
        Ok(Some(sr))
    }

    /// Map sequence numbers NACKed by our receiver back to the source's.
    pub fn translate_nack(&self, lost: &[u16]) -> Vec<u16> {
        lost.iter()
            .map(|seq| seq.wrapping_sub(self.seq_offset))
            .collect()
    }
}
