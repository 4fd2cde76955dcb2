//! Receive-side RTP session: per-SSRC statistics, NACK scheduling and
//! Receiver Reports.
//!
//! Sequence tracking follows RFC 3550 Appendix A.1 and jitter follows
//! section 6.4.1. The receiver is sans-IO: RTCP it wants sent to the remote
//! sender is queued and drained with [`RtpReceiver::poll_rtcp`], and its NACK
//! timer is driven through [`RtpReceiver::poll_timeout`] /
//! [`RtpReceiver::handle_timeout`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::rtcp::{self, ReportBlock, SenderReport};
use super::rtp::RtpHeader;

const RTP_SEQ_MOD: u32 = 1 << 16;
const MAX_DROPOUT: u32 = 3000;
const MAX_MISORDER: u32 = 100;
const MIN_SEQUENTIAL: u32 = 2;

/// Give up on a missing packet after this many NACKs.
const MAX_NACK_RETRIES: u8 = 3;

/// Larger gaps are treated as a stream discontinuity, not loss.
const MAX_NACK_GAP: u32 = 256;

// ---------------------------------------------------------------------------
// Per-SSRC statistics
// ---------------------------------------------------------------------------

/// RFC 3550 A.1 source state for one SSRC.
#[derive(Debug, Clone, Default)]
pub struct SsrcStats {
    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    bad_seq: u32,
    probation: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,

    jitter: f64,
    prev_transit: Option<f64>,
    first_arrival: Option<Instant>,

    last_sr: u32,
    last_sr_at: Option<Instant>,

    /// Missing extended sequence numbers and how often each was NACKed.
    missing: BTreeMap<u32, u8>,
    nack_deadline: Option<Instant>,
}

impl SsrcStats {
    fn first_packet(seq: u16) -> Self {
        let mut stats = Self::default();
        stats.init_seq(seq);
        stats.max_seq = seq.wrapping_sub(1);
        stats.probation = MIN_SEQUENTIAL;
        stats
    }

    fn init_seq(&mut self, seq: u16) {
        self.base_seq = seq as u32;
        self.max_seq = seq;
        self.bad_seq = RTP_SEQ_MOD + 1;
        self.cycles = 0;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
        self.missing.clear();
        self.nack_deadline = None;
    }

    /// Returns false while on probation and for packets rejected as invalid.
    fn update_seq(&mut self, seq: u16) -> bool {
        let udelta = seq.wrapping_sub(self.max_seq) as u32;

        if self.probation > 0 {
            if seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                if self.probation == 0 {
                    self.init_seq(seq);
                    self.received += 1;
                    return true;
                }
            } else {
                self.probation = MIN_SEQUENTIAL - 1;
                self.max_seq = seq;
            }
            return false;
        } else if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles += RTP_SEQ_MOD;
            }
            self.max_seq = seq;
        } else if udelta <= RTP_SEQ_MOD - MAX_MISORDER {
            // Big jump: accept only on the second consecutive packet
            if seq as u32 == self.bad_seq {
                tracing::debug!("RTP sequence restarted at {}", seq);
                self.init_seq(seq);
            } else {
                self.bad_seq = (seq as u32 + 1) & (RTP_SEQ_MOD - 1);
                return false;
            }
        }
        // else: duplicate or reordered packet
        self.received += 1;
        true
    }

    pub fn extended_max(&self) -> u32 {
        self.cycles + self.max_seq as u32
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn packets_received(&self) -> u32 {
        self.received
    }

    pub fn expected(&self) -> u32 {
        (self.extended_max() + 1).wrapping_sub(self.base_seq)
    }

    /// Cumulative lost; negative when duplicates outnumber losses.
    pub fn lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Extended sequence number of a packet at or before the current max.
    fn extend_seq(&self, seq: u16) -> Option<u32> {
        let behind = self.max_seq.wrapping_sub(seq) as u32;
        self.extended_max().checked_sub(behind)
    }

    fn update_jitter(&mut self, rtp_timestamp: u32, clock_rate: u32, now: Instant) {
        let first = *self.first_arrival.get_or_insert(now);
        let arrival = now.duration_since(first).as_secs_f64() * clock_rate as f64;
        let transit = arrival - rtp_timestamp as f64;
        if let Some(prev) = self.prev_transit {
            let mut d = (transit - prev).abs();
            // Timestamp wrapped between the two packets
            if d > (u32::MAX / 2) as f64 {
                d = (d - u32::MAX as f64 - 1.0).abs();
            }
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.prev_transit = Some(transit);
    }

    fn report_block(&mut self, ssrc: u32, now: Instant) -> ReportBlock {
        let expected = self.expected();
        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        let delay_since_last_sr = match self.last_sr_at {
            Some(at) => rtcp::to_dlsr_units(now.duration_since(at)),
            None => 0,
        };

        ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: self.lost().clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            extended_highest_seq: self.extended_max(),
            jitter: self.jitter as u32,
            last_sr: self.last_sr,
            delay_since_last_sr,
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

pub struct RtpReceiver {
    /// Sender SSRC written into RR/NACK/PLI packets.
    reporter_ssrc: u32,
    clock_rate: u32,
    nack_wait: Duration,
    nack_retry_interval: Duration,
    sources: HashMap<u32, SsrcStats>,
    outgoing: VecDeque<Vec<u8>>,
}

impl RtpReceiver {
    pub fn new(
        reporter_ssrc: u32,
        clock_rate: u32,
        nack_wait: Duration,
        nack_retry_interval: Duration,
    ) -> Self {
        Self {
            reporter_ssrc,
            clock_rate,
            nack_wait,
            nack_retry_interval,
            sources: HashMap::new(),
            outgoing: VecDeque::new(),
        }
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Switch the RTP clock, e.g. when the sender changes payload type.
    /// Transit times are restarted since they are measured in clock ticks.
    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        if clock_rate == self.clock_rate {
            return;
        }
        tracing::debug!("RTP clock rate {} -> {}", self.clock_rate, clock_rate);
        self.clock_rate = clock_rate;
        for stats in self.sources.values_mut() {
            stats.first_arrival = None;
            stats.prev_transit = None;
        }
    }

    /// Drop all state kept for `ssrc`.
    pub fn remove_source(&mut self, ssrc: u32) -> bool {
        self.sources.remove(&ssrc).is_some()
    }

    pub fn stats(&self, ssrc: u32) -> Option<&SsrcStats> {
        self.sources.get(&ssrc)
    }

    /// Account for an incoming RTP packet. Returns whether A.1 accepted it.
    pub fn handle_rtp(&mut self, header: &RtpHeader, now: Instant) -> bool {
        let ssrc = header.ssrc;
        let seq = header.sequence_number;

        let Some(stats) = self.sources.get_mut(&ssrc) else {
            tracing::debug!("New inbound SSRC {} starting at seq {}", ssrc, seq);
            let mut stats = SsrcStats::first_packet(seq);
            stats.update_seq(seq);
            stats.update_jitter(header.timestamp, self.clock_rate, now);
            self.sources.insert(ssrc, stats);
            return false;
        };

        let on_probation = stats.probation > 0;
        let prev_max = stats.extended_max();
        let valid = stats.update_seq(seq);
        if valid {
            stats.update_jitter(header.timestamp, self.clock_rate, now);
        }
        if !valid || on_probation {
            return valid;
        }

        let new_max = stats.extended_max();
        if new_max > prev_max + 1 {
            let gap = new_max - prev_max - 1;
            if gap > MAX_NACK_GAP {
                tracing::debug!("SSRC {}: gap of {} packets, not NACKing", ssrc, gap);
            } else {
                for missing in prev_max + 1..new_max {
                    stats.missing.entry(missing).or_insert(0);
                }
                if stats.nack_deadline.is_none() {
                    stats.nack_deadline = Some(now + self.nack_wait);
                }
            }
        } else if new_max <= prev_max {
            // Late arrival, possibly a retransmission we asked for
            if let Some(ext) = stats.extend_seq(seq) {
                if stats.missing.remove(&ext).is_some() {
                    tracing::trace!("SSRC {}: recovered seq {}", ssrc, seq);
                }
            }
            if stats.missing.is_empty() {
                stats.nack_deadline = None;
            }
        }
        true
    }

    /// Record a Sender Report and answer it with a Receiver Report.
    pub fn handle_sender_report(&mut self, sr: &SenderReport, now: Instant) {
        let Some(stats) = self.sources.get_mut(&sr.ssrc) else {
            tracing::debug!("Sender Report for unknown SSRC {}", sr.ssrc);
            return;
        };
        stats.last_sr = rtcp::ntp_middle32(sr.ntp_timestamp);
        stats.last_sr_at = Some(now);
        let block = stats.report_block(sr.ssrc, now);
        tracing::trace!(
            "RR for SSRC {}: lost={} fraction={} jitter={}",
            sr.ssrc,
            block.cumulative_lost,
            block.fraction_lost,
            block.jitter
        );
        self.outgoing
            .push_back(rtcp::build_receiver_report(self.reporter_ssrc, &block));
    }

    /// Queue a PLI. The media-source SSRC is left 0 for the caller to fill in.
    pub fn request_key_frame(&mut self) {
        self.outgoing.push_back(rtcp::build_pli(self.reporter_ssrc, 0));
    }

    /// Earliest pending NACK deadline across all sources.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.sources.values().filter_map(|s| s.nack_deadline).min()
    }

    /// Fire every NACK timer that is due.
    pub fn handle_timeout(&mut self, now: Instant) {
        for (&ssrc, stats) in self.sources.iter_mut() {
            match stats.nack_deadline {
                Some(deadline) if deadline <= now => {}
                _ => continue,
            }

            let lost: Vec<u16> = stats.missing.keys().map(|&ext| ext as u16).collect();
            if !lost.is_empty() {
                tracing::debug!("NACK SSRC {}: {:?}", ssrc, lost);
                self.outgoing
                    .extend(rtcp::build_nacks(self.reporter_ssrc, ssrc, &lost));
            }

            stats.missing.retain(|_, retries| {
                *retries += 1;
                *retries < MAX_NACK_RETRIES
            });
            stats.nack_deadline = if stats.missing.is_empty() {
                None
            } else {
                Some(now + self.nack_retry_interval)
            };
        }
    }

    /// Next RTCP packet (plaintext) to send to the remote sender.
    pub fn poll_rtcp(&mut self) -> Option<Vec<u8>> {
        self.outgoing.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::rtcp::RtcpPacket;
    use crate::webrtc::rtp::tests::build_packet;

    const SSRC: u32 = 0x1234;

    fn receiver() -> RtpReceiver {
        RtpReceiver::new(99, 90000, Duration::ZERO, Duration::from_millis(50))
    }

    fn feed(rx: &mut RtpReceiver, seq: u16, now: Instant) -> bool {
        let pkt = build_packet(96, seq, seq as u32 * 3000, SSRC, None);
        rx.handle_rtp(&RtpHeader::parse(&pkt).unwrap(), now)
    }

    #[test]
    fn test_in_order_no_loss() {
        let mut rx = receiver();
        let now = Instant::now();
        for seq in 100..200u16 {
            feed(&mut rx, seq, now);
        }
        let stats = rx.stats(SSRC).unwrap();
        // The first packet only starts probation
        assert_eq!(stats.packets_received(), 99);
        assert_eq!(stats.expected(), 99);
        assert_eq!(stats.lost(), 0);
        assert!(rx.poll_timeout().is_none());
        assert!(rx.poll_rtcp().is_none());
    }

    #[test]
    fn test_sequence_wrap_counts_one_cycle() {
        let mut rx = receiver();
        let now = Instant::now();
        let mut last_ext = 0;
        for seq in [65532u16, 65533, 65534, 65535, 0, 1, 2] {
            feed(&mut rx, seq, now);
            let ext = rx.stats(SSRC).unwrap().extended_max();
            assert!(ext >= last_ext);
            last_ext = ext;
        }
        let stats = rx.stats(SSRC).unwrap();
        assert_eq!(stats.cycles(), 1 << 16);
        assert_eq!(stats.extended_max(), (1 << 16) + 2);
        assert_eq!(stats.lost(), 0);
    }

    #[test]
    fn test_large_jump_restarts_on_consecutive_packet() {
        let mut rx = receiver();
        let now = Instant::now();
        for seq in 100..110u16 {
            feed(&mut rx, seq, now);
        }
        assert_eq!(rx.stats(SSRC).unwrap().packets_received(), 9);

        // First packet of the jump is held as bad_seq
        assert!(!feed(&mut rx, 40000, now));
        let stats = rx.stats(SSRC).unwrap();
        assert_eq!(stats.extended_max(), 109);
        assert_eq!(stats.packets_received(), 9);

        // Its successor confirms the source restarted
        assert!(feed(&mut rx, 40001, now));
        let stats = rx.stats(SSRC).unwrap();
        assert_eq!(stats.extended_max(), 40001);
        assert_eq!(stats.cycles(), 0);
        assert_eq!(stats.packets_received(), 1);
        assert_eq!(stats.expected(), 1);
        assert_eq!(stats.lost(), 0);
        assert!(rx.poll_timeout().is_none());
    }

    #[test]
    fn test_large_jump_without_successor_is_ignored() {
        let mut rx = receiver();
        let now = Instant::now();
        for seq in 100..110u16 {
            feed(&mut rx, seq, now);
        }
        assert!(!feed(&mut rx, 40000, now));
        assert!(!feed(&mut rx, 50000, now));

        // The original stream carries on untouched
        assert!(feed(&mut rx, 110, now));
        let stats = rx.stats(SSRC).unwrap();
        assert_eq!(stats.extended_max(), 110);
        assert_eq!(stats.packets_received(), 10);
        assert_eq!(stats.lost(), 0);
    }

    #[test]
    fn test_gap_produces_single_nack() {
        let mut rx = receiver();
        let now = Instant::now();
        for seq in [10u16, 11, 14] {
            feed(&mut rx, seq, now);
        }
        assert_eq!(rx.poll_timeout(), Some(now));
        rx.handle_timeout(now);

        let nack = rx.poll_rtcp().unwrap();
        assert!(rx.poll_rtcp().is_none());
        assert_eq!(&nack[12..14], &12u16.to_be_bytes());
        assert_eq!(&nack[14..16], &1u16.to_be_bytes());
        assert_eq!(
            rtcp::parse(&nack).unwrap(),
            RtcpPacket::Nack {
                sender_ssrc: 99,
                media_ssrc: SSRC,
                lost: vec![12, 13]
            }
        );
    }

    #[test]
    fn test_nack_gives_up_after_three_retries() {
        let mut rx = receiver();
        let mut now = Instant::now();
        for seq in [10u16, 11, 13] {
            feed(&mut rx, seq, now);
        }
        for _ in 0..3 {
            let deadline = rx.poll_timeout().unwrap();
            now = now.max(deadline);
            rx.handle_timeout(now);
            assert!(rx.poll_rtcp().is_some());
        }
        assert!(rx.poll_timeout().is_none());
        rx.handle_timeout(now + Duration::from_secs(1));
        assert!(rx.poll_rtcp().is_none());
    }

    #[test]
    fn test_retransmission_clears_pending_nack() {
        let mut rx = receiver();
        let now = Instant::now();
        for seq in [10u16, 11, 13] {
            feed(&mut rx, seq, now);
        }
        assert!(rx.poll_timeout().is_some());
        feed(&mut rx, 12, now);
        assert!(rx.poll_timeout().is_none());
        assert_eq!(rx.stats(SSRC).unwrap().lost(), 0);
    }

    #[test]
    fn test_nack_waits_configured_time() {
        let mut rx = RtpReceiver::new(1, 90000, Duration::from_millis(20), Duration::from_millis(50));
        let now = Instant::now();
        for seq in [1u16, 2, 4] {
            feed(&mut rx, seq, now);
        }
        rx.handle_timeout(now);
        assert!(rx.poll_rtcp().is_none());
        rx.handle_timeout(now + Duration::from_millis(20));
        assert!(rx.poll_rtcp().is_some());
        assert_eq!(rx.poll_timeout(), Some(now + Duration::from_millis(70)));
    }

    #[test]
    fn test_sender_report_triggers_receiver_report() {
        let mut rx = receiver();
        let now = Instant::now();
        for seq in [1u16, 2, 3, 5, 6] {
            feed(&mut rx, seq, now);
        }
        rx.handle_timeout(now);
        while rx.poll_rtcp().is_some() {}

        let sr = SenderReport {
            ssrc: SSRC,
            ntp_timestamp: 0x0000_AAAA_BBBB_0000,
            rtp_timestamp: 0,
            packet_count: 6,
            octet_count: 0,
        };
        rx.handle_sender_report(&sr, now);
        let rr = rx.poll_rtcp().unwrap();
        assert_eq!(rr.len(), 32);
        assert_eq!(rr[1], rtcp::PT_RR);
        assert_eq!(&rr[4..8], &99u32.to_be_bytes());
        assert_eq!(&rr[8..12], &SSRC.to_be_bytes());
        // base 2, max 6: expected 5, received 4
        assert_eq!(rr[12], 51);
        assert_eq!(&rr[13..16], &[0, 0, 1]);
        assert_eq!(&rr[24..28], &0xAAAA_BBBBu32.to_be_bytes());
        assert_eq!(&rr[28..32], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_sender_report_for_unknown_ssrc_ignored() {
        let mut rx = receiver();
        rx.handle_sender_report(
            &SenderReport {
                ssrc: 5,
                ntp_timestamp: 0,
                rtp_timestamp: 0,
                packet_count: 0,
                octet_count: 0,
            },
            Instant::now(),
        );
        assert!(rx.poll_rtcp().is_none());
    }

    #[test]
    fn test_jitter_zero_for_paced_stream() {
        let mut rx = RtpReceiver::new(1, 90000, Duration::ZERO, Duration::from_millis(50));
        let start = Instant::now();
        for i in 0..20u16 {
            let pkt = build_packet(96, i, i as u32 * 1800, SSRC, None);
            let at = start + Duration::from_millis(i as u64 * 20);
            rx.handle_rtp(&RtpHeader::parse(&pkt).unwrap(), at);
        }
        assert!(rx.stats(SSRC).unwrap().jitter() < 1.0);
    }

    #[test]
    fn test_clock_rate_switch_restarts_transit() {
        let mut rx = RtpReceiver::new(1, 90000, Duration::ZERO, Duration::from_millis(50));
        let start = Instant::now();
        for i in 0..10u16 {
            let pkt = build_packet(96, i, i as u32 * 1800, SSRC, None);
            let at = start + Duration::from_millis(i as u64 * 20);
            rx.handle_rtp(&RtpHeader::parse(&pkt).unwrap(), at);
        }
        rx.set_clock_rate(48000);
        assert_eq!(rx.clock_rate(), 48000);
        // Same pacing on a 48 kHz timeline with an unrelated base
        for i in 10..20u16 {
            let pkt = build_packet(111, i, 500_000 + i as u32 * 960, SSRC, None);
            let at = start + Duration::from_millis(i as u64 * 20);
            rx.handle_rtp(&RtpHeader::parse(&pkt).unwrap(), at);
        }
        assert!(rx.stats(SSRC).unwrap().jitter() < 1.0);
    }

    #[test]
    fn test_remove_source_forgets_stats() {
        let mut rx = receiver();
        let now = Instant::now();
        for seq in 1..5u16 {
            feed(&mut rx, seq, now);
        }
        feed(&mut rx, 8, now);
        assert!(rx.poll_timeout().is_some());

        assert!(rx.remove_source(SSRC));
        assert!(rx.stats(SSRC).is_none());
        assert!(!rx.remove_source(SSRC));
        // Pending NACKs go with it
        assert!(rx.poll_timeout().is_none());
    }

    #[test]
    fn test_pli_has_zero_media_ssrc() {
        let mut rx = receiver();
        rx.request_key_frame();
        let pli = rx.poll_rtcp().unwrap();
        assert_eq!(
            rtcp::parse(&pli).unwrap(),
            RtcpPacket::Pli {
                sender_ssrc: 99,
                media_ssrc: 0
            }
        );
    }
}
