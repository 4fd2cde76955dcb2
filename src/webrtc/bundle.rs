//! Bundle: several m-lines sharing one ICE/DTLS/SRTP transport.
//!
//! Sans-IO. The transport task feeds datagrams and timeouts in, then drains
//! [`Bundle::poll_transmit`], [`Bundle::poll_event`] and
//! [`Bundle::poll_feedback`].
//!
//! Inbound datagrams are classified by their first byte (RFC 7983):
//!
//! ```text
//!   0..=3    STUN   -> IceAgent
//!  20..=63   DTLS   -> DtlsContext
//! 128..=191  RTP/RTCP -> SRTP -> Transceiver (by MID extension or SSRC)
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use super::certificate::Certificate;
use super::dtls::{DtlsContext, DtlsEvent, DtlsState};
use super::error::Result;
use super::ice::{IceAgent, LocalSocket, SelectedPair, SocketKind, Transmit};
use super::rtcp;
use super::rtp::{self, RtpHeader};
use super::srtp::SrtpContext;
use super::stream::{Feedback, FeedbackTarget, MediaPacket};
use super::stun;
use super::transceiver::{Transceiver, TransceiverParams};
use crate::config::ServerConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum BundleEvent {
    /// The client nominated a candidate pair.
    Connected(SelectedPair),
    /// SRTP keys are installed; media can flow.
    SecureReady,
    /// The DTLS handshake failed; the bundle is unusable.
    Failed(String),
    /// The client closed the DTLS association.
    Closed,
}

/// Negotiated transport parameters of one BUNDLE group.
#[derive(Debug, Clone)]
pub struct BundleParams {
    pub remote_ufrag: String,
    pub remote_pwd: String,
    /// `sha-256` fingerprint from the offer; `None` only when unencrypted.
    pub remote_fingerprint: Option<String>,
    pub encrypted: bool,
    pub mid_extension_id: Option<u8>,
    pub transceivers: Vec<TransceiverParams>,
}

pub struct Bundle {
    id: String,
    ice: IceAgent,
    dtls: Option<DtlsContext>,
    srtp: Option<SrtpContext>,
    encrypted: bool,
    mid_extension_id: Option<u8>,
    transceivers: Vec<Transceiver>,
    ssrc_to_mid: HashMap<u32, String>,
    events: VecDeque<BundleEvent>,
    feedback: VecDeque<(FeedbackTarget, Feedback)>,
}

impl Bundle {
    /// Bind the bundle's sockets and build its transceivers.
    pub fn new(
        params: BundleParams,
        config: &ServerConfig,
        certificate: Arc<Certificate>,
    ) -> Result<Self> {
        let mut ice = IceAgent::bind(config)?;
        ice.set_remote_credentials(&params.remote_ufrag, &params.remote_pwd);

        let dtls = if params.encrypted {
            let key_log = config
                .output_dtls_secrets
                .then(|| config.key_log_output_path.clone());
            Some(DtlsContext::new(
                certificate,
                params.remote_fingerprint.clone(),
                key_log,
            ))
        } else {
            tracing::warn!("Bundle running without encryption");
            None
        };

        let transceivers: Vec<Transceiver> = params
            .transceivers
            .into_iter()
            .map(|t| Transceiver::new(t, config))
            .collect();
        let id = transceivers
            .iter()
            .map(|t| t.mid())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Self {
            id,
            ice,
            dtls,
            srtp: None,
            encrypted: params.encrypted,
            mid_extension_id: params.mid_extension_id,
            transceivers,
            ssrc_to_mid: HashMap::new(),
            events: VecDeque::new(),
            feedback: VecDeque::new(),
        })
    }

    /// Space-separated MIDs, as in the `a=group:BUNDLE` line.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_ufrag(&self) -> &str {
        self.ice.local_ufrag()
    }

    pub fn local_pwd(&self) -> &str {
        self.ice.local_pwd()
    }

    pub fn local_candidates(&self) -> Vec<String> {
        self.ice.local_candidates()
    }

    pub fn take_sockets(&mut self) -> Vec<LocalSocket> {
        self.ice.take_sockets()
    }

    pub fn transceivers(&self) -> &[Transceiver] {
        &self.transceivers
    }

    pub fn transceiver(&self, mid: &str) -> Option<&Transceiver> {
        self.transceivers.iter().find(|t| t.mid() == mid)
    }

    fn transceiver_mut(&mut self, mid: &str) -> Option<&mut Transceiver> {
        self.transceivers.iter_mut().find(|t| t.mid() == mid)
    }

    pub fn is_secure(&self) -> bool {
        !self.encrypted || self.srtp.is_some()
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Feed one datagram received on `local` from `from`. Per-packet
    /// failures are logged and dropped.
    pub fn handle_datagram(&mut self, local: SocketKind, from: SocketAddr, data: &[u8], now: Instant) {
        if stun::is_stun_message(data) {
            match self.ice.handle_stun(local, from, data) {
                Ok(Some(pair)) => self.events.push_back(BundleEvent::Connected(pair)),
                Ok(None) => {}
                Err(e) => tracing::debug!("Bundle {}: bad STUN from {}: {}", self.id, from, e),
            }
            return;
        }

        match data.first().copied() {
            Some(20..=63) => self.handle_dtls(local, from, data, now),
            Some(128..=191) => self.handle_media(data, now),
            _ => tracing::trace!("Bundle {}: unclassified datagram from {}", self.id, from),
        }
    }

    fn handle_dtls(&mut self, local: SocketKind, from: SocketAddr, data: &[u8], now: Instant) {
        let Some(dtls) = &mut self.dtls else {
            tracing::debug!("Bundle {}: DTLS without encryption, dropping", self.id);
            return;
        };
        if let Some(pair) = self.ice.selected_pair() {
            if pair.remote != from {
                tracing::debug!(
                    "Bundle {}: DTLS from {} outside the selected pair, dropping",
                    self.id,
                    from
                );
                return;
            }
        }
        if let Err(e) = dtls.handle_datagram(data, now) {
            if dtls.state() == DtlsState::Failed {
                tracing::warn!("Bundle {}: DTLS handshake failed: {}", self.id, e);
                self.events.push_back(BundleEvent::Failed(e.to_string()));
            } else {
                tracing::debug!("Bundle {}: dropping DTLS datagram from {}: {}", self.id, from, e);
            }
        }
        self.drain_dtls(Some((local, from)));
    }

    /// Flush DTLS output. Before a pair is nominated, replies go back to
    /// where the handshake datagram came from.
    fn drain_dtls(&mut self, reply_to: Option<(SocketKind, SocketAddr)>) {
        let Some(dtls) = &mut self.dtls else {
            return;
        };
        while let Some(out) = dtls.poll_output() {
            match (self.ice.selected_pair(), reply_to) {
                (None, Some((local, remote))) => self.ice.send_to(local, remote, out),
                _ => self.ice.send(out),
            }
        }
        while let Some(event) = dtls.poll_event() {
            match event {
                DtlsEvent::ParamsReady(params) => match SrtpContext::from_dtls(&params) {
                    Ok(srtp) => {
                        tracing::info!(
                            "Bundle {}: SRTP ready ({:?})",
                            self.id,
                            params.srtp_profile
                        );
                        self.srtp = Some(srtp);
                        self.events.push_back(BundleEvent::SecureReady);
                    }
                    Err(e) => {
                        tracing::error!("Bundle {}: SRTP key derivation failed: {}", self.id, e);
                        self.events.push_back(BundleEvent::Failed(e.to_string()));
                    }
                },
                DtlsEvent::Closed => {
                    tracing::info!("Bundle {}: DTLS closed by client", self.id);
                    self.events.push_back(BundleEvent::Closed);
                }
            }
        }
    }

    fn handle_media(&mut self, data: &[u8], now: Instant) {
        if rtp::is_rtcp(data) {
            let plain = match &mut self.srtp {
                Some(srtp) => srtp.decrypt_rtcp(data),
                None if !self.encrypted => Ok(data.to_vec()),
                None => {
                    tracing::trace!("Bundle {}: RTCP before SRTP keys, dropping", self.id);
                    return;
                }
            };
            match plain {
                Ok(plain) => self.handle_rtcp(&plain, now),
                Err(e) => tracing::debug!("Bundle {}: dropping SRTCP: {}", self.id, e),
            }
        } else {
            let plain = match &mut self.srtp {
                Some(srtp) => srtp.decrypt_rtp(data),
                None if !self.encrypted => Ok(data.to_vec()),
                None => {
                    tracing::trace!("Bundle {}: RTP before SRTP keys, dropping", self.id);
                    return;
                }
            };
            match plain {
                Ok(plain) => self.handle_rtp(plain, now),
                Err(e) => tracing::debug!("Bundle {}: dropping SRTP: {}", self.id, e),
            }
        }
        self.flush_transceivers();
    }

    fn handle_rtp(&mut self, packet: Vec<u8>, now: Instant) {
        let header = match RtpHeader::parse(&packet) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!("Bundle {}: bad RTP: {}", self.id, e);
                return;
            }
        };
        if !(rtp::DYNAMIC_PT_MIN..=rtp::DYNAMIC_PT_MAX).contains(&header.payload_type) {
            tracing::trace!(
                "Bundle {}: ignoring static payload type {}",
                self.id,
                header.payload_type
            );
            return;
        }
        let Some(mid) = self.route_rtp(&packet, &header) else {
            tracing::debug!("Bundle {}: no transceiver for SSRC {}", self.id, header.ssrc);
            return;
        };
        let replaced = self
            .transceiver_mut(&mid)
            .and_then(|t| t.handle_rtp(packet, &header, now));
        if let Some(old) = replaced {
            self.forget_inbound_ssrc(old);
        }
    }

    fn forget_inbound_ssrc(&mut self, ssrc: u32) {
        tracing::debug!("Bundle {}: forgetting inbound SSRC {}", self.id, ssrc);
        self.ssrc_to_mid.remove(&ssrc);
        if let Some(srtp) = &mut self.srtp {
            srtp.remove_inbound_ssrc(ssrc);
        }
    }

    /// MID extension first, learned SSRC otherwise.
    fn route_rtp(&mut self, packet: &[u8], header: &RtpHeader) -> Option<String> {
        if let Some(mid) = self
            .mid_extension_id
            .and_then(|id| rtp::read_mid(packet, id))
        {
            if self.transceiver(&mid).is_some() {
                if self.ssrc_to_mid.get(&header.ssrc) != Some(&mid) {
                    tracing::debug!("Bundle {}: SSRC {} is mid {}", self.id, header.ssrc, mid);
                    self.ssrc_to_mid.insert(header.ssrc, mid.clone());
                }
                return Some(mid);
            }
        }
        self.ssrc_to_mid.get(&header.ssrc).cloned()
    }

    fn handle_rtcp(&mut self, compound: &[u8], now: Instant) {
        let packets = match rtcp::split_compound(compound) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Bundle {}: bad compound RTCP: {}", self.id, e);
                return;
            }
        };
        for packet in packets {
            let Some(mid) = self.route_rtcp(packet) else {
                tracing::trace!("Bundle {}: unrouted RTCP PT {}", self.id, packet[1]);
                continue;
            };
            if let Some(t) = self.transceiver_mut(&mid) {
                if let Err(e) = t.handle_rtcp(packet, now) {
                    tracing::debug!("Bundle {}: mid {} RTCP error: {}", self.id, mid, e);
                }
            }
        }
    }

    /// Our outgoing SSRCs win over the learned cache, and are cached too.
    fn route_rtcp(&mut self, packet: &[u8]) -> Option<String> {
        let ssrc = rtcp::routing_ssrc(packet).ok()?;
        if let Some(t) = self.transceivers.iter().find(|t| t.outgoing_ssrc() == ssrc) {
            let mid = t.mid().to_string();
            self.ssrc_to_mid.insert(ssrc, mid.clone());
            return Some(mid);
        }
        self.ssrc_to_mid.get(&ssrc).cloned()
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Forward a producer's packet to our client on `mid`.
    pub fn send_media(&mut self, mid: &str, packet: &MediaPacket, now: Instant) {
        if !self.is_secure() {
            return;
        }
        let Some(t) = self.transceiver_mut(mid) else {
            return;
        };
        let out = match t.forward_media(packet, now) {
            Ok(Some(out)) => out,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("Bundle {}: cannot forward on mid {}: {}", self.id, mid, e);
                return;
            }
        };
        match packet {
            MediaPacket::Rtp { .. } => self.send_rtp(out),
            MediaPacket::SenderReport(_) => self.send_rtcp(out),
        }
    }

    /// Feedback from a consumer about what our client sends on `mid`.
    pub fn feedback_for_client(&mut self, mid: &str, feedback: Feedback) {
        if let Some(t) = self.transceiver_mut(mid) {
            t.apply_feedback(feedback);
        }
        self.flush_transceivers();
    }

    pub fn request_key_frame(&mut self, mid: &str) {
        if let Some(t) = self.transceiver_mut(mid) {
            t.request_key_frame();
        }
        self.flush_transceivers();
    }

    /// Set where feedback about the stream on `mid` is relayed.
    pub fn set_source(&mut self, mid: &str, source: Option<FeedbackTarget>) {
        match self.transceiver_mut(mid) {
            Some(t) => t.set_source(source),
            None => tracing::warn!("Bundle has no mid {} to attach a source to", mid),
        }
    }

    fn send_rtp(&mut self, packet: Vec<u8>) {
        let protected = match &mut self.srtp {
            Some(srtp) => srtp.encrypt_rtp(&packet),
            None => Ok(packet),
        };
        match protected {
            Ok(p) => self.ice.send(p),
            Err(e) => tracing::debug!("Bundle {}: SRTP protect failed: {}", self.id, e),
        }
    }

    fn send_rtcp(&mut self, packet: Vec<u8>) {
        let protected = match &mut self.srtp {
            Some(srtp) => srtp.encrypt_rtcp(&packet),
            None => Ok(packet),
        };
        match protected {
            Ok(p) => self.ice.send(p),
            Err(e) => tracing::debug!("Bundle {}: SRTCP protect failed: {}", self.id, e),
        }
    }

    /// Collect RTCP and relayed feedback from every transceiver.
    fn flush_transceivers(&mut self) {
        let mut rtcp_out = Vec::new();
        for t in &mut self.transceivers {
            while let Some(packet) = t.poll_rtcp() {
                rtcp_out.push(packet);
            }
            while let Some(fb) = t.poll_feedback() {
                self.feedback.push_back(fb);
            }
        }
        if !self.is_secure() {
            return;
        }
        for packet in rtcp_out {
            self.send_rtcp(packet);
        }
    }

    // -----------------------------------------------------------------------
    // Timers and output
    // -----------------------------------------------------------------------

    pub fn poll_timeout(&self) -> Option<Instant> {
        let dtls = self.dtls.as_ref().and_then(|d| d.poll_timeout());
        self.transceivers
            .iter()
            .filter_map(|t| t.poll_timeout())
            .chain(dtls)
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(dtls) = &mut self.dtls {
            if let Err(e) = dtls.handle_timeout(now) {
                tracing::warn!("Bundle {}: {}", self.id, e);
                self.events.push_back(BundleEvent::Failed(e.to_string()));
            }
        }
        self.drain_dtls(None);
        for t in &mut self.transceivers {
            t.handle_timeout(now);
        }
        self.flush_transceivers();
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.ice.poll_transmit()
    }

    pub fn poll_event(&mut self) -> Option<BundleEvent> {
        self.events.pop_front()
    }

    pub fn poll_feedback(&mut self) -> Option<(FeedbackTarget, Feedback)> {
        self.feedback.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn install_srtp(&mut self, srtp: SrtpContext) {
        self.srtp = Some(srtp);
    }
}
