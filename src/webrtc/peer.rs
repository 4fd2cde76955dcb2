//! PeerContext: one remote participant's offer/answer and bundles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;

use super::bundle::{Bundle, BundleParams};
use super::certificate::Certificate;
use super::error::{Error, Result};
use super::sdp::{
    AnswerMedia, AnswerSsrc, AnswerTransport, MediaDescription, SessionDescription,
    MID_EXTENSION_URI,
};
use super::stream::{BundleCommand, BundleHandle, MediaSource};
use super::transceiver::{MediaKind, TransceiverParams};
use super::transport::{self, BundleTask};
use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignallingState {
    New,
    HaveRemoteOffer,
    Stable,
    Closed,
}

/// The accepted offer, between `set_remote_description` and
/// `generate_answer`.
struct Negotiation {
    offer: SessionDescription,
    encrypted: bool,
    /// Per m-line; `None` for rejected sections.
    accepted: Vec<Option<TransceiverParams>>,
    /// Indexes into `offer.media`, one entry per bundle.
    groups: Vec<Vec<usize>>,
}

struct StartedBundles {
    /// Keyed by the m-line index the attributes are written on.
    transports: HashMap<usize, AnswerTransport>,
    ssrcs: HashMap<String, u32>,
    sources: Vec<MediaSource>,
}

pub struct PeerContext {
    id: String,
    config: Arc<ServerConfig>,
    certificate: Arc<Certificate>,
    state: watch::Sender<SignallingState>,
    negotiation: Option<Negotiation>,
    bundles: Vec<BundleTask>,
    /// mid -> index into `bundles`
    mid_bundle: HashMap<String, usize>,
    /// Streams our client produces, in m-line order.
    sources: Vec<MediaSource>,
}

impl PeerContext {
    pub fn new(id: &str, config: Arc<ServerConfig>, certificate: Arc<Certificate>) -> Self {
        let (state, _) = watch::channel(SignallingState::New);
        Self {
            id: id.to_string(),
            config,
            certificate,
            state,
            negotiation: None,
            bundles: Vec::new(),
            mid_bundle: HashMap::new(),
            sources: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signalling_state(&self) -> SignallingState {
        *self.state.borrow()
    }

    /// Observe state changes; `Stable` is the signalling_stable event.
    pub fn subscribe_state(&self) -> watch::Receiver<SignallingState> {
        self.state.subscribe()
    }

    pub fn bundle_count(&self) -> usize {
        self.bundles.len()
    }

    pub fn sources(&self) -> &[MediaSource] {
        &self.sources
    }

    /// First stream of `kind` our client actually sends.
    pub fn source_of_kind(&self, kind: MediaKind) -> Option<MediaSource> {
        self.sources.iter().find(|s| s.kind == kind).cloned()
    }

    fn bundle_for(&self, mid: &str) -> Result<&BundleHandle> {
        self.mid_bundle
            .get(mid)
            .and_then(|i| self.bundles.get(*i))
            .map(|t| &t.handle)
            .ok_or_else(|| Error::InvalidState(format!("peer {} has no mid {}", self.id, mid)))
    }

    // -----------------------------------------------------------------------
    // Offer
    // -----------------------------------------------------------------------

    pub fn set_remote_description(&mut self, sdp: &str) -> Result<()> {
        if self.signalling_state() != SignallingState::New {
            return Err(Error::InvalidState(format!(
                "peer {} cannot take an offer in state {:?}",
                self.id,
                self.signalling_state()
            )));
        }
        let offer = SessionDescription::parse(sdp)?;

        let encrypted = offer.has_fingerprint();
        if !encrypted {
            if !self.config.disable_webrtc_encryption {
                return Err(Error::NegotiationRejected(
                    "offer has no DTLS fingerprint".into(),
                ));
            }
            tracing::warn!("Peer {}: offer has no fingerprint, media will be unencrypted", self.id);
        }

        let mid_extension_id = self.shared_mid_extension_id(&offer);
        let mut accepted = Vec::with_capacity(offer.media.len());
        for media in &offer.media {
            accepted.push(self.accept_media(media, encrypted, mid_extension_id)?);
        }
        let groups = bundle_groups(&offer, &accepted);

        tracing::info!(
            "Peer {}: remote offer with {} m-lines in {} bundle(s)",
            self.id,
            offer.media.len(),
            groups.len()
        );
        self.negotiation = Some(Negotiation {
            offer,
            encrypted,
            accepted,
            groups,
        });
        self.state.send_replace(SignallingState::HaveRemoteOffer);
        Ok(())
    }

    /// The MID extension id every transceiver is assumed to share: the first
    /// one offered.
    fn shared_mid_extension_id(&self, offer: &SessionDescription) -> Option<u8> {
        if !self
            .config
            .supported_header_extensions
            .iter()
            .any(|uri| uri == MID_EXTENSION_URI)
        {
            return None;
        }
        offer.media.iter().find_map(MediaDescription::mid_extension_id)
    }

    fn accept_media(
        &self,
        media: &MediaDescription,
        encrypted: bool,
        mid_extension_id: Option<u8>,
    ) -> Result<Option<TransceiverParams>> {
        let Some(mid) = media.mid.clone() else {
            return Err(Error::NegotiationRejected(format!(
                "m={} section without a=mid",
                media.media_type
            )));
        };
        let kind = match MediaKind::parse(&media.media_type) {
            Some(kind) if media.protocol.contains("RTP") => kind,
            _ => {
                tracing::info!("Peer {}: rejecting m={} mid {}", self.id, media.media_type, mid);
                return Ok(None);
            }
        };
        if media.transport.ice_ufrag.is_none() || media.transport.ice_pwd.is_none() {
            return Err(Error::NegotiationRejected(format!(
                "mid {} has no ICE credentials",
                mid
            )));
        }
        if encrypted && media.transport.setup.as_deref() == Some("passive") {
            return Err(Error::NegotiationRejected(format!(
                "mid {} asks for a=setup:passive; the server is always the DTLS server",
                mid
            )));
        }

        let supported = self.config.supported_codecs(&media.media_type);
        let codecs: Vec<_> = media
            .codecs
            .iter()
            .filter(|c| c.is_supported_by(supported))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(Error::NegotiationRejected(format!(
                "no supported {} codec offered for mid {}",
                media.media_type, mid
            )));
        }

        Ok(Some(TransceiverParams {
            mid,
            kind,
            direction: media.direction().flipped(),
            codecs,
            mid_extension_id,
        }))
    }

    // -----------------------------------------------------------------------
    // Answer
    // -----------------------------------------------------------------------

    /// Build the bundles, start their tasks and write the answer. Moves the
    /// peer to `Stable`.
    pub fn generate_answer(&mut self) -> Result<String> {
        if self.signalling_state() != SignallingState::HaveRemoteOffer {
            return Err(Error::InvalidState(format!(
                "peer {} has no remote offer to answer",
                self.id
            )));
        }
        let negotiation = self
            .negotiation
            .take()
            .ok_or_else(|| Error::InvalidState("remote offer missing".into()))?;

        let mut tasks = Vec::new();
        let started = match self.start_bundles(&negotiation, &mut tasks) {
            Ok(started) => started,
            Err(e) => {
                for task in &tasks {
                    task.join.abort();
                }
                return Err(e);
            }
        };

        let mut media = Vec::with_capacity(negotiation.offer.media.len());
        for (i, m) in negotiation.offer.media.iter().enumerate() {
            match &negotiation.accepted[i] {
                Some(params) => {
                    let ssrc = started.ssrcs.get(&params.mid).copied();
                    media.push(AnswerMedia::Accepted {
                        media_type: m.media_type.clone(),
                        mid: params.mid.clone(),
                        direction: params.direction,
                        codecs: params.codecs.clone(),
                        extmaps: m
                            .extmaps
                            .iter()
                            .filter(|e| self.config.supported_header_extensions.contains(&e.uri))
                            .cloned()
                            .collect(),
                        rtcp_mux: m.rtcp_mux,
                        rtcp_rsize: m.rtcp_rsize,
                        transport: started.transports.get(&i).cloned(),
                        ssrc: ssrc
                            .filter(|_| params.direction.sends())
                            .map(|ssrc| AnswerSsrc::for_mid(&params.mid, ssrc)),
                    });
                }
                None => media.push(AnswerMedia::Rejected {
                    media_type: m.media_type.clone(),
                    protocol: m.protocol.clone(),
                    formats: m.formats.clone(),
                    mid: m.mid.clone(),
                }),
            }
        }

        let groups: Vec<Vec<String>> = negotiation
            .groups
            .iter()
            .map(|g| {
                g.iter()
                    .filter_map(|i| negotiation.accepted[*i].as_ref().map(|p| p.mid.clone()))
                    .collect()
            })
            .collect();
        let answer = super::sdp::write_answer(&groups, &media);

        for (index, mids) in groups.iter().enumerate() {
            for mid in mids {
                self.mid_bundle.insert(mid.clone(), index);
            }
        }
        self.bundles = tasks;
        self.sources = started.sources;
        self.state.send_replace(SignallingState::Stable);
        tracing::info!("Peer {}: answer generated, signalling stable", self.id);
        tracing::debug!("Peer {} answer:\n{}", self.id, answer);
        Ok(answer)
    }

    /// Per bundle group: bind, build and spawn. Tasks are pushed as they
    /// start so the caller can stop them on failure.
    fn start_bundles(
        &self,
        negotiation: &Negotiation,
        tasks: &mut Vec<BundleTask>,
    ) -> Result<StartedBundles> {
        let mut transports = HashMap::new();
        let mut ssrcs = HashMap::new();
        let mut sources = Vec::new();

        for group in &negotiation.groups {
            let first = &negotiation.offer.media[group[0]];
            let remote_fingerprint = first
                .transport
                .fingerprint
                .as_ref()
                .filter(|fp| {
                    let sha256 = fp.algorithm == "sha-256";
                    if !sha256 {
                        tracing::warn!(
                            "Peer {}: {} fingerprint cannot be verified",
                            self.id,
                            fp.algorithm
                        );
                    }
                    sha256
                })
                .map(|fp| fp.value.clone());
            let params = BundleParams {
                remote_ufrag: first.transport.ice_ufrag.clone().unwrap_or_default(),
                remote_pwd: first.transport.ice_pwd.clone().unwrap_or_default(),
                remote_fingerprint,
                encrypted: negotiation.encrypted,
                mid_extension_id: group
                    .iter()
                    .find_map(|i| negotiation.accepted[*i].as_ref())
                    .and_then(|p| p.mid_extension_id),
                transceivers: group
                    .iter()
                    .filter_map(|i| negotiation.accepted[*i].clone())
                    .collect(),
            };

            let bundle = Bundle::new(params, &self.config, self.certificate.clone())?;
            transports.insert(
                group[0],
                AnswerTransport {
                    candidates: bundle.local_candidates(),
                    ice_ufrag: bundle.local_ufrag().to_string(),
                    ice_pwd: bundle.local_pwd().to_string(),
                    fingerprint: negotiation
                        .encrypted
                        .then(|| self.certificate.fingerprint().to_string()),
                },
            );
            let mut pending = Vec::new();
            for (i, t) in group.iter().zip(bundle.transceivers()) {
                ssrcs.insert(t.mid().to_string(), t.outgoing_ssrc());
                if t.direction().receives() {
                    pending.push((*i, t.mid().to_string(), t.kind(), t.media_sender()));
                }
            }

            let task = transport::spawn(&self.id, bundle)?;
            for (i, mid, kind, media) in pending {
                sources.push((
                    i,
                    MediaSource {
                        mid,
                        kind,
                        media,
                        bundle: task.handle.clone(),
                    },
                ));
            }
            tasks.push(task);
        }
        sources.sort_by_key(|(i, _)| *i);
        Ok(StartedBundles {
            transports,
            ssrcs,
            sources: sources.into_iter().map(|(_, s)| s).collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Stream wiring
    // -----------------------------------------------------------------------

    /// Make our client receive `source` on `mid` (or nothing).
    pub async fn replace_stream(&self, mid: &str, source: Option<MediaSource>) -> Result<()> {
        self.bundle_for(mid)?
            .send(BundleCommand::ReplaceStream {
                mid: mid.to_string(),
                source,
            })
            .await
    }

    /// Ask our client for a key frame on `mid`.
    pub async fn request_key_frame(&self, mid: &str) -> Result<()> {
        self.bundle_for(mid)?
            .send(BundleCommand::RequestKeyFrame {
                mid: mid.to_string(),
            })
            .await
    }

    /// Stop every bundle task; the peer cannot be reused.
    pub fn close(&mut self) {
        for task in self.bundles.drain(..) {
            if task.handle.try_send(BundleCommand::Close).is_err() {
                task.join.abort();
            }
        }
        self.mid_bundle.clear();
        self.sources.clear();
        self.negotiation = None;
        self.state.send_replace(SignallingState::Closed);
        tracing::info!("Peer {} closed", self.id);
    }
}

impl Drop for PeerContext {
    fn drop(&mut self) {
        for task in &self.bundles {
            task.join.abort();
        }
    }
}

/// Resolve once `rx`'s peer is stable; fails if it closes first.
pub async fn wait_for_stable(mut rx: watch::Receiver<SignallingState>) -> Result<()> {
    let state = *rx
        .wait_for(|s| matches!(s, SignallingState::Stable | SignallingState::Closed))
        .await
        .map_err(|_| Error::InvalidState("peer dropped before signalling finished".into()))?;
    match state {
        SignallingState::Stable => Ok(()),
        _ => Err(Error::InvalidState("peer closed before signalling finished".into())),
    }
}

/// Accepted m-lines grouped per `a=group:BUNDLE`; ungrouped ones get a
/// bundle each.
fn bundle_groups(offer: &SessionDescription, accepted: &[Option<TransceiverParams>]) -> Vec<Vec<usize>> {
    let index_of = |mid: &str| {
        accepted
            .iter()
            .position(|p| p.as_ref().map(|p| p.mid.as_str()) == Some(mid))
    };
    let mut seen = HashSet::new();
    let mut groups = Vec::new();
    for group in &offer.bundle_groups {
        let members: Vec<usize> = group
            .iter()
            .filter_map(|mid| index_of(mid))
            .filter(|i| seen.insert(*i))
            .collect();
        if !members.is_empty() {
            groups.push(members);
        }
    }
    for (i, p) in accepted.iter().enumerate() {
        if p.is_some() && seen.insert(i) {
            groups.push(vec![i]);
        }
    }
    groups
}
