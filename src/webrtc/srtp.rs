//! SRTP/SRTCP packet protection (RFC 3711, RFC 7714).
//!
//! Two protection profiles are supported, as negotiated through the DTLS
//! `use_srtp` extension:
//! - `SRTP_AES128_CM_HMAC_SHA1_80`: AES-128 counter mode with a 10-byte
//!   HMAC-SHA1 tag.
//! - `SRTP_AEAD_AES_128_GCM`: AES-128-GCM with a 16-byte tag.
//!
//! Keys come from the DTLS exporter (`EXTRACTOR-dtls_srtp`, RFC 5764). The
//! client's write keys protect inbound traffic, the server's outbound.

use std::collections::HashMap;

use aes::cipher::{KeyIvInit, StreamCipher};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};

use super::crypto::{hmac_sha1, prf};
use super::cursor::{self, WriteExt};
use super::dtls::DtlsParams;
use super::error::{Error, Result};
use super::rtp;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// SRTP auth tag length for HMAC-SHA1-80 (80 bits = 10 bytes).
pub const SRTP_AUTH_TAG_LEN: usize = 10;

/// GCM authentication tag length.
pub const GCM_TAG_LEN: usize = 16;

/// Master key length for AES-128 (16 bytes).
const MASTER_KEY_LEN: usize = 16;

/// HMAC-SHA1 session auth key length.
const AUTH_KEY_LEN: usize = 20;

/// Minimum RTCP header size: V/P/RC(1) + PT(1) + length(2) + SSRC(4) = 8 bytes.
const RTCP_HEADER_SIZE: usize = 8;

/// SRTCP E flag in the index word.
const SRTCP_E_FLAG: u32 = 0x8000_0000;

/// DTLS exporter label for SRTP keying material (RFC 5764).
const EXPORTER_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// SRTP key derivation labels (RFC 3711, section 4.3.1).
const LABEL_CIPHER_KEY: u8 = 0x00;
const LABEL_AUTH_KEY: u8 = 0x01;
const LABEL_SALT: u8 = 0x02;

/// SRTCP key derivation labels (RFC 3711, section 3.4).
const LABEL_SRTCP_CIPHER_KEY: u8 = 0x03;
const LABEL_SRTCP_AUTH_KEY: u8 = 0x04;
const LABEL_SRTCP_SALT: u8 = 0x05;

/// SRTP protection profile (RFC 5764 / RFC 7714 identifiers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpProfile {
    Aes128CmHmacSha1_80,
    AeadAes128Gcm,
}

impl SrtpProfile {
    pub fn id(self) -> u16 {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => 0x0001,
            SrtpProfile::AeadAes128Gcm => 0x0007,
        }
    }

    /// Master and session salt length.
    pub fn salt_len(self) -> usize {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => 14,
            SrtpProfile::AeadAes128Gcm => 12,
        }
    }

    /// Bytes appended to each protected packet besides the SRTCP index.
    pub fn tag_len(self) -> usize {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => SRTP_AUTH_TAG_LEN,
            SrtpProfile::AeadAes128Gcm => GCM_TAG_LEN,
        }
    }
}

/// Master key and salt for one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterKey {
    pub key: [u8; MASTER_KEY_LEN],
    pub salt: Vec<u8>,
}

/// Session keys for one direction, SRTP and SRTCP.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionKeys {
    pub rtp_cipher_key: [u8; MASTER_KEY_LEN],
    pub rtp_auth_key: [u8; AUTH_KEY_LEN],
    pub rtp_salt: Vec<u8>,
    pub rtcp_cipher_key: [u8; MASTER_KEY_LEN],
    pub rtcp_auth_key: [u8; AUTH_KEY_LEN],
    pub rtcp_salt: Vec<u8>,
}

/// Split the DTLS exporter output into `(client, server)` master keys.
///
/// Layout: client key, server key, client salt, server salt.
pub fn master_keys_from_dtls(params: &DtlsParams) -> Result<(MasterKey, MasterKey)> {
    let salt_len = params.srtp_profile.salt_len();
    let seed = [params.client_random.as_slice(), params.server_random.as_slice()].concat();
    let block = prf(
        &params.master_secret,
        EXPORTER_LABEL,
        &seed,
        2 * (MASTER_KEY_LEN + salt_len),
    )?;

    let mut client = MasterKey {
        key: [0u8; MASTER_KEY_LEN],
        salt: block[2 * MASTER_KEY_LEN..2 * MASTER_KEY_LEN + salt_len].to_vec(),
    };
    client.key.copy_from_slice(&block[..MASTER_KEY_LEN]);
    let mut server = MasterKey {
        key: [0u8; MASTER_KEY_LEN],
        salt: block[2 * MASTER_KEY_LEN + salt_len..].to_vec(),
    };
    server.key.copy_from_slice(&block[MASTER_KEY_LEN..2 * MASTER_KEY_LEN]);
    Ok((client, server))
}

/// Derive SRTP and SRTCP session keys from a master key (RFC 3711, 4.3.1).
///
/// key_derivation_rate = 0, so index DIV key_derivation_rate = 0.
pub fn derive_session_keys(master: &MasterKey, profile: SrtpProfile) -> SessionKeys {
    let salt_len = profile.salt_len();
    let mut keys = SessionKeys {
        rtp_cipher_key: [0u8; MASTER_KEY_LEN],
        rtp_auth_key: [0u8; AUTH_KEY_LEN],
        rtp_salt: kdf(master, LABEL_SALT, salt_len),
        rtcp_cipher_key: [0u8; MASTER_KEY_LEN],
        rtcp_auth_key: [0u8; AUTH_KEY_LEN],
        rtcp_salt: kdf(master, LABEL_SRTCP_SALT, salt_len),
    };
    keys.rtp_cipher_key
        .copy_from_slice(&kdf(master, LABEL_CIPHER_KEY, MASTER_KEY_LEN));
    keys.rtp_auth_key
        .copy_from_slice(&kdf(master, LABEL_AUTH_KEY, AUTH_KEY_LEN));
    keys.rtcp_cipher_key
        .copy_from_slice(&kdf(master, LABEL_SRTCP_CIPHER_KEY, MASTER_KEY_LEN));
    keys.rtcp_auth_key
        .copy_from_slice(&kdf(master, LABEL_SRTCP_AUTH_KEY, AUTH_KEY_LEN));
    keys
}

/// AES-CM key derivation: keystream under the master key with
/// IV = (master_salt XOR (label at byte 7)) || 0x0000.
fn kdf(master: &MasterKey, label: u8, output_len: usize) -> Vec<u8> {
    // Shorter (GCM) salts are zero-padded on the right to 112 bits.
    let mut iv = [0u8; 16];
    for (i, b) in master.salt.iter().take(14).enumerate() {
        iv[i] = *b;
    }
    iv[7] ^= label;

    let mut output = vec![0u8; output_len];
    let mut cipher = Aes128Ctr::new((&master.key).into(), &iv.into());
    cipher.apply_keystream(&mut output);
    output
}

/// Per-SSRC rollover state.
#[derive(Debug, Clone, Copy, Default)]
struct RocState {
    roc: u32,
    last_seq: u16,
}

impl RocState {
    /// RFC 3711 appendix A index guess.
    fn guess(&self, seq: u16) -> u32 {
        if seq < self.last_seq && self.last_seq - seq > 0x8000 {
            self.roc.wrapping_add(1)
        } else if seq > self.last_seq && seq - self.last_seq > 0x8000 && self.roc > 0 {
            self.roc - 1
        } else {
            self.roc
        }
    }

    fn update(&mut self, roc: u32, seq: u16) {
        if roc > self.roc || (roc == self.roc && seq > self.last_seq) {
            self.roc = roc;
            self.last_seq = seq;
        }
    }
}

/// SRTP context for one bundle: both directions, all SSRCs.
#[derive(Debug)]
pub struct SrtpContext {
    profile: SrtpProfile,
    /// Keys protecting what the remote sends us.
    remote: SessionKeys,
    /// Keys protecting what we send.
    local: SessionKeys,
    inbound_roc: HashMap<u32, RocState>,
    outbound_roc: HashMap<u32, RocState>,
    /// Next SRTCP index to send, per SSRC.
    srtcp_index: HashMap<u32, u32>,
}

impl SrtpContext {
    pub fn new(profile: SrtpProfile, local: &MasterKey, remote: &MasterKey) -> Self {
        Self {
            profile,
            remote: derive_session_keys(remote, profile),
            local: derive_session_keys(local, profile),
            inbound_roc: HashMap::new(),
            outbound_roc: HashMap::new(),
            srtcp_index: HashMap::new(),
        }
    }

    /// Server-side context from a completed DTLS handshake.
    pub fn from_dtls(params: &DtlsParams) -> Result<Self> {
        let (client, server) = master_keys_from_dtls(params)?;
        Ok(Self::new(params.srtp_profile, &server, &client))
    }

    /// Forget the rollover state of a remote SSRC that went away.
    pub fn remove_inbound_ssrc(&mut self, ssrc: u32) -> bool {
        self.inbound_roc.remove(&ssrc).is_some()
    }

    /// Encrypt an outbound RTP packet. Everything after the full RTP header
    /// (CSRCs and extensions included) is encrypted.
    pub fn encrypt_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let header_len = rtp::full_header_len(packet)
            .ok_or_else(|| Error::malformed("RTP packet too short for SRTP protection"))?;
        let ssrc = cursor::get_u32(packet, 8)?;
        let seq = cursor::get_u16(packet, 2)?;

        let state = self.outbound_roc.entry(ssrc).or_insert(RocState {
            roc: 0,
            last_seq: seq,
        });
        let roc = state.guess(seq);
        state.update(roc, seq);

        let (header, payload) = packet.split_at(header_len);
        match self.profile {
            SrtpProfile::Aes128CmHmacSha1_80 => {
                let keys = &self.local;
                let mut out = Vec::with_capacity(packet.len() + SRTP_AUTH_TAG_LEN);
                out.extend_from_slice(header);
                out.extend_from_slice(payload);
                let iv = build_iv(&keys.rtp_salt, ssrc, roc, seq);
                let mut cipher = Aes128Ctr::new((&keys.rtp_cipher_key).into(), &iv.into());
                cipher.apply_keystream(&mut out[header_len..]);
                let tag = hmac_sha1(&keys.rtp_auth_key, &[&out, &roc.to_be_bytes()])?;
                out.extend_from_slice(&tag[..SRTP_AUTH_TAG_LEN]);
                Ok(out)
            }
            SrtpProfile::AeadAes128Gcm => {
                let nonce = build_gcm_iv(&self.local.rtp_salt, ssrc, roc, seq);
                let ct = gcm_seal(&self.local.rtp_cipher_key, &nonce, header, payload)?;
                Ok([header, ct.as_slice()].concat())
            }
        }
    }

    /// Verify and decrypt an inbound SRTP packet.
    ///
    /// Fails with [`Error::AuthenticationFailure`] on tag mismatch; the
    /// rollover state is only advanced for authentic packets.
    pub fn decrypt_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.profile.tag_len();
        if packet.len() < rtp::RTP_HEADER_SIZE + tag_len {
            return Err(Error::malformed("SRTP packet too short"));
        }
        let body_end = packet.len() - tag_len;
        let header_len = rtp::full_header_len(&packet[..body_end])
            .ok_or_else(|| Error::malformed("SRTP packet has truncated RTP header"))?;
        let ssrc = cursor::get_u32(packet, 8)?;
        let seq = cursor::get_u16(packet, 2)?;

        let state = self.inbound_roc.get(&ssrc).copied().unwrap_or(RocState {
            roc: 0,
            last_seq: seq,
        });
        let roc = state.guess(seq);

        let out = match self.profile {
            SrtpProfile::Aes128CmHmacSha1_80 => {
                let keys = &self.remote;
                let (authenticated, received_tag) = packet.split_at(body_end);
                let expected = hmac_sha1(&keys.rtp_auth_key, &[authenticated, &roc.to_be_bytes()])?;
                if received_tag != &expected[..SRTP_AUTH_TAG_LEN] {
                    return Err(Error::AuthenticationFailure(format!(
                        "SRTP tag mismatch ssrc={} seq={}",
                        ssrc, seq
                    )));
                }
                let mut out = authenticated.to_vec();
                let iv = build_iv(&keys.rtp_salt, ssrc, roc, seq);
                let mut cipher = Aes128Ctr::new((&keys.rtp_cipher_key).into(), &iv.into());
                cipher.apply_keystream(&mut out[header_len..]);
                out
            }
            SrtpProfile::AeadAes128Gcm => {
                let (header, sealed) = packet.split_at(header_len);
                let nonce = build_gcm_iv(&self.remote.rtp_salt, ssrc, roc, seq);
                let plain = gcm_open(&self.remote.rtp_cipher_key, &nonce, header, sealed)
                    .map_err(|_| {
                        Error::AuthenticationFailure(format!(
                            "SRTP GCM tag mismatch ssrc={} seq={}",
                            ssrc, seq
                        ))
                    })?;
                [header, plain.as_slice()].concat()
            }
        };

        self.inbound_roc.entry(ssrc).or_insert(state).update(roc, seq);
        Ok(out)
    }

    /// Encrypt an outbound (compound) RTCP packet.
    ///
    /// Output: `header(8) || encrypted || E|index(4) || tag(10)` for AES-CM,
    /// `header(8) || encrypted+tag(16) || E|index(4)` for GCM.
    pub fn encrypt_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < RTCP_HEADER_SIZE {
            return Err(Error::malformed("RTCP packet too short for SRTCP protection"));
        }
        let ssrc = cursor::get_u32(packet, 4)?;
        let counter = self.srtcp_index.entry(ssrc).or_insert(0);
        let index = *counter;
        *counter = counter.wrapping_add(1) & 0x7FFF_FFFF;
        let e_index = SRTCP_E_FLAG | index;

        let (header, payload) = packet.split_at(RTCP_HEADER_SIZE);
        match self.profile {
            SrtpProfile::Aes128CmHmacSha1_80 => {
                let keys = &self.local;
                let mut out: Vec<u8> =
                    Vec::with_capacity(packet.len() + 4 + SRTP_AUTH_TAG_LEN);
                out.put_slice(header);
                out.put_slice(payload);
                let iv = build_srtcp_iv(&keys.rtcp_salt, ssrc, index);
                let mut cipher = Aes128Ctr::new((&keys.rtcp_cipher_key).into(), &iv.into());
                cipher.apply_keystream(&mut out[RTCP_HEADER_SIZE..]);
                out.put_u32(e_index);
                let tag = hmac_sha1(&keys.rtcp_auth_key, &[&out])?;
                out.put_slice(&tag[..SRTP_AUTH_TAG_LEN]);
                Ok(out)
            }
            SrtpProfile::AeadAes128Gcm => {
                let nonce = build_gcm_rtcp_iv(&self.local.rtcp_salt, ssrc, index);
                let aad = [header, e_index.to_be_bytes().as_slice()].concat();
                let ct = gcm_seal(&self.local.rtcp_cipher_key, &nonce, &aad, payload)?;
                let mut out = [header, ct.as_slice()].concat();
                out.put_u32(e_index);
                Ok(out)
            }
        }
    }

    /// Verify and decrypt an inbound SRTCP packet.
    pub fn decrypt_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.profile.tag_len();
        if packet.len() < RTCP_HEADER_SIZE + 4 + tag_len {
            return Err(Error::malformed("SRTCP packet too short"));
        }
        let ssrc = cursor::get_u32(packet, 4)?;
        let header = &packet[..RTCP_HEADER_SIZE];

        match self.profile {
            SrtpProfile::Aes128CmHmacSha1_80 => {
                let keys = &self.remote;
                let tag_offset = packet.len() - SRTP_AUTH_TAG_LEN;
                let (authenticated, received_tag) = packet.split_at(tag_offset);
                let expected = hmac_sha1(&keys.rtcp_auth_key, &[authenticated])?;
                if received_tag != &expected[..SRTP_AUTH_TAG_LEN] {
                    return Err(Error::AuthenticationFailure(format!(
                        "SRTCP tag mismatch ssrc={}",
                        ssrc
                    )));
                }
                let ei_offset = tag_offset - 4;
                let e_index = cursor::get_u32(packet, ei_offset)?;
                let mut out = packet[..ei_offset].to_vec();
                if e_index & SRTCP_E_FLAG != 0 {
                    let iv = build_srtcp_iv(&keys.rtcp_salt, ssrc, e_index & !SRTCP_E_FLAG);
                    let mut cipher = Aes128Ctr::new((&keys.rtcp_cipher_key).into(), &iv.into());
                    cipher.apply_keystream(&mut out[RTCP_HEADER_SIZE..]);
                }
                Ok(out)
            }
            SrtpProfile::AeadAes128Gcm => {
                let ei_offset = packet.len() - 4;
                let e_index = cursor::get_u32(packet, ei_offset)?;
                let sealed = &packet[RTCP_HEADER_SIZE..ei_offset];
                let nonce =
                    build_gcm_rtcp_iv(&self.remote.rtcp_salt, ssrc, e_index & !SRTCP_E_FLAG);
                let aad = [header, e_index.to_be_bytes().as_slice()].concat();
                let plain = gcm_open(&self.remote.rtcp_cipher_key, &nonce, &aad, sealed)
                    .map_err(|_| {
                        Error::AuthenticationFailure(format!("SRTCP GCM tag mismatch ssrc={}", ssrc))
                    })?;
                Ok([header, plain.as_slice()].concat())
            }
        }
    }
}

/// Build the AES-128-CM IV for SRTP (RFC 3711, 4.1.1).
///
/// IV = (session_salt XOR (SSRC || packet_index)) padded to 16 bytes.
/// Packet index = ROC << 16 | seq.
fn build_iv(salt: &[u8], ssrc: u32, roc: u32, seq: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[4..8].copy_from_slice(&ssrc.to_be_bytes());
    iv[8..12].copy_from_slice(&roc.to_be_bytes());
    iv[12..14].copy_from_slice(&seq.to_be_bytes());
    for (b, s) in iv.iter_mut().zip(salt.iter().take(14)) {
        *b ^= s;
    }
    iv
}

/// Build the AES-128-CM IV for SRTCP: the 31-bit index sits right-aligned in
/// the 48-bit packet index field.
fn build_srtcp_iv(salt: &[u8], ssrc: u32, srtcp_index: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[4..8].copy_from_slice(&ssrc.to_be_bytes());
    iv[10..14].copy_from_slice(&srtcp_index.to_be_bytes());
    for (b, s) in iv.iter_mut().zip(salt.iter().take(14)) {
        *b ^= s;
    }
    iv
}

/// RFC 7714 section 8.1: `0x0000 || SSRC || ROC || SEQ` XOR salt.
fn build_gcm_iv(salt: &[u8], ssrc: u32, roc: u32, seq: u16) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[2..6].copy_from_slice(&ssrc.to_be_bytes());
    iv[6..10].copy_from_slice(&roc.to_be_bytes());
    iv[10..12].copy_from_slice(&seq.to_be_bytes());
    for (b, s) in iv.iter_mut().zip(salt.iter()) {
        *b ^= s;
    }
    iv
}

/// RFC 7714 section 9.1: `0x0000 || SSRC || 0x0000 || 0 || SRTCP index` XOR salt.
fn build_gcm_rtcp_iv(salt: &[u8], ssrc: u32, srtcp_index: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[2..6].copy_from_slice(&ssrc.to_be_bytes());
    iv[8..12].copy_from_slice(&srtcp_index.to_be_bytes());
    for (b, s) in iv.iter_mut().zip(salt.iter()) {
        *b ^= s;
    }
    iv
}

fn gcm_seal(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| Error::Crypto("AES-GCM encryption failed".into()))
}

fn gcm_open(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| Error::AuthenticationFailure("AES-GCM tag mismatch".into()))
}
