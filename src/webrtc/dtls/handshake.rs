//! DTLS handshake messages: header codec, fragment reassembly, ClientHello
//! parsing and the server flight builders.

use std::collections::BTreeMap;

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};

use super::record::DTLS_1_2;
use crate::webrtc::cursor::{Reader, WriteExt};
use crate::webrtc::error::{Error, Result};

pub const HANDSHAKE_HEADER_LEN: usize = 12;

pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const CERTIFICATE: u8 = 11;
pub const SERVER_KEY_EXCHANGE: u8 = 12;
pub const CERTIFICATE_REQUEST: u8 = 13;
pub const SERVER_HELLO_DONE: u8 = 14;
pub const CERTIFICATE_VERIFY: u8 = 15;
pub const CLIENT_KEY_EXCHANGE: u8 = 16;
pub const FINISHED: u8 = 20;

/// TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
pub const CIPHER_SUITE: u16 = 0xc02b;

pub const EXT_RENEGOTIATION_INFO: u16 = 0xff01;
pub const EXT_EC_POINT_FORMATS: u16 = 0x000b;
pub const EXT_USE_SRTP: u16 = 0x000e;

const NAMED_CURVE: u8 = 3;
const SECP256R1: u16 = 0x0017;
/// ecdsa_secp256r1_sha256
const SIG_ECDSA_SHA256: u16 = 0x0403;

/// rsa_sign, ecdsa_sign and the RFC 8422 `ecdsa_fixed_ecdh` placeholder
/// browsers send.
const CERTIFICATE_TYPES: [u8; 3] = [1, 2, 64];

const SUPPORTED_SIGNATURE_ALGORITHMS: [u16; 20] = [
    0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0807, 0x0808, 0x0809, 0x080a, 0x080b,
    0x0401, 0x0501, 0x0601, 0x0301, 0x0302, 0x0303, 0x0402, 0x0502, 0x0602,
];

pub fn message_name(msg_type: u8) -> &'static str {
    match msg_type {
        CLIENT_HELLO => "ClientHello",
        SERVER_HELLO => "ServerHello",
        CERTIFICATE => "Certificate",
        SERVER_KEY_EXCHANGE => "ServerKeyExchange",
        CERTIFICATE_REQUEST => "CertificateRequest",
        SERVER_HELLO_DONE => "ServerHelloDone",
        CERTIFICATE_VERIFY => "CertificateVerify",
        CLIENT_KEY_EXCHANGE => "ClientKeyExchange",
        FINISHED => "Finished",
        _ => "Unknown",
    }
}

// ---------------------------------------------------------------------------
// Header codec and reassembly
// ---------------------------------------------------------------------------

/// One handshake fragment as it appears inside a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment<'a> {
    pub msg_type: u8,
    pub length: u32,
    pub message_seq: u16,
    pub offset: u32,
    pub body: &'a [u8],
}

/// Parse every fragment carried by one handshake record.
pub fn parse_fragments(payload: &[u8]) -> Result<Vec<Fragment<'_>>> {
    let mut r = Reader::new(payload);
    let mut fragments = Vec::new();
    while !r.is_empty() {
        let msg_type = r.read_u8()?;
        let length = r.read_u24()?;
        let message_seq = r.read_u16()?;
        let offset = r.read_u24()?;
        let body = r.read_vec24()?;
        if offset as usize + body.len() > length as usize {
            return Err(Error::malformed(format!(
                "{} fragment overruns its message",
                message_name(msg_type)
            )));
        }
        fragments.push(Fragment {
            msg_type,
            length,
            message_seq,
            offset,
            body,
        });
    }
    Ok(fragments)
}

/// A complete handshake message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: u8,
    pub message_seq: u16,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: u8, message_seq: u16, body: Vec<u8>) -> Self {
        Self {
            msg_type,
            message_seq,
            body,
        }
    }

    /// Unfragmented encoding; also the form hashed into the transcript.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::with_capacity(HANDSHAKE_HEADER_LEN + self.body.len());
        buf.put_u8(self.msg_type);
        buf.put_u24(self.body.len() as u32);
        buf.put_u16(self.message_seq);
        buf.put_u24(0);
        buf.put_u24(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf
    }
}

struct Partial {
    msg_type: u8,
    body: Vec<u8>,
    /// Received byte ranges, merged lazily.
    ranges: Vec<(usize, usize)>,
}

impl Partial {
    fn is_complete(&mut self) -> bool {
        self.ranges.sort_unstable();
        let mut covered = 0;
        for &(start, end) in &self.ranges {
            if start > covered {
                return false;
            }
            covered = covered.max(end);
        }
        covered == self.body.len()
    }
}

/// Largest handshake message accepted from a client. Browser certificates
/// are well under this.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024;
/// How many messages past the next expected one may be buffered.
pub const MAX_SEQ_AHEAD: u16 = 8;
const MAX_FRAGMENTS_PER_MESSAGE: usize = 64;

/// Reorders and reassembles incoming handshake messages by `message_seq`.
#[derive(Default)]
pub struct Reassembler {
    next_seq: u16,
    partial: BTreeMap<u16, Partial>,
}

impl Reassembler {
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    /// True when the fragment belongs to a message already delivered.
    pub fn is_retransmission(&self, fragment: &Fragment<'_>) -> bool {
        fragment.message_seq < self.next_seq
    }

    /// Add a fragment; returns the messages that became deliverable, in
    /// order.
    pub fn push(&mut self, fragment: &Fragment<'_>) -> Result<Vec<Message>> {
        if self.is_retransmission(fragment) {
            return Ok(Vec::new());
        }
        let length = fragment.length as usize;
        if length > MAX_MESSAGE_LEN {
            return Err(Error::malformed(format!(
                "{} of {} bytes exceeds the handshake message limit",
                message_name(fragment.msg_type),
                length
            )));
        }
        if fragment.message_seq - self.next_seq >= MAX_SEQ_AHEAD {
            return Err(Error::malformed(format!(
                "handshake message {} is too far ahead of {}",
                fragment.message_seq, self.next_seq
            )));
        }
        let entry = self
            .partial
            .entry(fragment.message_seq)
            .or_insert_with(|| Partial {
                msg_type: fragment.msg_type,
                body: vec![0u8; length],
                ranges: Vec::new(),
            });
        if entry.msg_type != fragment.msg_type || entry.body.len() != length {
            return Err(Error::malformed(format!(
                "inconsistent fragments for handshake message {}",
                fragment.message_seq
            )));
        }
        if entry.ranges.len() >= MAX_FRAGMENTS_PER_MESSAGE {
            return Err(Error::malformed(format!(
                "too many fragments for handshake message {}",
                fragment.message_seq
            )));
        }
        let start = fragment.offset as usize;
        let end = start + fragment.body.len();
        entry.body[start..end].copy_from_slice(fragment.body);
        entry.ranges.push((start, end));

        let mut ready = Vec::new();
        while let Some(partial) = self.partial.get_mut(&self.next_seq) {
            if !partial.is_complete() {
                break;
            }
            if let Some(done) = self.partial.remove(&self.next_seq) {
                ready.push(Message::new(done.msg_type, self.next_seq, done.body));
            }
            self.next_seq = self.next_seq.wrapping_add(1);
        }
        Ok(ready)
    }
}

// ---------------------------------------------------------------------------
// ClientHello
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ClientHello {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cookie: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl ClientHello {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let version = r.read_u16()?;
        let random = r.read_array::<32>()?;
        let session_id = r.read_vec8()?.to_vec();
        let cookie = r.read_vec8()?.to_vec();

        let mut suites = Reader::new(r.read_vec16()?);
        let mut cipher_suites = Vec::new();
        while !suites.is_empty() {
            cipher_suites.push(suites.read_u16()?);
        }
        let _compression = r.read_vec8()?;

        let mut extensions = Vec::new();
        if !r.is_empty() {
            let mut ext = Reader::new(r.read_vec16()?);
            while !ext.is_empty() {
                let ty = ext.read_u16()?;
                let data = ext.read_vec16()?;
                extensions.push((ty, data.to_vec()));
            }
        }

        Ok(Self {
            version,
            random,
            session_id,
            cookie,
            cipher_suites,
            extensions,
        })
    }

    pub fn extension(&self, ty: u16) -> Option<&[u8]> {
        self.extensions
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|(_, data)| data.as_slice())
    }

    /// SRTP protection profile ids offered in `use_srtp`.
    pub fn srtp_profiles(&self) -> Result<Vec<u16>> {
        let Some(data) = self.extension(EXT_USE_SRTP) else {
            return Ok(Vec::new());
        };
        let mut r = Reader::new(data);
        let mut list = Reader::new(r.read_vec16()?);
        let mut profiles = Vec::new();
        while !list.is_empty() {
            profiles.push(list.read_u16()?);
        }
        Ok(profiles)
    }
}

// ---------------------------------------------------------------------------
// Server flight
// ---------------------------------------------------------------------------

pub fn server_hello(
    server_random: &[u8; 32],
    client_hello: &ClientHello,
    srtp_profile: u16,
) -> Vec<u8> {
    let mut extensions: Vec<u8> = Vec::new();
    if client_hello.extension(EXT_RENEGOTIATION_INFO).is_some() {
        extensions.put_u16(EXT_RENEGOTIATION_INFO);
        extensions.put_u16(1);
        extensions.put_u8(0);
    }
    if client_hello.extension(EXT_EC_POINT_FORMATS).is_some() {
        extensions.put_u16(EXT_EC_POINT_FORMATS);
        extensions.put_u16(2);
        extensions.put_u8(1);
        extensions.put_u8(0); // uncompressed
    }
    extensions.put_u16(EXT_USE_SRTP);
    extensions.put_u16(5);
    extensions.put_u16(2);
    extensions.put_u16(srtp_profile);
    extensions.put_u8(0); // no MKI

    let mut body: Vec<u8> = Vec::with_capacity(48 + extensions.len());
    body.put_u16(DTLS_1_2);
    body.put_slice(server_random);
    body.put_u8(0); // empty session id
    body.put_u16(CIPHER_SUITE);
    body.put_u8(0); // null compression
    body.put_u16(extensions.len() as u16);
    body.put_slice(&extensions);
    body
}

/// Certificate message body carrying a single certificate.
pub fn certificate(der: &[u8]) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::with_capacity(6 + der.len());
    body.put_u24(der.len() as u32 + 3);
    body.put_u24(der.len() as u32);
    body.put_slice(der);
    body
}

/// First certificate of a Certificate message, if any.
pub fn parse_certificate(body: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut r = Reader::new(body);
    let mut list = Reader::new(r.read_vec24()?);
    if list.is_empty() {
        return Ok(None);
    }
    Ok(Some(list.read_vec24()?.to_vec()))
}

/// ServerKeyExchange with named-curve ECDHE params signed by the certificate
/// key over `client_random || server_random || params`.
pub fn server_key_exchange(
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    public_key: &[u8],
    signing_key: &SigningKey,
) -> Vec<u8> {
    let mut params: Vec<u8> = Vec::with_capacity(4 + public_key.len());
    params.put_u8(NAMED_CURVE);
    params.put_u16(SECP256R1);
    params.put_u8(public_key.len() as u8);
    params.put_slice(public_key);

    let signed = [client_random.as_slice(), server_random.as_slice(), params.as_slice()].concat();
    let signature: Signature = signing_key.sign(&signed);
    let der = signature.to_der();

    let mut body = params;
    body.put_u16(SIG_ECDSA_SHA256);
    body.put_u16(der.as_bytes().len() as u16);
    body.put_slice(der.as_bytes());
    body
}

pub fn certificate_request() -> Vec<u8> {
    let mut body: Vec<u8> = Vec::new();
    body.put_u8(CERTIFICATE_TYPES.len() as u8);
    body.put_slice(&CERTIFICATE_TYPES);
    body.put_u16((SUPPORTED_SIGNATURE_ALGORITHMS.len() * 2) as u16);
    for alg in SUPPORTED_SIGNATURE_ALGORITHMS {
        body.put_u16(alg);
    }
    body.put_u16(0); // no certificate authorities
    body
}

/// Raw EC point from a ClientKeyExchange body.
pub fn parse_client_key_exchange(body: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::new(body);
    Ok(r.read_vec8()?.to_vec())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::webrtc::dtls::record::{encode_record, CONTENT_HANDSHAKE};

    pub(crate) fn client_hello_body(profiles: &[u16]) -> Vec<u8> {
        let mut body: Vec<u8> = Vec::new();
        body.put_u16(DTLS_1_2);
        body.put_slice(&[0xAB; 32]);
        body.put_u8(0); // session id
        body.put_u8(0); // cookie
        body.put_u16(4);
        body.put_u16(CIPHER_SUITE);
        body.put_u16(0xc02f);
        body.put_u8(1);
        body.put_u8(0);

        let mut ext: Vec<u8> = Vec::new();
        ext.put_u16(EXT_RENEGOTIATION_INFO);
        ext.put_u16(1);
        ext.put_u8(0);
        ext.put_u16(EXT_USE_SRTP);
        ext.put_u16(2 + profiles.len() as u16 * 2 + 1);
        ext.put_u16(profiles.len() as u16 * 2);
        for p in profiles {
            ext.put_u16(*p);
        }
        ext.put_u8(0);
        body.put_u16(ext.len() as u16);
        body.put_slice(&ext);
        body
    }

    /// A whole first-flight datagram carrying the ClientHello.
    pub(crate) fn client_hello_record(profiles: &[u16]) -> Vec<u8> {
        let msg = Message::new(CLIENT_HELLO, 0, client_hello_body(profiles)).encode();
        encode_record(CONTENT_HANDSHAKE, 0, 0, &msg)
    }

    #[test]
    fn test_parse_client_hello() {
        let hello = ClientHello::parse(&client_hello_body(&[0x0007, 0x0001])).unwrap();
        assert_eq!(hello.random, [0xAB; 32]);
        assert_eq!(hello.cipher_suites, vec![CIPHER_SUITE, 0xc02f]);
        assert_eq!(hello.srtp_profiles().unwrap(), vec![0x0007, 0x0001]);
        assert!(hello.extension(EXT_RENEGOTIATION_INFO).is_some());
        assert!(hello.extension(EXT_EC_POINT_FORMATS).is_none());
    }

    #[test]
    fn test_server_hello_echoes_extensions() {
        let hello = ClientHello::parse(&client_hello_body(&[0x0001])).unwrap();
        let body = server_hello(&[1; 32], &hello, 0x0001);
        // version + random + sid + suite + compression + ext len
        assert_eq!(&body[35..37], &CIPHER_SUITE.to_be_bytes());
        let ext = &body[40..];
        assert_eq!(&ext[..5], &[0xff, 0x01, 0, 1, 0]);
        assert_eq!(&ext[5..], &[0, 0x0e, 0, 5, 0, 2, 0, 1, 0]);
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let full = Message::new(CERTIFICATE, 1, (0..100).collect());
        let first = Fragment {
            msg_type: CERTIFICATE,
            length: 100,
            message_seq: 1,
            offset: 0,
            body: &full.body[..60],
        };
        let second = Fragment {
            offset: 60,
            body: &full.body[60..],
            ..first.clone()
        };
        let hello = Message::new(CLIENT_HELLO, 0, vec![7; 3]);
        let hello_bytes = hello.encode();
        let hello_frag = parse_fragments(&hello_bytes).unwrap();

        let mut reassembler = Reassembler::default();
        assert!(reassembler.push(&second).unwrap().is_empty());
        assert!(reassembler.push(&first).unwrap().is_empty());
        let ready = reassembler.push(&hello_frag[0]).unwrap();
        assert_eq!(ready, vec![hello.clone(), full]);
        assert_eq!(reassembler.next_seq(), 2);

        // Replayed ClientHello is reported, not redelivered
        assert!(reassembler.is_retransmission(&hello_frag[0]));
        assert!(reassembler.push(&hello_frag[0]).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_message_rejected_without_buffering() {
        let mut reassembler = Reassembler::default();
        for seq in 0..MAX_SEQ_AHEAD {
            let fragment = Fragment {
                msg_type: CERTIFICATE,
                length: 0xFF_FFFF,
                message_seq: seq,
                offset: 0,
                body: &[0],
            };
            assert!(reassembler.push(&fragment).is_err());
        }
        assert!(reassembler.partial.is_empty());
    }

    #[test]
    fn test_message_seq_window() {
        let mut reassembler = Reassembler::default();
        let ahead = Fragment {
            msg_type: CERTIFICATE,
            length: 4,
            message_seq: MAX_SEQ_AHEAD,
            offset: 0,
            body: &[0],
        };
        assert!(reassembler.push(&ahead).is_err());

        let within = Fragment {
            message_seq: MAX_SEQ_AHEAD - 1,
            ..ahead.clone()
        };
        assert!(reassembler.push(&within).unwrap().is_empty());
        assert_eq!(reassembler.partial.len(), 1);
    }

    #[test]
    fn test_fragment_count_bounded() {
        let mut reassembler = Reassembler::default();
        let body = [0u8; 1];
        let mut rejected = false;
        for i in 0..(MAX_FRAGMENTS_PER_MESSAGE as u32 + 1) {
            let fragment = Fragment {
                msg_type: CERTIFICATE,
                length: 4096,
                message_seq: 1,
                offset: i,
                body: &body,
            };
            rejected |= reassembler.push(&fragment).is_err();
        }
        assert!(rejected);
        assert_eq!(reassembler.partial[&1].ranges.len(), MAX_FRAGMENTS_PER_MESSAGE);
    }

    #[test]
    fn test_fragment_overrun_rejected() {
        let mut bytes = Message::new(FINISHED, 0, vec![0; 12]).encode();
        // claim a total length shorter than the fragment
        bytes[3] = 4;
        assert!(parse_fragments(&bytes).is_err());
    }

    #[test]
    fn test_certificate_roundtrip() {
        let body = certificate(&[1, 2, 3]);
        assert_eq!(parse_certificate(&body).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(parse_certificate(&[0, 0, 0]).unwrap(), None);
    }

    #[test]
    fn test_certificate_request_layout() {
        let body = certificate_request();
        assert_eq!(&body[..4], &[3, 1, 2, 64]);
        assert_eq!(&body[4..6], &40u16.to_be_bytes());
        assert_eq!(body.len(), 4 + 2 + 40 + 2);
    }
}
