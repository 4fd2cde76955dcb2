//! STUN binding request parsing and response building (RFC 5389).
//!
//! Only the server side of an ICE-lite style exchange is needed: the remote
//! browser sends Binding Requests, we answer each with XOR-MAPPED-ADDRESS,
//! MESSAGE-INTEGRITY (keyed with the local ICE password) and FINGERPRINT.

use std::net::{IpAddr, SocketAddr};

use super::crypto::{crc32, hmac_sha1};
use super::cursor::{self, Reader, WriteExt};
use super::error::{Error, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// STUN magic cookie (RFC 5389).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN message types.
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

/// STUN attribute types.
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;

/// STUN header size (type + length + magic + transaction ID).
pub const STUN_HEADER_SIZE: usize = 20;

/// FINGERPRINT XOR constant per RFC 5389.
pub const FINGERPRINT_XOR: u32 = 0x5354554e;

/// Size of a MESSAGE-INTEGRITY attribute including its TLV header.
const MESSAGE_INTEGRITY_ATTR_LEN: usize = 24;

/// Size of a FINGERPRINT attribute including its TLV header.
const FINGERPRINT_ATTR_LEN: usize = 8;

/// Parsed Binding Request.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingRequest {
    pub transaction_id: [u8; 12],
    pub username: Option<String>,
    pub priority: Option<u32>,
    pub use_candidate: bool,
    /// Offset of the MESSAGE-INTEGRITY attribute, if present.
    integrity_offset: Option<usize>,
}

/// Check if a received UDP packet is a STUN message (any type).
pub fn is_stun_message(data: &[u8]) -> bool {
    if data.len() < STUN_HEADER_SIZE {
        return false;
    }
    // First two bits must be 0, magic cookie must match.
    if data[0] & 0xC0 != 0 {
        return false;
    }
    cursor::get_u32(data, 4).map_or(false, |magic| magic == MAGIC_COOKIE)
}

/// Check if a received UDP packet is a STUN Binding Request.
pub fn is_binding_request(data: &[u8]) -> bool {
    is_stun_message(data) && data[0] == 0x00 && data[1] == 0x01
}

/// Parse a Binding Request, walking its TLV attributes.
pub fn parse_binding_request(data: &[u8]) -> Result<BindingRequest> {
    let mut r = Reader::new(data);
    let msg_type = r.read_u16()?;
    if msg_type != BINDING_REQUEST {
        return Err(Error::malformed(format!(
            "not a STUN binding request: type 0x{:04x}",
            msg_type
        )));
    }
    let msg_len = r.read_u16()? as usize;
    if r.read_u32()? != MAGIC_COOKIE {
        return Err(Error::malformed("bad STUN magic cookie"));
    }
    let transaction_id = r.read_array::<12>()?;

    let mut attrs = Reader::new(r.read_bytes(msg_len)?);
    let mut request = BindingRequest {
        transaction_id,
        username: None,
        priority: None,
        use_candidate: false,
        integrity_offset: None,
    };

    while attrs.remaining() >= 4 {
        let offset = STUN_HEADER_SIZE + attrs.position();
        let attr_type = attrs.read_u16()?;
        let attr_len = attrs.read_u16()? as usize;
        let value = attrs.read_bytes(attr_len)?;
        // Attributes are padded to a 4-byte boundary; the last one may omit it.
        let pad = (4 - attr_len % 4) % 4;
        attrs.skip(pad.min(attrs.remaining()))?;

        match attr_type {
            ATTR_USERNAME => request.username = Some(String::from_utf8_lossy(value).into_owned()),
            ATTR_PRIORITY if attr_len == 4 => request.priority = Some(cursor::get_u32(value, 0)?),
            ATTR_USE_CANDIDATE => request.use_candidate = true,
            ATTR_MESSAGE_INTEGRITY if attr_len == 20 => request.integrity_offset = Some(offset),
            _ => {}
        }
    }

    Ok(request)
}

/// Verify MESSAGE-INTEGRITY of a parsed request against the local ICE password.
///
/// Returns false when the attribute is absent.
pub fn verify_message_integrity(data: &[u8], request: &BindingRequest, key: &[u8]) -> bool {
    let Some(pos) = request.integrity_offset else {
        return false;
    };
    if data.len() < pos + MESSAGE_INTEGRITY_ATTR_LEN {
        return false;
    }
    let received = &data[pos + 4..pos + MESSAGE_INTEGRITY_ATTR_LEN];

    // The length field covers MESSAGE-INTEGRITY but not FINGERPRINT.
    let mut check_buf = data[..pos].to_vec();
    let adjusted_len = (pos - STUN_HEADER_SIZE + MESSAGE_INTEGRITY_ATTR_LEN) as u16;
    if cursor::set_u16(&mut check_buf, 2, adjusted_len).is_err() {
        return false;
    }

    match hmac_sha1(key, &[&check_buf]) {
        Ok(computed) => computed.as_slice() == received,
        Err(_) => false,
    }
}

/// Build a Binding Success Response: XOR-MAPPED-ADDRESS, MESSAGE-INTEGRITY
/// keyed with `key`, then FINGERPRINT. The header length is patched before
/// each trailing attribute is computed, so the IPv4 response is 64 bytes with
/// the HMAC over bytes 0..32 and the CRC over bytes 0..56.
pub fn build_binding_response(
    transaction_id: &[u8; 12],
    mapped_addr: SocketAddr,
    key: &[u8],
) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::with_capacity(64);
    buf.put_u16(BINDING_RESPONSE);
    buf.put_u16(0); // length placeholder
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id);

    let xma = encode_xor_mapped_address(mapped_addr, transaction_id);
    append_stun_attr(&mut buf, ATTR_XOR_MAPPED_ADDRESS, &xma);

    // MESSAGE-INTEGRITY
    let mi_length = (buf.len() - STUN_HEADER_SIZE + MESSAGE_INTEGRITY_ATTR_LEN) as u16;
    cursor::set_u16(&mut buf, 2, mi_length)?;
    let hmac = hmac_sha1(key, &[&buf])?;
    append_stun_attr(&mut buf, ATTR_MESSAGE_INTEGRITY, &hmac);

    // FINGERPRINT
    let fp_length = (buf.len() - STUN_HEADER_SIZE + FINGERPRINT_ATTR_LEN) as u16;
    cursor::set_u16(&mut buf, 2, fp_length)?;
    let fingerprint = crc32(&buf) ^ FINGERPRINT_XOR;
    append_stun_attr(&mut buf, ATTR_FINGERPRINT, &fingerprint.to_be_bytes());

    Ok(buf)
}

// ---------------------------------------------------------------------------
// STUN attribute helpers
// ---------------------------------------------------------------------------

/// Append a STUN attribute with raw value bytes (handles 4-byte padding).
fn append_stun_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    buf.put_u16(attr_type);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    let pad = (4 - (value.len() % 4)) % 4;
    buf.resize(buf.len() + pad, 0);
}

/// Encode a SocketAddr as XOR-MAPPED-ADDRESS value bytes.
fn encode_xor_mapped_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut val = vec![0u8]; // reserved
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            val.put_u8(0x01);
            val.put_u16(xport);
            val.put_u32(u32::from(ip) ^ MAGIC_COOKIE);
        }
        IpAddr::V6(ip) => {
            val.put_u8(0x02);
            val.put_u16(xport);
            let mut xor_key = [0u8; 16];
            xor_key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..].copy_from_slice(transaction_id);
            val.extend(ip.octets().iter().zip(xor_key.iter()).map(|(a, b)| a ^ b));
        }
    }
    val
}
