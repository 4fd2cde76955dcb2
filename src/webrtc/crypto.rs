//! Hashes, MACs, the TLS 1.2 PRF, CRC-32 and random tokens.

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// HMAC-SHA1 over the concatenation of `parts`.
pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 20]> {
    let mut mac =
        HmacSha1::new_from_slice(key).map_err(|e| Error::Crypto(format!("HMAC-SHA1 key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("HMAC-SHA256 key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// TLS 1.2 PRF (RFC 5246 section 5): `P_SHA256(secret, label || seed)`.
pub fn prf(secret: &[u8], label: &str, seed: &[u8], len: usize) -> Result<Vec<u8>> {
    let label_seed = [label.as_bytes(), seed].concat();
    let mut out = Vec::with_capacity(len + 32);
    // A(1) = HMAC(secret, A(0)), A(0) = seed
    let mut a = hmac_sha256(secret, &[&label_seed])?;
    while out.len() < len {
        out.extend_from_slice(&hmac_sha256(secret, &[&a, &label_seed])?);
        a = hmac_sha256(secret, &[&a])?;
    }
    out.truncate(len);
    Ok(out)
}

// ---------------------------------------------------------------------------
// CRC-32 (IEEE 802.3) for the STUN FINGERPRINT attribute and derived SSRCs
// ---------------------------------------------------------------------------

/// CRC-32 lookup table (IEEE polynomial 0xEDB88320, reflected).
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    crc ^ 0xFFFFFFFF
}

// ---------------------------------------------------------------------------
// Randomness and formatting
// ---------------------------------------------------------------------------

/// Random alphanumeric token (ICE ufrag/pwd, signalling ids).
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

pub fn random_u32() -> u32 {
    rand::rngs::OsRng.next_u32()
}

/// Lowercase hex without separators (key log format).
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Uppercase colon-separated hex, as used by `a=fingerprint`.
pub fn fingerprint_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_values() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_hmac_sha1_rfc2202() {
        let mac = hmac_sha1(b"Jefe", &[b"what do ya ", b"want for nothing?"]).unwrap();
        assert_eq!(to_hex(&mac), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn test_prf_sha256_vector() {
        let secret = [
            0x9b, 0xbe, 0x43, 0x6b, 0xa9, 0x40, 0xf0, 0x17, 0xb1, 0x76, 0x52, 0x84, 0x9a, 0x71,
            0xdb, 0x35,
        ];
        let seed = [
            0xa0, 0xba, 0x9f, 0x93, 0x6c, 0xda, 0x31, 0x18, 0x27, 0xa6, 0xf7, 0x96, 0xff, 0xd5,
            0x19, 0x8c,
        ];
        let out = prf(&secret, "test label", &seed, 100).unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(to_hex(&out[..16]), "e3f229ba727be17b8d122620557cd453");
    }

    #[test]
    fn test_prf_prefix_stable() {
        let a = prf(b"secret", "label", b"seed", 20).unwrap();
        let b = prf(b"secret", "label", b"seed", 48).unwrap();
        assert_eq!(a, b[..20]);
    }

    #[test]
    fn test_random_token() {
        let t = random_token(24);
        assert_eq!(t.len(), 24);
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(t, random_token(24));
    }

    #[test]
    fn test_fingerprint_format() {
        assert_eq!(fingerprint_hex(&[0x0a, 0xff, 0x10]), "0A:FF:10");
        assert_eq!(to_hex(&[0x0a, 0xff]), "0aff");
    }
}
