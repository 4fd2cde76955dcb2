//! DTLS 1.2 record layer (RFC 6347 section 4.1) and AES-128-GCM record
//! protection (RFC 5288).
//!
//! ```text
//! +------+---------+-------+------------------+--------+
//! | type | version | epoch | sequence (48bit) | length |
//! |  1   |    2    |   2   |        6         |   2    |
//! +------+---------+-------+------------------+--------+
//! ```

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};

use crate::webrtc::cursor::{Reader, WriteExt};
use crate::webrtc::error::{Error, Result};

pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;

pub const DTLS_1_2: u16 = 0xfefd;

pub const RECORD_HEADER_LEN: usize = 13;

/// Explicit nonce carried in front of every GCM ciphertext.
const EXPLICIT_NONCE_LEN: usize = 8;
const GCM_TAG_LEN: usize = 16;

/// One record view into a datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<'a> {
    pub content_type: u8,
    pub version: u16,
    pub epoch: u16,
    pub sequence: u64,
    pub fragment: &'a [u8],
}

/// Split a datagram into its (possibly several) records.
pub fn parse_records(data: &[u8]) -> Result<Vec<Record<'_>>> {
    let mut r = Reader::new(data);
    let mut records = Vec::new();
    while !r.is_empty() {
        let content_type = r.read_u8()?;
        let version = r.read_u16()?;
        let epoch = r.read_u16()?;
        let sequence = r.read_u48()?;
        let fragment = r.read_vec16()?;
        records.push(Record {
            content_type,
            version,
            epoch,
            sequence,
            fragment,
        });
    }
    Ok(records)
}

pub fn encode_record(content_type: u8, epoch: u16, sequence: u64, fragment: &[u8]) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::with_capacity(RECORD_HEADER_LEN + fragment.len());
    buf.put_u8(content_type);
    buf.put_u16(DTLS_1_2);
    buf.put_u16(epoch);
    buf.put_u48(sequence);
    buf.put_u16(fragment.len() as u16);
    buf.put_slice(fragment);
    buf
}

/// Epoch and sequence number as the 8-byte value used in nonces and AAD.
fn epoch_seq(epoch: u16, sequence: u64) -> [u8; 8] {
    (((epoch as u64) << 48) | (sequence & 0xFFFF_FFFF_FFFF)).to_be_bytes()
}

fn additional_data(epoch: u16, sequence: u64, content_type: u8, len: usize) -> Vec<u8> {
    let mut aad: Vec<u8> = Vec::with_capacity(13);
    aad.put_slice(&epoch_seq(epoch, sequence));
    aad.put_u8(content_type);
    aad.put_u16(DTLS_1_2);
    aad.put_u16(len as u16);
    aad
}

/// Symmetric keys of one side of the connection.
#[derive(Clone)]
pub struct WriteKeys {
    pub key: [u8; 16],
    pub iv: [u8; 4],
}

/// `key expansion` output split for TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256.
pub fn split_key_block(block: &[u8]) -> Result<(WriteKeys, WriteKeys)> {
    let mut r = Reader::new(block);
    let client_key = r.read_array::<16>()?;
    let server_key = r.read_array::<16>()?;
    let client_iv = r.read_array::<4>()?;
    let server_iv = r.read_array::<4>()?;
    Ok((
        WriteKeys {
            key: client_key,
            iv: client_iv,
        },
        WriteKeys {
            key: server_key,
            iv: server_iv,
        },
    ))
}

/// Record protection for epoch 1: seals with our write keys, opens with the
/// peer's.
pub struct RecordCipher {
    write: WriteKeys,
    read: WriteKeys,
}

impl RecordCipher {
    pub fn new(write: WriteKeys, read: WriteKeys) -> Self {
        Self { write, read }
    }

    /// Encrypt `plaintext` into a complete record.
    pub fn seal(
        &self,
        content_type: u8,
        epoch: u16,
        sequence: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let explicit = epoch_seq(epoch, sequence);
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.write.iv);
        nonce[4..].copy_from_slice(&explicit);
        let aad = additional_data(epoch, sequence, content_type, plaintext.len());

        let cipher = Aes128Gcm::new((&self.write.key).into());
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Crypto("DTLS record encryption failed".into()))?;

        let mut fragment: Vec<u8> = Vec::with_capacity(EXPLICIT_NONCE_LEN + sealed.len());
        fragment.put_slice(&explicit);
        fragment.put_slice(&sealed);
        Ok(encode_record(content_type, epoch, sequence, &fragment))
    }

    /// Decrypt and authenticate a protected record.
    pub fn open(&self, record: &Record<'_>) -> Result<Vec<u8>> {
        if record.fragment.len() < EXPLICIT_NONCE_LEN + GCM_TAG_LEN {
            return Err(Error::malformed("protected DTLS record too short"));
        }
        let (explicit, sealed) = record.fragment.split_at(EXPLICIT_NONCE_LEN);
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.read.iv);
        nonce[4..].copy_from_slice(explicit);
        let aad = additional_data(
            record.epoch,
            record.sequence,
            record.content_type,
            sealed.len() - GCM_TAG_LEN,
        );

        let cipher = Aes128Gcm::new((&self.read.key).into());
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::handshake("DTLS record failed authentication"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(byte: u8) -> WriteKeys {
        WriteKeys {
            key: [byte; 16],
            iv: [byte; 4],
        }
    }

    #[test]
    fn test_parse_concatenated_records() {
        let mut datagram = encode_record(CONTENT_HANDSHAKE, 0, 1, &[1, 2, 3]);
        datagram.extend(encode_record(CONTENT_CHANGE_CIPHER_SPEC, 0, 2, &[1]));
        let records = parse_records(&datagram).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fragment, &[1, 2, 3]);
        assert_eq!(records[1].content_type, CONTENT_CHANGE_CIPHER_SPEC);
        assert_eq!(records[1].sequence, 2);
        assert_eq!(records[1].version, DTLS_1_2);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let datagram = encode_record(CONTENT_HANDSHAKE, 0, 0, &[0u8; 10]);
        assert!(parse_records(&datagram[..datagram.len() - 1]).is_err());
    }

    #[test]
    fn test_seal_open() {
        let server = RecordCipher::new(keys(1), keys(2));
        let client = RecordCipher::new(keys(2), keys(1));

        let sealed = server.seal(CONTENT_HANDSHAKE, 1, 7, b"finished").unwrap();
        assert_eq!(sealed.len(), RECORD_HEADER_LEN + 8 + 8 + 16);
        let records = parse_records(&sealed).unwrap();
        assert_eq!(records[0].epoch, 1);
        assert_eq!(client.open(&records[0]).unwrap(), b"finished");

        // Wrong direction keys must not authenticate
        assert!(server.open(&records[0]).is_err());
    }

    #[test]
    fn test_tampered_header_fails() {
        let server = RecordCipher::new(keys(1), keys(2));
        let client = RecordCipher::new(keys(2), keys(1));
        let mut sealed = server.seal(CONTENT_HANDSHAKE, 1, 0, b"x").unwrap();
        sealed[0] = CONTENT_APPLICATION_DATA;
        let records = parse_records(&sealed).unwrap();
        assert!(client.open(&records[0]).is_err());
    }

    #[test]
    fn test_split_key_block() {
        let block: Vec<u8> = (0..40).collect();
        let (client, server) = split_key_block(&block).unwrap();
        assert_eq!(client.key[0], 0);
        assert_eq!(server.key[0], 16);
        assert_eq!(client.iv, [32, 33, 34, 35]);
        assert_eq!(server.iv, [36, 37, 38, 39]);
        assert!(split_key_block(&block[..39]).is_err());
    }
}
