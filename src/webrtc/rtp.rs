//! RTP header parsing and in-place rewriting (RFC 3550, RFC 8285).
//!
//! RTP header format (RFC 3550):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use super::cursor::{self, Reader, WriteExt};
use super::error::{Error, Result};

/// Minimum RTP header size in bytes (no CSRC, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// Profile marker of one-byte header extensions (RFC 8285).
const ONE_BYTE_PROFILE: u16 = 0xBEDE;

/// Profile marker of two-byte header extensions (low 4 bits are appbits).
const TWO_BYTE_PROFILE: u16 = 0x1000;

/// Dynamic payload type range carried as media.
pub const DYNAMIC_PT_MIN: u8 = 96;
pub const DYNAMIC_PT_MAX: u8 = 127;

/// Compute the full RTP header length from raw packet bytes.
///
/// Accounts for CSRC entries and header extensions (RFC 3550 §5.3.1).
/// Returns `None` if the packet is too short.
pub fn full_header_len(data: &[u8]) -> Option<usize> {
    if data.len() < RTP_HEADER_SIZE {
        return None;
    }
    let csrc_count = (data[0] & 0x0F) as usize;
    let has_extension = (data[0] >> 4) & 0x01 != 0;
    let mut len = RTP_HEADER_SIZE + csrc_count * 4;
    if data.len() < len {
        return None;
    }
    if has_extension {
        // Extension header: 2 bytes profile + 2 bytes length (in 32-bit words)
        if data.len() < len + 4 {
            return None;
        }
        let ext_words = u16::from_be_bytes([data[len + 2], data[len + 3]]) as usize;
        len += 4 + ext_words * 4;
        if data.len() < len {
            return None;
        }
    }
    Some(len)
}

/// RTP and RTCP share the version bits `10`.
pub fn is_rtp_or_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] >> 6 == 2
}

/// RTCP packet types 200..=206 occupy the whole second byte; RTP carries
/// marker + payload type there (RFC 5761 demultiplexing).
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (200..=206).contains(&data[1])
}

/// Parsed RTP fixed header plus extension location.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Offset of the payload (end of CSRCs and extensions).
    pub header_len: usize,
}

impl RtpHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let b0 = r.read_u8()?;
        let version = b0 >> 6;
        if version != 2 {
            return Err(Error::malformed(format!("unsupported RTP version {}", version)));
        }
        let b1 = r.read_u8()?;
        let sequence_number = r.read_u16()?;
        let timestamp = r.read_u32()?;
        let ssrc = r.read_u32()?;
        let header_len = full_header_len(data)
            .ok_or_else(|| Error::malformed("RTP header truncated"))?;
        Ok(Self {
            padding: b0 & 0x20 != 0,
            extension: b0 & 0x10 != 0,
            csrc_count: b0 & 0x0F,
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7F,
            sequence_number,
            timestamp,
            ssrc,
            header_len,
        })
    }
}

pub fn set_payload_type(packet: &mut [u8], pt: u8) -> Result<()> {
    if packet.len() < 2 {
        return Err(Error::malformed("RTP packet too short"));
    }
    packet[1] = (packet[1] & 0x80) | (pt & 0x7F);
    Ok(())
}

pub fn set_sequence_number(packet: &mut [u8], seq: u16) -> Result<()> {
    cursor::set_u16(packet, 2, seq)
}

pub fn set_timestamp(packet: &mut [u8], ts: u32) -> Result<()> {
    cursor::set_u32(packet, 4, ts)
}

pub fn set_ssrc(packet: &mut [u8], ssrc: u32) -> Result<()> {
    cursor::set_u32(packet, 8, ssrc)
}

/// Header extension elements as `(id, value)`, for one-byte and two-byte
/// forms. Packets without an extension block yield an empty list.
pub fn header_extensions(data: &[u8]) -> Result<Vec<(u8, &[u8])>> {
    let header = RtpHeader::parse(data)?;
    if !header.extension {
        return Ok(Vec::new());
    }
    let ext_start = RTP_HEADER_SIZE + header.csrc_count as usize * 4;
    let mut r = Reader::new(&data[ext_start..header.header_len]);
    let profile = r.read_u16()?;
    let words = r.read_u16()? as usize;
    let mut body = Reader::new(r.read_bytes(words * 4)?);

    let mut out = Vec::new();
    if profile == ONE_BYTE_PROFILE {
        while !body.is_empty() {
            let b = body.read_u8()?;
            if b == 0 {
                continue; // padding
            }
            let id = b >> 4;
            if id == 15 {
                break;
            }
            let len = (b & 0x0F) as usize + 1;
            out.push((id, body.read_bytes(len)?));
        }
    } else if profile & 0xFFF0 == TWO_BYTE_PROFILE {
        while !body.is_empty() {
            let id = body.read_u8()?;
            if id == 0 {
                continue;
            }
            let len = body.read_u8()? as usize;
            out.push((id, body.read_bytes(len)?));
        }
    }
    Ok(out)
}

/// Value of extension `id`, if the packet carries it.
pub fn find_extension(data: &[u8], id: u8) -> Option<Vec<u8>> {
    header_extensions(data)
        .ok()?
        .into_iter()
        .find(|(ext_id, _)| *ext_id == id)
        .map(|(_, value)| value.to_vec())
}

/// Read the MID carried in extension `id`.
pub fn read_mid(data: &[u8], id: u8) -> Option<String> {
    let value = find_extension(data, id)?;
    String::from_utf8(value).ok()
}

/// Rebuild the packet's extension block so it carries only `mid` under `id`,
/// or no extension block at all when `mid` is `None`.
///
/// Forwarded packets must not carry the producer's extension ids, which mean
/// nothing in the consumer's negotiated map.
pub fn rewrite_extensions(packet: &[u8], mid: Option<(u8, &str)>) -> Result<Vec<u8>> {
    let header = RtpHeader::parse(packet)?;
    let fixed_len = RTP_HEADER_SIZE + header.csrc_count as usize * 4;
    let mut out: Vec<u8> = Vec::with_capacity(packet.len() + 8);
    out.put_slice(&packet[..fixed_len]);

    match mid {
        Some((id, mid)) if (1..=14).contains(&id) && (1..=16).contains(&mid.len()) => {
            out[0] |= 0x10;
            let element_len = 1 + mid.len();
            let words = (element_len + 3) / 4;
            out.put_u16(ONE_BYTE_PROFILE);
            out.put_u16(words as u16);
            out.put_u8((id << 4) | (mid.len() as u8 - 1));
            out.put_slice(mid.as_bytes());
            out.resize(out.len() + words * 4 - element_len, 0);
        }
        _ => out[0] &= !0x10,
    }

    out.put_slice(&packet[header.header_len..]);
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an RTP packet, optionally with a one-byte MID extension.
    pub(crate) fn build_packet(pt: u8, seq: u16, ts: u32, ssrc: u32, mid: Option<(u8, &str)>) -> Vec<u8> {
        let mut pkt: Vec<u8> = Vec::new();
        pkt.put_u8(0x80);
        pkt.put_u8(pt);
        pkt.put_u16(seq);
        pkt.put_u32(ts);
        pkt.put_u32(ssrc);
        pkt.put_slice(&[0xFF; 40]);
        match mid {
            Some(m) => rewrite_extensions(&pkt, Some(m)).unwrap(),
            None => pkt,
        }
    }

    #[test]
    fn test_parse_header() {
        let pkt = build_packet(111, 4242, 960, 0x12345678, None);
        let h = RtpHeader::parse(&pkt).unwrap();
        assert_eq!(h.payload_type, 111);
        assert_eq!(h.sequence_number, 4242);
        assert_eq!(h.timestamp, 960);
        assert_eq!(h.ssrc, 0x12345678);
        assert_eq!(h.header_len, RTP_HEADER_SIZE);
        assert!(!h.extension);
    }

    #[test]
    fn test_parse_wrong_version() {
        let mut pkt = build_packet(96, 1, 1, 1, None);
        pkt[0] = 0x40;
        assert!(RtpHeader::parse(&pkt).is_err());
        assert!(RtpHeader::parse(&[0x80, 96]).is_err());
    }

    #[test]
    fn test_mid_extension_roundtrip() {
        let pkt = build_packet(96, 1, 0, 7, Some((4, "12")));
        assert_eq!(full_header_len(&pkt), Some(RTP_HEADER_SIZE + 8));
        assert_eq!(read_mid(&pkt, 4).as_deref(), Some("12"));
        assert_eq!(read_mid(&pkt, 3), None);
        // payload untouched
        assert_eq!(&pkt[RTP_HEADER_SIZE + 8..], &[0xFF; 40]);
    }

    #[test]
    fn test_rewrite_replaces_and_strips() {
        let pkt = build_packet(96, 1, 0, 7, Some((4, "0")));
        let swapped = rewrite_extensions(&pkt, Some((9, "1"))).unwrap();
        assert_eq!(read_mid(&swapped, 9).as_deref(), Some("1"));
        assert_eq!(read_mid(&swapped, 4), None);

        let stripped = rewrite_extensions(&pkt, None).unwrap();
        assert_eq!(stripped, build_packet(96, 1, 0, 7, None));
    }

    #[test]
    fn test_two_byte_extensions() {
        let mut pkt: Vec<u8> = vec![0x90, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 5];
        pkt.put_u16(0x1000);
        pkt.put_u16(1);
        pkt.put_slice(&[3, 1, b'a', 0]);
        let exts = header_extensions(&pkt).unwrap();
        assert_eq!(exts, vec![(3u8, &b"a"[..])]);
    }

    #[test]
    fn test_rtcp_demux() {
        assert!(is_rtcp(&[0x80, 200]));
        assert!(is_rtcp(&[0x81, 206]));
        assert!(!is_rtcp(&[0x80, 96]));
        // marker bit set on PT 96 is 224, still RTP
        assert!(!is_rtcp(&[0x80, 224]));
        assert!(is_rtp_or_rtcp(&[0x80, 0]));
        assert!(!is_rtp_or_rtcp(&[0x16, 0xfe]));
    }

    #[test]
    fn test_setters() {
        let mut pkt = build_packet(96, 1, 2, 3, None);
        pkt[1] |= 0x80;
        set_payload_type(&mut pkt, 100).unwrap();
        set_sequence_number(&mut pkt, 9).unwrap();
        set_timestamp(&mut pkt, 10).unwrap();
        set_ssrc(&mut pkt, 11).unwrap();
        let h = RtpHeader::parse(&pkt).unwrap();
        assert!(h.marker);
        assert_eq!((h.payload_type, h.sequence_number, h.timestamp, h.ssrc), (100, 9, 10, 11));
    }
}
