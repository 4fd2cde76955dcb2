//! Bounds-checked big-endian binary cursor.
//!
//! Shared by the STUN, DTLS, RTP, RTCP and SRTP codecs. Reads past the end of
//! the buffer return [`Error::MalformedPacket`] rather than panicking; 24-bit
//! and 48-bit fields get their own helpers.

use super::error::{Error, Result};

/// Read cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::malformed(format!(
                "need {} bytes at offset {}, only {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let b = self.read_bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u48(&mut self) -> Result<u64> {
        let b = self.read_bytes(6)?;
        Ok(u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Read a `u8`-length-prefixed vector.
    pub fn read_vec8(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// Read a `u16`-length-prefixed vector.
    pub fn read_vec16(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    /// Read a `u24`-length-prefixed vector.
    pub fn read_vec24(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u24()? as usize;
        self.read_bytes(len)
    }
}

/// Big-endian append helpers for building packets.
pub trait WriteExt {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_u24(&mut self, v: u32);
    fn put_u32(&mut self, v: u32);
    fn put_u48(&mut self, v: u64);
    fn put_u64(&mut self, v: u64);
    fn put_slice(&mut self, v: &[u8]);
}

impl WriteExt for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u24(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes()[1..]);
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u48(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes()[2..]);
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_slice(&mut self, v: &[u8]) {
        self.extend_from_slice(v);
    }
}

fn check(buf: &[u8], at: usize, n: usize) -> Result<()> {
    if at.checked_add(n).map_or(true, |end| end > buf.len()) {
        return Err(Error::malformed(format!(
            "field of {} bytes at offset {} exceeds {}-byte buffer",
            n,
            at,
            buf.len()
        )));
    }
    Ok(())
}

pub fn get_u16(buf: &[u8], at: usize) -> Result<u16> {
    check(buf, at, 2)?;
    Ok(u16::from_be_bytes([buf[at], buf[at + 1]]))
}

pub fn get_u32(buf: &[u8], at: usize) -> Result<u32> {
    check(buf, at, 4)?;
    Ok(u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]))
}

pub fn set_u16(buf: &mut [u8], at: usize, v: u16) -> Result<()> {
    check(buf, at, 2)?;
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
    Ok(())
}

pub fn set_u24(buf: &mut [u8], at: usize, v: u32) -> Result<()> {
    check(buf, at, 3)?;
    buf[at..at + 3].copy_from_slice(&v.to_be_bytes()[1..]);
    Ok(())
}

pub fn set_u32(buf: &mut [u8], at: usize, v: u32) -> Result<()> {
    check(buf, at, 4)?;
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
    Ok(())
}
