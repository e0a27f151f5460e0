//! Bitcoin wire-format primitives: a bounds-checked byte reader and
//! CompactSize helpers.

use crate::error::DecodeError;
use crate::types::Hash256;

/// Largest CompactSize accepted for a vector length.
const MAX_VEC_LEN: u64 = 32 * 1024 * 1024;

/// Cursor over a byte slice. Every read is bounds-checked.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset into the underlying slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes consumed between `start` and the current position.
    pub fn consumed_since(&self, start: usize) -> &'a [u8] {
        &self.data[start..self.pos]
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated { offset: self.pos, need: n });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn peek_u8(&self) -> Result<u8, DecodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::Truncated { offset: self.pos, need: 1 })
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32_le()? as i32)
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        let mut buf = [0u8; 32];
        buf.copy_from_slice(self.read_bytes(32)?);
        Ok(Hash256(buf))
    }

    /// Read a CompactSize unsigned integer.
    pub fn read_compact_size(&mut self) -> Result<u64, DecodeError> {
        let n = match self.read_u8()? {
            0xfd => self.read_u16_le()? as u64,
            0xfe => self.read_u32_le()? as u64,
            0xff => self.read_u64_le()?,
            b => b as u64,
        };
        Ok(n)
    }

    /// Read a CompactSize used as a vector length, rejecting absurd sizes.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let n = self.read_compact_size()?;
        if n > MAX_VEC_LEN {
            return Err(DecodeError::CompactSizeTooLarge(n));
        }
        Ok(n as usize)
    }

    /// Read a length-prefixed byte string.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len()?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self, what: &'static str) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(DecodeError::TrailingBytes { what, count }),
        }
    }
}

/// Append a CompactSize unsigned integer.
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Append a length-prefixed byte string.
pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_size_boundaries() {
        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, n);
            let mut r = Reader::new(&buf);
            assert_eq!(r.read_compact_size().unwrap(), n);
            assert!(r.finish("compact size").is_ok());
        }
    }

    #[test]
    fn compact_size_widths() {
        let mut buf = Vec::new();
        write_compact_size(&mut buf, 0xfc);
        assert_eq!(buf.len(), 1);
        buf.clear();
        write_compact_size(&mut buf, 0xfd);
        assert_eq!(buf, vec![0xfd, 0xfd, 0x00]);
    }

    #[test]
    fn truncated_read_reports_offset() {
        let data = [1u8, 2, 3];
        let mut r = Reader::new(&data);
        r.read_u8().unwrap();
        let err = r.read_u32_le().unwrap_err();
        assert_eq!(err, DecodeError::Truncated { offset: 1, need: 4 });
    }

    #[test]
    fn oversized_length_rejected() {
        let mut buf = Vec::new();
        write_compact_size(&mut buf, MAX_VEC_LEN + 1);
        let mut r = Reader::new(&buf);
        assert!(matches!(r.read_len(), Err(DecodeError::CompactSizeTooLarge(_))));
    }

    #[test]
    fn trailing_bytes_detected() {
        let data = [0u8; 2];
        let mut r = Reader::new(&data);
        r.read_u8().unwrap();
        assert_eq!(
            r.finish("block"),
            Err(DecodeError::TrailingBytes { what: "block", count: 1 })
        );
    }
}
