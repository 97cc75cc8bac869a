//! Big-endian byte cursor primitives shared by every box codec.

use crate::boxes::FourCC;
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// Bounds-checked reader over a byte slice.
///
/// `base` is the absolute offset of `data[0]` in the enclosing stream, used only to
/// make error messages point at the right place.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    pub fn with_base(data: &'a [u8], base: u64) -> Self {
        Self { data, pos: 0, base }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Absolute stream offset of the cursor.
    pub fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::malformed(format!(
                "reading {what} at offset {} needs {n} bytes, {} left",
                self.offset(),
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn read_u16(&mut self, what: &str) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2, what)?))
    }

    pub fn read_i16(&mut self, what: &str) -> Result<i16> {
        Ok(BigEndian::read_i16(self.take(2, what)?))
    }

    pub fn read_u24(&mut self, what: &str) -> Result<u32> {
        Ok(BigEndian::read_u24(self.take(3, what)?))
    }

    pub fn read_u32(&mut self, what: &str) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4, what)?))
    }

    pub fn read_i32(&mut self, what: &str) -> Result<i32> {
        Ok(BigEndian::read_i32(self.take(4, what)?))
    }

    pub fn read_u64(&mut self, what: &str) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8, what)?))
    }

    pub fn read_i64(&mut self, what: &str) -> Result<i64> {
        Ok(BigEndian::read_i64(self.take(8, what)?))
    }

    pub fn read_fourcc(&mut self, what: &str) -> Result<FourCC> {
        let b = self.take(4, what)?;
        Ok(FourCC([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn read_bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        self.take(n, what)
    }

    pub fn read_to_end(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    /// NUL-terminated UTF-8 string. A missing terminator at the end of the payload
    /// is accepted; some muxers omit it.
    pub fn read_cstring(&mut self, what: &str) -> Result<String> {
        let rest = &self.data[self.pos..];
        let (text, consumed) = match rest.iter().position(|&b| b == 0) {
            Some(nul) => (&rest[..nul], nul + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        String::from_utf8(text.to_vec())
            .map_err(|_| Error::malformed(format!("{what} is not valid UTF-8")))
    }

    pub fn skip(&mut self, n: usize, what: &str) -> Result<()> {
        self.take(n, what).map(|_| ())
    }

    /// Reserved bytes must be zero.
    pub fn expect_zeros(&mut self, n: usize, what: &str) -> Result<()> {
        let bytes = self.take(n, what)?;
        if bytes.iter().any(|&b| b != 0) {
            return Err(Error::malformed(format!("{what} must be zero")));
        }
        Ok(())
    }

    /// Splits off the next `n` bytes as an independent reader.
    pub fn sub_reader(&mut self, n: usize, what: &str) -> Result<ByteReader<'a>> {
        let base = self.offset();
        let data = self.take(n, what)?;
        Ok(ByteReader::with_base(data, base))
    }

    /// Guards an entry count against the bytes actually left, so a corrupt count
    /// cannot drive a huge allocation.
    pub fn check_entries(&self, count: u64, entry_size: usize, what: &str) -> Result<usize> {
        let needed = count.checked_mul(entry_size as u64);
        match needed {
            Some(n) if n <= self.remaining() as u64 => Ok(count as usize),
            _ => Err(Error::malformed(format!(
                "{what}: {count} entries of {entry_size} bytes exceed the {} bytes left",
                self.remaining()
            ))),
        }
    }
}

/// Big-endian writes onto a growable buffer.
pub trait ByteWriter {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_i16(&mut self, v: i16);
    fn put_u24(&mut self, v: u32);
    fn put_u32(&mut self, v: u32);
    fn put_i32(&mut self, v: i32);
    fn put_u64(&mut self, v: u64);
    fn put_i64(&mut self, v: i64);
    fn put_fourcc(&mut self, v: FourCC);
    fn put_bytes(&mut self, v: &[u8]);
    fn put_zeros(&mut self, n: usize);
    fn put_cstring(&mut self, v: &str);
}

// Writes into a Vec cannot fail, so the io::Result from byteorder is discarded.
impl ByteWriter for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }
    fn put_u16(&mut self, v: u16) {
        let _ = self.write_u16::<BigEndian>(v);
    }
    fn put_i16(&mut self, v: i16) {
        let _ = self.write_i16::<BigEndian>(v);
    }
    fn put_u24(&mut self, v: u32) {
        let _ = self.write_u24::<BigEndian>(v & 0x00FF_FFFF);
    }
    fn put_u32(&mut self, v: u32) {
        let _ = self.write_u32::<BigEndian>(v);
    }
    fn put_i32(&mut self, v: i32) {
        let _ = self.write_i32::<BigEndian>(v);
    }
    fn put_u64(&mut self, v: u64) {
        let _ = self.write_u64::<BigEndian>(v);
    }
    fn put_i64(&mut self, v: i64) {
        let _ = self.write_i64::<BigEndian>(v);
    }
    fn put_fourcc(&mut self, v: FourCC) {
        self.extend_from_slice(&v.0);
    }
    fn put_bytes(&mut self, v: &[u8]) {
        self.extend_from_slice(v);
    }
    fn put_zeros(&mut self, n: usize) {
        self.resize(self.len() + n, 0);
    }
    fn put_cstring(&mut self, v: &str) {
        self.extend_from_slice(v.as_bytes());
        self.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_big_endian_and_bounded() {
        let data = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let mut r = ByteReader::with_base(&data, 100);
        assert_eq!(r.read_u16("a").unwrap(), 0x0001);
        assert_eq!(r.read_u24("b").unwrap(), 0x020304);
        assert_eq!(r.offset(), 105);
        let err = r.read_u32("c").unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains("offset 105"));
    }

    #[test]
    fn cstring_without_terminator() {
        let mut r = ByteReader::new(b"abc\0def");
        assert_eq!(r.read_cstring("first").unwrap(), "abc");
        assert_eq!(r.read_cstring("second").unwrap(), "def");
        assert!(r.is_empty());
    }

    #[test]
    fn entry_count_guard() {
        let data = [0u8; 8];
        let r = ByteReader::new(&data);
        assert_eq!(r.check_entries(2, 4, "t").unwrap(), 2);
        assert!(r.check_entries(3, 4, "t").is_err());
        assert!(r.check_entries(u64::MAX, 8, "t").is_err());
    }

    #[test]
    fn writer_roundtrip_u24() {
        let mut buf = Vec::new();
        buf.put_u24(0x12345678);
        assert_eq!(buf, vec![0x34, 0x56, 0x78]);
    }
}
