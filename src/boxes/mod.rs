//! Box header, the typed box payloads, and the codec contract they share.
//!
//! Every typed payload implements [`BoxCodec`]: it parses exactly its own fields
//! from a [`ByteReader`] (children, if any, are handled by the tree) and writes the
//! same fields back. Header bytes (size, type, largesize, uuid) are never written
//! by a payload; [`write_box_header`] owns them.

pub mod file;
pub mod fragment;
pub mod movie;
pub mod sample_entry;
pub mod sample_group;
pub mod sample_table;

use crate::cursor::{ByteReader, ByteWriter};
use crate::error::{Diagnostics, Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use serde::Serialize;
use std::fmt;
use std::io::{Read, Seek};

pub use file::{FtypBox, MdatBox};
pub use fragment::{
    MehdBox, MfhdBox, SidxBox, SidxReference, TfdtBox, TfhdBox, TrexBox, TrunBox, TrunSample,
};
pub use movie::{
    DrefBox, ElstBox, ElstEntry, HdlrBox, IodsBox, MdhdBox, MvhdBox, SmhdBox, TkhdBox, UrlBox,
    VmhdBox,
};
pub use sample_entry::{
    AudioSampleEntry, BtrtBox, ColrBox, ColourInfo, JpviBox, JxplBox, MhapBox, PaspBox,
    VisualSampleEntry,
};
pub use sample_group::{SampleGroupDescription, SbgpBox, SbgpEntry, SgpdBox};
pub use sample_table::{
    Co64Box, CttsBox, CttsEntry, StcoBox, StscBox, StscEntry, StsdBox, StssBox, StszBox, Stz2Box,
    SttsBox, SttsEntry,
};

#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const fn new(b: &[u8; 4]) -> Self {
        FourCC(*b)
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() == 4 {
            Some(FourCC([b[0], b[1], b[2], b[3]]))
        } else {
            None
        }
    }

    pub fn as_str_lossy(&self) -> String {
        self.0
            .iter()
            .map(|&c| if (32..=126).contains(&c) { c as char } else { '.' })
            .collect()
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str_lossy())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str_lossy())
    }
}

impl Serialize for FourCC {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_str_lossy())
    }
}

impl<'de> serde::Deserialize<'de> for FourCC {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        FourCC::from_str(&s).ok_or_else(|| serde::de::Error::custom("fourcc must be 4 bytes"))
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(b: &[u8; 4]) -> Self {
        FourCC(*b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxHeader {
    pub size: u64,    // total size including header, or 0=to parent end
    pub typ: FourCC,  // 4CC or b"uuid"
    pub uuid: Option<[u8; 16]>,
    pub header_size: u64, // 8, 16, 24 or 32
    pub start: u64,       // stream offset of header start
}

impl BoxHeader {
    pub fn is_large(&self) -> bool {
        self.header_size == 16 || self.header_size == 32
    }

    /// End offset given the enclosing range end (resolves size 0).
    pub fn end(&self, parent_end: u64) -> u64 {
        if self.size == 0 {
            parent_end
        } else {
            self.start + self.size
        }
    }
}

fn header_size_for(large: bool, uuid: bool) -> u64 {
    match (large, uuid) {
        (true, true) => 8 + 8 + 16,
        (true, false) => 8 + 8,
        (false, true) => 8 + 16,
        (false, false) => 8,
    }
}

/// Reads a header from a seekable stream, leaving the stream at the payload.
pub fn read_box_header<R: Read + Seek>(r: &mut R) -> Result<BoxHeader> {
    let start = r.stream_position()?;
    let size32 = r.read_u32::<BigEndian>()?;
    let mut typ = [0u8; 4];
    r.read_exact(&mut typ)?;
    let mut size = size32 as u64;

    if size32 == 1 {
        size = r.read_u64::<BigEndian>()?;
    }

    let mut uuid = None;
    if &typ == b"uuid" {
        let mut u = [0u8; 16];
        r.read_exact(&mut u)?;
        uuid = Some(u);
    }

    let header_size = header_size_for(size32 == 1, uuid.is_some());
    if size != 0 && size < header_size {
        return Err(Error::malformed(format!(
            "box '{}' at {start} declares size {size} below its header size {header_size}",
            FourCC(typ)
        )));
    }

    Ok(BoxHeader {
        size,
        typ: FourCC(typ),
        uuid,
        header_size,
        start,
    })
}

/// Same as [`read_box_header`] over an in-memory cursor.
pub fn parse_box_header(r: &mut ByteReader<'_>) -> Result<BoxHeader> {
    let start = r.offset();
    let size32 = r.read_u32("box size")?;
    let typ = r.read_fourcc("box type")?;
    let size = if size32 == 1 {
        r.read_u64("box largesize")?
    } else {
        size32 as u64
    };
    let uuid = if typ.0 == *b"uuid" {
        Some(r.read_array::<16>("box usertype")?)
    } else {
        None
    };
    let header_size = header_size_for(size32 == 1, uuid.is_some());
    if size != 0 && size < header_size {
        return Err(Error::malformed(format!(
            "box '{typ}' at {start} declares size {size} below its header size {header_size}"
        )));
    }
    Ok(BoxHeader {
        size,
        typ,
        uuid,
        header_size,
        start,
    })
}

/// Header length needed for a box whose payload+children take `content_len` bytes.
pub fn required_header_size(content_len: u64, uuid: bool, force_large: bool) -> u64 {
    let small = header_size_for(false, uuid);
    if force_large || content_len + small > u32::MAX as u64 {
        header_size_for(true, uuid)
    } else {
        small
    }
}

/// Writes a header for a box of `total_size` bytes. Uses the 64-bit form when the
/// size does not fit 32 bits or `large` is requested.
pub fn write_box_header(
    buf: &mut Vec<u8>,
    typ: FourCC,
    uuid: Option<&[u8; 16]>,
    total_size: u64,
    large: bool,
) {
    if large || total_size > u32::MAX as u64 {
        buf.put_u32(1);
        buf.put_fourcc(typ);
        buf.put_u64(total_size);
    } else {
        buf.put_u32(total_size as u32);
        buf.put_fourcc(typ);
    }
    if let Some(u) = uuid {
        buf.put_bytes(u);
    }
}

/// Version and flags of a full box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FullBoxHeader {
    pub version: u8,
    pub flags: u32,
}

impl FullBoxHeader {
    pub fn new(version: u8, flags: u32) -> Self {
        Self { version, flags }
    }

    pub fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let version = r.read_u8("version")?;
        let flags = r.read_u24("flags")?;
        Ok(Self { version, flags })
    }

    pub fn write_header(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.version);
        buf.put_u24(self.flags);
    }

    /// Fails on a version this crate does not know how to decode.
    pub fn require_version(&self, typ: &str, max: u8) -> Result<()> {
        if self.version > max {
            return Err(Error::unsupported(format!(
                "{typ} version {} (max supported {max})",
                self.version
            )));
        }
        Ok(())
    }
}

/// Shared contract for typed box payloads.
pub trait BoxCodec: Sized {
    fn parse(r: &mut ByteReader<'_>, typ: FourCC, diag: &mut Diagnostics) -> Result<Self>;

    fn write(&self, buf: &mut Vec<u8>) -> Result<()>;

    /// Brings derived fields in line before sizing: 64-bit version promotion,
    /// entry counts that mirror the number of children.
    fn prepare(&mut self, _child_count: usize) {}
}

/// Opaque leaf payload, kept byte-for-byte.
impl BoxCodec for Vec<u8> {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        Ok(r.read_to_end().to_vec())
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_bytes(self);
        Ok(())
    }
}

/// Typed access to the payload a [`BoxBody`] variant carries.
pub trait BodyRef: Sized {
    fn from_body(body: &BoxBody) -> Option<&Self>;
    fn from_body_mut(body: &mut BoxBody) -> Option<&mut Self>;
}

macro_rules! box_bodies {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Decoded payload of one box. The variant set is closed; anything the
        /// registry does not know ends up as `Raw`.
        #[derive(Debug, Clone, PartialEq)]
        pub enum BoxBody {
            /// Pure container: no payload of its own.
            Container,
            Raw(Vec<u8>),
            $($variant($ty),)*
        }

        $(
            impl From<$ty> for BoxBody {
                fn from(b: $ty) -> Self {
                    BoxBody::$variant(b)
                }
            }

            impl BodyRef for $ty {
                fn from_body(body: &BoxBody) -> Option<&Self> {
                    match body {
                        BoxBody::$variant(b) => Some(b),
                        _ => None,
                    }
                }

                fn from_body_mut(body: &mut BoxBody) -> Option<&mut Self> {
                    match body {
                        BoxBody::$variant(b) => Some(b),
                        _ => None,
                    }
                }
            }
        )*

        impl BoxBody {
            pub fn write_payload(&self, buf: &mut Vec<u8>) -> Result<()> {
                match self {
                    BoxBody::Container => Ok(()),
                    BoxBody::Raw(bytes) => BoxCodec::write(bytes, buf),
                    $(BoxBody::$variant(b) => BoxCodec::write(b, buf),)*
                }
            }

            pub fn prepare(&mut self, child_count: usize) {
                match self {
                    BoxBody::Container | BoxBody::Raw(_) => {}
                    $(BoxBody::$variant(b) => b.prepare(child_count),)*
                }
            }

            pub fn variant_name(&self) -> &'static str {
                match self {
                    BoxBody::Container => "Container",
                    BoxBody::Raw(_) => "Raw",
                    $(BoxBody::$variant(_) => stringify!($variant),)*
                }
            }
        }
    };
}

box_bodies! {
    Ftyp(FtypBox),
    Mdat(MdatBox),
    FullOnly(FullBoxHeader),
    Mvhd(MvhdBox),
    Tkhd(TkhdBox),
    Mdhd(MdhdBox),
    Hdlr(HdlrBox),
    Vmhd(VmhdBox),
    Smhd(SmhdBox),
    Dref(DrefBox),
    Url(UrlBox),
    Elst(ElstBox),
    Iods(IodsBox),
    Stsd(StsdBox),
    Stts(SttsBox),
    Ctts(CttsBox),
    Stsc(StscBox),
    Stsz(StszBox),
    Stz2(Stz2Box),
    Stco(StcoBox),
    Co64(Co64Box),
    Stss(StssBox),
    Sgpd(SgpdBox),
    Sbgp(SbgpBox),
    Mehd(MehdBox),
    Trex(TrexBox),
    Mfhd(MfhdBox),
    Tfhd(TfhdBox),
    Tfdt(TfdtBox),
    Trun(TrunBox),
    Sidx(SidxBox),
    Visual(VisualSampleEntry),
    Audio(AudioSampleEntry),
    Colr(ColrBox),
    Jpvi(JpviBox),
    Jxpl(JxplBox),
    Mhap(MhapBox),
    Btrt(BtrtBox),
    Pasp(PaspBox),
}

impl From<Vec<u8>> for BoxBody {
    fn from(b: Vec<u8>) -> Self {
        BoxBody::Raw(b)
    }
}

impl BodyRef for Vec<u8> {
    fn from_body(body: &BoxBody) -> Option<&Self> {
        match body {
            BoxBody::Raw(b) => Some(b),
            _ => None,
        }
    }

    fn from_body_mut(body: &mut BoxBody) -> Option<&mut Self> {
        match body {
            BoxBody::Raw(b) => Some(b),
            _ => None,
        }
    }
}

/// A full box that only carries version and flags (nmhd, sthd) or whose
/// remaining content is child boxes (meta).
impl BoxCodec for FullBoxHeader {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.write_header(buf);
        Ok(())
    }
}

/// Decoded `sample_flags` word used by trex, tfhd and trun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SampleFlags {
    pub is_leading: u8,
    pub depends_on: u8,
    pub is_depended_on: u8,
    pub has_redundancy: u8,
    pub padding: u8,
    pub is_non_sync: bool,
    pub degradation_priority: u16,
}

impl SampleFlags {
    /// Flags for a sync sample that depends on nothing.
    pub const SYNC: u32 = 0x0200_0000;
    /// Flags for a non-sync sample that depends on others.
    pub const NON_SYNC: u32 = 0x0101_0000;

    pub fn from_u32(v: u32) -> Self {
        Self {
            is_leading: ((v >> 26) & 0x3) as u8,
            depends_on: ((v >> 24) & 0x3) as u8,
            is_depended_on: ((v >> 22) & 0x3) as u8,
            has_redundancy: ((v >> 20) & 0x3) as u8,
            padding: ((v >> 17) & 0x7) as u8,
            is_non_sync: (v >> 16) & 0x1 == 1,
            degradation_priority: (v & 0xFFFF) as u16,
        }
    }

    pub fn to_u32(&self) -> u32 {
        ((self.is_leading as u32 & 0x3) << 26)
            | ((self.depends_on as u32 & 0x3) << 24)
            | ((self.is_depended_on as u32 & 0x3) << 22)
            | ((self.has_redundancy as u32 & 0x3) << 20)
            | ((self.padding as u32 & 0x7) << 17)
            | ((self.is_non_sync as u32) << 16)
            | self.degradation_priority as u32
    }

    pub fn for_sync(is_sync: bool) -> u32 {
        if is_sync { Self::SYNC } else { Self::NON_SYNC }
    }
}

/// True when a 32-bit time field cannot hold `v`.
pub(crate) fn needs_64(v: u64) -> bool {
    v > u32::MAX as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_small_and_large() {
        let mut buf = Vec::new();
        write_box_header(&mut buf, FourCC(*b"free"), None, 8, false);
        assert_eq!(buf, vec![0, 0, 0, 8, b'f', b'r', b'e', b'e']);

        let mut buf = Vec::new();
        write_box_header(&mut buf, FourCC(*b"mdat"), None, 1 << 33, false);
        assert_eq!(buf.len(), 16);
        let mut r = ByteReader::new(&buf);
        let h = parse_box_header(&mut r).unwrap();
        assert_eq!(h.size, 1 << 33);
        assert_eq!(h.header_size, 16);
        assert!(h.is_large());
    }

    #[test]
    fn header_rejects_undersized() {
        let bytes = [0, 0, 0, 4, b'f', b'r', b'e', b'e'];
        let err = parse_box_header(&mut ByteReader::new(&bytes)).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn sample_flags_bits() {
        let f = SampleFlags::from_u32(SampleFlags::NON_SYNC);
        assert!(f.is_non_sync);
        assert_eq!(f.depends_on, 1);
        assert_eq!(f.to_u32(), SampleFlags::NON_SYNC);
        assert!(!SampleFlags::from_u32(SampleFlags::SYNC).is_non_sync);
    }
}
