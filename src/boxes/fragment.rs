//! Movie fragment boxes: mvex defaults, moof/traf contents and the segment index.

use super::{BoxCodec, FourCC, FullBoxHeader, needs_64};
use crate::cursor::{ByteReader, ByteWriter};
use crate::error::{Diagnostics, Error, Result, check_sample_count};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MehdBox {
    pub version: u8,
    pub fragment_duration: u64,
}

impl BoxCodec for MehdBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("mehd", 1)?;
        let fragment_duration = if full.version == 1 {
            r.read_u64("mehd fragment_duration")?
        } else {
            r.read_u32("mehd fragment_duration")? as u64
        };
        Ok(Self {
            version: full.version,
            fragment_duration,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, 0).write_header(buf);
        if self.version == 1 {
            buf.put_u64(self.fragment_duration);
        } else {
            buf.put_u32(self.fragment_duration as u32);
        }
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if needs_64(self.fragment_duration) {
            self.version = 1;
        }
    }
}

/// Per-track defaults for fragments, in `mvex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

impl TrexBox {
    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            default_sample_description_index: 1,
            default_sample_duration: 0,
            default_sample_size: 0,
            default_sample_flags: 0,
        }
    }
}

impl BoxCodec for TrexBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("trex", 0)?;
        Ok(Self {
            track_id: r.read_u32("trex track_id")?,
            default_sample_description_index: r.read_u32("trex sample_description_index")?,
            default_sample_duration: r.read_u32("trex default_sample_duration")?,
            default_sample_size: r.read_u32("trex default_sample_size")?,
            default_sample_flags: r.read_u32("trex default_sample_flags")?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.track_id);
        buf.put_u32(self.default_sample_description_index);
        buf.put_u32(self.default_sample_duration);
        buf.put_u32(self.default_sample_size);
        buf.put_u32(self.default_sample_flags);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MfhdBox {
    pub sequence_number: u32,
}

impl BoxCodec for MfhdBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("mfhd", 0)?;
        Ok(Self {
            sequence_number: r.read_u32("mfhd sequence_number")?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.sequence_number);
        Ok(())
    }
}

pub const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
pub const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
pub const TFHD_DEFAULT_DURATION: u32 = 0x000008;
pub const TFHD_DEFAULT_SIZE: u32 = 0x000010;
pub const TFHD_DEFAULT_FLAGS: u32 = 0x000020;
pub const TFHD_DURATION_IS_EMPTY: u32 = 0x010000;
pub const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

/// Track fragment header. Optional fields are present iff their flag bit is set;
/// the flags word is derived from the fields on write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TfhdBox {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub duration_is_empty: bool,
    pub default_base_is_moof: bool,
}

impl TfhdBox {
    pub fn flags(&self) -> u32 {
        let mut f = 0;
        if self.base_data_offset.is_some() {
            f |= TFHD_BASE_DATA_OFFSET;
        }
        if self.sample_description_index.is_some() {
            f |= TFHD_SAMPLE_DESCRIPTION_INDEX;
        }
        if self.default_sample_duration.is_some() {
            f |= TFHD_DEFAULT_DURATION;
        }
        if self.default_sample_size.is_some() {
            f |= TFHD_DEFAULT_SIZE;
        }
        if self.default_sample_flags.is_some() {
            f |= TFHD_DEFAULT_FLAGS;
        }
        if self.duration_is_empty {
            f |= TFHD_DURATION_IS_EMPTY;
        }
        if self.default_base_is_moof {
            f |= TFHD_DEFAULT_BASE_IS_MOOF;
        }
        f
    }

    /// Accessor that turns an absent optional field into a caller error.
    pub fn require_base_data_offset(&self) -> Result<u64> {
        self.base_data_offset
            .ok_or_else(|| Error::precondition("tfhd has no base_data_offset"))
    }
}

impl BoxCodec for TfhdBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("tfhd", 0)?;
        let f = full.flags;
        let track_id = r.read_u32("tfhd track_id")?;
        fn opt32(r: &mut ByteReader<'_>, present: bool, what: &str) -> Result<Option<u32>> {
            if present { Ok(Some(r.read_u32(what)?)) } else { Ok(None) }
        }
        let base_data_offset = if f & TFHD_BASE_DATA_OFFSET != 0 {
            Some(r.read_u64("tfhd base_data_offset")?)
        } else {
            None
        };
        let sample_description_index = opt32(
            r,
            f & TFHD_SAMPLE_DESCRIPTION_INDEX != 0,
            "tfhd sample_description_index",
        )?;
        let default_sample_duration =
            opt32(r, f & TFHD_DEFAULT_DURATION != 0, "tfhd default_sample_duration")?;
        let default_sample_size = opt32(r, f & TFHD_DEFAULT_SIZE != 0, "tfhd default_sample_size")?;
        let default_sample_flags =
            opt32(r, f & TFHD_DEFAULT_FLAGS != 0, "tfhd default_sample_flags")?;
        Ok(Self {
            track_id,
            base_data_offset,
            sample_description_index,
            default_sample_duration,
            default_sample_size,
            default_sample_flags,
            duration_is_empty: f & TFHD_DURATION_IS_EMPTY != 0,
            default_base_is_moof: f & TFHD_DEFAULT_BASE_IS_MOOF != 0,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(0, self.flags()).write_header(buf);
        buf.put_u32(self.track_id);
        if let Some(v) = self.base_data_offset {
            buf.put_u64(v);
        }
        for v in [
            self.sample_description_index,
            self.default_sample_duration,
            self.default_sample_size,
            self.default_sample_flags,
        ]
        .into_iter()
        .flatten()
        {
            buf.put_u32(v);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TfdtBox {
    pub version: u8,
    pub base_media_decode_time: u64,
}

impl TfdtBox {
    pub fn new(base_media_decode_time: u64) -> Self {
        let mut b = Self {
            version: 0,
            base_media_decode_time,
        };
        b.prepare(0);
        b
    }
}

impl BoxCodec for TfdtBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("tfdt", 1)?;
        let base_media_decode_time = if full.version == 1 {
            r.read_u64("tfdt base_media_decode_time")?
        } else {
            r.read_u32("tfdt base_media_decode_time")? as u64
        };
        Ok(Self {
            version: full.version,
            base_media_decode_time,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, 0).write_header(buf);
        if self.version == 1 {
            buf.put_u64(self.base_media_decode_time);
        } else {
            buf.put_u32(self.base_media_decode_time as u32);
        }
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if needs_64(self.base_media_decode_time) {
            self.version = 1;
        }
    }
}

pub const TRUN_DATA_OFFSET: u32 = 0x000001;
pub const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
pub const TRUN_SAMPLE_DURATION: u32 = 0x000100;
pub const TRUN_SAMPLE_SIZE: u32 = 0x000200;
pub const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
pub const TRUN_SAMPLE_CTS: u32 = 0x000800;

/// Fields of one trun entry. Which of them are on the wire is decided by the
/// trun's flags; absent ones read back as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunSample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub cts_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrunBox {
    pub version: u8,
    pub flags: u32,
    pub data_offset: i32,
    pub first_sample_flags: u32,
    pub samples: Vec<TrunSample>,
}

impl TrunBox {
    pub fn has(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }

    pub fn data_offset(&self) -> Option<i32> {
        self.has(TRUN_DATA_OFFSET).then_some(self.data_offset)
    }

    pub fn first_sample_flags(&self) -> Option<u32> {
        self.has(TRUN_FIRST_SAMPLE_FLAGS)
            .then_some(self.first_sample_flags)
    }

    /// Entry size in bytes for the current flags.
    fn entry_size(&self) -> usize {
        [
            TRUN_SAMPLE_DURATION,
            TRUN_SAMPLE_SIZE,
            TRUN_SAMPLE_FLAGS,
            TRUN_SAMPLE_CTS,
        ]
        .iter()
        .filter(|&&b| self.has(b))
        .count()
            * 4
    }
}

impl BoxCodec for TrunBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("trun", 1)?;
        let mut trun = TrunBox {
            version: full.version,
            flags: full.flags,
            ..Default::default()
        };
        let count = r.read_u32("trun sample_count")?;
        if trun.has(TRUN_DATA_OFFSET) {
            trun.data_offset = r.read_i32("trun data_offset")?;
        }
        if trun.has(TRUN_FIRST_SAMPLE_FLAGS) {
            trun.first_sample_flags = r.read_u32("trun first_sample_flags")?;
        }
        let entry_size = trun.entry_size();
        let count = if entry_size == 0 {
            check_sample_count(count as u64, "trun")?;
            count as usize
        } else {
            r.check_entries(count as u64, entry_size, "trun")?
        };
        trun.samples.reserve(count.min(1 << 20));
        for _ in 0..count {
            let mut s = TrunSample::default();
            if trun.has(TRUN_SAMPLE_DURATION) {
                s.duration = r.read_u32("trun sample_duration")?;
            }
            if trun.has(TRUN_SAMPLE_SIZE) {
                s.size = r.read_u32("trun sample_size")?;
            }
            if trun.has(TRUN_SAMPLE_FLAGS) {
                s.flags = r.read_u32("trun sample_flags")?;
            }
            if trun.has(TRUN_SAMPLE_CTS) {
                s.cts_offset = if trun.version == 0 {
                    r.read_u32("trun sample_composition_time_offset")? as i64
                } else {
                    r.read_i32("trun sample_composition_time_offset")? as i64
                };
            }
            trun.samples.push(s);
        }
        Ok(trun)
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, self.flags).write_header(buf);
        buf.put_u32(self.samples.len() as u32);
        if self.has(TRUN_DATA_OFFSET) {
            buf.put_i32(self.data_offset);
        }
        if self.has(TRUN_FIRST_SAMPLE_FLAGS) {
            buf.put_u32(self.first_sample_flags);
        }
        for s in &self.samples {
            if self.has(TRUN_SAMPLE_DURATION) {
                buf.put_u32(s.duration);
            }
            if self.has(TRUN_SAMPLE_SIZE) {
                buf.put_u32(s.size);
            }
            if self.has(TRUN_SAMPLE_FLAGS) {
                buf.put_u32(s.flags);
            }
            if self.has(TRUN_SAMPLE_CTS) {
                if self.version == 0 {
                    let v = u32::try_from(s.cts_offset).map_err(|_| {
                        Error::precondition(format!(
                            "trun v0 cannot carry composition offset {}",
                            s.cts_offset
                        ))
                    })?;
                    buf.put_u32(v);
                } else {
                    let v = i32::try_from(s.cts_offset).map_err(|_| {
                        Error::precondition(format!(
                            "trun v1 cannot carry composition offset {}",
                            s.cts_offset
                        ))
                    })?;
                    buf.put_i32(v);
                }
            }
        }
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if self.samples.iter().any(|s| s.cts_offset < 0) {
            self.version = 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SidxReference {
    /// True when the reference points at another sidx.
    pub reference_type: bool,
    /// 31 bits on the wire.
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    /// 28 bits on the wire.
    pub sap_delta_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SidxBox {
    pub version: u8,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub first_offset: u64,
    pub references: Vec<SidxReference>,
}

impl BoxCodec for SidxBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("sidx", 1)?;
        let reference_id = r.read_u32("sidx reference_ID")?;
        let timescale = r.read_u32("sidx timescale")?;
        let (earliest_presentation_time, first_offset) = if full.version == 1 {
            (
                r.read_u64("sidx earliest_presentation_time")?,
                r.read_u64("sidx first_offset")?,
            )
        } else {
            (
                r.read_u32("sidx earliest_presentation_time")? as u64,
                r.read_u32("sidx first_offset")? as u64,
            )
        };
        r.skip(2, "sidx reserved")?;
        let count = r.read_u16("sidx reference_count")?;
        let count = r.check_entries(count as u64, 12, "sidx")?;
        let mut references = Vec::with_capacity(count);
        for _ in 0..count {
            let a = r.read_u32("sidx referenced_size")?;
            let subsegment_duration = r.read_u32("sidx subsegment_duration")?;
            let c = r.read_u32("sidx sap")?;
            references.push(SidxReference {
                reference_type: a >> 31 == 1,
                referenced_size: a & 0x7FFF_FFFF,
                subsegment_duration,
                starts_with_sap: c >> 31 == 1,
                sap_type: ((c >> 28) & 0x7) as u8,
                sap_delta_time: c & 0x0FFF_FFFF,
            });
        }
        Ok(Self {
            version: full.version,
            reference_id,
            timescale,
            earliest_presentation_time,
            first_offset,
            references,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.references.len() > u16::MAX as usize {
            return Err(Error::precondition(format!(
                "sidx cannot index {} references",
                self.references.len()
            )));
        }
        FullBoxHeader::new(self.version, 0).write_header(buf);
        buf.put_u32(self.reference_id);
        buf.put_u32(self.timescale);
        if self.version == 1 {
            buf.put_u64(self.earliest_presentation_time);
            buf.put_u64(self.first_offset);
        } else {
            buf.put_u32(self.earliest_presentation_time as u32);
            buf.put_u32(self.first_offset as u32);
        }
        buf.put_u16(0);
        buf.put_u16(self.references.len() as u16);
        for rf in &self.references {
            if rf.referenced_size > 0x7FFF_FFFF {
                return Err(Error::precondition(format!(
                    "sidx referenced_size {} exceeds 31 bits",
                    rf.referenced_size
                )));
            }
            buf.put_u32(((rf.reference_type as u32) << 31) | rf.referenced_size);
            buf.put_u32(rf.subsegment_duration);
            buf.put_u32(
                ((rf.starts_with_sap as u32) << 31)
                    | ((rf.sap_type as u32 & 0x7) << 28)
                    | (rf.sap_delta_time & 0x0FFF_FFFF),
            );
        }
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if needs_64(self.earliest_presentation_time) || needs_64(self.first_offset) {
            self.version = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse<T: BoxCodec>(b: &T) -> (usize, T) {
        let mut buf = Vec::new();
        b.write(&mut buf).unwrap();
        let back =
            T::parse(&mut ByteReader::new(&buf), FourCC(*b"test"), &mut Diagnostics::new()).unwrap();
        (buf.len(), back)
    }

    #[test]
    fn sidx_promotion() {
        let mut sidx = SidxBox {
            reference_id: 1,
            timescale: 90000,
            earliest_presentation_time: u32::MAX as u64 + 1,
            references: vec![SidxReference {
                referenced_size: 1234,
                subsegment_duration: 90000,
                starts_with_sap: true,
                sap_type: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        sidx.prepare(0);
        assert_eq!(sidx.version, 1);
        let (_, back) = reparse(&sidx);
        assert_eq!(back, sidx);

        let mut small = SidxBox {
            earliest_presentation_time: u32::MAX as u64,
            ..Default::default()
        };
        small.prepare(0);
        assert_eq!(small.version, 0);
    }

    #[test]
    fn trun_without_sample_fields_is_bounded() {
        let mut buf = Vec::new();
        FullBoxHeader::default().write_header(&mut buf);
        buf.put_u32(u32::MAX);
        let err = TrunBox::parse(&mut ByteReader::new(&buf), FourCC(*b"trun"), &mut Diagnostics::new())
            .unwrap_err();
        assert!(err.is_malformed());

        let mut buf = Vec::new();
        FullBoxHeader::default().write_header(&mut buf);
        buf.put_u32(3);
        let trun =
            TrunBox::parse(&mut ByteReader::new(&buf), FourCC(*b"trun"), &mut Diagnostics::new()).unwrap();
        assert_eq!(trun.samples.len(), 3);
    }

    #[test]
    fn tfhd_flags_follow_fields() {
        let tfhd = TfhdBox {
            track_id: 2,
            default_sample_duration: Some(1024),
            default_sample_flags: Some(0x0101_0000),
            default_base_is_moof: true,
            ..Default::default()
        };
        assert_eq!(
            tfhd.flags(),
            TFHD_DEFAULT_DURATION | TFHD_DEFAULT_FLAGS | TFHD_DEFAULT_BASE_IS_MOOF
        );
        let (len, back) = reparse(&tfhd);
        assert_eq!(len, 4 + 4 + 8);
        assert_eq!(back, tfhd);
        assert!(back.require_base_data_offset().is_err());
    }

    #[test]
    fn trun_optional_fields() {
        let trun = TrunBox {
            version: 1,
            flags: TRUN_DATA_OFFSET | TRUN_SAMPLE_SIZE | TRUN_SAMPLE_CTS,
            data_offset: 120,
            samples: vec![
                TrunSample { size: 10, cts_offset: -5, ..Default::default() },
                TrunSample { size: 20, cts_offset: 7, ..Default::default() },
            ],
            ..Default::default()
        };
        let (len, back) = reparse(&trun);
        assert_eq!(len, 4 + 4 + 4 + 2 * 8);
        assert_eq!(back, trun);
        assert_eq!(back.data_offset(), Some(120));
        assert_eq!(back.first_sample_flags(), None);
    }

    #[test]
    fn tfdt_promotion() {
        assert_eq!(TfdtBox::new(10).version, 0);
        let big = TfdtBox::new(1 << 34);
        assert_eq!(big.version, 1);
        assert_eq!(reparse(&big).1.base_media_decode_time, 1 << 34);
    }
}
