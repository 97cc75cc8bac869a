//! Sample table boxes under `stbl`.

use super::{BoxCodec, FourCC, FullBoxHeader};
use crate::cursor::{ByteReader, ByteWriter};
use crate::error::{Diagnostics, Error, Result};

/// `stsd`: the sample entries are child boxes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StsdBox {
    pub version: u8,
    pub entry_count: u32,
}

impl BoxCodec for StsdBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("stsd", 1)?;
        Ok(Self {
            version: full.version,
            entry_count: r.read_u32("stsd entry_count")?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, 0).write_header(buf);
        buf.put_u32(self.entry_count);
        Ok(())
    }

    fn prepare(&mut self, child_count: usize) {
        self.entry_count = child_count as u32;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SttsBox {
    pub entries: Vec<SttsEntry>,
}

impl SttsBox {
    /// Run-length encodes per-sample durations.
    pub fn from_durations(durations: impl IntoIterator<Item = u32>) -> Self {
        let mut entries: Vec<SttsEntry> = Vec::new();
        for d in durations {
            match entries.last_mut() {
                Some(last) if last.sample_delta == d => last.sample_count += 1,
                _ => entries.push(SttsEntry {
                    sample_count: 1,
                    sample_delta: d,
                }),
            }
        }
        Self { entries }
    }

    pub fn sample_count(&self) -> u64 {
        self.entries.iter().map(|e| e.sample_count as u64).sum()
    }
}

impl BoxCodec for SttsBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("stts", 0)?;
        let count = r.read_u32("stts entry_count")?;
        let count = r.check_entries(count as u64, 8, "stts")?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(SttsEntry {
                sample_count: r.read_u32("stts sample_count")?,
                sample_delta: r.read_u32("stts sample_delta")?,
            });
        }
        Ok(Self { entries })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            buf.put_u32(e.sample_count);
            buf.put_u32(e.sample_delta);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CttsEntry {
    pub sample_count: u32,
    pub sample_offset: i64,
}

/// `ctts`: version 0 offsets are unsigned, version 1 signed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CttsBox {
    pub version: u8,
    pub entries: Vec<CttsEntry>,
}

impl CttsBox {
    pub fn from_offsets(offsets: impl IntoIterator<Item = i64>) -> Self {
        let mut entries: Vec<CttsEntry> = Vec::new();
        for o in offsets {
            match entries.last_mut() {
                Some(last) if last.sample_offset == o => last.sample_count += 1,
                _ => entries.push(CttsEntry {
                    sample_count: 1,
                    sample_offset: o,
                }),
            }
        }
        let mut ctts = Self {
            version: 0,
            entries,
        };
        ctts.prepare(0);
        ctts
    }

    pub fn sample_count(&self) -> u64 {
        self.entries.iter().map(|e| e.sample_count as u64).sum()
    }
}

impl BoxCodec for CttsBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("ctts", 1)?;
        let count = r.read_u32("ctts entry_count")?;
        let count = r.check_entries(count as u64, 8, "ctts")?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let sample_count = r.read_u32("ctts sample_count")?;
            let sample_offset = if full.version == 0 {
                r.read_u32("ctts sample_offset")? as i64
            } else {
                r.read_i32("ctts sample_offset")? as i64
            };
            entries.push(CttsEntry {
                sample_count,
                sample_offset,
            });
        }
        Ok(Self {
            version: full.version,
            entries,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, 0).write_header(buf);
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            buf.put_u32(e.sample_count);
            if self.version == 0 {
                let v = u32::try_from(e.sample_offset).map_err(|_| {
                    Error::precondition(format!(
                        "ctts v0 cannot carry composition offset {}",
                        e.sample_offset
                    ))
                })?;
                buf.put_u32(v);
            } else {
                let v = i32::try_from(e.sample_offset).map_err(|_| {
                    Error::precondition(format!(
                        "ctts v1 cannot carry composition offset {}",
                        e.sample_offset
                    ))
                })?;
                buf.put_i32(v);
            }
        }
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if self.entries.iter().any(|e| e.sample_offset < 0) {
            self.version = 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StscBox {
    pub entries: Vec<StscEntry>,
}

impl StscBox {
    /// Builds the run table from per-chunk sample counts (description index 1).
    pub fn from_chunk_sizes(chunk_sample_counts: &[u32]) -> Self {
        let mut entries: Vec<StscEntry> = Vec::new();
        for (i, &n) in chunk_sample_counts.iter().enumerate() {
            if entries.last().is_some_and(|e| e.samples_per_chunk == n) {
                continue;
            }
            entries.push(StscEntry {
                first_chunk: i as u32 + 1,
                samples_per_chunk: n,
                sample_description_index: 1,
            });
        }
        Self { entries }
    }
}

impl BoxCodec for StscBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("stsc", 0)?;
        let count = r.read_u32("stsc entry_count")?;
        let count = r.check_entries(count as u64, 12, "stsc")?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(StscEntry {
                first_chunk: r.read_u32("stsc first_chunk")?,
                samples_per_chunk: r.read_u32("stsc samples_per_chunk")?,
                sample_description_index: r.read_u32("stsc sample_description_index")?,
            });
        }
        Ok(Self { entries })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            buf.put_u32(e.first_chunk);
            buf.put_u32(e.samples_per_chunk);
            buf.put_u32(e.sample_description_index);
        }
        Ok(())
    }
}

/// `stsz`: a non-zero `sample_size` means every sample has that size and no
/// table follows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StszBox {
    pub sample_size: u32,
    pub sample_count: u32,
    pub entry_sizes: Vec<u32>,
}

impl StszBox {
    pub fn from_sizes(sizes: Vec<u32>) -> Self {
        let uniform = sizes.first().copied().filter(|&s| sizes.iter().all(|&x| x == s));
        match uniform {
            Some(s) if sizes.len() > 1 => Self {
                sample_size: s,
                sample_count: sizes.len() as u32,
                entry_sizes: Vec::new(),
            },
            _ => Self {
                sample_size: 0,
                sample_count: sizes.len() as u32,
                entry_sizes: sizes,
            },
        }
    }

    pub fn sizes(&self) -> Vec<u32> {
        if self.sample_size != 0 {
            vec![self.sample_size; self.sample_count as usize]
        } else {
            self.entry_sizes.clone()
        }
    }
}

impl BoxCodec for StszBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("stsz", 0)?;
        let sample_size = r.read_u32("stsz sample_size")?;
        let sample_count = r.read_u32("stsz sample_count")?;
        let mut entry_sizes = Vec::new();
        if sample_size == 0 {
            let count = r.check_entries(sample_count as u64, 4, "stsz")?;
            entry_sizes.reserve(count);
            for _ in 0..count {
                entry_sizes.push(r.read_u32("stsz entry_size")?);
            }
        }
        Ok(Self {
            sample_size,
            sample_count,
            entry_sizes,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.sample_size);
        buf.put_u32(self.sample_count);
        if self.sample_size == 0 {
            for s in &self.entry_sizes {
                buf.put_u32(*s);
            }
        }
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if self.sample_size == 0 {
            self.sample_count = self.entry_sizes.len() as u32;
        }
    }
}

/// `stz2`: compact sizes in 4, 8 or 16 bit fields. In the 4-bit form two
/// entries share a byte, high nibble first, and an odd tail is zero padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stz2Box {
    pub field_size: u8,
    pub entry_sizes: Vec<u32>,
}

impl Stz2Box {
    pub fn new(field_size: u8, entry_sizes: Vec<u32>) -> Self {
        Self {
            field_size,
            entry_sizes,
        }
    }

    /// Smallest field size that fits every entry.
    pub fn min_field_size(sizes: &[u32]) -> Option<u8> {
        let max = sizes.iter().copied().max().unwrap_or(0);
        match max {
            0..=0xF => Some(4),
            0x10..=0xFF => Some(8),
            0x100..=0xFFFF => Some(16),
            _ => None,
        }
    }
}

impl BoxCodec for Stz2Box {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("stz2", 0)?;
        r.expect_zeros(3, "stz2 reserved")?;
        let field_size = r.read_u8("stz2 field_size")?;
        let count = r.read_u32("stz2 sample_count")? as u64;
        let mut entry_sizes = Vec::new();
        match field_size {
            4 => {
                let bytes = r.check_entries(count.div_ceil(2), 1, "stz2")?;
                let packed = r.read_bytes(bytes, "stz2 entries")?;
                entry_sizes.reserve(count as usize);
                for i in 0..count as usize {
                    let b = packed[i / 2];
                    entry_sizes.push(if i % 2 == 0 { (b >> 4) as u32 } else { (b & 0x0F) as u32 });
                }
            }
            8 => {
                let n = r.check_entries(count, 1, "stz2")?;
                for _ in 0..n {
                    entry_sizes.push(r.read_u8("stz2 entry")? as u32);
                }
            }
            16 => {
                let n = r.check_entries(count, 2, "stz2")?;
                for _ in 0..n {
                    entry_sizes.push(r.read_u16("stz2 entry")? as u32);
                }
            }
            other => {
                return Err(Error::malformed(format!("stz2 field_size {other} is not 4, 8 or 16")));
            }
        }
        Ok(Self {
            field_size,
            entry_sizes,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_zeros(3);
        buf.put_u8(self.field_size);
        buf.put_u32(self.entry_sizes.len() as u32);
        let limit = match self.field_size {
            4 => 0xF,
            8 => 0xFF,
            16 => 0xFFFF,
            other => {
                return Err(Error::precondition(format!(
                    "stz2 field_size {other} is not 4, 8 or 16"
                )));
            }
        };
        if let Some(big) = self.entry_sizes.iter().find(|&&s| s > limit) {
            return Err(Error::precondition(format!(
                "stz2 entry {big} does not fit a {}-bit field",
                self.field_size
            )));
        }
        match self.field_size {
            4 => {
                for pair in self.entry_sizes.chunks(2) {
                    let hi = (pair[0] as u8) << 4;
                    let lo = pair.get(1).map_or(0, |&v| v as u8);
                    buf.put_u8(hi | lo);
                }
            }
            8 => self.entry_sizes.iter().for_each(|&s| buf.put_u8(s as u8)),
            _ => self.entry_sizes.iter().for_each(|&s| buf.put_u16(s as u16)),
        }
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        // Widen when an entry outgrows the field; never narrow.
        if let Some(min) = Self::min_field_size(&self.entry_sizes) {
            if min > self.field_size {
                self.field_size = min;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StcoBox {
    pub chunk_offsets: Vec<u32>,
}

impl BoxCodec for StcoBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("stco", 0)?;
        let count = r.read_u32("stco entry_count")?;
        let count = r.check_entries(count as u64, 4, "stco")?;
        let mut chunk_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            chunk_offsets.push(r.read_u32("stco chunk_offset")?);
        }
        Ok(Self { chunk_offsets })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.chunk_offsets.len() as u32);
        for o in &self.chunk_offsets {
            buf.put_u32(*o);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Co64Box {
    pub chunk_offsets: Vec<u64>,
}

impl BoxCodec for Co64Box {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("co64", 0)?;
        let count = r.read_u32("co64 entry_count")?;
        let count = r.check_entries(count as u64, 8, "co64")?;
        let mut chunk_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            chunk_offsets.push(r.read_u64("co64 chunk_offset")?);
        }
        Ok(Self { chunk_offsets })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.chunk_offsets.len() as u32);
        for o in &self.chunk_offsets {
            buf.put_u64(*o);
        }
        Ok(())
    }
}

/// `stss`: 1-based sample numbers of sync samples.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StssBox {
    pub sample_numbers: Vec<u32>,
}

impl BoxCodec for StssBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("stss", 0)?;
        let count = r.read_u32("stss entry_count")?;
        let count = r.check_entries(count as u64, 4, "stss")?;
        let mut sample_numbers = Vec::with_capacity(count);
        for _ in 0..count {
            sample_numbers.push(r.read_u32("stss sample_number")?);
        }
        Ok(Self { sample_numbers })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.sample_numbers.len() as u32);
        for n in &self.sample_numbers {
            buf.put_u32(*n);
        }
        Ok(())
    }
}
