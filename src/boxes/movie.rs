//! Movie, track and media header boxes.

use super::{BoxCodec, FourCC, FullBoxHeader, needs_64};
use crate::cursor::{ByteReader, ByteWriter};
use crate::error::{Diagnostics, Error, Result};
use serde::{Deserialize, Serialize};

pub const UNITY_MATRIX: [i32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

fn read_matrix(r: &mut ByteReader<'_>) -> Result<[i32; 9]> {
    let mut m = [0i32; 9];
    for v in m.iter_mut() {
        *v = r.read_i32("matrix")?;
    }
    Ok(m)
}

fn write_matrix(buf: &mut Vec<u8>, m: &[i32; 9]) {
    for v in m {
        buf.put_i32(*v);
    }
}

/// Reads creation/modification/<u32 field>/duration in the v0 or v1 layout.
fn read_times(r: &mut ByteReader<'_>, version: u8, what: &str) -> Result<(u64, u64)> {
    if version == 1 {
        Ok((r.read_u64(what)?, r.read_u64(what)?))
    } else {
        Ok((r.read_u32(what)? as u64, r.read_u32(what)? as u64))
    }
}

fn write_time(buf: &mut Vec<u8>, version: u8, v: u64) {
    if version == 1 {
        buf.put_u64(v);
    } else {
        buf.put_u32(v as u32);
    }
}

fn check_times(typ: FourCC, creation: u64, modification: u64, diag: &mut Diagnostics) {
    if creation > modification {
        diag.warn(format!(
            "{typ}: creation time {creation} is after modification time {modification}"
        ));
    }
}

/// ISO 639-2/T code packed into 15 bits.
pub fn pack_language(lang: &str) -> u16 {
    let b = lang.as_bytes();
    if b.len() != 3 || !b.iter().all(|c| c.is_ascii_lowercase()) {
        return pack_language("und");
    }
    ((b[0] - 0x60) as u16) << 10 | ((b[1] - 0x60) as u16) << 5 | (b[2] - 0x60) as u16
}

pub fn unpack_language(code: u16) -> String {
    if code == 0 {
        return "und".to_string();
    }
    let c1 = ((code >> 10) & 0x1F) as u8 + 0x60;
    let c2 = ((code >> 5) & 0x1F) as u8 + 0x60;
    let c3 = (code & 0x1F) as u8 + 0x60;
    format!("{}{}{}", c1 as char, c2 as char, c3 as char)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvhdBox {
    pub version: u8,
    pub flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    pub rate: i32,
    pub volume: i16,
    pub matrix: [i32; 9],
    pub next_track_id: u32,
}

impl Default for MvhdBox {
    fn default() -> Self {
        Self {
            version: 0,
            flags: 0,
            creation_time: 0,
            modification_time: 0,
            timescale: 1000,
            duration: 0,
            rate: 0x0001_0000,
            volume: 0x0100,
            matrix: UNITY_MATRIX,
            next_track_id: 1,
        }
    }
}

impl BoxCodec for MvhdBox {
    fn parse(r: &mut ByteReader<'_>, typ: FourCC, diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("mvhd", 1)?;
        let (creation_time, modification_time) = read_times(r, full.version, "mvhd times")?;
        let timescale = r.read_u32("mvhd timescale")?;
        let duration = if full.version == 1 {
            r.read_u64("mvhd duration")?
        } else {
            r.read_u32("mvhd duration")? as u64
        };
        let rate = r.read_i32("mvhd rate")?;
        let volume = r.read_i16("mvhd volume")?;
        r.skip(2 + 8, "mvhd reserved")?;
        let matrix = read_matrix(r)?;
        r.skip(24, "mvhd pre_defined")?;
        let next_track_id = r.read_u32("mvhd next_track_id")?;
        check_times(typ, creation_time, modification_time, diag);
        Ok(Self {
            version: full.version,
            flags: full.flags,
            creation_time,
            modification_time,
            timescale,
            duration,
            rate,
            volume,
            matrix,
            next_track_id,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, self.flags).write_header(buf);
        write_time(buf, self.version, self.creation_time);
        write_time(buf, self.version, self.modification_time);
        buf.put_u32(self.timescale);
        write_time(buf, self.version, self.duration);
        buf.put_i32(self.rate);
        buf.put_i16(self.volume);
        buf.put_zeros(2 + 8);
        write_matrix(buf, &self.matrix);
        buf.put_zeros(24);
        buf.put_u32(self.next_track_id);
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if needs_64(self.creation_time) || needs_64(self.modification_time) || needs_64(self.duration)
        {
            self.version = 1;
        }
    }
}

/// Track enabled / in movie / in preview.
pub const TKHD_DEFAULT_FLAGS: u32 = 0x000007;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TkhdBox {
    pub version: u8,
    pub flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub track_id: u32,
    pub duration: u64,
    pub layer: i16,
    pub alternate_group: i16,
    pub volume: i16,
    pub matrix: [i32; 9],
    /// 16.16 fixed point.
    pub width: u32,
    /// 16.16 fixed point.
    pub height: u32,
}

impl Default for TkhdBox {
    fn default() -> Self {
        Self {
            version: 0,
            flags: TKHD_DEFAULT_FLAGS,
            creation_time: 0,
            modification_time: 0,
            track_id: 1,
            duration: 0,
            layer: 0,
            alternate_group: 0,
            volume: 0,
            matrix: UNITY_MATRIX,
            width: 0,
            height: 0,
        }
    }
}

impl BoxCodec for TkhdBox {
    fn parse(r: &mut ByteReader<'_>, typ: FourCC, diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("tkhd", 1)?;
        let (creation_time, modification_time) = read_times(r, full.version, "tkhd times")?;
        let track_id = r.read_u32("tkhd track_id")?;
        r.skip(4, "tkhd reserved")?;
        let duration = if full.version == 1 {
            r.read_u64("tkhd duration")?
        } else {
            r.read_u32("tkhd duration")? as u64
        };
        r.skip(8, "tkhd reserved")?;
        let layer = r.read_i16("tkhd layer")?;
        let alternate_group = r.read_i16("tkhd alternate_group")?;
        let volume = r.read_i16("tkhd volume")?;
        r.skip(2, "tkhd reserved")?;
        let matrix = read_matrix(r)?;
        let width = r.read_u32("tkhd width")?;
        let height = r.read_u32("tkhd height")?;
        check_times(typ, creation_time, modification_time, diag);
        if track_id == 0 {
            return Err(Error::malformed("tkhd track_id must not be 0"));
        }
        Ok(Self {
            version: full.version,
            flags: full.flags,
            creation_time,
            modification_time,
            track_id,
            duration,
            layer,
            alternate_group,
            volume,
            matrix,
            width,
            height,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, self.flags).write_header(buf);
        write_time(buf, self.version, self.creation_time);
        write_time(buf, self.version, self.modification_time);
        buf.put_u32(self.track_id);
        buf.put_zeros(4);
        write_time(buf, self.version, self.duration);
        buf.put_zeros(8);
        buf.put_i16(self.layer);
        buf.put_i16(self.alternate_group);
        buf.put_i16(self.volume);
        buf.put_zeros(2);
        write_matrix(buf, &self.matrix);
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if needs_64(self.creation_time) || needs_64(self.modification_time) || needs_64(self.duration)
        {
            self.version = 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdhdBox {
    pub version: u8,
    pub flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    pub language: String,
}

impl Default for MdhdBox {
    fn default() -> Self {
        Self {
            version: 0,
            flags: 0,
            creation_time: 0,
            modification_time: 0,
            timescale: 1000,
            duration: 0,
            language: "und".to_string(),
        }
    }
}

impl BoxCodec for MdhdBox {
    fn parse(r: &mut ByteReader<'_>, typ: FourCC, diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("mdhd", 1)?;
        let (creation_time, modification_time) = read_times(r, full.version, "mdhd times")?;
        let timescale = r.read_u32("mdhd timescale")?;
        let duration = if full.version == 1 {
            r.read_u64("mdhd duration")?
        } else {
            r.read_u32("mdhd duration")? as u64
        };
        let language = unpack_language(r.read_u16("mdhd language")? & 0x7FFF);
        r.skip(2, "mdhd pre_defined")?;
        check_times(typ, creation_time, modification_time, diag);
        if timescale == 0 {
            return Err(Error::malformed("mdhd timescale must not be 0"));
        }
        Ok(Self {
            version: full.version,
            flags: full.flags,
            creation_time,
            modification_time,
            timescale,
            duration,
            language,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, self.flags).write_header(buf);
        write_time(buf, self.version, self.creation_time);
        write_time(buf, self.version, self.modification_time);
        buf.put_u32(self.timescale);
        write_time(buf, self.version, self.duration);
        buf.put_u16(pack_language(&self.language));
        buf.put_u16(0);
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        if needs_64(self.creation_time) || needs_64(self.modification_time) || needs_64(self.duration)
        {
            self.version = 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdlrBox {
    pub handler_type: FourCC,
    pub name: String,
}

impl HdlrBox {
    pub fn new(handler_type: FourCC, name: &str) -> Self {
        Self {
            handler_type,
            name: name.to_string(),
        }
    }
}

impl BoxCodec for HdlrBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("hdlr", 0)?;
        r.skip(4, "hdlr pre_defined")?;
        let handler_type = r.read_fourcc("hdlr handler_type")?;
        r.skip(12, "hdlr reserved")?;
        let name = r.read_cstring("hdlr name")?;
        // Some writers pad the name with extra NULs.
        r.read_to_end();
        Ok(Self { handler_type, name })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(0);
        buf.put_fourcc(self.handler_type);
        buf.put_zeros(12);
        buf.put_cstring(&self.name);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmhdBox {
    pub graphics_mode: u16,
    pub opcolor: [u16; 3],
}

impl BoxCodec for VmhdBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("vmhd", 0)?;
        let graphics_mode = r.read_u16("vmhd graphicsmode")?;
        let mut opcolor = [0u16; 3];
        for c in opcolor.iter_mut() {
            *c = r.read_u16("vmhd opcolor")?;
        }
        Ok(Self {
            graphics_mode,
            opcolor,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(0, 1).write_header(buf);
        buf.put_u16(self.graphics_mode);
        for c in &self.opcolor {
            buf.put_u16(*c);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmhdBox {
    pub balance: i16,
}

impl BoxCodec for SmhdBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("smhd", 0)?;
        let balance = r.read_i16("smhd balance")?;
        r.skip(2, "smhd reserved")?;
        Ok(Self { balance })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_i16(self.balance);
        buf.put_u16(0);
        Ok(())
    }
}

/// `dref`: the data entries themselves are child boxes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DrefBox {
    pub entry_count: u32,
}

impl BoxCodec for DrefBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("dref", 0)?;
        let entry_count = r.read_u32("dref entry_count")?;
        Ok(Self { entry_count })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_u32(self.entry_count);
        Ok(())
    }

    fn prepare(&mut self, child_count: usize) {
        self.entry_count = child_count as u32;
    }
}

/// `url `: flag 1 means the media data lives in this file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlBox {
    pub flags: u32,
    pub location: Option<String>,
}

impl UrlBox {
    pub fn self_contained() -> Self {
        Self {
            flags: 1,
            location: None,
        }
    }
}

impl BoxCodec for UrlBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        let location = if full.flags & 1 == 0 && !r.is_empty() {
            Some(r.read_cstring("url location")?)
        } else {
            r.read_to_end();
            None
        };
        Ok(Self {
            flags: full.flags,
            location,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(0, self.flags).write_header(buf);
        if let Some(loc) = &self.location {
            buf.put_cstring(loc);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElstEntry {
    pub segment_duration: u64,
    pub media_time: i64,
    pub media_rate_integer: i16,
    pub media_rate_fraction: i16,
}

impl ElstEntry {
    pub fn new(segment_duration: u64, media_time: i64) -> Self {
        Self {
            segment_duration,
            media_time,
            media_rate_integer: 1,
            media_rate_fraction: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElstBox {
    pub version: u8,
    pub flags: u32,
    pub entries: Vec<ElstEntry>,
}

impl BoxCodec for ElstBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let full = FullBoxHeader::parse(r)?;
        full.require_version("elst", 1)?;
        let count = r.read_u32("elst entry_count")?;
        let entry_size = if full.version == 1 { 20 } else { 12 };
        let count = r.check_entries(count as u64, entry_size, "elst")?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let (segment_duration, media_time) = if full.version == 1 {
                (r.read_u64("elst duration")?, r.read_i64("elst media_time")?)
            } else {
                (
                    r.read_u32("elst duration")? as u64,
                    r.read_i32("elst media_time")? as i64,
                )
            };
            entries.push(ElstEntry {
                segment_duration,
                media_time,
                media_rate_integer: r.read_i16("elst rate")?,
                media_rate_fraction: r.read_i16("elst rate fraction")?,
            });
        }
        Ok(Self {
            version: full.version,
            flags: full.flags,
            entries,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::new(self.version, self.flags).write_header(buf);
        buf.put_u32(self.entries.len() as u32);
        for e in &self.entries {
            if self.version == 1 {
                buf.put_u64(e.segment_duration);
                buf.put_i64(e.media_time);
            } else {
                buf.put_u32(e.segment_duration as u32);
                buf.put_i32(e.media_time as i32);
            }
            buf.put_i16(e.media_rate_integer);
            buf.put_i16(e.media_rate_fraction);
        }
        Ok(())
    }

    fn prepare(&mut self, _child_count: usize) {
        let wide = self.entries.iter().any(|e| {
            needs_64(e.segment_duration) || e.media_time > i32::MAX as i64 || e.media_time < i32::MIN as i64
        });
        if wide {
            self.version = 1;
        }
    }
}

/// `iods`: the object descriptor is kept as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IodsBox {
    pub descriptor: Vec<u8>,
}

impl IodsBox {
    /// Minimal InitialObjectDescriptor (tag 0x10) carrying only profile levels.
    pub fn with_profiles(audio_profile_level: u8, visual_profile_level: u8) -> Self {
        let descriptor = vec![
            0x10, // MP4_IOD_Tag
            0x07, // length
            0x00,
            0x4F, // ObjectDescriptorID=1, URL_Flag=0, includeInlineProfileLevelFlag=0
            0xFF, // OD profile
            0xFF, // scene profile
            audio_profile_level,
            visual_profile_level,
            0xFF, // graphics profile
        ];
        Self { descriptor }
    }
}

impl BoxCodec for IodsBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        FullBoxHeader::parse(r)?.require_version("iods", 0)?;
        Ok(Self {
            descriptor: r.read_to_end().to_vec(),
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        FullBoxHeader::default().write_header(buf);
        buf.put_bytes(&self.descriptor);
        Ok(())
    }
}
