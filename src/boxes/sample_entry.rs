//! Sample entries (children of `stsd`) and the small boxes nested in them.
//!
//! Decoder configuration records (avcC, hvcC, vvcC, mhaC, esds, jxsH) are not
//! decoded here; they stay opaque and are handed to the track readers as bytes.

use super::{BoxCodec, FourCC};
use crate::cursor::{ByteReader, ByteWriter};
use crate::error::{Diagnostics, Error, Result};

pub const AVC1: FourCC = FourCC(*b"avc1");
pub const AVC3: FourCC = FourCC(*b"avc3");
pub const HVC1: FourCC = FourCC(*b"hvc1");
pub const HEV1: FourCC = FourCC(*b"hev1");
pub const VVC1: FourCC = FourCC(*b"vvc1");
pub const VVI1: FourCC = FourCC(*b"vvi1");
pub const JXSM: FourCC = FourCC(*b"jxsm");
pub const MP4A: FourCC = FourCC(*b"mp4a");
pub const MHA1: FourCC = FourCC(*b"mha1");
pub const MHA2: FourCC = FourCC(*b"mha2");
pub const MHM1: FourCC = FourCC(*b"mhm1");
pub const MHM2: FourCC = FourCC(*b"mhm2");

pub const VISUAL_ENTRIES: [FourCC; 7] = [AVC1, AVC3, HVC1, HEV1, VVC1, VVI1, JXSM];
pub const AUDIO_ENTRIES: [FourCC; 5] = [MP4A, MHA1, MHA2, MHM1, MHM2];

/// Fixed 78-byte prefix of a visual sample entry; codec boxes follow as children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualSampleEntry {
    pub data_reference_index: u16,
    pub width: u16,
    pub height: u16,
    pub horiz_resolution: u32,
    pub vert_resolution: u32,
    pub frame_count: u16,
    pub compressor_name: String,
    pub depth: u16,
}

impl VisualSampleEntry {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            data_reference_index: 1,
            width,
            height,
            horiz_resolution: 0x0048_0000,
            vert_resolution: 0x0048_0000,
            frame_count: 1,
            compressor_name: String::new(),
            depth: 0x0018,
        }
    }
}

impl BoxCodec for VisualSampleEntry {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        r.skip(6, "visual entry reserved")?;
        let data_reference_index = r.read_u16("data_reference_index")?;
        r.skip(2 + 2 + 12, "visual entry pre_defined")?;
        let width = r.read_u16("width")?;
        let height = r.read_u16("height")?;
        let horiz_resolution = r.read_u32("horizresolution")?;
        let vert_resolution = r.read_u32("vertresolution")?;
        r.skip(4, "visual entry reserved")?;
        let frame_count = r.read_u16("frame_count")?;
        let name = r.read_bytes(32, "compressorname")?;
        // Pascal string: length byte then up to 31 chars.
        let len = (name[0] as usize).min(31);
        let compressor_name = String::from_utf8_lossy(&name[1..1 + len]).into_owned();
        let depth = r.read_u16("depth")?;
        r.skip(2, "visual entry pre_defined")?;
        Ok(Self {
            data_reference_index,
            width,
            height,
            horiz_resolution,
            vert_resolution,
            frame_count,
            compressor_name,
            depth,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_zeros(6);
        buf.put_u16(self.data_reference_index);
        buf.put_zeros(2 + 2 + 12);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u32(self.horiz_resolution);
        buf.put_u32(self.vert_resolution);
        buf.put_zeros(4);
        buf.put_u16(self.frame_count);
        let name = self.compressor_name.as_bytes();
        let len = name.len().min(31);
        let mut field = [0u8; 32];
        field[0] = len as u8;
        field[1..1 + len].copy_from_slice(&name[..len]);
        buf.put_bytes(&field);
        buf.put_u16(self.depth);
        buf.put_i16(-1);
        Ok(())
    }
}

/// Audio sample entry. Version 1 (QuickTime sound description v1) carries 16
/// extra bytes that are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSampleEntry {
    pub data_reference_index: u16,
    pub entry_version: u16,
    pub channel_count: u16,
    pub sample_size: u16,
    /// Integer part of the 16.16 sample rate field.
    pub sample_rate: u32,
    pub qt_extension: Vec<u8>,
}

impl AudioSampleEntry {
    pub fn new(sample_rate: u32, channel_count: u16) -> Self {
        Self {
            data_reference_index: 1,
            entry_version: 0,
            channel_count,
            sample_size: 16,
            sample_rate,
            qt_extension: Vec::new(),
        }
    }
}

impl BoxCodec for AudioSampleEntry {
    fn parse(r: &mut ByteReader<'_>, typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        r.skip(6, "audio entry reserved")?;
        let data_reference_index = r.read_u16("data_reference_index")?;
        let entry_version = r.read_u16("audio entry version")?;
        r.skip(6, "audio entry reserved")?;
        let channel_count = r.read_u16("channelcount")?;
        let sample_size = r.read_u16("samplesize")?;
        r.skip(4, "audio entry pre_defined")?;
        let sample_rate = r.read_u32("samplerate")? >> 16;
        let qt_extension = match entry_version {
            0 => Vec::new(),
            1 => r.read_bytes(16, "audio entry v1 extension")?.to_vec(),
            v => {
                return Err(Error::unsupported(format!(
                    "{typ} audio sample entry version {v}"
                )));
            }
        };
        Ok(Self {
            data_reference_index,
            entry_version,
            channel_count,
            sample_size,
            sample_rate,
            qt_extension,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.sample_rate > u16::MAX as u32 {
            return Err(Error::precondition(format!(
                "sample rate {} does not fit the 16.16 samplerate field",
                self.sample_rate
            )));
        }
        buf.put_zeros(6);
        buf.put_u16(self.data_reference_index);
        buf.put_u16(self.entry_version);
        buf.put_zeros(6);
        buf.put_u16(self.channel_count);
        buf.put_u16(self.sample_size);
        buf.put_zeros(4);
        buf.put_u32(self.sample_rate << 16);
        buf.put_bytes(&self.qt_extension);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColourInfo {
    Nclx {
        colour_primaries: u16,
        transfer_characteristics: u16,
        matrix_coefficients: u16,
        full_range: bool,
    },
    Nclc {
        colour_primaries: u16,
        transfer_characteristics: u16,
        matrix_coefficients: u16,
    },
    /// rICC / prof: an ICC profile.
    Icc(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColrBox {
    pub colour_type: FourCC,
    pub info: ColourInfo,
}

impl ColrBox {
    pub fn nclx(primaries: u16, transfer: u16, matrix: u16, full_range: bool) -> Self {
        Self {
            colour_type: FourCC(*b"nclx"),
            info: ColourInfo::Nclx {
                colour_primaries: primaries,
                transfer_characteristics: transfer,
                matrix_coefficients: matrix,
                full_range,
            },
        }
    }
}

impl BoxCodec for ColrBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let colour_type = r.read_fourcc("colour_type")?;
        let info = match &colour_type.0 {
            b"nclx" => ColourInfo::Nclx {
                colour_primaries: r.read_u16("colour_primaries")?,
                transfer_characteristics: r.read_u16("transfer_characteristics")?,
                matrix_coefficients: r.read_u16("matrix_coefficients")?,
                full_range: r.read_u8("full_range_flag")? & 0x80 != 0,
            },
            b"nclc" => ColourInfo::Nclc {
                colour_primaries: r.read_u16("colour_primaries")?,
                transfer_characteristics: r.read_u16("transfer_characteristics")?,
                matrix_coefficients: r.read_u16("matrix_coefficients")?,
            },
            _ => ColourInfo::Icc(r.read_to_end().to_vec()),
        };
        Ok(Self { colour_type, info })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_fourcc(self.colour_type);
        match &self.info {
            ColourInfo::Nclx {
                colour_primaries,
                transfer_characteristics,
                matrix_coefficients,
                full_range,
            } => {
                buf.put_u16(*colour_primaries);
                buf.put_u16(*transfer_characteristics);
                buf.put_u16(*matrix_coefficients);
                buf.put_u8((*full_range as u8) << 7);
            }
            ColourInfo::Nclc {
                colour_primaries,
                transfer_characteristics,
                matrix_coefficients,
            } => {
                buf.put_u16(*colour_primaries);
                buf.put_u16(*transfer_characteristics);
                buf.put_u16(*matrix_coefficients);
            }
            ColourInfo::Icc(profile) => buf.put_bytes(profile),
        }
        Ok(())
    }
}

/// `jpvi`: JPEG XS video information.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JpviBox {
    pub brat: u32,
    pub frat: u32,
    pub schar: u16,
    pub tcod: u32,
}

impl BoxCodec for JpviBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        Ok(Self {
            brat: r.read_u32("jpvi brat")?,
            frat: r.read_u32("jpvi frat")?,
            schar: r.read_u16("jpvi schar")?,
            tcod: r.read_u32("jpvi tcod")?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u32(self.brat);
        buf.put_u32(self.frat);
        buf.put_u16(self.schar);
        buf.put_u32(self.tcod);
        Ok(())
    }
}

/// `jxpl`: JPEG XS profile and level.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JxplBox {
    pub ppih: u16,
    pub plev: u16,
}

impl BoxCodec for JxplBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        Ok(Self {
            ppih: r.read_u16("jxpl ppih")?,
            plev: r.read_u16("jxpl plev")?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u16(self.ppih);
        buf.put_u16(self.plev);
        Ok(())
    }
}

/// `mhaP`: MPEG-H 3D audio compatible profile-level sets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MhapBox {
    pub compatible_sets: Vec<u8>,
}

impl BoxCodec for MhapBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        let n = r.read_u8("mhaP numCompatibleSets")?;
        Ok(Self {
            compatible_sets: r.read_bytes(n as usize, "mhaP compatibleSetIndication")?.to_vec(),
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.compatible_sets.len() > u8::MAX as usize {
            return Err(Error::precondition("mhaP holds at most 255 compatible sets"));
        }
        buf.put_u8(self.compatible_sets.len() as u8);
        buf.put_bytes(&self.compatible_sets);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BtrtBox {
    pub buffer_size_db: u32,
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
}

impl BoxCodec for BtrtBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        Ok(Self {
            buffer_size_db: r.read_u32("btrt bufferSizeDB")?,
            max_bitrate: r.read_u32("btrt maxBitrate")?,
            avg_bitrate: r.read_u32("btrt avgBitrate")?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u32(self.buffer_size_db);
        buf.put_u32(self.max_bitrate);
        buf.put_u32(self.avg_bitrate);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaspBox {
    pub h_spacing: u32,
    pub v_spacing: u32,
}

impl Default for PaspBox {
    fn default() -> Self {
        Self {
            h_spacing: 1,
            v_spacing: 1,
        }
    }
}

impl BoxCodec for PaspBox {
    fn parse(r: &mut ByteReader<'_>, _typ: FourCC, _diag: &mut Diagnostics) -> Result<Self> {
        Ok(Self {
            h_spacing: r.read_u32("pasp hSpacing")?,
            v_spacing: r.read_u32("pasp vSpacing")?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u32(self.h_spacing);
        buf.put_u32(self.v_spacing);
        Ok(())
    }
}
