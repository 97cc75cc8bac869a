//! Write-side configuration: movie level, per track, per codec.

use crate::boxes::sample_entry::{
    AVC1, AVC3, HEV1, HVC1, JXSM, MHA1, MHA2, MHM1, MHM2, MP4A, VVC1, VVI1,
};
use crate::boxes::{
    AudioSampleEntry, ColrBox, ElstEntry, FourCC, JpviBox, JxplBox, MhapBox, SampleGroupDescription,
    VisualSampleEntry,
};
use crate::error::{Error, Result};
use crate::tree::Mp4Box;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const VIDE: FourCC = FourCC(*b"vide");
pub const SOUN: FourCC = FourCC(*b"soun");

/// Interleaving granularity, in milliseconds of movie time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub duration_ms: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { duration_ms: 1000 }
    }
}

/// Requests a segment index written ahead of the fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SidxConfig {
    /// Track whose timeline the index follows; the first track when unset.
    pub reference_track_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IodsConfig {
    pub audio_profile_level: u8,
    pub visual_profile_level: u8,
}

impl Default for IodsConfig {
    fn default() -> Self {
        // 0xFF: no capability required
        Self {
            audio_profile_level: 0xFF,
            visual_profile_level: 0xFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieConfig {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCC>,
    pub timescale: u32,
    /// Seconds since 1904-01-01, written to every header box.
    pub creation_time: u64,
    pub sidx: Option<SidxConfig>,
    pub iods: Option<IodsConfig>,
    /// Complete serialized boxes to place under `moov/udta`.
    pub user_data: Vec<Vec<u8>>,
    pub chunk: ChunkConfig,
}

impl Default for MovieConfig {
    fn default() -> Self {
        Self {
            major_brand: FourCC(*b"isom"),
            minor_version: 0,
            compatible_brands: vec![FourCC(*b"isom"), FourCC(*b"iso6"), FourCC(*b"mp41")],
            timescale: 1000,
            creation_time: 0,
            sidx: None,
            iods: None,
            user_data: Vec::new(),
            chunk: ChunkConfig::default(),
        }
    }
}

impl MovieConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timescale == 0 {
            return Err(Error::precondition("movie timescale must be non-zero"));
        }
        if self.chunk.duration_ms == 0 {
            return Err(Error::precondition("chunk duration must be non-zero"));
        }
        Ok(())
    }
}

/// avc1/avc3, hvc1/hev1, vvc1/vvi1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfig {
    pub coding_name: FourCC,
    pub width: u16,
    pub height: u16,
    /// Payload of the codec configuration box (avcC, hvcC, vvcC).
    pub config_record: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AacConfig {
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Payload of the esds box.
    pub esds: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpeghConfig {
    pub coding_name: FourCC,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// mhaC payload; mhm1/mhm2 may carry their configuration in band.
    pub config_record: Option<Vec<u8>>,
    pub compatible_sets: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NclxColour {
    pub primaries: u16,
    pub transfer: u16,
    pub matrix: u16,
    pub full_range: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JxsConfig {
    pub width: u16,
    pub height: u16,
    pub brat: u32,
    pub frat: u32,
    pub schar: u16,
    pub tcod: u32,
    pub ppih: u16,
    pub plev: u16,
    pub colour: Option<NclxColour>,
    /// jxsH payload.
    pub header: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaConfig {
    Avc(VideoConfig),
    Hevc(VideoConfig),
    Vvc(VideoConfig),
    Aac(AacConfig),
    Mpegh(MpeghConfig),
    Jxs(JxsConfig),
}

impl MediaConfig {
    pub fn coding_name(&self) -> FourCC {
        match self {
            MediaConfig::Avc(v) | MediaConfig::Hevc(v) | MediaConfig::Vvc(v) => v.coding_name,
            MediaConfig::Aac(_) => MP4A,
            MediaConfig::Mpegh(m) => m.coding_name,
            MediaConfig::Jxs(_) => JXSM,
        }
    }

    pub fn handler(&self) -> FourCC {
        if self.is_video() { VIDE } else { SOUN }
    }

    pub fn is_video(&self) -> bool {
        matches!(
            self,
            MediaConfig::Avc(_) | MediaConfig::Hevc(_) | MediaConfig::Vvc(_) | MediaConfig::Jxs(_)
        )
    }

    pub fn dimensions(&self) -> (u16, u16) {
        match self {
            MediaConfig::Avc(v) | MediaConfig::Hevc(v) | MediaConfig::Vvc(v) => (v.width, v.height),
            MediaConfig::Jxs(j) => (j.width, j.height),
            _ => (0, 0),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let coding = self.coding_name();
        let allowed: &[FourCC] = match self {
            MediaConfig::Avc(_) => &[AVC1, AVC3],
            MediaConfig::Hevc(_) => &[HVC1, HEV1],
            MediaConfig::Vvc(_) => &[VVC1, VVI1],
            MediaConfig::Mpegh(_) => &[MHA1, MHA2, MHM1, MHM2],
            MediaConfig::Aac(_) | MediaConfig::Jxs(_) => return Ok(()),
        };
        if !allowed.contains(&coding) {
            return Err(Error::precondition(format!(
                "coding name '{coding}' does not match the media configuration"
            )));
        }
        if let MediaConfig::Mpegh(m) = self {
            if m.config_record.is_none() && (coding == MHA1 || coding == MHA2) {
                return Err(Error::precondition(format!("'{coding}' requires an mhaC record")));
            }
        }
        Ok(())
    }

    /// The stsd child describing this media.
    pub fn sample_entry(&self) -> Mp4Box {
        let coding = self.coding_name();
        match self {
            MediaConfig::Avc(v) | MediaConfig::Hevc(v) | MediaConfig::Vvc(v) => {
                let record = match self {
                    MediaConfig::Avc(_) => FourCC(*b"avcC"),
                    MediaConfig::Hevc(_) => FourCC(*b"hvcC"),
                    _ => FourCC(*b"vvcC"),
                };
                Mp4Box::new(coding, VisualSampleEntry::new(v.width, v.height))
                    .with_child(Mp4Box::new(record, v.config_record.clone()))
            }
            MediaConfig::Aac(a) => Mp4Box::new(coding, AudioSampleEntry::new(a.sample_rate, a.channel_count))
                .with_child(Mp4Box::new(FourCC(*b"esds"), a.esds.clone())),
            MediaConfig::Mpegh(m) => {
                let mut entry =
                    Mp4Box::new(coding, AudioSampleEntry::new(m.sample_rate, m.channel_count));
                if let Some(record) = &m.config_record {
                    entry.push_child(Mp4Box::new(FourCC(*b"mhaC"), record.clone()));
                }
                if !m.compatible_sets.is_empty() {
                    entry.push_child(Mp4Box::new(
                        FourCC(*b"mhaP"),
                        MhapBox {
                            compatible_sets: m.compatible_sets.clone(),
                        },
                    ));
                }
                entry
            }
            MediaConfig::Jxs(j) => {
                let mut entry = Mp4Box::new(coding, VisualSampleEntry::new(j.width, j.height))
                    .with_child(Mp4Box::new(
                        FourCC(*b"jpvi"),
                        JpviBox {
                            brat: j.brat,
                            frat: j.frat,
                            schar: j.schar,
                            tcod: j.tcod,
                        },
                    ))
                    .with_child(Mp4Box::new(
                        FourCC(*b"jxpl"),
                        JxplBox {
                            ppih: j.ppih,
                            plev: j.plev,
                        },
                    ));
                if let Some(c) = j.colour {
                    entry.push_child(Mp4Box::new(
                        FourCC(*b"colr"),
                        ColrBox::nclx(c.primaries, c.transfer, c.matrix, c.full_range),
                    ));
                }
                if !j.header.is_empty() {
                    entry.push_child(Mp4Box::new(FourCC(*b"jxsH"), j.header.clone()));
                }
                entry
            }
        }
    }
}

/// A sample group every sample belongs to unless it says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultSampleGroup {
    pub grouping_type: FourCC,
    pub description: SampleGroupDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Assigned by the writer when unset.
    pub track_id: Option<u32>,
    pub timescale: u32,
    pub language: String,
    pub media: MediaConfig,
    /// Segment durations in movie timescale, media times in track timescale.
    pub edit_list: Vec<ElstEntry>,
    pub default_sample_group: Option<DefaultSampleGroup>,
}

impl TrackConfig {
    pub fn new(timescale: u32, media: MediaConfig) -> Self {
        Self {
            track_id: None,
            timescale,
            language: "und".to_string(),
            media,
            edit_list: Vec::new(),
            default_sample_group: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timescale == 0 {
            return Err(Error::precondition("track timescale must be non-zero"));
        }
        if self.track_id == Some(0) {
            return Err(Error::precondition("track id 0 is reserved"));
        }
        if self.language.len() != 3 || !self.language.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(Error::precondition(format!(
                "language '{}' is not an ISO-639-2/T code",
                self.language
            )));
        }
        self.media.validate()
    }
}

/// Output location for file based writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub path: PathBuf,
    /// Where intermediate sample data is spilled; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
}

impl OutputConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            temp_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avc() -> MediaConfig {
        MediaConfig::Avc(VideoConfig {
            coding_name: AVC1,
            width: 640,
            height: 480,
            config_record: vec![1, 0x64, 0, 0x1f, 0xff],
        })
    }

    #[test]
    fn track_config_validation() {
        let mut cfg = TrackConfig::new(90000, avc());
        assert!(cfg.validate().is_ok());
        cfg.language = "EN".into();
        assert!(cfg.validate().is_err());
        cfg.language = "eng".into();
        cfg.timescale = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn coding_name_must_match_family() {
        let bad = MediaConfig::Hevc(VideoConfig {
            coding_name: AVC1,
            width: 1,
            height: 1,
            config_record: Vec::new(),
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn sample_entry_carries_config_record() {
        let entry = avc().sample_entry();
        assert_eq!(entry.typ, AVC1);
        assert_eq!(
            entry.child_body::<Vec<u8>>(FourCC(*b"avcC")),
            Some(&vec![1, 0x64, 0, 0x1f, 0xff])
        );
    }

    #[test]
    fn movie_config_from_json() {
        let cfg: MovieConfig = serde_json::from_str(
            r#"{"major_brand":"mp42","minor_version":0,"compatible_brands":["isom"],
                "timescale":600,"creation_time":0,"sidx":null,"iods":null,
                "user_data":[],"chunk":{"duration_ms":500}}"#,
        )
        .unwrap();
        assert_eq!(cfg.major_brand, FourCC(*b"mp42"));
        assert_eq!(cfg.chunk.duration_ms, 500);
        assert!(cfg.validate().is_ok());
    }
}
