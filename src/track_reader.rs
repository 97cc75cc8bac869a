//! Codec-aware views over one track of an [`Mp4Reader`].
//!
//! A [`TrackReader`] borrows the reader it came from, so it cannot outlive the
//! parsed state. Each track reader owns its own input handle.

use crate::boxes::sample_entry::{
    AUDIO_ENTRIES, AVC1, AVC3, HEV1, HVC1, JXSM, MHA1, MHA2, MHM1, MHM2, VISUAL_ENTRIES, VVC1,
    VVI1,
};
use crate::boxes::{
    AudioSampleEntry, BodyRef, ColrBox, FourCC, JpviBox, JxplBox, MhapBox, VisualSampleEntry,
};
use crate::error::{Error, Result};
use crate::extractor::{MDIA, MINF, STBL, STSD, TrackSampleTable};
use crate::reader::{Mp4Reader, Sample, SampleReader, SeekConfig, SeekTarget};
use crate::tree::Mp4Box;
use std::ops::{Deref, DerefMut, Range};

/// Codec configuration boxes carried as opaque payloads inside sample entries.
pub const CONFIG_RECORDS: [FourCC; 6] = [
    FourCC(*b"avcC"),
    FourCC(*b"hvcC"),
    FourCC(*b"vvcC"),
    FourCC(*b"mhaC"),
    FourCC(*b"esds"),
    FourCC(*b"jxsH"),
];

pub struct TrackReader<'r> {
    reader: &'r Mp4Reader,
    trak: &'r Mp4Box,
    samples: SampleReader<'r>,
}

impl<'r> TrackReader<'r> {
    pub fn new(reader: &'r Mp4Reader, track_id: u32) -> Result<Self> {
        let trak = reader
            .trak(track_id)
            .ok_or_else(|| Error::precondition(format!("no track with id {track_id}")))?;
        Ok(Self {
            reader,
            trak,
            samples: reader.sample_reader(track_id)?,
        })
    }

    pub fn reader(&self) -> &'r Mp4Reader {
        self.reader
    }

    pub fn trak(&self) -> &'r Mp4Box {
        self.trak
    }

    pub fn table(&self) -> &'r TrackSampleTable {
        self.samples.table()
    }

    pub fn track_id(&self) -> u32 {
        self.table().track_id
    }

    pub fn timescale(&self) -> u32 {
        self.table().timescale
    }

    pub fn handler(&self) -> FourCC {
        self.table().handler
    }

    pub fn coding_name(&self) -> FourCC {
        self.table().coding_name
    }

    pub fn sample_count(&self) -> usize {
        self.samples.sample_count()
    }

    pub fn max_sample_size(&self) -> u32 {
        self.samples.max_sample_size()
    }

    /// First sample entry of the track's stsd.
    pub fn sample_entry(&self) -> Option<&'r Mp4Box> {
        self.trak
            .find_path(&[MDIA, MINF, STBL, STSD])
            .and_then(|stsd| stsd.children.first())
    }

    /// Typed payload of a box directly under the sample entry.
    pub fn entry_child<T: BodyRef>(&self, typ: FourCC) -> Option<&'r T> {
        self.sample_entry()?.child_body::<T>(typ)
    }

    /// Raw decoder configuration record (avcC, hvcC, ...), without box header.
    pub fn decoder_config_record(&self) -> Option<&'r [u8]> {
        let entry = self.sample_entry()?;
        CONFIG_RECORDS
            .iter()
            .find_map(|t| entry.child_body::<Vec<u8>>(*t))
            .map(Vec::as_slice)
    }

    pub fn next_sample(&mut self, preallocate: bool) -> Result<Option<Sample>> {
        self.samples.next_sample(preallocate)
    }

    pub fn sample_by_index(&mut self, index: usize, preallocate: bool) -> Result<Option<Sample>> {
        self.samples.sample_by_index(index, preallocate)
    }

    pub fn sample_by_timestamp(
        &mut self,
        cfg: &SeekConfig,
        preallocate: bool,
    ) -> Result<Option<Sample>> {
        self.samples.sample_by_timestamp(cfg, preallocate)
    }

    pub fn resolve_timestamp(&mut self, cfg: &SeekConfig) -> Result<SeekTarget> {
        self.samples.resolve_timestamp(cfg)
    }

    pub fn sample_reader(&self) -> &SampleReader<'r> {
        &self.samples
    }

    fn expect_coding(&self, family: &[FourCC], what: &str) -> Result<()> {
        if family.contains(&self.coding_name()) {
            Ok(())
        } else {
            Err(Error::unsupported(format!(
                "track {} has coding '{}', not a {what} track",
                self.track_id(),
                self.coding_name()
            )))
        }
    }
}

/// Splits a length-prefixed NAL unit stream into unit ranges.
pub fn split_nalus(data: &[u8], length_size: u8) -> Result<Vec<Range<usize>>> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(Error::unsupported(format!("NALU length size {length_size}")));
    }
    let n = length_size as usize;
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let Some(prefix) = data.get(pos..pos + n) else {
            return Err(Error::malformed(format!(
                "truncated NALU length prefix at {pos} of {}",
                data.len()
            )));
        };
        let len = prefix.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
        let start = pos + n;
        let end = start + len;
        if end > data.len() {
            return Err(Error::malformed(format!(
                "NALU of {len} bytes at {start} overruns sample of {}",
                data.len()
            )));
        }
        out.push(start..end);
        pos = end;
    }
    Ok(out)
}

/// A video sample with its NAL units located.
#[derive(Debug, Clone)]
pub struct VideoSample {
    pub sample: Sample,
    pub nalu_ranges: Vec<Range<usize>>,
}

impl VideoSample {
    pub fn nalus(&self) -> impl Iterator<Item = &[u8]> {
        self.nalu_ranges.iter().map(|r| &self.sample.data[r.clone()])
    }
}

pub struct VideoTrackReader<'r> {
    inner: TrackReader<'r>,
}

impl<'r> VideoTrackReader<'r> {
    pub fn new(reader: &'r Mp4Reader, track_id: u32) -> Result<Self> {
        let inner = TrackReader::new(reader, track_id)?;
        inner.expect_coding(&VISUAL_ENTRIES, "video")?;
        Ok(Self { inner })
    }

    fn entry(&self) -> Option<&'r VisualSampleEntry> {
        self.inner.sample_entry()?.get()
    }

    pub fn width(&self) -> u16 {
        self.entry().map_or(0, |e| e.width)
    }

    pub fn height(&self) -> u16 {
        self.entry().map_or(0, |e| e.height)
    }

    /// Bytes per NALU length prefix, from the decoder configuration record.
    pub fn nalu_length_size(&self) -> Result<u8> {
        let coding = self.coding_name();
        let (typ, byte, shift) = match coding {
            c if c == AVC1 || c == AVC3 => (FourCC(*b"avcC"), 4, 0),
            c if c == HVC1 || c == HEV1 => (FourCC(*b"hvcC"), 21, 0),
            // vvcC is a full box; the record starts after version and flags
            c if c == VVC1 || c == VVI1 => (FourCC(*b"vvcC"), 4, 1),
            c => {
                return Err(Error::unsupported(format!(
                    "coding '{c}' does not carry NAL units"
                )));
            }
        };
        let record = self
            .inner
            .entry_child::<Vec<u8>>(typ)
            .ok_or_else(|| Error::malformed(format!("sample entry '{coding}' has no {typ}")))?;
        let b = record
            .get(byte)
            .ok_or_else(|| Error::malformed(format!("{typ} too short for length size")))?;
        Ok(((b >> shift) & 0x3) + 1)
    }

    pub fn next_video_sample(&mut self, preallocate: bool) -> Result<Option<VideoSample>> {
        let length_size = self.nalu_length_size()?;
        let Some(sample) = self.inner.next_sample(preallocate)? else {
            return Ok(None);
        };
        let nalu_ranges = split_nalus(&sample.data, length_size)?;
        Ok(Some(VideoSample {
            sample,
            nalu_ranges,
        }))
    }
}

impl<'r> Deref for VideoTrackReader<'r> {
    type Target = TrackReader<'r>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for VideoTrackReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub struct AudioTrackReader<'r> {
    inner: TrackReader<'r>,
}

impl<'r> AudioTrackReader<'r> {
    pub fn new(reader: &'r Mp4Reader, track_id: u32) -> Result<Self> {
        let inner = TrackReader::new(reader, track_id)?;
        inner.expect_coding(&AUDIO_ENTRIES, "audio")?;
        Ok(Self { inner })
    }

    fn entry(&self) -> Option<&'r AudioSampleEntry> {
        self.inner.sample_entry()?.get()
    }

    pub fn sample_rate(&self) -> u32 {
        self.entry().map_or(0, |e| e.sample_rate)
    }

    pub fn channel_count(&self) -> u16 {
        self.entry().map_or(0, |e| e.channel_count)
    }

    pub fn sample_size(&self) -> u16 {
        self.entry().map_or(0, |e| e.sample_size)
    }
}

impl<'r> Deref for AudioTrackReader<'r> {
    type Target = TrackReader<'r>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for AudioTrackReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// MPEG-H 3D audio (mha1/mha2/mhm1/mhm2).
pub struct MpeghTrackReader<'r> {
    audio: AudioTrackReader<'r>,
}

impl<'r> MpeghTrackReader<'r> {
    pub fn new(reader: &'r Mp4Reader, track_id: u32) -> Result<Self> {
        let audio = AudioTrackReader::new(reader, track_id)?;
        audio.expect_coding(&[MHA1, MHA2, MHM1, MHM2], "MPEG-H")?;
        Ok(Self { audio })
    }

    /// mhm1/mhm2 carry their configuration in-band.
    pub fn is_mhm(&self) -> bool {
        matches!(self.coding_name(), c if c == MHM1 || c == MHM2)
    }

    fn mhac(&self) -> Option<&'r [u8]> {
        self.audio
            .entry_child::<Vec<u8>>(FourCC(*b"mhaC"))
            .map(Vec::as_slice)
    }

    pub fn profile_level_indication(&self) -> Option<u8> {
        self.mhac()?.get(1).copied()
    }

    pub fn reference_channel_layout(&self) -> Option<u8> {
        self.mhac()?.get(2).copied()
    }

    /// Compatible profile/level sets from mhaP, empty when absent.
    pub fn compatible_profile_levels(&self) -> &'r [u8] {
        self.audio
            .entry_child::<MhapBox>(FourCC(*b"mhaP"))
            .map_or(&[], |m| m.compatible_sets.as_slice())
    }
}

impl<'r> Deref for MpeghTrackReader<'r> {
    type Target = AudioTrackReader<'r>;

    fn deref(&self) -> &Self::Target {
        &self.audio
    }
}

impl DerefMut for MpeghTrackReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.audio
    }
}

/// JPEG XS (jxsm).
pub struct JxsTrackReader<'r> {
    video: VideoTrackReader<'r>,
}

impl<'r> JxsTrackReader<'r> {
    pub fn new(reader: &'r Mp4Reader, track_id: u32) -> Result<Self> {
        let video = VideoTrackReader::new(reader, track_id)?;
        video.expect_coding(&[JXSM], "JPEG XS")?;
        Ok(Self { video })
    }

    pub fn jpvi(&self) -> Option<&'r JpviBox> {
        self.video.entry_child(FourCC(*b"jpvi"))
    }

    pub fn jxpl(&self) -> Option<&'r JxplBox> {
        self.video.entry_child(FourCC(*b"jxpl"))
    }

    pub fn colr(&self) -> Option<&'r ColrBox> {
        self.video.entry_child(FourCC(*b"colr"))
    }

    pub fn bitrate(&self) -> Option<u32> {
        self.jpvi().map(|j| j.brat)
    }

    pub fn frame_rate(&self) -> Option<u32> {
        self.jpvi().map(|j| j.frat)
    }

    pub fn profile(&self) -> Option<u16> {
        self.jxpl().map(|j| j.ppih)
    }

    pub fn level(&self) -> Option<u16> {
        self.jxpl().map(|j| j.plev)
    }
}

impl<'r> Deref for JxsTrackReader<'r> {
    type Target = VideoTrackReader<'r>;

    fn deref(&self) -> &Self::Target {
        &self.video
    }
}

impl DerefMut for JxsTrackReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.video
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nalus_split_on_length_prefix() {
        let data = [0, 0, 0, 2, 0x65, 0x88, 0, 0, 0, 1, 0x06];
        let ranges = split_nalus(&data, 4).unwrap();
        assert_eq!(ranges, vec![4..6, 10..11]);
        let short = [0, 3, 1, 2];
        assert!(split_nalus(&short, 2).unwrap_err().is_malformed());
        assert!(split_nalus(&data, 3).is_err());
    }
}
