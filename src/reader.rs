//! File/buffer reader: owns the parsed tree and the per-track sample tables,
//! and hands out sample readers with their own input handles.

use crate::boxes::{ElstBox, ElstEntry, FourCC, FtypBox, MvhdBox, TkhdBox};
use crate::error::{Diagnostics, Error, Result};
use crate::extractor::{SampleInfo, TRAK, TrackSampleTable, extract_tracks};
use crate::registry::default_registry;
use crate::track_reader::TrackReader;
use crate::tree::{MOOV, Mp4Box, Mp4Type, ParseOptions, classify, read_top_level};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where sample bytes are read from. Cloning yields a source that opens its
/// own handle.
#[derive(Debug, Clone)]
pub enum InputSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// An open, positioned input.
pub enum Input {
    File(File),
    Memory(Cursor<Arc<[u8]>>),
}

impl InputSource {
    pub fn open(&self) -> Result<Input> {
        Ok(match self {
            InputSource::File(p) => Input::File(File::open(p)?),
            InputSource::Memory(data) => Input::Memory(Cursor::new(Arc::clone(data))),
        })
    }
}

impl Input {
    /// Reads exactly `len` bytes at `offset` into `buf`, replacing its contents.
    pub fn read_at(&mut self, offset: u64, len: usize, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        buf.resize(len, 0);
        match self {
            Input::File(f) => {
                f.seek(SeekFrom::Start(offset))?;
                f.read_exact(buf)?;
            }
            Input::Memory(c) => {
                c.seek(SeekFrom::Start(offset))?;
                c.read_exact(buf)?;
            }
        }
        Ok(())
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Input::File(f) => f.read(buf),
            Input::Memory(c) => c.read(buf),
        }
    }
}

impl Seek for Input {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            Input::File(f) => f.seek(pos),
            Input::Memory(c) => c.seek(pos),
        }
    }
}

#[derive(Debug)]
struct Parsed {
    tree: Vec<Mp4Box>,
    tables: Vec<TrackSampleTable>,
    diagnostics: Diagnostics,
}

/// Summary of one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub track_id: u32,
    pub handler: FourCC,
    pub coding_name: FourCC,
    pub timescale: u32,
    pub sample_count: usize,
    pub duration: u64,
}

/// Parsed MP4 input.
///
/// Parsing and sample extraction happen once, at construction. The parsed state
/// is shared between clones; every clone and every sample reader opens its own
/// input handle.
#[derive(Debug, Clone)]
pub struct Mp4Reader {
    source: InputSource,
    parsed: Arc<Parsed>,
}

impl Mp4Reader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let source = InputSource::File(path.clone());
        let mut input = source.open()?;
        tracing::debug!(path = %path.display(), "opening mp4");
        Self::build(source, &mut input)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let source = InputSource::Memory(Arc::from(data));
        let mut input = source.open()?;
        Self::build(source, &mut input)
    }

    fn build(source: InputSource, input: &mut Input) -> Result<Self> {
        let mut diagnostics = Diagnostics::new();
        let tree = read_top_level(
            input,
            default_registry(),
            ParseOptions::default(),
            &mut diagnostics,
        )?;
        let tables = extract_tracks(&tree, &mut diagnostics)?;
        Ok(Self {
            source,
            parsed: Arc::new(Parsed {
                tree,
                tables,
                diagnostics,
            }),
        })
    }

    /// A reader sharing the parsed state with an independent input handle.
    pub fn try_clone(&self) -> Result<Self> {
        // Opening once up front surfaces a vanished file here rather than later.
        self.source.open()?;
        Ok(self.clone())
    }

    pub fn source(&self) -> &InputSource {
        &self.source
    }

    /// Top-level boxes.
    pub fn tree(&self) -> &[Mp4Box] {
        &self.parsed.tree
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.parsed.diagnostics
    }

    pub fn moov(&self) -> Option<&Mp4Box> {
        self.tree().iter().find(|b| b.typ == MOOV)
    }

    pub fn mp4_type(&self) -> Mp4Type {
        classify(self.tree().iter().map(|b| b.typ))
    }

    pub fn track_count(&self) -> usize {
        self.parsed.tables.len()
    }

    pub fn track_ids(&self) -> Vec<u32> {
        self.parsed.tables.iter().map(|t| t.track_id).collect()
    }

    pub fn tables(&self) -> &[TrackSampleTable] {
        &self.parsed.tables
    }

    pub fn table(&self, track_id: u32) -> Option<&TrackSampleTable> {
        self.parsed.tables.iter().find(|t| t.track_id == track_id)
    }

    pub fn track_info(&self, track_id: u32) -> Option<TrackInfo> {
        self.table(track_id).map(|t| TrackInfo {
            track_id: t.track_id,
            handler: t.handler,
            coding_name: t.coding_name,
            timescale: t.timescale,
            sample_count: t.samples.len(),
            duration: t.duration(),
        })
    }

    pub fn trak(&self, track_id: u32) -> Option<&Mp4Box> {
        self.moov()?.children_of(TRAK).find(|t| {
            t.child_body::<TkhdBox>(FourCC(*b"tkhd"))
                .is_some_and(|h| h.track_id == track_id)
        })
    }

    pub fn movie_timescale(&self) -> Option<u32> {
        self.moov()?
            .child_body::<MvhdBox>(FourCC(*b"mvhd"))
            .map(|m| m.timescale)
    }

    fn ftyp(&self) -> Option<&FtypBox> {
        self.tree()
            .iter()
            .find(|b| b.typ == FourCC(*b"ftyp") || b.typ == FourCC(*b"styp"))
            .and_then(|b| b.get::<FtypBox>())
    }

    pub fn major_brand(&self) -> Option<FourCC> {
        self.ftyp().map(|f| f.major_brand)
    }

    pub fn compatible_brands(&self) -> Vec<FourCC> {
        self.ftyp()
            .map(|f| f.compatible_brands.clone())
            .unwrap_or_default()
    }

    /// Edit list entries of a track, empty when it has none.
    pub fn edit_list(&self, track_id: u32) -> Vec<ElstEntry> {
        self.trak(track_id)
            .and_then(|t| t.find_path(&[FourCC(*b"edts"), FourCC(*b"elst")]))
            .and_then(|b| b.get::<ElstBox>())
            .map(|e| e.entries.clone())
            .unwrap_or_default()
    }

    /// Serialized boxes found in `moov/udta`, one buffer per box.
    pub fn user_data(&self) -> Result<Vec<Vec<u8>>> {
        let Some(udta) = self.moov().and_then(|m| m.child(FourCC(*b"udta"))) else {
            return Ok(Vec::new());
        };
        udta.children
            .iter()
            .map(|c| c.clone().to_bytes())
            .collect()
    }

    pub fn sample_reader(&self, track_id: u32) -> Result<SampleReader<'_>> {
        let table = self
            .table(track_id)
            .ok_or_else(|| Error::precondition(format!("no track with id {track_id}")))?;
        SampleReader::new(table, self.source.open()?)
    }

    pub fn track_reader(&self, track_id: u32) -> Result<TrackReader<'_>> {
        TrackReader::new(self, track_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeekMode {
    /// Whichever neighbouring sync sample is closer; ties go to the earlier.
    #[default]
    NearestSyncSample,
    /// First sync sample at or after the requested time.
    NextSyncSampleGreater,
    /// Last sync sample at or before the requested time.
    LastSyncSampleSmaller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekConfig {
    pub timestamp: u64,
    /// Units of `timestamp`; must be non-zero.
    pub timescale: u32,
    pub mode: SeekMode,
}

impl SeekConfig {
    pub fn new(timestamp: u64, timescale: u32, mode: SeekMode) -> Self {
        Self {
            timestamp,
            timescale,
            mode,
        }
    }
}

/// A sample as delivered to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub index: usize,
    pub data: Vec<u8>,
    /// Presentation time in track timescale; `None` when it would be negative.
    pub pts: Option<u64>,
    pub info: SampleInfo,
}

/// Result of resolving a seek without reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekTarget {
    pub index: usize,
    pub pts: Option<u64>,
}

/// Picks the sample index a seek lands on. `start_times[i]` is the
/// accumulated duration before sample `i`.
pub fn resolve_seek_index(
    start_times: impl IntoIterator<Item = u64>,
    sync: &[bool],
    time: u64,
    mode: SeekMode,
) -> Option<usize> {
    let n = sync.len();
    if n == 0 {
        return None;
    }
    let requested = start_times
        .into_iter()
        .take(n)
        .position(|t| t >= time)
        .unwrap_or(n - 1);

    let mut s = None;
    let mut s_prev = None;
    for (i, &is_sync) in sync.iter().enumerate() {
        if !is_sync {
            continue;
        }
        s_prev = s;
        s = Some(i);
        if i >= requested {
            break;
        }
    }
    let Some(s) = s else {
        tracing::warn!("track has no sync samples; seeking to sample {requested}");
        return Some(requested);
    };
    let s_prev = s_prev.unwrap_or(s);

    Some(match mode {
        SeekMode::NearestSyncSample => {
            if requested.abs_diff(s) < requested.abs_diff(s_prev) {
                s
            } else {
                s_prev
            }
        }
        SeekMode::NextSyncSampleGreater => {
            if requested <= s_prev {
                s_prev
            } else {
                s
            }
        }
        SeekMode::LastSyncSampleSmaller => {
            if requested >= s {
                s
            } else {
                s_prev
            }
        }
    })
}

/// Sequential and random access over one track's samples.
pub struct SampleReader<'r> {
    table: &'r TrackSampleTable,
    input: Input,
    cursor: usize,
    max_sample_size: u32,
    diagnostics: Diagnostics,
}

impl<'r> SampleReader<'r> {
    pub fn new(table: &'r TrackSampleTable, input: Input) -> Result<Self> {
        Ok(Self {
            table,
            input,
            cursor: 0,
            max_sample_size: table.max_sample_size(),
            diagnostics: Diagnostics::new(),
        })
    }

    pub fn table(&self) -> &'r TrackSampleTable {
        self.table
    }

    pub fn sample_count(&self) -> usize {
        self.table.samples.len()
    }

    /// Largest sample in the track, for callers sizing a reusable buffer.
    pub fn max_sample_size(&self) -> u32 {
        self.max_sample_size
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    fn pts_of(&mut self, info: &SampleInfo, index: usize) -> Option<u64> {
        let pts = info.pts();
        if pts.is_none() {
            self.diagnostics.error(format!(
                "track {} sample {index}: negative presentation time (dts {} + cts {})",
                self.table.track_id, info.dts, info.cts_offset
            ));
        }
        pts
    }

    /// Returns the sample at the cursor and advances; `None` at end of track.
    pub fn next_sample(&mut self, preallocate: bool) -> Result<Option<Sample>> {
        let table = self.table;
        let index = self.cursor;
        let Some(info) = table.samples.get(index) else {
            return Ok(None);
        };
        let mut data = if preallocate {
            Vec::with_capacity(self.max_sample_size as usize)
        } else {
            Vec::new()
        };
        self.input.read_at(info.offset, info.size as usize, &mut data)?;
        let pts = self.pts_of(info, index);
        self.cursor += 1;
        Ok(Some(Sample {
            index,
            data,
            pts,
            info: info.clone(),
        }))
    }

    pub fn sample_by_index(&mut self, index: usize, preallocate: bool) -> Result<Option<Sample>> {
        if index >= self.sample_count() {
            return Err(Error::precondition(format!(
                "sample index {index} out of range for {} samples",
                self.sample_count()
            )));
        }
        self.cursor = index;
        self.next_sample(preallocate)
    }

    /// Computes the sample a seek would land on, without moving the cursor.
    pub fn resolve_timestamp(&mut self, cfg: &SeekConfig) -> Result<SeekTarget> {
        if cfg.timescale == 0 {
            return Err(Error::precondition("seek timescale must be non-zero"));
        }
        if self.table.samples.is_empty() {
            return Err(Error::precondition(format!(
                "cannot seek in track {}: it has no samples",
                self.table.track_id
            )));
        }
        let time =
            (cfg.timestamp as u128 * self.table.timescale as u128 / cfg.timescale as u128) as u64;
        let starts = self.table.samples.iter().scan(0u64, |acc, s| {
            let start = *acc;
            *acc += s.duration as u64;
            Some(start)
        });
        let sync: Vec<bool> = self.table.samples.iter().map(|s| s.is_sync).collect();
        let index = resolve_seek_index(starts, &sync, time, cfg.mode)
            .ok_or_else(|| Error::precondition("seek on an empty track"))?;
        let table = self.table;
        let pts = self.pts_of(&table.samples[index], index);
        Ok(SeekTarget { index, pts })
    }

    pub fn sample_by_timestamp(
        &mut self,
        cfg: &SeekConfig,
        preallocate: bool,
    ) -> Result<Option<Sample>> {
        let target = self.resolve_timestamp(cfg)?;
        self.sample_by_index(target.index, preallocate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syncs_every_ten(n: usize) -> Vec<bool> {
        (0..n).map(|i| i % 10 == 0).collect()
    }

    fn resolve(time: u64, mode: SeekMode) -> usize {
        let sync = syncs_every_ten(40);
        resolve_seek_index(0..40u64, &sync, time, mode).unwrap()
    }

    #[test]
    fn seek_policies_at_14() {
        assert_eq!(resolve(14, SeekMode::NearestSyncSample), 10);
        assert_eq!(resolve(14, SeekMode::NextSyncSampleGreater), 20);
        assert_eq!(resolve(14, SeekMode::LastSyncSampleSmaller), 10);
    }

    #[test]
    fn seek_policies_at_25() {
        assert_eq!(resolve(25, SeekMode::NextSyncSampleGreater), 30);
        assert_eq!(resolve(25, SeekMode::LastSyncSampleSmaller), 20);
        assert_eq!(resolve(25, SeekMode::NearestSyncSample), 20);
    }

    #[test]
    fn seek_on_sync_sample_stays() {
        for mode in [
            SeekMode::NearestSyncSample,
            SeekMode::NextSyncSampleGreater,
            SeekMode::LastSyncSampleSmaller,
        ] {
            assert_eq!(resolve(20, mode), 20);
        }
    }

    #[test]
    fn seek_past_end_uses_last_sync() {
        assert_eq!(resolve(1000, SeekMode::NextSyncSampleGreater), 30);
        assert_eq!(resolve(1000, SeekMode::LastSyncSampleSmaller), 30);
    }

    #[test]
    fn seek_without_sync_samples() {
        let sync = vec![false; 5];
        assert_eq!(
            resolve_seek_index(0..5u64, &sync, 3, SeekMode::NearestSyncSample),
            Some(3)
        );
        assert_eq!(resolve_seek_index(0..0u64, &[], 3, SeekMode::NearestSyncSample), None);
    }
}
