//! Moving tracks from a reader into a writer, re-deciding fragmentation on the
//! way.

use crate::boxes::sample_entry::{
    AVC1, AVC3, HEV1, HVC1, JXSM, MHA1, MHA2, MHM1, MHM2, MP4A, VVC1, VVI1,
};
use crate::boxes::{
    AudioSampleEntry, ColourInfo, ColrBox, ElstEntry, FourCC, JpviBox, JxplBox, MdhdBox, MhapBox,
    SampleGroupDescription, VisualSampleEntry,
};
use crate::error::{Diagnostics, Error, Result};
use crate::extractor::MDIA;
use crate::reader::Mp4Reader;
use crate::track_reader::TrackReader;
use crate::writer::tree_builder::rescale;
use crate::writer::{
    AacConfig, JxsConfig, MediaConfig, MpeghConfig, Mp4Writer, NclxColour, TrackConfig,
    VideoConfig, WriterSample,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// How samples are re-fragmented while copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Pass the source fragment numbers through.
    pub keep_fragment_number: bool,
    /// Start a new fragment once this much time has accumulated, in the track
    /// (media) timescale. Copies keep the track timescale, so the movie
    /// timescales below never apply to it. Zero disables.
    pub fragment_duration: u64,
    /// Start a new fragment at every sync sample. Takes precedence over
    /// `fragment_duration`.
    pub fragment_every_sync: bool,
    /// Warn instead of failing when a duration boundary lands on a non-sync
    /// sample.
    pub tolerate_non_sync_fragment_start: bool,
    /// Movie timescales of source and destination, for edit-list rebasing.
    pub old_movie_timescale: Option<u32>,
    pub new_movie_timescale: Option<u32>,
}

impl CopyConfig {
    /// Copies fragments one to one.
    pub fn keep_fragments() -> Self {
        Self {
            keep_fragment_number: true,
            ..Self::default()
        }
    }

    pub fn every_sync() -> Self {
        Self {
            fragment_every_sync: true,
            ..Self::default()
        }
    }

    pub fn every(duration: u64) -> Self {
        Self {
            fragment_duration: duration,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.keep_fragment_number && (self.fragment_duration > 0 || self.fragment_every_sync) {
            return Err(Error::precondition(
                "keeping fragment numbers excludes a fragment duration and fragmenting at sync samples",
            ));
        }
        if self.old_movie_timescale == Some(0) || self.new_movie_timescale == Some(0) {
            return Err(Error::precondition("movie timescale must be non-zero"));
        }
        Ok(())
    }

    /// True when the copy produces new fragment boundaries.
    pub fn refragments(&self) -> bool {
        self.fragment_every_sync || self.fragment_duration > 0
    }
}

/// Decides the fragment number of each copied sample.
#[derive(Debug)]
pub struct FragmentNumberPolicy {
    config: CopyConfig,
    current: u32,
    /// Duration since the last boundary.
    elapsed: u64,
    sample: usize,
}

impl FragmentNumberPolicy {
    pub fn new(config: CopyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            current: 1,
            elapsed: 0,
            sample: 0,
        })
    }

    /// Fragment number for the next sample in decode order.
    pub fn next(
        &mut self,
        source_fragment: u32,
        duration: u32,
        is_sync: bool,
        diag: &mut Diagnostics,
    ) -> Result<u32> {
        let index = self.sample;
        self.sample += 1;
        let c = &self.config;
        if c.keep_fragment_number {
            return Ok(source_fragment);
        }
        if !c.refragments() {
            return Ok(0);
        }
        if c.fragment_every_sync {
            if is_sync && self.elapsed > 0 {
                self.current += 1;
                self.elapsed = 0;
            }
        } else if self.elapsed >= c.fragment_duration {
            if !is_sync {
                if !c.tolerate_non_sync_fragment_start {
                    return Err(Error::precondition(format!(
                        "fragment boundary at sample {index} is not a sync sample"
                    )));
                }
                diag.warn(format!("fragment {} starts with non-sync sample {index}", self.current + 1));
            }
            self.current += 1;
            self.elapsed = 0;
        }
        self.elapsed += duration as u64;
        Ok(self.current)
    }
}

/// Outcome of one [`copy_track`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CopyReport {
    pub source_track_id: u32,
    pub track_id: u32,
    pub coding_name: Option<FourCC>,
    pub samples: usize,
    pub bytes: u64,
    /// Distinct fragment numbers written.
    pub fragments: usize,
    pub edit_list_dropped: bool,
    #[serde(skip)]
    pub diagnostics: Diagnostics,
}

/// Copies one track: its configuration, edit list and every sample.
pub fn copy_track(
    track: &mut TrackReader<'_>,
    writer: &mut dyn Mp4Writer,
    config: &CopyConfig,
) -> Result<CopyReport> {
    config.validate()?;
    let mut report = CopyReport {
        source_track_id: track.track_id(),
        coding_name: Some(track.coding_name()),
        ..CopyReport::default()
    };

    let mut track_config = TrackConfig::new(track.timescale(), media_config(track)?);
    track_config.language = track
        .trak()
        .find_path(&[MDIA, FourCC(*b"mdhd")])
        .and_then(|b| b.get::<MdhdBox>())
        .map(|m| m.language.clone())
        .filter(|l| l.len() == 3 && l.bytes().all(|b| b.is_ascii_lowercase()))
        .unwrap_or_else(|| "und".to_string());

    let edits = track.reader().edit_list(track.track_id());
    if !edits.is_empty() {
        if config.refragments() {
            warn!(
                track_id = track.track_id(),
                "dropping edit list: fragmented output does not carry edit lists"
            );
            report.diagnostics.warn("edit list dropped for fragmented output");
            report.edit_list_dropped = true;
        } else {
            track_config.edit_list = rescale_edits(&edits, config);
        }
    }

    report.track_id = writer.add_track(track_config)?;
    copy_samples(track, writer, report.track_id, config, &mut report)?;
    info!(
        source = report.source_track_id,
        track_id = report.track_id,
        samples = report.samples,
        fragments = report.fragments,
        "track copied"
    );
    Ok(report)
}

fn rescale_edits(edits: &[ElstEntry], config: &CopyConfig) -> Vec<ElstEntry> {
    match (config.old_movie_timescale, config.new_movie_timescale) {
        (Some(old), Some(new)) if old != new => edits
            .iter()
            .map(|e| ElstEntry {
                segment_duration: rescale(e.segment_duration, old, new),
                ..*e
            })
            .collect(),
        _ => edits.to_vec(),
    }
}

/// Feeds every remaining sample of `track` to `writer` under `track_id`,
/// applying the fragmentation policy.
pub fn copy_samples(
    track: &mut TrackReader<'_>,
    writer: &mut dyn Mp4Writer,
    track_id: u32,
    config: &CopyConfig,
    report: &mut CopyReport,
) -> Result<()> {
    let mut policy = FragmentNumberPolicy::new(*config)?;
    let mut fragments = BTreeSet::new();
    while let Some(sample) = track.next_sample(false)? {
        let info = &sample.info;
        let fragment_number =
            policy.next(info.fragment_number, info.duration, info.is_sync, &mut report.diagnostics)?;
        fragments.insert(fragment_number);
        let sample_groups: BTreeMap<FourCC, SampleGroupDescription> = info
            .sample_groups
            .iter()
            .filter_map(|(t, g)| g.description.clone().map(|d| (*t, d)))
            .collect();
        report.samples += 1;
        report.bytes += sample.data.len() as u64;
        writer.add_sample(
            track_id,
            WriterSample {
                duration: info.duration,
                cts_offset: info.cts_offset,
                is_sync: info.is_sync,
                fragment_number,
                sample_groups,
                data: sample.data,
            },
        )?;
    }
    report.fragments = fragments.len();
    Ok(())
}

/// Rebuilds the write-side media description from the source sample entry.
fn media_config(track: &TrackReader<'_>) -> Result<MediaConfig> {
    let coding = track.coding_name();
    let entry = track
        .sample_entry()
        .ok_or_else(|| Error::malformed(format!("track {} has no sample entry", track.track_id())))?;
    let record = || track.decoder_config_record().map(<[u8]>::to_vec).unwrap_or_default();
    let visual = || entry.get::<VisualSampleEntry>().map_or((0, 0), |v| (v.width, v.height));
    let audio = || {
        entry
            .get::<AudioSampleEntry>()
            .map_or((0, 0), |a| (a.sample_rate, a.channel_count))
    };

    let media = match coding {
        c if c == AVC1 || c == AVC3 || c == HVC1 || c == HEV1 || c == VVC1 || c == VVI1 => {
            let (width, height) = visual();
            let v = VideoConfig {
                coding_name: c,
                width,
                height,
                config_record: record(),
            };
            if c == AVC1 || c == AVC3 {
                MediaConfig::Avc(v)
            } else if c == HVC1 || c == HEV1 {
                MediaConfig::Hevc(v)
            } else {
                MediaConfig::Vvc(v)
            }
        }
        c if c == MP4A => {
            let (sample_rate, channel_count) = audio();
            MediaConfig::Aac(AacConfig {
                sample_rate,
                channel_count,
                esds: record(),
            })
        }
        c if c == MHA1 || c == MHA2 || c == MHM1 || c == MHM2 => {
            let (sample_rate, channel_count) = audio();
            MediaConfig::Mpegh(MpeghConfig {
                coding_name: c,
                sample_rate,
                channel_count,
                config_record: track.decoder_config_record().map(<[u8]>::to_vec),
                compatible_sets: track
                    .entry_child::<MhapBox>(FourCC(*b"mhaP"))
                    .map(|m| m.compatible_sets.clone())
                    .unwrap_or_default(),
            })
        }
        c if c == JXSM => {
            let (width, height) = visual();
            let jpvi = track.entry_child::<JpviBox>(FourCC(*b"jpvi"));
            let jxpl = track.entry_child::<JxplBox>(FourCC(*b"jxpl"));
            let colour = track
                .entry_child::<ColrBox>(FourCC(*b"colr"))
                .and_then(|c| match &c.info {
                    ColourInfo::Nclx {
                        colour_primaries,
                        transfer_characteristics,
                        matrix_coefficients,
                        full_range,
                    } => Some(NclxColour {
                        primaries: *colour_primaries,
                        transfer: *transfer_characteristics,
                        matrix: *matrix_coefficients,
                        full_range: *full_range,
                    }),
                    _ => None,
                });
            MediaConfig::Jxs(JxsConfig {
                width,
                height,
                brat: jpvi.map_or(0, |j| j.brat),
                frat: jpvi.map_or(0, |j| j.frat),
                schar: jpvi.map_or(0, |j| j.schar),
                tcod: jpvi.map_or(0, |j| j.tcod),
                ppih: jxpl.map_or(0, |j| j.ppih),
                plev: jxpl.map_or(0, |j| j.plev),
                colour,
                header: record(),
            })
        }
        other => {
            return Err(Error::unsupported(format!(
                "copying '{other}' tracks is not supported"
            )));
        }
    };
    debug!(track_id = track.track_id(), coding = %coding, "media configuration rebuilt");
    Ok(media)
}

/// Copies every track of every input into `writer`, defragmenting them.
pub fn combine_tracks(inputs: &[Mp4Reader], writer: &mut dyn Mp4Writer) -> Result<Vec<CopyReport>> {
    let mut reports = Vec::new();
    for reader in inputs {
        for id in reader.track_ids() {
            let mut track = reader.track_reader(id)?;
            reports.push(copy_track(&mut track, writer, &CopyConfig::default())?);
        }
    }
    Ok(reports)
}

/// Copies every track of `reader` into `writer` with fragment numbers cleared.
pub fn defragment(reader: &Mp4Reader, writer: &mut dyn Mp4Writer) -> Result<Vec<CopyReport>> {
    combine_tracks(std::slice::from_ref(reader), writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(config: CopyConfig, samples: &[(u32, bool)]) -> Result<Vec<u32>> {
        let mut p = FragmentNumberPolicy::new(config)?;
        let mut diag = Diagnostics::new();
        samples
            .iter()
            .map(|&(d, sync)| p.next(9, d, sync, &mut diag))
            .collect()
    }

    #[test]
    fn fragment_every_sync() {
        let got = run(
            CopyConfig::every_sync(),
            &[(10, true), (10, false), (10, false), (10, true), (10, false)],
        )
        .unwrap();
        assert_eq!(got, vec![1, 1, 1, 2, 2]);
    }

    #[test]
    fn fragment_by_duration() {
        let got = run(
            CopyConfig::every(20),
            &[(10, true), (10, false), (10, true), (10, false), (10, true)],
        )
        .unwrap();
        assert_eq!(got, vec![1, 1, 2, 2, 3]);
    }

    #[test]
    fn duration_boundary_on_non_sync() {
        let samples = [(10, true), (10, false), (10, false)];
        assert!(run(CopyConfig::every(20), &samples).is_err());
        let tolerant = CopyConfig {
            tolerate_non_sync_fragment_start: true,
            ..CopyConfig::every(20)
        };
        assert_eq!(run(tolerant, &samples).unwrap(), vec![1, 1, 2]);
    }

    #[test]
    fn keep_and_clear() {
        assert_eq!(run(CopyConfig::keep_fragments(), &[(1, true)]).unwrap(), vec![9]);
        assert_eq!(run(CopyConfig::default(), &[(1, true), (1, false)]).unwrap(), vec![0, 0]);
    }

    #[test]
    fn keep_excludes_refragmenting() {
        let bad = CopyConfig {
            keep_fragment_number: true,
            fragment_every_sync: true,
            ..CopyConfig::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Precondition(_))));
        let bad = CopyConfig {
            keep_fragment_number: true,
            fragment_duration: 5,
            ..CopyConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn edits_follow_movie_timescale() {
        let cfg = CopyConfig {
            old_movie_timescale: Some(1000),
            new_movie_timescale: Some(90000),
            ..CopyConfig::default()
        };
        let out = rescale_edits(&[ElstEntry::new(2000, 512)], &cfg);
        assert_eq!(out[0].segment_duration, 180000);
        assert_eq!(out[0].media_time, 512);
    }
}
