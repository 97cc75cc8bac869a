//! Per-sample metadata extraction.
//!
//! Two strategies share the output type: the regular one reads the sample
//! tables under `stbl`, the fragmented one walks `moof`/`traf`/`trun`. Which one
//! runs is decided once per input by whether any `moof` exists.

mod fragmented;
mod regular;

use crate::boxes::{
    FourCC, HdlrBox, MdhdBox, SampleGroupDescription, SgpdBox, TkhdBox,
};
use crate::error::{Diagnostics, Error, Result};
use crate::tree::{MOOF, MOOV, Mp4Box};
use serde::Serialize;
use std::collections::BTreeMap;

pub(crate) const TRAK: FourCC = FourCC(*b"trak");
pub(crate) const MDIA: FourCC = FourCC(*b"mdia");
pub(crate) const MINF: FourCC = FourCC(*b"minf");
pub(crate) const STBL: FourCC = FourCC(*b"stbl");
pub(crate) const STSD: FourCC = FourCC(*b"stsd");
pub(crate) const SGPD: FourCC = FourCC(*b"sgpd");
pub(crate) const SBGP: FourCC = FourCC(*b"sbgp");

/// Group membership of one sample for one grouping type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleGroupInfo {
    /// Index as signalled (fragment-local indices keep their 0x10000 offset).
    pub description_index: u32,
    pub description: Option<SampleGroupDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleInfo {
    /// Absolute byte offset of the sample data in the input.
    pub offset: u64,
    pub size: u32,
    pub duration: u32,
    pub cts_offset: i64,
    /// Decode time in track timescale.
    pub dts: u64,
    pub is_sync: bool,
    /// `mfhd` sequence number, 0 for samples outside any fragment.
    pub fragment_number: u32,
    pub sample_description_index: u32,
    pub sample_groups: BTreeMap<FourCC, SampleGroupInfo>,
    pub timescale: u32,
}

impl SampleInfo {
    /// Composition time; `None` when it would be negative.
    pub fn pts(&self) -> Option<u64> {
        let pts = self.dts as i128 + self.cts_offset as i128;
        u64::try_from(pts).ok()
    }
}

/// Everything the sample reader needs for one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSampleTable {
    pub track_id: u32,
    pub timescale: u32,
    pub handler: FourCC,
    pub coding_name: FourCC,
    pub samples: Vec<SampleInfo>,
}

impl TrackSampleTable {
    pub fn max_sample_size(&self) -> u32 {
        self.samples.iter().map(|s| s.size).max().unwrap_or(0)
    }

    pub fn duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }
}

/// Track-level facts read from tkhd/mdhd/hdlr/stsd.
pub(crate) struct TrackHeader<'a> {
    pub track_id: u32,
    pub timescale: u32,
    pub handler: FourCC,
    pub coding_name: FourCC,
    pub stbl: &'a Mp4Box,
}

pub(crate) fn track_header(trak: &Mp4Box) -> Result<TrackHeader<'_>> {
    let tkhd = trak
        .child_body::<TkhdBox>(FourCC(*b"tkhd"))
        .ok_or_else(|| Error::malformed("trak without tkhd"))?;
    let mdia = trak
        .child(MDIA)
        .ok_or_else(|| Error::malformed(format!("track {} has no mdia", tkhd.track_id)))?;
    let mdhd = mdia
        .child_body::<MdhdBox>(FourCC(*b"mdhd"))
        .ok_or_else(|| Error::malformed(format!("track {} has no mdhd", tkhd.track_id)))?;
    let handler = mdia
        .child_body::<HdlrBox>(FourCC(*b"hdlr"))
        .map(|h| h.handler_type)
        .unwrap_or_default();
    let stbl = mdia
        .find_path(&[MINF, STBL])
        .ok_or_else(|| Error::malformed(format!("track {} has no minf/stbl", tkhd.track_id)))?;
    let coding_name = stbl
        .child(STSD)
        .and_then(|stsd| stsd.children.first())
        .map(|e| e.typ)
        .unwrap_or_default();
    Ok(TrackHeader {
        track_id: tkhd.track_id,
        timescale: mdhd.timescale,
        handler,
        coding_name,
        stbl,
    })
}

/// sgpd boxes of one container keyed by grouping type; a type may appear once.
pub(crate) fn collect_sgpd(parent: &Mp4Box) -> Result<BTreeMap<FourCC, &SgpdBox>> {
    let mut out = BTreeMap::new();
    for b in parent.children_of(SGPD) {
        if let Some(sgpd) = b.get::<SgpdBox>() {
            if out.insert(sgpd.grouping_type, sgpd).is_some() {
                return Err(Error::malformed(format!(
                    "more than one sgpd with grouping type '{}'",
                    sgpd.grouping_type
                )));
            }
        }
    }
    Ok(out)
}

pub(crate) fn group_info(sgpd: &SgpdBox, index: u32) -> SampleGroupInfo {
    SampleGroupInfo {
        description_index: index,
        description: sgpd.entry(index).cloned(),
    }
}

/// Builds the per-track sample tables for a parsed file.
pub fn extract_tracks(top: &[Mp4Box], diag: &mut Diagnostics) -> Result<Vec<TrackSampleTable>> {
    let moov = top
        .iter()
        .find(|b| b.typ == MOOV)
        .ok_or_else(|| Error::malformed("no moov box"))?;
    let fragmented = top.iter().any(|b| b.typ == MOOF || b.find(MOOF).is_some());
    let tables = if fragmented {
        tracing::debug!("extracting samples from movie fragments");
        fragmented::extract(moov, top, diag)?
    } else {
        tracing::debug!("extracting samples from sample tables");
        let mut tables = Vec::new();
        for trak in moov.children_of(TRAK) {
            tables.push(regular::extract_track(trak, diag)?);
        }
        tables
    };
    for t in &tables {
        tracing::debug!(
            track_id = t.track_id,
            samples = t.samples.len(),
            coding = %t.coding_name,
            "track extracted"
        );
    }
    Ok(tables)
}
