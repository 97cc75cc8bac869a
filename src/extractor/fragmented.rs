use super::{
    SBGP, SampleGroupInfo, SampleInfo, TRAK, TrackSampleTable, collect_sgpd, group_info,
    track_header,
};
use crate::boxes::fragment::{TRUN_SAMPLE_CTS, TRUN_SAMPLE_DURATION, TRUN_SAMPLE_FLAGS, TRUN_SAMPLE_SIZE};
use crate::boxes::{
    FourCC, MfhdBox, SampleFlags, SbgpBox, SgpdBox, StszBox, TfdtBox, TfhdBox, TrexBox, TrunBox,
};
use crate::error::{Diagnostics, Error, Result, check_sample_count, check_sample_size};
use crate::tree::{MOOF, Mp4Box};
use std::collections::{BTreeMap, HashMap};

const MFHD: FourCC = FourCC(*b"mfhd");
const TRAF: FourCC = FourCC(*b"traf");
const TFHD: FourCC = FourCC(*b"tfhd");
const TFDT: FourCC = FourCC(*b"tfdt");
const TRUN: FourCC = FourCC(*b"trun");

/// Group indices above this refer to the sgpd inside the same fragment.
const LOCAL_GROUP_BASE: u32 = 0x10000;

struct TrackState<'a> {
    table: TrackSampleTable,
    trex: Option<&'a TrexBox>,
    movie_sgpd: BTreeMap<FourCC, &'a SgpdBox>,
    next_dts: u64,
    /// Whether the first traf of this track carried a tfdt.
    tfdt_seen: Option<bool>,
}

pub(super) fn extract(
    moov: &Mp4Box,
    top: &[Mp4Box],
    diag: &mut Diagnostics,
) -> Result<Vec<TrackSampleTable>> {
    let trexes: HashMap<u32, &TrexBox> = moov
        .child(FourCC(*b"mvex"))
        .map(|mvex| {
            mvex.children_of(FourCC(*b"trex"))
                .filter_map(|b| b.get::<TrexBox>())
                .map(|t| (t.track_id, t))
                .collect()
        })
        .unwrap_or_default();

    let mut order = Vec::new();
    let mut tracks: HashMap<u32, TrackState<'_>> = HashMap::new();
    for trak in moov.children_of(TRAK) {
        let th = track_header(trak)?;
        let has_table_samples = th
            .stbl
            .child(FourCC(*b"stsz"))
            .and_then(|b| b.get::<StszBox>())
            .is_some_and(|s| s.sample_count > 0);
        if has_table_samples {
            diag.warn(format!(
                "track {}: samples in moov tables are ignored for a fragmented file",
                th.track_id
            ));
        }
        order.push(th.track_id);
        tracks.insert(
            th.track_id,
            TrackState {
                table: TrackSampleTable {
                    track_id: th.track_id,
                    timescale: th.timescale,
                    handler: th.handler,
                    coding_name: th.coding_name,
                    samples: Vec::new(),
                },
                trex: trexes.get(&th.track_id).copied(),
                movie_sgpd: collect_sgpd(th.stbl)?,
                next_dts: 0,
                tfdt_seen: None,
            },
        );
    }

    let mut moofs = Vec::new();
    for b in top {
        if b.typ == MOOF {
            moofs.push(b);
        } else {
            moofs.extend(b.find_all(MOOF));
        }
    }

    for moof in moofs {
        extract_moof(moof, &mut tracks, diag)?;
    }

    let mut out = Vec::with_capacity(order.len());
    for id in order {
        if let Some(state) = tracks.remove(&id) {
            if state.table.samples.is_empty() {
                tracing::debug!(track_id = id, "track has no fragments");
            }
            out.push(state.table);
        }
    }
    Ok(out)
}

fn extract_moof(
    moof: &Mp4Box,
    tracks: &mut HashMap<u32, TrackState<'_>>,
    diag: &mut Diagnostics,
) -> Result<()> {
    let moof_start = moof
        .offset
        .ok_or_else(|| Error::precondition("moof has no stream offset; parse it from input"))?;
    let mfhds: Vec<&MfhdBox> = moof.children_of(MFHD).filter_map(|b| b.get()).collect();
    let [mfhd] = mfhds.as_slice() else {
        return Err(Error::malformed(format!(
            "moof at {moof_start} has {} mfhd boxes, expected 1",
            mfhds.len()
        )));
    };
    let fragment_number = mfhd.sequence_number;

    for traf in moof.children_of(TRAF) {
        let tfhds: Vec<&TfhdBox> = traf.children_of(TFHD).filter_map(|b| b.get()).collect();
        let [tfhd] = tfhds.as_slice() else {
            return Err(Error::malformed(format!(
                "traf in fragment {fragment_number} has {} tfhd boxes, expected 1",
                tfhds.len()
            )));
        };
        let truns: Vec<&TrunBox> = traf.children_of(TRUN).filter_map(|b| b.get()).collect();
        if truns.is_empty() {
            return Err(Error::malformed(format!(
                "traf for track {} in fragment {fragment_number} has no trun",
                tfhd.track_id
            )));
        }
        let Some(state) = tracks.get_mut(&tfhd.track_id) else {
            diag.warn(format!(
                "fragment {fragment_number} references unknown track {}",
                tfhd.track_id
            ));
            continue;
        };
        let id = tfhd.track_id;

        // decode time
        let tfdt = traf.child_body::<TfdtBox>(TFDT);
        match (state.tfdt_seen, tfdt.is_some()) {
            (None, has) => {
                state.tfdt_seen = Some(has);
                if !has {
                    diag.warn(format!(
                        "track {id}: no tfdt, decode times accumulate from 0"
                    ));
                }
            }
            (Some(seen), has) if seen != has => {
                return Err(Error::malformed(format!(
                    "track {id}: tfdt present in some fragments but not others (fragment {fragment_number})"
                )));
            }
            _ => {}
        }
        if let Some(t) = tfdt {
            state.next_dts = t.base_media_decode_time;
        }

        // data base offset
        let base = match (tfhd.base_data_offset, tfhd.default_base_is_moof) {
            (Some(b), _) => b,
            (None, true) => moof_start,
            (None, false) => {
                return Err(Error::unsupported(format!(
                    "track {id} fragment {fragment_number}: neither base_data_offset nor default-base-is-moof"
                )));
            }
        };

        let local_sgpd = collect_sgpd(traf)?;
        let sbgps: BTreeMap<FourCC, &SbgpBox> = traf
            .children_of(SBGP)
            .filter_map(|b| b.get::<SbgpBox>())
            .map(|s| (s.grouping_type, s))
            .collect();
        let mut group_types: Vec<FourCC> = state.movie_sgpd.keys().copied().collect();
        group_types.extend(local_sgpd.keys().copied());
        group_types.sort();
        group_types.dedup();
        for t in sbgps.keys() {
            if !group_types.contains(t) {
                diag.warn(format!(
                    "track {id} fragment {fragment_number}: sbgp '{t}' has no matching sgpd"
                ));
            }
        }

        let trex = state.trex;
        let sample_description_index = tfhd
            .sample_description_index
            .or(trex.map(|t| t.default_sample_description_index))
            .unwrap_or(1);

        let mut pos = base;
        let mut in_traf = 0u64;
        for trun in truns {
            if let Some(off) = trun.data_offset() {
                pos = base.checked_add_signed(off as i64).ok_or_else(|| {
                    Error::malformed(format!("track {id}: trun data offset {off} underflows"))
                })?;
            }
            check_sample_count(
                (state.table.samples.len() + trun.samples.len()) as u64,
                &format!("track {id} fragment {fragment_number}"),
            )?;
            for (i, s) in trun.samples.iter().enumerate() {
                let duration = if trun.has(TRUN_SAMPLE_DURATION) {
                    s.duration
                } else {
                    tfhd.default_sample_duration
                        .or(trex.map(|t| t.default_sample_duration))
                        .unwrap_or(0)
                };
                let size = if trun.has(TRUN_SAMPLE_SIZE) {
                    s.size
                } else {
                    tfhd.default_sample_size
                        .or(trex.map(|t| t.default_sample_size))
                        .ok_or_else(|| {
                            Error::malformed(format!(
                                "track {id} fragment {fragment_number}: no sample size in trun, tfhd or trex"
                            ))
                        })?
                };
                check_sample_size(size as u64)?;
                let flags = match (i, trun.first_sample_flags()) {
                    (0, Some(f)) => Some(f),
                    _ if trun.has(TRUN_SAMPLE_FLAGS) => Some(s.flags),
                    _ => tfhd
                        .default_sample_flags
                        .or(trex.map(|t| t.default_sample_flags)),
                };
                let is_sync = flags.is_none_or(|f| !SampleFlags::from_u32(f).is_non_sync);

                let mut groups = BTreeMap::new();
                for gt in &group_types {
                    let index = match sbgps.get(gt).and_then(|s| s.index_for(in_traf)) {
                        Some(idx) => idx,
                        None => default_group_index(gt, &local_sgpd, &state.movie_sgpd),
                    };
                    if let Some(info) = resolve_group(index, gt, &local_sgpd, &state.movie_sgpd) {
                        groups.insert(*gt, info);
                    }
                }

                state.table.samples.push(SampleInfo {
                    offset: pos,
                    size,
                    duration,
                    cts_offset: if trun.has(TRUN_SAMPLE_CTS) {
                        s.cts_offset
                    } else {
                        0
                    },
                    dts: state.next_dts,
                    is_sync,
                    fragment_number,
                    sample_description_index,
                    sample_groups: groups,
                    timescale: state.table.timescale,
                });
                pos += size as u64;
                state.next_dts += duration as u64;
                in_traf += 1;
            }
        }
    }
    Ok(())
}

/// Index for a sample no sbgp maps. A v2 default in the fragment's own sgpd
/// wins and points into its local entries; otherwise the movie sgpd's default.
fn default_group_index(
    grouping_type: &FourCC,
    local: &BTreeMap<FourCC, &SgpdBox>,
    movie: &BTreeMap<FourCC, &SgpdBox>,
) -> u32 {
    match local.get(grouping_type).map(|s| s.default_index()) {
        Some(d) if d != 0 => LOCAL_GROUP_BASE + d,
        _ => movie.get(grouping_type).map_or(0, |s| s.default_index()),
    }
}

fn resolve_group(
    index: u32,
    grouping_type: &FourCC,
    local: &BTreeMap<FourCC, &SgpdBox>,
    movie: &BTreeMap<FourCC, &SgpdBox>,
) -> Option<SampleGroupInfo> {
    if index == 0 {
        return None;
    }
    let info = if index > LOCAL_GROUP_BASE {
        local.get(grouping_type).map(|s| SampleGroupInfo {
            description_index: index,
            description: s.entry(index - LOCAL_GROUP_BASE).cloned(),
        })
    } else {
        movie.get(grouping_type).map(|s| group_info(s, index))
    };
    Some(info.unwrap_or(SampleGroupInfo {
        description_index: index,
        description: None,
    }))
}
