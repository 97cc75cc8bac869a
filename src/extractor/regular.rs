use super::{SBGP, SampleInfo, TrackSampleTable, collect_sgpd, group_info, track_header};
use crate::boxes::{
    BodyRef, Co64Box, CttsBox, FourCC, SbgpBox, StcoBox, StscBox, StssBox, StszBox, Stz2Box, SttsBox,
};
use crate::error::{Diagnostics, Error, Result, check_sample_count, check_sample_size};
use crate::tree::Mp4Box;
use std::collections::BTreeMap;

enum OneOf<'a, A, B> {
    First(&'a A),
    Second(&'a B),
}

/// Exactly one of two alternative tables must be present.
fn one_of<'a, A: BodyRef, B: BodyRef>(
    stbl: &'a Mp4Box,
    a: FourCC,
    b: FourCC,
    track_id: u32,
) -> Result<OneOf<'a, A, B>> {
    match (stbl.child_body::<A>(a), stbl.child_body::<B>(b)) {
        (Some(first), None) => Ok(OneOf::First(first)),
        (None, Some(second)) => Ok(OneOf::Second(second)),
        (Some(_), Some(_)) => Err(Error::malformed(format!(
            "track {track_id}: both {a} and {b} present"
        ))),
        (None, None) => Err(Error::malformed(format!(
            "track {track_id}: neither {a} nor {b} present"
        ))),
    }
}

fn sizes(stbl: &Mp4Box, track_id: u32, expected: u64) -> Result<Vec<u32>> {
    let sizes = match one_of::<StszBox, Stz2Box>(stbl, FourCC(*b"stsz"), FourCC(*b"stz2"), track_id)? {
        OneOf::First(stsz) => {
            // a uniform table expands from its count alone
            if stsz.sample_count as u64 != expected {
                return Err(Error::malformed(format!(
                    "track {track_id}: stts describes {expected} samples, stsz {}",
                    stsz.sample_count
                )));
            }
            if stsz.sample_size == 0 && stsz.entry_sizes.len() != stsz.sample_count as usize {
                return Err(Error::malformed(format!(
                    "track {track_id}: stsz lists {} sizes for {} samples",
                    stsz.entry_sizes.len(),
                    stsz.sample_count
                )));
            }
            stsz.sizes()
        }
        OneOf::Second(stz2) => {
            if stz2.entry_sizes.len() as u64 != expected {
                return Err(Error::malformed(format!(
                    "track {track_id}: stts describes {expected} samples, stz2 {}",
                    stz2.entry_sizes.len()
                )));
            }
            stz2.entry_sizes.clone()
        }
    };
    for s in &sizes {
        check_sample_size(*s as u64)?;
    }
    Ok(sizes)
}

/// Chunk offsets widened to 64 bits.
fn chunk_offsets(stbl: &Mp4Box, track_id: u32) -> Result<Vec<u64>> {
    Ok(match one_of::<StcoBox, Co64Box>(stbl, FourCC(*b"stco"), FourCC(*b"co64"), track_id)? {
        OneOf::First(stco) => stco.chunk_offsets.iter().map(|&o| o as u64).collect(),
        OneOf::Second(co64) => co64.chunk_offsets.clone(),
    })
}

/// Per-sample (offset, sample_description_index) from the stsc run table.
fn offsets(
    stsc: &StscBox,
    chunks: &[u64],
    sizes: &[u32],
    track_id: u32,
) -> Result<Vec<(u64, u32)>> {
    let mut out = Vec::with_capacity(sizes.len());
    for (i, e) in stsc.entries.iter().enumerate() {
        let expected_first = match i {
            0 => Some(1),
            _ => stsc.entries[i - 1].first_chunk.checked_add(1),
        };
        if expected_first.is_none_or(|first| e.first_chunk < first) {
            return Err(Error::malformed(format!(
                "track {track_id}: stsc first_chunk {} out of order",
                e.first_chunk
            )));
        }
        let last_chunk = match stsc.entries.get(i + 1) {
            Some(next) => next.first_chunk.saturating_sub(1),
            None => chunks.len() as u32,
        };
        for chunk in e.first_chunk..=last_chunk {
            let Some(&base) = chunks.get(chunk as usize - 1) else {
                return Err(Error::malformed(format!(
                    "track {track_id}: stsc references chunk {chunk} of {}",
                    chunks.len()
                )));
            };
            let mut pos = base;
            for _ in 0..e.samples_per_chunk {
                let Some(&size) = sizes.get(out.len()) else {
                    return Err(Error::malformed(format!(
                        "track {track_id}: chunk table describes more than the {} sized samples",
                        sizes.len()
                    )));
                };
                out.push((pos, e.sample_description_index));
                pos += size as u64;
            }
        }
    }
    if out.len() != sizes.len() {
        return Err(Error::malformed(format!(
            "track {track_id}: chunk table covers {} samples, size table {}",
            out.len(),
            sizes.len()
        )));
    }
    Ok(out)
}

/// Regular (table based) strategy for one `trak`.
pub(super) fn extract_track(trak: &Mp4Box, diag: &mut Diagnostics) -> Result<TrackSampleTable> {
    let th = track_header(trak)?;
    let id = th.track_id;
    let stbl = th.stbl;

    let stts = stbl
        .child_body::<SttsBox>(FourCC(*b"stts"))
        .ok_or_else(|| Error::malformed(format!("track {id}: no stts")))?;
    check_sample_count(stts.sample_count(), &format!("track {id} stts"))?;

    // sizes
    let sizes = sizes(stbl, id, stts.sample_count())?;
    let n = sizes.len();

    // durations
    let durations: Vec<u32> = stts
        .entries
        .iter()
        .flat_map(|e| std::iter::repeat_n(e.sample_delta, e.sample_count as usize))
        .collect();

    // offsets
    let stsc = stbl
        .child_body::<StscBox>(FourCC(*b"stsc"))
        .ok_or_else(|| Error::malformed(format!("track {id}: no stsc")))?;
    let chunks = chunk_offsets(stbl, id)?;
    let offsets = offsets(stsc, &chunks, &sizes, id)?;

    // composition offsets
    let mut cts = vec![0i64; n];
    if let Some(ctts) = stbl.child_body::<CttsBox>(FourCC(*b"ctts")) {
        if ctts.sample_count() != n as u64 {
            diag.warn(format!(
                "track {id}: ctts describes {} samples, expected {n}",
                ctts.sample_count()
            ));
        }
        let expanded = ctts
            .entries
            .iter()
            .flat_map(|e| std::iter::repeat_n(e.sample_offset, e.sample_count as usize));
        for (slot, v) in cts.iter_mut().zip(expanded) {
            *slot = v;
        }
    }

    // sync flags
    let mut sync = vec![true; n];
    if let Some(stss) = stbl.child_body::<StssBox>(FourCC(*b"stss")) {
        sync.iter_mut().for_each(|s| *s = false);
        for &num in &stss.sample_numbers {
            match sync.get_mut((num as usize).wrapping_sub(1)) {
                Some(s) => *s = true,
                None => diag.warn(format!("track {id}: stss names sample {num} of {n}")),
            }
        }
    }

    // sample groups
    let sgpds = collect_sgpd(stbl)?;
    let sbgps: BTreeMap<FourCC, &SbgpBox> = stbl
        .children_of(SBGP)
        .filter_map(|b| b.get::<SbgpBox>())
        .map(|s| (s.grouping_type, s))
        .collect();
    for t in sbgps.keys() {
        if !sgpds.contains_key(t) {
            diag.warn(format!("track {id}: sbgp '{t}' has no matching sgpd"));
        }
    }

    let mut samples = Vec::with_capacity(n);
    let mut dts = 0u64;
    for i in 0..n {
        let mut groups = BTreeMap::new();
        for (gt, sgpd) in &sgpds {
            let index = sbgps
                .get(gt)
                .and_then(|s| s.index_for(i as u64))
                .unwrap_or_else(|| sgpd.default_index());
            if index != 0 {
                groups.insert(*gt, group_info(sgpd, index));
            }
        }
        samples.push(SampleInfo {
            offset: offsets[i].0,
            size: sizes[i],
            duration: durations[i],
            cts_offset: cts[i],
            dts,
            is_sync: sync[i],
            fragment_number: 0,
            sample_description_index: offsets[i].1,
            sample_groups: groups,
            timescale: th.timescale,
        });
        dts += durations[i] as u64;
    }

    Ok(TrackSampleTable {
        track_id: id,
        timescale: th.timescale,
        handler: th.handler,
        coding_name: th.coding_name,
        samples,
    })
}
