//! Assembles `moov`, `moof` and the segment-level boxes from write state.

use super::config::{DefaultSampleGroup, MovieConfig, TrackConfig};
use super::sample_store::{Chunk, StoredSample};
use crate::boxes::fragment::{
    TRUN_DATA_OFFSET, TRUN_SAMPLE_CTS, TRUN_SAMPLE_DURATION, TRUN_SAMPLE_FLAGS, TRUN_SAMPLE_SIZE,
};
use crate::boxes::{
    Co64Box, CttsBox, DrefBox, ElstBox, FourCC, FtypBox, HdlrBox, IodsBox, MdhdBox, MfhdBox,
    MvhdBox, SampleFlags, SampleGroupDescription, SbgpBox, SgpdBox, SidxBox, SidxReference,
    SmhdBox, StcoBox, StscBox, StsdBox, StssBox, StszBox, SttsBox, TfdtBox, TfhdBox, TkhdBox,
    TrexBox, TrunBox, TrunSample, UrlBox, VmhdBox,
};
use crate::error::{Diagnostics, Error, Result};
use crate::registry::default_registry;
use crate::tree::{MOOF, MOOV, Mp4Box, ParseOptions, parse_boxes};
use std::collections::{BTreeMap, BTreeSet};

/// Fragment-local sample group description indices start above this.
const LOCAL_GROUP_BASE: u32 = 0x10000;

fn fourcc(b: &[u8; 4]) -> FourCC {
    FourCC(*b)
}

/// A track as registered with a writer.
#[derive(Debug, Clone)]
pub struct WriteTrack {
    pub track_id: u32,
    pub config: TrackConfig,
}

/// `v * to / from` without intermediate overflow.
pub fn rescale(v: u64, from: u32, to: u32) -> u64 {
    if from == to || from == 0 {
        return v;
    }
    (v as u128 * to as u128 / from as u128) as u64
}

pub fn ftyp_box(movie: &MovieConfig) -> Mp4Box {
    Mp4Box::new(
        fourcc(b"ftyp"),
        FtypBox::new(
            movie.major_brand,
            movie.minor_version,
            movie.compatible_brands.clone(),
        ),
    )
}

/// `styp` of a media segment; the last one announces itself with `lmsg`.
pub fn styp_box(last: bool) -> Mp4Box {
    let mut brands = vec![fourcc(b"msdh"), fourcc(b"msix")];
    if last {
        brands.push(fourcc(b"lmsg"));
    }
    Mp4Box::new(fourcc(b"styp"), FtypBox::new(fourcc(b"msdh"), 0, brands))
}

/// Where one chunk of a flat file landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlacement {
    pub offset: u64,
    pub sample_count: u32,
}

/// Sample tables of one track in a flat file.
#[derive(Debug, Default)]
pub struct FlatTables<'a> {
    pub samples: Vec<&'a StoredSample>,
    pub chunks: Vec<ChunkPlacement>,
}

/// Lays out interleaved chunks starting at `data_start`, grouping by track.
pub fn place_chunks(chunks: &[Chunk], data_start: u64) -> BTreeMap<u32, FlatTables<'_>> {
    let mut out: BTreeMap<u32, FlatTables<'_>> = BTreeMap::new();
    let mut pos = data_start;
    for c in chunks {
        let t = out.entry(c.track_id).or_default();
        t.chunks.push(ChunkPlacement {
            offset: pos,
            sample_count: c.samples.len() as u32,
        });
        t.samples.extend(c.samples.iter());
        pos += c.byte_len();
    }
    out
}

fn media_duration(samples: &[&StoredSample]) -> u64 {
    samples.iter().map(|s| s.duration as u64).sum()
}

/// `moov` for a flat file (`flat` holds every track's tables) or, when `flat`
/// is `None`, the init segment of a fragmented one.
pub fn build_moov(
    movie: &MovieConfig,
    tracks: &[WriteTrack],
    flat: Option<&BTreeMap<u32, FlatTables<'_>>>,
) -> Result<Mp4Box> {
    let empty = FlatTables::default();
    let mut movie_duration = 0u64;
    let mut traks = Vec::with_capacity(tracks.len());
    for t in tracks {
        let tables = flat.map(|f| f.get(&t.track_id).unwrap_or(&empty));
        let (trak, duration) = build_trak(movie, t, tables)?;
        movie_duration = movie_duration.max(duration);
        traks.push(trak);
    }

    let next_track_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;
    let mvhd = MvhdBox {
        creation_time: movie.creation_time,
        modification_time: movie.creation_time,
        timescale: movie.timescale,
        duration: movie_duration,
        next_track_id,
        ..MvhdBox::default()
    };
    let mut moov = Mp4Box::container(MOOV).with_child(Mp4Box::new(fourcc(b"mvhd"), mvhd));
    if let Some(iods) = movie.iods {
        moov.push_child(Mp4Box::new(
            fourcc(b"iods"),
            IodsBox::with_profiles(iods.audio_profile_level, iods.visual_profile_level),
        ));
    }
    moov.children.extend(traks);

    if flat.is_none() {
        let mut mvex = Mp4Box::container(fourcc(b"mvex"));
        for t in tracks {
            mvex.push_child(Mp4Box::new(fourcc(b"trex"), TrexBox::new(t.track_id)));
        }
        moov.push_child(mvex);
    }

    if !movie.user_data.is_empty() {
        let mut udta = Mp4Box::container(fourcc(b"udta"));
        let mut diag = Diagnostics::new();
        for raw in &movie.user_data {
            udta.children.extend(parse_boxes(
                raw,
                0,
                default_registry(),
                ParseOptions::default(),
                &mut diag,
            )?);
        }
        moov.push_child(udta);
    }
    Ok(moov)
}

/// Builds one `trak`; also returns its duration in movie timescale.
fn build_trak(
    movie: &MovieConfig,
    t: &WriteTrack,
    flat: Option<&FlatTables<'_>>,
) -> Result<(Mp4Box, u64)> {
    let cfg = &t.config;
    let media_duration = flat.map_or(0, |f| media_duration(&f.samples));
    let duration = if cfg.edit_list.is_empty() {
        rescale(media_duration, cfg.timescale, movie.timescale)
    } else {
        cfg.edit_list.iter().map(|e| e.segment_duration).sum()
    };

    let (width, height) = cfg.media.dimensions();
    let tkhd = TkhdBox {
        creation_time: movie.creation_time,
        modification_time: movie.creation_time,
        track_id: t.track_id,
        duration,
        volume: if cfg.media.is_video() { 0 } else { 0x0100 },
        width: (width as u32) << 16,
        height: (height as u32) << 16,
        ..TkhdBox::default()
    };
    let mut trak = Mp4Box::container(fourcc(b"trak")).with_child(Mp4Box::new(fourcc(b"tkhd"), tkhd));
    if !cfg.edit_list.is_empty() {
        trak.push_child(Mp4Box::container(fourcc(b"edts")).with_child(Mp4Box::new(
            fourcc(b"elst"),
            ElstBox {
                entries: cfg.edit_list.clone(),
                ..ElstBox::default()
            },
        )));
    }

    let mdhd = MdhdBox {
        creation_time: movie.creation_time,
        modification_time: movie.creation_time,
        timescale: cfg.timescale,
        duration: media_duration,
        language: cfg.language.clone(),
        ..MdhdBox::default()
    };
    let (hdlr_name, media_header) = if cfg.media.is_video() {
        ("VideoHandler", Mp4Box::new(fourcc(b"vmhd"), VmhdBox::default()))
    } else {
        ("SoundHandler", Mp4Box::new(fourcc(b"smhd"), SmhdBox::default()))
    };
    let dinf = Mp4Box::container(fourcc(b"dinf")).with_child(
        Mp4Box::new(fourcc(b"dref"), DrefBox::default())
            .with_child(Mp4Box::new(fourcc(b"url "), UrlBox::self_contained())),
    );
    let minf = Mp4Box::container(fourcc(b"minf"))
        .with_child(media_header)
        .with_child(dinf)
        .with_child(build_stbl(cfg, flat)?);
    let mdia = Mp4Box::container(fourcc(b"mdia"))
        .with_child(Mp4Box::new(fourcc(b"mdhd"), mdhd))
        .with_child(Mp4Box::new(
            fourcc(b"hdlr"),
            HdlrBox::new(cfg.media.handler(), hdlr_name),
        ))
        .with_child(minf);
    trak.push_child(mdia);
    Ok((trak, duration))
}

fn build_stbl(cfg: &TrackConfig, flat: Option<&FlatTables<'_>>) -> Result<Mp4Box> {
    let stsd = Mp4Box::new(fourcc(b"stsd"), StsdBox::default()).with_child(cfg.media.sample_entry());
    let mut stbl = Mp4Box::container(fourcc(b"stbl")).with_child(stsd);

    let Some(flat) = flat else {
        // fragmented init segment: empty tables, samples live in moof
        stbl.push_child(Mp4Box::new(fourcc(b"stts"), SttsBox::default()));
        stbl.push_child(Mp4Box::new(fourcc(b"stsc"), StscBox::default()));
        stbl.push_child(Mp4Box::new(fourcc(b"stsz"), StszBox::from_sizes(Vec::new())));
        stbl.push_child(Mp4Box::new(fourcc(b"stco"), StcoBox::default()));
        stbl.children
            .extend(group_boxes(&[], cfg.default_sample_group.as_ref(), false));
        return Ok(stbl);
    };

    let samples = &flat.samples;
    stbl.push_child(Mp4Box::new(
        fourcc(b"stts"),
        SttsBox::from_durations(samples.iter().map(|s| s.duration)),
    ));
    if samples.iter().any(|s| s.cts_offset != 0) {
        stbl.push_child(Mp4Box::new(
            fourcc(b"ctts"),
            CttsBox::from_offsets(samples.iter().map(|s| s.cts_offset)),
        ));
    }
    if samples.iter().any(|s| !s.is_sync) {
        stbl.push_child(Mp4Box::new(
            fourcc(b"stss"),
            StssBox {
                sample_numbers: samples
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.is_sync)
                    .map(|(i, _)| i as u32 + 1)
                    .collect(),
            },
        ));
    }
    let counts: Vec<u32> = flat.chunks.iter().map(|c| c.sample_count).collect();
    stbl.push_child(Mp4Box::new(fourcc(b"stsc"), StscBox::from_chunk_sizes(&counts)));
    stbl.push_child(Mp4Box::new(
        fourcc(b"stsz"),
        StszBox::from_sizes(samples.iter().map(|s| s.size).collect()),
    ));
    if flat.chunks.iter().any(|c| c.offset > u32::MAX as u64) {
        stbl.push_child(Mp4Box::new(
            fourcc(b"co64"),
            Co64Box {
                chunk_offsets: flat.chunks.iter().map(|c| c.offset).collect(),
            },
        ));
    } else {
        stbl.push_child(Mp4Box::new(
            fourcc(b"stco"),
            StcoBox {
                chunk_offsets: flat.chunks.iter().map(|c| c.offset as u32).collect(),
            },
        ));
    }
    stbl.children
        .extend(group_boxes(samples, cfg.default_sample_group.as_ref(), false));
    Ok(stbl)
}

/// sgpd/sbgp pairs for `samples`. Movie-level tables (`local == false`) carry
/// the default group as entry 1 of a version 2 sgpd; fragment-local tables
/// number their own entries above 0x10000 and point back at that default.
fn group_boxes(
    samples: &[&StoredSample],
    default: Option<&DefaultSampleGroup>,
    local: bool,
) -> Vec<Mp4Box> {
    let mut types: BTreeSet<FourCC> = samples
        .iter()
        .flat_map(|s| s.sample_groups.keys().copied())
        .collect();
    if let (Some(d), false) = (default, local) {
        types.insert(d.grouping_type);
    }

    let mut out = Vec::new();
    for t in types {
        let dflt = default.filter(|d| d.grouping_type == t);
        let mut entries: Vec<SampleGroupDescription> = Vec::new();
        if let (Some(d), false) = (dflt, local) {
            entries.push(d.description.clone());
        }
        let base = if local { LOCAL_GROUP_BASE } else { 0 };
        let fallback = if dflt.is_some() { 1 } else { 0 };

        let mut sbgp = SbgpBox::new(t);
        let mut explicit = false;
        for s in samples {
            let index = match s.sample_groups.get(&t) {
                Some(desc) => {
                    let pos = match entries.iter().position(|e| e == desc) {
                        Some(p) => p,
                        None => {
                            entries.push(desc.clone());
                            entries.len() - 1
                        }
                    };
                    base + pos as u32 + 1
                }
                None => fallback,
            };
            explicit |= index != fallback;
            sbgp.push_sample(index);
        }

        if !entries.is_empty() {
            let mut sgpd = SgpdBox::new(t, entries);
            if let (Some(_), false) = (dflt, local) {
                sgpd.version = 2;
                sgpd.default_sample_description_index = 1;
            }
            out.push(Mp4Box::new(fourcc(b"sgpd"), sgpd));
        }
        if explicit {
            out.push(Mp4Box::new(fourcc(b"sbgp"), sbgp));
        }
    }
    out
}

/// Summary of one fragment, for the segment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub sequence_number: u32,
    /// moof + mdat bytes.
    pub size: u64,
    /// Duration of the reference track's samples in the fragment.
    pub duration: u64,
    pub starts_with_sap: bool,
    pub earliest_pts: Option<u64>,
}

/// One `moof` plus its `mdat`, serialized.
pub struct BuiltFragment {
    pub bytes: Vec<u8>,
    pub info: FragmentInfo,
}

/// Header length of an mdat carrying `payload` bytes.
pub fn mdat_header_len(payload: u64) -> u64 {
    if payload + 8 > u32::MAX as u64 { 16 } else { 8 }
}

fn build_moof_tree(
    sequence_number: u32,
    tracks: &[WriteTrack],
    chunks: &[Chunk],
    data_offsets: Option<&[i32]>,
) -> Mp4Box {
    let mut moof = Mp4Box::container(MOOF).with_child(Mp4Box::new(
        fourcc(b"mfhd"),
        MfhdBox { sequence_number },
    ));
    for t in tracks {
        let mine: Vec<(usize, &Chunk)> = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.track_id == t.track_id)
            .collect();
        let Some((_, first)) = mine.first() else {
            continue;
        };
        let base_decode_time = first.samples.first().map_or(0, |s| s.dts);
        let mut traf = Mp4Box::container(fourcc(b"traf"))
            .with_child(Mp4Box::new(
                fourcc(b"tfhd"),
                TfhdBox {
                    track_id: t.track_id,
                    default_base_is_moof: true,
                    ..TfhdBox::default()
                },
            ))
            .with_child(Mp4Box::new(fourcc(b"tfdt"), TfdtBox::new(base_decode_time)));
        for (i, c) in &mine {
            let cts = c.samples.iter().any(|s| s.cts_offset != 0);
            let mut flags =
                TRUN_DATA_OFFSET | TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE | TRUN_SAMPLE_FLAGS;
            if cts {
                flags |= TRUN_SAMPLE_CTS;
            }
            let trun = TrunBox {
                flags,
                data_offset: data_offsets.and_then(|d| d.get(*i).copied()).unwrap_or(0),
                samples: c
                    .samples
                    .iter()
                    .map(|s| TrunSample {
                        duration: s.duration,
                        size: s.size,
                        flags: SampleFlags::for_sync(s.is_sync),
                        cts_offset: s.cts_offset,
                    })
                    .collect(),
                ..TrunBox::default()
            };
            traf.push_child(Mp4Box::new(fourcc(b"trun"), trun));
        }
        let traf_samples: Vec<&StoredSample> =
            mine.iter().flat_map(|(_, c)| c.samples.iter()).collect();
        traf.children.extend(group_boxes(
            &traf_samples,
            t.config.default_sample_group.as_ref(),
            true,
        ));
        moof.push_child(traf);
    }
    moof
}

/// Serializes one fragment: a moof with one trun per chunk (offsets relative to
/// the moof start) followed by the mdat with the chunks in order.
pub fn build_fragment(
    sequence_number: u32,
    tracks: &[WriteTrack],
    chunks: &[Chunk],
    reference_track: Option<u32>,
) -> Result<BuiltFragment> {
    if chunks.is_empty() {
        return Err(Error::precondition("fragment without samples"));
    }
    let payload_len: u64 = chunks.iter().map(Chunk::byte_len).sum();
    let header_len = mdat_header_len(payload_len);

    let mut placeholder = build_moof_tree(sequence_number, tracks, chunks, None);
    let moof_len = placeholder.update_size()?;
    let mut offsets = Vec::with_capacity(chunks.len());
    let mut pos = moof_len + header_len;
    for c in chunks {
        let off = i32::try_from(pos).map_err(|_| {
            Error::unsupported(format!("fragment data offset {pos} exceeds 32 bits"))
        })?;
        offsets.push(off);
        pos += c.byte_len();
    }
    let mut moof = build_moof_tree(sequence_number, tracks, chunks, Some(&offsets));
    let mut bytes = moof.to_bytes()?;
    if moof.size() != moof_len {
        return Err(Error::precondition("moof size changed while patching data offsets"));
    }

    let mut mdat = Vec::with_capacity((header_len + payload_len) as usize);
    crate::boxes::write_box_header(
        &mut mdat,
        fourcc(b"mdat"),
        None,
        header_len + payload_len,
        header_len == 16,
    );
    for c in chunks {
        for s in &c.samples {
            match &s.payload {
                super::sample_store::Payload::Memory(d) => mdat.extend_from_slice(d),
                super::sample_store::Payload::Spilled { .. } => {
                    return Err(Error::precondition(
                        "fragment samples must be buffered in memory",
                    ));
                }
            }
        }
    }
    bytes.extend_from_slice(&mdat);

    let reference = reference_track.or_else(|| tracks.first().map(|t| t.track_id));
    let ref_samples: Vec<&StoredSample> = chunks
        .iter()
        .filter(|c| Some(c.track_id) == reference)
        .flat_map(|c| c.samples.iter())
        .collect();
    let info = FragmentInfo {
        sequence_number,
        size: bytes.len() as u64,
        duration: ref_samples.iter().map(|s| s.duration as u64).sum(),
        starts_with_sap: ref_samples.first().is_some_and(|s| s.is_sync),
        earliest_pts: ref_samples
            .iter()
            .filter_map(|s| u64::try_from(s.dts as i128 + s.cts_offset as i128).ok())
            .min(),
    };
    Ok(BuiltFragment { bytes, info })
}

/// Segment index over `fragments`, which directly follow the sidx.
pub fn build_sidx(reference_id: u32, timescale: u32, fragments: &[FragmentInfo]) -> Result<Mp4Box> {
    let mut references = Vec::with_capacity(fragments.len());
    for f in fragments {
        let referenced_size = u32::try_from(f.size)
            .ok()
            .filter(|s| *s < 1 << 31)
            .ok_or_else(|| Error::unsupported(format!("fragment of {} bytes too large for sidx", f.size)))?;
        let subsegment_duration = u32::try_from(f.duration).map_err(|_| {
            Error::unsupported(format!("fragment duration {} too large for sidx", f.duration))
        })?;
        references.push(SidxReference {
            reference_type: false,
            referenced_size,
            subsegment_duration,
            starts_with_sap: f.starts_with_sap,
            sap_type: if f.starts_with_sap { 1 } else { 0 },
            sap_delta_time: 0,
        });
    }
    let sidx = SidxBox {
        reference_id,
        timescale,
        earliest_presentation_time: fragments
            .first()
            .and_then(|f| f.earliest_pts)
            .unwrap_or(0),
        first_offset: 0,
        references,
        ..SidxBox::default()
    };
    Ok(Mp4Box::new(fourcc(b"sidx"), sidx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::sample_group::ROLL;
    use crate::writer::config::{AacConfig, MediaConfig};
    use crate::writer::sample_store::Payload;

    fn aac_track(id: u32) -> WriteTrack {
        WriteTrack {
            track_id: id,
            config: TrackConfig::new(
                48000,
                MediaConfig::Aac(AacConfig {
                    sample_rate: 48000,
                    channel_count: 2,
                    esds: vec![0; 4],
                }),
            ),
        }
    }

    fn stored(size: u32, is_sync: bool, dts: u64) -> StoredSample {
        StoredSample {
            payload: Payload::Memory(vec![0xAA; size as usize]),
            size,
            duration: 1024,
            cts_offset: 0,
            is_sync,
            fragment_number: 1,
            sample_groups: BTreeMap::new(),
            dts,
        }
    }

    #[test]
    fn flat_moov_tables() {
        let chunks = vec![Chunk {
            track_id: 1,
            samples: vec![stored(10, true, 0), stored(12, false, 1024)],
        }];
        let placed = place_chunks(&chunks, 100);
        let mut moov = build_moov(&MovieConfig::default(), &[aac_track(1)], Some(&placed)).unwrap();
        moov.update_size().unwrap();
        let stbl = moov
            .find_path(&[fourcc(b"trak"), fourcc(b"mdia"), fourcc(b"minf"), fourcc(b"stbl")])
            .unwrap();
        assert_eq!(stbl.child_body::<StcoBox>(fourcc(b"stco")).unwrap().chunk_offsets, vec![100]);
        assert_eq!(stbl.child_body::<StssBox>(fourcc(b"stss")).unwrap().sample_numbers, vec![1]);
        assert_eq!(stbl.child_body::<StszBox>(fourcc(b"stsz")).unwrap().sizes(), vec![10, 12]);
        assert!(stbl.child(fourcc(b"ctts")).is_none());
        let mvhd = moov.child_body::<MvhdBox>(fourcc(b"mvhd")).unwrap();
        // 2048 ticks at 48 kHz in a 1000 Hz movie
        assert_eq!(mvhd.duration, 42);
        assert_eq!(mvhd.next_track_id, 2);
    }

    #[test]
    fn large_offsets_switch_to_co64() {
        let chunks = vec![Chunk {
            track_id: 1,
            samples: vec![stored(1, true, 0)],
        }];
        let placed = place_chunks(&chunks, 1 << 32);
        let moov = build_moov(&MovieConfig::default(), &[aac_track(1)], Some(&placed)).unwrap();
        assert!(moov.find(fourcc(b"co64")).is_some());
        assert!(moov.find(fourcc(b"stco")).is_none());
    }

    #[test]
    fn groups_use_default_and_explicit_entries() {
        let mut a = stored(1, true, 0);
        let b = stored(1, true, 1024);
        a.sample_groups.insert(ROLL, SampleGroupDescription::Roll(-2));
        let default = DefaultSampleGroup {
            grouping_type: ROLL,
            description: SampleGroupDescription::Roll(1),
        };
        let boxes = group_boxes(&[&a, &b], Some(&default), false);
        assert_eq!(boxes.len(), 2);
        let sgpd = boxes[0].get::<SgpdBox>().unwrap();
        assert_eq!(sgpd.version, 2);
        assert_eq!(sgpd.entries.len(), 2);
        let sbgp = boxes[1].get::<SbgpBox>().unwrap();
        assert_eq!(sbgp.index_for(0), Some(2));
        assert_eq!(sbgp.index_for(1), Some(1));

        let local = group_boxes(&[&a, &b], Some(&default), true);
        let sbgp = local[1].get::<SbgpBox>().unwrap();
        assert_eq!(sbgp.index_for(0), Some(0x10001));
        assert_eq!(sbgp.index_for(1), Some(1));
    }

    #[test]
    fn fragment_data_offsets_point_past_moof() {
        let chunks = vec![
            Chunk {
                track_id: 1,
                samples: vec![stored(5, true, 0)],
            },
            Chunk {
                track_id: 1,
                samples: vec![stored(7, false, 1024)],
            },
        ];
        let f = build_fragment(3, &[aac_track(1)], &chunks, None).unwrap();
        let mut diag = Diagnostics::new();
        let parsed = parse_boxes(&f.bytes, 0, default_registry(), ParseOptions::default(), &mut diag)
            .unwrap();
        let moof_len = parsed[0].size();
        let truns: Vec<&TrunBox> = parsed[0]
            .find_all(fourcc(b"trun"))
            .into_iter()
            .filter_map(|b| b.get())
            .collect();
        assert_eq!(truns[0].data_offset as u64, moof_len + 8);
        assert_eq!(truns[1].data_offset as u64, moof_len + 8 + 5);
        assert_eq!(f.info.size, moof_len + 8 + 12);
        assert!(f.info.starts_with_sap);
    }
}
