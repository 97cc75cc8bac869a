mod common;

use common::*;
use isobmff::boxes::ElstEntry;
use isobmff::writer::{MovieConfig, OutputConfig};
use isobmff::{
    CopyConfig, FragmentedFileWriter, MemoryWriter, Mp4Reader, Mp4Type, Mp4Writer, WriterSample,
    combine_tracks, copy_track, defragment,
};
use std::collections::BTreeMap;
use std::path::Path;

/// 30 video frames in three fragments of ten, each opening on a sync sample.
fn fragmented_video(path: &Path) {
    let mut w = FragmentedFileWriter::new(MovieConfig::default(), OutputConfig::new(path)).unwrap();
    let id = w.add_track(avc_track()).unwrap();
    for i in 0..30usize {
        let s = WriterSample::new(payload(1, i, 40), 10, i % 10 == 0).with_fragment(i as u32 / 10 + 1);
        w.add_sample(id, s).unwrap();
    }
    w.close().unwrap();
}

/// Sample count per fragment number.
fn fragment_sizes(reader: &Mp4Reader, track_id: u32) -> BTreeMap<u32, usize> {
    let mut out = BTreeMap::new();
    for s in &reader.table(track_id).unwrap().samples {
        *out.entry(s.fragment_number).or_default() += 1;
    }
    out
}

#[test]
fn combining_two_audio_files() {
    let a = Mp4Reader::from_bytes(flat_audio_file(100)).unwrap();
    let b = Mp4Reader::from_bytes(flat_audio_file(100)).unwrap();
    let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
    let reports = combine_tracks(&[a, b], &mut w).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].track_id, 1);
    assert_eq!(reports[1].track_id, 2);
    assert!(reports.iter().all(|r| r.samples == 100 && r.source_track_id == 1));

    let out = Mp4Reader::from_bytes(w.serialize().unwrap().unwrap()).unwrap();
    assert_eq!(out.mp4_type(), Mp4Type::FlatMp4);
    assert_eq!(out.track_count(), 2);
    let expected: Vec<Vec<u8>> = audio_samples(100).into_iter().map(|s| s.data).collect();
    assert_eq!(track_payloads(&out, 1), expected);
    assert_eq!(track_payloads(&out, 2), expected);
}

#[test]
fn fragmented_file_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frag.mp4");
    fragmented_video(&path);
    let reader = Mp4Reader::open(&path).unwrap();
    assert_eq!(reader.mp4_type(), Mp4Type::FragmentedMp4);
    assert_eq!(fragment_sizes(&reader, 1), BTreeMap::from([(1, 10), (2, 10), (3, 10)]));
    let table = reader.table(1).unwrap();
    assert_eq!(table.samples[25].dts, 250);
    let expected: Vec<Vec<u8>> = (0..30).map(|i| payload(1, i, 40)).collect();
    assert_eq!(track_payloads(&reader, 1), expected);
}

#[test]
fn defragmenting_three_fragments() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frag.mp4");
    fragmented_video(&path);
    let source = Mp4Reader::open(&path).unwrap();

    let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
    let reports = defragment(&source, &mut w).unwrap();
    assert_eq!(reports[0].samples, 30);
    assert_eq!(reports[0].fragments, 1);

    let flat = Mp4Reader::from_bytes(w.serialize().unwrap().unwrap()).unwrap();
    assert_eq!(flat.mp4_type(), Mp4Type::FlatMp4);
    let table = flat.table(1).unwrap();
    assert_eq!(table.samples.len(), 30);
    assert!(table.samples.iter().all(|s| s.fragment_number == 0));
    let sync: Vec<bool> = table.samples.iter().map(|s| s.is_sync).collect();
    let source_sync: Vec<bool> = source.table(1).unwrap().samples.iter().map(|s| s.is_sync).collect();
    assert_eq!(sync, source_sync);
    assert_eq!(track_payloads(&flat, 1), track_payloads(&source, 1));
}

#[test]
fn refragment_at_sync_samples() {
    let source = Mp4Reader::from_bytes(flat_av_file()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.mp4");
    let mut w = FragmentedFileWriter::new(MovieConfig::default(), OutputConfig::new(&path)).unwrap();
    let mut track = source.track_reader(1).unwrap();
    let report = copy_track(&mut track, &mut w, &CopyConfig::every_sync()).unwrap();
    assert_eq!(report.fragments, 4);
    w.close().unwrap();

    let out = Mp4Reader::open(&path).unwrap();
    let sizes = fragment_sizes(&out, report.track_id);
    assert_eq!(sizes.values().copied().collect::<Vec<_>>(), vec![10, 10, 10, 10]);
    let table = out.table(report.track_id).unwrap();
    let mut last = None;
    for s in &table.samples {
        if last != Some(s.fragment_number) {
            assert!(s.is_sync, "fragment {} opens on a non-sync sample", s.fragment_number);
            last = Some(s.fragment_number);
        }
    }
}

#[test]
fn refragment_by_duration_needs_sync_boundaries() {
    let source = Mp4Reader::from_bytes(flat_av_file()).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let mut w = FragmentedFileWriter::new(
        MovieConfig::default(),
        OutputConfig::new(dir.path().join("a.mp4")),
    )
    .unwrap();
    let mut track = source.track_reader(1).unwrap();
    // 150 ticks lands mid-GOP
    assert!(copy_track(&mut track, &mut w, &CopyConfig::every(150)).is_err());

    let mut w = FragmentedFileWriter::new(
        MovieConfig::default(),
        OutputConfig::new(dir.path().join("b.mp4")),
    )
    .unwrap();
    let mut track = source.track_reader(1).unwrap();
    let report = copy_track(&mut track, &mut w, &CopyConfig::every(200)).unwrap();
    assert_eq!(report.fragments, 2);
    assert!(report.diagnostics.is_empty());
}

#[test]
fn keeping_fragment_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("src.mp4");
    fragmented_video(&src_path);
    let source = Mp4Reader::open(&src_path).unwrap();

    let out_path = dir.path().join("copy.mp4");
    let mut w =
        FragmentedFileWriter::new(MovieConfig::default(), OutputConfig::new(&out_path)).unwrap();
    let mut track = source.track_reader(1).unwrap();
    let report = copy_track(&mut track, &mut w, &CopyConfig::keep_fragments()).unwrap();
    assert_eq!(report.fragments, 3);
    assert_eq!(report.bytes, 30 * 40);
    w.close().unwrap();

    let out = Mp4Reader::open(&out_path).unwrap();
    assert_eq!(fragment_sizes(&out, 1), fragment_sizes(&source, 1));
}

#[test]
fn edit_lists_are_rebased_or_dropped() {
    let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
    let mut cfg = avc_track();
    cfg.edit_list = vec![ElstEntry::new(400, 0)];
    let id = w.add_track(cfg).unwrap();
    for s in video_samples() {
        w.add_sample(id, s).unwrap();
    }
    let source = Mp4Reader::from_bytes(w.serialize().unwrap().unwrap()).unwrap();
    assert_eq!(source.edit_list(id), vec![ElstEntry::new(400, 0)]);

    let movie = MovieConfig {
        timescale: 600,
        ..MovieConfig::default()
    };
    let mut w = MemoryWriter::new(movie).unwrap();
    let config = CopyConfig {
        old_movie_timescale: Some(1000),
        new_movie_timescale: Some(600),
        ..CopyConfig::default()
    };
    let report = copy_track(&mut source.track_reader(id).unwrap(), &mut w, &config).unwrap();
    assert!(!report.edit_list_dropped);
    let copied = Mp4Reader::from_bytes(w.serialize().unwrap().unwrap()).unwrap();
    assert_eq!(copied.edit_list(report.track_id), vec![ElstEntry::new(240, 0)]);

    let dir = tempfile::tempdir().unwrap();
    let mut w = FragmentedFileWriter::new(
        MovieConfig::default(),
        OutputConfig::new(dir.path().join("f.mp4")),
    )
    .unwrap();
    let report =
        copy_track(&mut source.track_reader(id).unwrap(), &mut w, &CopyConfig::every_sync()).unwrap();
    assert!(report.edit_list_dropped);
    assert!(report.diagnostics.contains("edit list"));
}
