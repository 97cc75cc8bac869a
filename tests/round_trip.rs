mod common;

use common::*;
use isobmff::boxes::{BoxBody, StszBox};
use isobmff::tree::{ParseOptions, parse_boxes};
use isobmff::{
    Diagnostics, MemoryWriter, Mp4Box, Mp4Reader, Mp4Type, Mp4Writer, WriterSample, default_registry,
};
use isobmff::writer::MovieConfig;

const STSZ_PATH: [&[u8; 4]; 5] = [b"trak", b"mdia", b"minf", b"stbl", b"stsz"];

fn fourccs(path: &[&[u8; 4]]) -> Vec<isobmff::FourCC> {
    path.iter().map(|p| isobmff::FourCC(**p)).collect()
}

#[test]
fn flat_file_reads_back_sample_for_sample() {
    let bytes = flat_av_file();
    let reader = Mp4Reader::from_bytes(bytes).unwrap();
    assert_eq!(reader.mp4_type(), Mp4Type::FlatMp4);
    assert_eq!(reader.track_ids(), vec![1, 2]);

    let expected: Vec<Vec<u8>> = video_samples().into_iter().map(|s| s.data).collect();
    assert_eq!(track_payloads(&reader, 1), expected);
    let expected: Vec<Vec<u8>> = audio_samples(20).into_iter().map(|s| s.data).collect();
    assert_eq!(track_payloads(&reader, 2), expected);

    let video = reader.table(1).unwrap();
    assert_eq!(video.timescale, 1000);
    assert_eq!(video.duration(), 400);
    let sync: Vec<usize> = video
        .samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_sync)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(sync, vec![0, 10, 20, 30]);
    assert!(video.samples.iter().all(|s| s.fragment_number == 0));
    assert_eq!(video.samples[3].dts, 30);
    assert!(reader.diagnostics().is_empty());
}

#[test]
fn composition_offsets_survive() {
    let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
    let v = w.add_track(avc_track()).unwrap();
    let offsets = [20i64, 50, 0, -10, 10];
    for (i, cts) in offsets.iter().enumerate() {
        w.add_sample(v, WriterSample::new(payload(1, i, 8), 10, i == 0).with_cts_offset(*cts))
            .unwrap();
    }
    let reader = Mp4Reader::from_bytes(w.serialize().unwrap().unwrap()).unwrap();
    let table = reader.table(v).unwrap();
    let got: Vec<i64> = table.samples.iter().map(|s| s.cts_offset).collect();
    assert_eq!(got, offsets);
    assert_eq!(table.samples[3].pts(), Some(20));

    let mut r = reader.sample_reader(v).unwrap();
    let first = r.next_sample(true).unwrap().unwrap();
    assert_eq!(first.index, 0);
    assert_eq!(first.pts, Some(20));
}

#[test]
fn missing_sync_table_means_every_sample_is_sync() {
    let reader = Mp4Reader::from_bytes(flat_audio_file(12)).unwrap();
    let table = reader.table(1).unwrap();
    assert_eq!(table.samples.len(), 12);
    assert!(table.samples.iter().all(|s| s.is_sync));
    let trak = reader.trak(1).unwrap();
    assert!(trak.find(isobmff::FourCC(*b"stss")).is_none());
}

#[test]
fn container_sizes_add_up() {
    let bytes = flat_av_file();
    let reader = Mp4Reader::from_bytes(bytes.clone()).unwrap();
    let total: u64 = reader.tree().iter().map(Mp4Box::size).sum();
    assert_eq!(total, bytes.len() as u64);

    let mut checked = 0;
    for top in reader.tree() {
        top.walk(&mut |b, _| {
            if matches!(b.body, BoxBody::Container) {
                let children: u64 = b.children.iter().map(Mp4Box::size).sum();
                assert_eq!(b.size(), 8 + children, "box {}", b.typ);
                checked += 1;
            }
        });
    }
    assert!(checked > 5);
}

#[test]
fn sample_count_mismatch_is_fatal() {
    let bytes = flat_audio_file(5);
    let mut diag = Diagnostics::new();
    let opts = ParseOptions {
        load_mdat: true,
        ..ParseOptions::default()
    };
    let mut tree = parse_boxes(&bytes, 0, default_registry(), opts, &mut diag).unwrap();
    let moov = tree
        .iter_mut()
        .find(|b| b.typ == isobmff::FourCC(*b"moov"))
        .unwrap();
    let stsz = moov
        .find_path_mut(&fourccs(&STSZ_PATH))
        .and_then(|b| b.get_mut::<StszBox>())
        .unwrap();
    let mut sizes = stsz.sizes();
    sizes.push(7);
    *stsz = StszBox::from_sizes(sizes);

    let mut out = Vec::new();
    for b in &mut tree {
        out.extend(b.to_bytes().unwrap());
    }
    let err = Mp4Reader::from_bytes(out).unwrap_err();
    assert!(err.is_malformed(), "{err}");
}

#[test]
fn reader_clones_share_tables() {
    let reader = Mp4Reader::from_bytes(flat_av_file()).unwrap();
    let clone = reader.try_clone().unwrap();
    assert_eq!(clone.tables(), reader.tables());
    assert_eq!(track_payloads(&clone, 2), track_payloads(&reader, 2));
}

#[test]
fn file_writer_matches_memory_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.mp4");
    let mut w = isobmff::FileWriter::new(
        MovieConfig::default(),
        isobmff::writer::OutputConfig::new(&path),
    )
    .unwrap();
    let v = w.add_track(avc_track()).unwrap();
    let a = w.add_track(aac_track()).unwrap();
    for s in video_samples() {
        w.add_sample(v, s).unwrap();
    }
    for s in audio_samples(20) {
        w.add_sample(a, s).unwrap();
    }
    w.close().unwrap();

    let from_file = Mp4Reader::open(&path).unwrap();
    let from_memory = Mp4Reader::from_bytes(flat_av_file()).unwrap();
    assert_eq!(from_file.tables(), from_memory.tables());
    assert_eq!(track_payloads(&from_file, 1), track_payloads(&from_memory, 1));
}
