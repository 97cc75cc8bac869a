mod common;

use common::*;
use isobmff::boxes::sample_entry::{JXSM, MHM1};
use isobmff::writer::{JxsConfig, MediaConfig, MovieConfig, MpeghConfig, NclxColour, TrackConfig};
use isobmff::{
    AudioTrackReader, JxsTrackReader, MemoryWriter, Mp4Reader, Mp4Writer, MpeghTrackReader,
    SeekConfig, SeekMode, VideoTrackReader, WriterSample,
};

fn seek_index(reader: &Mp4Reader, timestamp: u64, timescale: u32, mode: SeekMode) -> usize {
    let mut r = reader.sample_reader(1).unwrap();
    let sample = r
        .sample_by_timestamp(&SeekConfig::new(timestamp, timescale, mode), false)
        .unwrap()
        .unwrap();
    sample.index
}

#[test]
fn seek_policies_pick_sync_samples() {
    let reader = Mp4Reader::from_bytes(flat_av_file()).unwrap();
    assert_eq!(seek_index(&reader, 140, 1000, SeekMode::NearestSyncSample), 10);
    assert_eq!(seek_index(&reader, 140, 1000, SeekMode::NextSyncSampleGreater), 20);
    assert_eq!(seek_index(&reader, 140, 1000, SeekMode::LastSyncSampleSmaller), 10);
    // 0.25 s expressed in microseconds
    assert_eq!(seek_index(&reader, 250_000, 1_000_000, SeekMode::NextSyncSampleGreater), 30);
    assert_eq!(seek_index(&reader, 250_000, 1_000_000, SeekMode::LastSyncSampleSmaller), 20);
    assert_eq!(seek_index(&reader, 10_000, 1000, SeekMode::NextSyncSampleGreater), 30);
}

#[test]
fn seek_moves_the_cursor() {
    let reader = Mp4Reader::from_bytes(flat_av_file()).unwrap();
    let mut r = reader.sample_reader(1).unwrap();
    let cfg = SeekConfig::new(200, 1000, SeekMode::NearestSyncSample);
    let target = r.resolve_timestamp(&cfg).unwrap();
    assert_eq!(target.index, 20);
    assert_eq!(target.pts, Some(200));
    assert_eq!(r.cursor(), 0);
    r.sample_by_timestamp(&cfg, false).unwrap();
    assert_eq!(r.next_sample(false).unwrap().unwrap().index, 21);
}

#[test]
fn end_of_track_and_bad_index() {
    let reader = Mp4Reader::from_bytes(flat_audio_file(3)).unwrap();
    let mut r = reader.sample_reader(1).unwrap();
    assert_eq!(r.sample_count(), 3);
    assert_eq!(r.max_sample_size(), 22);
    for _ in 0..3 {
        assert!(r.next_sample(true).unwrap().is_some());
    }
    assert!(r.next_sample(true).unwrap().is_none());
    assert!(r.sample_by_index(3, false).is_err());
    assert!(reader.sample_reader(9).is_err());
}

#[test]
fn video_reader_splits_nal_units() {
    let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
    let id = w.add_track(avc_track()).unwrap();
    let frame = vec![0, 0, 0, 2, 0x65, 0x88, 0, 0, 0, 1, 0x06];
    w.add_sample(id, WriterSample::new(frame, 33, true)).unwrap();
    let reader = Mp4Reader::from_bytes(w.serialize().unwrap().unwrap()).unwrap();

    let mut video = VideoTrackReader::new(&reader, id).unwrap();
    assert_eq!((video.width(), video.height()), (320, 240));
    assert_eq!(video.nalu_length_size().unwrap(), 4);
    let sample = video.next_video_sample(false).unwrap().unwrap();
    let nalus: Vec<&[u8]> = sample.nalus().collect();
    assert_eq!(nalus, vec![&[0x65u8, 0x88][..], &[0x06u8][..]]);
    assert!(video.next_video_sample(false).unwrap().is_none());

    assert!(AudioTrackReader::new(&reader, id).is_err());
}

#[test]
fn audio_reader_exposes_entry_fields() {
    let reader = Mp4Reader::from_bytes(flat_av_file()).unwrap();
    let mut audio = AudioTrackReader::new(&reader, 2).unwrap();
    assert_eq!(audio.sample_rate(), 48000);
    assert_eq!(audio.channel_count(), 2);
    assert_eq!(audio.decoder_config_record(), Some(&[0, 0, 0, 0, 3, 0x19, 0, 1][..]));
    assert_eq!(audio.next_sample(false).unwrap().unwrap().data, payload(2, 0, 20));
    assert!(VideoTrackReader::new(&reader, 2).is_err());
    assert!(MpeghTrackReader::new(&reader, 2).is_err());
}

#[test]
fn mpegh_and_jxs_readers() {
    let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
    let mpegh = w
        .add_track(TrackConfig::new(
            48000,
            MediaConfig::Mpegh(MpeghConfig {
                coding_name: MHM1,
                sample_rate: 48000,
                channel_count: 0,
                config_record: Some(vec![1, 0x0d, 6, 0, 0]),
                compatible_sets: vec![0x0b, 0x0c],
            }),
        ))
        .unwrap();
    let jxs = w
        .add_track(TrackConfig::new(
            25,
            MediaConfig::Jxs(JxsConfig {
                width: 1920,
                height: 1080,
                brat: 200,
                frat: 0x0100_0019,
                schar: 0,
                tcod: 0,
                ppih: 0x1500,
                plev: 0x2040,
                colour: Some(NclxColour {
                    primaries: 1,
                    transfer: 1,
                    matrix: 1,
                    full_range: false,
                }),
                header: Vec::new(),
            }),
        ))
        .unwrap();
    for i in 0..4 {
        w.add_sample(mpegh, WriterSample::new(payload(3, i, 30), 1024, true)).unwrap();
        w.add_sample(jxs, WriterSample::new(payload(4, i, 60), 1, true)).unwrap();
    }
    let reader = Mp4Reader::from_bytes(w.serialize().unwrap().unwrap()).unwrap();

    let m = MpeghTrackReader::new(&reader, mpegh).unwrap();
    assert!(m.is_mhm());
    assert_eq!(m.profile_level_indication(), Some(0x0d));
    assert_eq!(m.reference_channel_layout(), Some(6));
    assert_eq!(m.compatible_profile_levels(), &[0x0b, 0x0c]);

    let mut j = JxsTrackReader::new(&reader, jxs).unwrap();
    assert_eq!(j.coding_name(), JXSM);
    assert_eq!(j.bitrate(), Some(200));
    assert_eq!(j.frame_rate(), Some(0x0100_0019));
    assert_eq!(j.profile(), Some(0x1500));
    assert_eq!(j.level(), Some(0x2040));
    assert!(j.colr().is_some());
    assert_eq!(j.sample_count(), 4);
    assert_eq!(j.next_sample(false).unwrap().unwrap().data, payload(4, 0, 60));
}
