#![allow(dead_code)]

use isobmff::boxes::sample_entry::AVC1;
use isobmff::writer::{AacConfig, MediaConfig, MovieConfig, TrackConfig, VideoConfig};
use isobmff::{MemoryWriter, Mp4Reader, Mp4Writer, WriterSample};

pub fn avc_track() -> TrackConfig {
    TrackConfig::new(
        1000,
        MediaConfig::Avc(VideoConfig {
            coding_name: AVC1,
            width: 320,
            height: 240,
            config_record: vec![1, 0x42, 0xc0, 0x1e, 0xff, 0xe1, 0x00, 0x00],
        }),
    )
}

pub fn aac_track() -> TrackConfig {
    TrackConfig::new(
        48000,
        MediaConfig::Aac(AacConfig {
            sample_rate: 48000,
            channel_count: 2,
            esds: vec![0, 0, 0, 0, 3, 0x19, 0, 1],
        }),
    )
}

/// Payload whose bytes identify the track and sample.
pub fn payload(track: u8, index: usize, len: usize) -> Vec<u8> {
    let mut v = vec![track; len];
    v[0] = (index % 251) as u8;
    v
}

/// 40 video frames of 10 ms with a sync sample every 10 frames.
pub fn video_samples() -> Vec<WriterSample> {
    (0..40)
        .map(|i| WriterSample::new(payload(1, i, 50 + i % 7), 10, i % 10 == 0))
        .collect()
}

/// `n` AAC frames of 1024 ticks.
pub fn audio_samples(n: usize) -> Vec<WriterSample> {
    (0..n)
        .map(|i| WriterSample::new(payload(2, i, 20 + i % 3), 1024, true))
        .collect()
}

/// Flat file with one video and one audio track.
pub fn flat_av_file() -> Vec<u8> {
    let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
    let v = w.add_track(avc_track()).unwrap();
    let a = w.add_track(aac_track()).unwrap();
    for s in video_samples() {
        w.add_sample(v, s).unwrap();
    }
    for s in audio_samples(20) {
        w.add_sample(a, s).unwrap();
    }
    w.serialize().unwrap().unwrap()
}

/// Flat file with a single audio track of `n` samples.
pub fn flat_audio_file(n: usize) -> Vec<u8> {
    let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
    let a = w.add_track(aac_track()).unwrap();
    for s in audio_samples(n) {
        w.add_sample(a, s).unwrap();
    }
    w.serialize().unwrap().unwrap()
}

/// Every sample payload of a track, in decode order.
pub fn track_payloads(reader: &Mp4Reader, track_id: u32) -> Vec<Vec<u8>> {
    let mut r = reader.sample_reader(track_id).unwrap();
    let mut out = Vec::new();
    while let Some(s) = r.next_sample(false).unwrap() {
        out.push(s.data);
    }
    out
}
