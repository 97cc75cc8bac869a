//! Buffered samples of every track, handed out as time-ordered chunks.
//!
//! Samples are bucketed by their decode time converted to movie time. One
//! bucket spans the configured chunk duration; within a bucket the tracks
//! follow in the order they were added. The output order therefore depends only
//! on sample timing, never on the order callers fed the tracks.

use super::config::ChunkConfig;
use crate::boxes::{FourCC, SampleGroupDescription};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Where a buffered sample's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Memory(Vec<u8>),
    /// Written to the writer's spill file at `offset`.
    Spilled { offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSample {
    pub payload: Payload,
    pub size: u32,
    pub duration: u32,
    pub cts_offset: i64,
    pub is_sync: bool,
    pub fragment_number: u32,
    pub sample_groups: BTreeMap<FourCC, SampleGroupDescription>,
    /// Decode time in track timescale, assigned by the store.
    pub dts: u64,
}

/// Consecutive samples of one track that are written back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub track_id: u32,
    pub samples: Vec<StoredSample>,
}

impl Chunk {
    pub fn byte_len(&self) -> u64 {
        self.samples.iter().map(|s| s.size as u64).sum()
    }

    pub fn duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }
}

#[derive(Debug)]
struct TrackQueue {
    track_id: u32,
    timescale: u32,
    pending: VecDeque<StoredSample>,
    next_dts: u64,
}

#[derive(Debug)]
pub struct InterleavingStore {
    movie_timescale: u32,
    /// Bucket width in movie ticks.
    bucket: u64,
    tracks: Vec<TrackQueue>,
}

impl InterleavingStore {
    pub fn new(movie_timescale: u32, chunk: ChunkConfig) -> Self {
        let bucket = (chunk.duration_ms * movie_timescale as u64 / 1000).max(1);
        Self {
            movie_timescale,
            bucket,
            tracks: Vec::new(),
        }
    }

    pub fn add_track(&mut self, track_id: u32, timescale: u32) -> Result<()> {
        if self.tracks.iter().any(|t| t.track_id == track_id) {
            return Err(Error::precondition(format!("track {track_id} added twice")));
        }
        self.tracks.push(TrackQueue {
            track_id,
            timescale,
            pending: VecDeque::new(),
            next_dts: 0,
        });
        Ok(())
    }

    fn queue_mut(&mut self, track_id: u32) -> Result<&mut TrackQueue> {
        self.tracks
            .iter_mut()
            .find(|t| t.track_id == track_id)
            .ok_or_else(|| Error::precondition(format!("unknown track {track_id}")))
    }

    /// Buffers a sample; its decode time follows the track's previous sample.
    pub fn push(&mut self, track_id: u32, mut sample: StoredSample) -> Result<()> {
        let q = self.queue_mut(track_id)?;
        sample.dts = q.next_dts;
        q.next_dts += sample.duration as u64;
        q.pending.push_back(sample);
        Ok(())
    }

    /// Decode time the next sample of `track_id` will get.
    pub fn next_dts(&self, track_id: u32) -> Option<u64> {
        self.tracks
            .iter()
            .find(|t| t.track_id == track_id)
            .map(|t| t.next_dts)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.iter().all(|t| t.pending.is_empty())
    }

    pub fn pending(&self) -> usize {
        self.tracks.iter().map(|t| t.pending.len()).sum()
    }

    /// Fragment numbers with buffered samples, ascending.
    pub fn fragment_numbers(&self) -> BTreeSet<u32> {
        self.tracks
            .iter()
            .flat_map(|t| t.pending.iter().map(|s| s.fragment_number))
            .collect()
    }

    /// Removes every buffered sample, interleaved.
    pub fn drain_all(&mut self) -> Vec<Chunk> {
        self.drain_where(|_| true)
    }

    /// Removes the samples of one fragment, interleaved.
    pub fn drain_fragment(&mut self, fragment_number: u32) -> Vec<Chunk> {
        self.drain_where(|s| s.fragment_number == fragment_number)
    }

    fn drain_where(&mut self, take: impl Fn(&StoredSample) -> bool) -> Vec<Chunk> {
        let mut keyed = Vec::new();
        for (ti, q) in self.tracks.iter_mut().enumerate() {
            let (taken, kept): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut q.pending).into_iter().partition(|s| take(s));
            q.pending = kept;
            let mut current: Option<(u64, Chunk)> = None;
            for s in taken {
                let b = bucket_of(s.dts, q.timescale, self.movie_timescale, self.bucket);
                match &mut current {
                    Some((cb, chunk)) if *cb == b => chunk.samples.push(s),
                    _ => {
                        if let Some((cb, chunk)) = current.take() {
                            keyed.push((cb, ti, chunk));
                        }
                        current = Some((
                            b,
                            Chunk {
                                track_id: q.track_id,
                                samples: vec![s],
                            },
                        ));
                    }
                }
            }
            if let Some((cb, chunk)) = current {
                keyed.push((cb, ti, chunk));
            }
        }
        keyed.sort_by_key(|(b, ti, _)| (*b, *ti));
        keyed.into_iter().map(|(_, _, c)| c).collect()
    }
}

fn bucket_of(dts: u64, track_timescale: u32, movie_timescale: u32, bucket: u64) -> u64 {
    let movie_time = dts as u128 * movie_timescale as u128 / track_timescale.max(1) as u128;
    (movie_time / bucket as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(duration: u32, fragment_number: u32) -> StoredSample {
        StoredSample {
            payload: Payload::Memory(vec![0; 4]),
            size: 4,
            duration,
            cts_offset: 0,
            is_sync: true,
            fragment_number,
            sample_groups: BTreeMap::new(),
            dts: 0,
        }
    }

    #[test]
    fn order_is_independent_of_call_order() {
        let mut a = InterleavingStore::new(1000, ChunkConfig::default());
        a.add_track(1, 1000).unwrap();
        a.add_track(2, 48000).unwrap();
        // track 2 first: 3 s of audio, then 3 s of video
        for _ in 0..3 {
            a.push(2, sample(48000, 0)).unwrap();
        }
        for _ in 0..6 {
            a.push(1, sample(500, 0)).unwrap();
        }
        let chunks = a.drain_all();
        let order: Vec<(u32, usize)> = chunks.iter().map(|c| (c.track_id, c.samples.len())).collect();
        assert_eq!(order, vec![(1, 2), (2, 1), (1, 2), (2, 1), (1, 2), (2, 1)]);
        assert!(a.is_empty());
    }

    #[test]
    fn fragments_drain_separately() {
        let mut s = InterleavingStore::new(1000, ChunkConfig::default());
        s.add_track(1, 1000).unwrap();
        s.push(1, sample(100, 1)).unwrap();
        s.push(1, sample(100, 1)).unwrap();
        s.push(1, sample(100, 2)).unwrap();
        assert_eq!(s.fragment_numbers(), BTreeSet::from([1, 2]));
        let first = s.drain_fragment(1);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].samples[1].dts, 100);
        assert_eq!(s.pending(), 1);
        assert_eq!(s.next_dts(1), Some(300));
    }

    #[test]
    fn unknown_track_is_rejected() {
        let mut s = InterleavingStore::new(1000, ChunkConfig::default());
        assert!(s.push(7, sample(1, 0)).is_err());
        s.add_track(7, 10).unwrap();
        assert!(s.add_track(7, 10).is_err());
    }
}
