//! Write side: per-track configuration and samples in, box trees and media
//! bytes out.
//!
//! Every writer shares one pipeline. Samples are buffered per track in an
//! [`InterleavingStore`], drained as time-ordered chunks, and laid out by the
//! functions in [`tree_builder`]. The five writers differ only in where the
//! bytes go and which of the [`Mp4Writer`] operations they implement.

pub mod config;
mod flat;
mod fragmented;
pub mod sample_store;
mod segment;
pub mod tree_builder;

pub use config::{
    AacConfig, ChunkConfig, DefaultSampleGroup, IodsConfig, JxsConfig, MediaConfig, MovieConfig,
    MpeghConfig, NclxColour, OutputConfig, SidxConfig, TrackConfig, VideoConfig,
};
pub use flat::{FileWriter, MemoryWriter};
pub use fragmented::FragmentedFileWriter;
pub use sample_store::InterleavingStore;
pub use segment::{SegmentFileWriter, SegmentMemoryWriter};

use crate::boxes::{FourCC, SampleGroupDescription};
use crate::error::{Error, Result, check_sample_size};
use sample_store::{Payload, StoredSample};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;
use tree_builder::WriteTrack;

/// One access unit handed to a writer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriterSample {
    pub data: Vec<u8>,
    /// In track timescale.
    pub duration: u32,
    pub cts_offset: i64,
    pub is_sync: bool,
    /// Samples sharing a number end up in the same fragment. Ignored by flat
    /// writers.
    pub fragment_number: u32,
    pub sample_groups: BTreeMap<FourCC, SampleGroupDescription>,
}

impl WriterSample {
    pub fn new(data: Vec<u8>, duration: u32, is_sync: bool) -> Self {
        Self {
            data,
            duration,
            is_sync,
            ..Self::default()
        }
    }

    pub fn with_cts_offset(mut self, cts_offset: i64) -> Self {
        self.cts_offset = cts_offset;
        self
    }

    pub fn with_fragment(mut self, fragment_number: u32) -> Self {
        self.fragment_number = fragment_number;
        self
    }

    pub fn with_group(mut self, grouping_type: FourCC, description: SampleGroupDescription) -> Self {
        self.sample_groups.insert(grouping_type, description);
        self
    }
}

fn not_supported(kind: &str, op: &str) -> Error {
    Error::precondition(format!("{op} is not supported by {kind}"))
}

/// Common surface of all writers. Output operations a writer does not
/// implement fail with [`Error::Precondition`].
pub trait Mp4Writer {
    /// Name of the concrete writer, used in error messages.
    fn kind(&self) -> &'static str;

    /// Registers a track and returns its id.
    fn add_track(&mut self, config: TrackConfig) -> Result<u32>;

    fn add_sample(&mut self, track_id: u32, sample: WriterSample) -> Result<()>;

    /// Writes every buffered fragment to the output.
    fn create_media_fragments(&mut self) -> Result<()> {
        Err(not_supported(self.kind(), "create_media_fragments"))
    }

    fn create_init_file_segment(&mut self, _path: &Path) -> Result<()> {
        Err(not_supported(self.kind(), "create_init_file_segment"))
    }

    fn create_media_file_segment(&mut self, _path: &Path, _last: bool) -> Result<()> {
        Err(not_supported(self.kind(), "create_media_file_segment"))
    }

    fn create_init_segment(&mut self) -> Result<Vec<u8>> {
        Err(not_supported(self.kind(), "create_init_segment"))
    }

    fn create_media_mem_segment(&mut self, _last: bool) -> Result<Vec<u8>> {
        Err(not_supported(self.kind(), "create_media_mem_segment"))
    }

    /// Produces the whole file. `Ok(None)` when it was already produced.
    fn serialize(&mut self) -> Result<Option<Vec<u8>>> {
        Err(not_supported(self.kind(), "serialize"))
    }

    fn close(&mut self) -> Result<()>;
}

/// State every writer carries: configuration, tracks and the sample store.
#[derive(Debug)]
pub(crate) struct WriterCore {
    pub movie: MovieConfig,
    pub tracks: Vec<WriteTrack>,
    pub store: InterleavingStore,
    pub closed: bool,
    /// Set once track layout has been written out.
    pub frozen: bool,
    kind: &'static str,
}

impl WriterCore {
    pub fn new(movie: MovieConfig, kind: &'static str) -> Result<Self> {
        movie.validate()?;
        let store = InterleavingStore::new(movie.timescale, movie.chunk);
        Ok(Self {
            movie,
            tracks: Vec::new(),
            store,
            closed: false,
            frozen: false,
            kind,
        })
    }

    pub fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::precondition(format!("{} is closed", self.kind)));
        }
        Ok(())
    }

    pub fn add_track(&mut self, mut config: TrackConfig) -> Result<u32> {
        self.check_open()?;
        if self.frozen {
            return Err(Error::precondition(format!(
                "{}: tracks must be added before the init data is written",
                self.kind
            )));
        }
        config.validate()?;
        let track_id = match config.track_id {
            Some(id) => id,
            None => self.tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1,
        };
        self.store.add_track(track_id, config.timescale)?;
        config.track_id = Some(track_id);
        debug!(
            writer = self.kind,
            track_id,
            coding = %config.media.coding_name(),
            "track added"
        );
        self.tracks.push(WriteTrack { track_id, config });
        Ok(track_id)
    }

    pub fn track(&self, track_id: u32) -> Option<&WriteTrack> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }

    /// Buffers `sample`; `store_data` decides where its bytes live.
    pub fn push(
        &mut self,
        track_id: u32,
        sample: WriterSample,
        store_data: impl FnOnce(Vec<u8>) -> Result<Payload>,
    ) -> Result<()> {
        self.check_open()?;
        if self.track(track_id).is_none() {
            return Err(Error::precondition(format!(
                "{}: unknown track {track_id}",
                self.kind
            )));
        }
        check_sample_size(sample.data.len() as u64)?;
        let WriterSample {
            data,
            duration,
            cts_offset,
            is_sync,
            fragment_number,
            sample_groups,
        } = sample;
        let size = data.len() as u32;
        let payload = store_data(data)?;
        self.store.push(
            track_id,
            StoredSample {
                payload,
                size,
                duration,
                cts_offset,
                is_sync,
                fragment_number,
                sample_groups,
                dts: 0,
            },
        )
    }

    /// Track the segment index refers to: the configured one, else the first
    /// video track, else the first track.
    pub fn reference_track(&self) -> Option<&WriteTrack> {
        let configured = self
            .movie
            .sidx
            .and_then(|s| s.reference_track_id)
            .and_then(|id| self.track(id));
        configured
            .or_else(|| self.tracks.iter().find(|t| t.config.media.is_video()))
            .or_else(|| self.tracks.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::sample_group::ROLL;

    struct Bare;

    impl Mp4Writer for Bare {
        fn kind(&self) -> &'static str {
            "Bare"
        }
        fn add_track(&mut self, _config: TrackConfig) -> Result<u32> {
            Ok(1)
        }
        fn add_sample(&mut self, _track_id: u32, _sample: WriterSample) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unimplemented_operations_name_the_writer() {
        let mut w = Bare;
        let err = w.create_init_segment().unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.to_string().contains("Bare"));
        assert!(w.serialize().is_err());
    }

    #[test]
    fn sample_builder() {
        let s = WriterSample::new(vec![1, 2], 10, true)
            .with_cts_offset(-3)
            .with_fragment(4)
            .with_group(ROLL, SampleGroupDescription::Roll(1));
        assert_eq!(s.cts_offset, -3);
        assert_eq!(s.fragment_number, 4);
        assert_eq!(s.sample_groups.len(), 1);
    }
}
