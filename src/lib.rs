//! ISO Base Media File Format (MP4) reading and writing.
//!
//! Reading goes bytes -> [`tree`] -> [`extractor`] -> [`reader`] / [`track_reader`].
//! Writing goes the other way through one of the [`writer`] implementations.
//! [`copy`] connects the two.

pub mod boxes;
pub mod copy;
pub mod cursor;
pub mod dump;
pub mod error;
pub mod extractor;
pub mod reader;
pub mod registry;
pub mod track_reader;
pub mod tree;
pub mod writer;

pub use boxes::{BoxBody, BoxHeader, FourCC};
pub use copy::{CopyConfig, CopyReport, FragmentNumberPolicy, combine_tracks, copy_track, defragment};
pub use error::{Diagnostics, Error, Result};
pub use extractor::{SampleInfo, TrackSampleTable};
pub use reader::{Mp4Reader, Sample, SampleReader, SeekConfig, SeekMode};
pub use registry::{Registry, default_registry};
pub use track_reader::{
    AudioTrackReader, JxsTrackReader, MpeghTrackReader, TrackReader, VideoTrackReader,
};
pub use tree::{Mp4Box, Mp4Type, get_mp4_type_from_buffer};
pub use writer::{
    FileWriter, FragmentedFileWriter, MemoryWriter, Mp4Writer, SegmentFileWriter,
    SegmentMemoryWriter, WriterSample,
};
