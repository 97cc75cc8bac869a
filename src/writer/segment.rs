//! Segmented output: an init segment, then media segments each holding every
//! fragment buffered since the previous one.

use super::config::MovieConfig;
use super::fragmented::{FragmentSequencer, init_segment, segment_index};
use super::sample_store::Payload;
use super::tree_builder::styp_box;
use super::{Mp4Writer, TrackConfig, WriterCore, WriterSample};
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{debug, warn};

/// State shared by the file and memory segment writers.
#[derive(Debug)]
struct Segmenter {
    core: WriterCore,
    sequencer: FragmentSequencer,
    emit_styp: bool,
    segments: u32,
}

impl Segmenter {
    fn new(movie: MovieConfig, kind: &'static str, emit_styp: bool) -> Result<Self> {
        Ok(Self {
            core: WriterCore::new(movie, kind)?,
            sequencer: FragmentSequencer::new(),
            emit_styp,
            segments: 0,
        })
    }

    fn init(&mut self) -> Result<Vec<u8>> {
        self.core.check_open()?;
        if self.core.frozen {
            return Err(Error::precondition("init segment already created"));
        }
        let bytes = init_segment(&self.core)?;
        self.core.frozen = true;
        Ok(bytes)
    }

    fn media(&mut self, last: bool) -> Result<Vec<u8>> {
        self.core.check_open()?;
        if !self.core.frozen {
            return Err(Error::precondition("media segment requested before the init segment"));
        }
        let fragments = self.sequencer.drain(&mut self.core)?;
        if fragments.is_empty() {
            return Err(Error::precondition("no buffered samples for a media segment"));
        }
        let mut out = Vec::new();
        if self.emit_styp {
            out.extend(styp_box(last).to_bytes()?);
        }
        let infos: Vec<_> = fragments.iter().map(|f| f.info).collect();
        if let Some(sidx) = segment_index(&self.core, &infos)? {
            out.extend(sidx);
        }
        for f in fragments {
            out.extend(f.bytes);
        }
        self.segments += 1;
        debug!(segment = self.segments, last, bytes = out.len(), "media segment built");
        Ok(out)
    }

    fn close(&mut self) {
        if self.core.closed {
            return;
        }
        let pending = self.core.store.pending();
        if pending > 0 {
            warn!(pending, "closing segment writer with unwritten samples");
        }
        self.core.closed = true;
    }
}

/// Writes every segment to its own file.
#[derive(Debug)]
pub struct SegmentFileWriter {
    inner: Segmenter,
}

impl SegmentFileWriter {
    pub fn new(movie: MovieConfig) -> Result<Self> {
        Ok(Self {
            inner: Segmenter::new(movie, "SegmentFileWriter", true)?,
        })
    }
}

impl Mp4Writer for SegmentFileWriter {
    fn kind(&self) -> &'static str {
        "SegmentFileWriter"
    }

    fn add_track(&mut self, config: TrackConfig) -> Result<u32> {
        self.inner.core.add_track(config)
    }

    fn add_sample(&mut self, track_id: u32, sample: WriterSample) -> Result<()> {
        self.inner.core.push(track_id, sample, |d| Ok(Payload::Memory(d)))
    }

    fn create_init_file_segment(&mut self, path: &Path) -> Result<()> {
        let bytes = self.inner.init()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn create_media_file_segment(&mut self, path: &Path, last: bool) -> Result<()> {
        let bytes = self.inner.media(last)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

impl Drop for SegmentFileWriter {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Returns every segment as a buffer. Whether media segments start with a
/// styp is chosen at construction.
#[derive(Debug)]
pub struct SegmentMemoryWriter {
    inner: Segmenter,
}

impl SegmentMemoryWriter {
    pub fn new(movie: MovieConfig, emit_styp: bool) -> Result<Self> {
        Ok(Self {
            inner: Segmenter::new(movie, "SegmentMemoryWriter", emit_styp)?,
        })
    }
}

impl Mp4Writer for SegmentMemoryWriter {
    fn kind(&self) -> &'static str {
        "SegmentMemoryWriter"
    }

    fn add_track(&mut self, config: TrackConfig) -> Result<u32> {
        self.inner.core.add_track(config)
    }

    fn add_sample(&mut self, track_id: u32, sample: WriterSample) -> Result<()> {
        self.inner.core.push(track_id, sample, |d| Ok(Payload::Memory(d)))
    }

    fn create_init_segment(&mut self) -> Result<Vec<u8>> {
        self.inner.init()
    }

    fn create_media_mem_segment(&mut self, last: bool) -> Result<Vec<u8>> {
        self.inner.media(last)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Mp4Type, get_mp4_type_from_buffer};
    use crate::writer::config::{MediaConfig, VideoConfig};
    use crate::boxes::sample_entry::AVC1;

    fn avc() -> TrackConfig {
        TrackConfig::new(
            90000,
            MediaConfig::Avc(VideoConfig {
                coding_name: AVC1,
                width: 320,
                height: 240,
                config_record: vec![1, 0x64, 0, 0x1f, 0xff, 0xe0, 0],
            }),
        )
    }

    fn feed(w: &mut dyn Mp4Writer, id: u32, fragment: u32) {
        for i in 0..4 {
            w.add_sample(
                id,
                WriterSample::new(vec![0, 0, 0, 1, 0x65], 3000, i == 0).with_fragment(fragment),
            )
            .unwrap();
        }
    }

    #[test]
    fn memory_segments_with_and_without_styp() {
        let mut w = SegmentMemoryWriter::new(MovieConfig::default(), true).unwrap();
        let id = w.add_track(avc()).unwrap();
        let init = w.create_init_segment().unwrap();
        assert_eq!(get_mp4_type_from_buffer(&init), Mp4Type::InitSegment);
        feed(&mut w, id, 1);
        let seg = w.create_media_mem_segment(false).unwrap();
        assert_eq!(&seg[4..8], b"styp");
        assert_eq!(get_mp4_type_from_buffer(&seg), Mp4Type::MediaSegment);
        assert!(!seg.windows(4).any(|x| x == b"lmsg"));
        feed(&mut w, id, 2);
        let last = w.create_media_mem_segment(true).unwrap();
        assert!(last.windows(4).any(|x| x == b"lmsg"));

        let mut bare = SegmentMemoryWriter::new(MovieConfig::default(), false).unwrap();
        let id = bare.add_track(avc()).unwrap();
        bare.create_init_segment().unwrap();
        feed(&mut bare, id, 1);
        let seg = bare.create_media_mem_segment(true).unwrap();
        assert_eq!(&seg[4..8], b"moof");
    }

    #[test]
    fn media_before_init_is_rejected() {
        let mut w = SegmentMemoryWriter::new(MovieConfig::default(), true).unwrap();
        let id = w.add_track(avc()).unwrap();
        feed(&mut w, id, 1);
        assert!(w.create_media_mem_segment(false).is_err());
        assert!(w.serialize().is_err());
    }

    #[test]
    fn file_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SegmentFileWriter::new(MovieConfig::default()).unwrap();
        let id = w.add_track(avc()).unwrap();
        w.create_init_file_segment(&dir.path().join("init.mp4")).unwrap();
        feed(&mut w, id, 1);
        w.create_media_file_segment(&dir.path().join("seg1.m4s"), true).unwrap();
        w.close().unwrap();
        let seg = std::fs::read(dir.path().join("seg1.m4s")).unwrap();
        assert!(seg.windows(4).any(|x| x == b"lmsg"));
        assert!(w.create_init_segment().is_err());
    }
}
