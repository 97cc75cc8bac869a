//! Non-fragmented output: ftyp, moov, then a single mdat.

use super::config::{MovieConfig, OutputConfig};
use super::sample_store::{Chunk, Payload};
use super::tree_builder::{build_moov, ftyp_box, mdat_header_len, place_chunks};
use super::{Mp4Writer, TrackConfig, WriterCore, WriterSample};
use crate::boxes::write_box_header;
use crate::error::{Error, Result};
use crate::tree::MDAT;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use tracing::{debug, error, info};

const MAX_LAYOUT_PASSES: usize = 8;

/// Serializes ftyp, moov and the mdat header for `chunks`.
///
/// Chunk offsets depend on the moov size, which in turn depends on whether
/// offsets need co64, so the moov is rebuilt until its size stops changing.
fn flat_header(core: &WriterCore, chunks: &[Chunk]) -> Result<Vec<u8>> {
    let mut head = ftyp_box(&core.movie).to_bytes()?;
    let payload: u64 = chunks.iter().map(Chunk::byte_len).sum();
    let mdat_header = mdat_header_len(payload);

    let mut moov_len = 0u64;
    for _ in 0..MAX_LAYOUT_PASSES {
        let data_start = head.len() as u64 + moov_len + mdat_header;
        let placed = place_chunks(chunks, data_start);
        let mut moov = build_moov(&core.movie, &core.tracks, Some(&placed))?;
        let size = moov.update_size()?;
        if size == moov_len {
            moov.write(&mut head)?;
            write_box_header(&mut head, MDAT, None, mdat_header + payload, mdat_header == 16);
            return Ok(head);
        }
        moov_len = size;
    }
    Err(Error::precondition("moov size did not settle"))
}

/// Flat writer that keeps everything in memory and hands the file back from
/// [`Mp4Writer::serialize`], once.
#[derive(Debug)]
pub struct MemoryWriter {
    core: WriterCore,
    serialized: bool,
}

impl MemoryWriter {
    pub fn new(movie: MovieConfig) -> Result<Self> {
        Ok(Self {
            core: WriterCore::new(movie, "MemoryWriter")?,
            serialized: false,
        })
    }
}

impl Mp4Writer for MemoryWriter {
    fn kind(&self) -> &'static str {
        "MemoryWriter"
    }

    fn add_track(&mut self, config: TrackConfig) -> Result<u32> {
        self.core.add_track(config)
    }

    fn add_sample(&mut self, track_id: u32, sample: WriterSample) -> Result<()> {
        if self.serialized {
            return Err(Error::precondition("MemoryWriter already serialized"));
        }
        self.core.push(track_id, sample, |d| Ok(Payload::Memory(d)))
    }

    fn serialize(&mut self) -> Result<Option<Vec<u8>>> {
        if self.core.closed || self.serialized {
            error!("MemoryWriter::serialize called after the output was produced or the writer closed");
            return Ok(None);
        }
        let chunks = self.core.store.drain_all();
        let mut out = flat_header(&self.core, &chunks)?;
        for chunk in &chunks {
            for s in &chunk.samples {
                if let Payload::Memory(d) = &s.payload {
                    out.extend_from_slice(d);
                }
            }
        }
        self.serialized = true;
        self.core.frozen = true;
        debug!(bytes = out.len(), "serialized flat file");
        Ok(Some(out))
    }

    fn close(&mut self) -> Result<()> {
        self.core.closed = true;
        Ok(())
    }
}

/// Flat writer backed by a file. Sample bytes go to an anonymous temp file as
/// they arrive; [`Mp4Writer::close`] writes ftyp and moov and then copies the
/// samples behind them.
#[derive(Debug)]
pub struct FileWriter {
    core: WriterCore,
    output: OutputConfig,
    spill: Option<BufWriter<File>>,
    spilled: u64,
}

impl FileWriter {
    pub fn new(movie: MovieConfig, output: OutputConfig) -> Result<Self> {
        let spill = match &output.temp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Self {
            core: WriterCore::new(movie, "FileWriter")?,
            output,
            spill: Some(BufWriter::new(spill)),
            spilled: 0,
        })
    }

    fn finish(&mut self) -> Result<()> {
        let chunks = self.core.store.drain_all();
        let head = flat_header(&self.core, &chunks)?;
        let mut src = match self.spill.take() {
            Some(w) => w.into_inner().map_err(|e| Error::Io(e.into_error()))?,
            None => return Err(Error::precondition("FileWriter spill file already consumed")),
        };

        let mut out = BufWriter::new(File::create(&self.output.path)?);
        out.write_all(&head)?;
        let mut buf = Vec::new();
        let mut written = head.len() as u64;
        for chunk in &chunks {
            for s in &chunk.samples {
                match &s.payload {
                    Payload::Spilled { offset } => {
                        src.seek(SeekFrom::Start(*offset))?;
                        buf.resize(s.size as usize, 0);
                        src.read_exact(&mut buf)?;
                        out.write_all(&buf)?;
                    }
                    Payload::Memory(d) => out.write_all(d)?,
                }
                written += s.size as u64;
            }
        }
        out.flush()?;
        info!(path = %self.output.path.display(), bytes = written, "wrote flat file");
        Ok(())
    }
}

impl Mp4Writer for FileWriter {
    fn kind(&self) -> &'static str {
        "FileWriter"
    }

    fn add_track(&mut self, config: TrackConfig) -> Result<u32> {
        self.core.add_track(config)
    }

    fn add_sample(&mut self, track_id: u32, sample: WriterSample) -> Result<()> {
        let spill = &mut self.spill;
        let spilled = &mut self.spilled;
        self.core.push(track_id, sample, |d| {
            let w = spill
                .as_mut()
                .ok_or_else(|| Error::precondition("FileWriter spill file already consumed"))?;
            w.write_all(&d)?;
            let offset = *spilled;
            *spilled += d.len() as u64;
            Ok(Payload::Spilled { offset })
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.core.closed {
            return Ok(());
        }
        self.core.closed = true;
        self.core.frozen = true;
        self.finish()
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if !self.core.closed {
            if let Err(e) = self.close() {
                error!(path = %self.output.path.display(), error = %e, "closing FileWriter failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Mp4Type, get_mp4_type_from_buffer};
    use crate::writer::config::{AacConfig, MediaConfig};

    fn aac() -> TrackConfig {
        TrackConfig::new(
            44100,
            MediaConfig::Aac(AacConfig {
                sample_rate: 44100,
                channel_count: 2,
                esds: vec![0; 8],
            }),
        )
    }

    #[test]
    fn serialize_is_single_shot() {
        let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
        let id = w.add_track(aac()).unwrap();
        for _ in 0..3 {
            w.add_sample(id, WriterSample::new(vec![1, 2, 3], 1024, true)).unwrap();
        }
        let bytes = w.serialize().unwrap().unwrap();
        assert_eq!(get_mp4_type_from_buffer(&bytes), Mp4Type::FlatMp4);
        assert_eq!(&bytes[bytes.len() - 3..], &[1, 2, 3]);
        assert!(w.serialize().unwrap().is_none());
        assert!(w.add_sample(id, WriterSample::new(vec![1], 1, true)).is_err());
    }

    #[test]
    fn serialize_after_close_yields_nothing() {
        let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
        w.close().unwrap();
        assert!(w.serialize().unwrap().is_none());
    }

    #[test]
    fn unsupported_operation_is_precondition() {
        let mut w = MemoryWriter::new(MovieConfig::default()).unwrap();
        let err = w.create_media_fragments().unwrap_err();
        assert!(err.to_string().contains("MemoryWriter"));
    }

    #[test]
    fn file_writer_multiplexes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut w = FileWriter::new(MovieConfig::default(), OutputConfig::new(&path)).unwrap();
        let id = w.add_track(aac()).unwrap();
        w.add_sample(id, WriterSample::new(vec![7; 5], 1024, true)).unwrap();
        w.add_sample(id, WriterSample::new(vec![8; 5], 1024, true)).unwrap();
        w.close().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(get_mp4_type_from_buffer(&bytes), Mp4Type::FlatMp4);
        assert_eq!(&bytes[bytes.len() - 10..bytes.len() - 5], &[7; 5]);
        assert!(w.add_sample(id, WriterSample::new(vec![1], 1, true)).is_err());
    }

    #[test]
    fn file_writer_closes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.mp4");
        {
            let mut w = FileWriter::new(MovieConfig::default(), OutputConfig::new(&path)).unwrap();
            let id = w.add_track(aac()).unwrap();
            w.add_sample(id, WriterSample::new(vec![1; 4], 1024, true)).unwrap();
        }
        assert!(path.exists());
    }
}
