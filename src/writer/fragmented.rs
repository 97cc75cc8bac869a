//! Single-file fragmented output: ftyp and moov once, then moof/mdat pairs as
//! fragments are created. A segment index, when configured, is inserted right
//! after the moov when the writer closes.

use super::config::{MovieConfig, OutputConfig};
use super::sample_store::Payload;
use super::tree_builder::{BuiltFragment, FragmentInfo, build_fragment, build_moov, build_sidx, ftyp_box};
use super::{Mp4Writer, TrackConfig, WriterCore, WriterSample};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use tracing::{debug, error, info, warn};

/// ftyp plus a moov describing the tracks with empty sample tables.
pub(crate) fn init_segment(core: &WriterCore) -> Result<Vec<u8>> {
    let mut out = ftyp_box(&core.movie).to_bytes()?;
    let mut moov = build_moov(&core.movie, &core.tracks, None)?;
    moov.update_size()?;
    moov.write(&mut out)?;
    Ok(out)
}

/// Hands out moof sequence numbers across every fragment a writer produces.
#[derive(Debug)]
pub(crate) struct FragmentSequencer {
    next_sequence: u32,
}

impl FragmentSequencer {
    pub fn new() -> Self {
        Self { next_sequence: 1 }
    }

    /// Builds one fragment per buffered fragment number, lowest number first.
    pub fn drain(&mut self, core: &mut WriterCore) -> Result<Vec<BuiltFragment>> {
        let reference = core.reference_track().map(|t| t.track_id);
        let mut out = Vec::new();
        for number in core.store.fragment_numbers() {
            let chunks = core.store.drain_fragment(number);
            if chunks.is_empty() {
                continue;
            }
            let fragment = build_fragment(self.next_sequence, &core.tracks, &chunks, reference)?;
            debug!(
                fragment_number = number,
                sequence_number = self.next_sequence,
                bytes = fragment.info.size,
                "fragment built"
            );
            self.next_sequence += 1;
            out.push(fragment);
        }
        Ok(out)
    }
}

/// sidx over `fragments` for the writer's reference track, if one is configured.
pub(crate) fn segment_index(core: &WriterCore, fragments: &[FragmentInfo]) -> Result<Option<Vec<u8>>> {
    if core.movie.sidx.is_none() {
        return Ok(None);
    }
    let Some(reference) = core.reference_track() else {
        return Ok(None);
    };
    if fragments.is_empty() {
        warn!("segment index requested but no fragments were written");
        return Ok(None);
    }
    let mut sidx = build_sidx(reference.track_id, reference.config.timescale, fragments)?;
    Ok(Some(sidx.to_bytes()?))
}

#[derive(Debug)]
pub struct FragmentedFileWriter {
    core: WriterCore,
    output: OutputConfig,
    file: Option<BufWriter<File>>,
    init_len: u64,
    sequencer: FragmentSequencer,
    fragments: Vec<FragmentInfo>,
}

impl FragmentedFileWriter {
    pub fn new(movie: MovieConfig, output: OutputConfig) -> Result<Self> {
        let file = BufWriter::new(File::create(&output.path)?);
        Ok(Self {
            core: WriterCore::new(movie, "FragmentedFileWriter")?,
            output,
            file: Some(file),
            init_len: 0,
            sequencer: FragmentSequencer::new(),
            fragments: Vec::new(),
        })
    }

    fn file(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::precondition("FragmentedFileWriter output already finished"))
    }

    fn ensure_init(&mut self) -> Result<()> {
        if self.core.frozen {
            return Ok(());
        }
        let init = init_segment(&self.core)?;
        self.file()?.write_all(&init)?;
        self.init_len = init.len() as u64;
        self.core.frozen = true;
        Ok(())
    }

    fn flush_fragments(&mut self) -> Result<()> {
        self.ensure_init()?;
        let built = self.sequencer.drain(&mut self.core)?;
        for f in built {
            self.file()?.write_all(&f.bytes)?;
            self.fragments.push(f.info);
        }
        Ok(())
    }

    /// Rewrites the output with the sidx between moov and the first moof.
    /// Data offsets are moof-relative, so moving fragments does not break them.
    fn insert_sidx(&mut self, sidx: &[u8]) -> Result<()> {
        let dir = match self.output.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut src = File::open(&self.output.path)?;
        io::copy(&mut (&mut src).take(self.init_len), &mut tmp)?;
        tmp.write_all(sidx)?;
        io::copy(&mut src, &mut tmp)?;
        tmp.flush()?;
        tmp.persist(&self.output.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush_fragments()?;
        if let Some(mut f) = self.file.take() {
            f.flush()?;
        }
        if let Some(sidx) = segment_index(&self.core, &self.fragments)? {
            self.insert_sidx(&sidx)?;
        }
        info!(
            path = %self.output.path.display(),
            fragments = self.fragments.len(),
            "wrote fragmented file"
        );
        Ok(())
    }
}

impl Mp4Writer for FragmentedFileWriter {
    fn kind(&self) -> &'static str {
        "FragmentedFileWriter"
    }

    fn add_track(&mut self, config: TrackConfig) -> Result<u32> {
        self.core.add_track(config)
    }

    fn add_sample(&mut self, track_id: u32, sample: WriterSample) -> Result<()> {
        self.core.push(track_id, sample, |d| Ok(Payload::Memory(d)))
    }

    fn create_media_fragments(&mut self) -> Result<()> {
        self.core.check_open()?;
        self.flush_fragments()
    }

    fn close(&mut self) -> Result<()> {
        if self.core.closed {
            return Ok(());
        }
        self.core.closed = true;
        self.finish()
    }
}

impl Drop for FragmentedFileWriter {
    fn drop(&mut self) {
        if !self.core.closed {
            if let Err(e) = self.close() {
                error!(path = %self.output.path.display(), error = %e, "closing FragmentedFileWriter failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Mp4Type, get_mp4_type_from_buffer};
    use crate::writer::config::{AacConfig, MediaConfig, SidxConfig};

    fn aac() -> TrackConfig {
        TrackConfig::new(
            48000,
            MediaConfig::Aac(AacConfig {
                sample_rate: 48000,
                channel_count: 1,
                esds: vec![0; 8],
            }),
        )
    }

    #[test]
    fn writes_fragments_and_sidx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frag.mp4");
        let movie = MovieConfig {
            sidx: Some(SidxConfig::default()),
            ..MovieConfig::default()
        };
        let mut w = FragmentedFileWriter::new(movie, OutputConfig::new(&path)).unwrap();
        let id = w.add_track(aac()).unwrap();
        for i in 0..6u32 {
            w.add_sample(id, WriterSample::new(vec![i as u8; 3], 1024, true).with_fragment(i / 3 + 1))
                .unwrap();
        }
        w.create_media_fragments().unwrap();
        assert!(w.add_track(aac()).is_err());
        w.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(get_mp4_type_from_buffer(&bytes), Mp4Type::FragmentedMp4);
        let sidx_at = bytes.windows(4).position(|w| w == b"sidx").unwrap();
        let moof_at = bytes.windows(4).position(|w| w == b"moof").unwrap();
        assert!(sidx_at < moof_at);
    }

    #[test]
    fn segment_operations_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut w =
            FragmentedFileWriter::new(MovieConfig::default(), OutputConfig::new(dir.path().join("x.mp4")))
                .unwrap();
        assert!(w.create_init_segment().is_err());
        assert!(w.serialize().is_err());
    }
}
