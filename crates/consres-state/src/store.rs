//! StateFile: checkpoint of the job table in a single versioned blob.
//!
//! A save writes `<dir>/cons_res_state.new`, rotates the current blob to
//! `.old` and renames the new file into place. Saves are skipped while the
//! engine's change generation has not moved since the last one.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use consres_core::Granularity;
use consres_select::{JobDirectory, SavedAllocation, SelectEngine};

use crate::codec::{self, BlobHeader};
use crate::error::{StateError, StateResult};

pub const STATE_FILE: &str = "cons_res_state";

#[derive(Debug)]
pub struct StateFile {
    dir: PathBuf,
    saved_generation: Option<u64>,
}

impl StateFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            saved_generation: None,
        }
    }

    /// Path of the live blob.
    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn sibling(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}.{ext}"))
    }

    /// Generation covered by the last successful save or restore.
    pub fn saved_generation(&self) -> Option<u64> {
        self.saved_generation
    }

    /// Write the engine's job table if it changed since the last save.
    /// Returns whether a blob was written. On failure the saved generation
    /// stays put so the next call retries.
    pub fn save(&mut self, engine: &SelectEngine) -> StateResult<bool> {
        let generation = engine.generation();
        if self.saved_generation == Some(generation) {
            debug!(generation, "state unchanged, save skipped");
            return Ok(false);
        }

        let jobs = engine.saved_allocations();
        let header = BlobHeader::current(engine.config().select.granularity);
        let written = codec::encode(&header, &jobs).and_then(|blob| self.write_blob(&blob));
        if let Err(e) = written {
            error!(path = %self.path().display(), error = %e, "state save failed");
            return Err(e);
        }

        self.saved_generation = Some(generation);
        info!(path = %self.path().display(), jobs = jobs.len(), generation, "state saved");
        Ok(true)
    }

    fn write_blob(&self, blob: &[u8]) -> StateResult<()> {
        fs::create_dir_all(&self.dir)?;
        let new = self.sibling("new");
        {
            let mut file = File::create(&new)?;
            write_all(&mut file, blob)?;
            file.sync_all()?;
        }
        match fs::rename(self.path(), self.sibling("old")) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::rename(&new, self.path())?;
        Ok(())
    }

    /// Raw header and job records, whatever their version.
    pub fn read_blob(&self) -> StateResult<Option<(BlobHeader, Vec<SavedAllocation>)>> {
        let Some(mut bytes) = self.read_bytes()? else {
            return Ok(None);
        };
        let header = codec::decode_header(&mut bytes)?;
        let jobs = codec::decode_jobs(&mut bytes)?;
        Ok(Some((header, jobs)))
    }

    /// Saved allocations written by this version of the code. `Ok(None)`
    /// when there is no blob or its version fields do not match.
    pub fn load(&self, granularity: Granularity) -> StateResult<Option<Vec<SavedAllocation>>> {
        let Some(bytes) = self.read_bytes()? else {
            debug!(path = %self.path().display(), "no saved state");
            return Ok(None);
        };
        let jobs = codec::decode(bytes, granularity)?;
        if jobs.is_none() {
            info!(path = %self.path().display(), "saved state has another version, starting clean");
        }
        Ok(jobs)
    }

    /// Load the blob and reapply it to a freshly initialised engine. Any
    /// failure falls back to a clean start. Returns the number of jobs
    /// restored.
    pub fn restore(&mut self, engine: &mut SelectEngine, directory: &dyn JobDirectory) -> usize {
        let granularity = engine.config().select.granularity;
        let restored = match self.load(granularity) {
            Ok(Some(saved)) => engine.restore(saved, directory),
            Ok(None) => 0,
            Err(e) => {
                warn!(path = %self.path().display(), error = %e, "saved state unreadable, starting clean");
                0
            }
        };
        self.saved_generation = Some(engine.generation());
        restored
    }

    fn read_bytes(&self) -> StateResult<Option<Bytes>> {
        read_file(&self.path())
    }
}

fn read_file(path: &Path) -> StateResult<Option<Bytes>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write loop that retries interrupted writes and treats a zero-length
/// write as a short write.
fn write_all(out: &mut impl Write, blob: &[u8]) -> StateResult<()> {
    let mut written = 0;
    while written < blob.len() {
        match out.write(&blob[written..]) {
            Ok(0) => {
                return Err(StateError::ShortWrite {
                    written,
                    expected: blob.len(),
                });
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    out.flush().map_err(StateError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Accepts a few bytes per call, interrupting every other call, then
    /// stops accepting anything.
    struct Flaky {
        data: Vec<u8>,
        calls: usize,
        cap: usize,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::Error::from(ErrorKind::Interrupted));
            }
            let n = buf.len().min(3).min(self.cap - self.data.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_loop_retries_interrupts() {
        let mut out = Flaky {
            data: Vec::new(),
            calls: 0,
            cap: usize::MAX,
        };
        write_all(&mut out, b"checkpoint").unwrap();
        assert_eq!(out.data, b"checkpoint");
    }

    #[test]
    fn write_loop_reports_short_write() {
        let mut out = Flaky {
            data: Vec::new(),
            calls: 0,
            cap: 4,
        };
        let err = write_all(&mut out, b"checkpoint").unwrap_err();
        assert!(matches!(
            err,
            StateError::ShortWrite {
                written: 4,
                expected: 10
            }
        ));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path());
        assert!(file.read_blob().unwrap().is_none());
        assert!(file.load(Granularity::Core).unwrap().is_none());
        assert_eq!(file.path(), dir.path().join(STATE_FILE));
    }
}
