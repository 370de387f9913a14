//! Persisted result: run lock and atomic write.
//!
//! Results live at `<output_dir>/<system>_<days>d.json` (see [`window_stem`]). The lock file next
//! to it is created exclusively, so a second run for the same window fails
//! fast instead of racing on the result.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::OutputError;
use crate::model::AnalysisResult;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File-name stem of a window, e.g. `ERP_30d`.
///
/// System names that are not plain `[A-Za-z0-9-]` are sanitized and tagged
/// with a digest of the raw name, so `ERP/Main` and `ERP_Main` never share a
/// result file or a lock.
pub fn window_stem(system: &str, days: u32) -> String {
    let plain = |c: char| c.is_ascii_alphanumeric() || c == '-';
    if !system.is_empty() && system.chars().all(plain) {
        return format!("{system}_{days}d");
    }
    let safe: String = system
        .chars()
        .map(|c| if plain(c) { c } else { '_' })
        .collect();
    let digest = hex::encode(Sha256::digest(system.as_bytes()));
    format!("{safe}-{}_{days}d", &digest[..12])
}

pub fn result_path(output_dir: &Path, system: &str, days: u32) -> PathBuf {
    output_dir.join(format!("{}.json", window_stem(system, days)))
}

/// Exclusive lock of one analysis window. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(output_dir: &Path, system: &str, days: u32) -> Result<Self, OutputError> {
        std::fs::create_dir_all(output_dir).map_err(io_error(output_dir))?;
        let path = output_dir.join(format!("{}.lock", window_stem(system, days)));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // owner pid, for whoever finds a stale lock
                let _ = writeln!(file, "{}", std::process::id());
                debug!(lock = %path.display(), "run lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(OutputError::Locked(path))
            }
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

/// Write `result` to `path` through a temp file in the same directory and
/// rename it into place. Readers see the old file or the new one, never a
/// partial write.
pub fn write_atomic(path: &Path, result: &AnalysisResult) -> Result<(), OutputError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_error(dir))?;

    let tmp = NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, result)?;
        writer.flush().map_err(io_error(tmp.path()))?;
    }
    tmp.as_file().sync_all().map_err(io_error(tmp.path()))?;
    tmp.persist(path)
        .map_err(|e| io_error(path)(e.error))?;
    debug!(path = %path.display(), "result written");
    Ok(())
}

pub fn read_result(path: &Path) -> Result<AnalysisResult, OutputError> {
    let file = File::open(path).map_err(io_error(path))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}
