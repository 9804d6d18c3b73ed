//! Open-file-handle probe guarding the lock operation: encrypting a file
//! another process is writing would corrupt it.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::warn;

pub trait OpenHandleProbe: Send + Sync {
    /// Paths under `folder` currently held open by any process.
    fn open_files_under(&self, folder: &Path) -> Vec<PathBuf>;
}

/// `lsof`-backed probe. Fails open: when the tool is missing or produces
/// garbage the probe reports no open files and the lock proceeds.
pub struct LsofProbe;

impl OpenHandleProbe for LsofProbe {
    fn open_files_under(&self, folder: &Path) -> Vec<PathBuf> {
        let output = match Command::new("lsof").arg("-Fn").arg("+D").arg(folder).output() {
            Ok(output) => output,
            Err(err) => {
                warn!("lsof unavailable, skipping open-handle check: {err}");
                return Vec::new();
            }
        };
        // lsof exits non-zero when nothing matches; only the `n` field
        // lines of its machine-readable output matter.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut paths = Vec::new();
        for line in stdout.lines() {
            if let Some(name) = line.strip_prefix('n') {
                let path = PathBuf::from(name);
                if path.starts_with(folder) && path.is_file() && !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }
}

/// Probe that never reports open files, for harnesses and shells that do
/// their own checking.
pub struct NullProbe;

impl OpenHandleProbe for NullProbe {
    fn open_files_under(&self, _folder: &Path) -> Vec<PathBuf> {
        Vec::new()
    }
}
