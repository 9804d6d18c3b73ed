//! Write-to-temp, fsync, rename persistence shared by the manifest and the
//! config store. A reader observes either the old contents or the new ones,
//! never a partial write.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

use crate::error::{map_write_err, Result};

pub(crate) fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let staging = parent.join(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));
    let written = (|| {
        let mut file = File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&staging, dest)
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&staging);
        return Err(map_write_err(err));
    }
    fsync_dir(parent)?;
    Ok(())
}

pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
