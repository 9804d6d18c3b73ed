use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::{CofferError, Result};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "loganross";
pub const APP_NAME: &str = "coffer";

pub const CONFIG_FILE_NAME: &str = "vaults.json";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_dir) = std::env::var("COFFER_DATA_DIR") {
        return Ok(PathBuf::from(override_dir));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        CofferError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "cannot determine user data directory",
        ))
    })?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(CONFIG_FILE_NAME))
}
