//! Atomic JSON persistence of the vault list and global settings.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::fs_atomic;
use crate::paths;
use crate::vault::VaultConfig;

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Creates parent directories as needed.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// `vaults.json` in the user-scoped app-data directory.
    pub fn at_default_location() -> Result<Self> {
        Self::new(paths::config_file_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty default config, not an error.
    pub fn load(&self) -> Result<VaultConfig> {
        if !self.path.exists() {
            return Ok(VaultConfig::default());
        }
        let json = fs::read_to_string(&self.path)?;
        let config: VaultConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn save(&self, config: &VaultConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        fs_atomic::write_atomic(&self.path, json.as_bytes())?;
        debug!(path = %self.path.display(), vaults = config.vaults.len(), "config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{Vault, VaultState};
    use chrono::Utc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn sample_vault(folder: PathBuf) -> Vault {
        Vault {
            auto_lock_minutes: 5,
            created_at: Utc::now(),
            file_count: 12,
            folder_path: folder,
            id: Uuid::new_v4(),
            last_unlocked_at: None,
            name: "Docs".into(),
            state: VaultState::Locked,
            total_size: 4096,
            use_touch_id: true,
        }
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("vaults.json")).unwrap();
        let config = store.load().unwrap();
        assert!(config.vaults.is_empty());
        assert_eq!(config.global_settings.default_auto_lock_minutes, 5);
        assert!(config.global_settings.auto_lock_on_sleep);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested").join("vaults.json")).unwrap();

        let mut config = VaultConfig::default();
        config.vaults.push(sample_vault(dir.path().join("docs")));
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.vaults.len(), 1);
        assert_eq!(loaded.vaults[0].id, config.vaults[0].id);
        assert_eq!(loaded.vaults[0].state, VaultState::Locked);
    }

    #[test]
    fn serialized_shape_matches_schema() {
        let dir = tempdir().unwrap();
        let mut config = VaultConfig::default();
        config.vaults.push(sample_vault(dir.path().to_path_buf()));

        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"globalSettings\""));
        assert!(json.contains("\"autoLockOnScreenLock\""));
        assert!(json.contains("\"useTouchID\""));
        assert!(json.contains("\"lastUnlockedAt\": null"));
        assert!(json.contains("\"state\": \"locked\""));
    }

    #[test]
    fn save_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("vaults.json")).unwrap();
        store.save(&VaultConfig::default()).unwrap();
        store.save(&VaultConfig::default()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["vaults.json".to_string()]);
    }
}
