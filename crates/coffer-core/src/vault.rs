use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{CofferError, Result};

/// Lifecycle state of a vault. `Encrypting` and `Decrypting` are persisted
/// before the file pass runs, so a crash mid-operation leaves the on-disk
/// config flagged for recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VaultState {
    Locked,
    Unlocked,
    Encrypting,
    Decrypting,
    Error,
}

impl VaultState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VaultState::Locked => "locked",
            VaultState::Unlocked => "unlocked",
            VaultState::Encrypting => "encrypting",
            VaultState::Decrypting => "decrypting",
            VaultState::Error => "error",
        }
    }
}

// Fields declared in alphabetical order: the pretty-printed config is
// key-sorted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    pub auto_lock_minutes: u32,
    pub created_at: DateTime<Utc>,
    pub file_count: u64,
    pub folder_path: PathBuf,
    pub id: Uuid,
    pub last_unlocked_at: Option<DateTime<Utc>>,
    pub name: String,
    pub state: VaultState,
    pub total_size: u64,
    #[serde(rename = "useTouchID")]
    pub use_touch_id: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    pub auto_lock_on_screen_lock: bool,
    pub auto_lock_on_sleep: bool,
    pub default_auto_lock_minutes: u32,
    pub show_dock_icon: bool,
    pub show_menubar_icon: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            auto_lock_on_screen_lock: true,
            auto_lock_on_sleep: true,
            default_auto_lock_minutes: 5,
            show_dock_icon: true,
            show_menubar_icon: true,
        }
    }
}

/// The persisted vault list plus global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    #[serde(default)]
    pub global_settings: GlobalSettings,
    #[serde(default)]
    pub vaults: Vec<Vault>,
}

impl VaultConfig {
    pub fn vault(&self, id: Uuid) -> Option<&Vault> {
        self.vaults.iter().find(|v| v.id == id)
    }

    pub fn vault_mut(&mut self, id: Uuid) -> Option<&mut Vault> {
        self.vaults.iter_mut().find(|v| v.id == id)
    }

    /// Vault identifiers are unique and no two vaults name the same folder.
    pub fn check_new_folder(&self, folder: &Path) -> Result<()> {
        if let Some(existing) = self.vaults.iter().find(|v| v.folder_path == folder) {
            return Err(CofferError::VaultAlreadyExists(
                existing.folder_path.clone(),
            ));
        }
        Ok(())
    }
}
