//! Per-vault encryption manifest: the source of truth for how far the last
//! encryption pass got, stored inside the vault folder itself.
//!
//! Writes are atomic (sibling temp file, fsync, rename) and happen after
//! every sealed file, so a crash at any point leaves a parseable manifest
//! describing exactly which files are ciphertext.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{CofferError, Result};
use crate::fs_atomic;

pub const MANIFEST_FILE_NAME: &str = ".coffer-manifest.json";
pub const INDEX_BLOCKER_FILE_NAME: &str = ".metadata_never_index";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestStatus {
    InProgress,
    Completed,
    Interrupted,
}

/// Binary manifest fields are persisted as base64 strings.
mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

// Field order is alphabetical so pretty-printed output is key-sorted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub encrypted_size: u64,
    pub is_encrypted: bool,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    pub original_size: u64,
    pub posix_permissions: u32,
    /// Relative to the vault root, forward-slash separators.
    pub relative_path: String,
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionManifest {
    pub completed_at: Option<DateTime<Utc>>,
    pub files: Vec<FileEntry>,
    pub started_at: DateTime<Utc>,
    pub status: ManifestStatus,
    #[serde(rename = "vaultID")]
    pub vault_id: Uuid,
    pub version: u32,
}

impl EncryptionManifest {
    pub fn new(vault_id: Uuid, files: Vec<FileEntry>) -> Self {
        Self {
            completed_at: None,
            files,
            started_at: Utc::now(),
            status: ManifestStatus::InProgress,
            vault_id,
            version: MANIFEST_VERSION,
        }
    }

    pub fn path_for(folder: &Path) -> PathBuf {
        folder.join(MANIFEST_FILE_NAME)
    }

    pub fn exists(folder: &Path) -> bool {
        Self::path_for(folder).exists()
    }

    /// Parse failures surface as `ManifestCorrupted`, not a serde error.
    pub fn load(folder: &Path) -> Result<Self> {
        let json = fs::read_to_string(Self::path_for(folder))?;
        serde_json::from_str(&json).map_err(|e| CofferError::ManifestCorrupted(e.to_string()))
    }

    pub fn save(&self, folder: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs_atomic::write_atomic(&Self::path_for(folder), json.as_bytes())
    }

    pub fn mark_completed(&mut self) {
        self.status = ManifestStatus::Completed;
        self.completed_at = Some(Utc::now());
    }
}

/// True iff a manifest exists and records an unfinished pass. A manifest
/// that exists but cannot be parsed is an error the caller decides about.
pub fn has_interrupted_manifest(folder: &Path) -> Result<bool> {
    if !EncryptionManifest::exists(folder) {
        return Ok(false);
    }
    let manifest = EncryptionManifest::load(folder)?;
    Ok(matches!(
        manifest.status,
        ManifestStatus::InProgress | ManifestStatus::Interrupted
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(path: &str) -> FileEntry {
        FileEntry {
            encrypted_size: 0,
            is_encrypted: false,
            nonce: Vec::new(),
            original_size: 1000,
            posix_permissions: 0o644,
            relative_path: path.into(),
            tag: Vec::new(),
        }
    }

    #[test]
    fn save_load_roundtrip_preserves_order() {
        let dir = tempdir().unwrap();
        let manifest = EncryptionManifest::new(
            Uuid::new_v4(),
            vec![entry("a.txt"), entry("sub/b.bin"), entry("z.dat")],
        );
        manifest.save(dir.path()).unwrap();

        let loaded = EncryptionManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.vault_id, manifest.vault_id);
        assert_eq!(loaded.status, ManifestStatus::InProgress);
        let paths: Vec<&str> = loaded.files.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub/b.bin", "z.dat"]);
    }

    #[test]
    fn json_shape_matches_schema() {
        let mut manifest = EncryptionManifest::new(Uuid::new_v4(), vec![entry("a.txt")]);
        manifest.files[0].is_encrypted = true;
        manifest.files[0].nonce = vec![1; 12];
        manifest.files[0].tag = vec![2; 16];
        manifest.mark_completed();

        let json = serde_json::to_string_pretty(&manifest).unwrap();
        assert!(json.contains("\"vaultID\""));
        assert!(json.contains("\"status\": \"completed\""));
        assert!(json.contains("\"isEncrypted\": true"));
        assert!(json.contains("\"posixPermissions\": 420"));
        // Binary fields are base64 strings.
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["files"][0]["nonce"].is_string());
        assert!(value["files"][0]["tag"].is_string());
    }

    #[test]
    fn corrupted_manifest_is_reported_as_such() {
        let dir = tempdir().unwrap();
        fs::write(EncryptionManifest::path_for(dir.path()), b"{ not json").unwrap();
        assert!(matches!(
            EncryptionManifest::load(dir.path()),
            Err(CofferError::ManifestCorrupted(_))
        ));
        assert!(matches!(
            has_interrupted_manifest(dir.path()),
            Err(CofferError::ManifestCorrupted(_))
        ));
    }

    #[test]
    fn interrupted_detection() {
        let dir = tempdir().unwrap();
        assert!(!has_interrupted_manifest(dir.path()).unwrap());

        let mut manifest = EncryptionManifest::new(Uuid::new_v4(), vec![entry("a.txt")]);
        manifest.save(dir.path()).unwrap();
        assert!(has_interrupted_manifest(dir.path()).unwrap());

        manifest.status = ManifestStatus::Interrupted;
        manifest.save(dir.path()).unwrap();
        assert!(has_interrupted_manifest(dir.path()).unwrap());

        manifest.mark_completed();
        manifest.save(dir.path()).unwrap();
        assert!(!has_interrupted_manifest(dir.path()).unwrap());
        assert!(manifest.completed_at.is_some());
    }

    #[test]
    fn atomic_save_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let manifest = EncryptionManifest::new(Uuid::new_v4(), vec![entry("a.txt")]);
        manifest.save(dir.path()).unwrap();
        manifest.save(dir.path()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![MANIFEST_FILE_NAME.to_string()]);
    }
}
