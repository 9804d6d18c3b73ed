//! File-tree encryption and decryption passes.
//!
//! The encryption pass rewrites the manifest after every sealed file and
//! deletes the plaintext only after that write, so at every quiescent point
//! either the ciphertext exists with `isEncrypted = true` recorded, or the
//! plaintext exists with `isEncrypted = false`. The decryption pass never
//! rewrites the manifest; already-restored entries are detected by the
//! absence of their ciphertext.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zeroize::Zeroizing;

use crate::crypto::{self, MasterKey, NONCE_LEN, TAG_LEN};
use crate::error::{CofferError, Result};
use crate::fs_atomic;
use crate::manifest::{
    has_interrupted_manifest, EncryptionManifest, FileEntry, ManifestStatus,
    INDEX_BLOCKER_FILE_NAME, MANIFEST_FILE_NAME,
};

pub const CIPHERTEXT_EXTENSION: &str = "cfr";

const SHRED_CHUNK: usize = 64 * 1024;
const RESERVED_NAMES: [&str; 3] = [MANIFEST_FILE_NAME, INDEX_BLOCKER_FILE_NAME, ".DS_Store"];

/// `(files done, total)` after each file of a pass.
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, usize);

#[derive(Debug, Clone, Copy, Default)]
pub struct FolderStats {
    pub file_count: u64,
    pub total_size: u64,
}

// ── Enumeration ─────────────────────────────────────────────────────────────

/// Regular files under `root`, lexicographically sorted by absolute path.
/// Symlinks are never followed nor included; devices, sockets and pipes are
/// skipped; hidden entries are skipped at the top level; reserved names and
/// existing ciphertext files are skipped everywhere.
pub fn collect_regular_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        // Hidden entries are pruned at the top level only; a hidden
        // directory there is never descended into.
        .filter_entry(|e| {
            !(e.depth() == 1 && e.file_name().to_string_lossy().starts_with('.'))
        });
    for entry in walker {
        let entry = entry.map_err(|e| CofferError::CannotEnumerateDirectory(e.to_string()))?;
        let file_type = entry.file_type();
        if file_type.is_symlink() || !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if RESERVED_NAMES.contains(&name.as_str()) {
            continue;
        }
        if entry
            .path()
            .extension()
            .map_or(false, |ext| ext == CIPHERTEXT_EXTENSION)
        {
            continue;
        }
        files.push(entry.into_path());
    }
    files.sort();
    Ok(files)
}

/// The inverse: just the ciphertext files, sorted.
pub fn collect_encrypted_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| CofferError::CannotEnumerateDirectory(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .path()
            .extension()
            .map_or(false, |ext| ext == CIPHERTEXT_EXTENSION)
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn folder_stats(root: &Path) -> Result<FolderStats> {
    let files = collect_regular_files(root)?;
    let mut stats = FolderStats {
        file_count: files.len() as u64,
        total_size: 0,
    };
    for file in &files {
        stats.total_size += fs::metadata(file).map(|m| m.len()).unwrap_or(0);
    }
    Ok(stats)
}

// ── Encryption pass ─────────────────────────────────────────────────────────

/// Encrypt every regular file under `folder` in place. The manifest is
/// written before the first file and rewritten after each one, so an
/// interrupted pass can be resumed from the manifest alone.
pub fn encrypt_tree(
    folder: &Path,
    vault_id: Uuid,
    key: &MasterKey,
    progress: ProgressFn,
) -> Result<EncryptionManifest> {
    let files = collect_regular_files(folder)?;

    let mut entries = Vec::with_capacity(files.len());
    for file in &files {
        entries.push(FileEntry {
            encrypted_size: 0,
            is_encrypted: false,
            nonce: Vec::new(),
            original_size: fs::metadata(file).map(|m| m.len()).unwrap_or(0),
            posix_permissions: read_permissions(file),
            relative_path: relative_path(folder, file)?,
            tag: Vec::new(),
        });
    }
    let mut manifest = EncryptionManifest::new(vault_id, entries);
    manifest.save(folder)?;

    let total = files.len();
    info!(folder = %folder.display(), files = total, "encryption pass started");
    for (index, file) in files.iter().enumerate() {
        encrypt_one(folder, &mut manifest, index, file, key)?;
        progress(index + 1, total);
    }

    write_index_blocker(folder)?;
    manifest.mark_completed();
    manifest.save(folder)?;
    info!(folder = %folder.display(), "encryption pass completed");
    Ok(manifest)
}

fn encrypt_one(
    folder: &Path,
    manifest: &mut EncryptionManifest,
    index: usize,
    file: &Path,
    key: &MasterKey,
) -> Result<()> {
    let plaintext = Zeroizing::new(fs::read(file)?);
    let sealed = crypto::seal(&plaintext, key.as_bytes())?;
    fs_atomic::write_atomic(&ciphertext_path(file), &sealed.combined)?;

    let entry = &mut manifest.files[index];
    entry.encrypted_size = sealed.combined.len() as u64;
    entry.nonce = sealed.nonce.to_vec();
    entry.tag = sealed.tag.to_vec();
    entry.is_encrypted = true;
    manifest.save(folder)?;

    secure_delete(file)?;
    Ok(())
}

// ── Decryption pass ─────────────────────────────────────────────────────────

/// Decrypt every sealed entry of the manifest back into place, restoring
/// POSIX permissions. An entry whose ciphertext is gone but whose plaintext
/// exists was already restored by an interrupted run and is skipped;
/// `EncryptedFileMissing` means both forms are gone.
pub fn decrypt_tree(
    folder: &Path,
    vault_id: Uuid,
    key: &MasterKey,
    progress: ProgressFn,
) -> Result<()> {
    let manifest = EncryptionManifest::load(folder)?;
    if manifest.vault_id != vault_id {
        return Err(CofferError::ManifestCorrupted(format!(
            "manifest belongs to vault {}, not {}",
            manifest.vault_id, vault_id
        )));
    }

    let encrypted: Vec<&FileEntry> = manifest.files.iter().filter(|e| e.is_encrypted).collect();
    let total = encrypted.len();
    info!(folder = %folder.display(), files = total, "decryption pass started");
    for (done, entry) in encrypted.iter().enumerate() {
        let original = resolve_relative(folder, &entry.relative_path);
        let ciphertext_file = ciphertext_path(&original);
        if !ciphertext_file.exists() {
            if original.exists() {
                progress(done + 1, total);
                continue;
            }
            return Err(CofferError::EncryptedFileMissing(
                entry.relative_path.clone(),
            ));
        }

        let combined = fs::read(&ciphertext_file)?;
        let plaintext = crypto::open(&combined, key.as_bytes())?;
        fs_atomic::write_atomic(&original, &plaintext)?;
        restore_permissions(&original, entry.posix_permissions);
        fs::remove_file(&ciphertext_file)?;
        progress(done + 1, total);
    }

    for name in [MANIFEST_FILE_NAME, INDEX_BLOCKER_FILE_NAME] {
        if let Err(err) = fs::remove_file(folder.join(name)) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(file = name, "could not remove after decryption: {err}");
            }
        }
    }
    info!(folder = %folder.display(), "decryption pass completed");
    Ok(())
}

// ── Resume ──────────────────────────────────────────────────────────────────

/// Continue an interrupted encryption pass from the persisted manifest.
///
/// Sealed entries get orphaned plaintexts deleted; entries never sealed are
/// sealed now (overwriting any half-recorded ciphertext); an entry whose
/// plaintext vanished but whose ciphertext survived is adopted by parsing
/// the nonce and tag embedded in the blob.
pub fn resume_encryption(
    folder: &Path,
    vault_id: Uuid,
    key: &MasterKey,
    progress: ProgressFn,
) -> Result<EncryptionManifest> {
    let mut manifest = EncryptionManifest::load(folder)?;
    if manifest.vault_id != vault_id {
        return Err(CofferError::ManifestCorrupted(format!(
            "manifest belongs to vault {}, not {}",
            manifest.vault_id, vault_id
        )));
    }

    let total = manifest.files.len();
    info!(folder = %folder.display(), files = total, "resuming interrupted encryption pass");
    for index in 0..total {
        let original = resolve_relative(folder, &manifest.files[index].relative_path);
        let ciphertext_file = ciphertext_path(&original);
        if manifest.files[index].is_encrypted {
            if !ciphertext_file.exists() {
                return Err(CofferError::EncryptedFileMissing(
                    manifest.files[index].relative_path.clone(),
                ));
            }
            if original.exists() {
                // Sealed before the crash; the plaintext deletion never ran.
                secure_delete(&original)?;
            }
        } else if original.exists() {
            encrypt_one(folder, &mut manifest, index, &original, key)?;
        } else if ciphertext_file.exists() {
            adopt_ciphertext(&mut manifest.files[index], &ciphertext_file)?;
            manifest.save(folder)?;
        } else {
            return Err(CofferError::EncryptedFileMissing(
                manifest.files[index].relative_path.clone(),
            ));
        }
        progress(index + 1, total);
    }

    write_index_blocker(folder)?;
    manifest.mark_completed();
    manifest.save(folder)?;
    info!(folder = %folder.display(), "interrupted encryption pass completed");
    Ok(manifest)
}

/// Fill a half-recorded entry from the nonce and tag embedded in its blob.
fn adopt_ciphertext(entry: &mut FileEntry, ciphertext_file: &Path) -> Result<()> {
    let len = fs::metadata(ciphertext_file)?.len();
    if len < (NONCE_LEN + TAG_LEN) as u64 {
        return Err(CofferError::DecryptionFailed);
    }
    let mut file = File::open(ciphertext_file)?;
    let mut nonce = [0u8; NONCE_LEN];
    file.read_exact(&mut nonce)?;
    file.seek(SeekFrom::End(-(TAG_LEN as i64)))?;
    let mut tag = [0u8; TAG_LEN];
    file.read_exact(&mut tag)?;

    entry.encrypted_size = len;
    entry.nonce = nonce.to_vec();
    entry.tag = tag.to_vec();
    entry.is_encrypted = true;
    Ok(())
}

/// Mark an interrupted manifest as such without touching any file entry.
pub fn mark_manifest_interrupted(folder: &Path) -> Result<()> {
    if !has_interrupted_manifest(folder)? {
        return Ok(());
    }
    let mut manifest = EncryptionManifest::load(folder)?;
    if manifest.status == ManifestStatus::InProgress {
        manifest.status = ManifestStatus::Interrupted;
        manifest.save(folder)?;
    }
    Ok(())
}

// ── Secure delete ───────────────────────────────────────────────────────────

/// Best-effort shred: overwrite the full length with CSPRNG bytes in 64 KiB
/// chunks, sync, unlink. The unlink is still attempted after a write error.
/// On flash and copy-on-write media the overwrite is advisory only.
pub fn secure_delete(path: &Path) -> Result<()> {
    if let Err(err) = overwrite_with_random(path) {
        warn!(path = %path.display(), "secure overwrite failed, unlinking anyway: {err}");
    }
    fs::remove_file(path)?;
    Ok(())
}

fn overwrite_with_random(path: &Path) -> std::io::Result<()> {
    let len = fs::metadata(path)?.len();
    let mut file = OpenOptions::new().write(true).open(path)?;
    let mut buffer = vec![0u8; SHRED_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(SHRED_CHUNK as u64) as usize;
        OsRng.fill_bytes(&mut buffer[..chunk]);
        file.write_all(&buffer[..chunk])?;
        remaining -= chunk as u64;
    }
    file.sync_all()
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// `<original>.cfr`, appended to the full file name.
pub fn ciphertext_path(original: &Path) -> PathBuf {
    let mut name = original.as_os_str().to_os_string();
    name.push(".");
    name.push(CIPHERTEXT_EXTENSION);
    PathBuf::from(name)
}

fn relative_path(root: &Path, file: &Path) -> Result<String> {
    let rel = file.strip_prefix(root).map_err(|_| {
        CofferError::CannotEnumerateDirectory(format!(
            "{} is outside the vault root",
            file.display()
        ))
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

fn resolve_relative(root: &Path, relative: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in relative.split('/') {
        path.push(part);
    }
    path
}

fn read_permissions(path: &Path) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o644)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        0o644
    }
}

fn restore_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), "could not restore permissions: {err}");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

fn write_index_blocker(folder: &Path) -> Result<()> {
    File::create(folder.join(INDEX_BLOCKER_FILE_NAME))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_master_key;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn enumeration_skips_reserved_hidden_and_ciphertext() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "a.txt", b"a");
        write(root, "sub/b.bin", b"b");
        write(root, ".DS_Store", b"junk");
        write(root, ".hidden", b"top-level hidden");
        write(root, ".hiddendir/inner.txt", b"pruned with its directory");
        write(root, "sub/.hidden-nested", b"kept");
        write(root, "c.cfr", b"already sealed");
        write(root, MANIFEST_FILE_NAME, b"{}");
        write(root, INDEX_BLOCKER_FILE_NAME, b"");
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.join("a.txt"), root.join("link")).unwrap();

        let files = collect_regular_files(root).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "sub/.hidden-nested", "sub/b.bin"]);

        let encrypted = collect_encrypted_files(root).unwrap();
        assert_eq!(encrypted, vec![root.join("c.cfr")]);
    }

    #[test]
    fn encrypt_then_decrypt_restores_bytes_and_permissions() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.txt", b"hello");
        let b = write(root, "sub/b.bin", &[0xDE, 0xAD]);
        fs::set_permissions(&b, fs::Permissions::from_mode(0o600)).unwrap();

        let key = generate_master_key();
        let vault_id = Uuid::new_v4();
        let mut seen = Vec::new();
        let manifest = encrypt_tree(root, vault_id, &key, &mut |done, total| {
            seen.push((done, total))
        })
        .unwrap();

        assert_eq!(seen, vec![(1, 2), (2, 2)]);
        assert_eq!(manifest.status, ManifestStatus::Completed);
        assert!(!a.exists() && !b.exists());
        assert!(ciphertext_path(&a).exists() && ciphertext_path(&b).exists());
        assert!(root.join(INDEX_BLOCKER_FILE_NAME).exists());
        for entry in &manifest.files {
            assert!(entry.is_encrypted);
            assert_eq!(entry.nonce.len(), NONCE_LEN);
            assert_eq!(entry.tag.len(), TAG_LEN);
            assert!(entry.encrypted_size > 0);
        }

        decrypt_tree(root, vault_id, &key, &mut |_, _| {}).unwrap();
        assert_eq!(fs::read(&a).unwrap(), b"hello");
        assert_eq!(fs::read(&b).unwrap(), &[0xDE, 0xAD]);
        assert_eq!(
            fs::metadata(&b).unwrap().permissions().mode() & 0o7777,
            0o600
        );
        assert!(!ciphertext_path(&a).exists());
        assert!(!EncryptionManifest::exists(root));
        assert!(!root.join(INDEX_BLOCKER_FILE_NAME).exists());
    }

    #[test]
    fn decrypt_rejects_wrong_key_and_leaves_ciphertext() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.txt", b"hello");

        let key = generate_master_key();
        let vault_id = Uuid::new_v4();
        encrypt_tree(root, vault_id, &key, &mut |_, _| {}).unwrap();

        let wrong = generate_master_key();
        assert!(matches!(
            decrypt_tree(root, vault_id, &wrong, &mut |_, _| {}),
            Err(CofferError::DecryptionFailed)
        ));
        assert!(ciphertext_path(&a).exists());
        assert!(EncryptionManifest::exists(root));
    }

    #[test]
    fn decrypt_reports_missing_ciphertext() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.txt", b"hello");

        let key = generate_master_key();
        let vault_id = Uuid::new_v4();
        encrypt_tree(root, vault_id, &key, &mut |_, _| {}).unwrap();
        fs::remove_file(ciphertext_path(&a)).unwrap();

        match decrypt_tree(root, vault_id, &key, &mut |_, _| {}) {
            Err(CofferError::EncryptedFileMissing(path)) => assert_eq!(path, "a.txt"),
            other => panic!("expected EncryptedFileMissing, got {other:?}"),
        }
    }

    #[test]
    fn decrypt_skips_entries_already_restored() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.txt", b"aaa");
        write(root, "b.txt", b"bbb");

        let key = generate_master_key();
        let vault_id = Uuid::new_v4();
        encrypt_tree(root, vault_id, &key, &mut |_, _| {}).unwrap();

        // Simulate a crash mid-unlock: `a.txt` was restored and its
        // ciphertext removed, but the manifest is still in place.
        fs::write(&a, b"aaa").unwrap();
        fs::remove_file(ciphertext_path(&a)).unwrap();

        decrypt_tree(root, vault_id, &key, &mut |_, _| {}).unwrap();
        assert_eq!(fs::read(root.join("b.txt")).unwrap(), b"bbb");
        assert!(!EncryptionManifest::exists(root));
    }

    #[test]
    fn resume_completes_a_partial_pass() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.txt", b"aaa");
        let b = write(root, "b.txt", b"bbb");
        let c = write(root, "c.txt", b"ccc");

        let key = generate_master_key();
        let vault_id = Uuid::new_v4();
        let manifest = encrypt_tree(root, vault_id, &key, &mut |_, _| {}).unwrap();

        // Rewind to a mid-pass shape: `a` sealed with its plaintext orphaned,
        // `b` never sealed, `c` sealed but unrecorded.
        let mut rewound = manifest.clone();
        rewound.status = ManifestStatus::InProgress;
        rewound.completed_at = None;
        fs::write(&a, b"aaa").unwrap();
        rewound.files[1].is_encrypted = false;
        rewound.files[1].nonce.clear();
        rewound.files[1].tag.clear();
        rewound.files[1].encrypted_size = 0;
        fs::remove_file(ciphertext_path(&b)).unwrap();
        fs::write(&b, b"bbb").unwrap();
        rewound.files[2].is_encrypted = false;
        rewound.files[2].nonce.clear();
        rewound.files[2].tag.clear();
        rewound.files[2].encrypted_size = 0;
        rewound.save(root).unwrap();

        let resumed = resume_encryption(root, vault_id, &key, &mut |_, _| {}).unwrap();
        assert_eq!(resumed.status, ManifestStatus::Completed);
        assert!(resumed.files.iter().all(|e| e.is_encrypted));
        assert!(!a.exists() && !b.exists() && !c.exists());

        decrypt_tree(root, vault_id, &key, &mut |_, _| {}).unwrap();
        assert_eq!(fs::read(&a).unwrap(), b"aaa");
        assert_eq!(fs::read(&b).unwrap(), b"bbb");
        assert_eq!(fs::read(&c).unwrap(), b"ccc");
    }

    #[test]
    fn secure_delete_removes_file() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "doomed.bin", &[0xAB; 200 * 1024]);
        secure_delete(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn folder_stats_counts_regular_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "a.txt", b"12345");
        write(root, "sub/b.bin", b"123");
        write(root, ".DS_Store", b"ignored");

        let stats = folder_stats(root).unwrap();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_size, 8);
    }
}
