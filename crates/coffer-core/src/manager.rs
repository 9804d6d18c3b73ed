//! Vault lifecycle orchestration.
//!
//! All public operations serialize on one internal lock (single-writer
//! discipline), and every state transition is persisted before the caller
//! sees the result. Failures in the authenticator stage restore the prior
//! state so the user can retry or fall back to another unlock path; failures
//! inside a file pass drive the vault to `error`, with the manifest left in
//! place for recovery.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::authenticator::{Authenticator, BiometricEvaluator, UnsupportedEvaluator};
use crate::config::ConfigStore;
use crate::crypto::MasterKey;
use crate::error::{CofferError, Result};
use crate::handles::{LsofProbe, OpenHandleProbe};
use crate::manifest::{self, EncryptionManifest, ManifestStatus};
use crate::pipeline::{self, ProgressFn};
use crate::secret_store::{CredentialStore, KeyringStore};
use crate::vault::{GlobalSettings, Vault, VaultConfig, VaultState};

enum KeySource<'a> {
    Password(&'a str),
    Key(MasterKey),
}

pub struct VaultManager {
    auth: Authenticator,
    store: Arc<dyn CredentialStore>,
    probe: Box<dyn OpenHandleProbe>,
    config_store: ConfigStore,
    state: Mutex<VaultConfig>,
}

impl VaultManager {
    pub fn new(
        config_store: ConfigStore,
        store: Arc<dyn CredentialStore>,
        evaluator: Arc<dyn BiometricEvaluator>,
        probe: Box<dyn OpenHandleProbe>,
    ) -> Result<Self> {
        let state = config_store.load()?;
        let auth = Authenticator::new(store.clone(), evaluator);
        Ok(Self {
            auth,
            store,
            probe,
            config_store,
            state: Mutex::new(state),
        })
    }

    /// Production wiring: default config location, OS keychain, no biometric
    /// shell, `lsof` handle probe.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            ConfigStore::at_default_location()?,
            Arc::new(KeyringStore),
            Arc::new(UnsupportedEvaluator),
            Box::new(LsofProbe),
        )
    }

    pub fn biometrics_available(&self) -> bool {
        self.auth.biometrics_available()
    }

    pub fn vaults(&self) -> Vec<Vault> {
        self.state.lock().vaults.clone()
    }

    pub fn vault(&self, id: Uuid) -> Result<Vault> {
        let state = self.state.lock();
        Self::require_vault(&state, id).cloned()
    }

    pub fn global_settings(&self) -> GlobalSettings {
        self.state.lock().global_settings.clone()
    }

    pub fn set_global_settings(&self, settings: GlobalSettings) -> Result<()> {
        let mut state = self.state.lock();
        state.global_settings = settings;
        self.config_store.save(&state)
    }

    // ── Lifecycle operations ────────────────────────────────────────────────

    /// Register a folder as a vault: provision its secrets, record it in the
    /// config, and optionally run the lock pass immediately with the master
    /// key returned by setup.
    pub fn add_vault(
        &self,
        name: &str,
        folder: &Path,
        password: &str,
        use_biometric: bool,
        auto_lock_minutes: u32,
        lock_immediately: bool,
    ) -> Result<Vault> {
        let mut state = self.state.lock();
        if !folder.is_dir() {
            return Err(CofferError::CannotEnumerateDirectory(format!(
                "{} is not a directory",
                folder.display()
            )));
        }
        state.check_new_folder(folder)?;

        let stats = pipeline::folder_stats(folder)?;
        let id = Uuid::new_v4();
        let master = self.auth.setup_vault(id, password, use_biometric)?;

        let vault = Vault {
            auto_lock_minutes,
            created_at: Utc::now(),
            file_count: stats.file_count,
            folder_path: folder.to_path_buf(),
            id,
            last_unlocked_at: None,
            name: name.to_string(),
            state: VaultState::Unlocked,
            total_size: stats.total_size,
            use_touch_id: use_biometric && self.auth.biometrics_available(),
        };
        state.vaults.push(vault.clone());
        self.config_store.save(&state)?;
        info!(vault = %id, folder = %folder.display(), "vault added");

        if lock_immediately {
            return self.lock_flow(&mut state, id, KeySource::Key(master), &mut |_, _| {});
        }
        Ok(vault)
    }

    /// Encrypt a vault in place. Requires `unlocked` state and no open file
    /// handles under the folder.
    pub fn lock_vault(&self, id: Uuid, password: &str, progress: ProgressFn) -> Result<Vault> {
        let mut state = self.state.lock();
        self.lock_flow(&mut state, id, KeySource::Password(password), progress)
    }

    /// Decrypt a vault via the biometric path.
    pub fn unlock_vault_biometric(&self, id: Uuid, progress: ProgressFn) -> Result<Vault> {
        let mut state = self.state.lock();
        let vault = Self::require_vault(&state, id)?;
        Self::require_state(vault, VaultState::Locked)?;
        let name = vault.name.clone();

        self.set_state(&mut state, id, VaultState::Decrypting)?;
        let master = match self.auth.unlock_with_biometrics(id, &name) {
            Ok(master) => master,
            Err(err) => {
                // The prompt was cancelled or the gated slot is gone; nothing
                // touched the folder, so the vault is still locked.
                self.restore_state(&mut state, id, VaultState::Locked);
                return Err(err);
            }
        };
        self.unlock_flow(&mut state, id, master, progress)
    }

    /// Decrypt a vault via the password path. The password is checked before
    /// the vault enters `decrypting`: a typo must not leave it in `error`.
    pub fn unlock_vault_password(
        &self,
        id: Uuid,
        password: &str,
        progress: ProgressFn,
    ) -> Result<Vault> {
        let mut state = self.state.lock();
        let vault = Self::require_vault(&state, id)?;
        Self::require_state(vault, VaultState::Locked)?;

        let master = self.auth.unlock_with_password(password, id)?;
        self.set_state(&mut state, id, VaultState::Decrypting)?;
        self.unlock_flow(&mut state, id, master, progress)
    }

    /// Remove a vault. A locked vault is unlocked first — password path if a
    /// password is supplied, biometric otherwise — so the user's files are
    /// restored before the secrets are destroyed.
    pub fn remove_vault(&self, id: Uuid, password: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        let vault = Self::require_vault(&state, id)?.clone();

        if vault.state == VaultState::Locked {
            let master = match password {
                Some(password) => self.auth.unlock_with_password(password, id)?,
                None if vault.use_touch_id => self.auth.unlock_with_biometrics(id, &vault.name)?,
                None => return Err(CofferError::WrongPassword),
            };
            self.set_state(&mut state, id, VaultState::Decrypting)?;
            self.unlock_flow(&mut state, id, master, &mut |_, _| {})?;
        }

        self.store.delete_all(id)?;
        state.vaults.retain(|v| v.id != id);
        self.config_store.save(&state)?;
        info!(vault = %id, "vault removed");
        Ok(())
    }

    /// Lock every unlocked vault with one password; the first failure
    /// aborts. Correct only while all vaults share a password.
    pub fn lock_all(&self, password: &str, progress: ProgressFn) -> Result<Vec<Vault>> {
        let mut state = self.state.lock();
        let ids: Vec<Uuid> = state
            .vaults
            .iter()
            .filter(|v| v.state == VaultState::Unlocked)
            .map(|v| v.id)
            .collect();

        let mut locked = Vec::with_capacity(ids.len());
        for id in ids {
            locked.push(self.lock_flow(&mut state, id, KeySource::Password(password), progress)?);
        }
        Ok(locked)
    }

    pub fn change_password(&self, id: Uuid, current: &str, new: &str) -> Result<()> {
        let state = self.state.lock();
        Self::require_vault(&state, id)?;
        self.auth.change_password(id, current, new)
    }

    /// Vaults whose folder carries a manifest from an unfinished pass. An
    /// unreadable manifest counts: it needs attention at least as much.
    pub fn interrupted_vaults(&self) -> Vec<Vault> {
        let state = self.state.lock();
        state
            .vaults
            .iter()
            .filter(|vault| match manifest::has_interrupted_manifest(&vault.folder_path) {
                Ok(interrupted) => interrupted,
                Err(err) => {
                    warn!(vault = %vault.id, "manifest unreadable during interrupted scan: {err}");
                    true
                }
            })
            .cloned()
            .collect()
    }

    /// Drive a crashed vault back to a quiescent state.
    ///
    /// An unfinished manifest means the lock pass never completed: it is
    /// resumed to `locked`. A completed manifest with the vault stuck in
    /// `decrypting` or `error` means the crash hit mid-unlock: the tolerant
    /// decryption pass runs to `unlocked`. No manifest means the folder is
    /// plaintext and the state resets to `unlocked`.
    pub fn recover_vault(&self, id: Uuid, password: &str, progress: ProgressFn) -> Result<Vault> {
        let mut state = self.state.lock();
        let vault = Self::require_vault(&state, id)?.clone();
        let folder = vault.folder_path.clone();

        if !EncryptionManifest::exists(&folder) {
            let stats = pipeline::folder_stats(&folder)?;
            let restored = Self::require_vault_mut(&mut state, id)?;
            restored.state = VaultState::Unlocked;
            restored.file_count = stats.file_count;
            restored.total_size = stats.total_size;
            let restored = restored.clone();
            self.config_store.save(&state)?;
            return Ok(restored);
        }

        let on_disk = EncryptionManifest::load(&folder)?;
        match on_disk.status {
            ManifestStatus::InProgress | ManifestStatus::Interrupted => {
                self.set_state(&mut state, id, VaultState::Encrypting)?;
                let master = match self.auth.unlock_with_password(password, id) {
                    Ok(master) => master,
                    Err(err) => {
                        self.restore_state(&mut state, id, vault.state);
                        return Err(err);
                    }
                };
                match pipeline::resume_encryption(&folder, id, &master, progress) {
                    Ok(resumed) => self.finish_lock(&mut state, id, &resumed),
                    Err(err) => {
                        self.mark_error(&mut state, id);
                        Err(err)
                    }
                }
            }
            ManifestStatus::Completed => match vault.state {
                VaultState::Decrypting | VaultState::Error => {
                    let master = self.auth.unlock_with_password(password, id)?;
                    self.set_state(&mut state, id, VaultState::Decrypting)?;
                    self.unlock_flow(&mut state, id, master, progress)
                }
                _ => {
                    // The pass finished; only the config lagged behind.
                    self.set_state(&mut state, id, VaultState::Locked)?;
                    Self::require_vault(&state, id).cloned()
                }
            },
        }
    }

    /// Startup reconciliation: delete store entries whose vault id no longer
    /// appears in the config. A no-op on backends that cannot enumerate.
    pub fn sweep_orphaned_secrets(&self) -> Result<Vec<Uuid>> {
        let state = self.state.lock();
        let known: HashSet<Uuid> = state.vaults.iter().map(|v| v.id).collect();
        let mut removed = Vec::new();
        for id in self.store.list_vault_ids()? {
            if !known.contains(&id) {
                self.store.delete_all(id)?;
                info!(vault = %id, "swept orphaned secrets");
                removed.push(id);
            }
        }
        Ok(removed)
    }

    // ── Pass plumbing ───────────────────────────────────────────────────────

    fn lock_flow(
        &self,
        state: &mut VaultConfig,
        id: Uuid,
        source: KeySource<'_>,
        progress: ProgressFn,
    ) -> Result<Vault> {
        let vault = Self::require_vault(state, id)?;
        Self::require_state(vault, VaultState::Unlocked)?;
        let folder = vault.folder_path.clone();

        let open = self.probe.open_files_under(&folder);
        if !open.is_empty() {
            return Err(CofferError::FilesInUse(open));
        }

        self.set_state(state, id, VaultState::Encrypting)?;
        let master = match source {
            KeySource::Key(master) => master,
            KeySource::Password(password) => match self.auth.unlock_with_password(password, id) {
                Ok(master) => master,
                Err(err) => {
                    self.restore_state(state, id, VaultState::Unlocked);
                    return Err(err);
                }
            },
        };

        match pipeline::encrypt_tree(&folder, id, &master, progress) {
            Ok(manifest) => self.finish_lock(state, id, &manifest),
            Err(err) => {
                self.mark_error(state, id);
                Err(err)
            }
        }
    }

    fn finish_lock(
        &self,
        state: &mut VaultConfig,
        id: Uuid,
        manifest: &EncryptionManifest,
    ) -> Result<Vault> {
        let vault = Self::require_vault_mut(state, id)?;
        vault.state = VaultState::Locked;
        vault.file_count = manifest.files.len() as u64;
        vault.total_size = manifest.files.iter().map(|e| e.original_size).sum();
        let vault = vault.clone();
        self.config_store.save(state)?;
        Ok(vault)
    }

    /// Runs the decryption pass; the vault must already be `decrypting`.
    fn unlock_flow(
        &self,
        state: &mut VaultConfig,
        id: Uuid,
        master: MasterKey,
        progress: ProgressFn,
    ) -> Result<Vault> {
        let folder = Self::require_vault(state, id)?.folder_path.clone();
        match pipeline::decrypt_tree(&folder, id, &master, progress) {
            Ok(()) => {
                let stats = pipeline::folder_stats(&folder)?;
                let vault = Self::require_vault_mut(state, id)?;
                vault.state = VaultState::Unlocked;
                vault.last_unlocked_at = Some(Utc::now());
                vault.file_count = stats.file_count;
                vault.total_size = stats.total_size;
                let vault = vault.clone();
                self.config_store.save(state)?;
                Ok(vault)
            }
            Err(err) => {
                self.mark_error(state, id);
                Err(err)
            }
        }
    }

    // ── State bookkeeping ───────────────────────────────────────────────────

    fn require_vault(state: &VaultConfig, id: Uuid) -> Result<&Vault> {
        state.vault(id).ok_or(CofferError::VaultNotFound(id))
    }

    fn require_vault_mut(state: &mut VaultConfig, id: Uuid) -> Result<&mut Vault> {
        state.vault_mut(id).ok_or(CofferError::VaultNotFound(id))
    }

    fn require_state(vault: &Vault, expected: VaultState) -> Result<()> {
        if vault.state != expected {
            return Err(CofferError::InvalidState {
                expected: expected.as_str(),
                actual: vault.state.as_str(),
            });
        }
        Ok(())
    }

    fn set_state(&self, state: &mut VaultConfig, id: Uuid, new: VaultState) -> Result<()> {
        Self::require_vault_mut(state, id)?.state = new;
        self.config_store.save(state)
    }

    /// Undo a transient transition after an authenticator-stage failure.
    /// Best-effort: the vault is already usable in memory.
    fn restore_state(&self, state: &mut VaultConfig, id: Uuid, prior: VaultState) {
        if let Some(vault) = state.vault_mut(id) {
            vault.state = prior;
        }
        if let Err(err) = self.config_store.save(state) {
            warn!(vault = %id, "could not persist restored state: {err}");
        }
    }

    /// Failures while entering `error` are swallowed: the config stays the
    /// source of truth for the state, the manifest for how far the pass got.
    fn mark_error(&self, state: &mut VaultConfig, id: Uuid) {
        let folder = state.vault(id).map(|v| v.folder_path.clone());
        if let Some(vault) = state.vault_mut(id) {
            vault.state = VaultState::Error;
        }
        if let Err(err) = self.config_store.save(state) {
            warn!(vault = %id, "could not persist error state: {err}");
        }
        if let Some(folder) = folder {
            if let Err(err) = pipeline::mark_manifest_interrupted(&folder) {
                warn!(vault = %id, "could not mark manifest interrupted: {err}");
            }
        }
    }
}
