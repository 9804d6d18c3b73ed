use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use coffer_core::{Vault, VaultManager, VaultState};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "coffer")]
#[command(about = "Lock and unlock folder vaults from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a folder as a vault
    Add {
        /// Display name for the vault
        name: String,

        /// Folder to protect
        folder: PathBuf,

        /// Store the master key behind the platform biometric
        #[arg(long)]
        biometric: bool,

        /// Auto-lock after this many idle minutes (0 disables)
        #[arg(long, default_value = "5")]
        auto_lock_minutes: u32,

        /// Encrypt the folder immediately after adding
        #[arg(long)]
        lock: bool,
    },

    /// List configured vaults
    List,

    /// Encrypt a vault in place
    Lock {
        /// Vault name or id
        vault: String,
    },

    /// Decrypt a vault back in place
    Unlock {
        /// Vault name or id
        vault: String,

        /// Use the biometric path instead of the password prompt
        #[arg(long)]
        biometric: bool,
    },

    /// Unlock (if needed) and deregister a vault, deleting its secrets
    Remove {
        /// Vault name or id
        vault: String,
    },

    /// Lock every unlocked vault with one shared password
    LockAll,

    /// Rewrap the master key under a new password
    ChangePassword {
        /// Vault name or id
        vault: String,
    },

    /// List vaults whose last encryption pass never finished
    Interrupted,

    /// Resume or repair a vault after a crash
    Recover {
        /// Vault name or id
        vault: String,
    },

    /// Delete secret-store entries that no longer belong to any vault
    Sweep,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let manager = VaultManager::with_defaults()?;

    match cli.command {
        Commands::Add {
            name,
            folder,
            biometric,
            auto_lock_minutes,
            lock,
        } => {
            let password = prompt_new_password()?;
            let vault = manager.add_vault(
                &name,
                &folder,
                &password,
                biometric,
                auto_lock_minutes,
                lock,
            )?;
            println!("added vault {} ({})", vault.name, vault.id);
            if lock {
                println!("vault locked: {} file(s)", vault.file_count);
            }
        }

        Commands::List => {
            let vaults = manager.vaults();
            if vaults.is_empty() {
                println!("no vaults configured");
            }
            for vault in vaults {
                print_vault(&vault);
            }
        }

        Commands::Lock { vault } => {
            let vault = resolve(&manager, &vault)?;
            let password = rpassword::prompt_password("Password: ")?;
            let locked = manager.lock_vault(vault.id, &password, &mut print_progress)?;
            println!("locked {} ({} files)", locked.name, locked.file_count);
        }

        Commands::Unlock { vault, biometric } => {
            let vault = resolve(&manager, &vault)?;
            let unlocked = if biometric {
                manager.unlock_vault_biometric(vault.id, &mut print_progress)?
            } else {
                let password = rpassword::prompt_password("Password: ")?;
                manager.unlock_vault_password(vault.id, &password, &mut print_progress)?
            };
            println!("unlocked {} ({} files)", unlocked.name, unlocked.file_count);
        }

        Commands::Remove { vault } => {
            let vault = resolve(&manager, &vault)?;
            let password = if vault.state == VaultState::Locked && !vault.use_touch_id {
                Some(rpassword::prompt_password("Password: ")?)
            } else {
                None
            };
            manager.remove_vault(vault.id, password.as_deref())?;
            println!("removed {}", vault.name);
        }

        Commands::LockAll => {
            let password = rpassword::prompt_password("Password: ")?;
            let locked = manager.lock_all(&password, &mut print_progress)?;
            println!("locked {} vault(s)", locked.len());
        }

        Commands::ChangePassword { vault } => {
            let vault = resolve(&manager, &vault)?;
            let current = rpassword::prompt_password("Current password: ")?;
            let new = prompt_new_password()?;
            manager.change_password(vault.id, &current, &new)?;
            println!("password changed for {}", vault.name);
        }

        Commands::Interrupted => {
            let interrupted = manager.interrupted_vaults();
            if interrupted.is_empty() {
                println!("no interrupted vaults");
            }
            for vault in interrupted {
                print_vault(&vault);
            }
        }

        Commands::Recover { vault } => {
            let vault = resolve(&manager, &vault)?;
            let password = rpassword::prompt_password("Password: ")?;
            let recovered = manager.recover_vault(vault.id, &password, &mut print_progress)?;
            println!(
                "recovered {}: now {}",
                recovered.name,
                recovered.state.as_str()
            );
        }

        Commands::Sweep => {
            let removed = manager.sweep_orphaned_secrets()?;
            println!("swept {} orphaned secret set(s)", removed.len());
        }
    }

    Ok(())
}

fn resolve(manager: &VaultManager, needle: &str) -> Result<Vault> {
    let vaults = manager.vaults();
    if let Ok(id) = Uuid::parse_str(needle) {
        if let Some(vault) = vaults.iter().find(|v| v.id == id) {
            return Ok(vault.clone());
        }
    }
    vaults
        .iter()
        .find(|v| v.name == needle)
        .cloned()
        .ok_or_else(|| anyhow!("no vault named {needle}"))
}

fn prompt_new_password() -> Result<String> {
    let password = rpassword::prompt_password("New password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(password)
}

fn print_progress(done: usize, total: usize) {
    eprintln!("  [{done}/{total}]");
}

fn print_vault(vault: &Vault) {
    println!(
        "{}  {:<12} {:>6} file(s) {:>10} bytes  {}",
        vault.id,
        vault.state.as_str(),
        vault.file_count,
        vault.total_size,
        vault.folder_path.display()
    );
}
