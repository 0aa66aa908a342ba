//! memvault CLI - command line front end for the vault security core.
//!
//! Each invocation is a fresh process, so `unlock` followed by `status`
//! exercises session re-entry exactly as an app restart would.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use memvault_common::{Error, SensitiveBytes};
use memvault_storage::LocalStore;
use memvault_vault::{Capsule, CapsuleStore, SessionStateManager, VaultConfig, VaultOperations};

/// Encrypted container holding the saved capsules, inside the data directory.
const CAPSULE_FILE: &str = "capsules.mvc";

#[derive(Parser)]
#[command(name = "memvault")]
#[command(about = "memvault - Passphrase-protected memory vault")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (JSON). Defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the vault records.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set up a new vault with a passphrase.
    Init,

    /// Unlock the vault and start a session.
    Unlock,

    /// Lock the vault and end the session everywhere.
    Lock,

    /// Show vault status.
    Status {
        /// Print the status as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Save a new memory capsule.
    Add {
        /// Capsule title.
        title: String,

        /// Capsule text.
        #[arg(short, long, default_value = "")]
        body: String,

        /// Tag to attach; repeat for several.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Where the memory came from.
        #[arg(long)]
        source: Option<String>,
    },

    /// List saved capsules.
    List,

    /// Write every capsule into a portable container.
    Export {
        /// Container file to write.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Merge the capsules of a container into the vault.
    Import {
        /// Container file to read.
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => VaultConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => VaultConfig::default(),
    };
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    debug!(data_dir = %data_dir.display(), "Using vault data directory");

    let store = LocalStore::new(&data_dir).context("Failed to open vault storage")?;
    let manager = Arc::new(SessionStateManager::new(config, Arc::new(store)));
    manager
        .initialize()
        .await
        .context("Failed to start vault")?;

    let capsule_file = data_dir.join(CAPSULE_FILE);
    let result = match cli.command {
        Commands::Init => cmd_init(&manager).await,
        Commands::Unlock => cmd_unlock(&manager).await,
        Commands::Lock => cmd_lock(&manager).await,
        Commands::Status { json } => cmd_status(&manager, json).await,
        Commands::Add {
            title,
            body,
            tags,
            source,
        } => {
            let mut capsule = Capsule::text(title, body).with_tags(tags);
            capsule.source_url = source;
            cmd_add(&manager, &capsule_file, capsule).await
        }
        Commands::List => cmd_list(&manager, &capsule_file).await,
        Commands::Export { output } => cmd_export(&manager, &capsule_file, &output).await,
        Commands::Import { input } => cmd_import(&manager, &capsule_file, &input).await,
    };

    result.map_err(|e| match e.downcast_ref::<Error>() {
        Some(vault_error) => anyhow::anyhow!(vault_error.user_message()),
        None => e,
    })
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("No local data directory on this platform")?;
    Ok(base.join("memvault"))
}

/// Prompt for a passphrase without echo.
fn prompt_passphrase(prompt: &str) -> Result<SensitiveBytes> {
    let passphrase = rpassword::prompt_password(prompt).context("Failed to read passphrase")?;
    Ok(SensitiveBytes::from(passphrase))
}

async fn cmd_init(manager: &SessionStateManager) -> Result<()> {
    let passphrase = prompt_passphrase("New passphrase: ")?;
    let confirm = prompt_passphrase("Confirm passphrase: ")?;

    if passphrase.as_bytes() != confirm.as_bytes() {
        anyhow::bail!("Passphrases do not match");
    }
    if passphrase.is_empty() {
        anyhow::bail!("Passphrase cannot be empty");
    }

    manager.initialize_vault(&passphrase).await?;
    println!("Vault created and unlocked.");
    println!("  ID: {}", manager.config().vault_id);
    Ok(())
}

async fn cmd_unlock(manager: &SessionStateManager) -> Result<()> {
    let passphrase = prompt_passphrase("Passphrase: ")?;
    manager.unlock(&passphrase).await?;

    let status = manager.get_status().await;
    println!("Vault unlocked.");
    if let Some(expires) = status.session_expires_at {
        println!("  Session valid until {}", expires.to_rfc3339());
    }
    Ok(())
}

async fn cmd_lock(manager: &SessionStateManager) -> Result<()> {
    manager.lock().await?;
    println!("Vault locked.");
    Ok(())
}

async fn cmd_status(manager: &SessionStateManager, json: bool) -> Result<()> {
    let status = manager.get_status().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Vault: {}", status.vault_id);
    println!("  Initialized: {}", status.initialized);
    println!("  Unlocked:    {}", status.is_unlocked);
    println!("  Keyring:     {:?}", status.keyring_state);
    if let Some(expires) = status.session_expires_at {
        println!("  Session until: {}", expires.to_rfc3339());
    }
    if let Some(at) = status.last_unlocked_at {
        println!("  Last unlock:   {}", at.to_rfc3339());
    }
    if let Some(error) = status.error {
        println!("  Warning: {}", error);
    }
    Ok(())
}

/// Capsules opened from the at-rest container for one command.
struct Capsules {
    store: CapsuleStore,
    operations: VaultOperations,
    passphrase: SensitiveBytes,
}

/// Unlock with `passphrase` if needed and load the saved capsules.
///
/// `need_key` forces a passphrase unlock even when a restored session
/// already reads as unlocked, since writing a container needs the key.
async fn open_capsules(
    manager: &Arc<SessionStateManager>,
    file: &Path,
    passphrase: SensitiveBytes,
    need_key: bool,
) -> Result<Capsules> {
    let unlocked = if need_key {
        manager.keyring().has_live_key()
    } else {
        manager.is_unlocked()
    };
    if !unlocked {
        manager.unlock(&passphrase).await?;
    }

    let store = CapsuleStore::new(manager.clone());
    let operations = VaultOperations::new(manager.clone(), store.clone());
    match tokio::fs::read(file).await {
        Ok(container) => {
            let loaded = operations.import(&container, &passphrase).await?;
            debug!(capsules = loaded.added, "Loaded saved capsules");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", file.display())),
    }

    Ok(Capsules {
        store,
        operations,
        passphrase,
    })
}

impl Capsules {
    /// Encrypt every capsule into `path`, replacing it atomically.
    async fn write_to(&self, path: &Path) -> Result<usize> {
        let container = self.operations.export(&self.passphrase).await?;
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, &container)
            .await
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        tokio::fs::rename(&temp, path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(container.len())
    }
}

async fn cmd_add(manager: &Arc<SessionStateManager>, file: &Path, capsule: Capsule) -> Result<()> {
    let capsules = open_capsules(manager, file, prompt_passphrase("Passphrase: ")?, true).await?;
    let id = capsule.id;
    capsules.store.put(capsule).await?;
    capsules.write_to(file).await?;

    println!("Saved capsule {}", id);
    Ok(())
}

async fn cmd_list(manager: &Arc<SessionStateManager>, file: &Path) -> Result<()> {
    let capsules = open_capsules(manager, file, prompt_passphrase("Passphrase: ")?, false).await?;
    let all = capsules.store.list().await?;

    if all.is_empty() {
        println!("No capsules saved.");
        return Ok(());
    }
    for capsule in all {
        let tags = if capsule.tags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", capsule.tags.join(", "))
        };
        println!(
            "{}  {}  {}{}",
            capsule.created_at.format("%Y-%m-%d"),
            capsule.id,
            capsule.title,
            tags
        );
    }
    Ok(())
}

async fn cmd_export(manager: &Arc<SessionStateManager>, file: &Path, output: &Path) -> Result<()> {
    let capsules = open_capsules(manager, file, prompt_passphrase("Passphrase: ")?, true).await?;
    let count = capsules.store.list().await?.len();
    let bytes = capsules.write_to(output).await?;

    println!("Exported {} capsules to {} ({} bytes)", count, output.display(), bytes);
    Ok(())
}

async fn cmd_import(manager: &Arc<SessionStateManager>, file: &Path, input: &Path) -> Result<()> {
    let container = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let capsules = open_capsules(manager, file, prompt_passphrase("Passphrase: ")?, true).await?;

    let container_passphrase = prompt_passphrase("Container passphrase: ")?;
    let summary = capsules.operations.import(&container, &container_passphrase).await?;
    capsules.write_to(file).await?;

    println!(
        "Imported {} capsules ({} already present)",
        summary.added, summary.skipped
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "lighthouse at dawn";

    async fn manager_at(dir: &Path) -> Arc<SessionStateManager> {
        let store = LocalStore::new(dir).unwrap();
        let manager = Arc::new(SessionStateManager::new(VaultConfig::for_testing(), Arc::new(store)));
        manager.initialize().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_saved_capsules_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(CAPSULE_FILE);
        let manager = manager_at(dir.path()).await;
        manager.initialize_vault(&SensitiveBytes::from(PASSPHRASE)).await.unwrap();

        let capsules = open_capsules(&manager, &file, SensitiveBytes::from(PASSPHRASE), true)
            .await
            .unwrap();
        capsules
            .store
            .put(Capsule::text("Harbour walk", "Gulls and rain").with_tags(["trips"]))
            .await
            .unwrap();
        capsules.write_to(&file).await.unwrap();
        drop(capsules);
        drop(manager);

        let restarted = manager_at(dir.path()).await;
        let reopened = open_capsules(&restarted, &file, SensitiveBytes::from(PASSPHRASE), false)
            .await
            .unwrap();
        let listed = reopened.store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Harbour walk");
        assert!(!dir.path().join("capsules.tmp").exists());
    }

    #[tokio::test]
    async fn test_wrong_passphrase_cannot_open_saved_capsules() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(CAPSULE_FILE);
        let manager = manager_at(dir.path()).await;
        manager.initialize_vault(&SensitiveBytes::from(PASSPHRASE)).await.unwrap();

        let capsules = open_capsules(&manager, &file, SensitiveBytes::from(PASSPHRASE), true)
            .await
            .unwrap();
        capsules.store.put(Capsule::text("a", "b")).await.unwrap();
        capsules.write_to(&file).await.unwrap();

        let err = open_capsules(&manager, &file, SensitiveBytes::from("not it"), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidPassphrase)));
    }
}
