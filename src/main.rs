use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use hookinstall::backup;
use hookinstall::bundle::PatchBundle;
use hookinstall::collaborators::CopySupportFiles;
use hookinstall::layout;
use hookinstall::resolver;
use hookinstall::{
    InstallOptions, InstallRequest, InstallResult, Installer, RemovalOptions, RemovalRequest,
    RemovalResult,
};

#[derive(Parser)]
#[command(name = "hookinstall", about = "Hook patch installer for PE executables")]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the section layout of an executable
    Layout {
        #[arg(long)]
        exe: PathBuf,
    },
    /// Print the install order for a set of patches
    Resolve {
        #[arg(long)]
        bundle: PathBuf,
        /// Patch id to select (repeatable)
        #[arg(long = "patch", required = true)]
        patches: Vec<String>,
    },
    /// Install patches into an executable
    Install {
        #[arg(long)]
        exe: PathBuf,
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long = "patch", required = true)]
        patches: Vec<String>,
        /// Defaults to the executable's directory
        #[arg(long)]
        game_dir: Option<PathBuf>,
        /// Skip the backup; a failed install cannot be fully undone
        #[arg(long)]
        no_backup: bool,
        /// File to copy into the game directory (repeatable)
        #[arg(long = "support-file")]
        support_files: Vec<PathBuf>,
    },
    /// Restore the latest backup and remove installed files
    Remove {
        #[arg(long)]
        exe: PathBuf,
        /// Bundle the patches came from; needed to remove their payloads
        #[arg(long)]
        bundle: Option<PathBuf>,
        #[arg(long)]
        game_dir: Option<PathBuf>,
        #[arg(long)]
        no_verify: bool,
        #[arg(long)]
        delete_backup: bool,
    },
    /// Back up an executable
    Backup {
        #[arg(long)]
        exe: PathBuf,
    },
    /// Restore the latest backup of an executable
    Restore {
        #[arg(long)]
        exe: PathBuf,
        #[arg(long)]
        no_verify: bool,
    },
    /// Check the latest backup against its recorded hash
    VerifyBackup {
        #[arg(long)]
        exe: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Worker task failed")?
}

fn latest_backup(exe: &Path) -> anyhow::Result<backup::BackupRecord> {
    match backup::find_latest_backup(exe)? {
        Some(record) => Ok(record),
        None => bail!("No backup found for {}", exe.display()),
    }
}

fn print_messages(messages: &[String]) {
    for message in messages {
        println!("  {message}");
    }
}

fn report_install(result: &InstallResult) -> anyhow::Result<()> {
    print_messages(&result.messages);
    if !result.success {
        let step = result
            .failed_step
            .map(|s| s.to_string())
            .unwrap_or_default();
        bail!(
            "Install failed while {step} ({}): {}",
            result.error_kind.unwrap_or("Error"),
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("\nInstall succeeded!");
    if let Some(detected) = &result.detected_version {
        println!("  Version: {} ({})", detected.version.id, detected.version.name);
    }
    println!("  Patches: {}", result.installed_patches.join(", "));
    if let Some(record) = &result.backup {
        println!("  Backup: {}", record.backup_path.display());
    }
    Ok(())
}

fn report_removal(result: &RemovalResult) -> anyhow::Result<()> {
    print_messages(&result.messages);
    if !result.success {
        bail!(
            "Removal failed ({}): {}",
            result.error_kind.unwrap_or("Error"),
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("\nRemoval succeeded!");
    println!("  Patches removed: {}", result.removed_patches.join(", "));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let start = Instant::now();
    match cli.command {
        Commands::Layout { exe } => {
            let info = blocking(move || Ok(layout::read_layout(&exe)?)).await?;
            println!("Format: {:?}", info.bitness);
            println!("Image base: {:#X}", info.image_base);
            for s in &info.sections {
                println!(
                    "  {:<8} va {:#010X} vsize {:#X} raw {:#X} rawsize {:#X}",
                    s.name, s.virtual_address, s.virtual_size, s.raw_pointer, s.raw_size
                );
            }
        }
        Commands::Resolve { bundle, patches } => {
            let order = blocking(move || {
                let bundle = PatchBundle::load(&bundle)?;
                Ok(resolver::resolve(&bundle.manifests(), &patches)?)
            })
            .await?;
            println!("Install order:");
            for (i, id) in order.iter().enumerate() {
                println!("  {}. {id}", i + 1);
            }
        }
        Commands::Install {
            exe,
            bundle,
            patches,
            game_dir,
            no_backup,
            support_files,
        } => {
            println!("Installing patches...");
            println!("  Executable: {}", exe.display());
            println!("  Bundle: {}", bundle.display());

            let result = blocking(move || {
                let bundle = PatchBundle::load(&bundle)?;
                let installer = Installer::new(bundle.version_table()).with_support_files(
                    CopySupportFiles {
                        sources: support_files,
                    },
                );
                Ok(installer.install(&InstallRequest {
                    executable: &exe,
                    game_dir: game_dir.as_deref(),
                    bundle: &bundle,
                    selected: &patches,
                    options: InstallOptions {
                        create_backup: !no_backup,
                        ..InstallOptions::default()
                    },
                }))
            })
            .await?;
            report_install(&result)?;
        }
        Commands::Remove {
            exe,
            bundle,
            game_dir,
            no_verify,
            delete_backup,
        } => {
            println!("Removing patches...");
            println!("  Executable: {}", exe.display());

            let result = blocking(move || {
                let bundle = bundle.as_deref().map(PatchBundle::load).transpose()?;
                let versions = bundle
                    .as_ref()
                    .map(PatchBundle::version_table)
                    .unwrap_or_default();
                Ok(Installer::new(versions).remove(&RemovalRequest {
                    executable: &exe,
                    game_dir: game_dir.as_deref(),
                    bundle: bundle.as_ref(),
                    options: RemovalOptions {
                        verify: !no_verify,
                        delete_backup,
                    },
                }))
            })
            .await?;
            report_removal(&result)?;
        }
        Commands::Backup { exe } => {
            let record = blocking(move || Ok(backup::create_backup(&exe, None, &[])?)).await?;
            println!("Backup created: {}", record.backup_path.display());
            println!("  Hash: {}", record.hash);
            println!("  Size: {} bytes", record.size);
        }
        Commands::Restore { exe, no_verify } => {
            let record = blocking(move || {
                let record = latest_backup(&exe)?;
                backup::restore_backup(&record, !no_verify)?;
                Ok(record)
            })
            .await?;
            println!("Restored from {}", record.backup_path.display());
        }
        Commands::VerifyBackup { exe } => {
            let record = blocking(move || {
                let record = latest_backup(&exe)?;
                backup::verify_backup(&record)?;
                Ok(record)
            })
            .await?;
            println!("Backup OK: {}", record.backup_path.display());
            println!("  Hash: {}", record.hash);
        }
    }
    println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());

    Ok(())
}
