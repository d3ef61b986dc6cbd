//! pcloud-drive - pCloud account mounted as a FUSE filesystem
//!
//! Usage:
//!   pcloud-drive mount [mount_point]   - Mount the filesystem
//!   pcloud-drive unmount <mount_point> - Unmount the filesystem
//!   pcloud-drive config                - Show the effective configuration

use clap::{Parser, Subcommand};
use pcloud_drive::{
    config::Config,
    fs::{attr::Owner, invalidate::KernelInvalidator, mount_options, DriveFs},
    remote::MemoryRemote,
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pcloud-drive")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "pCloud drive mounted as a FUSE filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/pcloud-drive/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the drive
    Mount {
        /// Mount point (defaults to the configured one)
        mount_point: Option<PathBuf>,

        /// Enable create, write, truncate and delete
        #[arg(long, conflicts_with = "read_only")]
        read_write: bool,

        /// Mount read-only even if the configuration enables writes
        #[arg(long)]
        read_only: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the drive
    Unmount {
        /// Mount point
        mount_point: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(long)]
        save: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(level))
        .with_target(false)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set subscriber");
    }

    if let Err(e) = run_command(cli.command, config, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config: Config, config_path: &Path) -> Result<()> {
    match command {
        Commands::Mount {
            mount_point,
            read_write,
            read_only,
            allow_other,
        } => {
            let access = match (read_write, read_only) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            cmd_mount(config, mount_point, access, allow_other)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&expand_tilde(&mount_point)),

        Commands::Config { save } => cmd_config(&config, config_path, save),
    }
}

fn cmd_mount(
    mut config: Config,
    mount_point: Option<PathBuf>,
    read_write: Option<bool>,
    allow_other: bool,
) -> Result<()> {
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = expand_tilde(&mount_point);
    }
    config.apply_cli_overrides(read_write, allow_other);
    config.validate()?;

    let mount_point = config.mount.mount_point.clone();
    let options = mount_options(&config.mount);

    // Ensure mount point exists
    std::fs::create_dir_all(&mount_point)?;

    // No account session is wired in yet, so serve a scratch account
    warn!("No remote session configured; contents are kept in memory only");
    let remote = Arc::new(MemoryRemote::new());

    let invalidator = Arc::new(KernelInvalidator::new());
    let fs = DriveFs::new(&config, remote, Owner::current(), invalidator.clone())?;

    info!(
        "Mounting at {:?} ({})",
        mount_point,
        if config.mount.read_write {
            "read-write"
        } else {
            "read-only"
        }
    );

    let mut session = fuser::Session::new(fs, &mount_point, &options)
        .map_err(|e| Error::Internal(format!("Failed to mount: {}", e)))?;
    invalidator.attach(session.notifier());

    session
        .run()
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    // Use fusermount/umount
    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_config(config: &Config, config_path: &Path, save: bool) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    println!("{}", content);

    if save {
        config.save(config_path)?;
        info!("Configuration written to {:?}", config_path);
    }
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
