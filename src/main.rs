//! hepunion - two-branch union filesystem
//!
//! Usage:
//!   hepunion mount <branches> <mount_point>  - Mount the union
//!   hepunion unmount <mount_point>           - Unmount it
//!   hepunion check <branches>                - Parse and resolve branches only
//!   hepunion init                            - Write a default configuration

use clap::{Parser, Subcommand};
use hepunion::{
    branch::{
        resolve, BranchRole, EntryOperations, HostRevalidate, MountDescriptor, SuperblockTable,
    },
    config::Config,
    fs::{registry, Registry, UnionFs, HEPUNION_NAME},
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "hepunion")]
#[command(version)]
#[command(about = "Union filesystem merging a read-write branch over a read-only one")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Branches to store, `path[=RW|RO]:path[=RW|RO]`
        #[arg(long)]
        branches: Option<String>,

        /// Mount point to store
        #[arg(long)]
        mount_point: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Mount the union
    Mount {
        /// Branches, `path[=RW|RO]:path[=RW|RO]`; defaults to the configured ones
        branches: Option<String>,

        /// Mount point directory; defaults to the configured one
        mount_point: Option<PathBuf>,

        /// Stay attached to the terminal
        #[arg(short, long)]
        foreground: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the union
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Parse and resolve branches without mounting
    Check {
        /// Branches, `path[=RW|RO]:path[=RW|RO]`
        branches: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            branches,
            mount_point,
            force,
        } => cmd_init(config_path, branches, mount_point, force),

        Commands::Mount {
            branches,
            mount_point,
            foreground,
            allow_other,
        } => cmd_mount(config_path, branches, mount_point, foreground, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Check { branches } => cmd_check(&branches),
    }
}

fn cmd_init(
    config_path: &Path,
    branches: Option<String>,
    mount_point: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    let mut config = Config::default();
    config.branches.spec = branches;
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = mount_point;
    }
    config.validate()?;
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    branches: Option<String>,
    mount_point: Option<PathBuf>,
    foreground: bool,
    allow_other: bool,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = mount_point;
    }
    if allow_other {
        config.mount.allow_other = true;
    }
    let branches = branches
        .or_else(|| config.branches.spec.clone())
        .ok_or(Error::MissingArgument)?;

    hepunion::branch::check_directory(&config.mount.mount_point).map_err(|e| {
        Error::InvalidConfig(format!(
            "mount point {}: {}",
            config.mount.mount_point.display(),
            e
        ))
    })?;

    registry::init()?;
    let result = serve(&config, &branches, foreground);
    registry::shutdown();
    result
}

fn serve(config: &Config, branches: &str, foreground: bool) -> Result<()> {
    let entry_ops: Option<Arc<dyn EntryOperations>> = if config.branches.revalidate {
        Some(Arc::new(HostRevalidate))
    } else {
        None
    };

    let sb = Registry::global().mount(HEPUNION_NAME, Some(branches), false, entry_ops)?;
    let fs = UnionFs::new(sb, Duration::from_secs(config.branches.attr_ttl_secs));

    let mut options = vec![
        fuser::MountOption::FSName(config.mount.fs_name.clone()),
        fuser::MountOption::Subtype(HEPUNION_NAME.to_string()),
    ];
    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if config.mount.default_permissions {
        options.push(fuser::MountOption::DefaultPermissions);
    }

    let mount_point = &config.mount.mount_point;
    if foreground {
        info!("Mounting at {:?}", mount_point);
    } else {
        warn!(
            "Background mode is not supported, serving {:?} in the foreground",
            mount_point
        );
    }

    fuser::mount2(fs, mount_point, &options).map_err(Error::Io)?;
    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    let output = std::process::Command::new("fusermount")
        .arg("-u")
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

fn cmd_check(branches: &str) -> Result<()> {
    let descriptor = MountDescriptor::parse(branches)?;
    let superblocks = SuperblockTable::new();

    for role in [BranchRole::ReadWrite, BranchRole::ReadOnly] {
        let spec = descriptor.branch(role);
        let bound = resolve(spec, &superblocks, None)?;
        let sb = bound.superblock();
        println!(
            "{:<10} {}  ({}, max object size {})",
            spec.role,
            bound.mount().root().display(),
            sb.fs_name(),
            sb.max_object_size()
        );
    }
    println!("{}", descriptor);

    Ok(())
}
