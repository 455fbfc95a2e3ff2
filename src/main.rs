//! prismafs - Layered userspace filesystem
//!
//! Usage:
//!   prismafs mount <mount_point> --upper <dir> --lower <dir>...  - Mount a layer stack
//!   prismafs unmount <mount_point>                               - Unmount
//!   prismafs check [--upper <dir> --lower <dir>...]              - Validate a layer stack

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prismafs::{
    config::{Config, LayerSpec},
    dispatch::Dispatcher,
    fs::PrismaFs,
    layer::LayerStack,
    lock::PathLocks,
    namespace::Namespace,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prismafs")]
#[command(author = "prismafs Contributors")]
#[command(version)]
#[command(about = "Layered userspace filesystem with Plan 9 style union binds")]
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

/// Layer list given on the command line
#[derive(clap::Args, Clone)]
struct LayerArgs {
    /// Writable layer (rank 0)
    #[arg(long)]
    upper: Option<PathBuf>,

    /// Read-only layer, highest precedence first (repeatable)
    #[arg(long)]
    lower: Vec<PathBuf>,

    /// Hide dot-files from directory listings
    #[arg(long)]
    hide_dotfiles: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a layer stack
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        #[command(flatten)]
        layers: LayerArgs,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Validate a layer configuration without mounting
    Check {
        #[command(flatten)]
        layers: LayerArgs,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run_command(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Mount {
            mount_point,
            layers,
            allow_other,
        } => {
            let mut config = load_config(cli.config.as_deref(), &layers)?;
            config.mount.mount_point = mount_point;
            config.mount.allow_other |= allow_other;
            cmd_mount(config)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Check { layers } => {
            let config = load_config(cli.config.as_deref(), &layers)?;
            cmd_check(&config)
        }
    }
}

/// Read the config file (if any) and apply command-line layers on top
fn load_config(path: Option<&Path>, args: &LayerArgs) -> Result<Config> {
    let explicit = path.map(expand_tilde);
    let path = explicit.clone().unwrap_or_else(Config::default_path);
    let from_cli = args.upper.is_some();

    let mut config = if path.exists() {
        let mut config = Config::read(&path)
            .with_context(|| format!("loading configuration from {:?}", path))?;
        if from_cli {
            config.layers.clear();
        }
        config
    } else if explicit.is_some() {
        bail!("configuration file {:?} does not exist", path);
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    };

    if let Some(upper) = &args.upper {
        config.layers.push(LayerSpec::writable(expand_tilde(upper)));
    } else if !args.lower.is_empty() {
        bail!("--lower requires --upper");
    }
    for lower in &args.lower {
        config.layers.push(LayerSpec::read_only(expand_tilde(lower)));
    }
    config.hide_dotfiles |= args.hide_dotfiles;

    config.validate().context("invalid layer configuration")?;
    Ok(config)
}

fn cmd_mount(config: Config) -> Result<()> {
    let mount_point = config.mount.mount_point.clone();
    std::fs::create_dir_all(&mount_point)
        .with_context(|| format!("creating mount point {:?}", mount_point))?;

    let namespace = Namespace::global().clone();
    namespace
        .mount(&mount_point, &config.layers, config.stack_options())
        .with_context(|| format!("binding layers at {:?}", mount_point))?;

    let locks = PathLocks::new(config.locking.timeout(), config.locking.retries);
    let dispatcher = Dispatcher::new(namespace.clone(), &mount_point, locks);
    let fs = PrismaFs::new(dispatcher, config.mount.attr_ttl());

    let mut options = vec![
        fuser::MountOption::FSName(config.mount.fs_name.clone()),
        fuser::MountOption::DefaultPermissions,
    ];
    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    info!(
        "Mounting {} layers at {:?}",
        config.layers.len(),
        mount_point
    );
    let served = fuser::mount2(fs, &mount_point, &options);

    if let Err(e) = namespace.unmount(&mount_point) {
        warn!("Namespace cleanup for {:?}: {}", mount_point, e);
    }
    served.with_context(|| format!("serving {:?}", mount_point))?;

    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()
        .context("running fusermount")?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()
        .context("running umount")?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        bail!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}

fn cmd_check(config: &Config) -> Result<()> {
    let stack = LayerStack::from_specs(
        &config.mount.mount_point,
        &config.layers,
        config.stack_options(),
    )?;

    println!("prismafs layer stack");
    println!("====================");
    println!();
    println!("Mount point: {:?}", stack.mount_point());
    for layer in stack.layers() {
        println!(
            "  rank {}  {}  {:<9}  {:?}",
            layer.rank,
            layer.id,
            if layer.is_writable() { "writable" } else { "read-only" },
            layer.root()
        );
    }
    if stack.overlaps(stack.mount_point()) {
        println!();
        println!("warning: a layer root overlaps the mount point; mount will be refused");
    }
    println!("Resolution cache: {} entries", config.cache.capacity);
    println!("Hide dot-files: {}", config.hide_dotfiles);
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
