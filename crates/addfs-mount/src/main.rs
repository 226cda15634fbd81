//! addfs binary
//!
//! Mounts a directory as add-only: inside the mount point new files and
//! directories can be created, but existing ones cannot be deleted,
//! renamed, truncated or overwritten.
//!
//! ## Usage
//!
//! ```bash
//! addfs /srv/archive /mnt/archive
//! addfs --mutable-files '^/log/.*' --allow-root-mutation /srv/archive /mnt/archive
//! addfs --config ~/.config/addfs.toml /srv/archive /mnt/archive
//! ```
//!
//! Users with write access to the source directory itself can bypass the
//! mount, so startup is refused unless the source is owned by root, is not
//! world-writable, and addfs runs as root. `--ignore-warnings` skips those
//! checks.

use std::path::PathBuf;
use std::process::ExitCode;

use addfs_kernel::{validate_startup, AddFsConfig};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "addfs")]
#[command(about = "Mount a directory as read + add only")]
struct Args {
    /// Directory to protect
    source: PathBuf,

    /// Where to mount the protected view
    mountpoint: PathBuf,

    /// Let root mutate files and directories
    #[arg(long)]
    allow_root_mutation: bool,

    /// Allow mutation of paths matching this regex (repeatable)
    #[arg(long = "mutable-files", value_name = "REGEX")]
    mutable_files: Vec<String>,

    /// Skip the source directory ownership checks. Only use if you know
    /// what you are doing
    #[arg(long)]
    ignore_warnings: bool,

    /// Do not unmount on exit
    #[arg(long)]
    keep_mounted: bool,

    /// TOML config file; command-line flags are layered on top
    #[arg(long, value_name = "FILE")]
    config: Option<String>,
}

impl Args {
    /// The configuration given on the command line alone.
    fn to_config(&self) -> AddFsConfig {
        AddFsConfig::new(&self.source)
            .with_allow_root_mutation(self.allow_root_mutation)
            .with_mutable_patterns(self.mutable_files.iter().cloned())
            .with_ignore_ownership_warnings(self.ignore_warnings)
            .with_keep_mounted(self.keep_mounted)
    }

    /// Config file (if any) with command-line flags merged over it.
    fn load_config(&self) -> Result<AddFsConfig> {
        let base = match &self.config {
            Some(path) => {
                let path = shellexpand::tilde(path).into_owned();
                AddFsConfig::load(&path).with_context(|| format!("loading {path}"))?
            }
            None => AddFsConfig::default(),
        };
        Ok(base.merge(self.to_config()))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.load_config()?;

    if config.ignore_ownership_warnings {
        warn!("source directory checks disabled; direct writes to the source bypass protection");
    } else {
        validate_startup(&config).context("refusing to mount for safety reasons")?;
    }

    let runtime = tokio::runtime::Handle::current();
    let mountpoint = args.mountpoint;

    if config.keep_mounted {
        // Runs until unmounted from outside (fusermount -u).
        tokio::task::spawn_blocking(move || addfs_mount::mount(&config, &mountpoint, runtime))
            .await
            .context("mount thread panicked")??;
        return Ok(());
    }

    let handle = addfs_mount::spawn_mount(&config, &mountpoint, runtime)?;
    info!(mountpoint = %handle.mountpoint().display(), "mounted; press Ctrl-C to unmount");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("unmounting");
        }
        () = handle.unmounted() => {
            info!("unmounted externally");
        }
    }
    handle.join().await.context("unmount failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "addfs",
            "--allow-root-mutation",
            "--mutable-files",
            "^/log/.*",
            "--mutable-files",
            "\\.tmp$",
            "/srv/archive",
            "/mnt/archive",
        ])
        .unwrap();

        let config = args.to_config();
        assert_eq!(config.source_path, PathBuf::from("/srv/archive"));
        assert!(config.allow_root_mutation);
        assert_eq!(config.mutable_patterns, vec!["^/log/.*", "\\.tmp$"]);
        assert!(!config.keep_mounted);
        assert!(!config.ignore_ownership_warnings);
        assert_eq!(args.mountpoint, PathBuf::from("/mnt/archive"));
    }

    #[test]
    fn test_requires_source_and_mountpoint() {
        assert!(Args::try_parse_from(["addfs", "/srv/archive"]).is_err());
        assert!(Args::try_parse_from(["addfs"]).is_err());
    }

    #[test]
    fn test_cli_merged_over_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("addfs.toml");
        std::fs::write(
            &file,
            "source_path = \"/from/file\"\nmutable_patterns = [\"^/cache/\"]\nkeep_mounted = true\n",
        )
        .unwrap();

        let args = Args::try_parse_from([
            "addfs",
            "--config",
            file.to_str().unwrap(),
            "--mutable-files",
            "^/log/",
            "/srv/archive",
            "/mnt/archive",
        ])
        .unwrap();

        let config = args.load_config().unwrap();
        assert_eq!(config.source_path, PathBuf::from("/srv/archive"));
        assert_eq!(config.mutable_patterns, vec!["^/cache/", "^/log/"]);
        assert!(config.keep_mounted);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = Args::try_parse_from([
            "addfs",
            "--config",
            "/nonexistent/addfs.toml",
            "/srv/archive",
            "/mnt/archive",
        ])
        .unwrap();
        assert!(args.load_config().is_err());
    }
}
