//! # addfs-mount
//!
//! FUSE front end for addfs. Builds a [`PolicyEngine`] over the source
//! directory and serves it at a mount point with `fuser`.

pub mod errno;
pub mod filesystem;
pub mod handles;
pub mod inode;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use addfs_kernel::{AddFsConfig, ConfigError, LocalBackend, PolicyEngine, VfsError};
use fuser::{BackgroundSession, MountOption};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::info;

pub use errno::ToErrno;
pub use filesystem::AddFs;

/// FUSE subtype reported in the mount table.
pub const FS_SUBTYPE: &str = "addfs";

/// Errors setting up a mount.
#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot open source directory: {0}")]
    Source(#[from] VfsError),

    #[error("mount at {mountpoint} failed: {source}")]
    Mount {
        mountpoint: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A built engine together with the canonical source path it serves.
pub struct Prepared {
    pub engine: Arc<PolicyEngine>,
    pub source: PathBuf,
}

/// Open the source directory and wrap it in a policy engine.
///
/// Fails on an invalid mutable pattern before anything is mounted.
pub fn build_engine(config: &AddFsConfig) -> Result<Prepared, MountError> {
    let backend = LocalBackend::try_new(&config.source_path)?;
    let source = backend.root().to_path_buf();
    let engine = PolicyEngine::new(Arc::new(backend), config)?;

    info!(
        source = %source.display(),
        allow_root_mutation = engine.allow_root_mutation(),
        mutable_patterns = ?engine.matcher().patterns().collect::<Vec<_>>(),
        "policy engine ready"
    );
    Ok(Prepared {
        engine: Arc::new(engine),
        source,
    })
}

/// Mount options for serving `source`.
///
/// The kernel enforces ordinary permission bits (`default_permissions`) and
/// every user may access the mount. Unless `keep_mounted` is set, the
/// mount is torn down automatically if the process dies.
pub fn mount_options(source: &Path, keep_mounted: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(source.display().to_string()),
        MountOption::Subtype(FS_SUBTYPE.to_string()),
        MountOption::DefaultPermissions,
        MountOption::AllowOther,
    ];
    if !keep_mounted {
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Mount in the foreground, blocking until the filesystem is unmounted
/// externally.
///
/// Filesystem operations run on `runtime`, so this must not be called from
/// one of its worker threads without `spawn_blocking`.
pub fn mount(config: &AddFsConfig, mountpoint: &Path, runtime: Handle) -> Result<(), MountError> {
    let Prepared { engine, source } = build_engine(config)?;
    let options = mount_options(&source, config.keep_mounted);

    info!(mountpoint = %mountpoint.display(), "mounting");
    fuser::mount2(AddFs::new(engine, runtime), mountpoint, &options).map_err(|source| {
        MountError::Mount {
            mountpoint: mountpoint.to_path_buf(),
            source,
        }
    })?;
    info!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(())
}

/// Mount on a background thread.
pub fn spawn_mount(
    config: &AddFsConfig,
    mountpoint: &Path,
    runtime: Handle,
) -> Result<MountHandle, MountError> {
    let Prepared { engine, source } = build_engine(config)?;
    let options = mount_options(&source, config.keep_mounted);

    info!(mountpoint = %mountpoint.display(), "mounting in background");
    let fs = AddFs::new(engine, runtime);
    let unmounted = fs.unmount_signal();
    let session = fuser::spawn_mount2(fs, mountpoint, &options)
        .map_err(|source| MountError::Mount {
            mountpoint: mountpoint.to_path_buf(),
            source,
        })?;

    Ok(MountHandle {
        session,
        mountpoint: mountpoint.to_path_buf(),
        unmounted,
    })
}

/// A background mount. Dropping the handle unmounts.
pub struct MountHandle {
    session: BackgroundSession,
    mountpoint: PathBuf,
    unmounted: Arc<Notify>,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Resolves once the session has ended, including after an external
    /// `fusermount -u`.
    pub async fn unmounted(&self) {
        self.unmounted.notified().await
    }

    /// Unmount the filesystem and wait for the session thread to stop.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        let Self {
            session,
            mountpoint,
            ..
        } = self;
        tokio::task::spawn_blocking(move || session.join()).await?;
        info!(mountpoint = %mountpoint.display(), "unmounted");
        Ok(())
    }
}
