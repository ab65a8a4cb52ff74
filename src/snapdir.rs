//! Per-epoch snapshot directory management (C3).
//!
//! Mirrors the kernel worker's `path_snapdir_get`/`ensure_path_snapdir_ok`
//! pair: lookup-or-create a directory, and fail loudly with a conflict
//! rather than silently reusing a name collision with a non-directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A resolved, existing snapshot directory for one epoch.
#[derive(Debug)]
pub struct SnapDirHandle {
    path: PathBuf,
}

impl SnapDirHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates and validates the on-disk layout snapshots are filed under.
pub struct SnapDirManager;

impl SnapDirManager {
    /// Ensure `<root>/<basename(device_name)><first_mount_date>/` exists
    /// and is a directory, creating it if absent.
    pub async fn ensure_snapdir(
        root: &Path,
        device_name: &str,
        first_mount_date: &str,
    ) -> Result<Arc<SnapDirHandle>> {
        let basename = Path::new(device_name)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| device_name.to_string());
        let dirname = format!("{basename}{first_mount_date}");
        let path = root.join(dirname);

        ensure_dir_ok(&path).await?;
        Ok(Arc::new(SnapDirHandle { path }))
    }

    /// Re-validate a previously resolved snapshot directory, recreating it
    /// exactly once if it has gone stale (removed or replaced out from
    /// under us).
    pub async fn ensure_snapdir_ok(handle: &Arc<SnapDirHandle>) -> Result<()> {
        match tokio::fs::metadata(handle.path()).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::Conflict(format!(
                "{} exists and is not a directory",
                handle.path().display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "snapshot directory {} went missing, recreating",
                    handle.path().display()
                );
                ensure_dir_ok(handle.path()).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ensure the append-only snapblocks file exists inside `handle`,
    /// creating an empty regular file if absent.
    pub async fn ensure_snapblocks_file(
        handle: &SnapDirHandle,
        filename: &str,
    ) -> Result<PathBuf> {
        let path = handle.path.join(filename);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(Error::Conflict(format!(
                "{} exists and is not a regular file",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    file.set_permissions(std::fs::Permissions::from_mode(0o600))
                        .await?;
                }
                drop(file);
                Ok(path)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn ensure_dir_ok(path: &Path) -> Result<()> {
    // catch a non-directory ancestor (e.g. the snapshot root pre-created as
    // a regular file) before attempting the mkdir, so it surfaces as a
    // conflict rather than a raw I/O error.
    if let Some(parent) = path.parent() {
        if let Ok(meta) = tokio::fs::metadata(parent).await {
            if !meta.is_dir() {
                return Err(Error::Conflict(format!(
                    "{} exists and is not a directory",
                    parent.display()
                )));
            }
        }
    }

    match tokio::fs::create_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }

    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_dir() {
        return Err(Error::Conflict(format!(
            "{} exists and is not a directory",
            path.display()
        )));
    }
    Ok(())
}
