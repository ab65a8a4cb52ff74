//! Mount observer (C7).
//!
//! A thin adapter between the host's mount/unmount notifications and the
//! epoch state machine. Assumes the host has already filtered out
//! remounts, bind mounts and moves; this observer calls `mount_seen`/
//! `umount_seen` exactly once per event it receives.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::devices::classify_path;
use crate::engine::Engine;
use crate::epoch::{mount_seen, umount_seen};

/// A mount or unmount notification for a path the host resolved.
#[derive(Debug, Clone)]
pub enum MountEvent {
    Mounted(PathBuf),
    Unmounted(PathBuf),
}

/// Consumes a stream of [`MountEvent`]s and drives epoch transitions on
/// whatever `Engine` it was built with.
pub struct MountObserver {
    engine: Arc<Engine>,
}

impl MountObserver {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run until `rx` is closed.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<MountEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                MountEvent::Mounted(path) => self.on_mount(&path),
                MountEvent::Unmounted(path) => self.on_unmount(&path),
            }
        }
    }

    fn on_mount(&self, path: &std::path::Path) {
        match classify_path(path) {
            Ok(key) => match self.engine.entry(&key) {
                Some(entry) => mount_seen(&entry),
                None => log::debug!("mount event for unregistered device {}", path.display()),
            },
            Err(e) => log::warn!("could not classify mount event for {}: {}", path.display(), e),
        }
    }

    fn on_unmount(&self, path: &std::path::Path) {
        match classify_path(path) {
            Ok(key) => match self.engine.entry(&key) {
                Some(entry) => umount_seen(&entry),
                None => log::debug!("unmount event for unregistered device {}", path.display()),
            },
            Err(e) => log::warn!("could not classify unmount event for {}: {}", path.display(), e),
        }
    }
}
