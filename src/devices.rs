//! Device registration table (C4).
//!
//! Two keyed maps, one for plain block devices (keyed by the `major:minor`
//! device number) and one for loop devices (keyed by the absolute path to
//! the backing file), matching the split the original `blkdevs_ht`/
//! `loops_ht` rhashtables made. Concurrent readers hold an `Arc` clone of
//! whatever they looked up, so an unregister racing with an in-flight
//! reader never frees memory out from under it, the Rust replacement for
//! the kernel's RCU-protected lookup plus `kfree_rcu`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Identifies a registered device by whichever of the two admissible shapes
/// it was opened as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    /// A raw block device, keyed by its `st_rdev` value.
    Block(u64),
    /// A loop device or regular file backing one, keyed by the absolute
    /// path to the backing file.
    Loop(PathBuf),
}

/// Classify a filesystem path into the key the registry would use for it.
///
/// Mirrors `__do_device_reging_operation`'s dispatch: a block-special node
/// on the loop major resolves to its backing file, any other block node
/// keys on its device number, and a regular file keys on its own path.
pub fn classify_path(path: &Path) -> Result<DeviceKey> {
    let meta = std::fs::metadata(path)
        .map_err(|_| Error::InvalidArgument(format!("cannot stat {}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};
        if meta.file_type().is_block_device() {
            let rdev = meta.rdev();
            if let Some(backing) = loop_backing_file(rdev) {
                return Ok(DeviceKey::Loop(backing));
            }
            return Ok(DeviceKey::Block(rdev));
        }
    }

    if meta.is_file() {
        let abs = std::fs::canonicalize(path)
            .map_err(|_| Error::InvalidArgument(format!("cannot resolve {}", path.display())))?;
        return Ok(DeviceKey::Loop(abs));
    }

    Err(Error::InvalidArgument(format!(
        "{} is neither a block device nor a regular file",
        path.display()
    )))
}

/// Resolve a loop device's backing file via its sysfs attribute. Returns
/// `None` on any platform or device where that attribute doesn't apply, in
/// which case the caller falls back to keying on the device number itself.
#[cfg(target_os = "linux")]
fn loop_backing_file(rdev: u64) -> Option<PathBuf> {
    const LOOP_MAJOR: u64 = 7;
    let major = (rdev >> 8) & 0xfff;
    let minor = (rdev & 0xff) | ((rdev >> 12) & 0xfff00);
    if major != LOOP_MAJOR {
        return None;
    }
    let attr = format!("/sys/class/block/loop{minor}/loop/backing_file");
    std::fs::read_to_string(attr)
        .ok()
        .map(|s| PathBuf::from(s.trim_end()))
}

#[cfg(not(target_os = "linux"))]
fn loop_backing_file(_rdev: u64) -> Option<PathBuf> {
    None
}

/// The two-keyed registration table, gated by an admission latch that is
/// held read-side by `register`/`unregister` and write-side only while
/// shutdown is unlinking every entry.
pub struct Registry<O: Clone> {
    by_block: RwLock<HashMap<u64, O>>,
    by_loop: RwLock<HashMap<PathBuf, O>>,
    admission: RwLock<()>,
    shutting_down: AtomicBool,
}

impl<O: Clone> Registry<O> {
    pub fn new() -> Self {
        Self {
            by_block: RwLock::new(HashMap::new()),
            by_loop: RwLock::new(HashMap::new()),
            admission: RwLock::new(()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Insert a new entry under `key`, failing if one is already present or
    /// the registry is draining for shutdown.
    pub fn register(&self, key: DeviceKey, object: O) -> Result<()> {
        let _admitted = self.admission.read();
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ServiceShuttingDown);
        }
        match key {
            DeviceKey::Block(devt) => {
                let mut map = self.by_block.write();
                if map.contains_key(&devt) {
                    return Err(Error::AlreadyRegistered);
                }
                map.insert(devt, object);
            }
            DeviceKey::Loop(path) => {
                let mut map = self.by_loop.write();
                if map.contains_key(&path) {
                    return Err(Error::AlreadyRegistered);
                }
                map.insert(path, object);
            }
        }
        Ok(())
    }

    /// Remove and return the entry at `key`, if any.
    pub fn unregister(&self, key: &DeviceKey) -> Result<O> {
        let _admitted = self.admission.read();
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ServiceShuttingDown);
        }
        let removed = match key {
            DeviceKey::Block(devt) => self.by_block.write().remove(devt),
            DeviceKey::Loop(path) => self.by_loop.write().remove(path),
        };
        removed.ok_or(Error::NotFound)
    }

    /// Clone out the entry registered at `key`, if any. The clone keeps the
    /// underlying data alive even if a concurrent `unregister` removes it
    /// from the map immediately afterward.
    pub fn lookup(&self, key: &DeviceKey) -> Option<O> {
        match key {
            DeviceKey::Block(devt) => self.by_block.read().get(devt).cloned(),
            DeviceKey::Loop(path) => self.by_loop.read().get(path).cloned(),
        }
    }

    /// Begin shutdown: block further `register`/`unregister` calls and
    /// drain both maps, returning every entry that was present.
    pub fn begin_shutdown(&self) -> Vec<O> {
        let _admitted = self.admission.write();
        self.shutting_down.store(true, Ordering::Release);
        let mut drained: Vec<O> = self.by_block.write().drain().map(|(_, v)| v).collect();
        drained.extend(self.by_loop.write().drain().map(|(_, v)| v));
        drained
    }
}

impl<O: Clone> Default for Registry<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let reg: Registry<u32> = Registry::new();
        let key = DeviceKey::Block(0x0800_0001);
        reg.register(key.clone(), 42).unwrap();
        assert_eq!(reg.lookup(&key), Some(42));
    }

    #[test]
    fn duplicate_register_is_rejected() {
        let reg: Registry<u32> = Registry::new();
        let key = DeviceKey::Loop(PathBuf::from("/tmp/backing.img"));
        reg.register(key.clone(), 1).unwrap();
        assert!(matches!(
            reg.register(key, 2),
            Err(Error::AlreadyRegistered)
        ));
    }

    #[test]
    fn shutdown_rejects_new_registrations() {
        let reg: Registry<u32> = Registry::new();
        reg.begin_shutdown();
        let err = reg.register(DeviceKey::Block(1), 1).unwrap_err();
        assert!(matches!(err, Error::ServiceShuttingDown));
    }

    #[test]
    fn unregister_missing_is_not_found() {
        let reg: Registry<u32> = Registry::new();
        let err = reg.unregister(&DeviceKey::Block(99)).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }
}
