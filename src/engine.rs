//! The snapshot engine (C6): device registration plus the `test`/`search`/
//! `enqueue` interception contract and the per-device worker that turns
//! queued jobs into snapblock writes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::devices::{classify_path, DeviceKey, Registry};
use crate::epoch::Epoch;
use crate::error::{Error, Result};
use crate::journal::{JournalFile, SnapblockRecord};
use crate::lru::LruSet;
use crate::snapdir::SnapDirManager;

/// Per-device state shared between the registry, the epoch state machine
/// and the worker task. Held behind an `Arc` so an unregister racing with
/// an in-flight `search`/`enqueue` never invalidates a reader's reference.
pub struct ObjectData {
    pub(crate) original_name: PathBuf,
    pub(crate) job_tx: mpsc::UnboundedSender<Job>,
    /// Guards mutation of `epoch` (mount/unmount transitions).
    pub(crate) general: Mutex<()>,
    pub(crate) epoch: Mutex<Option<Epoch>>,
    wq_destroyed: AtomicBool,
    /// Write-locked only while tearing the device down, so an in-flight
    /// `search` (which only ever takes a read lock implicitly via `test`)
    /// cannot race a concurrent unregister.
    wq_destroy: RwLock<()>,
    /// Held by a live `Handle` from `search` through `enqueue`.
    cleanup_epoch: Arc<Mutex<()>>,
}

/// Work posted to a device's single-consumer queue.
pub enum Job {
    /// Snapshot one block's pre-image.
    Snapshot {
        blknr: u64,
        blksize: u64,
        data: Box<[u8]>,
    },
    /// The epoch just ended (mount count reached 0): `epoch.rs` already
    /// detached it from the entry synchronously, this message just drops
    /// the resources it was carrying. Ordinary FIFO message, so it only
    /// runs after every snapshot job queued while the epoch was still live.
    Cleanup(Epoch),
    /// The device is being unregistered: finish this message then exit
    /// the worker loop, dropping this task's `Arc<ObjectData>` clone.
    Shutdown,
}

/// A handle returned by [`Engine::search`], held across the decision of
/// whether to queue a snapshot. Dropping it (on any return path, including
/// an early failure) releases the `cleanup_epoch` latch. Consuming the
/// handle by value in [`Engine::enqueue`] is what makes the lock
/// non-leakable.
pub struct Handle {
    entry: Arc<ObjectData>,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

/// Owns the registration table and spawns/tracks one worker per
/// registered device.
pub struct Engine {
    registry: Registry<Arc<ObjectData>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
        }
    }

    /// Classify `path`, allocate its `ObjectData`, spawn its worker task
    /// and insert it into the registry.
    pub fn register(&self, path: &std::path::Path) -> Result<DeviceKey> {
        let key = classify_path(path)?;
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let entry = Arc::new(ObjectData {
            original_name: path.to_path_buf(),
            job_tx,
            general: Mutex::new(()),
            epoch: Mutex::new(None),
            wq_destroyed: AtomicBool::new(false),
            wq_destroy: RwLock::new(()),
            cleanup_epoch: Arc::new(Mutex::new(())),
        });

        self.registry.register(key.clone(), entry.clone())?;

        let worker_entry = entry.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            run_worker(worker_entry, config, job_rx).await;
        });

        Ok(key)
    }

    /// Fence off new submissions, mark the device destroyed, and post a
    /// `Shutdown` job so the worker finishes whatever was already queued
    /// before its task exits.
    pub fn unregister(&self, key: &DeviceKey) -> Result<()> {
        let entry = self.registry.unregister(key)?;
        let _fence = entry.wq_destroy.write();
        entry.wq_destroyed.store(true, Ordering::Release);
        let _ = entry.job_tx.send(Job::Shutdown);
        Ok(())
    }

    /// Speculative, cheap check: is this device registered, mounted, and
    /// not in the middle of being torn down? No latch is held on return.
    pub fn test(&self, key: &DeviceKey) -> bool {
        match self.registry.lookup(key) {
            Some(entry) => is_valid(&entry),
            None => false,
        }
    }

    /// Stronger check than `test`: on success, returns a [`Handle`] holding
    /// the `cleanup_epoch` latch until it is consumed by `enqueue` (or
    /// simply dropped).
    pub fn search(&self, key: &DeviceKey) -> Option<Handle> {
        let entry = self.registry.lookup(key)?;
        let guard = entry.cleanup_epoch.lock_arc();
        if is_valid(&entry) {
            Some(Handle {
                entry,
                _guard: guard,
            })
        } else {
            None
        }
    }

    /// Queue a block for snapshotting. Returns `false` if the device's
    /// worker has already been torn down between `search` and this call.
    /// The handle (and the latch it holds) is released on every return
    /// path because it is consumed by value.
    pub fn enqueue(&self, handle: Handle, blknr: u64, blksize: u64, data: Box<[u8]>) -> bool {
        handle
            .entry
            .job_tx
            .send(Job::Snapshot {
                blknr,
                blksize,
                data,
            })
            .is_ok()
    }

    /// Look up the shared per-device state for `key`, used by the mount
    /// observer to dispatch epoch transitions without going through the
    /// `test`/`search`/`enqueue` contract.
    pub(crate) fn entry(&self, key: &DeviceKey) -> Option<Arc<ObjectData>> {
        self.registry.lookup(key)
    }

    /// Blocking, exhaustive sweep: fence off the registry against further
    /// `register`/`unregister` calls, drain every remaining device, and post
    /// `Shutdown` to each one's worker. Infallible: a send failing because a
    /// worker already exited is logged and skipped, never propagated.
    pub fn shutdown(&self) {
        for entry in self.registry.begin_shutdown() {
            entry.wq_destroyed.store(true, Ordering::Release);
            if entry.job_tx.send(Job::Shutdown).is_err() {
                log::debug!(
                    "worker for {} already gone during shutdown",
                    entry.original_name.display()
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn register_for_test(&self, key: DeviceKey, name: PathBuf) -> Arc<ObjectData> {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let entry = Arc::new(ObjectData {
            original_name: name,
            job_tx,
            general: Mutex::new(()),
            epoch: Mutex::new(None),
            wq_destroyed: AtomicBool::new(false),
            wq_destroy: RwLock::new(()),
            cleanup_epoch: Arc::new(Mutex::new(())),
        });
        self.registry.register(key, entry.clone()).unwrap();
        let worker_entry = entry.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            run_worker(worker_entry, config, job_rx).await;
        });
        entry
    }
}

fn is_valid(entry: &Arc<ObjectData>) -> bool {
    if entry.wq_destroyed.load(Ordering::Acquire) {
        return false;
    }
    // mirrors spin_is_locked(wq_destroy_lock): a write-locked fence means
    // teardown is in progress right now.
    if entry.wq_destroy.try_read().is_none() {
        return false;
    }
    matches!(entry.epoch.lock().as_ref(), Some(e) if e.mount_count() > 0)
}

async fn run_worker(entry: Arc<ObjectData>, config: EngineConfig, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Snapshot {
                blknr,
                blksize,
                data,
            } => {
                if let Err(e) = handle_snapshot_job(&entry, &config, blknr, blksize, &data).await {
                    log::warn!(
                        target: "bdsnap_engine::worker",
                        "snapshot job for {} block {} failed: {}",
                        entry.original_name.display(),
                        blknr,
                        e
                    );
                }
            }
            Job::Cleanup(epoch) => {
                // already detached from entry.epoch by umount_seen; dropping
                // `epoch` here releases its snapdir handle and dedup cache.
                drop(epoch);
                log::debug!("epoch resources released for {}", entry.original_name.display());
            }
            Job::Shutdown => {
                log::debug!("worker for {} shutting down", entry.original_name.display());
                break;
            }
        }
    }
}

/// The per-block worker body: ensure the dedup cache exists, check it for
/// a hit, fall back to scanning the on-disk journal, and only on a full
/// miss actually write the pre-image. Every early exit restores the
/// (possibly-promoted) LRU state and whatever snapdir handle was resolved
/// so the next job doesn't redo the work.
async fn handle_snapshot_job(
    entry: &Arc<ObjectData>,
    config: &EngineConfig,
    blknr: u64,
    blksize: u64,
    data: &[u8],
) -> Result<()> {
    if data.len() as u64 != blksize {
        return Err(Error::InvalidArgument(format!(
            "block data length {} does not match blksize {}",
            data.len(),
            blksize
        )));
    }

    let (mut lru, snapdir, first_mount_date) = {
        let mut guard = entry.epoch.lock();
        let epoch = guard
            .as_mut()
            .ok_or_else(|| Error::Conflict("epoch ended before snapshot job ran".to_string()))?;
        let lru = epoch
            .cached_blocks
            .take()
            .unwrap_or_else(|| LruSet::new(config.lru_capacity));
        (lru, epoch.snapdir.take(), epoch.first_mount_date().to_string())
    };

    if lru.contains_mru(&blknr) {
        put_back(entry, lru, snapdir);
        return Ok(());
    }

    let snapdir = match snapdir {
        Some(handle) => match SnapDirManager::ensure_snapdir_ok(&handle).await {
            Ok(()) => handle,
            Err(e) => {
                put_back(entry, lru, None);
                return Err(e);
            }
        },
        None => {
            match SnapDirManager::ensure_snapdir(
                &config.snapshot_root,
                &entry.original_name.to_string_lossy(),
                &first_mount_date,
            )
            .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    put_back(entry, lru, None);
                    return Err(e);
                }
            }
        }
    };

    let file_path =
        match SnapDirManager::ensure_snapblocks_file(&snapdir, &config.snapblocks_filename).await {
            Ok(p) => p,
            Err(e) => {
                put_back(entry, lru, Some(snapdir));
                return Err(e);
            }
        };

    let mut journal = match JournalFile::open_append(&file_path).await {
        Ok(j) => j,
        Err(e) => {
            put_back(entry, lru, Some(snapdir));
            return Err(e);
        }
    };

    match journal.contains(blknr).await {
        Ok(true) => {
            // already on disk from an earlier epoch or a race; still warm
            // the cache so the next write to this block short-circuits.
            lru.insert(blknr);
            put_back(entry, lru, Some(snapdir));
            return Ok(());
        }
        Ok(false) => {}
        Err(Error::Integrity(msg)) => {
            // a corrupt journal needs manual attention, not a retry.
            log::error!(
                target: "bdsnap_engine::worker",
                "journal for {} is corrupt: {}",
                entry.original_name.display(),
                msg
            );
            put_back(entry, lru, Some(snapdir));
            return Err(Error::Conflict(msg));
        }
        Err(e) => {
            put_back(entry, lru, Some(snapdir));
            return Err(e);
        }
    }

    let rec = SnapblockRecord { blknr, data };
    match journal.append(&rec).await {
        Ok(()) => lru.insert(blknr),
        Err(e) => {
            put_back(entry, lru, Some(snapdir));
            return Err(e);
        }
    }

    put_back(entry, lru, Some(snapdir));
    Ok(())
}

fn put_back(
    entry: &Arc<ObjectData>,
    lru: LruSet<u64>,
    snapdir: Option<Arc<crate::snapdir::SnapDirHandle>>,
) {
    let mut guard = entry.epoch.lock();
    if let Some(epoch) = guard.as_mut() {
        epoch.cached_blocks = Some(lru);
        epoch.snapdir = snapdir;
    }
}
