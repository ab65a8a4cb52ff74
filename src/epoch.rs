//! Per-device epoch state machine (C5).
//!
//! An epoch exists only while at least one mount of a registered device is
//! active; it is born on the 0→1 mount transition (capturing the first
//! mount's timestamp) and its snapshot resources are torn down once the
//! mount count returns to exactly 0. Intermediate mount/unmount pairs just
//! adjust the count.

use std::sync::Arc;

use chrono::Local;

use crate::engine::{Job, ObjectData};
use crate::lru::LruSet;
use crate::snapdir::SnapDirHandle;

/// The live state of one mount epoch.
pub struct Epoch {
    mount_count: i64,
    first_mount_date: String,
    pub(crate) snapdir: Option<Arc<SnapDirHandle>>,
    pub(crate) cached_blocks: Option<LruSet<u64>>,
}

impl Epoch {
    pub fn mount_count(&self) -> i64 {
        self.mount_count
    }

    pub fn first_mount_date(&self) -> &str {
        &self.first_mount_date
    }
}

/// Format the current time the same way the kernel module's mount callback
/// does: a leading dash, four-digit year, `_` between date and time.
fn format_first_mount_date() -> String {
    Local::now().format("-%Y-%m-%d_%H:%M:%S").to_string()
}

/// Record a new mount of `entry`'s device, starting a fresh epoch if none
/// is currently active.
pub fn mount_seen(entry: &ObjectData) {
    let _general = entry.general.lock();
    let mut guard = entry.epoch.lock();
    match guard.as_mut() {
        Some(epoch) => {
            epoch.mount_count += 1;
        }
        None => {
            let first_mount_date = format_first_mount_date();
            log::debug!(
                "epoch started for {} at {}",
                entry.original_name.display(),
                first_mount_date
            );
            *guard = Some(Epoch {
                mount_count: 1,
                first_mount_date,
                snapdir: None,
                cached_blocks: None,
            });
        }
    }
}

/// Record an unmount of `entry`'s device. Once the mount count returns to
/// exactly 0, detaches the `Epoch` from `entry` right here (so a mount
/// arriving before the cleanup job is dequeued starts a genuinely fresh
/// epoch instead of reusing the dying one) and hands it off to a
/// `Job::Cleanup` posted on the device's own job queue, so the epoch's
/// resources are only dropped after every snapshot job queued while it
/// was still active.
pub fn umount_seen(entry: &ObjectData) {
    let _general = entry.general.lock();
    let mut guard = entry.epoch.lock();
    let Some(epoch) = guard.as_mut() else {
        return;
    };

    epoch.mount_count -= 1;
    if epoch.mount_count < 0 {
        log::debug!(
            "mount_count underflowed for {}, flooring at 0",
            entry.original_name.display()
        );
        epoch.mount_count = 0;
    }

    if epoch.mount_count == 0 {
        let ended = guard.take();
        drop(guard);
        drop(_general);
        if let Some(ended) = ended {
            let _ = entry.job_tx.send(Job::Cleanup(ended));
        }
    }
}
