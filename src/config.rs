//! Tunable parameters for the snapshot engine.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Number of dedup entries tracked per device before the oldest is evicted.
pub const DEFAULT_LRU_CAPACITY: usize = 65_536;

/// Default on-host directory snapshots are filed under.
pub const DEFAULT_SNAPSHOT_ROOT: &str = "/snapshot";

/// Default leaf filename for a device's snapblock journal.
pub const DEFAULT_SNAPBLOCKS_FILENAME: &str = "snapblocks";

/// A password handed to an `Authenticator`, zeroized once dropped.
pub type SecretPassword = Zeroizing<String>;

/// Engine-wide configuration, analogous to the per-module `*Config` structs
/// the rest of the ambient stack uses.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each device's dedup cache.
    pub lru_capacity: NonZeroUsize,
    /// Root directory under which per-device snapshot directories are created.
    pub snapshot_root: PathBuf,
    /// Leaf filename of the append-only snapblock file within a snapshot directory.
    pub snapblocks_filename: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lru_capacity: NonZeroUsize::new(DEFAULT_LRU_CAPACITY).unwrap(),
            snapshot_root: PathBuf::from(DEFAULT_SNAPSHOT_ROOT),
            snapblocks_filename: DEFAULT_SNAPBLOCKS_FILENAME.to_string(),
        }
    }
}
