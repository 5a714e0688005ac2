use std::path::PathBuf;
use std::time::Duration;

use crate::sig::CancelToken;

/// Root under which per-user communication directories are created.
pub const DEFAULT_TMP_ROOT: &str = "/tmp";

/// Settings shared by phy, device and back-channel connections.
#[derive(Debug, Clone)]
pub struct ComConfig {
    /// Directory holding `bs_<user>/<simulation_id>` namespaces
    pub tmp_root: PathBuf,
    /// Back-off between attempts to open a FIFO for writing while its
    /// reader is not there yet
    pub open_retry_interval: Duration,
    /// Blocking reads wake up at least this often to check for cancellation
    pub poll_interval: Duration,
    /// Guard against double launch of the same role with lock files
    pub use_lock_files: bool,
    /// Token observed by all blocking operations
    pub cancel: CancelToken,
}

impl Default for ComConfig {
    fn default() -> Self {
        Self {
            tmp_root: PathBuf::from(DEFAULT_TMP_ROOT),
            open_retry_interval: Duration::from_millis(1),
            poll_interval: Duration::from_millis(50),
            use_lock_files: true,
            cancel: CancelToken::new(),
        }
    }
}

impl ComConfig {
    /// Default settings rooted at a different temporary directory.
    pub fn with_tmp_root(tmp_root: impl Into<PathBuf>) -> Self {
        Self {
            tmp_root: tmp_root.into(),
            ..Default::default()
        }
    }
}
