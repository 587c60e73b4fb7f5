use std::path::Path;

use tracing::{debug, error};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Preflight check that `path`'s volume has at least `min_gigabytes` free.
///
/// Never fails: an unreadable volume is reported as `false` so the caller can
/// abort the run without an error path.
pub fn has_enough_space(path: &Path, min_gigabytes: u64) -> bool {
    match fs2::available_space(path) {
        Ok(free) => {
            let free_gb = free / GIB;
            if free_gb < min_gigabytes {
                error!(
                    path = %path.display(),
                    free_gb,
                    need_gb = min_gigabytes,
                    "not enough disk space: free={free_gb}GB need>={min_gigabytes}GB"
                );
                false
            } else {
                debug!(path = %path.display(), free_gb, need_gb = min_gigabytes, "disk space ok");
                true
            }
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "unable to read free disk space");
            false
        }
    }
}
