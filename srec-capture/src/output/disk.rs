//! Free disk space checks.

use std::path::Path;

use sysinfo::Disks;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Source of free-space information for a directory.
pub trait DiskSpaceProbe: Send + Sync {
    /// Available bytes on the filesystem holding `path`, `None` if unknown.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by the OS disk list.
///
/// The disk with the longest mount point that prefixes the (canonicalized)
/// path wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDiskProbe;

impl SysinfoDiskProbe {
    pub fn new() -> Self {
        Self
    }
}

impl DiskSpaceProbe for SysinfoDiskProbe {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        let mut best_match: Option<(&sysinfo::Disk, usize)> = None;
        for disk in disks.list() {
            let mount_point = disk.mount_point();
            if path.starts_with(mount_point) {
                let mount_len = mount_point.as_os_str().len();
                if best_match.is_none_or(|(_, len)| mount_len > len) {
                    best_match = Some((disk, mount_len));
                }
            }
        }

        best_match.map(|(disk, _)| disk.available_space())
    }
}

/// Probe that always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskProbe(pub Option<u64>);

impl DiskSpaceProbe for FixedDiskProbe {
    fn available_space(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

/// Fail with [`Error::InsufficientDiskSpace`] if `dir` has less than
/// `required` bytes free. `required == 0` skips the check; an unknown value
/// is tolerated.
pub fn ensure_disk_space(probe: &dyn DiskSpaceProbe, dir: &Path, required: u64) -> Result<()> {
    if required == 0 {
        return Ok(());
    }

    match probe.available_space(dir) {
        Some(available) if available < required => {
            warn!(
                path = %dir.display(),
                "Insufficient disk space: {} bytes available, {} bytes required",
                available, required
            );
            Err(Error::InsufficientDiskSpace {
                path: dir.to_path_buf(),
                available,
                required,
            })
        }
        Some(available) => {
            debug!(
                "Disk space OK: {} bytes available, {} bytes required",
                available, required
            );
            Ok(())
        }
        None => {
            warn!(path = %dir.display(), "Could not determine disk space, continuing");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_space() {
        let err = ensure_disk_space(&FixedDiskProbe(Some(10)), Path::new("/tmp"), 100).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientDiskSpace {
                available: 10,
                required: 100,
                ..
            }
        ));
    }

    #[test]
    fn test_enough_space() {
        assert!(ensure_disk_space(&FixedDiskProbe(Some(100)), Path::new("/tmp"), 100).is_ok());
    }

    #[test]
    fn test_unknown_space_tolerated() {
        assert!(ensure_disk_space(&FixedDiskProbe(None), Path::new("/tmp"), 100).is_ok());
    }

    #[test]
    fn test_zero_requirement_skips_probe() {
        assert!(ensure_disk_space(&FixedDiskProbe(Some(0)), Path::new("/tmp"), 0).is_ok());
    }

    #[test]
    fn test_sysinfo_probe_on_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        // Containers may not expose a disk list; only check it doesn't panic.
        let _ = SysinfoDiskProbe::new().available_space(dir.path());
    }
}
