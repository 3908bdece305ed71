use super::diskutil::DiskInfo;
use super::{EligibilityPolicy, HostSnapshot};
use crate::device::RawVolume;
use crate::error::DiscoveryError;
use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Helper to resolve the BSD device node backing a mount point, e.g.
/// `/Volumes/SDCARD` -> `/dev/disk4s1`, using `statfs(2)`.
fn mounted_from(mount_point: &Path) -> io::Result<String> {
    let c_path = CString::new(mount_point.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: `buf` is a plain C struct that statfs fully initialises on success.
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statfs(c_path.as_ptr(), &mut buf) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: f_mntfromname is NUL-terminated by the kernel.
    let name = unsafe { CStr::from_ptr(buf.f_mntfromname.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

/// Runs `diskutil info -plist` for a device node.
fn disk_info(node: &str) -> io::Result<DiskInfo> {
    let output = Command::new("diskutil")
        .args(["info", "-plist", node])
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "diskutil info {node} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    DiskInfo::parse(&output.stdout).map_err(io::Error::other)
}

fn query_error(mount_point: &Path, source: io::Error) -> DiscoveryError {
    DiscoveryError::Query {
        mount_point: mount_point.to_path_buf(),
        source,
    }
}

/// Queries the mounted volumes of a macOS host.
///
/// `sysinfo` reports volume names rather than device nodes on macOS, so each
/// mount is resolved to its BSD node with `statfs` and described by
/// `diskutil`. The system disk is the physical disk behind `/`, not its
/// APFS container. Volumes that cannot be resolved are skipped.
pub(crate) fn query_volumes() -> Result<HostSnapshot, DiscoveryError> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let root = Path::new("/");
    let root_node = mounted_from(root).map_err(|e| query_error(root, e))?;
    let system_disk = disk_info(&root_node)
        .map_err(|e| query_error(root, e))?
        .physical_disk()
        .ok_or(DiscoveryError::SystemVolumeUnknown)?;
    debug!(%system_disk, "found system disk");

    let mut volumes = Vec::new();
    for disk in disks.iter() {
        let described = mounted_from(disk.mount_point())
            .and_then(|node| disk_info(&node).map(|info| (node, info)));
        let (identifier, info) = match described {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    "Skipping volume at {}: {}",
                    disk.mount_point().display(),
                    query_error(disk.mount_point(), e)
                );
                continue;
            }
        };

        let name = disk.name().to_string_lossy().into_owned();
        volumes.push(RawVolume {
            identifier,
            mount_point: disk.mount_point().to_string_lossy().into_owned(),
            label: (!name.is_empty()).then_some(name),
            filesystem_type: disk.file_system().to_string_lossy().into_owned(),
            total_size: disk.total_space(),
            available_size: disk.available_space(),
            removable: info.removable() || disk.is_removable(),
            internal: info.internal,
            description: format!("{:?}", disk.kind()),
        });
    }

    Ok(HostSnapshot {
        policy: EligibilityPolicy::Darwin { system_disk },
        volumes,
    })
}
