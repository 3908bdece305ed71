use super::{EligibilityPolicy, HostSnapshot, posix_parent_device};
use crate::device::RawVolume;
use crate::error::DiscoveryError;
use std::path::Path;
use tracing::debug;

/// Queries the mounted volumes of a Linux or other Unix host.
///
/// The volume list comes from `sysinfo`, which reports the backing device
/// path as the disk name. The device mounted at `/` determines the system
/// disk; when it cannot be found the whole query fails so that nothing is
/// offered for formatting.
pub(crate) fn query_volumes() -> Result<HostSnapshot, DiscoveryError> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let system_disk = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| posix_parent_device(&device_path(disk.name().to_string_lossy().as_ref())))
        .ok_or(DiscoveryError::SystemVolumeUnknown)?;
    debug!(%system_disk, "found system disk");

    let volumes = disks
        .iter()
        .map(|disk| {
            let mount_point = disk.mount_point().to_string_lossy().into_owned();
            RawVolume {
                identifier: device_path(disk.name().to_string_lossy().as_ref()),
                label: label_from_mount(&mount_point),
                mount_point,
                filesystem_type: disk.file_system().to_string_lossy().into_owned(),
                total_size: disk.total_space(),
                available_size: disk.available_space(),
                removable: disk.is_removable(),
                internal: false,
                description: format!("{:?}", disk.kind()),
            }
        })
        .collect();

    Ok(HostSnapshot {
        policy: EligibilityPolicy::Posix { system_disk },
        volumes,
    })
}

fn device_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/dev/{name}")
    }
}

// Desktop automounters name the mount directory after the volume label.
fn label_from_mount(mount_point: &str) -> Option<String> {
    let mount = mount_point.to_ascii_lowercase();
    if !(mount.starts_with("/media/") || mount.starts_with("/run/media/")) {
        return None;
    }
    Path::new(mount_point)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_is_made_absolute() {
        assert_eq!(device_path("sdb1"), "/dev/sdb1");
        assert_eq!(device_path("/dev/sdb1"), "/dev/sdb1");
    }

    #[test]
    fn label_comes_from_automount_directory() {
        assert_eq!(
            label_from_mount("/media/user/SD_CARD").as_deref(),
            Some("SD_CARD")
        );
        assert_eq!(
            label_from_mount("/run/media/user/STICK").as_deref(),
            Some("STICK")
        );
        assert_eq!(label_from_mount("/mnt/card"), None);
    }
}
