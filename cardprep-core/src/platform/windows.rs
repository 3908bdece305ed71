use super::{EligibilityPolicy, HostSnapshot, drive_letter};
use crate::device::RawVolume;
use crate::error::DiscoveryError;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;
use windows_sys::Win32::Storage::FileSystem::GetDriveTypeW;
use windows_sys::Win32::System::WindowsProgramming::{
    DRIVE_CDROM, DRIVE_FIXED, DRIVE_RAMDISK, DRIVE_REMOTE, DRIVE_REMOVABLE,
};

/// Asks Win32 for the media type of a drive root such as `E:\` and renders
/// it the way Explorer describes drives.
fn drive_type(root: &Path) -> (bool, &'static str) {
    let wide: Vec<u16> = root.as_os_str().encode_wide().chain(Some(0)).collect();
    // SAFETY: `wide` is a NUL-terminated UTF-16 string that outlives the call.
    describe(unsafe { GetDriveTypeW(wide.as_ptr()) })
}

fn describe(kind: u32) -> (bool, &'static str) {
    match kind {
        DRIVE_REMOVABLE => (true, "Removable Disk"),
        DRIVE_FIXED => (false, "Local Fixed Disk"),
        DRIVE_REMOTE => (false, "Network Connection"),
        DRIVE_CDROM => (false, "CD-ROM Disc"),
        DRIVE_RAMDISK => (false, "RAM Disk"),
        _ => (false, "Unknown"),
    }
}

/// Queries the drive letters of a Windows host.
///
/// The system drive comes from `%SystemDrive%` and falls back to `C:`.
pub(crate) fn query_volumes() -> Result<HostSnapshot, DiscoveryError> {
    let system_drive = std::env::var("SystemDrive")
        .ok()
        .and_then(|d| drive_letter(&d))
        .unwrap_or_else(|| "C:".to_string());
    debug!(%system_drive, "found system drive");

    let disks = sysinfo::Disks::new_with_refreshed_list();
    let volumes = disks
        .iter()
        .map(|disk| {
            let mount_point = disk.mount_point().to_string_lossy().into_owned();
            let (flagged, description) = drive_type(disk.mount_point());
            let name = disk.name().to_string_lossy().into_owned();
            RawVolume {
                identifier: drive_letter(&mount_point).unwrap_or_else(|| mount_point.clone()),
                mount_point,
                label: (!name.is_empty()).then_some(name),
                filesystem_type: disk.file_system().to_string_lossy().into_owned(),
                total_size: disk.total_space(),
                available_size: disk.available_space(),
                removable: flagged || disk.is_removable(),
                internal: false,
                description: description.to_string(),
            }
        })
        .collect();

    Ok(HostSnapshot {
        policy: EligibilityPolicy::Windows { system_drive },
        volumes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_types_map_to_explorer_names() {
        assert_eq!(describe(DRIVE_REMOVABLE), (true, "Removable Disk"));
        assert_eq!(describe(DRIVE_FIXED), (false, "Local Fixed Disk"));
        assert_eq!(describe(DRIVE_REMOTE), (false, "Network Connection"));
        assert_eq!(describe(DRIVE_CDROM), (false, "CD-ROM Disc"));
        assert_eq!(describe(DRIVE_RAMDISK), (false, "RAM Disk"));
        assert_eq!(describe(0), (false, "Unknown"));
    }
}
