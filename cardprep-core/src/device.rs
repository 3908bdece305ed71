use std::fmt;

/// Label reported for volumes the host does not name.
pub const UNLABELED: &str = "Unlabeled";

/// A removable volume that is eligible for provisioning.
///
/// This is an immutable snapshot of the host state at query time. It is
/// produced by [`crate::platform::list_eligible_devices`] from a
/// [`RawVolume`] and never updated afterwards; query again to observe changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VolumeDescriptor {
    /// The OS handle of the volume (e.g., `/dev/sdb1`, `/dev/disk4s1` or `E:`).
    pub identifier: String,
    /// Where the volume is mounted (e.g., `/media/user/SD_CARD` or `E:\`).
    pub mount_point: String,
    /// The volume label, or [`UNLABELED`].
    pub label: String,
    /// The filesystem currently on the volume (e.g., "vfat", "exfat", "NTFS").
    pub filesystem_type: String,
    /// Total capacity in bytes.
    pub total_size: u64,
    /// Bytes in use.
    pub used_size: u64,
    /// Bytes free.
    pub available_size: u64,
}

impl VolumeDescriptor {
    /// Total capacity in gigabytes (GB).
    pub fn size_gb(&self) -> f64 {
        self.total_size as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for VolumeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {:<12} {:.1} GB [{}] [Mounted at {}]",
            self.identifier,
            self.label,
            self.size_gb(),
            self.filesystem_type,
            self.mount_point
        )
    }
}

/// A volume as reported by the host, before classification.
///
/// Carries the extra signals the eligibility heuristics look at, which are
/// dropped when the volume is mapped into a [`VolumeDescriptor`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawVolume {
    pub identifier: String,
    pub mount_point: String,
    pub label: Option<String>,
    pub filesystem_type: String,
    pub total_size: u64,
    pub available_size: u64,
    /// Whether the OS flags the media as removable. Unreliable on some driver stacks.
    pub removable: bool,
    /// Whether the disk sits on an internal bus. Internal disks that are not
    /// removable are treated as system disks on Darwin.
    pub internal: bool,
    /// Free-form media description from the OS (e.g., "Removable Disk").
    pub description: String,
}

impl From<RawVolume> for VolumeDescriptor {
    fn from(raw: RawVolume) -> Self {
        let label = raw
            .label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| UNLABELED.to_string());

        VolumeDescriptor {
            identifier: raw.identifier,
            mount_point: raw.mount_point,
            label,
            filesystem_type: raw.filesystem_type,
            total_size: raw.total_size,
            used_size: raw.total_size.saturating_sub(raw.available_size),
            available_size: raw.available_size,
        }
    }
}
