use crate::device::RawVolume;

/// Substrings of a description or label that suggest removable media on Windows.
const REMOVABLE_KEYWORDS: &[&str] = &["removable", "usb", "sd", "flash", "card"];

/// Filesystems commonly found on removable media sold for Windows hosts.
const REMOVABLE_FILESYSTEMS: &[&str] = &["fat", "fat32", "exfat", "ntfs"];

/// Conventional mount locations for removable media on Unix hosts.
const POSIX_REMOVABLE_MOUNTS: &[&str] = &["/media/", "/mnt/", "/run/media/", "/volumes/"];

/// Decides whether a host volume may be offered for provisioning.
///
/// Each variant carries the identity of the host's system volume, which is
/// never eligible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EligibilityPolicy {
    /// `system_drive` is the boot drive letter, e.g. `C:`.
    Windows { system_drive: String },
    /// `system_disk` is the whole disk hosting `/`, e.g. `/dev/disk3`.
    Darwin { system_disk: String },
    /// `system_disk` is the parent disk of the device mounted at `/`, e.g. `/dev/nvme0n1`.
    Posix { system_disk: String },
}

impl EligibilityPolicy {
    pub fn is_eligible(&self, volume: &RawVolume) -> bool {
        match self {
            EligibilityPolicy::Windows { system_drive } => windows_eligible(volume, system_drive),
            EligibilityPolicy::Darwin { system_disk } => darwin_eligible(volume, system_disk),
            EligibilityPolicy::Posix { system_disk } => posix_eligible(volume, system_disk),
        }
    }
}

/// Returns the upper-cased drive letter (`E:`) of a mount like `e:`, `E:\` or `E:/`.
pub fn drive_letter(mount: &str) -> Option<String> {
    let mut chars = mount.chars();
    let letter = chars.next().filter(char::is_ascii_alphabetic)?;
    if chars.next() != Some(':') {
        return None;
    }
    match chars.as_str() {
        "" | "\\" | "/" => Some(format!("{}:", letter.to_ascii_uppercase())),
        _ => None,
    }
}

// The OS removable flag is unreliable across driver stacks, so any one of the
// signals is enough once the system letter is ruled out.
fn windows_eligible(volume: &RawVolume, system_drive: &str) -> bool {
    let Some(letter) = drive_letter(&volume.mount_point) else {
        return false;
    };
    let system = drive_letter(system_drive).unwrap_or_else(|| "C:".to_string());
    if letter == system {
        return false;
    }

    if volume.removable {
        return true;
    }

    let fs = volume.filesystem_type.to_ascii_lowercase();
    if REMOVABLE_FILESYSTEMS.contains(&fs.as_str()) {
        return true;
    }

    let text = format!(
        "{} {}",
        volume.description,
        volume.label.as_deref().unwrap_or_default()
    )
    .to_ascii_lowercase();
    REMOVABLE_KEYWORDS.iter().any(|k| text.contains(k))
}

// The boot volume lives on a synthesized APFS container, so the container
// comparison alone misses other partitions of the physical boot disk. An
// internal, non-removable disk is never offered.
fn darwin_eligible(volume: &RawVolume, system_disk: &str) -> bool {
    if !volume.mount_point.starts_with("/Volumes/") {
        return false;
    }
    if volume.internal && !volume.removable {
        return false;
    }
    match darwin_whole_disk(&volume.identifier) {
        Some(disk) => disk != darwin_whole_disk(system_disk).unwrap_or_default(),
        // Not backed by a BSD disk node (network or virtual filesystem).
        None => false,
    }
}

fn posix_eligible(volume: &RawVolume, system_disk: &str) -> bool {
    if volume.mount_point == "/" {
        return false;
    }
    if !system_disk.is_empty() && posix_parent_device(&volume.identifier) == system_disk {
        return false;
    }

    let mount = volume.mount_point.to_ascii_lowercase();
    let device = volume.identifier.to_ascii_lowercase();
    POSIX_REMOVABLE_MOUNTS.iter().any(|m| mount.contains(m))
        || mount.contains("usb")
        || device.contains("usb")
}

/// Translates a Darwin partition node to the node of its whole disk.
///
/// `/dev/disk4s1` and `/dev/rdisk4s1` both become `/dev/disk4`; APFS
/// snapshots like `/dev/disk3s1s1` become `/dev/disk3`. Returns `None` for
/// anything that is not a BSD disk node.
pub fn darwin_whole_disk(path: &str) -> Option<String> {
    let name = path.strip_prefix("/dev/").unwrap_or(path);
    let name = name.strip_prefix('r').unwrap_or(name);
    let number = name.strip_prefix("disk")?;
    let digits: String = number.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("/dev/disk{digits}"))
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
pub fn posix_parent_device(path: &str) -> String {
    let last = path.rsplit('/').next().unwrap_or(path);

    if last.starts_with("mmcblk") || last.starts_with("nvme") || last.starts_with("loop") {
        // Partitions carry a `p<N>` suffix: mmcblk0p1, nvme0n1p2.
        if let Some(index) = path.rfind('p') {
            let (head, tail) = path.split_at(index);
            let tail = &tail[1..];
            if !tail.is_empty()
                && tail.chars().all(|c| c.is_ascii_digit())
                && head.ends_with(|c: char| c.is_ascii_digit())
            {
                return head.to_string();
            }
        }
        return path.to_string();
    }

    if ["sd", "vd", "hd", "xvd"].iter().any(|p| last.starts_with(p)) {
        return path.trim_end_matches(|c: char| c.is_ascii_digit()).to_string();
    }

    path.to_string()
}
