//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! discover which mounted volumes are removable media that may be provisioned.
//!
//! Discovery is split in two halves. The host query lives in one submodule per
//! OS family, selected with conditional compilation (`#[cfg]`), and each of
//! them exposes the same `query_volumes` function. Classification of the
//! returned [`RawVolume`]s is done by [`EligibilityPolicy`], which is pure and
//! can be exercised on any host.

use crate::device::{RawVolume, VolumeDescriptor};
use crate::error::DiscoveryError;
use tracing::{debug, error};

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod diskutil;
mod policy;

pub use self::policy::{EligibilityPolicy, darwin_whole_disk, drive_letter, posix_parent_device};

#[cfg(all(unix, not(target_os = "macos")))]
mod posix;
#[cfg(all(unix, not(target_os = "macos")))]
use self::posix::query_volumes;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use self::macos::query_volumes;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
use self::windows::query_volumes;

/// The operating-system family the process runs on.
///
/// Everything that differs per OS (eligibility heuristics, format command
/// dialect, privilege elevation) is keyed on this value, which is determined
/// once from the compile target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostPlatform {
    Windows,
    Darwin,
    Posix,
}

impl HostPlatform {
    pub const fn current() -> Self {
        if cfg!(target_os = "windows") {
            HostPlatform::Windows
        } else if cfg!(target_os = "macos") {
            HostPlatform::Darwin
        } else {
            HostPlatform::Posix
        }
    }
}

/// The result of one host query: the policy to apply and the volumes to apply it to.
#[derive(Debug)]
pub(crate) struct HostSnapshot {
    pub policy: EligibilityPolicy,
    pub volumes: Vec<RawVolume>,
}

/// Applies `policy` to every raw volume and maps the accepted ones 1:1 into
/// descriptors, sorted by mount point.
pub fn classify(policy: &EligibilityPolicy, volumes: Vec<RawVolume>) -> Vec<VolumeDescriptor> {
    let mut devices: Vec<VolumeDescriptor> = volumes
        .into_iter()
        .filter(|v| {
            let eligible = policy.is_eligible(v);
            debug!(
                identifier = %v.identifier,
                mount_point = %v.mount_point,
                eligible,
                "classified volume"
            );
            eligible
        })
        .map(VolumeDescriptor::from)
        .collect();

    devices.sort_by(|a, b| {
        a.mount_point
            .cmp(&b.mount_point)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    devices
}

/// Scans the host for removable volumes that may be provisioned.
///
/// This never fails. A host query error is logged and reported as an empty
/// list, so that a partial or ambiguous list is never shown for selection.
/// The system volume is never part of the result.
pub fn list_eligible_devices() -> Vec<VolumeDescriptor> {
    match query_volumes() {
        Ok(snapshot) => classify(&snapshot.policy, snapshot.volumes),
        Err(e) => {
            error!("Device discovery failed: {e}");
            Vec::new()
        }
    }
}

/// Raw, unclassified host query. Exposed for diagnostics.
pub fn list_all_volumes() -> Result<Vec<RawVolume>, DiscoveryError> {
    query_volumes().map(|snapshot| snapshot.volumes)
}
