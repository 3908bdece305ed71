//! Parsing of `diskutil info -plist` output.
use super::darwin_whole_disk;
use serde::Deserialize;

/// The fields of `diskutil info -plist` the Darwin catalog looks at.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DiskInfo {
    #[serde(default)]
    pub device_node: String,
    #[serde(default)]
    pub parent_whole_disk: String,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub removable_media: bool,
    #[serde(default)]
    pub ejectable: bool,
    #[serde(rename = "APFSPhysicalStores", default)]
    pub apfs_physical_stores: Vec<PhysicalStore>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub(crate) struct PhysicalStore {
    #[serde(rename = "APFSPhysicalStore")]
    pub device: String,
}

impl DiskInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self, plist::Error> {
        plist::from_bytes(bytes)
    }

    pub fn removable(&self) -> bool {
        self.removable_media || self.ejectable
    }

    /// The physical whole disk behind the node.
    ///
    /// Volumes inside a synthesized APFS container resolve through their
    /// first physical store (`disk3s1s1` -> `disk0s2` -> `/dev/disk0`).
    pub fn physical_disk(&self) -> Option<String> {
        self.apfs_physical_stores
            .first()
            .and_then(|store| darwin_whole_disk(&store.device))
            .or_else(|| darwin_whole_disk(&self.parent_whole_disk))
            .or_else(|| darwin_whole_disk(&self.device_node))
    }
}
