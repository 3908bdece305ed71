//! Fixed configuration of a provisioning run: which payload, which label.
use crate::command::validate_label;
use crate::error::RequestError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Label given to freshly formatted volumes unless configured otherwise.
pub const DEFAULT_LABEL: &str = "SD_CARD";

/// Location of the payload archive relative to the executable's directory.
pub const DEFAULT_PAYLOAD: &str = "assets/packages/payload.zip";

/// How long a format command may run before a warning is logged.
pub const DEFAULT_FORMAT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// The payload archive written onto every provisioned volume.
    pub payload: PathBuf,
    /// FAT32 label, already validated and upper-cased.
    pub volume_label: String,
    /// Advisory only: the format command is never interrupted.
    pub format_timeout: Duration,
}

impl ProvisionConfig {
    /// Builds a config, validating `volume_label` against the FAT32 label rules.
    pub fn new(
        payload: impl Into<PathBuf>,
        volume_label: &str,
        format_timeout: Duration,
    ) -> Result<Self, RequestError> {
        Ok(Self {
            payload: payload.into(),
            volume_label: validate_label(volume_label)?,
            format_timeout,
        })
    }

    /// The payload shipped next to the running executable.
    pub fn default_payload() -> PathBuf {
        let base = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join(DEFAULT_PAYLOAD)
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            payload: Self::default_payload(),
            volume_label: DEFAULT_LABEL.to_string(),
            format_timeout: DEFAULT_FORMAT_TIMEOUT,
        }
    }
}
