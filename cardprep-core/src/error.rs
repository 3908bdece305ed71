//! Error types for every stage of a provisioning run.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to query the host for its volumes.
///
/// Never reaches callers of [`crate::platform::list_eligible_devices`]: the
/// catalog logs it and reports an empty device list instead.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Could not determine the system volume")]
    SystemVolumeUnknown,
    #[error("Failed to query volume {mount_point}: {source}")]
    Query {
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A [`crate::command::FormatRequest`] that cannot be turned into a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Volume label must not be empty")]
    EmptyLabel,
    #[error("Volume label '{0}' is longer than 11 characters")]
    LabelTooLong(String),
    #[error("Volume label '{label}' contains unsupported character '{found}'")]
    InvalidLabelChar { label: String, found: char },
    #[error("Device path must not be empty")]
    EmptyDevicePath,
    #[error("Device path '{0}' contains unsupported characters")]
    InvalidDevicePath(String),
}

/// Failure of the privileged format command or one of its helpers.
///
/// `stderr` holds the diagnostic stream of the command verbatim so that it
/// can be shown to the user as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("`{command}` failed{}: {stderr}", .exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
pub struct FormatExecutionError {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl FormatExecutionError {
    pub(crate) fn spawn(command: String, err: io::Error) -> Self {
        Self {
            command,
            exit_code: None,
            stderr: err.to_string(),
        }
    }
}

/// Failure while reading the payload archive or writing it to the volume.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Archive not found: {0}")]
    ArchiveNotFound(PathBuf),
    #[error("Failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("Failed to read archive entry {index}: {source}")]
    Entry {
        index: usize,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No valid files found in the archive")]
    NoValidFiles,
    #[error("Extraction cancelled by user")]
    Cancelled,
}

/// Errors that prevent a provisioning run from starting at all.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Another provisioning run is already active")]
    Busy,
    #[error(transparent)]
    Request(#[from] RequestError),
}
