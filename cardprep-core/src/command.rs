//! Builds and runs the privileged command that formats a volume to FAT32.
//!
//! Each OS family has its own command dialect, modelled by [`CommandBuilder`]
//! and chosen once from the [`HostPlatform`]. A format attempt always runs
//! exactly one command. There is no fallback to another dialect and no retry:
//! any failure is reported to the caller as a [`FormatExecutionError`].
//!
//! | Host    | Command                                         | Scope            |
//! |---------|-------------------------------------------------|------------------|
//! | Windows | `format E: /FS:FAT32 /V:LABEL /Y`               | one volume       |
//! | Darwin  | `diskutil eraseDisk FAT32 LABEL MBRFormat DISK` | **whole disk**   |
//! | POSIX   | `mkfs.vfat -F 32 -n LABEL DEVICE`               | one volume       |
//!
//! On Darwin the selected partition is translated to its parent disk and the
//! *entire disk* is erased to a single FAT32 volume, including every other
//! partition on it. Front-ends must say so when asking for confirmation; see
//! [`CommandBuilder::is_whole_disk`].

use crate::device::RawVolume;
use crate::error::{FormatExecutionError, RequestError};
use crate::platform::{self, HostPlatform, darwin_whole_disk, drive_letter};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

mod process;

/// FAT32 volume labels are at most 11 bytes.
pub const MAX_LABEL_LEN: usize = 11;

/// Time given to the OS to remount a freshly formatted volume.
const REMOUNT_WAIT: Duration = Duration::from_secs(15);
const REMOUNT_POLL: Duration = Duration::from_millis(250);

/// Normalises a label to upper case and checks it against the FAT32 label rules.
///
/// Only ASCII letters, digits, `_` and `-` are accepted. Labels end up inside
/// command lines, so anything else is rejected rather than escaped.
pub fn validate_label(label: &str) -> Result<String, RequestError> {
    let label = label.trim().to_ascii_uppercase();
    if label.is_empty() {
        return Err(RequestError::EmptyLabel);
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(RequestError::LabelTooLong(label));
    }
    if let Some(found) = label
        .chars()
        .find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
    {
        return Err(RequestError::InvalidLabelChar { label, found });
    }
    Ok(label)
}

fn validate_device_path(path: &str) -> Result<(), RequestError> {
    if path.is_empty() {
        return Err(RequestError::EmptyDevicePath);
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '/' | '\\' | ':' | '.' | '_' | '-');
    if !path.chars().all(allowed) {
        return Err(RequestError::InvalidDevicePath(path.to_string()));
    }
    Ok(())
}

/// What to format and how to name it. Built once per provisioning run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatRequest {
    device_path: String,
    volume_label: String,
}

impl FormatRequest {
    pub fn new(device_path: impl Into<String>, volume_label: &str) -> Result<Self, RequestError> {
        let device_path = device_path.into();
        validate_device_path(&device_path)?;
        Ok(Self {
            device_path,
            volume_label: validate_label(volume_label)?,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn volume_label(&self) -> &str {
        &self.volume_label
    }
}

/// A program and its arguments, run without an intermediate shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Renders the invocation as a single command line, for logs and error messages.
    pub fn command_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// The per-OS command dialect for formatting a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBuilder {
    Windows,
    Darwin,
    Posix,
}

impl CommandBuilder {
    pub fn for_host(platform: HostPlatform) -> Self {
        match platform {
            HostPlatform::Windows => CommandBuilder::Windows,
            HostPlatform::Darwin => CommandBuilder::Darwin,
            HostPlatform::Posix => CommandBuilder::Posix,
        }
    }

    /// Whether formatting destroys the whole physical disk rather than one volume.
    pub fn is_whole_disk(&self) -> bool {
        matches!(self, CommandBuilder::Darwin)
    }

    /// The device the format command is pointed at.
    ///
    /// Darwin partitions are translated to their whole disk; Windows mounts
    /// are reduced to a bare drive letter.
    pub fn format_target(&self, request: &FormatRequest) -> String {
        let path = request.device_path();
        match self {
            CommandBuilder::Windows => {
                drive_letter(path).unwrap_or_else(|| path.to_string())
            }
            CommandBuilder::Darwin => darwin_whole_disk(path).unwrap_or_else(|| path.to_string()),
            CommandBuilder::Posix => path.to_string(),
        }
    }

    /// The one command that formats the target, without elevation.
    pub fn format_command(&self, request: &FormatRequest) -> Invocation {
        let target = self.format_target(request);
        let label = request.volume_label();
        match self {
            // Full format: no `/Q`. `/Y` answers the confirmation prompt.
            CommandBuilder::Windows => Invocation::new(
                "format.com",
                [target, "/FS:FAT32".into(), format!("/V:{label}"), "/Y".into()],
            ),
            CommandBuilder::Darwin => Invocation::new(
                "diskutil",
                ["eraseDisk", "FAT32", label, "MBRFormat", target.as_str()],
            ),
            CommandBuilder::Posix => Invocation::new(
                "mkfs.vfat",
                ["-F", "32", "-n", label, target.as_str()],
            ),
        }
    }

    /// Wraps `invocation` in the OS privilege-elevation mechanism.
    ///
    /// A process started with `RunAs` on Windows does not inherit our pipes,
    /// so there the command runs under `cmd.exe` with both of its streams
    /// redirected into `capture`. Other hosts ignore `capture`.
    pub fn elevate(&self, invocation: Invocation, capture: &Path) -> Invocation {
        match self {
            CommandBuilder::Windows => {
                let line = format!(
                    "/c {} > \"{}\" 2>&1",
                    invocation.command_line(),
                    capture.display()
                );
                let script = format!(
                    "$p = Start-Process -FilePath 'cmd.exe' -ArgumentList '{}' -Verb RunAs -Wait -PassThru -WindowStyle Hidden; exit $p.ExitCode",
                    line.replace('\'', "''")
                );
                Invocation::new(
                    "powershell.exe",
                    ["-NoProfile", "-NonInteractive", "-Command", script.as_str()],
                )
            }
            CommandBuilder::Darwin => {
                let line = invocation.command_line().replace('\\', "\\\\").replace('"', "\\\"");
                let script = format!("do shell script \"{line}\" with administrator privileges");
                Invocation::new("osascript", ["-e", script.as_str()])
            }
            CommandBuilder::Posix => {
                let mut args = Vec::with_capacity(invocation.args.len() + 1);
                args.push(invocation.program);
                args.extend(invocation.args);
                Invocation {
                    program: "pkexec".into(),
                    args,
                }
            }
        }
    }

    /// Command releasing the volume before it is formatted, where the OS requires it.
    pub fn release_command(&self, request: &FormatRequest) -> Option<Invocation> {
        match self {
            CommandBuilder::Posix => Some(Invocation::new(
                "udisksctl",
                ["unmount", "--no-user-interaction", "-b", request.device_path()],
            )),
            _ => None,
        }
    }

    /// Command mounting the new volume, where the OS does not do it on its own.
    pub fn mount_command(&self, request: &FormatRequest) -> Option<Invocation> {
        match self {
            CommandBuilder::Posix => Some(Invocation::new(
                "udisksctl",
                ["mount", "--no-user-interaction", "-b", request.device_path()],
            )),
            _ => None,
        }
    }

    /// Where the new volume reappears at a path known in advance.
    ///
    /// Only Windows keeps the drive letter. Darwin picks a free
    /// `/Volumes/<LABEL>` name, which may carry a suffix such as
    /// `SD_CARD 1`, so the volume has to be found by its disk instead; see
    /// [`find_disk_mount`].
    pub fn expected_mount_point(&self, request: &FormatRequest) -> Option<PathBuf> {
        match self {
            CommandBuilder::Windows => Some(PathBuf::from(format!("{}\\", self.format_target(request)))),
            CommandBuilder::Darwin | CommandBuilder::Posix => None,
        }
    }
}

/// The `/Volumes` mount of a volume on the Darwin whole disk `whole_disk`.
pub(crate) fn find_disk_mount(volumes: &[RawVolume], whole_disk: &str) -> Option<PathBuf> {
    volumes
        .iter()
        .filter(|v| v.mount_point.starts_with("/Volumes/"))
        .find(|v| darwin_whole_disk(&v.identifier).as_deref() == Some(whole_disk))
        .map(|v| PathBuf::from(&v.mount_point))
}

/// Reads and removes the file an elevated Windows command wrote its output to.
fn take_capture(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    if let Err(e) = fs::remove_file(path) {
        debug!("could not remove {}: {e}", path.display());
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Polls `locate` until it finds the remounted volume or [`REMOUNT_WAIT`] passes.
fn wait_for_mount(
    what: &str,
    mut locate: impl FnMut() -> Option<PathBuf>,
) -> Result<PathBuf, FormatExecutionError> {
    let start = Instant::now();
    loop {
        if let Some(path) = locate() {
            return Ok(path);
        }
        if start.elapsed() > REMOUNT_WAIT {
            return Err(FormatExecutionError {
                command: format!("wait for {what}"),
                exit_code: None,
                stderr: format!("formatted volume on {what} did not appear within {REMOUNT_WAIT:?}"),
            });
        }
        thread::sleep(REMOUNT_POLL);
    }
}

/// Extracts the mount point from `udisksctl mount` output, which reads
/// `Mounted /dev/sdb1 at /media/user/SD_CARD` (newer) or ends with a `.` (older).
/// Also understands the `AlreadyMounted` error, which quotes the path as `` `path' ``.
pub(crate) fn parse_udisks_mount_point(text: &str) -> Option<PathBuf> {
    if let Some(start) = text.find("already mounted at `") {
        let rest = &text[start + "already mounted at `".len()..];
        let end = rest.find('\'')?;
        return Some(PathBuf::from(&rest[..end]));
    }

    let line = text.lines().find(|l| l.trim_start().starts_with("Mounted "))?;
    let (_, path) = line.split_once(" at ")?;
    let path = path.trim();
    let path = path.strip_suffix('.').unwrap_or(path);
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Whether the process already runs with administrator/root privileges.
pub fn is_elevated() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(windows)]
    {
        // SAFETY: IsUserAnAdmin takes no arguments and has no preconditions.
        unsafe { windows_sys::Win32::UI::Shell::IsUserAnAdmin() != 0 }
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// The side-effecting half of formatting: anything that can run a [`FormatRequest`].
pub trait FormatExecutor {
    /// Formats the requested volume. Destructive and not interruptible.
    fn format(&self, request: &FormatRequest) -> Result<(), FormatExecutionError>;

    /// Returns where the freshly formatted volume is mounted, mounting it if needed.
    fn mount_point(&self, request: &FormatRequest) -> Result<PathBuf, FormatExecutionError>;

    /// Whether [`FormatExecutor::format`] erases the whole disk behind the request.
    fn erases_whole_disk(&self) -> bool {
        false
    }
}

/// Runs format commands on the real host.
#[derive(Clone, Debug)]
pub struct SystemExecutor {
    builder: CommandBuilder,
    timeout: Duration,
    elevated: bool,
}

impl SystemExecutor {
    /// `timeout` is advisory, see [`crate::config::ProvisionConfig::format_timeout`].
    pub fn new(builder: CommandBuilder, timeout: Duration) -> Self {
        Self {
            builder,
            timeout,
            elevated: is_elevated(),
        }
    }

    /// An executor for the host the process runs on.
    pub fn for_current_host(timeout: Duration) -> Self {
        Self::new(CommandBuilder::for_host(HostPlatform::current()), timeout)
    }

    fn release(&self, request: &FormatRequest) {
        let Some(invocation) = self.builder.release_command(request) else {
            return;
        };
        match process::run(&invocation, None) {
            Ok(out) if out.success() => debug!("released {}", request.device_path()),
            Ok(out) if out.diagnostic().contains("NotMounted") => {
                debug!("{} was not mounted", request.device_path())
            }
            // The format command reports the definitive error if the device stays busy.
            Ok(out) => warn!("`{invocation}` failed: {}", out.diagnostic()),
            Err(e) => warn!("Could not run `{invocation}`: {e}"),
        }
    }
}

impl FormatExecutor for SystemExecutor {
    fn format(&self, request: &FormatRequest) -> Result<(), FormatExecutionError> {
        self.release(request);

        let capture = std::env::temp_dir().join(format!("cardprep-format-{}.log", std::process::id()));
        fs::remove_file(&capture).ok();

        let mut invocation = self.builder.format_command(request);
        if !self.elevated {
            invocation = self.builder.elevate(invocation, &capture);
        }
        let command = invocation.command_line();
        info!(%command, "running format command");

        let mut out = process::run(&invocation, Some(self.timeout))
            .map_err(|e| FormatExecutionError::spawn(command.clone(), e))?;
        if let Some(captured) = take_capture(&capture) {
            out.stdout.push_str(&captured);
        }
        if !out.success() {
            return Err(FormatExecutionError {
                command,
                exit_code: out.status,
                stderr: out.diagnostic(),
            });
        }

        debug!("format output: {}", out.stdout.trim());
        Ok(())
    }

    fn mount_point(&self, request: &FormatRequest) -> Result<PathBuf, FormatExecutionError> {
        if let Some(invocation) = self.builder.mount_command(request) {
            let command = invocation.command_line();
            let out = process::run(&invocation, None)
                .map_err(|e| FormatExecutionError::spawn(command.clone(), e))?;
            let text = format!("{}\n{}", out.stdout, out.stderr);
            return parse_udisks_mount_point(&text).ok_or_else(|| FormatExecutionError {
                command,
                exit_code: out.status,
                stderr: out.diagnostic(),
            });
        }

        if let Some(expected) = self.builder.expected_mount_point(request) {
            let what = expected.display().to_string();
            return wait_for_mount(&what, || expected.exists().then(|| expected.clone()));
        }

        let disk = self.builder.format_target(request);
        wait_for_mount(&disk, || match platform::list_all_volumes() {
            Ok(volumes) => find_disk_mount(&volumes, &disk),
            Err(e) => {
                debug!("volume lookup failed: {e}");
                None
            }
        })
    }

    fn erases_whole_disk(&self) -> bool {
        self.builder.is_whole_disk()
    }
}
