//! Sequences format and extraction into one provisioning run.
//!
//! A run moves through [`RunState`]s strictly in order:
//!
//! ```text
//! Idle -> Formatting -> Formatted -> Extracting -> Completed
//!              \                          \
//!               -> Failed                  -> Failed
//! ```
//!
//! Nothing destructive happens before the [`ProvisionObserver`] confirmed the
//! run, and extraction is never attempted after a failed format.
use crate::archive;
use crate::command::{FormatExecutor, FormatRequest, SystemExecutor};
use crate::config::ProvisionConfig;
use crate::device::VolumeDescriptor;
use crate::error::{ExtractionError, FormatExecutionError, ProvisionError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, TryLockError};
use tracing::{error, info};

/// The two observable phases of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Format,
    Extract,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Format => f.write_str("Formatting"),
            Phase::Extract => f.write_str("Copying"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Formatting,
    Formatted,
    Extracting,
    Completed,
    Failed,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Formatting)
                | (Formatting, Formatted)
                | (Formatting, Failed)
                | (Formatted, Extracting)
                | (Formatted, Failed)
                | (Extracting, Completed)
                | (Extracting, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// What went wrong, in a form a front-end can show as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDetail {
    pub phase: Phase,
    pub message: String,
    /// Exit code of the failed command, for format failures.
    pub exit_code: Option<i32>,
    /// Captured diagnostic stream of the failed command, for format failures.
    pub diagnostic: Option<String>,
}

impl From<&FormatExecutionError> for ErrorDetail {
    fn from(e: &FormatExecutionError) -> Self {
        Self {
            phase: Phase::Format,
            message: e.to_string(),
            exit_code: e.exit_code,
            diagnostic: Some(e.stderr.clone()),
        }
    }
}

impl From<&ExtractionError> for ErrorDetail {
    fn from(e: &ExtractionError) -> Self {
        Self {
            phase: Phase::Extract,
            message: e.to_string(),
            exit_code: None,
            diagnostic: None,
        }
    }
}

/// Terminal value of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningResult {
    pub formatted: bool,
    pub files_copied: u32,
    pub destination_path: String,
    pub error: Option<ErrorDetail>,
}

impl ProvisioningResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The user did not confirm; nothing was touched.
    Declined,
    Finished(ProvisioningResult),
}

/// The front-end side of a run.
///
/// Calls arrive on the thread executing [`Provisioner::run`].
pub trait ProvisionObserver {
    /// Asked once, before anything destructive happens. Only `true` proceeds.
    fn confirm_destructive_action(&mut self, title: &str, message: &str) -> bool;
    fn report_progress(&mut self, phase: Phase, percentage: u8, text: &str);
    fn report_log(&mut self, message: &str);
    fn report_result(&mut self, result: &ProvisioningResult);
}

/// Writes the payload onto a mounted volume.
pub trait Populator {
    fn populate(
        &self,
        archive: &Path,
        destination: &Path,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(usize, usize),
    ) -> Result<u32, ExtractionError>;
}

/// Extracts a zip payload with [`archive::extract`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ZipPopulator;

impl Populator for ZipPopulator {
    fn populate(
        &self,
        archive: &Path,
        destination: &Path,
        running: &AtomicBool,
        on_progress: &mut dyn FnMut(usize, usize),
    ) -> Result<u32, ExtractionError> {
        archive::extract(archive, destination, running, on_progress)
    }
}

/// State of one run. Owned by [`Provisioner::run`] and dropped when the run ends.
#[derive(Debug)]
pub struct Run {
    state: RunState,
    request: FormatRequest,
    formatted: bool,
    files_copied: u32,
    destination: Option<PathBuf>,
    phase: Option<Phase>,
    percentage: u8,
}

impl Run {
    fn new(request: FormatRequest) -> Self {
        Self {
            state: RunState::Idle,
            request,
            formatted: false,
            files_copied: 0,
            destination: None,
            phase: None,
            percentage: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid run transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Reports progress, keeping it monotonic within a phase and starting
    /// from 0 when a new phase begins.
    fn progress(&mut self, observer: &mut dyn ProvisionObserver, phase: Phase, percentage: u8, text: &str) {
        if self.phase != Some(phase) {
            self.phase = Some(phase);
            self.percentage = 0;
        }
        self.percentage = self.percentage.max(percentage.min(100));
        observer.report_progress(phase, self.percentage, text);
    }

    fn result(&self, error: Option<ErrorDetail>) -> ProvisioningResult {
        ProvisioningResult {
            formatted: self.formatted,
            files_copied: self.files_copied,
            destination_path: self
                .destination
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
            error,
        }
    }
}

fn log(observer: &mut dyn ProvisionObserver, message: &str) {
    info!("{message}");
    observer.report_log(message);
}

fn percentage(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

/// Runs format-then-extract against one device at a time.
pub struct Provisioner<E, P> {
    executor: E,
    populator: P,
    config: ProvisionConfig,
    lock: Mutex<()>,
}

impl Provisioner<SystemExecutor, ZipPopulator> {
    /// A provisioner that formats with the host's own tools.
    pub fn for_current_host(config: ProvisionConfig) -> Self {
        let executor = SystemExecutor::for_current_host(config.format_timeout);
        Self::new(executor, ZipPopulator, config)
    }
}

impl<E: FormatExecutor, P: Populator> Provisioner<E, P> {
    pub fn new(executor: E, populator: P, config: ProvisionConfig) -> Self {
        Self {
            executor,
            populator,
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The confirmation text shown before `device` is formatted.
    pub fn confirmation_message(&self, device: &VolumeDescriptor) -> String {
        let scope = if self.executor.erases_whole_disk() {
            "The ENTIRE DISK containing this volume will be erased, including all of its other partitions."
        } else {
            "The volume will be erased."
        };
        format!(
            "Format {} ({}, {:.1} GB) as FAT32 '{}' and copy {}?\n\n{} ALL DATA WILL BE PERMANENTLY LOST!",
            device.mount_point,
            device.identifier,
            device.size_gb(),
            self.config.volume_label,
            self.config.payload.display(),
            scope
        )
    }

    /// Provisions `device`: confirm, format, mount, extract.
    ///
    /// Blocks until the run reaches a terminal state. `running` is checked
    /// between extracted entries; the format command itself cannot be
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Busy`] if another run is active on this
    /// provisioner, or [`ProvisionError::Request`] if the device or label
    /// cannot form a valid format request. Failures after confirmation are
    /// not errors: they are reported in the [`ProvisioningResult`].
    pub fn run(
        &self,
        device: &VolumeDescriptor,
        observer: &mut dyn ProvisionObserver,
        running: &AtomicBool,
    ) -> Result<RunOutcome, ProvisionError> {
        let _guard = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ProvisionError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let request = FormatRequest::new(device.identifier.clone(), &self.config.volume_label)?;

        let confirmed =
            observer.confirm_destructive_action("Format and copy", &self.confirmation_message(device));
        if !confirmed {
            info!("Provisioning of {} declined", device.identifier);
            return Ok(RunOutcome::Declined);
        }

        let mut run = Run::new(request);
        let result = self.drive(&mut run, observer, running);
        debug_assert!(run.state().is_terminal());
        observer.report_result(&result);
        Ok(RunOutcome::Finished(result))
    }

    fn drive(&self, run: &mut Run, observer: &mut dyn ProvisionObserver, running: &AtomicBool) -> ProvisioningResult {
        run.advance(RunState::Formatting);
        let device = run.request.device_path().to_string();
        run.progress(observer, Phase::Format, 0, &format!("Formatting {device}..."));
        log(observer, &format!("Formatting {device} as FAT32 '{}'", run.request.volume_label()));

        if let Err(e) = self.executor.format(&run.request) {
            return self.fail(run, observer, ErrorDetail::from(&e));
        }
        run.formatted = true;
        run.advance(RunState::Formatted);
        run.progress(observer, Phase::Format, 100, "Format complete");
        log(observer, &format!("Formatted {device}"));

        let destination = match self.executor.mount_point(&run.request) {
            Ok(path) => path,
            Err(e) => return self.fail(run, observer, ErrorDetail::from(&e)),
        };
        run.destination = Some(destination.clone());

        run.advance(RunState::Extracting);
        run.progress(observer, Phase::Extract, 0, "Copying files...");
        log(
            observer,
            &format!(
                "Copying {} to {}",
                self.config.payload.display(),
                destination.display()
            ),
        );

        let extracted = {
            let mut on_progress = |done: usize, total: usize| {
                run.progress(
                    observer,
                    Phase::Extract,
                    percentage(done, total),
                    &format!("Copying files ({done}/{total})"),
                );
            };
            self.populator
                .populate(&self.config.payload, &destination, running, &mut on_progress)
        };

        match extracted {
            Ok(files) => {
                run.files_copied = files;
                run.advance(RunState::Completed);
                run.progress(observer, Phase::Extract, 100, "Done");
                log(observer, &format!("Copied {files} files to {}", destination.display()));
                run.result(None)
            }
            Err(e) => self.fail(run, observer, ErrorDetail::from(&e)),
        }
    }

    fn fail(&self, run: &mut Run, observer: &mut dyn ProvisionObserver, detail: ErrorDetail) -> ProvisioningResult {
        // Leaves the bar of the failed phase where it stopped.
        run.progress(observer, detail.phase, 0, &format!("{} failed", detail.phase));
        run.advance(RunState::Failed);
        error!("{} failed: {}", detail.phase, detail.message);
        observer.report_log(&detail.message);
        run.result(Some(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FORMAT_TIMEOUT;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct MockExecutor {
        fail_format: bool,
        fail_mount: bool,
        whole_disk: bool,
        formats: Cell<usize>,
    }

    impl FormatExecutor for MockExecutor {
        fn format(&self, _request: &FormatRequest) -> Result<(), FormatExecutionError> {
            self.formats.set(self.formats.get() + 1);
            if self.fail_format {
                return Err(FormatExecutionError {
                    command: "mkfs.vfat -F 32 -n SD_CARD /dev/sdb1".into(),
                    exit_code: Some(126),
                    stderr: "Request dismissed".into(),
                });
            }
            Ok(())
        }

        fn mount_point(&self, _request: &FormatRequest) -> Result<PathBuf, FormatExecutionError> {
            if self.fail_mount {
                return Err(FormatExecutionError {
                    command: "udisksctl mount -b /dev/sdb1".into(),
                    exit_code: Some(1),
                    stderr: "Not authorized".into(),
                });
            }
            Ok(PathBuf::from("/media/user/SD_CARD"))
        }

        fn erases_whole_disk(&self) -> bool {
            self.whole_disk
        }
    }

    #[derive(Default)]
    struct MockPopulator {
        fail: bool,
        calls: Cell<usize>,
    }

    impl Populator for MockPopulator {
        fn populate(
            &self,
            _archive: &Path,
            _destination: &Path,
            _running: &AtomicBool,
            on_progress: &mut dyn FnMut(usize, usize),
        ) -> Result<u32, ExtractionError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(ExtractionError::NoValidFiles);
            }
            for done in 1..=4 {
                on_progress(done, 4);
            }
            Ok(3)
        }
    }

    struct Recorder {
        confirm: bool,
        prompts: Vec<String>,
        progress: Vec<(Phase, u8)>,
        logs: Vec<String>,
        results: Vec<ProvisioningResult>,
    }

    impl Recorder {
        fn new(confirm: bool) -> Self {
            Self {
                confirm,
                prompts: Vec::new(),
                progress: Vec::new(),
                logs: Vec::new(),
                results: Vec::new(),
            }
        }
    }

    impl ProvisionObserver for Recorder {
        fn confirm_destructive_action(&mut self, _title: &str, message: &str) -> bool {
            self.prompts.push(message.to_string());
            self.confirm
        }

        fn report_progress(&mut self, phase: Phase, percentage: u8, _text: &str) {
            self.progress.push((phase, percentage));
        }

        fn report_log(&mut self, message: &str) {
            self.logs.push(message.to_string());
        }

        fn report_result(&mut self, result: &ProvisioningResult) {
            self.results.push(result.clone());
        }
    }

    fn device() -> VolumeDescriptor {
        VolumeDescriptor {
            identifier: "/dev/sdb1".into(),
            mount_point: "/media/user/OLD".into(),
            label: "OLD".into(),
            filesystem_type: "vfat".into(),
            total_size: 8 << 30,
            used_size: 1 << 30,
            available_size: 7 << 30,
        }
    }

    fn config() -> ProvisionConfig {
        ProvisionConfig::new("/opt/payload.zip", "SD_CARD", DEFAULT_FORMAT_TIMEOUT).unwrap()
    }

    fn provisioner(
        executor: MockExecutor,
        populator: MockPopulator,
    ) -> Provisioner<MockExecutor, MockPopulator> {
        Provisioner::new(executor, populator, config())
    }

    #[test]
    fn declined_run_never_formats() {
        let p = provisioner(MockExecutor::default(), MockPopulator::default());
        let mut observer = Recorder::new(false);

        let outcome = p.run(&device(), &mut observer, &AtomicBool::new(true)).unwrap();

        assert_eq!(outcome, RunOutcome::Declined);
        assert_eq!(p.executor.formats.get(), 0);
        assert_eq!(p.populator.calls.get(), 0);
        assert!(observer.results.is_empty());
        assert!(observer.progress.is_empty());
    }

    #[test]
    fn successful_run_formats_then_extracts() {
        let p = provisioner(MockExecutor::default(), MockPopulator::default());
        let mut observer = Recorder::new(true);

        let outcome = p.run(&device(), &mut observer, &AtomicBool::new(true)).unwrap();

        let RunOutcome::Finished(result) = outcome else {
            panic!("run was declined");
        };
        assert!(result.is_success());
        assert!(result.formatted);
        assert_eq!(result.files_copied, 3);
        assert_eq!(result.destination_path, "/media/user/SD_CARD");
        assert_eq!(observer.results, vec![result]);
        assert_eq!(p.executor.formats.get(), 1);
        assert_eq!(p.populator.calls.get(), 1);
    }

    #[test]
    fn progress_is_monotonic_per_phase_and_resets() {
        let p = provisioner(MockExecutor::default(), MockPopulator::default());
        let mut observer = Recorder::new(true);
        p.run(&device(), &mut observer, &AtomicBool::new(true)).unwrap();

        let format: Vec<u8> = observer
            .progress
            .iter()
            .filter(|(ph, _)| *ph == Phase::Format)
            .map(|(_, pct)| *pct)
            .collect();
        let extract: Vec<u8> = observer
            .progress
            .iter()
            .filter(|(ph, _)| *ph == Phase::Extract)
            .map(|(_, pct)| *pct)
            .collect();

        assert_eq!(format.first(), Some(&0));
        assert_eq!(format.last(), Some(&100));
        assert_eq!(extract.first(), Some(&0));
        assert_eq!(extract.last(), Some(&100));
        assert!(format.windows(2).all(|w| w[0] <= w[1]));
        assert!(extract.windows(2).all(|w| w[0] <= w[1]));

        // All format observations come before any extract observation.
        let first_extract = observer
            .progress
            .iter()
            .position(|(ph, _)| *ph == Phase::Extract)
            .unwrap();
        assert!(observer.progress[first_extract..]
            .iter()
            .all(|(ph, _)| *ph == Phase::Extract));
    }

    #[test]
    fn format_failure_skips_extraction() {
        let executor = MockExecutor {
            fail_format: true,
            ..Default::default()
        };
        let p = provisioner(executor, MockPopulator::default());
        let mut observer = Recorder::new(true);

        let RunOutcome::Finished(result) =
            p.run(&device(), &mut observer, &AtomicBool::new(true)).unwrap()
        else {
            panic!("run was declined");
        };

        assert!(!result.formatted);
        assert_eq!(result.files_copied, 0);
        assert_eq!(p.populator.calls.get(), 0);
        let detail = result.error.unwrap();
        assert_eq!(detail.phase, Phase::Format);
        assert_eq!(detail.exit_code, Some(126));
        assert_eq!(detail.diagnostic.as_deref(), Some("Request dismissed"));
        assert!(detail.message.contains("Request dismissed"));

        assert_eq!(observer.progress, [(Phase::Format, 0), (Phase::Format, 0)]);
    }

    #[test]
    fn mount_failure_keeps_formatted_flag() {
        let executor = MockExecutor {
            fail_mount: true,
            ..Default::default()
        };
        let p = provisioner(executor, MockPopulator::default());
        let mut observer = Recorder::new(true);

        let RunOutcome::Finished(result) =
            p.run(&device(), &mut observer, &AtomicBool::new(true)).unwrap()
        else {
            panic!("run was declined");
        };

        assert!(result.formatted);
        assert_eq!(p.populator.calls.get(), 0);
        assert_eq!(result.error.unwrap().phase, Phase::Format);
    }

    #[test]
    fn extraction_failure_is_reported_after_format() {
        let populator = MockPopulator {
            fail: true,
            ..Default::default()
        };
        let p = provisioner(MockExecutor::default(), populator);
        let mut observer = Recorder::new(true);

        let RunOutcome::Finished(result) =
            p.run(&device(), &mut observer, &AtomicBool::new(true)).unwrap()
        else {
            panic!("run was declined");
        };

        assert!(result.formatted);
        assert_eq!(result.files_copied, 0);
        let detail = result.error.unwrap();
        assert_eq!(detail.phase, Phase::Extract);
        assert!(detail.message.contains("No valid files"));
        assert!(observer.logs.iter().any(|l| l.contains("No valid files")));
        assert_eq!(observer.progress.last().map(|(ph, _)| *ph), Some(Phase::Extract));
    }

    #[test]
    fn whole_disk_erase_is_announced() {
        let executor = MockExecutor {
            whole_disk: true,
            ..Default::default()
        };
        let p = provisioner(executor, MockPopulator::default());
        let mut observer = Recorder::new(false);
        p.run(&device(), &mut observer, &AtomicBool::new(true)).unwrap();

        assert!(observer.prompts[0].contains("ENTIRE DISK"));
    }

    #[test]
    fn invalid_device_is_rejected_before_confirmation() {
        let p = provisioner(MockExecutor::default(), MockPopulator::default());
        let mut observer = Recorder::new(true);
        let mut bad = device();
        bad.identifier = "/dev/sdb1; reboot".into();

        let err = p.run(&bad, &mut observer, &AtomicBool::new(true)).unwrap_err();

        assert!(matches!(err, ProvisionError::Request(_)));
        assert!(observer.prompts.is_empty());
    }

    struct Reentrant<'a> {
        provisioner: &'a Provisioner<MockExecutor, MockPopulator>,
        nested: RefCell<Option<Result<RunOutcome, ProvisionError>>>,
    }

    impl ProvisionObserver for Reentrant<'_> {
        fn confirm_destructive_action(&mut self, _title: &str, _message: &str) -> bool {
            let mut inner = Recorder::new(true);
            let nested = self
                .provisioner
                .run(&device(), &mut inner, &AtomicBool::new(true));
            *self.nested.borrow_mut() = Some(nested);
            false
        }
        fn report_progress(&mut self, _phase: Phase, _percentage: u8, _text: &str) {}
        fn report_log(&mut self, _message: &str) {}
        fn report_result(&mut self, _result: &ProvisioningResult) {}
    }

    #[test]
    fn concurrent_run_is_refused() {
        let p = provisioner(MockExecutor::default(), MockPopulator::default());
        let mut observer = Reentrant {
            provisioner: &p,
            nested: RefCell::new(None),
        };

        p.run(&device(), &mut observer, &AtomicBool::new(true)).unwrap();

        let nested = observer.nested.into_inner().unwrap();
        assert!(matches!(nested, Err(ProvisionError::Busy)));
        assert_eq!(p.executor.formats.get(), 0);
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use RunState::*;
        assert!(Idle.can_advance_to(Formatting));
        assert!(Formatting.can_advance_to(Failed));
        assert!(Extracting.can_advance_to(Completed));
        assert!(!Idle.can_advance_to(Extracting));
        assert!(!Formatting.can_advance_to(Extracting));
        assert!(!Completed.can_advance_to(Formatting));
        assert!(!Failed.can_advance_to(Formatting));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn percentage_is_bounded() {
        assert_eq!(percentage(0, 4), 0);
        assert_eq!(percentage(2, 4), 50);
        assert_eq!(percentage(5, 4), 100);
        assert_eq!(percentage(0, 0), 100);
    }
}
