mod common;

use cardprep_core::command::{FormatExecutor, FormatRequest};
use cardprep_core::config::{DEFAULT_FORMAT_TIMEOUT, ProvisionConfig};
use cardprep_core::device::VolumeDescriptor;
use cardprep_core::error::FormatExecutionError;
use cardprep_core::provision::{
    Phase, ProvisionObserver, Provisioner, ProvisioningResult, RunOutcome, ZipPopulator,
};
use common::{files_under, write_zip};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tempfile::tempdir;

/// Pretends to format by recording the request, then "mounts" at a local directory.
struct DirectoryExecutor {
    mount: PathBuf,
    fail: bool,
    requests: RefCell<Vec<FormatRequest>>,
}

impl DirectoryExecutor {
    fn new(mount: &Path) -> Self {
        Self {
            mount: mount.to_path_buf(),
            fail: false,
            requests: RefCell::new(Vec::new()),
        }
    }
}

impl FormatExecutor for DirectoryExecutor {
    fn format(&self, request: &FormatRequest) -> Result<(), FormatExecutionError> {
        self.requests.borrow_mut().push(request.clone());
        if self.fail {
            return Err(FormatExecutionError {
                command: format!("mkfs.vfat -F 32 -n {} {}", request.volume_label(), request.device_path()),
                exit_code: Some(1),
                stderr: "mkfs.fat: unable to open /dev/sdz1: Device or resource busy".into(),
            });
        }
        Ok(())
    }

    fn mount_point(&self, _request: &FormatRequest) -> Result<PathBuf, FormatExecutionError> {
        std::fs::create_dir_all(&self.mount).map_err(|e| FormatExecutionError {
            command: "mount".into(),
            exit_code: None,
            stderr: e.to_string(),
        })?;
        Ok(self.mount.clone())
    }
}

#[derive(Default)]
struct Collect {
    progress: Vec<(Phase, u8)>,
    results: Vec<ProvisioningResult>,
}

impl ProvisionObserver for Collect {
    fn confirm_destructive_action(&mut self, _title: &str, _message: &str) -> bool {
        true
    }

    fn report_progress(&mut self, phase: Phase, percentage: u8, _text: &str) {
        self.progress.push((phase, percentage));
    }

    fn report_log(&mut self, _message: &str) {}

    fn report_result(&mut self, result: &ProvisioningResult) {
        self.results.push(result.clone());
    }
}

fn card() -> VolumeDescriptor {
    VolumeDescriptor {
        identifier: "/dev/sdz1".into(),
        mount_point: "/media/tester/OLD".into(),
        label: "OLD".into(),
        filesystem_type: "vfat".into(),
        total_size: 4 << 30,
        used_size: 0,
        available_size: 4 << 30,
    }
}

#[test]
fn payload_lands_on_the_formatted_volume() {
    let dir = tempdir().unwrap();
    let payload = write_zip(
        &dir.path().join("payload.zip"),
        &[
            ("release/", b""),
            ("release/boot/config.txt", b"arm_64bit=1"),
            ("release/firmware.bin", &[0xAA; 128]),
            ("release/.gitkeep", b""),
            ("__MACOSX/release/._firmware.bin", b"fork"),
        ],
    );
    let mount = dir.path().join("mnt");
    let config = ProvisionConfig::new(&payload, "pi_boot", DEFAULT_FORMAT_TIMEOUT).unwrap();
    let provisioner = Provisioner::new(DirectoryExecutor::new(&mount), ZipPopulator, config);
    let mut observer = Collect::default();

    let RunOutcome::Finished(result) = provisioner
        .run(&card(), &mut observer, &AtomicBool::new(true))
        .unwrap()
    else {
        panic!("run was declined");
    };

    assert!(result.is_success(), "{:?}", result.error);
    assert!(result.formatted);
    assert_eq!(result.files_copied, 2);
    assert_eq!(result.destination_path, mount.display().to_string());
    assert_eq!(
        files_under(&mount).into_iter().collect::<Vec<_>>(),
        ["boot/config.txt", "firmware.bin"]
    );

    let requests = provisioner.executor().requests.borrow();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].device_path(), "/dev/sdz1");
    assert_eq!(requests[0].volume_label(), "PI_BOOT");
    assert_eq!(observer.progress.last(), Some(&(Phase::Extract, 100)));
}

#[test]
fn failed_format_leaves_destination_untouched() {
    let dir = tempdir().unwrap();
    let payload = write_zip(&dir.path().join("payload.zip"), &[("a.txt", b"a")]);
    let mount = dir.path().join("mnt");
    let mut executor = DirectoryExecutor::new(&mount);
    executor.fail = true;
    let config = ProvisionConfig::new(&payload, "SD_CARD", DEFAULT_FORMAT_TIMEOUT).unwrap();
    let provisioner = Provisioner::new(executor, ZipPopulator, config);
    let mut observer = Collect::default();

    let RunOutcome::Finished(result) = provisioner
        .run(&card(), &mut observer, &AtomicBool::new(true))
        .unwrap()
    else {
        panic!("run was declined");
    };

    assert!(!result.formatted);
    assert_eq!(result.files_copied, 0);
    assert!(result.destination_path.is_empty());
    let detail = result.error.as_ref().unwrap();
    assert_eq!(detail.phase, Phase::Format);
    assert!(detail.message.contains("Device or resource busy"));
    assert!(!mount.exists());
    assert!(observer.progress.iter().all(|(phase, _)| *phase == Phase::Format));
    assert_eq!(observer.results, vec![result]);
}
