//! The core, UI-agnostic library for the `cardprep` provisioning utility.
//!
//! `cardprep-core` turns a removable volume (SD card, USB drive) into a
//! freshly formatted FAT32 volume carrying the contents of a payload archive.
//! It is designed to be used by any front-end, whether it's a command-line
//! interface (like `cardprep`) or a graphical user interface.
//!
//! The library is structured into several key modules:
//! - [`device`]: The [`device::VolumeDescriptor`] snapshot of a host volume.
//! - [`platform`]: Platform-specific discovery and classification of
//!   removable volumes.
//! - [`command`]: The per-OS privileged format command.
//! - [`archive`]: Two-pass extraction of the payload archive.
//! - [`provision`]: The orchestrator sequencing format and extraction.
//! - [`config`]: Payload location and volume label.
//!
//! The primary entry point is [`provision::Provisioner::run`]. It reports
//! progress through the [`provision::ProvisionObserver`] trait, allowing the
//! calling application to display progress in any way it chooses.
//!
//! ## Example: Provisioning the First Removable Volume
//!
//! ```rust,no_run
//! use cardprep_core::config::{DEFAULT_FORMAT_TIMEOUT, ProvisionConfig};
//! use cardprep_core::platform;
//! use cardprep_core::provision::{
//!     Phase, ProvisionObserver, Provisioner, ProvisioningResult, RunOutcome,
//! };
//! use std::sync::atomic::AtomicBool;
//!
//! struct Stdout;
//!
//! impl ProvisionObserver for Stdout {
//!     fn confirm_destructive_action(&mut self, title: &str, message: &str) -> bool {
//!         println!("{title}: {message}");
//!         true
//!     }
//!     fn report_progress(&mut self, phase: Phase, percentage: u8, text: &str) {
//!         println!("{phase} {percentage}% {text}");
//!     }
//!     fn report_log(&mut self, message: &str) {
//!         println!("{message}");
//!     }
//!     fn report_result(&mut self, result: &ProvisioningResult) {
//!         println!("{result:?}");
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let devices = platform::list_eligible_devices();
//!     let device = devices.first().expect("No removable devices found.");
//!
//!     let config = ProvisionConfig::new("payload.zip", "SD_CARD", DEFAULT_FORMAT_TIMEOUT)?;
//!     let provisioner = Provisioner::for_current_host(config);
//!
//!     // A shared flag to allow for graceful cancellation between entries.
//!     let running = AtomicBool::new(true);
//!
//!     match provisioner.run(device, &mut Stdout, &running)? {
//!         RunOutcome::Declined => println!("Cancelled."),
//!         RunOutcome::Finished(result) => println!("Copied {} files.", result.files_copied),
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod platform;
pub mod provision;
