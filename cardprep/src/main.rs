use anyhow::{Result, anyhow, bail};
use cardprep_core::archive::{self, Disposition, SkipReason};
use cardprep_core::command::is_elevated;
use cardprep_core::config::{DEFAULT_FORMAT_TIMEOUT, DEFAULT_LABEL, ProvisionConfig};
use cardprep_core::device::VolumeDescriptor;
use cardprep_core::platform;
use cardprep_core::provision::{
    Phase, ProvisionObserver, Provisioner, ProvisioningResult, RunOutcome,
};
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "cardprep")]
#[command(about = "Format an SD card as FAT32 and copy the payload onto it", version)]
struct Cli {
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List removable volumes that can be provisioned
    List {
        /// Show every host volume, including the ones that are filtered out
        #[arg(short, long)]
        all: bool,
    },
    /// Show what the payload archive would write
    Entries {
        /// Payload archive (defaults to the one shipped with cardprep)
        #[arg(short, long, env = "CARDPREP_PAYLOAD")]
        payload: Option<PathBuf>,
    },
    /// Format a volume as FAT32 and copy the payload onto it
    Provision {
        /// Device or mount point to provision; prompts when omitted
        #[arg(short, long)]
        device: Option<String>,

        /// FAT32 volume label (up to 11 characters)
        #[arg(short, long, env = "CARDPREP_LABEL", default_value = DEFAULT_LABEL)]
        label: String,

        /// Payload archive (defaults to the one shipped with cardprep)
        #[arg(short, long, env = "CARDPREP_PAYLOAD")]
        payload: Option<PathBuf>,

        /// Seconds after which a still-running format is reported as slow
        #[arg(long, env = "CARDPREP_FORMAT_TIMEOUT", default_value_t = DEFAULT_FORMAT_TIMEOUT.as_secs())]
        format_timeout: u64,

        /// Do not ask for confirmation before erasing the volume
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Installs the stderr log subscriber. `RUST_LOG` takes precedence over `-v`.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[VolumeDescriptor], prompt: &str) -> Result<VolumeDescriptor> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Finds the eligible device named by `wanted`, either its identifier or its mount point.
fn find_device(devices: &[VolumeDescriptor], wanted: &str) -> Result<VolumeDescriptor> {
    let trim = |s: &str| s.trim_end_matches(['/', '\\']).to_ascii_lowercase();
    devices
        .iter()
        .find(|d| d.identifier == wanted || trim(&d.mount_point) == trim(wanted))
        .cloned()
        .ok_or_else(|| {
            anyhow!("'{wanted}' is not an eligible removable device. Run `cardprep list` to see the candidates.")
        })
}

fn phase_bar(phase: Phase) -> ProgressBar {
    let pb = match phase {
        Phase::Format => {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{prefix:12} [{elapsed_precise}] [{spinner:.blue}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_strings(&[
                        "■     ", " ■    ", "  ■   ", "   ■  ", "    ■ ", "     ■", "    ■ ",
                        "   ■  ", "  ■   ", " ■    ", "■■■■■■",
                    ]),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
        Phase::Extract => {
            let pb = ProgressBar::new(100);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("■ "),
            );
            pb
        }
    };
    pb.set_prefix(phase.to_string());
    pb
}

/// Drives the terminal during a run: the confirmation prompt and one progress bar per phase.
struct TerminalObserver {
    assume_yes: bool,
    bar: Option<(Phase, ProgressBar)>,
}

impl TerminalObserver {
    fn new(assume_yes: bool) -> Self {
        Self {
            assume_yes,
            bar: None,
        }
    }

    fn bar_for(&mut self, phase: Phase) -> &ProgressBar {
        if !matches!(&self.bar, Some((current, _)) if *current == phase) {
            if let Some((_, previous)) = self.bar.take() {
                previous.finish();
            }
        }
        let (_, bar) = self.bar.get_or_insert_with(|| (phase, phase_bar(phase)));
        bar
    }
}

impl ProvisionObserver for TerminalObserver {
    fn confirm_destructive_action(&mut self, title: &str, message: &str) -> bool {
        println!("{} {}", style("WARNING:").red().bold(), style(title).bold());
        println!("{message}");
        println!();

        if self.assume_yes {
            return true;
        }

        match Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Are you sure you want to proceed?")
            .default(false)
            .interact()
        {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!("Confirmation prompt failed: {e}");
                false
            }
        }
    }

    fn report_progress(&mut self, phase: Phase, percentage: u8, text: &str) {
        let bar = self.bar_for(phase);
        bar.set_position(u64::from(percentage));
        bar.set_message(text.to_string());
    }

    fn report_log(&mut self, message: &str) {
        let line = format!("  {}", style(message).dim());
        match &self.bar {
            Some((_, bar)) => bar.suspend(|| println!("{line}")),
            None => println!("{line}"),
        }
    }

    fn report_result(&mut self, result: &ProvisioningResult) {
        if let Some((_, bar)) = self.bar.take() {
            if result.is_success() {
                bar.finish_with_message("Done.");
            } else {
                bar.abandon_with_message("❌ Operation failed.");
            }
        }
    }
}

fn list(all: bool) -> Result<()> {
    if all {
        let volumes = platform::list_all_volumes()?;
        println!("Found {} host volumes:", volumes.len());
        println!(
            "\n  {:<18} {:<12} {:<8} {:<10} {:<9} {}",
            "DEVICE", "LABEL", "FS", "SIZE", "REMOVABLE", "MOUNTED AT"
        );
        println!("  {:-<18} {:-<12} {:-<8} {:-<10} {:-<9} {:-<20}", "", "", "", "", "", "");
        for v in volumes {
            println!(
                "  {:<18} {:<12} {:<8} {:>10} {:<9} {}",
                v.identifier,
                v.label.as_deref().unwrap_or("-"),
                v.filesystem_type,
                HumanBytes(v.total_size).to_string(),
                if v.removable { "yes" } else { "no" },
                v.mount_point
            );
        }
        return Ok(());
    }

    let devices = platform::list_eligible_devices();
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<18} {:<12} {:<8} {:<10} {}",
        "DEVICE", "LABEL", "FS", "SIZE", "MOUNTED AT"
    );
    println!("  {:-<18} {:-<12} {:-<8} {:-<10} {:-<20}", "", "", "", "", "");
    for device in devices {
        println!(
            "  {:<18} {:<12} {:<8} {:>7.1} GB  {}",
            device.identifier,
            device.label,
            device.filesystem_type,
            device.size_gb(),
            device.mount_point
        );
    }
    Ok(())
}

fn entries(payload: PathBuf) -> Result<()> {
    let plan = archive::plan(&payload)?;

    println!("Payload: {}", style(payload.display()).cyan());
    match &plan.common_root_prefix {
        Some(root) => println!("Common root folder: {} (stripped)", style(root).cyan()),
        None => println!("Common root folder: none"),
    }
    println!("\n  {:<10} {:>10}  {}", "ACTION", "SIZE", "PATH");
    println!("  {:-<10} {:->10}  {:-<30}", "", "", "");

    for entry in &plan.entries {
        let (action, target) = match plan.disposition(&entry.relative_path, entry.is_directory) {
            Disposition::File(path) => ("copy", path.display().to_string()),
            Disposition::Directory(path) => ("mkdir", path.display().to_string()),
            Disposition::Skip(SkipReason::Root) => ("root", entry.relative_path.clone()),
            Disposition::Skip(SkipReason::Metadata) => ("metadata", entry.relative_path.clone()),
            Disposition::Skip(SkipReason::Hidden) => ("hidden", entry.relative_path.clone()),
            Disposition::Skip(SkipReason::Unsafe) => ("unsafe", entry.relative_path.clone()),
        };
        let size = if entry.is_directory {
            String::new()
        } else {
            HumanBytes(entry.uncompressed_size).to_string()
        };
        println!("  {action:<10} {size:>10}  {target}");
    }

    println!(
        "\n{} files, {} will be copied.",
        plan.file_count(),
        HumanBytes(plan.total_bytes())
    );
    Ok(())
}

fn provision(
    device: Option<String>,
    config: ProvisionConfig,
    assume_yes: bool,
    running: &AtomicBool,
) -> Result<()> {
    // Reject a bad payload before anything is erased.
    let plan = archive::plan(&config.payload)?;
    if plan.file_count() == 0 {
        bail!("{} contains no files to copy.", config.payload.display());
    }

    let devices = platform::list_eligible_devices();
    let device = match device {
        Some(wanted) => find_device(&devices, &wanted)?,
        None => select_device(&devices, "Select the volume to PROVISION")?,
    };
    info!(device = %device.identifier, mount_point = %device.mount_point, "selected device");

    println!("  Device:  {}", style(&device.identifier).cyan());
    println!("  Payload: {}", style(config.payload.display()).cyan());
    println!(
        "  Copies:  {} files, {}",
        plan.file_count(),
        HumanBytes(plan.total_bytes())
    );
    println!("  Label:   {}", style(&config.volume_label).cyan());
    println!();

    if !is_elevated() {
        println!(
            "{} Formatting needs administrator rights; you may be asked to authenticate.",
            style("NOTE:").yellow().bold()
        );
        println!();
    }

    let provisioner = Provisioner::for_current_host(config);
    let mut observer = TerminalObserver::new(assume_yes);

    match provisioner.run(&device, &mut observer, running)? {
        RunOutcome::Declined => {
            println!("Provisioning cancelled.");
            Ok(())
        }
        RunOutcome::Finished(result) => match result.error {
            None => {
                println!(
                    "\n✨ Successfully provisioned {} with {} files at {}.",
                    style(&device.identifier).cyan(),
                    result.files_copied,
                    style(&result.destination_path).cyan()
                );
                Ok(())
            }
            Some(detail) => {
                if result.formatted {
                    println!(
                        "{} The volume was formatted; it no longer holds its previous contents.",
                        style("NOTE:").yellow().bold()
                    );
                }
                Err(anyhow!("{} failed: {}", detail.phase, detail.message))
            }
        },
    }
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Cleared by Ctrl+C; extraction stops before the next entry.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List { all } => list(all),
        Commands::Entries { payload } => {
            entries(payload.unwrap_or_else(ProvisionConfig::default_payload))
        }
        Commands::Provision {
            device,
            label,
            payload,
            format_timeout,
            yes,
        } => {
            let config = ProvisionConfig::new(
                payload.unwrap_or_else(ProvisionConfig::default_payload),
                &label,
                Duration::from_secs(format_timeout),
            )?;
            provision(device, config, yes, &running)
        }
    }
}
