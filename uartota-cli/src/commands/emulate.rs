//! Device emulator: runs the OTA receiver on a serial port.
//!
//! Images land in [`MemoryPartitions`]. Every restart or rollback boots the
//! emulated device again with a fresh receiver, the way real hardware would.

use {
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::{debug, info, warn},
    std::{fs, path::Path},
    uartota::{
        AppImageBuilder, BootVerdict, DriverConfig, ErrorCode, MemoryPartitions, OtaReceiver,
        PartitionManager, PollOutcome, ReceiverConfig, SessionDriver, State, TransferObserver,
        confirm_boot,
    },
};

use {super::Target, crate::use_fancy_output};

/// Project name stamped into the emulated factory image.
const EMULATOR_PROJECT: &str = "uartota-emulator";

/// Mirrors receiver events onto a progress bar.
struct ProgressObserver {
    pb: ProgressBar,
}

impl TransferObserver for ProgressObserver {
    fn on_progress(&mut self, received: u32, total: u32, percent: u8) {
        self.pb
            .set_length(u64::from(total));
        self.pb
            .set_position(u64::from(received));
        debug!("Received {received}/{total} bytes ({percent}%)");
    }

    fn on_complete(&mut self, success: bool, code: ErrorCode) {
        if success {
            self.pb
                .finish_with_message("verified");
        } else {
            self.pb
                .abandon_with_message(format!("failed: {code}"));
        }
    }

    fn on_state_change(&mut self, old: State, new: State) {
        debug!("State {old} -> {new}");
        if new == State::Receiving {
            self.pb
                .reset();
        }
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Backend holding a factory image that reports `running_version`.
pub(crate) fn factory_backend(running_version: &str) -> MemoryPartitions {
    let mut backend = MemoryPartitions::default();
    backend.install(
        "factory",
        AppImageBuilder::new(running_version, EMULATOR_PROJECT).build(),
    );
    backend
}

/// Persist the image the emulated device just booted into.
pub(crate) fn save_running_image(backend: &MemoryPartitions, output: &Path) -> Result<()> {
    fs::write(output, backend.running_image())
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        "Saved {} bytes to {}",
        backend
            .running_image()
            .len(),
        output.display()
    );
    Ok(())
}

/// First-boot diagnostics of the image the device just restarted into.
///
/// A failing self-test rolls the emulated device back to the previous image.
pub(crate) fn verify_first_boot(
    backend: &mut MemoryPartitions,
    self_test_passes: bool,
) -> Result<BootVerdict> {
    let verdict =
        confirm_boot(backend, || self_test_passes).context("Boot confirmation failed")?;
    if verdict == BootVerdict::RolledBack {
        warn!(
            "Self-test failed, rolled back to v{}",
            backend
                .running_version()
                .unwrap_or_default()
        );
    }
    Ok(verdict)
}

/// Emulate command implementation.
pub(crate) fn cmd_emulate(
    target: &Target,
    receiver_config: ReceiverConfig,
    driver_config: DriverConfig,
    running_version: &str,
    output: Option<&Path>,
    self_test_passes: bool,
    quiet: bool,
) -> Result<()> {
    let mut port = target.open()?;
    if !quiet {
        eprintln!(
            "{} Emulating device v{running_version} on {} at {} baud (Ctrl-C to stop)",
            style("🔌").cyan(),
            target.port,
            target.baud
        );
    }

    let mut backend = factory_backend(running_version);
    loop {
        let pb = progress_bar(quiet);
        let receiver = OtaReceiver::with_config(backend, receiver_config.clone())
            .with_observer(ProgressObserver { pb: pb.clone() });
        let mut driver = SessionDriver::with_config(port, receiver, driver_config.clone());

        let outcome = driver
            .run()
            .context("Emulated device failed")?;
        pb.finish_and_clear();

        let (returned_port, receiver) = driver.into_parts();
        port = returned_port;
        backend = receiver.into_backend();

        match outcome {
            PollOutcome::Restarted => {
                let version = backend
                    .running_version()
                    .unwrap_or_default();
                if !quiet {
                    eprintln!(
                        "{} Update complete, booted v{version}",
                        style("🎉").green().bold()
                    );
                }
                if let Some(output) = output {
                    save_running_image(&backend, output)?;
                }
                if verify_first_boot(&mut backend, self_test_passes)? == BootVerdict::RolledBack
                    && !quiet
                {
                    eprintln!(
                        "{} Self-test failed, rolled back to v{}",
                        style("⚠").yellow(),
                        backend
                            .running_version()
                            .unwrap_or_default()
                    );
                }
            },
            PollOutcome::RolledBack => {
                let version = backend
                    .running_version()
                    .unwrap_or_default();
                if !quiet {
                    eprintln!(
                        "{} Rolled back, booted v{version}",
                        style("🔄").cyan()
                    );
                }
            },
            PollOutcome::Interrupted => {
                if !quiet {
                    eprintln!("{} Emulator stopped", style("✓").green());
                }
                return Ok(());
            },
            PollOutcome::Idle | PollOutcome::Handled(_) => {},
        }
    }
}
