//! uartota CLI - Command-line tool for firmware updates over UART.
//!
//! ## Features
//!
//! - Push application images to a device running the OTA receiver
//! - Query, abort and roll back device-side transfers
//! - Emulate a device on a serial port for host-side testing
//! - Inspect image descriptors
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::{debug, warn},
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
    thiserror::Error,
};

mod commands;
mod config;

use {
    commands::{Target, completions, device, emulate, info, transfer},
    config::Config,
};

/// Default baud rate when neither the command line nor the config sets one.
pub(crate) const DEFAULT_BAUD: u32 = 115_200;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Invalid invocation that clap cannot catch (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled the operation (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// uartota - Firmware updates over a UART link.
///
/// Environment variables:
///   UARTOTA_PORT    - Default serial port
///   UARTOTA_BAUD    - Default baud rate (default: 115200)
///   RUST_LOG        - Log filter, overrides -v/-q
#[derive(Parser)]
#[command(name = "uartota")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "UARTOTA_PORT")]
    port: Option<String>,

    /// Baud rate (default: 115200).
    #[arg(short, long, global = true, env = "UARTOTA_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a firmware image to the device.
    Send {
        /// Path to the application image.
        firmware: PathBuf,

        /// Version announced in START (default: from the image descriptor).
        #[arg(long = "version", value_name = "VERSION")]
        fw_version: Option<String>,

        /// Project name announced in START (default: from the image descriptor).
        #[arg(long)]
        project: Option<String>,

        /// DATA payload size in bytes (1-1024).
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..=1024))]
        block_size: Option<u16>,

        /// Retransmissions per frame before giving up.
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Query the device transfer state.
    Status {
        /// Output status as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Abort the transfer in progress on the device.
    Abort,

    /// Ask the device to roll back to the previous image.
    Rollback,

    /// Act as an OTA device on the serial port, storing images in memory.
    Emulate {
        /// Write the received image here once the transfer completes.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Version of the emulated running application.
        #[arg(long, default_value = "0.0.0")]
        running_version: String,

        /// Seconds of host silence before a transfer is dropped (0 disables).
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,

        /// Fail the post-update self-test so every new image is rolled back.
        #[arg(long)]
        fail_self_test: bool,
    },

    /// Show information about a firmware image.
    Info {
        /// Path to the application image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Resolve the serial port and baud rate from arguments and config.
    fn target(&self, config: &Config) -> Result<Target> {
        let port = self
            .port
            .clone()
            .or_else(|| {
                config
                    .connection
                    .port
                    .clone()
            })
            .ok_or_else(|| {
                CliError::Usage(
                    "no serial port given; use --port, UARTOTA_PORT or [connection] port in the config"
                        .to_string(),
                )
            })?;
        let baud = self
            .baud
            .or(config
                .connection
                .baud)
            .unwrap_or(DEFAULT_BAUD);
        Ok(Target { port, baud })
    }
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<uartota::Error>() {
        Some(uartota::Error::Interrupted) => 130,
        Some(
            uartota::Error::Serial(_)
            | uartota::Error::Timeout(_)
            | uartota::Error::Rejected { .. }
            | uartota::Error::Protocol(_),
        ) => 4,
        _ => 1,
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "uartota v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        warn!("Could not install Ctrl-C handler: {e}");
    }
    uartota::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::load_with_override(cli.config_path.as_deref());

    match &cli.command {
        Commands::Send {
            firmware,
            fw_version,
            project,
            block_size,
            retries,
        } => {
            let mut sender_config = config.sender_config();
            if let Some(block_size) = block_size {
                sender_config.block_size = usize::from(*block_size);
            }
            if let Some(retries) = retries {
                sender_config.max_retries = *retries;
            }
            transfer::cmd_send(
                &cli.target(&config)?,
                sender_config,
                firmware,
                fw_version.as_deref(),
                project.as_deref(),
                cli.quiet,
            )?;
        },
        Commands::Status { json } => {
            device::cmd_status(&cli.target(&config)?, config.sender_config(), *json)?;
        },
        Commands::Abort => {
            device::cmd_abort(&cli.target(&config)?, config.sender_config(), cli.quiet)?;
        },
        Commands::Rollback => {
            device::cmd_rollback(&cli.target(&config)?, config.sender_config(), cli.quiet)?;
        },
        Commands::Emulate {
            output,
            running_version,
            idle_timeout,
            fail_self_test,
        } => {
            let mut driver_config = config.driver_config();
            if let Some(secs) = idle_timeout {
                driver_config.idle_timeout =
                    (*secs > 0).then_some(std::time::Duration::from_secs(*secs));
            }
            emulate::cmd_emulate(
                &cli.target(&config)?,
                config.receiver_config(),
                driver_config,
                running_version,
                output.as_deref(),
                !*fail_self_test,
                cli.quiet,
            )?;
        },
        Commands::Info { firmware, json } => {
            info::cmd_info(firmware, *json)?;
        },
        Commands::ListPorts { json } => {
            info::cmd_list_ports(*json)?;
        },
        Commands::Completions { shell } => {
            completions::cmd_completions(*shell);
        },
    }

    Ok(())
}
