//! kflash CLI - Command-line tool for flashing Kendryte K210 boards.
//!
//! ## Features
//!
//! - Flash raw binaries and `.kfpkg` packages, optionally AES encrypted
//! - Load ELF files or binaries into SRAM and run them
//! - Erase the whole flash or a range of it
//! - Board reset auto-detection and interactive serial port selection
//! - Shell completion generation
//! - Configuration files and environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use kflash::{AesKey, Board, FlashChip, IoMode, SessionConfig};
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Failures with a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad arguments or setup; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// kflash - A cross-platform tool for flashing Kendryte K210 boards.
///
/// Environment variables:
///   KFLASH_PORT              - Default serial port
///   KFLASH_BAUD              - Target baud rate (default: 115200)
///   KFLASH_BOARD             - Board profile
///   KFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "kflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(
    after_help = "Boards: kd233, dan, bit, bit_mic, goE (maixduino), goD, trainer.\n\
                  Without --board the reset sequences are tried in turn."
)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "KFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for data transfer [default: 115200].
    #[arg(short, long, global = true, env = "KFLASH_BAUD")]
    baud: Option<u32>,

    /// Board profile (auto-detected if not specified).
    #[arg(short = 'B', long, global = true, env = "KFLASH_BOARD", value_parser = parse_board)]
    board: Option<Board>,

    /// Slow mode: keep the boot ROM at 115200 baud.
    #[arg(short = 'S', long, global = true)]
    slow: bool,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "KFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Write a binary or .kfpkg package to flash.
    Flash {
        /// Firmware file (raw binary or .kfpkg).
        firmware: PathBuf,

        /// Flash-mode stub loaded into SRAM first.
        #[arg(short = 'l', long, value_name = "PATH")]
        bootloader: Option<PathBuf>,

        /// Erase the whole chip before writing.
        #[arg(short, long)]
        erase: bool,

        /// AES-128 key (32 hex digits) to encrypt the image with.
        #[arg(short, long, value_name = "HEX")]
        key: Option<String>,

        /// Flash chip: 0 = in-chip (SPI3), 1 = on-board (SPI0).
        #[arg(short = 'f', long, value_parser = clap::value_parser!(u8).range(0..=1))]
        flash_chip: Option<u8>,

        /// SPI read mode recorded in the image header.
        #[arg(long, value_parser = parse_io_mode)]
        io_mode: Option<IoMode>,
    },

    /// Load an ELF or binary into SRAM and run it.
    Sram {
        /// Program file (ELF or raw binary).
        firmware: PathBuf,
    },

    /// Erase flash memory.
    Erase {
        /// Flash-mode stub loaded into SRAM first.
        #[arg(short = 'l', long, value_name = "PATH")]
        bootloader: Option<PathBuf>,

        /// Start address (4 KiB aligned).
        #[arg(long, default_value = "0", value_name = "ADDR")]
        addr: String,

        /// Bytes to erase (4 KiB aligned), or "all" for the whole chip.
        #[arg(long, value_name = "LEN")]
        length: String,

        /// Flash chip: 0 = in-chip (SPI3), 1 = on-board (SPI0).
        #[arg(short = 'f', long, value_parser = clap::value_parser!(u8).range(0..=1))]
        flash_chip: Option<u8>,
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

fn parse_board(s: &str) -> Result<Board, String> {
    s.parse().map_err(|e: kflash::Error| e.to_string())
}

fn parse_io_mode(s: &str) -> Result<IoMode, String> {
    s.parse().map_err(|e: kflash::Error| e.to_string())
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => return 2,
        Some(CliError::Cancelled(_)) => return 130,
        None => {},
    }

    let cancelled = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<kflash::Error>(),
            Some(kflash::Error::Cancelled)
        )
    });
    if cancelled { 130 } else { 1 }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
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
        "kflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    kflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.config_path.as_deref());

    match &cli.command {
        Commands::Flash {
            firmware,
            bootloader,
            erase,
            key,
            flash_chip,
            io_mode,
        } => {
            let session = session_config(cli, &config, *flash_chip)?
                .with_aes_key(parse_key(key.as_deref())?)
                .with_io_mode(resolve_io_mode(*io_mode, &config)?);
            commands::flash::cmd_flash(
                cli,
                &config,
                session,
                firmware,
                bootloader.as_deref(),
                *erase,
            )
        },
        Commands::Sram { firmware } => {
            let session = session_config(cli, &config, None)?;
            commands::flash::cmd_sram(cli, &config, session, firmware)
        },
        Commands::Erase {
            bootloader,
            addr,
            length,
            flash_chip,
        } => {
            let range = kflash::EraseRange::parse(addr, length)
                .map_err(|e| CliError::Usage(e.to_string()))?;
            let session = session_config(cli, &config, *flash_chip)?;
            commands::flash::cmd_erase(cli, &config, session, bootloader.as_deref(), range)
        },
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Build the library session settings from flags, environment and config.
fn session_config(cli: &Cli, config: &Config, flash_chip: Option<u8>) -> Result<SessionConfig> {
    let board = match (cli.board, &config.port.board) {
        (Some(board), _) => Some(board),
        (None, Some(name)) => Some(
            name.parse::<Board>()
                .map_err(|e| CliError::Usage(format!("port.board in config: {e}")))?,
        ),
        (None, None) => None,
    };

    let chip = match flash_chip.or(config.flash.chip) {
        Some(value) => FlashChip::try_from(value)
            .map_err(|e| CliError::Usage(format!("flash chip: {e}")))?,
        None => FlashChip::default(),
    };

    let baud = cli
        .baud
        .or(config.port.baud)
        .unwrap_or(kflash::target::k210::DEFAULT_BAUD);

    Ok(SessionConfig::default()
        .with_board(board)
        .with_baud(baud)
        .with_flash_chip(chip)
        .with_slow_mode(cli.slow || config.flash.slow))
}

fn parse_key(key: Option<&str>) -> Result<Option<AesKey>> {
    key.map(|hex| {
        AesKey::from_hex(hex).map_err(|e| CliError::Usage(format!("--key: {e}")).into())
    })
    .transpose()
}

fn resolve_io_mode(flag: Option<IoMode>, config: &Config) -> Result<IoMode> {
    if let Some(mode) = flag {
        return Ok(mode);
    }
    match &config.flash.io_mode {
        Some(name) => name.parse().map_err(|e: kflash::Error| {
            CliError::Usage(format!("flash.io_mode in config: {e}")).into()
        }),
        None => Ok(IoMode::default()),
    }
}

/// Get serial port from CLI args, config or interactive selection.
fn get_port(cli: &Cli, config: &Config, board: Option<Board>) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        board,
        non_interactive: cli.non_interactive,
    };
    select_serial_port(&options, config)
}
