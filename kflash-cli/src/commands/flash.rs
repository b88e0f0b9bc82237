//! Flash, SRAM and erase command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use kflash::{EraseRange, Firmware, FlashOutcome, Plan, RebootMethod, SessionConfig, WriteJob};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Stub path from the flag, falling back to `flash.bootloader`.
fn bootloader_path(flag: Option<&Path>, config: &Config) -> Result<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| config.flash.bootloader.clone())
        .ok_or_else(|| {
            CliError::Usage(
                "no flash-mode stub given; pass --bootloader or set flash.bootloader".to_string(),
            )
            .into()
        })
}

fn read_bootloader(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("Failed to read bootloader {}", path.display()))
}

fn load_firmware(path: &Path) -> Result<Firmware> {
    Firmware::from_file(path)
        .with_context(|| format!("Failed to read firmware {}", path.display()))
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

fn print_jobs(cli: &Cli, firmware: &Firmware, jobs: &[WriteJob]) {
    if cli.quiet {
        return;
    }
    eprintln!(
        "{} {} image, {} write(s)",
        style("ℹ").blue(),
        firmware.format(),
        jobs.len()
    );
    for job in jobs {
        eprintln!(
            "    {} {} @ 0x{:08X} ({} bytes)",
            style("•").dim(),
            job.name,
            job.address,
            job.data.len()
        );
    }
}

/// Open the port, run `plan` and render progress.
fn execute(
    cli: &Cli,
    config: &Config,
    session: SessionConfig,
    plan: &Plan<'_>,
) -> Result<FlashOutcome> {
    let port = get_port(cli, config, session.board)?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port).green(),
            session.baud
        );
    }
    ensure_not_interrupted()?;

    let mut flasher = kflash::create_flasher(&port, session)
        .with_context(|| format!("Failed to open {port}"))?;

    if !cli.quiet {
        eprintln!("{} Waiting for the boot ROM...", style("⏳").yellow());
    }

    let pb = progress_bar(cli);
    let mut current = String::new();
    let result = flasher.run(plan, &mut |name, done, total| {
        if name != current {
            current = name.to_string();
            pb.set_length(total as u64);
            pb.set_message(current.clone());
        }
        pb.set_position(done as u64);
    });
    flasher.close();

    match result {
        Ok(outcome) => {
            pb.finish_and_clear();
            Ok(outcome)
        },
        Err(err) => {
            pb.abandon();
            Err(err.into())
        },
    }
}

fn report(cli: &Cli, outcome: FlashOutcome, done: &str) {
    if cli.quiet {
        return;
    }
    match outcome {
        FlashOutcome::Flashed { board, reboot } => {
            eprintln!("\n{} {done} ({board})", style("🎉").green().bold());
            if reboot == RebootMethod::ResetLines {
                eprintln!(
                    "{} The stub did not reboot; the board was reset through DTR/RTS",
                    style("⚠").yellow()
                );
            }
        },
        FlashOutcome::SramBooted { board } => {
            eprintln!("\n{} {done} ({board})", style("🎉").green().bold());
        },
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    session: SessionConfig,
    firmware: &Path,
    bootloader: Option<&Path>,
    erase: bool,
) -> Result<()> {
    let stub_path = bootloader_path(bootloader, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = load_firmware(firmware)?;
    let jobs = image.flash_jobs()?;
    print_jobs(cli, &image, &jobs);
    let stub = read_bootloader(&stub_path)?;

    let plan = Plan::Flash {
        stub: &stub,
        jobs: &jobs,
        erase_first: erase,
    };
    let outcome = execute(cli, config, session, &plan)?;
    report(cli, outcome, "Flashing completed");
    Ok(())
}

/// SRAM command implementation.
pub(crate) fn cmd_sram(
    cli: &Cli,
    config: &Config,
    session: SessionConfig,
    firmware: &Path,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading program {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = load_firmware(firmware)?;
    let jobs = image.sram_jobs()?;
    print_jobs(cli, &image, &jobs);

    let outcome = execute(cli, config, session, &Plan::Sram { jobs: &jobs })?;
    report(cli, outcome, "Program started from SRAM");
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(
    cli: &Cli,
    config: &Config,
    session: SessionConfig,
    bootloader: Option<&Path>,
    range: EraseRange,
) -> Result<()> {
    let stub = read_bootloader(&bootloader_path(bootloader, config)?)?;

    if !cli.quiet {
        eprintln!("{} Erasing {range}", style("🗑").red());
    }
    let outcome = execute(
        cli,
        config,
        session,
        &Plan::Erase {
            stub: &stub,
            range,
        },
    )?;
    report(cli, outcome, "Erase completed");
    Ok(())
}
