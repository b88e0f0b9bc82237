//! Serial port selection.
//!
//! A port given with `--port` or `port.default` is used as is. Otherwise the
//! detected ports are narrowed to known USB-UART bridges; one candidate is
//! taken automatically, several are offered in a prompt.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    kflash::{
        Board, DetectedPort,
        device::{detect_ports, format_port_list, select_port},
    },
    log::{debug, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Board profile, which decides between the two FT2232 channels.
    pub board: Option<Board>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Outcome of narrowing the detected ports.
#[derive(Debug, PartialEq, Eq)]
enum Choice {
    Selected(DetectedPort),
    Ask(Vec<DetectedPort>),
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Pick among `ports` without prompting, or say who to ask.
fn choose(ports: Vec<DetectedPort>, options: &SerialOptions) -> Result<Choice> {
    if ports.is_empty() {
        return Err(usage_err(
            "no serial ports found; connect the board or pass --port",
        ));
    }

    // goE and trainer expose two FTDI channels with a fixed role each
    if matches!(options.board, Some(Board::GoE | Board::Trainer)) {
        if let Ok(port) = select_port(&ports, options.board) {
            return Ok(Choice::Selected(port));
        }
    }

    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.is_likely_k210())
        .cloned()
        .collect();

    match known.len() {
        1 => Ok(Choice::Selected(known.into_iter().next().ok_or_else(|| {
            anyhow::anyhow!("known port list changed while selecting")
        })?)),
        0 if ports.len() == 1 && options.non_interactive => {
            Ok(Choice::Selected(ports.into_iter().next().ok_or_else(|| {
                anyhow::anyhow!("port list changed while selecting")
            })?))
        },
        0 => Ok(Choice::Ask(ports)),
        _ => Ok(Choice::Ask(known)),
    }
}

/// Resolve the port to open.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config.port.default {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    match choose(detect_ports(), options)? {
        Choice::Selected(port) => {
            info!("Auto-selected port: {} [{}]", port.name, port.device.name());
            Ok(port.name)
        },
        Choice::Ask(_) if options.non_interactive => Err(usage_err(
            "multiple serial ports found; pass --port to pick one",
        )),
        Choice::Ask(candidates) => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("port selection cancelled".to_string()).into()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("port prompt failed: {io_err}")),
    }
}

/// Interactive port selection.
fn select_port_interactive(ports: Vec<DetectedPort>) -> Result<String> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = format_port_list(&ports)
        .into_iter()
        .map(|label| console::truncate_str(&label, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the K210 serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|port| port.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}
