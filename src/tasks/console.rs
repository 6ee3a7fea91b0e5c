use std::io::{self, BufRead, ErrorKind};
use std::thread;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::UserCommand;
use crate::presentation;
use crate::tasks::controller::{Screen, ViewSnapshot};
use crate::tasks::reveal::RevealPhase;
use crate::tasks::scanner::WedgeScanner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(UserCommand),
    /// 1-based position in the history list.
    Open(usize),
    Quit,
    /// Anything that is not a command is a decoded payload from the reader.
    Payload(String),
    Invalid(String),
    Empty,
}

pub fn parse_line(line: &str) -> ConsoleInput {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(command) = line.strip_prefix(':') else {
        if line.is_empty() {
            return ConsoleInput::Empty;
        }
        return ConsoleInput::Payload(line.to_string());
    };
    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let arg = parts.next();
    match (verb, arg) {
        ("scan", None) => ConsoleInput::Command(UserCommand::RequestScan),
        ("cancel", None) => ConsoleInput::Command(UserCommand::CancelScan),
        ("history", None) => ConsoleInput::Command(UserCommand::RequestHistory),
        ("back", None) => ConsoleInput::Command(UserCommand::Back),
        ("clear", None) => ConsoleInput::Command(UserCommand::ClearHistory),
        ("quit", None) | ("q", None) => ConsoleInput::Quit,
        ("open", Some(n)) => match n.parse::<usize>() {
            Ok(n) if n > 0 => ConsoleInput::Open(n),
            _ => ConsoleInput::Invalid(format!("not a list position: {n}")),
        },
        _ => ConsoleInput::Invalid(format!("unknown command :{command}")),
    }
}

/// Forward stdin lines from a dedicated thread.
///
/// Blocking reads live outside the runtime so shutdown never waits on the terminal;
/// the thread ends with the process or when the receiver is dropped. Undecodable
/// lines are passed on as errors and reading continues; any other error ends input.
pub fn spawn_stdin_reader() -> Result<mpsc::Receiver<io::Result<String>>> {
    let (tx, rx) = mpsc::channel(16);
    thread::Builder::new()
        .name("console-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let fatal = matches!(&line, Err(err) if err.kind() != ErrorKind::InvalidData);
                if tx.blocking_send(line).is_err() || fatal {
                    break;
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}

/// Handles console lines: `:commands` go to the controller, everything else to the reader.
///
/// A read error fails the running scan session, or the next one when none is running.
pub async fn run_input(
    mut lines: mpsc::Receiver<io::Result<String>>,
    commands: mpsc::Sender<UserCommand>,
    scanner: WedgeScanner,
    snapshots: watch::Receiver<ViewSnapshot>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let line = select! {
            _ = cancel.cancelled() => break,
            line = lines.recv() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!("console read failed: {err}");
                let reason = err.to_string();
                if !scanner.fail(&reason) {
                    scanner.report_fault(&reason);
                }
                continue;
            }
            None => {
                info!("stdin closed; initiating shutdown");
                cancel.cancel();
                break;
            }
        };

        let command = match parse_line(&line) {
            ConsoleInput::Command(cmd) => cmd,
            ConsoleInput::Open(position) => {
                let id = snapshots
                    .borrow()
                    .history
                    .get(position - 1)
                    .map(|entry| entry.id().to_string());
                match id {
                    Some(id) => UserCommand::SelectEntry(id),
                    None => {
                        warn!(position, "no history entry at that position");
                        continue;
                    }
                }
            }
            ConsoleInput::Quit => {
                info!("quit requested; initiating shutdown");
                cancel.cancel();
                break;
            }
            ConsoleInput::Payload(text) => {
                if !scanner.feed(&text) {
                    info!("scanner is not running; use :scan first");
                }
                continue;
            }
            ConsoleInput::Invalid(reason) => {
                warn!("{reason}");
                continue;
            }
            ConsoleInput::Empty => continue,
        };
        if commands.send(command).await.is_err() {
            debug!("controller gone; console input stopping");
            break;
        }
    }
    Ok(())
}

/// Prints a fresh screen whenever the snapshot or the reveal stage changes.
pub async fn run_output<W>(
    mut writer: W,
    mut snapshots: watch::Receiver<ViewSnapshot>,
    mut reveal: watch::Receiver<RevealPhase>,
    color: bool,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reveal_open = true;
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        let phase = *reveal.borrow_and_update();
        let text = presentation::render(&snapshot, phase, color);
        writer
            .write_all(text.as_bytes())
            .await
            .context("failed to write screen")?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        // a reveal stage change only matters while its screen is up
        loop {
            select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    break;
                }
                changed = reveal.changed(), if reveal_open => {
                    if changed.is_err() {
                        reveal_open = false;
                        continue;
                    }
                    if snapshots.borrow().screen == Screen::Revealing {
                        break;
                    }
                }
            }
        }
    }
}
