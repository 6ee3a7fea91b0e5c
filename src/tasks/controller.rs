mod state;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use case_catalog::{CardRecord, Catalog};
use chrono::{DateTime, Utc};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use state::{Screen, ScreenChange, ScreenSM, Toast};

use crate::events::{RevealFinished, ScanEvent, ScanEventKind, UserCommand};
use crate::history::{HistoryEntry, HistoryStore};
use crate::presentation::ResultExtension;
use crate::tasks::reveal::{Cue, CuePlayer, RevealPhase, RevealSequencer};
use crate::tasks::scanner::{CameraFacing, ScanCapability, ScanHandle};

/// Source of scan timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What the user-facing surface should currently show.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub screen: Screen,
    pub selected: Option<HistoryEntry>,
    /// History as captured when the list screen was opened, most recent first.
    pub history: Vec<HistoryEntry>,
    pub history_count: usize,
    pub error: Option<String>,
    /// Card being revealed while `screen` is `Revealing`.
    pub revealing: Option<CardRecord>,
    pub annotation: Option<String>,
}

impl ViewSnapshot {
    fn initial(history_count: usize) -> Self {
        Self {
            screen: Screen::Home,
            selected: None,
            history: Vec::new(),
            history_count,
            error: None,
            revealing: None,
            annotation: None,
        }
    }
}

/// Collaborators the controller drives. The history store is owned outright.
pub struct ControllerParts {
    pub catalog: Arc<Catalog>,
    pub history: HistoryStore,
    pub sequencer: RevealSequencer,
    pub scanner: Box<dyn ScanCapability>,
    pub cues: Arc<dyn CuePlayer>,
    pub clock: Arc<dyn Clock>,
    pub extension: Option<Box<dyn ResultExtension>>,
    pub facing: CameraFacing,
    pub error_display: std::time::Duration,
}

/// Ties scanning, catalog lookup, history and the reveal together.
///
/// Rules:
/// - A scan session is stopped as soon as it reports anything, so only one decode is ever
///   handled per session and history writes are serialized by construction.
/// - Events from a session other than the running one are discarded.
/// - A lookup miss or capability failure returns to Home with a toast; neither touches history.
/// - A hit is written to history before the reveal starts; the entry is selected when the
///   reveal reports completion for the same generation.
pub struct ViewController {
    catalog: Arc<Catalog>,
    history: HistoryStore,
    sequencer: RevealSequencer,
    scanner: Box<dyn ScanCapability>,
    cues: Arc<dyn CuePlayer>,
    clock: Arc<dyn Clock>,
    extension: Option<Box<dyn ResultExtension>>,
    facing: CameraFacing,
    sm: ScreenSM,
    scan: Option<ScanHandle>,
    scan_tx: mpsc::Sender<ScanEvent>,
    scan_rx: mpsc::Receiver<ScanEvent>,
    reveal_tx: mpsc::UnboundedSender<RevealFinished>,
    reveal_rx: mpsc::UnboundedReceiver<RevealFinished>,
    reveal_generation: u64,
    pending_reveal: Option<(u64, HistoryEntry)>,
    history_view: Vec<HistoryEntry>,
    snapshot_tx: watch::Sender<ViewSnapshot>,
}

impl ViewController {
    pub fn new(parts: ControllerParts) -> Self {
        let (scan_tx, scan_rx) = mpsc::channel(16);
        let (reveal_tx, reveal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(ViewSnapshot::initial(parts.history.count()));
        Self {
            catalog: parts.catalog,
            history: parts.history,
            sequencer: parts.sequencer,
            scanner: parts.scanner,
            cues: parts.cues,
            clock: parts.clock,
            extension: parts.extension,
            facing: parts.facing,
            sm: ScreenSM::new(parts.error_display),
            scan: None,
            scan_tx,
            scan_rx,
            reveal_tx,
            reveal_rx,
            reveal_generation: 0,
            pending_reveal: None,
            history_view: Vec::new(),
            snapshot_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Stage updates of the running reveal, for surfaces that animate it.
    pub fn reveal_phases(&self) -> watch::Receiver<RevealPhase> {
        self.sequencer.subscribe()
    }

    pub fn screen(&self) -> Screen {
        self.sm.current()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn error(&self) -> Option<&str> {
        self.sm.toast().map(|toast| toast.message.as_str())
    }

    /// Event loop; returns when `cancel` fires or the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<UserCommand>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.publish();
        loop {
            let deadline = self.sm.error_deadline();
            select! {
                _ = cancel.cancelled() => break,

                maybe_cmd = commands.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("command channel closed");
                            break;
                        }
                    }
                }

                Some(event) = self.scan_rx.recv() => {
                    self.handle_scan_event(event);
                }

                Some(finished) = self.reveal_rx.recv() => {
                    self.handle_reveal_finished(finished);
                }

                _ = async {
                    if let Some(at) = deadline {
                        sleep_until(at.into()).await;
                    }
                }, if deadline.is_some() => {
                    self.expire_errors(Instant::now());
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    pub fn handle_command(&mut self, cmd: UserCommand) {
        debug!(?cmd, screen = ?self.sm.current(), "user command");
        match cmd {
            UserCommand::RequestScan => self.start_scan(),
            UserCommand::CancelScan => self.cancel_scan(),
            UserCommand::RequestHistory => self.open_history(),
            UserCommand::SelectEntry(id) => self.select_entry(&id),
            UserCommand::Back => {
                if self.sm.current() == Screen::Scanning {
                    self.cancel_scan();
                } else if let Some(ch) = self.sm.on_back() {
                    log_change(ch);
                }
            }
            UserCommand::ClearHistory => self.clear_history(),
        }
        self.publish();
    }

    pub fn handle_scan_event(&mut self, event: ScanEvent) {
        let current = self.scan.as_ref().map(ScanHandle::session);
        if current != Some(event.session) || self.sm.current() != Screen::Scanning {
            debug!(session = event.session, ?current, "discarding stale scan event");
            return;
        }
        // single-flight: nothing else may arrive from this session
        self.stop_scan();
        if let Some(ch) = self.sm.on_scan_finished() {
            log_change(ch);
        }
        match event.kind {
            ScanEventKind::Decoded(code) => self.resolve(code),
            ScanEventKind::Failed(err) => {
                warn!("scanner failed: {err}");
                self.sm.raise_error(err.to_string(), Instant::now());
            }
        }
        self.publish();
    }

    pub fn handle_reveal_finished(&mut self, finished: RevealFinished) {
        let Some((generation, _)) = &self.pending_reveal else {
            return;
        };
        if *generation != finished.generation {
            debug!(
                finished = finished.generation,
                pending = generation,
                "ignoring stale reveal completion"
            );
            return;
        }
        if let Some((_, entry)) = self.pending_reveal.take() {
            if let Some(ch) = self.sm.on_reveal_finished(entry) {
                log_change(ch);
            }
        }
        self.publish();
    }

    /// Clear an expired toast. Returns whether the view changed.
    pub fn expire_errors(&mut self, now: Instant) -> bool {
        let changed = self.sm.on_tick(now);
        if changed {
            debug!("error toast expired");
            self.publish();
        }
        changed
    }

    pub fn shutdown(&mut self) {
        self.stop_scan();
        self.sequencer.cancel();
        self.pending_reveal = None;
        debug!("view controller stopped");
    }

    fn start_scan(&mut self) {
        let Some(ch) = self.sm.on_scan_requested() else {
            return;
        };
        log_change(ch);
        match self.scanner.start(self.facing, self.scan_tx.clone()) {
            Ok(handle) => {
                self.scan = Some(handle);
            }
            Err(err) => {
                warn!("failed to start scanner: {err}");
                if let Some(ch) = self.sm.on_scan_finished() {
                    log_change(ch);
                }
                self.sm.raise_error(err.to_string(), Instant::now());
            }
        }
    }

    fn cancel_scan(&mut self) {
        if let Some(ch) = self.sm.on_scan_finished() {
            log_change(ch);
            self.stop_scan();
        }
    }

    fn stop_scan(&mut self) {
        if let Some(handle) = self.scan.take() {
            handle.stop();
        }
    }

    fn resolve(&mut self, code: String) {
        self.sm.clear_error();
        let Some(record) = self.catalog.lookup(&code).cloned() else {
            info!(code = %code, "unknown scan code");
            if let Err(err) = self.cues.play(Cue::ScanFailure) {
                debug!("failure cue failed: {err:#}");
            }
            self.sm.raise_error(
                format!("Unknown clue: {code}. Please scan a valid game card."),
                Instant::now(),
            );
            return;
        };

        let entry = self.history.upsert(&record, self.clock.now());
        info!(
            id = %record.id,
            title = %record.title,
            history = self.history.count(),
            "card resolved"
        );

        self.reveal_generation += 1;
        let generation = self.reveal_generation;
        self.pending_reveal = Some((generation, entry));
        let reveal_tx = self.reveal_tx.clone();
        self.sequencer.begin(record.image.clone(), move |_layout| {
            if let Err(err) = reveal_tx.send(RevealFinished { generation }) {
                debug!("reveal completion dropped: {err}");
            }
        });
        if let Some(ch) = self.sm.on_reveal_started() {
            log_change(ch);
        }
    }

    fn open_history(&mut self) {
        if self.history.is_empty() {
            debug!("history requested with no scans; ignoring");
            return;
        }
        if self.sm.current() == Screen::Scanning || self.sm.current() == Screen::Revealing {
            return;
        }
        self.history_view = self.history.list();
        if let Some(ch) = self.sm.on_history_requested() {
            log_change(ch);
        }
    }

    fn select_entry(&mut self, id: &str) {
        if self.sm.current() != Screen::HistoryList {
            return;
        }
        let Some(entry) = self.history_view.iter().find(|e| e.id() == id).cloned() else {
            debug!(id, "selected entry is not in the history view");
            return;
        };
        if let Some(ch) = self.sm.on_entry_selected(entry) {
            log_change(ch);
        }
    }

    fn clear_history(&mut self) {
        match self.sm.current() {
            Screen::Scanning | Screen::Revealing => {
                debug!("history clear ignored while busy");
            }
            _ => {
                self.history.clear();
                self.history_view.clear();
                if let Some(ch) = self.sm.on_history_cleared() {
                    log_change(ch);
                }
            }
        }
    }

    fn publish(&self) {
        let screen = self.sm.current();
        let selected = self.sm.selected().cloned();
        let annotation = match (&self.extension, &selected) {
            (Some(extension), Some(entry)) if screen == Screen::Result => {
                extension.annotate(entry, &self.history)
            }
            _ => None,
        };
        let revealing = match (&self.pending_reveal, screen) {
            (Some((_, entry)), Screen::Revealing) => Some(entry.record.clone()),
            _ => None,
        };
        let snapshot = ViewSnapshot {
            screen,
            selected,
            history: self.history_view.clone(),
            history_count: self.history.count(),
            error: self.error().map(str::to_string),
            revealing,
            annotation,
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

fn log_change(ch: ScreenChange) {
    info!(from = ?ch.from, to = ?ch.to, "screen changed");
}
