use std::sync::{Arc, Mutex};
use std::time::Duration;

use case_catalog::{CardRecord, Catalog, Category};
use case_file::config::RevealConfig;
use case_file::events::UserCommand;
use case_file::history::HistoryStore;
use case_file::presentation::RelatedCards;
use case_file::storage::MemoryStorage;
use case_file::tasks::controller::{Clock, ControllerParts, Screen, ViewController, ViewSnapshot};
use case_file::tasks::reveal::{ImageAssetProbe, RevealSequencer, SilentCues};
use case_file::tasks::scanner::{CameraDevice, CameraFacing, WedgeScanner};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ERROR_DISPLAY: Duration = Duration::from_millis(300);
const QUICK_STAGE: Duration = Duration::from_millis(20);

struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn at(secs: i64) -> Arc<Self> {
        Arc::new(Self(Mutex::new(ts(secs))))
    }

    fn set(&self, secs: i64) {
        *self.0.lock().unwrap() = ts(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn card(id: &str, category: Category) -> CardRecord {
    CardRecord {
        id: id.into(),
        category,
        label: "Saksi".into(),
        title: format!("Card {id}"),
        subtitle: "test card".into(),
        body: "first\nsecond".into(),
        image: format!("/{id}.webp"),
    }
}

fn wedge() -> WedgeScanner {
    WedgeScanner::new(vec![CameraDevice {
        id: "wedge0".into(),
        label: "test wedge (back)".into(),
    }])
}

struct Harness {
    commands: mpsc::Sender<UserCommand>,
    snapshots: watch::Receiver<ViewSnapshot>,
    scanner: WedgeScanner,
    storage: MemoryStorage,
    clock: Arc<ManualClock>,
    cancel: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    fn start(storage: MemoryStorage, scanner: WedgeScanner) -> Self {
        Self::with_stage(storage, scanner, QUICK_STAGE)
    }

    /// `stage` is the length of each reveal stage, attention and flip alike.
    fn with_stage(storage: MemoryStorage, scanner: WedgeScanner, stage: Duration) -> Self {
        let catalog = Catalog::from_records([
            card("X1", Category::Witness),
            card("X2", Category::Witness),
            card("E1", Category::Evidence),
        ]);
        let reveal = RevealConfig {
            attention: stage,
            flip: stage,
            asset_timeout: Duration::from_millis(200),
            cue: false,
            ..RevealConfig::default()
        };
        // nothing under the asset root: every reveal uses the default layout
        let sequencer = RevealSequencer::new(
            reveal,
            Arc::new(ImageAssetProbe::new("/nonexistent-case-file-assets")),
            Arc::new(SilentCues),
        );
        let clock = ManualClock::at(0);
        let controller = ViewController::new(ControllerParts {
            catalog: Arc::new(catalog),
            history: HistoryStore::with_storage(Box::new(storage.clone())),
            sequencer,
            scanner: Box::new(scanner.clone()),
            cues: Arc::new(SilentCues),
            clock: clock.clone(),
            extension: Some(Box::new(RelatedCards::default())),
            facing: CameraFacing::Environment,
            error_display: ERROR_DISPLAY,
        });
        let snapshots = controller.subscribe();
        let (commands, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(controller.run(command_rx, cancel.clone()));
        Self {
            commands,
            snapshots,
            scanner,
            storage,
            clock,
            cancel,
            task,
        }
    }

    async fn send(&self, cmd: UserCommand) {
        self.commands.send(cmd).await.expect("controller stopped");
    }

    async fn wait_for(
        &mut self,
        what: &str,
        pred: impl FnMut(&ViewSnapshot) -> bool,
    ) -> ViewSnapshot {
        let snapshot = tokio::time::timeout(Duration::from_secs(2), self.snapshots.wait_for(pred))
            .await
            .unwrap_or_else(|_| panic!("timeout waiting for {what}"))
            .expect("controller dropped its snapshot channel");
        (*snapshot).clone()
    }

    async fn wait_screen(&mut self, screen: Screen) -> ViewSnapshot {
        self.wait_for(&format!("{screen:?}"), |s| s.screen == screen)
            .await
    }

    /// Scan `code` from Home and wait until the card is shown.
    async fn scan_card(&mut self, code: &str) -> ViewSnapshot {
        self.send(UserCommand::RequestScan).await;
        self.wait_screen(Screen::Scanning).await;
        assert!(self.scanner.feed(code), "scanner should accept input");
        self.wait_for("result", |s| {
            s.screen == Screen::Result && s.selected.as_ref().is_some_and(|e| e.id() == code)
        })
        .await
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.task
            .await
            .expect("controller panicked")
            .expect("controller failed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_scan_reveals_and_records_card() {
    // long enough that the Revealing snapshot is still current when the test looks
    let stage = Duration::from_millis(250);
    let mut h = Harness::with_stage(MemoryStorage::new(), wedge(), stage);
    let home = h.wait_screen(Screen::Home).await;
    assert_eq!(home.history_count, 0);

    h.send(UserCommand::RequestScan).await;
    h.wait_screen(Screen::Scanning).await;
    assert!(h.scanner.feed("X1"));

    let revealing = h.wait_screen(Screen::Revealing).await;
    let card = revealing.revealing.as_ref().map(|r| r.id.as_str());
    assert_eq!(card, Some("X1"));
    assert_eq!(revealing.history_count, 1, "history written before reveal");

    let result = h.wait_screen(Screen::Result).await;
    let selected = result.selected.expect("selected entry");
    assert_eq!(selected.id(), "X1");
    assert_eq!(selected.scanned_at, ts(0));
    assert!(result.annotation.is_none(), "nothing related yet");
    assert!(!h.scanner.is_active(), "session ends after one decode");
    assert!(h.storage.document().unwrap().contains("\"X1\""));

    h.send(UserCommand::Back).await;
    h.wait_screen(Screen::Home).await;
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rescan_moves_card_to_front_without_duplicates() {
    let mut h = Harness::start(MemoryStorage::new(), wedge());

    h.scan_card("X1").await;
    h.send(UserCommand::Back).await;
    h.wait_screen(Screen::Home).await;

    h.clock.set(10);
    let second = h.scan_card("X2").await;
    assert_eq!(second.annotation.as_deref(), Some("Related: Card X1"));
    h.send(UserCommand::Back).await;
    h.wait_screen(Screen::Home).await;

    h.clock.set(20);
    h.scan_card("X1").await;
    h.send(UserCommand::RequestHistory).await;
    let list = h.wait_screen(Screen::HistoryList).await;

    let ids: Vec<&str> = list.history.iter().map(|e| e.id()).collect();
    assert_eq!(ids, ["X1", "X2"]);
    assert_eq!(list.history[0].scanned_at, ts(20));
    assert_eq!(list.history[1].scanned_at, ts(10));
    assert_eq!(list.history_count, 2);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_code_shows_transient_error_and_keeps_history() {
    let mut h = Harness::start(MemoryStorage::new(), wedge());
    h.scan_card("X1").await;
    h.send(UserCommand::Back).await;
    h.wait_screen(Screen::Home).await;
    let saves = h.storage.save_count();

    h.send(UserCommand::RequestScan).await;
    h.wait_screen(Screen::Scanning).await;
    assert!(h.scanner.feed("UNKNOWN"));

    let failed = h
        .wait_for("toast", |s| s.screen == Screen::Home && s.error.is_some())
        .await;
    let message = failed.error.unwrap();
    assert!(message.contains("UNKNOWN"), "message was {message:?}");
    assert_eq!(failed.history_count, 1);
    assert_eq!(h.storage.save_count(), saves, "a miss never writes history");

    let cleared = h.wait_for("error to expire", |s| s.error.is_none()).await;
    assert_eq!(cleared.screen, Screen::Home);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn history_survives_restart() {
    let storage = MemoryStorage::new();
    let mut first = Harness::start(storage.clone(), wedge());
    first.scan_card("X1").await;
    first.send(UserCommand::Back).await;
    first.wait_screen(Screen::Home).await;
    first.clock.set(5);
    first.scan_card("E1").await;
    first.stop().await;

    let mut second = Harness::start(storage, wedge());
    let home = second.wait_screen(Screen::Home).await;
    assert_eq!(home.history_count, 2);

    second.send(UserCommand::RequestHistory).await;
    let list = second.wait_screen(Screen::HistoryList).await;
    let ids: Vec<&str> = list.history.iter().map(|e| e.id()).collect();
    assert_eq!(ids, ["E1", "X1"]);
    second.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_camera_reports_error_and_stays_home() {
    let mut h = Harness::start(MemoryStorage::new(), WedgeScanner::new(Vec::new()));
    h.send(UserCommand::RequestScan).await;
    let failed = h.wait_for("capability error", |s| s.error.is_some()).await;
    assert_eq!(failed.screen, Screen::Home);
    assert!(failed.error.unwrap().starts_with("No cameras found"));
    assert_eq!(failed.history_count, 0);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_camera_permission_shows_access_toast() {
    let mut h = Harness::start(MemoryStorage::new(), wedge());
    h.scanner.report_fault("NotAllowedError: Permission denied");
    h.send(UserCommand::RequestScan).await;

    let failed = h.wait_for("permission error", |s| s.error.is_some()).await;
    assert_eq!(failed.screen, Screen::Home);
    assert_eq!(
        failed.error.as_deref(),
        Some("Camera access denied. Please allow camera permission and try again.")
    );
    assert!(!h.scanner.is_active());

    // the fault is reported once; asking again opens the reader
    h.send(UserCommand::RequestScan).await;
    h.wait_screen(Screen::Scanning).await;
    assert!(h.scanner.is_active());
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scanner_failure_mid_session_returns_home() {
    let mut h = Harness::start(MemoryStorage::new(), wedge());
    h.send(UserCommand::RequestScan).await;
    h.wait_screen(Screen::Scanning).await;
    assert!(h.scanner.fail("device unplugged"));

    let failed = h.wait_for("scanner error", |s| s.error.is_some()).await;
    assert_eq!(failed.screen, Screen::Home);
    assert_eq!(
        failed.error.as_deref(),
        Some("Scanner stopped: device unplugged")
    );
    assert!(!h.scanner.is_active());
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_scan_ignores_late_input() {
    let mut h = Harness::start(MemoryStorage::new(), wedge());
    h.send(UserCommand::RequestScan).await;
    h.wait_screen(Screen::Scanning).await;
    h.send(UserCommand::CancelScan).await;
    h.wait_screen(Screen::Home).await;

    assert!(!h.scanner.is_active());
    assert!(!h.scanner.feed("X1"), "input after cancel is dropped");
    assert_eq!(h.snapshots.borrow().history_count, 0);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn history_entry_opens_and_back_returns_to_list() {
    let mut h = Harness::start(MemoryStorage::new(), wedge());
    h.scan_card("X1").await;
    h.send(UserCommand::Back).await;
    h.wait_screen(Screen::Home).await;
    h.clock.set(30);
    h.scan_card("X2").await;

    // history is reachable straight from the result screen
    h.send(UserCommand::RequestHistory).await;
    h.wait_screen(Screen::HistoryList).await;
    h.send(UserCommand::SelectEntry("X1".into())).await;
    let opened = h.wait_screen(Screen::Result).await;
    assert_eq!(opened.selected.unwrap().id(), "X1");

    h.send(UserCommand::Back).await;
    h.wait_screen(Screen::HistoryList).await;
    h.send(UserCommand::Back).await;
    h.wait_screen(Screen::Home).await;
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clearing_history_returns_home_and_disables_list() {
    let mut h = Harness::start(MemoryStorage::new(), wedge());
    h.scan_card("X1").await;
    h.send(UserCommand::RequestHistory).await;
    h.wait_screen(Screen::HistoryList).await;

    h.send(UserCommand::ClearHistory).await;
    let home = h.wait_for("cleared", |s| s.history_count == 0).await;
    assert_eq!(home.screen, Screen::Home);
    assert!(home.history.is_empty());
    assert!(home.selected.is_none());
    assert!(h.storage.document().unwrap().contains("\"entries\": []"));

    // an empty history cannot be opened; the scan that follows proves we are still Home
    h.send(UserCommand::RequestHistory).await;
    h.send(UserCommand::RequestScan).await;
    let scanning = h.wait_for("scanning", |s| s.screen != Screen::Home).await;
    assert_eq!(scanning.screen, Screen::Scanning);
    h.stop().await;
}
