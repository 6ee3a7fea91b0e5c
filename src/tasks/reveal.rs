use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, ensure};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RevealConfig;

/// Pixel size of a card image after orientation is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetMetrics {
    pub width: u32,
    pub height: u32,
}

impl AssetMetrics {
    pub fn aspect_ratio(&self) -> Option<f32> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        Some(self.width as f32 / self.height as f32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RevealLayout {
    /// Width / height of the card face.
    pub aspect_ratio: f32,
    /// False when the default layout stood in for an image that could not be measured.
    pub measured: bool,
}

impl RevealLayout {
    pub fn fallback(aspect_ratio: f32) -> Self {
        Self {
            aspect_ratio,
            measured: false,
        }
    }
}

/// Measures card images. Called on the blocking pool.
pub trait AssetProbe: Send + Sync + 'static {
    fn measure(&self, reference: &str) -> Result<AssetMetrics>;
}

/// Reads image headers from disk, relative to an asset root.
#[derive(Debug, Clone)]
pub struct ImageAssetProbe {
    root: PathBuf,
}

impl ImageAssetProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Image references are web-style paths ("/C001.webp"); they always resolve under the root.
    pub fn resolve(&self, reference: &str) -> PathBuf {
        self.root.join(reference.trim_start_matches('/'))
    }
}

impl AssetProbe for ImageAssetProbe {
    fn measure(&self, reference: &str) -> Result<AssetMetrics> {
        ensure!(
            !reference.split('/').any(|part| part == ".."),
            "image reference {reference} escapes the asset root"
        );
        let path = self.resolve(reference);
        let (width, height) = image::ImageReader::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?
            .with_guessed_format()?
            .into_dimensions()
            .with_context(|| format!("failed to read dimensions of {}", path.display()))?;
        // orientations 5-8 store the image rotated a quarter turn
        let metrics = match read_orientation(&path) {
            Some(5..=8) => AssetMetrics {
                width: height,
                height: width,
            },
            _ => AssetMetrics { width, height },
        };
        debug!(
            path = %path.display(),
            width = metrics.width,
            height = metrics.height,
            "measured card image"
        );
        Ok(metrics)
    }
}

fn read_orientation(path: &Path) -> Option<u16> {
    let file = File::open(path).ok()?;
    let mut buf = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut buf).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field.value.get_uint(0).map(|val| val as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// Played as the card starts to turn over.
    Reveal,
    ScanFailure,
}

/// Short audio or haptic feedback. Failures are reported but never block a sequence.
pub trait CuePlayer: Send + Sync + 'static {
    fn play(&self, cue: Cue) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SilentCues;

impl CuePlayer for SilentCues {
    fn play(&self, _cue: Cue) -> Result<()> {
        Ok(())
    }
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalBell;

impl CuePlayer for TerminalBell {
    fn play(&self, cue: Cue) -> Result<()> {
        let bells: &[u8] = match cue {
            Cue::Reveal => b"\x07",
            Cue::ScanFailure => b"\x07\x07",
        };
        let mut stderr = std::io::stderr().lock();
        stderr.write_all(bells)?;
        stderr.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealStage {
    Attention,
    Flip,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RevealPhase {
    Idle,
    Preparing,
    Revealing {
        stage: RevealStage,
        layout: RevealLayout,
    },
    Done,
}

type Completion = Box<dyn FnOnce(RevealLayout) + Send + 'static>;

/// Runs the timed card reveal: `Idle -> Preparing -> Revealing -> Done -> Idle`.
///
/// Rules:
/// - `Preparing` waits for the image metrics, bounded by `asset-timeout`; a failed or slow
///   probe falls back to the default aspect ratio.
/// - `Revealing` runs the attention stage then the flip stage, both fixed durations. The
///   reveal cue plays at the boundary; cue errors are logged and ignored.
/// - The completion callback runs at most once per `begin`, and never after `cancel`,
///   a superseding `begin`, or drop.
///
/// `begin` spawns onto the current tokio runtime.
pub struct RevealSequencer {
    config: RevealConfig,
    probe: Arc<dyn AssetProbe>,
    cues: Arc<dyn CuePlayer>,
    phase_tx: watch::Sender<RevealPhase>,
    active: Option<ActiveReveal>,
}

struct ActiveReveal {
    token: CancellationToken,
    completion: Arc<Mutex<Option<Completion>>>,
    task: JoinHandle<()>,
}

impl RevealSequencer {
    pub fn new(
        config: RevealConfig,
        probe: Arc<dyn AssetProbe>,
        cues: Arc<dyn CuePlayer>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(RevealPhase::Idle);
        Self {
            config,
            probe,
            cues,
            phase_tx,
            active: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RevealPhase> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> RevealPhase {
        *self.phase_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    pub fn begin<F>(&mut self, image: impl Into<String>, on_complete: F)
    where
        F: FnOnce(RevealLayout) + Send + 'static,
    {
        if self.is_running() {
            debug!("reveal superseded by a new card");
        }
        self.cancel();

        let image = image.into();
        let token = CancellationToken::new();
        let completion: Arc<Mutex<Option<Completion>>> =
            Arc::new(Mutex::new(Some(Box::new(on_complete))));
        let run = Sequence {
            config: self.config.clone(),
            probe: Arc::clone(&self.probe),
            cues: Arc::clone(&self.cues),
            phase_tx: self.phase_tx.clone(),
            token: token.clone(),
            completion: Arc::clone(&completion),
        };
        set_phase(&self.phase_tx, &token, RevealPhase::Preparing);
        let task = tokio::spawn(run.run(image));
        self.active = Some(ActiveReveal {
            token,
            completion,
            task,
        });
    }

    /// Tear down the running sequence, if any. Its completion will not fire.
    pub fn cancel(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.token.cancel();
        let pending = take_completion(&active.completion);
        active.task.abort();
        if pending.is_some() {
            debug!("reveal cancelled before completion");
        }
        self.phase_tx.send_if_modified(|phase| {
            if *phase == RevealPhase::Idle {
                return false;
            }
            *phase = RevealPhase::Idle;
            true
        });
    }
}

impl Drop for RevealSequencer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for RevealSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevealSequencer")
            .field("phase", &self.phase())
            .field("running", &self.is_running())
            .finish()
    }
}

struct Sequence {
    config: RevealConfig,
    probe: Arc<dyn AssetProbe>,
    cues: Arc<dyn CuePlayer>,
    phase_tx: watch::Sender<RevealPhase>,
    token: CancellationToken,
    completion: Arc<Mutex<Option<Completion>>>,
}

impl Sequence {
    async fn run(self, image: String) {
        let layout = select! {
            biased;
            _ = self.token.cancelled() => return,
            layout = prepare(&image, &self.config, &self.probe) => layout,
        };

        self.enter(RevealPhase::Revealing {
            stage: RevealStage::Attention,
            layout,
        });
        if !self.pause(self.config.attention).await {
            return;
        }

        if self.config.cue {
            if let Err(err) = self.cues.play(Cue::Reveal) {
                debug!("reveal cue failed: {err:#}");
            }
        }
        self.enter(RevealPhase::Revealing {
            stage: RevealStage::Flip,
            layout,
        });
        if !self.pause(self.config.flip).await {
            return;
        }

        // whoever takes the callback first wins; a concurrent cancel leaves nothing here
        let Some(on_complete) = take_completion(&self.completion) else {
            return;
        };
        self.enter(RevealPhase::Done);
        debug!(
            image = %image,
            aspect_ratio = layout.aspect_ratio,
            measured = layout.measured,
            "reveal complete"
        );
        on_complete(layout);
        self.enter(RevealPhase::Idle);
    }

    fn enter(&self, phase: RevealPhase) {
        set_phase(&self.phase_tx, &self.token, phase);
    }

    /// Sleep for `duration`; false when cancelled first.
    async fn pause(&self, duration: std::time::Duration) -> bool {
        select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}

async fn prepare(image: &str, config: &RevealConfig, probe: &Arc<dyn AssetProbe>) -> RevealLayout {
    let fallback = RevealLayout::fallback(config.default_aspect_ratio);
    let reference = image.to_string();
    let probe = Arc::clone(probe);
    let measure = tokio::task::spawn_blocking(move || probe.measure(&reference));
    match tokio::time::timeout(config.asset_timeout, measure).await {
        Ok(Ok(Ok(metrics))) => match metrics.aspect_ratio() {
            Some(aspect_ratio) => RevealLayout {
                aspect_ratio,
                measured: true,
            },
            None => {
                warn!(image, "card image has no area; using default layout");
                fallback
            }
        },
        Ok(Ok(Err(err))) => {
            warn!(image, "failed to measure card image: {err:#}");
            fallback
        }
        Ok(Err(err)) => {
            warn!(image, "card image probe panicked: {err}");
            fallback
        }
        Err(_) => {
            warn!(image, timeout = ?config.asset_timeout, "card image probe timed out");
            fallback
        }
    }
}

/// Publish `phase` unless `token` is cancelled. Checked under the channel lock so a
/// cancelled sequence can never overwrite the reset published by `cancel`.
fn set_phase(tx: &watch::Sender<RevealPhase>, token: &CancellationToken, phase: RevealPhase) {
    tx.send_if_modified(|current| {
        if token.is_cancelled() || *current == phase {
            return false;
        }
        *current = phase;
        true
    });
}

fn take_completion(slot: &Mutex<Option<Completion>>) -> Option<Completion> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FixedProbe(AssetMetrics);

    impl AssetProbe for FixedProbe {
        fn measure(&self, _reference: &str) -> Result<AssetMetrics> {
            Ok(self.0)
        }
    }

    struct BrokenProbe;

    impl AssetProbe for BrokenProbe {
        fn measure(&self, reference: &str) -> Result<AssetMetrics> {
            anyhow::bail!("no such image {reference}")
        }
    }

    struct SlowProbe(Duration);

    impl AssetProbe for SlowProbe {
        fn measure(&self, _reference: &str) -> Result<AssetMetrics> {
            std::thread::sleep(self.0);
            Ok(AssetMetrics {
                width: 1,
                height: 1,
            })
        }
    }

    #[derive(Default)]
    struct BlockedCues(AtomicUsize);

    impl CuePlayer for Arc<BlockedCues> {
        fn play(&self, _cue: Cue) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("playback blocked by autoplay policy")
        }
    }

    fn timings(attention_ms: u64, flip_ms: u64) -> RevealConfig {
        RevealConfig {
            attention: Duration::from_millis(attention_ms),
            flip: Duration::from_millis(flip_ms),
            asset_timeout: Duration::from_millis(100),
            ..RevealConfig::default()
        }
    }

    fn sequencer(config: RevealConfig, probe: impl AssetProbe) -> RevealSequencer {
        RevealSequencer::new(config, Arc::new(probe), Arc::new(SilentCues))
    }

    fn portrait() -> FixedProbe {
        FixedProbe(AssetMetrics {
            width: 300,
            height: 400,
        })
    }

    #[tokio::test]
    async fn completes_once_with_measured_layout() {
        let mut seq = sequencer(timings(20, 20), portrait());
        let (tx, mut rx) = mpsc::unbounded_channel();
        seq.begin("/C001.webp", move |layout| {
            tx.send(layout).unwrap();
        });

        let layout = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reveal should finish")
            .expect("completion sender dropped early");
        assert!(layout.measured);
        assert!((layout.aspect_ratio - 0.75).abs() < f32::EPSILON);
        assert!(
            rx.recv().await.is_none(),
            "completion must fire exactly once"
        );
        assert_eq!(seq.phase(), RevealPhase::Idle);
    }

    #[tokio::test]
    async fn broken_asset_uses_default_layout() {
        let mut config = timings(10, 10);
        config.default_aspect_ratio = 0.5;
        let mut seq = sequencer(config, BrokenProbe);
        let (tx, mut rx) = mpsc::unbounded_channel();
        seq.begin("/missing.webp", move |layout| {
            let _ = tx.send(layout);
        });
        let layout = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(layout, RevealLayout::fallback(0.5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_asset_does_not_stall_the_reveal() {
        let mut seq = sequencer(timings(10, 10), SlowProbe(Duration::from_millis(600)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        seq.begin("/slow.webp", move |layout| {
            let _ = tx.send(layout);
        });
        let layout = tokio::time::timeout(Duration::from_millis(450), rx.recv())
            .await
            .expect("timeout should fall back to the default layout")
            .unwrap();
        assert!(!layout.measured);
    }

    #[tokio::test]
    async fn cue_failure_is_swallowed() {
        let cues = Arc::new(BlockedCues::default());
        let mut seq = RevealSequencer::new(
            timings(10, 10),
            Arc::new(portrait()),
            Arc::new(Arc::clone(&cues)),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        seq.begin("/C001.webp", move |_| {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cues.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_done_suppresses_completion() {
        let mut seq = sequencer(timings(100, 100), portrait());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        seq.begin("/C001.webp", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(30)).await;
        seq.cancel();
        seq.cancel();
        assert_eq!(seq.phase(), RevealPhase::Idle);
        sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(seq.phase(), RevealPhase::Idle);
    }

    #[tokio::test]
    async fn dropping_the_sequencer_tears_down() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let mut seq = sequencer(timings(50, 50), portrait());
            let counter = Arc::clone(&fired);
            seq.begin("/C001.webp", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_begin_supersedes_running_sequence() {
        let mut seq = sequencer(timings(60, 60), portrait());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        seq.begin("/first.webp", move |_| {
            let _ = first.send("first");
        });
        sleep(Duration::from_millis(20)).await;
        seq.begin("/second.webp", move |_| {
            let _ = tx.send("second");
        });
        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done, "second");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn phases_advance_in_order() {
        let mut seq = sequencer(timings(200, 200), portrait());
        let phases = seq.subscribe();
        seq.begin("/C001.webp", |_| {});

        sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            *phases.borrow(),
            RevealPhase::Revealing {
                stage: RevealStage::Attention,
                ..
            }
        ));
        sleep(Duration::from_millis(220)).await;
        assert!(matches!(
            *phases.borrow(),
            RevealPhase::Revealing {
                stage: RevealStage::Flip,
                ..
            }
        ));
        sleep(Duration::from_millis(300)).await;
        assert_eq!(*phases.borrow(), RevealPhase::Idle);
        assert!(!seq.is_running());
    }
}
