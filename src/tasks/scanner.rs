use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use tokio::sync::mpsc::{Sender, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::events::{ScanEvent, ScanEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraFacing {
    /// Rear camera, pointed at the card.
    #[default]
    Environment,
    User,
}

impl CameraFacing {
    fn label_hint(self) -> &'static str {
        match self {
            CameraFacing::Environment => "back",
            CameraFacing::User => "front",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
}

/// Prefer a device whose label mentions the requested side, else the first one listed.
pub fn select_device(devices: &[CameraDevice], facing: CameraFacing) -> Option<&CameraDevice> {
    let hint = facing.label_hint();
    devices
        .iter()
        .find(|device| device.label.to_ascii_lowercase().contains(hint))
        .or_else(|| devices.first())
}

/// Hardware-backed producer of decoded QR payloads.
///
/// A started session delivers `ScanEvent`s tagged with its session id until the
/// returned handle is stopped or dropped.
pub trait ScanCapability: Send {
    fn start(
        &mut self,
        facing: CameraFacing,
        events: Sender<ScanEvent>,
    ) -> Result<ScanHandle, ScanError>;
}

type Release = Box<dyn FnOnce() + Send + 'static>;

/// Running scan session. Stopping is idempotent and also happens on drop.
pub struct ScanHandle {
    session: u64,
    token: CancellationToken,
    release: Mutex<Option<Release>>,
}

impl ScanHandle {
    pub fn new(session: u64, token: CancellationToken) -> Self {
        Self {
            session,
            token,
            release: Mutex::new(None),
        }
    }

    /// Run `release` on the first stop, to hand the device back.
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Mutex::new(Some(Box::new(release)));
        self
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            debug!(session = self.session, "stopping scan session");
            self.token.cancel();
        }
        let release = self
            .release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(release) = release {
            release();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanHandle")
            .field("session", &self.session)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Scanner for keyboard-wedge readers, which type each decoded payload as a line of text.
///
/// Clones share the same device; the console feeds lines in, the controller starts and
/// stops sessions. Text fed while no session is running is dropped.
#[derive(Debug, Clone)]
pub struct WedgeScanner {
    devices: Vec<CameraDevice>,
    state: Arc<Mutex<WedgeState>>,
}

#[derive(Debug, Default)]
struct WedgeState {
    next_session: u64,
    active: Option<ActiveSession>,
    /// Raw driver message reported while idle; the next start fails with it.
    fault: Option<String>,
}

#[derive(Debug)]
struct ActiveSession {
    session: u64,
    device: String,
    events: Sender<ScanEvent>,
    token: CancellationToken,
}

impl ActiveSession {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.events.is_closed()
    }
}

impl WedgeScanner {
    pub fn new(devices: Vec<CameraDevice>) -> Self {
        Self {
            devices,
            state: Arc::new(Mutex::new(WedgeState::default())),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock()
            .active
            .as_ref()
            .is_some_and(ActiveSession::is_live)
    }

    /// Deliver one decoded payload. Returns whether a live session accepted it.
    pub fn feed(&self, text: &str) -> bool {
        self.deliver(ScanEventKind::Decoded(text.to_string()))
    }

    /// Report that the device stopped working mid-session.
    pub fn fail(&self, reason: &str) -> bool {
        let kind = ScanEventKind::Failed(ScanError::Interrupted(reason.to_string()));
        self.deliver(kind)
    }

    /// Record a raw device error seen while no session is running.
    ///
    /// The next `start` is refused with the classified error; later starts proceed.
    pub fn report_fault(&self, raw: &str) {
        warn!(reason = raw, "scanner fault recorded");
        self.lock().fault = Some(raw.to_string());
    }

    fn deliver(&self, kind: ScanEventKind) -> bool {
        let mut state = self.lock();
        let target = state
            .active
            .as_ref()
            .map(|active| (active.session, active.events.clone(), active.is_live()));
        let Some((session, events, live)) = target else {
            debug!("scanner inactive; input ignored");
            return false;
        };
        if !live {
            state.active = None;
            debug!(session, "scan session already stopped; input ignored");
            return false;
        }
        match events.try_send(ScanEvent { session, kind }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session, "scan event queue full; input dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                state.active = None;
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, WedgeState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<WedgeState>) -> MutexGuard<'_, WedgeState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScanCapability for WedgeScanner {
    fn start(
        &mut self,
        facing: CameraFacing,
        events: Sender<ScanEvent>,
    ) -> Result<ScanHandle, ScanError> {
        let device = select_device(&self.devices, facing)
            .ok_or(ScanError::NoCamera)?
            .clone();
        let mut state = self.lock();
        if let Some(raw) = state.fault.take() {
            let err = ScanError::classify(&raw);
            warn!(device = %device.id, "scanner refused to start: {err}");
            return Err(err);
        }
        if let Some(previous) = state.active.take() {
            previous.token.cancel();
        }
        state.next_session += 1;
        let session = state.next_session;
        let token = CancellationToken::new();
        info!(
            session,
            device = %device.id,
            label = %device.label,
            ?facing,
            "scan session started"
        );
        state.active = Some(ActiveSession {
            session,
            device: device.id,
            events,
            token: token.clone(),
        });

        // a superseded handle must not clear the session that replaced it
        let shared = Arc::clone(&self.state);
        let release = move || {
            let mut state = lock_state(&shared);
            if state.active.as_ref().is_some_and(|a| a.session == session) {
                state.active = None;
            }
        };
        Ok(ScanHandle::new(session, token).with_release(release))
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        debug!(session = self.session, device = %self.device, "scan session released");
    }
}
