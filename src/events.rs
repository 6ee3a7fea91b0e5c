use crate::error::ScanError;

/// Requests coming from the user-facing surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    RequestScan,
    CancelScan,
    RequestHistory,
    /// Open a history entry by card id.
    SelectEntry(String),
    Back,
    ClearHistory,
}

/// Emitted by a running scan session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    pub session: u64,
    pub kind: ScanEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEventKind {
    Decoded(String),
    Failed(ScanError),
}

/// Sent back to the controller when a reveal sequence finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealFinished {
    pub generation: u64,
}
