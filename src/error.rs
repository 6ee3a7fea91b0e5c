use thiserror::Error;

/// Failures reported by a scan capability. The display text is shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// Device enumeration came back empty.
    #[error(
        "No cameras found on this device. Please ensure you have a camera connected and enabled."
    )]
    NoCamera,

    #[error("Camera access denied. Please allow camera permission and try again.")]
    PermissionDenied,

    /// A device was listed but could not be opened.
    #[error(
        "No camera found. Please ensure a camera is connected and not in use by another application."
    )]
    DeviceNotFound,

    #[error("Failed to start camera: {0}")]
    Start(String),

    /// The capability stopped delivering after it had started.
    #[error("Scanner stopped: {0}")]
    Interrupted(String),
}

impl ScanError {
    /// Map a raw driver message onto a user-facing error.
    pub fn classify(message: &str) -> Self {
        if message.contains("Permission denied") || message.contains("NotAllowedError") {
            ScanError::PermissionDenied
        } else if message.contains("NotFoundError") {
            ScanError::DeviceNotFound
        } else if message.trim().is_empty() {
            ScanError::Start("Could not start scanner.".into())
        } else {
            ScanError::Start(message.to_string())
        }
    }
}

/// Errors from the durable history storage boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("unsupported history version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    /// Failure injected by an in-memory backend.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
