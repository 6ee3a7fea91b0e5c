use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::tasks::scanner::{CameraDevice, CameraFacing};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct RevealConfig {
    /// Length of the "attention" stage shown before the card turns over.
    #[serde(with = "humantime_serde")]
    pub attention: Duration,
    /// Length of the flip stage.
    #[serde(with = "humantime_serde")]
    pub flip: Duration,
    /// Upper bound on measuring the card image before falling back to the default layout.
    #[serde(with = "humantime_serde")]
    pub asset_timeout: Duration,
    /// Width / height used when the image cannot be measured.
    pub default_aspect_ratio: f32,
    /// Play a short cue when the flip starts.
    pub cue: bool,
}

impl RevealConfig {
    const fn default_attention() -> Duration {
        Duration::from_millis(600)
    }

    const fn default_flip() -> Duration {
        Duration::from_millis(700)
    }

    const fn default_asset_timeout() -> Duration {
        Duration::from_secs(3)
    }

    pub const fn default_aspect_ratio() -> f32 {
        0.75
    }

    /// Total time spent in the revealing phase.
    pub fn total(&self) -> Duration {
        self.attention + self.flip
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.attention.is_zero(),
            "reveal.attention must be greater than zero"
        );
        ensure!(
            !self.flip.is_zero(),
            "reveal.flip must be greater than zero"
        );
        ensure!(
            !self.asset_timeout.is_zero(),
            "reveal.asset-timeout must be greater than zero"
        );
        ensure!(
            self.default_aspect_ratio.is_finite() && self.default_aspect_ratio > 0.0,
            "reveal.default-aspect-ratio must be a positive number"
        );
        Ok(())
    }
}

impl Default for RevealConfig {
    fn default() -> Self {
        Self {
            attention: Self::default_attention(),
            flip: Self::default_flip(),
            asset_timeout: Self::default_asset_timeout(),
            default_aspect_ratio: Self::default_aspect_ratio(),
            cue: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ScannerConfig {
    pub preferred_facing: CameraFacing,
    /// Capture devices offered to the scanner, in enumeration order.
    pub devices: Vec<CameraDevice>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            preferred_facing: CameraFacing::Environment,
            devices: vec![CameraDevice {
                id: "wedge0".into(),
                label: "keyboard wedge (back)".into(),
            }],
        }
    }
}

impl ScannerConfig {
    fn validate(&self) -> Result<()> {
        for device in &self.devices {
            ensure!(
                !device.id.trim().is_empty(),
                "scanner.devices entries must have a non-empty id"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// External catalog YAML; the built-in case file is used when absent.
    pub catalog_path: Option<PathBuf>,
    /// Directory that card image references are resolved against.
    pub asset_root: PathBuf,
    /// Where scan history is kept between sessions; in-memory only when absent.
    pub history_path: Option<PathBuf>,
    /// How long a transient error stays on screen.
    #[serde(with = "humantime_serde")]
    pub error_display: Duration,
    pub reveal: RevealConfig,
    pub scanner: ScannerConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            catalog_path: None,
            asset_root: PathBuf::from("assets"),
            history_path: None,
            error_display: Self::default_error_display(),
            reveal: RevealConfig::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

impl Configuration {
    const fn default_error_display() -> Duration {
        Duration::from_secs(5)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.error_display.is_zero(),
            "error-display must be greater than zero"
        );
        ensure!(
            !self.asset_root.as_os_str().is_empty(),
            "asset-root must not be empty"
        );
        if let Some(path) = &self.history_path {
            ensure!(
                path.file_name().is_some(),
                "history-path must include a file name"
            );
        }
        self.reveal
            .validate()
            .context("invalid reveal configuration")?;
        self.scanner
            .validate()
            .context("invalid scanner configuration")?;
        Ok(self)
    }
}
