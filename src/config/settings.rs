//! PTT settings, defaults, TOML persistence and environment overrides.
//!
//! [`PttConfig`] implements `Serialize`, `Deserialize`, `Default` and `Clone`
//! so it can be round-tripped through a TOML file and shared across threads.
//!
//! The six keys read by the recorder can also be supplied through the
//! environment, which wins over the file:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PTT_MODE` | [`PttConfig::mode`] |
//! | `PTT_KEY_COMBO` | [`PttConfig::key_combo`] |
//! | `PTT_CANCEL_KEY` | [`PttConfig::cancel_key`] |
//! | `PTT_TIMEOUT` | [`PttConfig::timeout_secs`] |
//! | `PTT_MIN_DURATION` | [`PttConfig::min_duration_secs`] |
//! | `SILENCE_THRESHOLD_MS` | [`PttConfig::silence_threshold_ms`] |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::ptt::{PttError, DEFAULT_COMPLETION_GRACE};

/// Upper bound for every seconds-valued setting (one day).
const MAX_SECONDS: f64 = 86_400.0;

// ---------------------------------------------------------------------------
// PttMode
// ---------------------------------------------------------------------------

/// How the key combination gates recording.
///
/// | Variant | Start | Stop |
/// |---------|-------|------|
/// | Hold    | combo pressed | combo released (not before `min_duration`) |
/// | Toggle  | first press   | next press |
/// | Hybrid  | combo pressed | release, or silence after speech |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PttMode {
    Hold,
    Toggle,
    Hybrid,
}

impl Default for PttMode {
    fn default() -> Self {
        Self::Hold
    }
}

impl PttMode {
    /// `true` when a key release ends the recording.
    pub fn stops_on_release(self) -> bool {
        matches!(self, PttMode::Hold | PttMode::Hybrid)
    }
}

impl fmt::Display for PttMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PttMode::Hold => write!(f, "hold"),
            PttMode::Toggle => write!(f, "toggle"),
            PttMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for PttMode {
    type Err = PttError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hold" => Ok(PttMode::Hold),
            "toggle" => Ok(PttMode::Toggle),
            "hybrid" => Ok(PttMode::Hybrid),
            other => Err(PttError::Configuration(format!(
                "invalid PTT mode {other:?} (expected hold, toggle or hybrid)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// PttConfig
// ---------------------------------------------------------------------------

/// Push-to-talk configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use ptt_voice::config::PttConfig;
///
/// let mut config = PttConfig::load().unwrap();
/// config.apply_env_overrides().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PttConfig {
    /// Gating mode.
    pub mode: PttMode,
    /// Key combination, `+`-separated (e.g. `"ctrl+shift+space"`).
    pub key_combo: String,
    /// Key that aborts the current recording.  `None` disables it.
    pub cancel_key: Option<String>,
    /// Upper bound on a single recording in seconds.
    pub timeout_secs: f64,
    /// Minimum recording length in seconds (hold / hybrid release).
    pub min_duration_secs: f64,
    /// Trailing silence that ends a hybrid-mode recording.
    pub silence_threshold_ms: u64,
    /// Retry budget for keyboard and audio initialisation failures.
    pub max_retries: u32,
    /// Energy VAD aggressiveness, `0` (lenient) to `3` (strict).
    pub vad_aggressiveness: u8,
    /// Extra time the caller waits beyond `timeout_secs` before giving up.
    pub completion_grace_secs: f64,
}

impl Default for PttConfig {
    fn default() -> Self {
        Self {
            mode: PttMode::default(),
            key_combo: "ctrl+space".into(),
            cancel_key: Some("Escape".into()),
            timeout_secs: 60.0,
            min_duration_secs: 0.5,
            silence_threshold_ms: 1_500,
            max_retries: 3,
            vad_aggressiveness: 2,
            completion_grace_secs: DEFAULT_COMPLETION_GRACE.as_secs_f64(),
        }
    }
}

impl PttConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(PttConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the seconds-valued fields.
    ///
    /// Each must be finite and within `0..=86400`.
    pub fn validate(&self) -> Result<(), PttError> {
        check_seconds("timeout_secs", self.timeout_secs)?;
        check_seconds("min_duration_secs", self.min_duration_secs)?;
        check_seconds("completion_grace_secs", self.completion_grace_secs)?;
        Ok(())
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `PTT_*` / `SILENCE_THRESHOLD_MS` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), PttError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Unset keys leave the field untouched.  A value that does not parse is
    /// a [`PttError::Configuration`].  An empty `PTT_CANCEL_KEY` disables the
    /// cancel key.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), PttError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("PTT_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(combo) = lookup("PTT_KEY_COMBO") {
            self.key_combo = combo;
        }
        if let Some(cancel) = lookup("PTT_CANCEL_KEY") {
            self.cancel_key = if cancel.trim().is_empty() {
                None
            } else {
                Some(cancel)
            };
        }
        if let Some(timeout) = lookup("PTT_TIMEOUT") {
            self.timeout_secs = parse_seconds("PTT_TIMEOUT", &timeout)?;
        }
        if let Some(min) = lookup("PTT_MIN_DURATION") {
            self.min_duration_secs = parse_seconds("PTT_MIN_DURATION", &min)?;
        }
        if let Some(silence) = lookup("SILENCE_THRESHOLD_MS") {
            self.silence_threshold_ms = silence.trim().parse().map_err(|_| {
                PttError::Configuration(format!(
                    "SILENCE_THRESHOLD_MS must be a whole number of milliseconds, got {silence:?}"
                ))
            })?;
        }
        Ok(())
    }

    /// Maximum recording length as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs)
    }

    /// Minimum recording length as a [`Duration`].
    pub fn min_duration(&self) -> Duration {
        seconds(self.min_duration_secs)
    }

    /// Hybrid-mode silence threshold as a [`Duration`].
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    /// Grace period added to the caller's wait.
    pub fn completion_grace(&self) -> Duration {
        seconds(self.completion_grace_secs)
    }
}

fn check_seconds(key: &str, value: f64) -> Result<f64, PttError> {
    if value.is_finite() && (0.0..=MAX_SECONDS).contains(&value) {
        Ok(value)
    } else {
        Err(PttError::Configuration(format!(
            "{key} must be between 0 and {MAX_SECONDS} seconds, got {value}"
        )))
    }
}

fn parse_seconds(key: &str, raw: &str) -> Result<f64, PttError> {
    let value = raw.trim().parse::<f64>().map_err(|_| {
        PttError::Configuration(format!("{key} must be a number of seconds, got {raw:?}"))
    })?;
    check_seconds(key, value)
}

/// Clamped conversion; NaN reads as zero.
fn seconds(value: f64) -> Duration {
    if value.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(value.clamp(0.0, MAX_SECONDS))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn default_values() {
        let cfg = PttConfig::default();
        assert_eq!(cfg.mode, PttMode::Hold);
        assert_eq!(cfg.key_combo, "ctrl+space");
        assert_eq!(cfg.cancel_key.as_deref(), Some("Escape"));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.silence_threshold_ms, 1_500);
        assert_eq!(cfg.timeout(), Duration::from_secs(60));
        assert_eq!(cfg.min_duration(), Duration::from_millis(500));
        assert_eq!(cfg.completion_grace(), Duration::from_secs(30));
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("settings.toml");

        let mut cfg = PttConfig::default();
        cfg.mode = PttMode::Hybrid;
        cfg.key_combo = "alt+f9".into();
        cfg.cancel_key = None;
        cfg.silence_threshold_ms = 900;

        cfg.save_to(&path).expect("save");
        let loaded = PttConfig::load_from(&path).expect("load");

        assert_eq!(loaded.mode, PttMode::Hybrid);
        assert_eq!(loaded.key_combo, "alt+f9");
        assert!(loaded.cancel_key.is_none());
        assert_eq!(loaded.silence_threshold_ms, 900);
    }

    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let cfg = PttConfig::load_from(&dir.path().join("missing.toml")).expect("load");
        assert_eq!(cfg.key_combo, PttConfig::default().key_combo);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "mode = \"toggle\"\n").expect("write");

        let cfg = PttConfig::load_from(&path).expect("load");
        assert_eq!(cfg.mode, PttMode::Toggle);
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = PttConfig::default();
        cfg.apply_overrides_from(lookup(&[
            ("PTT_MODE", "Toggle"),
            ("PTT_KEY_COMBO", "ctrl+alt+r"),
            ("PTT_CANCEL_KEY", ""),
            ("PTT_TIMEOUT", "12.5"),
            ("PTT_MIN_DURATION", "0.25"),
            ("SILENCE_THRESHOLD_MS", "800"),
        ]))
        .expect("overrides");

        assert_eq!(cfg.mode, PttMode::Toggle);
        assert_eq!(cfg.key_combo, "ctrl+alt+r");
        assert!(cfg.cancel_key.is_none());
        assert_eq!(cfg.timeout(), Duration::from_millis(12_500));
        assert_eq!(cfg.min_duration(), Duration::from_millis(250));
        assert_eq!(cfg.silence_threshold(), Duration::from_millis(800));
    }

    #[test]
    fn invalid_mode_is_configuration_error() {
        let mut cfg = PttConfig::default();
        let err = cfg
            .apply_overrides_from(lookup(&[("PTT_MODE", "sometimes")]))
            .unwrap_err();
        assert!(matches!(err, PttError::Configuration(_)));
        assert_eq!(cfg.mode, PttMode::Hold);
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let mut cfg = PttConfig::default();
        let err = cfg
            .apply_overrides_from(lookup(&[("PTT_TIMEOUT", "-1")]))
            .unwrap_err();
        assert!(matches!(err, PttError::Configuration(_)));
    }

    #[test]
    fn oversized_timeout_override_is_rejected() {
        let mut cfg = PttConfig::default();
        let err = cfg
            .apply_overrides_from(lookup(&[("PTT_TIMEOUT", "1e30")]))
            .unwrap_err();
        assert!(matches!(err, PttError::Configuration(_)));
        assert_eq!(cfg.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn non_finite_seconds_in_file_are_rejected() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        for line in ["timeout_secs = inf", "min_duration_secs = nan", "completion_grace_secs = 1e300"] {
            std::fs::write(&path, format!("{line}\n")).expect("write");
            let err = PttConfig::load_from(&path).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<PttError>(), Some(PttError::Configuration(_))),
                "{line}: {err}"
            );
        }
    }

    #[test]
    fn duration_accessors_never_panic() {
        let cfg = PttConfig {
            timeout_secs: f64::INFINITY,
            min_duration_secs: f64::NAN,
            completion_grace_secs: -3.0,
            ..PttConfig::default()
        };
        assert_eq!(cfg.timeout(), Duration::from_secs(86_400));
        assert_eq!(cfg.min_duration(), Duration::ZERO);
        assert_eq!(cfg.completion_grace(), Duration::ZERO);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mode_display_round_trips_through_from_str() {
        for mode in [PttMode::Hold, PttMode::Toggle, PttMode::Hybrid] {
            assert_eq!(mode.to_string().parse::<PttMode>().unwrap(), mode);
        }
        assert!(PttMode::Hold.stops_on_release());
        assert!(!PttMode::Toggle.stops_on_release());
    }
}
