//! Configuration for saverbridge
//!
//! Loads configuration from TOML file at `~/.config/saverbridge/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub present: PresentConfig,
    pub screensaver: ScreensaverConfig,
    pub event_loop: EventLoopConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Parse a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config = Self::parse(&content)?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("saverbridge");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;
        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Capture side (X11)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// X display to capture, e.g. ":1". `$DISPLAY` when unset.
    pub display: Option<String>,
}

/// Presentation side (Wayland)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentConfig {
    /// Application id set on the top-level
    pub app_id: String,
    /// Ask the compositor to make the top-level fullscreen
    pub fullscreen: bool,
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            app_id: "saverbridge".to_string(),
            fullscreen: true,
        }
    }
}

/// How the screensaver child is told where to draw
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreensaverConfig {
    /// Environment variable carrying the target window id
    pub window_env: String,
    /// Argument telling the hack to draw into that window
    pub root_flag: String,
}

impl Default for ScreensaverConfig {
    fn default() -> Self {
        Self {
            window_env: "XSCREENSAVER_WINDOW".to_string(),
            root_flag: "--root".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Upper bound on one wait for readability, in milliseconds
    pub poll_timeout_ms: u16,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.capture.display, None);
        assert_eq!(config.present.app_id, "saverbridge");
        assert!(config.present.fullscreen);
        assert_eq!(config.screensaver.window_env, "XSCREENSAVER_WINDOW");
        assert_eq!(config.screensaver.root_flag, "--root");
        assert_eq!(config.event_loop.poll_timeout_ms, 30_000);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            [capture]
            display = ":3"

            [event_loop]
            poll_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.display.as_deref(), Some(":3"));
        assert_eq!(config.event_loop.poll_timeout_ms, 500);
        assert_eq!(config.present.app_id, "saverbridge");
        assert_eq!(config.screensaver.root_flag, "--root");
    }

    #[test]
    fn test_default_file_round_trips() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.present.app_id, "saverbridge");
        assert_eq!(parsed.event_loop.poll_timeout_ms, 30_000);
    }

    #[test]
    fn test_bad_timeout_is_rejected() {
        assert!(Config::parse("[event_loop]\npoll_timeout_ms = 70000\n").is_err());
    }
}
