//! config: optional `pole-overlay.toml`
//!
//! Every key is optional and falls back to the built-in default.  Loading
//! looks at `$POLE_OVERLAY_CONFIG` first, then `pole-overlay.toml` in the
//! working directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::rendering::{Font, LabelStyle, OverlayOptions, Palette, DEFAULT_SETTLE_DELAY};

pub const DEFAULT_CONFIG_NAME: &str = "pole-overlay.toml";
pub const CONFIG_ENV: &str = "POLE_OVERLAY_CONFIG";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Uploads and video downloads get a longer budget.
    pub upload_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
            upload_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayConfig {
    pub settle_delay_ms: u64,
    pub line_width: f64,
    pub font_size: f64,
    pub font_family: String,
    pub label_padding: f64,
    /// Label name → `#RRGGBB`, applied over the built-in palette.
    pub palette: BTreeMap<String, String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        let style = LabelStyle::default();
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            line_width: style.line_width,
            font_size: style.font.size_px,
            font_family: style.font.family,
            label_padding: style.padding,
            palette: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryConfig {
    pub capacity: usize,
    /// Directory holding `uploadHistory.json`.
    pub path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: crate::history::DEFAULT_CAPACITY,
            path: PathBuf::from(".pole-overlay"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: crate::cache::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub api: ApiConfig,
    pub overlay: OverlayConfig,
    pub history: HistoryConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    api: Option<ApiSection>,
    overlay: Option<OverlaySection>,
    history: Option<HistorySection>,
    cache: Option<CacheSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiSection {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    upload_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OverlaySection {
    settle_delay_ms: Option<u64>,
    line_width: Option<f64>,
    font_size: Option<f64>,
    font_family: Option<String>,
    label_padding: Option<f64>,
    palette: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HistorySection {
    capacity: Option<usize>,
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CacheSection {
    capacity: Option<usize>,
}

impl Config {
    /// Config from `explicit`, else `$POLE_OVERLAY_CONFIG`, else
    /// `./pole-overlay.toml`, else defaults.  A named file that is missing
    /// or invalid is an error; the implicit one is only read if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::from_path(Path::new(&path));
        }
        let implicit = Path::new(DEFAULT_CONFIG_NAME);
        if implicit.is_file() {
            return Self::from_path(implicit);
        }
        debug!("no config file found; using defaults");
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config = Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw).context("invalid config TOML")?;
        let config = Self::from_file(file);
        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile) -> Self {
        let defaults = Config::default();
        let api = file.api.unwrap_or_default();
        let overlay = file.overlay.unwrap_or_default();
        let history = file.history.unwrap_or_default();
        let cache = file.cache.unwrap_or_default();

        Config {
            api: ApiConfig {
                base_url: api
                    .base_url
                    .filter(|url| !url.trim().is_empty())
                    .unwrap_or(defaults.api.base_url),
                timeout_secs: api.timeout_secs.unwrap_or(defaults.api.timeout_secs),
                upload_timeout_secs: api
                    .upload_timeout_secs
                    .unwrap_or(defaults.api.upload_timeout_secs),
            },
            overlay: OverlayConfig {
                settle_delay_ms: overlay
                    .settle_delay_ms
                    .unwrap_or(defaults.overlay.settle_delay_ms),
                line_width: overlay.line_width.unwrap_or(defaults.overlay.line_width),
                font_size: overlay.font_size.unwrap_or(defaults.overlay.font_size),
                font_family: overlay
                    .font_family
                    .filter(|family| !family.trim().is_empty())
                    .unwrap_or(defaults.overlay.font_family),
                label_padding: overlay.label_padding.unwrap_or(defaults.overlay.label_padding),
                palette: overlay.palette.unwrap_or_default(),
            },
            history: HistoryConfig {
                capacity: history.capacity.unwrap_or(defaults.history.capacity),
                path: history.path.map(PathBuf::from).unwrap_or(defaults.history.path),
            },
            cache: CacheConfig {
                capacity: cache.capacity.unwrap_or(defaults.cache.capacity),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://")) {
            bail!("api.base_url must start with http:// or https://, got `{}`", self.api.base_url);
        }
        if self.api.timeout_secs == 0 || self.api.upload_timeout_secs == 0 {
            bail!("api timeouts must be at least one second");
        }
        let positive = |name: &str, value: f64| -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                bail!("overlay.{name} must be a positive number, got {value}")
            }
        };
        positive("line_width", self.overlay.line_width)?;
        positive("font_size", self.overlay.font_size)?;
        if !(self.overlay.label_padding.is_finite() && self.overlay.label_padding >= 0.0) {
            bail!("overlay.label_padding must be zero or positive");
        }
        if self.history.capacity == 0 {
            bail!("history.capacity must be at least 1");
        }
        if self.cache.capacity == 0 {
            bail!("cache.capacity must be at least 1");
        }
        // Surfaces bad palette entries at load time rather than first paint.
        Palette::with_overrides(&self.overlay.palette)?;
        Ok(())
    }

    pub fn overlay_options(&self) -> Result<OverlayOptions> {
        Ok(OverlayOptions {
            palette: Palette::with_overrides(&self.overlay.palette)?,
            style: LabelStyle {
                line_width: self.overlay.line_width,
                font: Font::new(self.overlay.font_size, self.overlay.font_family.clone()),
                padding: self.overlay.label_padding,
                ..LabelStyle::default()
            },
            settle_delay: Duration::from_millis(self.overlay.settle_delay_ms),
        })
    }
}
