use anyhow::Context;
use diff_engine::{FilterChain, MergeOptions, Newline, PoolConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub comparison: ComparisonSettings,
    #[serde(default)]
    pub inline: InlineSettings,
    #[serde(default)]
    pub merge: MergeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonSettings {
    #[serde(default)]
    pub ignore_blank_lines: bool,
    #[serde(default = "default_text_filters")]
    pub text_filters: Vec<FilterSetting>,
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            ignore_blank_lines: false,
            text_filters: default_text_filters(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSetting {
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub pattern: String,
}

impl FilterSetting {
    fn inactive(name: &str, pattern: &str) -> Self {
        Self {
            name: name.into(),
            active: false,
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Chunks with more characters than this are highlighted as a whole.
    #[serde(default = "default_char_limit")]
    pub char_limit: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for InlineSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            char_limit: default_char_limit(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSettings {
    #[serde(default = "default_true")]
    pub auto_merge: bool,
    #[serde(default = "default_conflict_marker")]
    pub conflict_marker: String,
    #[serde(default)]
    pub newline: NewlineSetting,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            auto_merge: true,
            conflict_marker: default_conflict_marker(),
            newline: NewlineSetting::default(),
        }
    }
}

/// Newline used to join merge output. `auto` follows the base text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewlineSetting {
    #[default]
    Auto,
    Lf,
    Crlf,
    Cr,
}

impl NewlineSetting {
    pub fn resolve(self, base_text: &str) -> Newline {
        match self {
            NewlineSetting::Auto => Newline::detect(base_text).unwrap_or_default(),
            NewlineSetting::Lf => Newline::Lf,
            NewlineSetting::Crlf => Newline::CrLf,
            NewlineSetting::Cr => Newline::Cr,
        }
    }
}

fn default_text_filters() -> Vec<FilterSetting> {
    vec![
        FilterSetting::inactive("Script comment", "#.*"),
        FilterSetting::inactive("C++ comment", "//.*"),
        FilterSetting::inactive("C comment", r"/\*.*\*/"),
        FilterSetting::inactive("All whitespace", r"[ \t\r\f\v]*"),
        FilterSetting::inactive("Leading whitespace", r"^[ \t\r\f\v]*"),
        FilterSetting::inactive("Trailing whitespace", r"[ \t\r\f\v]*$"),
        FilterSetting::inactive("Whitespace change", r"[ \t\r\f\v]+"),
    ]
}
fn default_true() -> bool {
    true
}
fn default_char_limit() -> usize {
    diff_engine::inline::DEFAULT_CHAR_LIMIT
}
fn default_workers() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_shutdown_grace_ms() -> u64 {
    1000
}
fn default_conflict_marker() -> String {
    "(??)".into()
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Like [`Settings::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path).with_context(|| format!("failed to load settings from {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Compile the configured text filters.
    pub fn filter_chain(&self) -> anyhow::Result<FilterChain> {
        let filters = &self.comparison.text_filters;
        FilterChain::compile(
            filters
                .iter()
                .map(|f| (f.name.as_str(), f.pattern.as_str(), f.active)),
        )
        .context("invalid text filter in settings")
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.inline.workers,
            poll_interval: Duration::from_millis(self.inline.poll_interval_ms),
            shutdown_grace: Duration::from_millis(self.inline.shutdown_grace_ms),
        }
    }

    pub fn merge_options(&self, base_text: &str) -> MergeOptions {
        MergeOptions {
            marker: self.merge.conflict_marker.clone(),
            newline: self.merge.newline.resolve(base_text),
        }
    }
}
