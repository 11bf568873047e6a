//! Configuration management for the RVU router.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use crate::locator::{SearchLimits, TitlePattern};
use crate::poller::PollIntervals;
use crate::tracker::TrackerSettings;
use crate::types::Integration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("polling intervals must satisfy fast <= medium <= slow, got {fast}/{medium}/{slow} ms")]
    IntervalOrder { fast: u64, medium: u64, slow: u64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid window title pattern '{pattern}' for {integration}: {source}")]
    TitlePattern {
        integration: Integration,
        pattern: String,
        source: glob::PatternError,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub integrations: IntegrationsConfig,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether detection runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval right after the tracked study changed
    #[serde(default = "default_fast_ms")]
    pub fast_ms: u64,

    /// Interval while a study is tracked
    #[serde(default = "default_medium_ms")]
    pub medium_ms: u64,

    /// Interval while no study is tracked
    #[serde(default = "default_slow_ms")]
    pub slow_ms: u64,

    /// How long after a change the interval is not allowed to grow
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_ms: default_fast_ms(),
            medium_ms: default_medium_ms(),
            slow_ms: default_slow_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl PollingConfig {
    pub fn intervals(&self) -> PollIntervals {
        PollIntervals {
            fast: Duration::from_millis(self.fast_ms),
            medium: Duration::from_millis(self.medium_ms),
            slow: Duration::from_millis(self.slow_ms),
            settle: Duration::from_millis(self.settle_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Seconds a study must stay on screen before it counts
    #[serde(default = "default_min_dwell")]
    pub min_dwell_seconds: u64,

    /// Longest gap between sightings before a pending study's dwell restarts
    #[serde(default = "default_max_gap")]
    pub max_gap_seconds: u64,

    /// Complete an active study when the router shuts down
    #[serde(default = "default_true")]
    pub complete_on_shutdown: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_dwell_seconds: default_min_dwell(),
            max_gap_seconds: default_max_gap(),
            complete_on_shutdown: true,
        }
    }
}

impl TrackerConfig {
    pub fn settings(&self) -> TrackerSettings {
        TrackerSettings {
            min_dwell: chrono::Duration::seconds(self.min_dwell_seconds as i64),
            max_gap: chrono::Duration::seconds(self.max_gap_seconds as i64),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Deadline for a single property read
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Deadline for a window scan or element search
    #[serde(default = "default_search_timeout")]
    pub search_timeout_ms: u64,

    /// Node cap for descendant walks
    #[serde(default = "default_broad_cap")]
    pub broad_walk_cap: usize,

    /// Node cap for list walks
    #[serde(default = "default_narrow_cap")]
    pub narrow_walk_cap: usize,

    /// Abandoned reads allowed to linger before new ones are refused
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout(),
            search_timeout_ms: default_search_timeout(),
            broad_walk_cap: default_broad_cap(),
            narrow_walk_cap: default_narrow_cap(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl ReaderConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn limits(&self) -> SearchLimits {
        SearchLimits {
            broad_cap: self.broad_walk_cap,
            narrow_cap: self.narrow_walk_cap,
            timeout: Duration::from_millis(self.search_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    /// Order extractors are tried in each cycle
    #[serde(default = "default_order")]
    pub order: Vec<Integration>,

    #[serde(default)]
    pub powerscribe: PowerScribeConfig,

    #[serde(default)]
    pub mosaic: MosaicConfig,

    #[serde(default)]
    pub clario: ClarioConfig,
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            order: default_order(),
            powerscribe: PowerScribeConfig::default(),
            mosaic: MosaicConfig::default(),
            clario: ClarioConfig::default(),
        }
    }
}

impl IntegrationsConfig {
    pub fn is_enabled(&self, integration: Integration) -> bool {
        match integration {
            Integration::PowerScribe => self.powerscribe.enabled,
            Integration::Mosaic => self.mosaic.enabled,
            Integration::Clario => self.clario.enabled,
        }
    }

    pub fn window_title(&self, integration: Integration) -> &str {
        match integration {
            Integration::PowerScribe => &self.powerscribe.window_title,
            Integration::Mosaic => &self.mosaic.window_title,
            Integration::Clario => &self.clario.window_title,
        }
    }

    /// Enabled integrations in configured order, without repeats
    pub fn enabled(&self) -> Vec<Integration> {
        let mut enabled = Vec::new();
        for integration in &self.order {
            if self.is_enabled(*integration) && !enabled.contains(integration) {
                enabled.push(*integration);
            }
        }
        enabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerScribeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Glob matched case-insensitively against top-level window titles
    #[serde(default = "default_powerscribe_title")]
    pub window_title: String,

    #[serde(default = "default_powerscribe_accession_id")]
    pub accession_id: String,

    #[serde(default = "default_powerscribe_procedure_id")]
    pub procedure_id: String,

    #[serde(default = "default_powerscribe_status_id")]
    pub status_id: String,
}

impl Default for PowerScribeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_title: default_powerscribe_title(),
            accession_id: default_powerscribe_accession_id(),
            procedure_id: default_powerscribe_procedure_id(),
            status_id: default_powerscribe_status_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mosaic_title")]
    pub window_title: String,

    /// Captions whose following text node holds an accession
    #[serde(default = "default_mosaic_accession_labels")]
    pub accession_labels: Vec<String>,

    /// Captions whose following text node holds the procedure
    #[serde(default = "default_mosaic_procedure_labels")]
    pub procedure_labels: Vec<String>,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_title: default_mosaic_title(),
            accession_labels: default_mosaic_accession_labels(),
            procedure_labels: default_mosaic_procedure_labels(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarioConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_clario_title")]
    pub window_title: String,

    /// Automation id of the worklist grid whose children are rows
    #[serde(default = "default_clario_worklist_id")]
    pub worklist_id: String,
}

impl Default for ClarioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_title: default_clario_title(),
            worklist_id: default_clario_worklist_id(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Rule document replacing the built-in table
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Append-only overlays applied in order
    #[serde(default)]
    pub overlays: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fast_ms() -> u64 {
    500
}

fn default_medium_ms() -> u64 {
    1000
}

fn default_slow_ms() -> u64 {
    2000
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_min_dwell() -> u64 {
    10
}

fn default_max_gap() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_search_timeout() -> u64 {
    2000
}

fn default_broad_cap() -> usize {
    1000
}

fn default_narrow_cap() -> usize {
    50
}

fn default_max_in_flight() -> usize {
    8
}

fn default_order() -> Vec<Integration> {
    vec![Integration::PowerScribe, Integration::Mosaic, Integration::Clario]
}

fn default_powerscribe_title() -> String {
    "*PowerScribe*".to_string()
}

fn default_powerscribe_accession_id() -> String {
    "labelAccession".to_string()
}

fn default_powerscribe_procedure_id() -> String {
    "labelProcDescription".to_string()
}

fn default_powerscribe_status_id() -> String {
    "labelReportStatus".to_string()
}

fn default_mosaic_title() -> String {
    "*Mosaic*".to_string()
}

fn default_mosaic_accession_labels() -> Vec<String> {
    vec!["Accession".to_string(), "Accession #".to_string(), "Acc #".to_string()]
}

fn default_mosaic_procedure_labels() -> Vec<String> {
    vec!["Procedure".to_string(), "Description".to_string(), "Exam".to_string()]
}

fn default_clario_title() -> String {
    "*Clario*".to_string()
}

fn default_clario_worklist_id() -> String {
    "worklistGrid".to_string()
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rvu-router")
        .join("shifts.db")
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(&Self::default_config_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rvu-router")
            .join("config.toml")
    }

    /// Reject settings the router cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let polling = &self.polling;
        for (value, name) in [
            (polling.fast_ms, "polling.fast_ms"),
            (polling.medium_ms, "polling.medium_ms"),
            (polling.slow_ms, "polling.slow_ms"),
            (self.reader.read_timeout_ms, "reader.read_timeout_ms"),
            (self.reader.search_timeout_ms, "reader.search_timeout_ms"),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if !(polling.fast_ms <= polling.medium_ms && polling.medium_ms <= polling.slow_ms) {
            return Err(ConfigError::IntervalOrder {
                fast: polling.fast_ms,
                medium: polling.medium_ms,
                slow: polling.slow_ms,
            });
        }
        for (value, name) in [
            (self.reader.broad_walk_cap, "reader.broad_walk_cap"),
            (self.reader.narrow_walk_cap, "reader.narrow_walk_cap"),
            (self.reader.max_in_flight, "reader.max_in_flight"),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        for integration in self.integrations.enabled() {
            self.title_pattern(integration)?;
        }
        Ok(())
    }

    /// Compiled window title pattern of an integration
    pub fn title_pattern(&self, integration: Integration) -> Result<TitlePattern, ConfigError> {
        let pattern = self.integrations.window_title(integration);
        TitlePattern::new(pattern).map_err(|source| ConfigError::TitlePattern {
            integration,
            pattern: pattern.to_string(),
            source,
        })
    }
}
