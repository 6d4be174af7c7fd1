//! Configuration management for the verification service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use crate::settings::{EngineMode, SearchScope, VerificationSettings};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the verification service.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    /// Remote matching service configuration
    pub matcher: MatcherConfig,

    /// Capture cadence configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Network camera peripheral configuration
    #[serde(default)]
    pub peripheral: PeripheralConfig,

    /// Local camera device configuration
    #[serde(default)]
    pub device: DeviceConfig,

    /// Default verification settings
    #[serde(default)]
    pub verification: VerificationDefaults,

    /// Session behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote matching service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    /// Matcher base URL (e.g., "https://matcher.condo.local")
    pub endpoint: String,

    /// Path of the verification endpoint
    #[serde(default = "default_verify_path")]
    pub verify_path: String,

    /// Path of the health probe endpoint
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_matcher_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout for the fast engine in milliseconds
    #[serde(default = "default_fast_timeout_ms")]
    pub fast_timeout_ms: u64,

    /// Request timeout for the precise engine in milliseconds
    #[serde(default = "default_precise_timeout_ms")]
    pub precise_timeout_ms: u64,

    /// Health probe timeout in milliseconds
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
}

/// Scheduler cadence per source kind.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Tick interval while capturing from a local device
    #[serde(default = "default_local_interval_ms")]
    pub local_interval_ms: u64,

    /// Tick interval while capturing from a remote peripheral
    #[serde(default = "default_remote_interval_ms")]
    pub remote_interval_ms: u64,
}

/// Network camera peripheral configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PeripheralConfig {
    /// Default peripheral base URL (e.g., "http://192.168.1.40:8080")
    #[serde(default)]
    pub base_url: Option<String>,

    /// Snapshot request timeout in milliseconds
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,

    /// Reachability probe attempts on connect
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Base delay between probe attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between probe attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

/// Local camera device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Identifier used for the exclusive-access lease
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Device node (e.g., "/dev/video0"); autodetected when absent
    #[serde(default)]
    pub device_path: Option<String>,

    /// Encoded frame width
    #[serde(default = "default_width")]
    pub width: u32,

    /// Encoded frame height
    #[serde(default = "default_height")]
    pub height: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Maximum time to wait for a live picture in milliseconds
    #[serde(default = "default_grab_timeout_ms")]
    pub grab_timeout_ms: u64,
}

/// Verification settings applied when a session starts.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationDefaults {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default)]
    pub search_scope: SearchScope,

    #[serde(default)]
    pub engine_mode: EngineMode,
}

/// Session behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Source the runner starts with (local, remote, upload)
    #[serde(default = "default_source")]
    pub source: String,

    /// Image file verified once when `source = "upload"`
    #[serde(default)]
    pub upload_path: Option<String>,

    /// Consecutive scheduled failures before auto-pause (0 = never)
    #[serde(default)]
    pub max_consecutive_failures: u32,

    /// Interval between status log lines in seconds
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Operator label written to activity logs
    #[serde(default = "default_operator")]
    pub operator: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_verify_path() -> String {
    "/api/v1/face/verify".to_string()
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_matcher_connect_timeout_ms() -> u64 {
    3000
}
fn default_fast_timeout_ms() -> u64 {
    2000
}
fn default_precise_timeout_ms() -> u64 {
    10000
}
fn default_health_timeout_ms() -> u64 {
    3000
}
fn default_local_interval_ms() -> u64 {
    1500
}
fn default_remote_interval_ms() -> u64 {
    3000
}
fn default_snapshot_timeout_ms() -> u64 {
    5000
}
fn default_max_connect_attempts() -> u32 {
    3
}
fn default_reconnect_base_delay_ms() -> u64 {
    250
}
fn default_reconnect_max_delay_ms() -> u64 {
    2000
}
fn default_device_id() -> String {
    "default".to_string()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_grab_timeout_ms() -> u64 {
    1000
}
fn default_confidence_threshold() -> f32 {
    70.0
}
fn default_source() -> String {
    "local".to_string()
}
fn default_status_interval() -> u64 {
    30
}
fn default_operator() -> String {
    "gatehouse".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            local_interval_ms: default_local_interval_ms(),
            remote_interval_ms: default_remote_interval_ms(),
        }
    }
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            device_path: None,
            width: default_width(),
            height: default_height(),
            jpeg_quality: default_jpeg_quality(),
            grab_timeout_ms: default_grab_timeout_ms(),
        }
    }
}

impl Default for VerificationDefaults {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            search_scope: SearchScope::default(),
            engine_mode: EngineMode::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            upload_path: None,
            max_consecutive_failures: 0,
            status_interval_secs: default_status_interval(),
            operator: default_operator(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl VerifierConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with VERIFIER_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. VERIFIER_MATCHER__ENDPOINT
            .add_source(
                Environment::with_prefix("VERIFIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("VERIFIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.matcher.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "matcher.endpoint".to_string(),
            ));
        }
        if !is_http_url(&self.matcher.endpoint) {
            return Err(ConfigValidationError::InvalidValue {
                field: "matcher.endpoint".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.capture.local_interval_ms == 0 || self.capture.remote_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.local_interval_ms/remote_interval_ms".to_string(),
                message: "Intervals must be greater than 0".to_string(),
            });
        }

        let timeouts = [
            ("matcher.connect_timeout_ms", self.matcher.connect_timeout_ms),
            ("matcher.fast_timeout_ms", self.matcher.fast_timeout_ms),
            ("matcher.precise_timeout_ms", self.matcher.precise_timeout_ms),
            ("matcher.health_timeout_ms", self.matcher.health_timeout_ms),
            ("peripheral.snapshot_timeout_ms", self.peripheral.snapshot_timeout_ms),
            ("device.grab_timeout_ms", self.device.grab_timeout_ms),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigValidationError::InvalidValue {
                field: field.to_string(),
                message: "Timeouts must be greater than 0".to_string(),
            });
        }

        if let Some(base_url) = &self.peripheral.base_url {
            if !is_http_url(base_url) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "peripheral.base_url".to_string(),
                    message: "URL must start with http:// or https://".to_string(),
                });
            }
        }

        if self.device.width == 0 || self.device.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "device.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.device.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "device.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if let Err(e) = self.verification.to_settings() {
            return Err(ConfigValidationError::InvalidValue {
                field: "verification.confidence_threshold".to_string(),
                message: e.to_string(),
            });
        }

        match self.session.source.as_str() {
            "local" => {}
            "remote" => {
                if self.peripheral.base_url.is_none() {
                    return Err(ConfigValidationError::MissingField(
                        "peripheral.base_url".to_string(),
                    ));
                }
            }
            "upload" => {
                if self.session.upload_path.is_none() {
                    return Err(ConfigValidationError::MissingField(
                        "session.upload_path".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "session.source".to_string(),
                    message: format!("Unknown source '{}', expected local, remote or upload", other),
                });
            }
        }

        Ok(())
    }
}

impl MatcherConfig {
    /// Get connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the request timeout for an engine mode.
    pub fn request_timeout(&self, mode: EngineMode) -> Duration {
        match mode {
            EngineMode::Fast => Duration::from_millis(self.fast_timeout_ms),
            EngineMode::Precise => Duration::from_millis(self.precise_timeout_ms),
        }
    }

    /// Get health probe timeout as Duration.
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

impl CaptureConfig {
    pub fn local_interval(&self) -> Duration {
        Duration::from_millis(self.local_interval_ms)
    }

    pub fn remote_interval(&self) -> Duration {
        Duration::from_millis(self.remote_interval_ms)
    }
}

impl PeripheralConfig {
    /// Get snapshot timeout as Duration.
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    /// Get base probe delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum probe delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl DeviceConfig {
    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }
}

impl VerificationDefaults {
    /// Build validated verification settings from the configured defaults.
    pub fn to_settings(&self) -> Result<VerificationSettings, crate::settings::SettingsError> {
        VerificationSettings::new(self.confidence_threshold, self.search_scope, self.engine_mode)
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_test_config() -> VerifierConfig {
        VerifierConfig {
            matcher: MatcherConfig {
                endpoint: "http://matcher:8000".to_string(),
                verify_path: default_verify_path(),
                health_path: default_health_path(),
                connect_timeout_ms: 3000,
                fast_timeout_ms: 2000,
                precise_timeout_ms: 10000,
                health_timeout_ms: 3000,
            },
            capture: CaptureConfig::default(),
            peripheral: PeripheralConfig {
                base_url: Some("http://192.168.1.40:8080".to_string()),
                ..PeripheralConfig::default()
            },
            device: DeviceConfig::default(),
            verification: VerificationDefaults::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_matcher_endpoint() {
        let mut config = create_test_config();
        config.matcher.endpoint = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_matcher_endpoint() {
        let mut config = create_test_config();
        config.matcher.endpoint = "rtsp://matcher:554".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_remote_source_requires_base_url() {
        let mut config = create_test_config();
        config.session.source = "remote".to_string();
        config.peripheral.base_url = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "peripheral.base_url"
        ));
    }

    #[test]
    fn test_upload_source_requires_path() {
        let mut config = create_test_config();
        config.session.source = "upload".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "session.upload_path"
        ));
    }

    #[test]
    fn test_unknown_source() {
        let mut config = create_test_config();
        config.session.source = "webcam".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_threshold() {
        let mut config = create_test_config();
        config.verification.confidence_threshold = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_interval() {
        let mut config = create_test_config();
        config.capture.remote_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = create_test_config();
        config.matcher.fast_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "matcher.fast_timeout_ms"
        ));

        let mut config = create_test_config();
        config.peripheral.snapshot_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. })
                if field == "peripheral.snapshot_timeout_ms"
        ));

        let mut config = create_test_config();
        config.device.grab_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_timeout_per_engine() {
        let config = create_test_config();
        assert_eq!(
            config.matcher.request_timeout(EngineMode::Fast),
            Duration::from_millis(2000)
        );
        assert_eq!(
            config.matcher.request_timeout(EngineMode::Precise),
            Duration::from_millis(10000)
        );
    }
}
