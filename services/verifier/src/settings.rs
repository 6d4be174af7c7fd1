//! Verification settings sent with every matcher call.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised when building verification settings.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SettingsError {
    #[error("Confidence threshold must be in (0, 100], got {0}")]
    ThresholdOutOfRange(f32),
}

/// Subset of enrolled identities the matcher searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    Owners,
    Tenants,
    #[default]
    All,
}

impl SearchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchScope::Owners => "owners",
            SearchScope::Tenants => "tenants",
            SearchScope::All => "all",
        }
    }
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precision/speed trade-off passed to the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Precise,
    #[default]
    Fast,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Precise => "precise",
            EngineMode::Fast => "fast",
        }
    }

    /// Hint shown while a verification is running.
    pub fn progress_message(&self) -> &'static str {
        match self {
            EngineMode::Fast => "Fast scan in progress (under 300 ms)",
            EngineMode::Precise => "Precise scan in progress (1-3 s)",
        }
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold, scope and engine mode for one verification call.
///
/// Values are copied into each call, so changing the settings mid-session
/// only affects calls issued afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VerificationSettings {
    confidence_threshold: f32,
    search_scope: SearchScope,
    engine_mode: EngineMode,
}

impl VerificationSettings {
    pub fn new(
        confidence_threshold: f32,
        search_scope: SearchScope,
        engine_mode: EngineMode,
    ) -> Result<Self, SettingsError> {
        if !confidence_threshold.is_finite()
            || confidence_threshold <= 0.0
            || confidence_threshold > 100.0
        {
            return Err(SettingsError::ThresholdOutOfRange(confidence_threshold));
        }

        Ok(Self {
            confidence_threshold,
            search_scope,
            engine_mode,
        })
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn search_scope(&self) -> SearchScope {
        self.search_scope
    }

    pub fn engine_mode(&self) -> EngineMode {
        self.engine_mode
    }

    pub fn with_threshold(self, confidence_threshold: f32) -> Result<Self, SettingsError> {
        Self::new(confidence_threshold, self.search_scope, self.engine_mode)
    }

    pub fn with_scope(mut self, search_scope: SearchScope) -> Self {
        self.search_scope = search_scope;
        self
    }

    pub fn with_engine_mode(mut self, engine_mode: EngineMode) -> Self {
        self.engine_mode = engine_mode;
        self
    }
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 70.0,
            search_scope: SearchScope::All,
            engine_mode: EngineMode::Fast,
        }
    }
}
