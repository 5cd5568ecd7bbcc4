//! Engine configuration
//!
//! [`EngineConfig`] holds the engine knobs: default whitespace and keyword
//! characters, packrat caching, bounded left recursion, a parse deadline and
//! explain-trace recording.
//!
//! Process-wide defaults still exist for convenience ([`global_defaults`],
//! [`set_global_defaults`]) but each [`Grammar`](crate::grammar::Grammar)
//! takes a snapshot when it is created and owns its copy from then on, so
//! changing the defaults never races with grammars already in use.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::chars::{DEFAULT_WHITESPACE, IDENTCHARS};
use crate::error::GrammarError;

/// Size policy for a memo table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLimit {
    Unbounded,
    Bounded(usize),
}

impl Default for CacheLimit {
    fn default() -> Self {
        CacheLimit::Bounded(128)
    }
}

/// Matching configuration shared by every node of a grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Characters skipped before each match attempt unless overridden per node
    pub default_whitespace_chars: String,
    /// Identifier characters used for keyword boundaries
    pub default_keyword_chars: String,
    /// Packrat memoization of every match attempt
    pub packrat: Option<CacheLimit>,
    /// Bounded left recursion through `Forward` nodes
    pub left_recursion: Option<CacheLimit>,
    /// Parse input as given instead of expanding tabs to 8-column stops
    pub keep_tabs: bool,
    /// Abort parsing with a fatal failure after this many milliseconds (0 = never)
    pub timeout_ms: u64,
    /// Capture the active matcher stack for `ParseError::explain`
    pub record_explain: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_whitespace_chars: DEFAULT_WHITESPACE.to_string(),
            default_keyword_chars: IDENTCHARS.to_string(),
            packrat: None,
            left_recursion: None,
            keep_tabs: false,
            timeout_ms: 0,
            record_explain: false,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, GrammarError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| GrammarError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), GrammarError> {
        if self.packrat.is_some() && self.left_recursion.is_some() {
            return Err(GrammarError::IncompatibleCaching);
        }
        for limit in [self.packrat, self.left_recursion].into_iter().flatten() {
            if limit == CacheLimit::Bounded(0) {
                return Err(GrammarError::InvalidConfig(
                    "cache size must be at least 1".to_string(),
                ));
            }
        }
        if self.default_keyword_chars.is_empty() {
            return Err(GrammarError::InvalidConfig(
                "keyword characters must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_packrat(mut self, limit: CacheLimit) -> Result<Self, GrammarError> {
        if self.left_recursion.is_some() {
            return Err(GrammarError::IncompatibleCaching);
        }
        self.packrat = Some(limit);
        Ok(self)
    }

    pub fn with_left_recursion(mut self, limit: CacheLimit) -> Result<Self, GrammarError> {
        if self.packrat.is_some() {
            return Err(GrammarError::IncompatibleCaching);
        }
        self.left_recursion = Some(limit);
        Ok(self)
    }
}

static GLOBAL_DEFAULTS: Lazy<RwLock<EngineConfig>> =
    Lazy::new(|| RwLock::new(EngineConfig::default()));

/// Snapshot of the process-wide defaults.
pub fn global_defaults() -> EngineConfig {
    match GLOBAL_DEFAULTS.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Replace the process-wide defaults used by grammars created afterwards.
pub fn set_global_defaults(config: EngineConfig) -> Result<(), GrammarError> {
    config.validate()?;
    match GLOBAL_DEFAULTS.write() {
        Ok(mut guard) => *guard = config,
        Err(poisoned) => *poisoned.into_inner() = config,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_whitespace_chars, " \n\t\r");
        assert!(config.default_keyword_chars.contains('$'));
        assert!(config.packrat.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = EngineConfig::from_json(r#"{"packrat": {"bounded": 64}}"#).unwrap();
        assert_eq!(config.packrat, Some(CacheLimit::Bounded(64)));
        assert_eq!(config.default_whitespace_chars, " \n\t\r");

        let config = EngineConfig::from_json(r#"{"left_recursion": "unbounded"}"#).unwrap();
        assert_eq!(config.left_recursion, Some(CacheLimit::Unbounded));
    }

    #[test]
    fn test_incompatible_caching_is_rejected() {
        let err = EngineConfig::from_json(r#"{"packrat": "unbounded", "left_recursion": "unbounded"}"#)
            .unwrap_err();
        assert_eq!(err, GrammarError::IncompatibleCaching);

        let packrat = EngineConfig::default().with_packrat(CacheLimit::Unbounded).unwrap();
        assert_eq!(
            packrat.with_left_recursion(CacheLimit::Unbounded).unwrap_err(),
            GrammarError::IncompatibleCaching
        );
    }

    #[test]
    fn test_malformed_json() {
        let err = EngineConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, GrammarError::InvalidConfig(_)));
    }

    #[test]
    fn test_json_round_trip_keeps_fields() {
        let config = EngineConfig {
            timeout_ms: 250,
            record_explain: true,
            ..EngineConfig::default()
        };
        assert_eq!(EngineConfig::from_json(&config.to_json()).unwrap(), config);
    }
}
