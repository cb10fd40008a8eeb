//! Persisted settings and runtime environment detection.
//!
//! `settings.json` lives under `DATA_DIR` together with the cookie jar, the
//! icon cache and the rolling logs. Unknown keys are preserved on rewrite so
//! older and newer builds can share a data directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::MIN_REFRESH_INTERVAL_MINUTES;
use crate::error::{AgentError, Result};
use crate::models::BenefitKind;

/// Env var / sentinel marking a containerized deployment.
const CONTAINER_ENV: &str = "AGENT_CONTAINER";
const CONTAINER_SENTINEL: &str = "/.dockerenv";
const CONTAINER_DATA_DIR: &str = "/app/data";

/// Env var overriding the control-surface port.
const PORT_ENV: &str = "AGENT_PORT";
const DEFAULT_PORT: u16 = 8080;

/// User-facing configuration, stored as `DATA_DIR/settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Ordered priority list of game names; empty means every campaign is
    /// fair game.
    #[serde(default)]
    pub games_to_watch: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub dark_mode: bool,
    /// Heartbeat divisor: pulses go out every `20 / quality` seconds.
    #[serde(default = "default_quality")]
    pub connection_quality: u8,
    #[serde(default = "default_refresh_interval")]
    pub minimum_refresh_interval_minutes: u64,
    /// HTTP/SOCKS proxy URL; empty means direct connection.
    #[serde(default)]
    pub proxy: String,
    /// Opaque UI filter state, persisted verbatim.
    #[serde(default)]
    pub inventory_filters: serde_json::Value,
    /// Benefit-type gate for wanted drops.
    #[serde(default = "default_benefits")]
    pub mining_benefits: HashMap<BenefitKind, bool>,
    /// Keys this build does not recognize, carried verbatim through
    /// load/save so builds of different ages can share a data directory.
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_language() -> String {
    "English".to_string()
}

fn default_quality() -> u8 {
    1
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_benefits() -> HashMap<BenefitKind, bool> {
    BenefitKind::ALL.iter().map(|k| (*k, true)).collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            games_to_watch: Vec::new(),
            language: default_language(),
            dark_mode: false,
            connection_quality: default_quality(),
            minimum_refresh_interval_minutes: default_refresh_interval(),
            proxy: String::new(),
            inventory_filters: serde_json::Value::Null,
            mining_benefits: default_benefits(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Settings {
    /// Load from `DATA_DIR/settings.json`; missing file yields defaults, a
    /// malformed file is a configuration error.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("settings.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
        let settings: Settings = serde_json::from_str(&content)
            .map_err(|e| AgentError::Config(format!("malformed settings.json: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join("settings.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| AgentError::Config(e.to_string()))?;
        std::fs::write(&path, content)
            .map_err(|e| AgentError::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=6).contains(&self.connection_quality) {
            return Err(AgentError::Config(format!(
                "connection_quality must be 1..=6, got {}",
                self.connection_quality
            )));
        }
        if self.minimum_refresh_interval_minutes < MIN_REFRESH_INTERVAL_MINUTES {
            return Err(AgentError::Config(format!(
                "minimum_refresh_interval_minutes must be >= {MIN_REFRESH_INTERVAL_MINUTES}"
            )));
        }
        if !self.proxy.is_empty() && url::Url::parse(&self.proxy).is_err() {
            return Err(AgentError::Config(format!("invalid proxy URL: {}", self.proxy)));
        }
        Ok(())
    }

    /// Merge a JSON object patch into this settings value, then re-validate.
    /// Keys this build does not recognize land in the preserved-extras map
    /// rather than being dropped.
    pub fn apply_patch(&self, patch: &serde_json::Value) -> Result<Settings> {
        let obj = patch
            .as_object()
            .ok_or_else(|| AgentError::Config("settings patch must be an object".into()))?;
        let mut merged = serde_json::to_value(self).map_err(|e| AgentError::Config(e.to_string()))?;
        let merged_obj = merged.as_object_mut().expect("settings serialize to object");
        for (key, value) in obj {
            merged_obj.insert(key.clone(), value.clone());
        }
        let next: Settings = serde_json::from_value(merged)
            .map_err(|e| AgentError::Config(format!("bad settings patch: {e}")))?;
        next.validate()?;
        Ok(next)
    }

    /// Whether the given benefit kind passes the mining gate.
    pub fn wants_benefit(&self, kind: BenefitKind) -> bool {
        self.mining_benefits.get(&kind).copied().unwrap_or(true)
    }

    /// The benefit gate as a copyable value for the campaign model.
    pub fn benefit_gate(&self) -> crate::models::BenefitGate {
        crate::models::BenefitGate {
            item: self.wants_benefit(BenefitKind::Item),
            badge: self.wants_benefit(BenefitKind::Badge),
            emote: self.wants_benefit(BenefitKind::Emote),
            other: self.wants_benefit(BenefitKind::Other),
        }
    }

    /// Heartbeat interval derived from connection quality.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        crate::constants::BASE_WATCH_INTERVAL / u32::from(self.connection_quality.clamp(1, 6))
    }
}

/// Resolved runtime paths and ports.
#[derive(Debug, Clone)]
pub struct Environment {
    pub data_dir: PathBuf,
    pub control_port: u16,
}

impl Environment {
    /// Detect container vs local layout and the control-surface port.
    pub fn detect() -> Self {
        let containerized =
            std::env::var_os(CONTAINER_ENV).is_some() || Path::new(CONTAINER_SENTINEL).exists();
        let data_dir = if containerized {
            PathBuf::from(CONTAINER_DATA_DIR)
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("data")
        };
        let control_port = std::env::var(PORT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        Self {
            data_dir,
            control_port,
        }
    }

    /// Create `DATA_DIR` and its `cache/` and `logs/` subdirectories.
    pub fn prepare(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.data_dir.join("cache"),
            self.data_dir.join("logs"),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| AgentError::Config(format!("cannot create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    pub fn cookie_jar_path(&self) -> PathBuf {
        self.data_dir.join("cookies.jar")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.games_to_watch.is_empty());
        assert_eq!(settings.connection_quality, 1);
        assert_eq!(settings.minimum_refresh_interval_minutes, 30);
        assert!(settings.proxy.is_empty());
        assert!(settings.wants_benefit(BenefitKind::Item));
        assert!(settings.wants_benefit(BenefitKind::Other));
        assert_eq!(settings.heartbeat_interval().as_secs(), 20);
    }

    #[test]
    fn test_quality_divides_heartbeat() {
        let settings = Settings {
            connection_quality: 4,
            ..Settings::default()
        };
        assert_eq!(settings.heartbeat_interval().as_secs(), 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings {
            connection_quality: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        settings.connection_quality = 7;
        assert!(settings.validate().is_err());

        settings.connection_quality = 3;
        settings.minimum_refresh_interval_minutes = 2;
        assert!(settings.validate().is_err());

        settings.minimum_refresh_interval_minutes = 5;
        settings.proxy = "not a url".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_parse_partial_file() {
        let json = r#"{"games_to_watch": ["GameA", "GameB"], "connection_quality": 2}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.games_to_watch, vec!["GameA", "GameB"]);
        assert_eq!(settings.connection_quality, 2);
        assert_eq!(settings.minimum_refresh_interval_minutes, 30);
    }

    #[test]
    fn test_apply_patch_merges_and_validates() {
        let settings = Settings::default();
        let patched = settings
            .apply_patch(&serde_json::json!({"dark_mode": true, "connection_quality": 6}))
            .unwrap();
        assert!(patched.dark_mode);
        assert_eq!(patched.connection_quality, 6);
        // Untouched keys survive.
        assert_eq!(patched.minimum_refresh_interval_minutes, 30);

        assert!(settings
            .apply_patch(&serde_json::json!({"connection_quality": 9}))
            .is_err());
        assert!(settings.apply_patch(&serde_json::json!(42)).is_err());
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let json = r#"{"dark_mode": true, "future_flag": {"x": 1}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(settings.extra.contains_key("future_flag"));

        let rewritten = serde_json::to_value(&settings).unwrap();
        assert_eq!(rewritten["future_flag"]["x"], 1);
        assert_eq!(rewritten["dark_mode"], true);

        // Patches with unrecognized keys keep them too.
        let patched = settings
            .apply_patch(&serde_json::json!({"another_flag": true}))
            .unwrap();
        assert_eq!(patched.extra["another_flag"], true);
        assert_eq!(patched.extra["future_flag"]["x"], 1);
    }

    #[test]
    fn test_benefit_gate() {
        let json = r#"{"mining_benefits": {"ITEM": true, "BADGE": false}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(settings.wants_benefit(BenefitKind::Item));
        assert!(!settings.wants_benefit(BenefitKind::Badge));
        // Kinds absent from the map default to wanted.
        assert!(settings.wants_benefit(BenefitKind::Emote));
    }
}
