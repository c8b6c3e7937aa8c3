//! Reviewer pool configuration schema.
//!
//! Loaded from the `reviewer_pool` section of `.planning/config.json`
//! (path overridable via BROKER_CONFIG_PATH). A missing file or missing
//! section disables the pool; a present-but-invalid section is an error.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_PATH_ENV_VAR: &str = "BROKER_CONFIG_PATH";

const ALLOWED_MODELS: &[&str] = &[
    "o4-mini",
    "o3",
    "codex-mini-latest",
    "gpt-5",
    "gpt-5-codex",
    "gpt-5.3-codex",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reviewer_pool must be an object when provided")]
    SectionNotObject,

    #[error("Invalid reviewer_pool config: {0}")]
    Invalid(String),
}

/// Validated reviewer pool spawn/runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "defaults::model")]
    pub model: String,
    #[serde(default = "defaults::reasoning_effort")]
    pub reasoning_effort: String,
    pub workspace_path: String,
    #[serde(default = "defaults::wsl_distro")]
    pub wsl_distro: String,
    #[serde(default = "defaults::max_pool_size")]
    pub max_pool_size: u32,
    #[serde(default = "defaults::idle_timeout_seconds")]
    pub idle_timeout_seconds: f64,
    #[serde(default = "defaults::max_ttl_seconds")]
    pub max_ttl_seconds: f64,
    #[serde(default = "defaults::claim_timeout_seconds")]
    pub claim_timeout_seconds: f64,
    #[serde(default = "defaults::spawn_cooldown_seconds")]
    pub spawn_cooldown_seconds: f64,
    #[serde(default = "defaults::prompt_template_path")]
    pub prompt_template_path: String,
    #[serde(default = "defaults::scaling_ratio")]
    pub scaling_ratio: f64,
    #[serde(default = "defaults::background_check_interval_seconds")]
    pub background_check_interval_seconds: f64,
}

mod defaults {
    pub fn model() -> String {
        "o4-mini".to_string()
    }
    pub fn reasoning_effort() -> String {
        "high".to_string()
    }
    pub fn wsl_distro() -> String {
        "Ubuntu".to_string()
    }
    pub fn max_pool_size() -> u32 {
        3
    }
    pub fn idle_timeout_seconds() -> f64 {
        300.0
    }
    pub fn max_ttl_seconds() -> f64 {
        3600.0
    }
    pub fn claim_timeout_seconds() -> f64 {
        1200.0
    }
    pub fn spawn_cooldown_seconds() -> f64 {
        10.0
    }
    pub fn prompt_template_path() -> String {
        "reviewer_prompt.md".to_string()
    }
    pub fn scaling_ratio() -> f64 {
        3.0
    }
    pub fn background_check_interval_seconds() -> f64 {
        30.0
    }
}

impl PoolConfig {
    /// Range and allow-list validation. Called after deserialization.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if !ALLOWED_MODELS.contains(&self.model.as_str()) {
            let mut allowed: Vec<&str> = ALLOWED_MODELS.to_vec();
            allowed.sort_unstable();
            return Err(ConfigError::Invalid(format!(
                "Unsupported model: {:?}. Allowed: {}",
                self.model,
                allowed.join(", ")
            )));
        }
        if !matches!(self.reasoning_effort.as_str(), "low" | "medium" | "high") {
            return Err(ConfigError::Invalid(format!(
                "reasoning_effort must be one of low, medium, high (got {:?})",
                self.reasoning_effort
            )));
        }
        if !(1..=10).contains(&self.max_pool_size) {
            return Err(ConfigError::Invalid(format!(
                "max_pool_size must be in [1, 10] (got {})",
                self.max_pool_size
            )));
        }
        if self.idle_timeout_seconds < 60.0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_seconds must be >= 60".to_string(),
            ));
        }
        if self.max_ttl_seconds < 300.0 {
            return Err(ConfigError::Invalid(
                "max_ttl_seconds must be >= 300".to_string(),
            ));
        }
        if self.claim_timeout_seconds < 60.0 {
            return Err(ConfigError::Invalid(
                "claim_timeout_seconds must be >= 60".to_string(),
            ));
        }
        if self.spawn_cooldown_seconds < 1.0 {
            return Err(ConfigError::Invalid(
                "spawn_cooldown_seconds must be >= 1".to_string(),
            ));
        }
        if self.scaling_ratio < 1.0 {
            return Err(ConfigError::Invalid(
                "scaling_ratio must be >= 1.0".to_string(),
            ));
        }
        if self.background_check_interval_seconds < 5.0 {
            return Err(ConfigError::Invalid(
                "background_check_interval_seconds must be >= 5".to_string(),
            ));
        }
        // WSL-style paths are not resolvable from a native Windows runtime.
        if !cfg!(target_os = "windows") && !Path::new(&self.workspace_path).exists() {
            return Err(ConfigError::Invalid(format!(
                "workspace_path does not exist: {}",
                self.workspace_path
            )));
        }
        Ok(self)
    }
}

/// Resolve the config JSON path: BROKER_CONFIG_PATH override, else
/// `<repo_root>/.planning/config.json` (cwd when no repo root).
pub fn resolve_config_path(repo_root: Option<&Path>) -> PathBuf {
    if let Ok(configured) = std::env::var(CONFIG_PATH_ENV_VAR) {
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
    }
    let base = repo_root
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    base.join(".planning").join("config.json")
}

/// Load the reviewer pool config.
///
/// Returns `Ok(None)` when the file is missing or the `reviewer_pool`
/// section is absent or null (pool disabled). Errors on malformed JSON or
/// an invalid section.
pub fn load_pool_config(config_path: &Path) -> Result<Option<PoolConfig>, ConfigError> {
    let raw = match std::fs::read_to_string(config_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigError::Io {
                path: config_path.to_path_buf(),
                source: err,
            })
        }
    };

    let payload: serde_json::Value = serde_json::from_str(&raw)?;
    let section = match payload.get("reviewer_pool") {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(section) if !section.is_object() => return Err(ConfigError::SectionNotObject),
        Some(section) => section.clone(),
    };

    let config: PoolConfig = serde_json::from_value(section)?;
    config.validate().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, payload: &serde_json::Value) -> PathBuf {
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{}", payload).unwrap();
        path
    }

    fn base_section(dir: &tempfile::TempDir) -> serde_json::Value {
        json!({
            "workspace_path": dir.path().to_str().unwrap(),
        })
    }

    #[test]
    fn missing_file_disables_pool() {
        let result = load_pool_config(Path::new("/nonexistent/config.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn missing_section_disables_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &json!({"other": 1}));
        assert!(load_pool_config(&path).unwrap().is_none());
    }

    #[test]
    fn null_section_disables_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &json!({"reviewer_pool": null}));
        assert!(load_pool_config(&path).unwrap().is_none());
    }

    #[test]
    fn non_object_section_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &json!({"reviewer_pool": [1, 2]}));
        assert!(matches!(
            load_pool_config(&path),
            Err(ConfigError::SectionNotObject)
        ));
    }

    #[test]
    fn defaults_fill_omitted_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &json!({"reviewer_pool": base_section(&dir)}));
        let config = load_pool_config(&path).unwrap().unwrap();
        assert_eq!(config.model, "o4-mini");
        assert_eq!(config.max_pool_size, 3);
        assert_eq!(config.scaling_ratio, 3.0);
        assert_eq!(config.background_check_interval_seconds, 30.0);
    }

    #[test]
    fn unknown_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut section = base_section(&dir);
        section["model"] = json!("gpt-2");
        let path = write_config(&dir, &json!({"reviewer_pool": section}));
        let err = load_pool_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported model"));
    }

    #[test]
    fn out_of_range_pool_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut section = base_section(&dir);
        section["max_pool_size"] = json!(11);
        let path = write_config(&dir, &json!({"reviewer_pool": section}));
        let err = load_pool_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_pool_size"));
    }

    #[test]
    fn missing_workspace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut section = base_section(&dir);
        section["workspace_path"] = json!("/definitely/not/a/real/path");
        let path = write_config(&dir, &json!({"reviewer_pool": section}));
        let err = load_pool_config(&path).unwrap_err();
        assert!(err.to_string().contains("workspace_path"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_pool_config(&path), Err(ConfigError::Json(_))));
    }
}
