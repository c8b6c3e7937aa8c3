//! Platform-aware argv construction and prompt rendering for reviewer
//! workers.

use crate::config::PoolConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PROMPT_TEMPLATE_ENV_VAR: &str = "BROKER_PROMPT_TEMPLATE_PATH";

pub const CLAIM_GENERATION_NOTE: &str = "IMPORTANT: When submitting a verdict, always pass the \
claim_generation value you received from claim_review. This prevents stale verdict submissions \
after reclaim.";

#[derive(Debug, Error)]
pub enum SpawnTemplateError {
    #[error("Failed to read prompt template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unresolved template placeholder: {0}")]
    UnresolvedPlaceholder(String),
}

/// Build shell-free argv for the reviewer worker subprocess.
///
/// On Windows the codex invocation is wrapped in `wsl -d <distro> -- bash
/// -lc`, initializing nvm first so Node-backed installs resolve.
pub fn build_worker_argv(config: &PoolConfig) -> Vec<String> {
    let codex_args: Vec<String> = vec![
        "codex".to_string(),
        "exec".to_string(),
        "--sandbox".to_string(),
        "read-only".to_string(),
        "--ephemeral".to_string(),
        "--model".to_string(),
        config.model.clone(),
        "-c".to_string(),
        format!("model_reasoning_effort={}", config.reasoning_effort),
        "-C".to_string(),
        config.workspace_path.clone(),
        "-".to_string(),
    ];

    if cfg!(target_os = "windows") {
        let quoted: Vec<String> = codex_args.iter().map(|arg| shell_quote(arg)).collect();
        let bash_cmd = format!(
            "if [ -s ~/.nvm/nvm.sh ]; then . ~/.nvm/nvm.sh; fi; exec {}",
            quoted.join(" ")
        );
        vec![
            "wsl".to_string(),
            "-d".to_string(),
            config.wsl_distro.clone(),
            "--".to_string(),
            "bash".to_string(),
            "-lc".to_string(),
            bash_cmd,
        ]
    } else {
        codex_args
    }
}

/// Resolve the prompt template path.
///
/// BROKER_PROMPT_TEMPLATE_PATH is a hard override; absolute config paths
/// win next; relative paths are tried against cwd then the workspace.
pub fn resolve_prompt_template_path(config: &PoolConfig) -> PathBuf {
    if let Ok(override_path) = std::env::var(PROMPT_TEMPLATE_ENV_VAR) {
        if !override_path.is_empty() {
            return PathBuf::from(override_path);
        }
    }

    let configured = Path::new(&config.prompt_template_path);
    if configured.is_absolute() {
        return configured.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let candidates = [
        cwd.join(configured),
        Path::new(&config.workspace_path).join(configured),
    ];
    for candidate in &candidates {
        if candidate.exists() {
            return candidate.clone();
        }
    }
    candidates[0].clone()
}

/// Load the reviewer prompt template and substitute all known
/// placeholders. Any `{...}` left over is a configuration error.
pub fn load_prompt_template(
    template_path: &Path,
    reviewer_id: &str,
) -> Result<String, SpawnTemplateError> {
    let raw = std::fs::read_to_string(template_path).map_err(|source| SpawnTemplateError::Io {
        path: template_path.to_path_buf(),
        source,
    })?;
    let rendered = raw
        .replace("{reviewer_id}", reviewer_id)
        .replace("{claim_generation_note}", CLAIM_GENERATION_NOTE);

    if let Some(unresolved) = find_placeholder(&rendered) {
        return Err(SpawnTemplateError::UnresolvedPlaceholder(unresolved));
    }
    Ok(rendered)
}

/// Find the first `{lower_snake}` placeholder still present.
fn find_placeholder(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j].is_ascii_lowercase() || bytes[j] == b'_') {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b'}' {
                return Some(text[i..=j].to_string());
            }
        }
        i += 1;
    }
    None
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
