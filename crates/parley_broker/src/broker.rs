//! Broker context and lifespan.
//!
//! Process-wide state (store, notification bus, diff validator, reviewer
//! pool, background task) is created here with explicit init and teardown
//! and passed into operation handlers; nothing is referenced as a global.

use crate::config::{load_pool_config, resolve_config_path};
use crate::diff::{discover_repo_root, DiffValidator, GitDiffValidator};
use crate::notify::NotificationBus;
use crate::pool::ReviewerPool;
use crate::reapers;
use crate::store::{resolve_db_path, Store};
use anyhow::Context;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const REPO_ROOT_ENV_VAR: &str = "BROKER_REPO_ROOT";

/// Shared broker context passed into every operation handler.
pub struct Broker {
    pub store: Store,
    pub bus: NotificationBus,
    pub validator: Arc<dyn DiffValidator>,
    pub pool: Option<Arc<ReviewerPool>>,
    pub repo_root: Option<PathBuf>,
}

impl Broker {
    pub fn new(
        store: Store,
        validator: Arc<dyn DiffValidator>,
        pool: Option<Arc<ReviewerPool>>,
        repo_root: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            bus: NotificationBus::new(),
            validator,
            pool,
            repo_root,
        }
    }
}

/// Overrides for lifespan startup; all default from the environment.
#[derive(Default)]
pub struct BrokerOptions {
    pub db_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub repo_root: Option<PathBuf>,
}

/// A started broker: the shared context plus the background reaper task.
pub struct BrokerRuntime {
    pub broker: Arc<Broker>,
    background: Option<JoinHandle<()>>,
}

/// Random per-process token distinguishing this broker's reviewers from
/// orphans of previous runs.
pub fn new_session_token() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect()
}

impl BrokerRuntime {
    /// Initialize the store, pool, and background task.
    ///
    /// Startup order: open store (WAL + schema) -> load pool config ->
    /// terminate stale reviewers -> ownership sweep -> one reactive
    /// scaling pass -> spawn the periodic reaper task.
    pub async fn start(options: BrokerOptions) -> anyhow::Result<Self> {
        let repo_root = match options.repo_root {
            Some(root) => Some(root),
            None => match std::env::var(REPO_ROOT_ENV_VAR) {
                Ok(root) if !root.is_empty() => {
                    info!("Using repo root override from {}: {}", REPO_ROOT_ENV_VAR, root);
                    Some(PathBuf::from(root))
                }
                _ => discover_repo_root().await,
            },
        };

        let db_path = options.db_path.unwrap_or_else(resolve_db_path);
        let store = Store::open(&db_path)
            .await
            .with_context(|| format!("failed to open store at {}", db_path.display()))?;

        let config_path = options
            .config_path
            .unwrap_or_else(|| resolve_config_path(repo_root.as_deref()));
        let pool = match load_pool_config(&config_path) {
            Ok(Some(config)) => Some(Arc::new(ReviewerPool::new(new_session_token(), config))),
            Ok(None) => {
                info!("No reviewer_pool config, reviewer pool disabled ({})", config_path.display());
                None
            }
            Err(err) => {
                warn!("Failed to load reviewer_pool config; pool disabled: {err}");
                None
            }
        };

        let broker = Arc::new(Broker::new(
            store,
            Arc::new(GitDiffValidator),
            pool,
            repo_root,
        ));

        let mut background = None;
        if let Some(pool) = broker.pool.as_ref() {
            let stale_terminated = reapers::startup_terminate_stale_reviewers(&broker).await?;
            let reclaimed = reapers::startup_ownership_sweep(&broker).await?;
            crate::ops::scaling::reactive_scale_check(&broker, "startup").await;
            info!(
                session = %pool.session_token,
                stale_terminated,
                reclaimed,
                "Reviewer pool enabled"
            );
            background = Some(tokio::spawn(reapers::periodic_check(Arc::clone(&broker))));
        }

        info!(
            db = %db_path.display(),
            repo = %broker
                .repo_root
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "cwd".to_string()),
            "Broker ready"
        );
        Ok(Self { broker, background })
    }

    /// Cancel the background task, shut down pooled workers, checkpoint
    /// the WAL, and close the store.
    pub async fn shutdown(mut self) {
        if let Some(background) = self.background.take() {
            background.abort();
            let _ = background.await;
        }
        if let Some(pool) = self.broker.pool.as_ref() {
            pool.shutdown_all(&self.broker.store).await;
        }
        self.broker.store.checkpoint_and_close().await;
        info!("Broker shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_is_eight_hex_chars() {
        let token = new_session_token();
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_tokens_differ_between_processes() {
        assert_ne!(new_session_token(), new_session_token());
    }
}
