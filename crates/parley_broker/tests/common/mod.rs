//! Shared test fixtures: a broker over a scratch store, a stub diff
//! validator, and an inert worker launcher for pool tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parley_broker::broker::Broker;
use parley_broker::config::PoolConfig;
use parley_broker::diff::{DiffValidator, Validation};
use parley_broker::ops::{claims, messages, reviews, verdicts};
use parley_broker::pool::{ReviewerPool, WorkerLauncher};
use parley_broker::spawn::SpawnTemplateError;
use parley_broker::store::Store;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::sync::Once;
use tempfile::TempDir;

/// Marker that makes the stub validator refuse a diff.
pub const BAD_DIFF_MARKER: &str = "do-not-apply";

static TEST_HOME: Once = Once::new();

fn isolate_broker_home() {
    TEST_HOME.call_once(|| {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("BROKER_HOME", dir.path());
        // Keep the tempdir alive for the whole test process.
        std::mem::forget(dir);
    });
}

/// Validator that refuses any diff containing [`BAD_DIFF_MARKER`].
pub struct StubValidator;

#[async_trait]
impl DiffValidator for StubValidator {
    async fn validate(&self, diff_text: &str, _cwd: Option<&Path>) -> Validation {
        if diff_text.contains(BAD_DIFF_MARKER) {
            Validation::Failed("patch does not apply".to_string())
        } else {
            Validation::Ok
        }
    }
}

/// Launcher that starts an inert long-running process instead of a real
/// reviewer worker.
pub struct SleepLauncher;

impl WorkerLauncher for SleepLauncher {
    fn build_argv(&self, _config: &PoolConfig) -> Vec<String> {
        vec!["sleep".to_string(), "300".to_string()]
    }

    fn render_prompt(
        &self,
        _config: &PoolConfig,
        reviewer_id: &str,
    ) -> Result<String, SpawnTemplateError> {
        Ok(format!("You are reviewer {reviewer_id}.\n"))
    }
}

pub struct TestContext {
    pub broker: Arc<Broker>,
    _dir: TempDir,
}

/// Broker with a scratch store, stub validator, and no pool.
pub async fn broker() -> TestContext {
    broker_with_pool_config(None).await
}

/// Broker with a reviewer pool using the inert launcher.
pub async fn broker_with_pool() -> TestContext {
    broker_with_pool_config(Some(default_pool_config())).await
}

pub async fn broker_with_pool_config(config: Option<PoolConfig>) -> TestContext {
    isolate_broker_home();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("broker.sqlite3")).await.unwrap();
    let pool = config.map(|config| {
        Arc::new(ReviewerPool::with_launcher(
            "testsess".to_string(),
            config,
            Box::new(SleepLauncher),
        ))
    });
    let broker = Arc::new(Broker::new(store, Arc::new(StubValidator), pool, None));
    TestContext { broker, _dir: dir }
}

pub fn default_pool_config() -> PoolConfig {
    pool_config(json!({}))
}

/// Build a validated PoolConfig with overrides applied over test defaults.
pub fn pool_config(overrides: Value) -> PoolConfig {
    let mut section = json!({
        "workspace_path": "/tmp",
        "model": "o4-mini",
        "max_pool_size": 3,
        "scaling_ratio": 3.0,
        "idle_timeout_seconds": 60.0,
        "max_ttl_seconds": 300.0,
        "claim_timeout_seconds": 60.0,
        "spawn_cooldown_seconds": 5.0,
        "background_check_interval_seconds": 5.0,
    });
    if let (Some(base), Some(extra)) = (section.as_object_mut(), overrides.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value::<PoolConfig>(section)
        .unwrap()
        .validate()
        .unwrap()
}

// ---- Operation shortcuts ----

pub async fn create_review(ctx: &TestContext, intent: &str) -> Value {
    create_review_with(ctx, json!({ "intent": intent })).await
}

pub async fn create_review_with(ctx: &TestContext, overrides: Value) -> Value {
    let mut params = json!({
        "intent": "test change",
        "agent_type": "gsd-executor",
        "agent_role": "proposer",
        "phase": "1",
    });
    if let (Some(base), Some(extra)) = (params.as_object_mut(), overrides.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    reviews::create_review(&ctx.broker, serde_json::from_value(params).unwrap())
        .await
        .unwrap()
}

pub async fn claim(ctx: &TestContext, review_id: &str, reviewer_id: &str) -> Value {
    claims::claim_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "reviewer_id": reviewer_id,
        }))
        .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn submit_verdict(ctx: &TestContext, params: Value) -> Value {
    verdicts::submit_verdict(&ctx.broker, serde_json::from_value(params).unwrap())
        .await
        .unwrap()
}

pub async fn add_message(ctx: &TestContext, review_id: &str, sender_role: &str, body: &str) -> Value {
    messages::add_message(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "sender_role": sender_role,
            "body": body,
        }))
        .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn close_review(ctx: &TestContext, review_id: &str) -> Value {
    reviews::close_review(
        &ctx.broker,
        serde_json::from_value(json!({
            "review_id": review_id,
            "closer_role": "proposer",
        }))
        .unwrap(),
    )
    .await
    .unwrap()
}

/// Timeline event types for a review, in audit order.
pub async fn timeline_events(ctx: &TestContext, review_id: &str) -> Vec<String> {
    let timeline = parley_broker::queries::get_review_timeline(
        &ctx.broker,
        serde_json::from_value(json!({ "review_id": review_id })).unwrap(),
    )
    .await
    .unwrap();
    timeline["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap().to_string())
        .collect()
}

/// Force a column on the reviews table (tests rewind timestamps etc.).
pub async fn exec_sql(ctx: &TestContext, sql: &str) {
    let mut tx = ctx.broker.store.begin_write().await.unwrap();
    sqlx::query(sql).execute(tx.conn()).await.unwrap();
    tx.commit().await.unwrap();
}

/// Read a single nullable text column from the store.
pub async fn query_text(ctx: &TestContext, sql: &str) -> Option<String> {
    sqlx::query_scalar(sql)
        .fetch_one(ctx.broker.store.pool())
        .await
        .unwrap()
}

/// Insert a reviewer row directly (simulating prior-session state).
pub async fn insert_reviewer(ctx: &TestContext, id: &str, session_token: &str, status: &str) {
    let mut tx = ctx.broker.store.begin_write().await.unwrap();
    sqlx::query(
        "INSERT INTO reviewers (id, display_name, session_token, status)
         VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(id)
    .bind(session_token)
    .bind(status)
    .execute(tx.conn())
    .await
    .unwrap();
    tx.commit().await.unwrap();
}

/// A minimal valid-looking unified diff.
pub fn sample_diff() -> String {
    "diff --git a/src/lib.rs b/src/lib.rs\n\
     index 1111111..2222222 100644\n\
     --- a/src/lib.rs\n\
     +++ b/src/lib.rs\n\
     @@ -1,2 +1,2 @@\n \
     fn main() {\n\
     -    old();\n\
     +    new();\n"
        .to_string()
}

/// A diff the stub validator refuses.
pub fn bad_diff() -> String {
    format!("{} {}\n", sample_diff(), BAD_DIFF_MARKER)
}
