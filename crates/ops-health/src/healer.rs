//! C6 — self-healer. Executes the fixed action catalogue under
//! cooldown/enable gating with a guaranteed audit trail.

use crate::collector::SkillRegistry;
use crate::storage::AuditStore;
use crate::types::{ActionResult, HealingAction};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Every tag the dispatcher recognizes.
pub const ACTION_TAGS: &[&str] = &[
    "restart_skill",
    "clear_stale_connections",
    "vacuum_databases",
    "warm_ollama_models",
    "adjust_rate_limits",
    "flush_log_buffer",
];

pub struct SelfHealer {
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub ollama_url: String,
    pub ollama_keep_alive: String,
    pub rate_limit_cap_seconds: u64,
    store: Option<Arc<AuditStore>>,
    skills: Option<Arc<dyn SkillRegistry>>,
    http: reqwest::Client,
    /// Current scheduler interval, in seconds, adjusted by
    /// `adjust_rate_limits`. Modeled as process-local state standing in
    /// for the original's settings-store read/write.
    scheduler_interval_seconds: AtomicU64,
}

impl SelfHealer {
    pub fn new(
        enabled: bool,
        cooldown_seconds: i64,
        ollama_url: String,
        ollama_keep_alive: String,
        rate_limit_cap_seconds: u64,
        store: Option<Arc<AuditStore>>,
        skills: Option<Arc<dyn SkillRegistry>>,
    ) -> Self {
        Self {
            enabled,
            cooldown_seconds,
            ollama_url,
            ollama_keep_alive,
            rate_limit_cap_seconds,
            store,
            skills,
            http: reqwest::Client::new(),
            scheduler_interval_seconds: AtomicU64::new(300),
        }
    }

    /// Runs every tag in `tags` through the shared gating wrapper,
    /// returning a map tag -> succeeded. Unknown tags map to `false`
    /// with no audit entry.
    pub async fn execute_recommended(&self, tags: &[String], trigger: &str) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for tag in tags {
            let ok = self.dispatch(tag, trigger).await;
            results.insert(tag.clone(), ok);
        }
        results
    }

    async fn dispatch(&self, tag: &str, trigger: &str) -> bool {
        if !ACTION_TAGS.contains(&tag) {
            return false;
        }

        if !self.enabled {
            return false;
        }

        if self.has_recent_action(tag).await {
            return false;
        }

        let outcome = match tag {
            "restart_skill" => self.restart_skill().await,
            "clear_stale_connections" => self.clear_stale_connections().await,
            "vacuum_databases" => self.vacuum_databases().await,
            "warm_ollama_models" => self.warm_ollama_models().await,
            "adjust_rate_limits" => self.adjust_rate_limits().await,
            "flush_log_buffer" => self.flush_log_buffer().await,
            _ => unreachable!("tag already validated against ACTION_TAGS"),
        };

        let (success, details) = match outcome {
            Ok(details) => (true, details),
            Err(e) => (false, json!({ "error": e })),
        };

        self.record_action(tag, trigger, success, details).await;
        success
    }

    /// Cooldown errors are treated as "no recent action" per spec.md §4.6.
    async fn has_recent_action(&self, tag: &str) -> bool {
        match &self.store {
            Some(store) => match store.get_recent_healing_action(tag, self.cooldown_seconds).await {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    warn!(tag, error = %e, "cooldown check failed, proceeding as if no recent action");
                    false
                }
            },
            None => false,
        }
    }

    async fn record_action(&self, tag: &str, trigger: &str, success: bool, details: serde_json::Value) {
        let Some(store) = &self.store else { return };
        let action = HealingAction {
            id: None,
            timestamp: Utc::now(),
            action_type: tag.to_string(),
            trigger: trigger.to_string(),
            result: if success { ActionResult::Success } else { ActionResult::Failed },
            details,
        };
        if let Err(e) = store.save_healing_action(&action).await {
            warn!(tag, error = %e, "failed to persist healing action, swallowing");
        }
    }

    async fn restart_skill(&self) -> Result<serde_json::Value, String> {
        let Some(registry) = &self.skills else {
            return Err("no skill registry configured".to_string());
        };
        let name = registry
            .first_errored_skill()
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "no errored skill found".to_string())?;

        let ok = registry.reinitialize(&name).await.map_err(|e| e.to_string())?;
        if ok {
            info!(skill = %name, "restarted errored skill");
            Ok(json!({ "skill_name": name }))
        } else {
            Err(format!("re-initialize failed for skill {name}"))
        }
    }

    async fn clear_stale_connections(&self) -> Result<serde_json::Value, String> {
        let Some(store) = &self.store else {
            return Ok(json!({ "note": "no pool configured, no-op success" }));
        };
        // SQLite has no idle-connection notion like a server DB pool; this
        // is a best-effort no-op against the pool that still exercises the
        // action path and its audit trail.
        let _ = store.pool();
        Ok(json!({}))
    }

    async fn vacuum_databases(&self) -> Result<serde_json::Value, String> {
        let Some(store) = &self.store else {
            return Ok(json!({ "note": "no pool configured, no-op success" }));
        };
        sqlx::query("VACUUM").execute(store.pool()).await.map_err(|e| e.to_string())?;
        Ok(json!({ "tables": ["health_snapshots", "health_healing_actions"] }))
    }

    async fn warm_ollama_models(&self) -> Result<serde_json::Value, String> {
        let resp = self
            .http
            .get(&self.ollama_url)
            .send()
            .await
            .map_err(|e| format!("ollama discovery request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("ollama_status_{}", resp.status().as_u16()));
        }

        #[derive(serde::Deserialize)]
        struct TagsResponse {
            #[serde(default)]
            models: Vec<ModelEntry>,
        }
        #[derive(serde::Deserialize)]
        struct ModelEntry {
            name: String,
        }

        let body: TagsResponse = resp.json().await.unwrap_or(TagsResponse { models: Vec::new() });
        let base = self.ollama_url.trim_end_matches("/api/tags");
        let mut warmed = 0usize;
        for model in &body.models {
            let keepalive_url = format!("{base}/api/generate");
            let _ = self
                .http
                .post(&keepalive_url)
                .json(&json!({ "model": model.name, "keep_alive": self.ollama_keep_alive }))
                .send()
                .await; // best-effort; failures here don't fail the action
            warmed += 1;
        }

        Ok(json!({ "models_found": body.models.len(), "models_warmed": warmed }))
    }

    async fn adjust_rate_limits(&self) -> Result<serde_json::Value, String> {
        let previous = self.scheduler_interval_seconds.load(Ordering::SeqCst);
        let new = (previous * 2).min(self.rate_limit_cap_seconds);
        self.scheduler_interval_seconds.store(new, Ordering::SeqCst);
        Ok(json!({ "previous_interval": previous, "new_interval": new }))
    }

    async fn flush_log_buffer(&self) -> Result<serde_json::Value, String> {
        // tracing has no "root handlers" registry the way the original's
        // logging module does; its subscriber already writes through on
        // every event, so this action degenerates to a no-op that still
        // completes and is auditable.
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::SkillSummary;

    struct NoRegistry;
    #[async_trait::async_trait]
    impl SkillRegistry for NoRegistry {
        async fn status_summary(&self) -> anyhow::Result<SkillSummary> {
            Ok(SkillSummary::default())
        }
        async fn first_errored_skill(&self) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn reinitialize(&self, _name: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    async fn healer_with_store(store: Arc<AuditStore>) -> SelfHealer {
        SelfHealer::new(true, 300, "http://ollama:11434/api/tags".into(), "10m".into(), 1800, Some(store), None)
    }

    #[tokio::test]
    async fn disabled_healer_writes_no_audit_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuditStore::connect(&dir.path().join("t.db")).await.unwrap());
        let mut healer = healer_with_store(store.clone()).await;
        healer.enabled = false;

        let results = healer.execute_recommended(&["clear_stale_connections".to_string()], "test").await;
        assert_eq!(results.get("clear_stale_connections"), Some(&false));

        let actions = store
            .get_healing_actions(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuditStore::connect(&dir.path().join("t.db")).await.unwrap());
        let healer = healer_with_store(store.clone()).await;

        let first = healer.execute_recommended(&["clear_stale_connections".to_string()], "t").await;
        assert_eq!(first.get("clear_stale_connections"), Some(&true));

        let second = healer.execute_recommended(&["clear_stale_connections".to_string()], "t").await;
        assert_eq!(second.get("clear_stale_connections"), Some(&false));

        let actions = store
            .get_healing_actions(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(actions.len(), 1);
    }

    #[tokio::test]
    async fn unknown_tag_returns_false_with_no_audit_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuditStore::connect(&dir.path().join("t.db")).await.unwrap());
        let healer = healer_with_store(store.clone()).await;

        let results = healer.execute_recommended(&["not_a_real_tag".to_string()], "t").await;
        assert_eq!(results.get("not_a_real_tag"), Some(&false));
    }

    #[tokio::test]
    async fn empty_tag_list_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuditStore::connect(&dir.path().join("t.db")).await.unwrap());
        let healer = healer_with_store(store).await;
        let results = healer.execute_recommended(&[], "t").await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn adjust_rate_limits_doubles_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuditStore::connect(&dir.path().join("t.db")).await.unwrap());
        let healer = SelfHealer::new(true, 0, "http://x/api/tags".into(), "10m".into(), 500, Some(store), None);
        healer.scheduler_interval_seconds.store(400, Ordering::SeqCst);
        let details = healer.adjust_rate_limits().await.unwrap();
        assert_eq!(details["previous_interval"], 400);
        assert_eq!(details["new_interval"], 500);
    }
}
