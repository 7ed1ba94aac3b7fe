//! C7 — observer loop. Driven by an external heartbeat; every 6th tick
//! runs collect -> analyze -> heal -> alert, every 288th tick builds a
//! daily rollup.

use crate::analyzer::{analyze_snapshot, generate_daily_report};
use crate::collector::{collect_all, MetricsSnapshot, Sources};
use crate::healer::SelfHealer;
use crate::storage::AuditStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAction {
    pub skill_name: String,
    pub action_type: String,
    pub user_id: String,
    pub priority: u8,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum HandleIntent {
    HealthCheck,
    HealthReport,
    SystemStatus,
}

pub struct ObserverConfig {
    pub analysis_every_n_ticks: u64,
    pub daily_report_every_n_ticks: u64,
    pub baseline_window: usize,
}

pub struct Observer {
    config: ObserverConfig,
    sources: Sources,
    store: Arc<AuditStore>,
    healer: Arc<SelfHealer>,
    beat_count: AtomicU64,
}

impl Observer {
    pub fn new(config: ObserverConfig, sources: Sources, store: Arc<AuditStore>, healer: Arc<SelfHealer>) -> Self {
        Self {
            config,
            sources,
            store,
            healer,
            beat_count: AtomicU64::new(0),
        }
    }

    /// Runs one heartbeat tick. Every failure surface is logged and
    /// swallowed; the beat counter always advances and this always
    /// returns (possibly empty) pending alert actions.
    pub async fn on_heartbeat(&self, owner_ids: &[String]) -> Vec<HeartbeatAction> {
        let mut actions = Vec::new();

        let snapshot = collect_all(&self.sources).await;
        if let Err(e) = self.store.save_snapshot(&snapshot).await {
            warn!(error = %e, "snapshot persistence failed, continuing");
        }

        let beat = self.beat_count.fetch_add(1, Ordering::SeqCst) + 1;

        if beat % self.config.analysis_every_n_ticks == 0 {
            actions.extend(self.run_analysis(&snapshot, owner_ids).await);
        }

        if beat % self.config.daily_report_every_n_ticks == 0 {
            self.run_daily_report().await;
        }

        actions
    }

    async fn run_analysis(&self, latest: &MetricsSnapshot, owner_ids: &[String]) -> Vec<HeartbeatAction> {
        let baseline = match self
            .store
            .get_snapshots(Utc::now() - chrono::Duration::days(1), Utc::now(), self.config.baseline_window as i64)
            .await
        {
            Ok(mut snaps) => {
                snaps.reverse(); // oldest first
                snaps
            }
            Err(e) => {
                warn!(error = %e, "baseline fetch failed, analyzing without baseline");
                Vec::new()
            }
        };

        let result = analyze_snapshot(latest, &baseline);

        if !result.recommended_actions.is_empty() {
            let _ = self.healer.execute_recommended(&result.recommended_actions, "anomaly_detection").await;
        }

        let mut actions = Vec::new();
        if result.has_critical && !owner_ids.is_empty() {
            let critical_descriptions: Vec<&str> = result
                .anomalies
                .iter()
                .filter(|a| a.severity == crate::analyzer::AnomalySeverity::Critical)
                .map(|a| a.description.as_str())
                .take(5)
                .collect();

            let message = format!("Health Alert: {}", critical_descriptions.join("; "));
            actions.push(HeartbeatAction {
                skill_name: "health_analyzer".to_string(),
                action_type: "send_message".to_string(),
                user_id: owner_ids[0].clone(),
                priority: 9,
                data: serde_json::json!({ "message": message }),
            });
        }

        actions
    }

    async fn run_daily_report(&self) {
        let window_size = self.config.daily_report_every_n_ticks as i64;
        let snapshots = match self.store.get_snapshots(Utc::now() - chrono::Duration::days(2), Utc::now(), window_size).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "daily report snapshot fetch failed, skipping");
                return;
            }
        };

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let report = generate_daily_report(&date, &snapshots);
        if let Err(e) = self.store.save_daily_report(&report).await {
            warn!(error = %e, "daily report persistence failed");
        }
    }

    /// Synchronous query surface: `health_check`, `health_report`,
    /// `system_status`.
    pub async fn handle(&self, intent: HandleIntent) -> Result<serde_json::Value, String> {
        match intent {
            HandleIntent::HealthCheck => {
                let snap = self.store.get_latest_snapshot().await.map_err(|e| e.to_string())?;
                let snap = match snap {
                    Some(s) => s,
                    None => return Ok(serde_json::json!({ "status": "healthy", "metrics": {} })),
                };

                let status = if snap.skills.total > 0 && snap.skills.ready == 0 {
                    HandleStatus::Critical
                } else if snap.skills.error > 0 || snap.reliability.error_rate.values().any(|r| *r > 0.1) {
                    HandleStatus::Degraded
                } else {
                    HandleStatus::Healthy
                };

                Ok(serde_json::json!({ "status": status, "metrics": snap }))
            }
            HandleIntent::HealthReport => {
                let today = Utc::now().format("%Y-%m-%d").to_string();
                let yesterday = (Utc::now() - chrono::Duration::days(1)).format("%Y-%m-%d").to_string();

                let report = self.store.get_daily_report(&today).await.map_err(|e| e.to_string())?;
                let report = match report {
                    Some(r) => Some(r),
                    None => self.store.get_daily_report(&yesterday).await.map_err(|e| e.to_string())?,
                };

                match report {
                    Some(r) => Ok(serde_json::to_value(r).unwrap()),
                    None => Ok(serde_json::json!({ "message": "no reports available" })),
                }
            }
            HandleIntent::SystemStatus => {
                let snap = self.store.get_latest_snapshot().await.map_err(|e| e.to_string())?;
                Ok(serde_json::to_value(snap).unwrap())
            }
        }
    }

    /// `[Health] Uptime: Xh | Cost today: $Y | Skills: R/T ready`, built
    /// from a fresh collect. Any error yields `None`.
    pub async fn system_prompt_fragment(&self) -> Option<String> {
        let snap = collect_all(&self.sources).await;
        let hours = snap.reliability.uptime_seconds / 3600;
        Some(format!(
            "[Health] Uptime: {}h | Cost today: ${:.2} | Skills: {}/{} ready",
            hours, snap.usage.total_cost_today, snap.skills.ready, snap.skills.total
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Sources;

    async fn observer(every: u64, daily: u64) -> (Observer, Arc<AuditStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuditStore::connect(&dir.path().join("t.db")).await.unwrap());
        let healer = Arc::new(SelfHealer::new(true, 300, "http://x/api/tags".into(), "10m".into(), 1800, Some(store.clone()), None));
        let config = ObserverConfig {
            analysis_every_n_ticks: every,
            daily_report_every_n_ticks: daily,
            baseline_window: 6,
        };
        (Observer::new(config, Sources::default(), store.clone(), healer), store)
    }

    #[tokio::test]
    async fn beats_one_through_five_run_no_analysis() {
        let (observer, _store) = observer(6, 288).await;
        for _ in 1..=5 {
            let actions = observer.on_heartbeat(&["owner-1".to_string()]).await;
            assert!(actions.is_empty());
        }
    }

    #[tokio::test]
    async fn beat_count_always_advances_even_without_owners() {
        let (observer, _store) = observer(6, 288).await;
        let actions = observer.on_heartbeat(&[]).await;
        assert!(actions.is_empty());
        assert_eq!(observer.beat_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_check_reports_healthy_with_no_snapshots() {
        let (observer, _store) = observer(6, 288).await;
        let result = observer.handle(HandleIntent::HealthCheck).await.unwrap();
        assert_eq!(result["status"], "healthy");
    }
}
