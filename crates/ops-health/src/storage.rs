//! C5 — audit store. Append-only persistence of snapshots, daily reports,
//! healing actions, incidents, and update history, backed by SQLite via
//! `sqlx` (see SPEC_FULL.md §4.5 for the backend decision vs the original
//! Postgres-targeted implementation).

use crate::analyzer::DailyReport;
use crate::collector::MetricsSnapshot;
use crate::types::{ActionResult, HealingAction, Incident, IncidentSeverity, UpdateRecord, UpdateStatus};
use chrono::{DateTime, Duration, Utc};
use ops_common::{Error, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

pub struct AuditStore {
    pool: SqlitePool,
}

impl AuditStore {
    pub async fn connect(database_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", database_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            Error::Internal(format!("migration failed: {e}"))
        })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn save_snapshot(&self, snap: &MetricsSnapshot) -> Result<i64> {
        let metrics_json = serde_json::to_string(snap)?;
        let rec = sqlx::query(
            "INSERT INTO health_snapshots (timestamp, metrics_json) VALUES (?, ?)",
        )
        .bind(snap.timestamp)
        .bind(metrics_json)
        .execute(&self.pool)
        .await?;
        Ok(rec.last_insert_rowid())
    }

    pub async fn get_snapshots(&self, start: DateTime<Utc>, end: DateTime<Utc>, limit: i64) -> Result<Vec<MetricsSnapshot>> {
        let limit = if limit <= 0 { 1000 } else { limit };
        let rows = sqlx::query(
            "SELECT id, metrics_json FROM health_snapshots WHERE timestamp BETWEEN ? AND ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let json: String = row.try_get("metrics_json")?;
                let mut snap: MetricsSnapshot = serde_json::from_str(&json)?;
                snap.id = Some(id);
                Ok(snap)
            })
            .collect()
    }

    pub async fn get_latest_snapshot(&self) -> Result<Option<MetricsSnapshot>> {
        let row = sqlx::query("SELECT id, metrics_json FROM health_snapshots ORDER BY timestamp DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let json: String = row.try_get("metrics_json")?;
                let mut snap: MetricsSnapshot = serde_json::from_str(&json)?;
                snap.id = Some(id);
                Ok(Some(snap))
            }
            None => Ok(None),
        }
    }

    pub async fn save_daily_report(&self, report: &DailyReport) -> Result<i64> {
        let summary_json = serde_json::to_string(&report.summary)?;
        let recommendations_json = serde_json::to_string(&report.recommendations)?;
        sqlx::query(
            "INSERT INTO health_daily_reports (date, summary_json, recommendations_json, overall_score)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(date) DO UPDATE SET
               summary_json = excluded.summary_json,
               recommendations_json = excluded.recommendations_json,
               overall_score = excluded.overall_score",
        )
        .bind(&report.date)
        .bind(summary_json)
        .bind(recommendations_json)
        .bind(report.overall_score)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id FROM health_daily_reports WHERE date = ?")
            .bind(&report.date)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_daily_report(&self, date: &str) -> Result<Option<DailyReport>> {
        let row = sqlx::query(
            "SELECT id, date, summary_json, recommendations_json, overall_score FROM health_daily_reports WHERE date = ?",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_daily_report).transpose()
    }

    pub async fn get_daily_reports(&self, start: &str, end: &str) -> Result<Vec<DailyReport>> {
        let rows = sqlx::query(
            "SELECT id, date, summary_json, recommendations_json, overall_score FROM health_daily_reports
             WHERE date BETWEEN ? AND ? ORDER BY date DESC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_daily_report).collect()
    }

    fn row_to_daily_report(row: sqlx::sqlite::SqliteRow) -> Result<DailyReport> {
        let id: i64 = row.try_get("id")?;
        let date: String = row.try_get("date")?;
        let summary_json: String = row.try_get("summary_json")?;
        let recommendations_json: String = row.try_get("recommendations_json")?;
        let overall_score: f64 = row.try_get("overall_score")?;
        Ok(DailyReport {
            id: Some(id),
            date,
            summary: serde_json::from_str(&summary_json)?,
            recommendations: serde_json::from_str(&recommendations_json)?,
            overall_score,
        })
    }

    pub async fn save_healing_action(&self, action: &HealingAction) -> Result<i64> {
        let details_json = serde_json::to_string(&action.details)?;
        let result_str = match action.result {
            ActionResult::Success => "success",
            ActionResult::Failed => "failed",
        };
        let rec = sqlx::query(
            "INSERT INTO health_healing_actions (timestamp, action_type, trigger, result, details_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(action.timestamp)
        .bind(&action.action_type)
        .bind(&action.trigger)
        .bind(result_str)
        .bind(details_json)
        .execute(&self.pool)
        .await?;
        Ok(rec.last_insert_rowid())
    }

    pub async fn get_healing_actions(&self, start: DateTime<Utc>, end: DateTime<Utc>, limit: i64) -> Result<Vec<HealingAction>> {
        let limit = if limit <= 0 { 100 } else { limit };
        let rows = sqlx::query(
            "SELECT id, timestamp, action_type, trigger, result, details_json FROM health_healing_actions
             WHERE timestamp BETWEEN ? AND ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
                let action_type: String = row.try_get("action_type")?;
                let trigger: String = row.try_get("trigger")?;
                let result_str: String = row.try_get("result")?;
                let details_json: String = row.try_get("details_json")?;
                Ok(HealingAction {
                    id: Some(id),
                    timestamp,
                    action_type,
                    trigger,
                    result: if result_str == "success" { ActionResult::Success } else { ActionResult::Failed },
                    details: serde_json::from_str(&details_json)?,
                })
            })
            .collect()
    }

    /// Most recent healing action of `action_type` within the last
    /// `within_seconds` seconds, if any — used by C6's cooldown gate.
    pub async fn get_recent_healing_action(&self, action_type: &str, within_seconds: i64) -> Result<Option<HealingAction>> {
        let since = Utc::now() - Duration::seconds(within_seconds);
        let row = sqlx::query(
            "SELECT id, timestamp, action_type, trigger, result, details_json FROM health_healing_actions
             WHERE action_type = ? AND timestamp >= ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(action_type)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let id: i64 = row.try_get("id")?;
            let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
            let action_type: String = row.try_get("action_type")?;
            let trigger: String = row.try_get("trigger")?;
            let result_str: String = row.try_get("result")?;
            let details_json: String = row.try_get("details_json")?;
            Ok(HealingAction {
                id: Some(id),
                timestamp,
                action_type,
                trigger,
                result: if result_str == "success" { ActionResult::Success } else { ActionResult::Failed },
                details: serde_json::from_str(&details_json)?,
            })
        })
        .transpose()
    }

    pub async fn create_incident(&self, severity: IncidentSeverity, description: &str) -> Result<i64> {
        let rec = sqlx::query(
            "INSERT INTO health_incidents (start_time, severity, description, resolved) VALUES (?, ?, ?, 0)",
        )
        .bind(Utc::now())
        .bind(severity.as_str())
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(rec.last_insert_rowid())
    }

    pub async fn resolve_incident(&self, id: i64, resolution: &str) -> Result<()> {
        sqlx::query("UPDATE health_incidents SET resolved = 1, end_time = ?, resolution = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(resolution)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_open_incidents(&self) -> Result<Vec<Incident>> {
        let rows = sqlx::query(
            "SELECT id, start_time, end_time, severity, description, resolved, resolution
             FROM health_incidents WHERE resolved = 0 ORDER BY start_time DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let start_time: DateTime<Utc> = row.try_get("start_time")?;
                let end_time: Option<DateTime<Utc>> = row.try_get("end_time")?;
                let severity_str: String = row.try_get("severity")?;
                let description: String = row.try_get("description")?;
                let resolved: bool = row.try_get("resolved")?;
                let resolution: Option<String> = row.try_get("resolution")?;
                Ok(Incident {
                    id: Some(id),
                    start_time,
                    end_time,
                    severity: IncidentSeverity::parse_lenient(&severity_str),
                    description,
                    resolved,
                    resolution,
                })
            })
            .collect()
    }

    pub async fn save_update_record(&self, record: &UpdateRecord) -> Result<i64> {
        let health_json = record
            .health_check_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let rec = sqlx::query(
            "INSERT INTO update_history (timestamp, version, previous_version, git_sha, status, health_check_result_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.timestamp)
        .bind(&record.version)
        .bind(&record.previous_version)
        .bind(&record.git_sha)
        .bind(record.status.as_str())
        .bind(health_json)
        .execute(&self.pool)
        .await?;
        Ok(rec.last_insert_rowid())
    }

    pub async fn update_update_status(&self, id: i64, status: UpdateStatus, health_check_result: Option<&serde_json::Value>) -> Result<()> {
        let health_json = health_check_result.map(serde_json::to_string).transpose()?;
        sqlx::query("UPDATE update_history SET status = ?, health_check_result_json = COALESCE(?, health_check_result_json) WHERE id = ?")
            .bind(status.as_str())
            .bind(health_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_latest_update(&self) -> Result<Option<UpdateRecord>> {
        let row = sqlx::query(
            "SELECT id, timestamp, version, previous_version, git_sha, status, health_check_result_json
             FROM update_history ORDER BY timestamp DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_update_record).transpose()
    }

    pub async fn get_update_history(&self, limit: i64) -> Result<Vec<UpdateRecord>> {
        let limit = if limit <= 0 { 20 } else { limit };
        let rows = sqlx::query(
            "SELECT id, timestamp, version, previous_version, git_sha, status, health_check_result_json
             FROM update_history ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_update_record).collect()
    }

    fn row_to_update_record(row: sqlx::sqlite::SqliteRow) -> Result<UpdateRecord> {
        let id: i64 = row.try_get("id")?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
        let version: String = row.try_get("version")?;
        let previous_version: Option<String> = row.try_get("previous_version")?;
        let git_sha: Option<String> = row.try_get("git_sha")?;
        let status_str: String = row.try_get("status")?;
        let health_json: Option<String> = row.try_get("health_check_result_json")?;
        Ok(UpdateRecord {
            id: Some(id),
            timestamp,
            version,
            previous_version,
            git_sha,
            status: UpdateStatus::parse_lenient(&status_str),
            health_check_result: health_json.map(|j| serde_json::from_str(&j)).transpose()?,
        })
    }

    /// Deletes snapshots older than `days`, returning the deleted row
    /// count directly from `rows_affected()` — simpler than the original
    /// Postgres command-tag parse, see SPEC_FULL.md §4.5.
    pub async fn prune_old_snapshots(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query("DELETE FROM health_snapshots WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Performance, Reliability, SkillHealth, SystemMetrics, Usage};

    async fn test_store() -> AuditStore {
        let dir = tempfile::tempdir().unwrap();
        AuditStore::connect(&dir.path().join("test.db")).await.unwrap()
    }

    fn sample_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            id: None,
            timestamp: Utc::now(),
            performance: Performance::default(),
            reliability: Reliability::default(),
            usage: Usage::default(),
            system: SystemMetrics::default(),
            skills: SkillHealth::default(),
            collection_time_ms: 5,
            collected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_fetch_latest_snapshot() {
        let store = test_store().await;
        store.save_snapshot(&sample_snapshot()).await.unwrap();
        let latest = store.get_latest_snapshot().await.unwrap();
        assert!(latest.is_some());
    }

    #[tokio::test]
    async fn daily_report_upsert_by_date() {
        let store = test_store().await;
        let mut report = DailyReport {
            id: None,
            date: "2026-07-30".to_string(),
            summary: serde_json::json!({"v": 1}),
            recommendations: vec!["a".into()],
            overall_score: 90.0,
        };
        store.save_daily_report(&report).await.unwrap();
        report.overall_score = 50.0;
        report.summary = serde_json::json!({"v": 2});
        store.save_daily_report(&report).await.unwrap();

        let fetched = store.get_daily_report("2026-07-30").await.unwrap().unwrap();
        assert_eq!(fetched.overall_score, 50.0);

        let all = store.get_daily_reports("2026-01-01", "2026-12-31").await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn recent_healing_action_respects_window() {
        let store = test_store().await;
        let action = HealingAction {
            id: None,
            timestamp: Utc::now(),
            action_type: "clear_stale_connections".to_string(),
            trigger: "test".to_string(),
            result: ActionResult::Success,
            details: serde_json::json!({}),
        };
        store.save_healing_action(&action).await.unwrap();

        let recent = store.get_recent_healing_action("clear_stale_connections", 300).await.unwrap();
        assert!(recent.is_some());

        let too_old_window = store.get_recent_healing_action("clear_stale_connections", -1).await.unwrap();
        assert!(too_old_window.is_none());
    }

    #[tokio::test]
    async fn prune_old_snapshots_returns_deleted_count() {
        let store = test_store().await;
        store.save_snapshot(&sample_snapshot()).await.unwrap();
        // cutoff in the future deletes everything
        let deleted = store.prune_old_snapshots(-1).await.unwrap();
        assert_eq!(deleted, 1);
        let deleted_again = store.prune_old_snapshots(30).await.unwrap();
        assert_eq!(deleted_again, 0);
    }
}
