//! C4 — health analyzer. Turns a snapshot (+ optional baseline window)
//! into anomaly judgements and recommended remediation tags.

use crate::collector::MetricsSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub severity: AnomalySeverity,
    pub description: String,
    pub metric_path: String,
    pub observed: f64,
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub anomalies: Vec<Anomaly>,
    pub has_critical: bool,
    pub recommended_actions: Vec<String>,
}

impl AnalysisResult {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "anomalies": self.anomalies,
            "has_critical": self.has_critical,
            "recommended_actions": self.recommended_actions,
        })
    }
}

fn push_action(actions: &mut Vec<String>, tag: &str) {
    if !actions.iter().any(|a| a == tag) {
        actions.push(tag.to_string());
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len();
    Some(if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    })
}

/// Analyzes `snap` against the fixed thresholds in spec.md §4.4, using
/// `baseline` (the last `baseline_window` snapshots, oldest first) to
/// derive the P95-vs-median latency comparison.
pub fn analyze_snapshot(snap: &MetricsSnapshot, baseline: &[MetricsSnapshot]) -> AnalysisResult {
    let mut anomalies = Vec::new();
    let mut actions = Vec::new();

    // Provider error rate.
    for (provider, rate) in &snap.reliability.error_rate {
        if *rate > 0.3 {
            anomalies.push(Anomaly {
                severity: AnomalySeverity::Critical,
                description: format!("provider {provider} error rate {rate:.2} exceeds 0.3"),
                metric_path: format!("reliability.error_rate.{provider}"),
                observed: *rate,
                threshold: Some(0.3),
            });
        } else if *rate > 0.1 {
            anomalies.push(Anomaly {
                severity: AnomalySeverity::Warning,
                description: format!("provider {provider} error rate {rate:.2} exceeds 0.1"),
                metric_path: format!("reliability.error_rate.{provider}"),
                observed: *rate,
                threshold: Some(0.1),
            });
        }
    }

    // P95 latency vs baseline-window median, per provider.
    for (provider, p95) in &snap.performance.p95_latency_ms {
        let baseline_values: Vec<f64> = baseline
            .iter()
            .filter_map(|s| s.performance.p95_latency_ms.get(provider).copied())
            .collect();
        if let Some(med) = median(baseline_values) {
            if med > 0.0 {
                if *p95 > med * 5.0 {
                    anomalies.push(Anomaly {
                        severity: AnomalySeverity::Critical,
                        description: format!("provider {provider} P95 {p95:.0}ms exceeds 5x baseline median {med:.0}ms"),
                        metric_path: format!("performance.p95_latency_ms.{provider}"),
                        observed: *p95,
                        threshold: Some(med * 5.0),
                    });
                    push_action(&mut actions, "warm_ollama_models");
                } else if *p95 > med * 3.0 {
                    anomalies.push(Anomaly {
                        severity: AnomalySeverity::Warning,
                        description: format!("provider {provider} P95 {p95:.0}ms exceeds 3x baseline median {med:.0}ms"),
                        metric_path: format!("performance.p95_latency_ms.{provider}"),
                        observed: *p95,
                        threshold: Some(med * 3.0),
                    });
                    push_action(&mut actions, "warm_ollama_models");
                }
            }
        }
    }

    // Heartbeat success rate.
    let hb = snap.reliability.heartbeat_success_rate;
    if hb < 0.80 {
        anomalies.push(Anomaly {
            severity: AnomalySeverity::Critical,
            description: format!("heartbeat success rate {hb:.2} below 0.80"),
            metric_path: "reliability.heartbeat_success_rate".to_string(),
            observed: hb,
            threshold: Some(0.80),
        });
    } else if hb < 0.95 {
        anomalies.push(Anomaly {
            severity: AnomalySeverity::Warning,
            description: format!("heartbeat success rate {hb:.2} below 0.95"),
            metric_path: "reliability.heartbeat_success_rate".to_string(),
            observed: hb,
            threshold: Some(0.95),
        });
    }

    // Skill errors.
    if snap.skills.ready == 0 && snap.skills.total > 0 {
        anomalies.push(Anomaly {
            severity: AnomalySeverity::Critical,
            description: "no skills ready while total > 0".to_string(),
            metric_path: "skills.ready".to_string(),
            observed: 0.0,
            threshold: Some(0.0),
        });
        push_action(&mut actions, "restart_skill");
    } else if snap.skills.error > 0 {
        anomalies.push(Anomaly {
            severity: AnomalySeverity::Warning,
            description: format!("{} skill(s) in error state", snap.skills.error),
            metric_path: "skills.error".to_string(),
            observed: snap.skills.error as f64,
            threshold: Some(0.0),
        });
        push_action(&mut actions, "restart_skill");
    }

    // Memory.
    let mem = snap.system.memory_percent;
    if mem > 95.0 {
        anomalies.push(Anomaly {
            severity: AnomalySeverity::Critical,
            description: format!("memory usage {mem:.1}% exceeds 95%"),
            metric_path: "system.memory_percent".to_string(),
            observed: mem,
            threshold: Some(95.0),
        });
        push_action(&mut actions, "clear_stale_connections");
    } else if mem > 85.0 {
        anomalies.push(Anomaly {
            severity: AnomalySeverity::Warning,
            description: format!("memory usage {mem:.1}% exceeds 85%"),
            metric_path: "system.memory_percent".to_string(),
            observed: mem,
            threshold: Some(85.0),
        });
        push_action(&mut actions, "clear_stale_connections");
    }

    // Disk.
    let disk = snap.system.disk_usage_percent;
    if disk > 97.0 {
        anomalies.push(Anomaly {
            severity: AnomalySeverity::Critical,
            description: format!("disk usage {disk:.1}% exceeds 97%"),
            metric_path: "system.disk_usage_percent".to_string(),
            observed: disk,
            threshold: Some(97.0),
        });
        push_action(&mut actions, "vacuum_databases");
    } else if disk > 90.0 {
        anomalies.push(Anomaly {
            severity: AnomalySeverity::Warning,
            description: format!("disk usage {disk:.1}% exceeds 90%"),
            metric_path: "system.disk_usage_percent".to_string(),
            observed: disk,
            threshold: Some(90.0),
        });
        push_action(&mut actions, "vacuum_databases");
    }

    // Persistent rate-limit hits -> adjust_rate_limits.
    if snap.reliability.total_rate_limit_hits > 0 {
        push_action(&mut actions, "adjust_rate_limits");
    }

    // Log-buffer backlog, inferred via a skill reporting itself under the
    // `log_buffer_backlog` status bucket -> flush_log_buffer.
    if let Some(names) = snap.skills.by_status.get("log_buffer_backlog") {
        if !names.is_empty() {
            anomalies.push(Anomaly {
                severity: AnomalySeverity::Warning,
                description: format!("{} skill(s) reporting log buffer backlog", names.len()),
                metric_path: "skills.by_status.log_buffer_backlog".to_string(),
                observed: names.len() as f64,
                threshold: Some(0.0),
            });
            push_action(&mut actions, "flush_log_buffer");
        }
    }

    let has_critical = anomalies.iter().any(|a| a.severity == AnomalySeverity::Critical);

    AnalysisResult {
        anomalies,
        has_critical,
        recommended_actions: actions,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub id: Option<i64>,
    pub date: String,
    pub summary: serde_json::Value,
    pub recommendations: Vec<String>,
    pub overall_score: f64,
}

/// Aggregates a day's snapshots into a `DailyReport`.
pub fn generate_daily_report(date: &str, snapshots: &[MetricsSnapshot]) -> DailyReport {
    let mut total_requests = 0u64;
    let mut total_cost = 0.0;
    let mut peak_memory = 0.0f64;
    let mut peak_disk = 0.0f64;
    let mut penalty = 0.0f64;
    let mut recommendations = Vec::new();

    for snap in snapshots {
        total_requests += snap.performance.total_requests;
        total_cost += snap.usage.total_cost_today;
        peak_memory = peak_memory.max(snap.system.memory_percent);
        peak_disk = peak_disk.max(snap.system.disk_usage_percent);

        let result = analyze_snapshot(snap, &[]);
        for a in &result.anomalies {
            penalty += match a.severity {
                AnomalySeverity::Critical => 15.0,
                AnomalySeverity::Warning => 5.0,
            };
        }
        for tag in result.recommended_actions {
            if !recommendations.contains(&tag) {
                recommendations.push(tag);
            }
        }
    }

    recommendations.truncate(5);

    let overall_score = (100.0 - penalty).clamp(0.0, 100.0);

    DailyReport {
        id: None,
        date: date.to_string(),
        summary: serde_json::json!({
            "total_requests": total_requests,
            "total_cost": total_cost,
            "peak_memory_percent": peak_memory,
            "peak_disk_percent": peak_disk,
            "snapshot_count": snapshots.len(),
        }),
        recommendations,
        overall_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn empty_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            id: None,
            timestamp: Utc::now(),
            performance: crate::collector::Performance::default(),
            reliability: crate::collector::Reliability::default(),
            usage: crate::collector::Usage::default(),
            system: crate::collector::SystemMetrics::default(),
            skills: crate::collector::SkillHealth::default(),
            collection_time_ms: 0,
            collected_at: Utc::now(),
        }
    }

    #[test]
    fn has_critical_matches_any_critical_anomaly() {
        let mut snap = empty_snapshot();
        snap.system.memory_percent = 99.0;
        let result = analyze_snapshot(&snap, &[]);
        assert!(result.has_critical);
        assert!(result.anomalies.iter().any(|a| a.severity == AnomalySeverity::Critical));
    }

    #[test]
    fn no_anomalies_means_not_critical() {
        let snap = empty_snapshot();
        let result = analyze_snapshot(&snap, &[]);
        assert!(!result.has_critical);
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn ready_zero_with_total_positive_is_critical_and_recommends_restart() {
        let mut snap = empty_snapshot();
        snap.skills.total = 3;
        snap.skills.ready = 0;
        let result = analyze_snapshot(&snap, &[]);
        assert!(result.has_critical);
        assert!(result.recommended_actions.contains(&"restart_skill".to_string()));
    }

    #[test]
    fn error_rate_thresholds_produce_expected_severities() {
        let mut snap = empty_snapshot();
        let mut rates = HashMap::new();
        rates.insert("openai".to_string(), 0.35);
        snap.reliability.error_rate = rates;
        let result = analyze_snapshot(&snap, &[]);
        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(result.anomalies[0].severity, AnomalySeverity::Critical);
    }

    #[test]
    fn log_buffer_backlog_skill_status_recommends_flush() {
        let mut snap = empty_snapshot();
        snap.skills.by_status.insert("log_buffer_backlog".to_string(), vec!["ingest".to_string()]);
        let result = analyze_snapshot(&snap, &[]);
        assert!(result.recommended_actions.contains(&"flush_log_buffer".to_string()));
        assert!(!result.has_critical);
    }

    #[test]
    fn daily_report_truncates_recommendations_to_five() {
        let mut snapshots = Vec::new();
        for _ in 0..3 {
            let mut snap = empty_snapshot();
            snap.skills.total = 1;
            snap.skills.ready = 0;
            snap.system.memory_percent = 99.0;
            snap.system.disk_usage_percent = 99.0;
            snap.reliability.total_rate_limit_hits = 1;
            snapshots.push(snap);
        }
        let report = generate_daily_report("2026-07-30", &snapshots);
        assert!(report.recommendations.len() <= 5);
        assert!(report.overall_score <= 100.0);
    }
}
