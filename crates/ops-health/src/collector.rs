//! C3 — metrics collector. Pulls raw signals from injected sources and
//! assembles a `MetricsSnapshot`, isolating each sub-collector so a
//! raising source degrades to a zeroed sub-record rather than failing the
//! whole snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// One usage record as pulled from the cost/usage store.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub provider: String,
    pub latency_ms: Option<f64>,
    pub success: bool,
    pub rate_limit_hit: bool,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Today's usage records, grouped by provider, for performance/usage/
/// reliability collection.
#[async_trait]
pub trait CostStore: Send + Sync {
    async fn today_usage(&self) -> anyhow::Result<Vec<UsageRecord>>;
}

/// Heartbeat action counters as tracked by the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatTotals {
    pub successful_actions: u64,
    pub failed_actions: u64,
    pub beat_count: u64,
    pub action_count: u64,
    pub uptime_seconds: u64,
}

#[async_trait]
pub trait HeartbeatStats: Send + Sync {
    async fn totals(&self) -> anyhow::Result<HeartbeatTotals>;
}

/// Summary of skill ("sub-component") registry state.
#[derive(Debug, Clone, Default)]
pub struct SkillSummary {
    pub total: u64,
    pub ready: u64,
    pub error: u64,
    pub by_status: HashMap<String, Vec<String>>,
}

#[async_trait]
pub trait SkillRegistry: Send + Sync {
    async fn status_summary(&self) -> anyhow::Result<SkillSummary>;

    /// Name of the first errored skill, if any — used by C6's
    /// `restart_skill` action, which targets whichever skill is
    /// currently failing rather than a name baked into the tag.
    async fn first_errored_skill(&self) -> anyhow::Result<Option<String>>;

    /// Re-initializes `name`, returning whether it came back healthy.
    async fn reinitialize(&self, name: &str) -> anyhow::Result<bool>;
}

/// Bundle of optional source handles. Any missing handle degrades
/// gracefully to a zeroed sub-record.
#[derive(Clone, Default)]
pub struct Sources {
    pub cost_store: Option<Arc<dyn CostStore>>,
    pub heartbeat_stats: Option<Arc<dyn HeartbeatStats>>,
    pub skill_registry: Option<Arc<dyn SkillRegistry>>,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Performance {
    pub avg_latency_ms: HashMap<String, f64>,
    pub p95_latency_ms: HashMap<String, f64>,
    pub total_requests: u64,
    pub requests_by_provider: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Reliability {
    pub error_rate: HashMap<String, f64>,
    pub total_rate_limit_hits: u64,
    pub rate_limit_hits_by_provider: HashMap<String, u64>,
    pub failing_skill_count: u64,
    pub failing_skill_names: Vec<String>,
    pub heartbeat_success_rate: f64,
    pub uptime_seconds: u64,
}

impl Default for Reliability {
    fn default() -> Self {
        Self {
            error_rate: HashMap::new(),
            total_rate_limit_hits: 0,
            rate_limit_hits_by_provider: HashMap::new(),
            failing_skill_count: 0,
            failing_skill_names: Vec::new(),
            heartbeat_success_rate: 1.0,
            uptime_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Usage {
    pub total_cost_today: f64,
    pub cost_by_provider: HashMap<String, f64>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub heartbeat_beat_count: u64,
    pub heartbeat_action_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SystemMetrics {
    pub resident_memory_mb: f64,
    pub memory_percent: f64,
    pub disk_total_gb: f64,
    pub disk_used_gb: f64,
    pub disk_free_gb: f64,
    pub disk_usage_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SkillHealth {
    pub total: u64,
    pub ready: u64,
    pub error: u64,
    pub by_status: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub performance: Performance,
    pub reliability: Reliability,
    pub usage: Usage,
    pub system: SystemMetrics,
    pub skills: SkillHealth,
    pub collection_time_ms: u64,
    pub collected_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// ready + error <= total, and per-provider P95 >= per-provider average.
    pub fn check_invariants(&self) -> bool {
        if self.skills.ready + self.skills.error > self.skills.total {
            return false;
        }
        for (provider, avg) in &self.performance.avg_latency_ms {
            if let Some(p95) = self.performance.p95_latency_ms.get(provider) {
                if p95 < avg {
                    return false;
                }
            }
        }
        true
    }
}

/// `sorted[min(floor(n*0.95), n-1)]` over ascending non-null latencies.
fn p95(mut latencies: Vec<f64>) -> f64 {
    if latencies.is_empty() {
        return 0.0;
    }
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = latencies.len();
    let idx = ((n as f64) * 0.95).floor() as usize;
    latencies[idx.min(n - 1)]
}

async fn collect_performance(records: &[UsageRecord]) -> Performance {
    let mut by_provider: HashMap<String, Vec<&UsageRecord>> = HashMap::new();
    for r in records {
        by_provider.entry(r.provider.clone()).or_default().push(r);
    }

    let mut perf = Performance::default();
    for (provider, recs) in &by_provider {
        perf.requests_by_provider.insert(provider.clone(), recs.len() as u64);
        perf.total_requests += recs.len() as u64;

        let latencies: Vec<f64> = recs.iter().filter_map(|r| r.latency_ms).collect();
        if !latencies.is_empty() {
            let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
            perf.avg_latency_ms.insert(provider.clone(), avg);
            perf.p95_latency_ms.insert(provider.clone(), p95(latencies));
        }
    }
    perf
}

async fn collect_reliability(records: &[UsageRecord], heartbeat: &HeartbeatTotals, skills: &SkillSummary) -> Reliability {
    let mut by_provider: HashMap<String, Vec<&UsageRecord>> = HashMap::new();
    for r in records {
        by_provider.entry(r.provider.clone()).or_default().push(r);
    }

    let mut rel = Reliability::default();
    for (provider, recs) in &by_provider {
        let failures = recs.iter().filter(|r| !r.success).count();
        rel.error_rate.insert(provider.clone(), failures as f64 / recs.len() as f64);

        let rl_hits = recs.iter().filter(|r| r.rate_limit_hit).count() as u64;
        rel.rate_limit_hits_by_provider.insert(provider.clone(), rl_hits);
        rel.total_rate_limit_hits += rl_hits;
    }

    let denom = heartbeat.successful_actions + heartbeat.failed_actions;
    rel.heartbeat_success_rate = if denom == 0 {
        1.0
    } else {
        heartbeat.successful_actions as f64 / denom as f64
    };
    rel.uptime_seconds = heartbeat.uptime_seconds;

    rel.failing_skill_count = skills.error;
    rel.failing_skill_names = skills.by_status.get("error").cloned().unwrap_or_default();
    rel
}

async fn collect_usage(records: &[UsageRecord], heartbeat: &HeartbeatTotals) -> Usage {
    let mut usage = Usage::default();
    for r in records {
        usage.total_cost_today += r.cost;
        *usage.cost_by_provider.entry(r.provider.clone()).or_insert(0.0) += r.cost;
        usage.total_input_tokens += r.input_tokens;
        usage.total_output_tokens += r.output_tokens;
    }
    usage.heartbeat_beat_count = heartbeat.beat_count;
    usage.heartbeat_action_count = heartbeat.action_count;
    usage
}

/// The disk whose mount point is the longest matching prefix of `path` —
/// i.e. the filesystem that actually backs the directory, not just `/`.
fn find_disk_for<'a>(disks: &'a sysinfo::Disks, path: &Path) -> Option<&'a sysinfo::Disk> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
}

/// Memory and disk usage via `sysinfo`, mirroring the gather pattern in
/// the pack's `clawnode` health command. All fields default to 0 on any
/// read failure or when no disk matches `data_dir`.
async fn collect_system(data_dir: &Path) -> SystemMetrics {
    let mut metrics = SystemMetrics::default();

    let mut sys = sysinfo::System::new_all();
    sys.refresh_memory();
    let mem_total = sys.total_memory();
    if mem_total > 0 {
        let mem_used = sys.used_memory();
        metrics.resident_memory_mb = mem_used as f64 / (1024.0 * 1024.0);
        metrics.memory_percent = mem_used as f64 / mem_total as f64 * 100.0;
    }

    let disks = sysinfo::Disks::new_with_refreshed_list();
    match find_disk_for(&disks, data_dir) {
        Some(disk) => {
            let total = disk.total_space();
            let available = disk.available_space();
            let used = total.saturating_sub(available);
            const GB: f64 = 1024.0 * 1024.0 * 1024.0;
            metrics.disk_total_gb = total as f64 / GB;
            metrics.disk_used_gb = used as f64 / GB;
            metrics.disk_free_gb = available as f64 / GB;
            metrics.disk_usage_percent = if total > 0 { used as f64 / total as f64 * 100.0 } else { 0.0 };
        }
        None => warn!(dir = %data_dir.display(), "no mounted disk found for data dir, disk metrics zeroed"),
    }

    metrics
}

async fn collect_skill_health(summary: &SkillSummary) -> SkillHealth {
    SkillHealth {
        total: summary.total,
        ready: summary.ready,
        error: summary.error,
        by_status: summary.by_status.clone(),
    }
}

/// Collects every sub-record and assembles the full snapshot.
pub async fn collect_all(sources: &Sources) -> MetricsSnapshot {
    let started = Instant::now();

    let records = match &sources.cost_store {
        Some(store) => store.today_usage().await.unwrap_or_else(|e| {
            warn!(error = %e, "cost store fetch failed, using empty record set");
            Vec::new()
        }),
        None => Vec::new(),
    };

    let heartbeat = match &sources.heartbeat_stats {
        Some(stats) => stats.totals().await.unwrap_or_else(|e| {
            warn!(error = %e, "heartbeat stats fetch failed, defaulting to zero");
            HeartbeatTotals::default()
        }),
        None => HeartbeatTotals::default(),
    };

    let skills = match &sources.skill_registry {
        Some(registry) => registry.status_summary().await.unwrap_or_else(|e| {
            warn!(error = %e, "skill registry fetch failed, defaulting to zero");
            SkillSummary::default()
        }),
        None => SkillSummary::default(),
    };

    let performance = collect_performance(&records).await;
    let reliability = collect_reliability(&records, &heartbeat, &skills).await;
    let usage = collect_usage(&records, &heartbeat).await;
    let system = collect_system(&sources.data_dir).await;
    let skill_health = collect_skill_health(&skills).await;

    let now = Utc::now();
    MetricsSnapshot {
        id: None,
        timestamp: now,
        performance,
        reliability,
        usage,
        system,
        skills: skill_health,
        collection_time_ms: started.elapsed().as_millis() as u64,
        collected_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, latency: Option<f64>, success: bool) -> UsageRecord {
        UsageRecord {
            provider: provider.to_string(),
            latency_ms: latency,
            success,
            rate_limit_hit: false,
            cost: 1.0,
            input_tokens: 10,
            output_tokens: 5,
        }
    }

    #[test]
    fn p95_single_value_equals_that_value() {
        assert_eq!(p95(vec![42.0]), 42.0);
    }

    #[test]
    fn p95_matches_known_index_for_n_twenty() {
        let values: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        // idx = floor(20 * 0.95) = 19, clamped to n-1=19 -> last element (20.0)
        assert_eq!(p95(values), 20.0);
    }

    #[tokio::test]
    async fn performance_excludes_null_latency_from_average() {
        let records = vec![record("openai", Some(100.0), true), record("openai", None, true)];
        let perf = collect_performance(&records).await;
        assert_eq!(perf.avg_latency_ms["openai"], 100.0);
        assert_eq!(perf.requests_by_provider["openai"], 2);
    }

    #[tokio::test]
    async fn reliability_defaults_heartbeat_rate_to_one_when_no_actions() {
        let rel = collect_reliability(&[], &HeartbeatTotals::default(), &SkillSummary::default()).await;
        assert_eq!(rel.heartbeat_success_rate, 1.0);
    }

    #[test]
    fn snapshot_invariants_catch_p95_below_average() {
        let mut snap_perf = Performance::default();
        snap_perf.avg_latency_ms.insert("x".into(), 10.0);
        snap_perf.p95_latency_ms.insert("x".into(), 5.0);
        let snap = MetricsSnapshot {
            id: None,
            timestamp: Utc::now(),
            performance: snap_perf,
            reliability: Reliability::default(),
            usage: Usage::default(),
            system: SystemMetrics::default(),
            skills: SkillHealth::default(),
            collection_time_ms: 0,
            collected_at: Utc::now(),
        };
        assert!(!snap.check_invariants());
    }

    proptest::proptest! {
        /// spec.md §8: "for any per-provider P95 >= per-provider average",
        /// checked against arbitrary non-empty latency vectors rather than
        /// a handful of hand-picked ones.
        #[test]
        fn p95_never_falls_below_average(latencies in proptest::collection::vec(0.0f64..100_000.0, 1..200)) {
            let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
            let observed_p95 = p95(latencies);
            proptest::prop_assert!(observed_p95 >= avg - 1e-9);
        }
    }
}
