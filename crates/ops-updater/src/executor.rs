//! C8 — blue/green update executor. Orchestrates the fetch/build/probe/
//! swap/rotate sequence via the command runner and prober from
//! `ops-health`, with automatic pause-and-rollback on any step failure.

use crate::models::{Color, OperationState, UpdateResult, UpdateResultStatus, UpdateRuntimeState};
use chrono::Utc;
use ops_health::{check_all_services, check_service_health, run, shell_quote, HealthCheckConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct ExecutorConfig {
    pub project_dir: PathBuf,
    pub compose_file: PathBuf,
    pub route_config_path: PathBuf,
    pub runtime_state_path: PathBuf,
    pub health_urls: HashMap<String, String>,
    pub pause_on_failure: bool,
}

pub struct UpdateExecutor {
    config: ExecutorConfig,
    http: reqwest::Client,
    lock: Mutex<()>,
    phase: AtomicU8,
}

const PHASE_IDLE: u8 = 0;
const PHASE_UPDATING: u8 = 1;
const PHASE_ROLLING_BACK: u8 = 2;

fn compose_prefix(config: &ExecutorConfig) -> String {
    format!("compose -f {}", shell_quote(&config.compose_file.to_string_lossy()))
}

impl UpdateExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            lock: Mutex::new(()),
            phase: AtomicU8::new(PHASE_IDLE),
        }
    }

    fn health_url(&self, key: &str) -> String {
        self.config.health_urls.get(key).cloned().unwrap_or_default()
    }

    async fn read_state(&self) -> UpdateRuntimeState {
        match tokio::fs::read_to_string(&self.config.runtime_state_path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => UpdateRuntimeState::default(),
        }
    }

    /// Atomically persists `state` via temp-file-then-rename.
    async fn write_state(&self, state: &UpdateRuntimeState) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(state).unwrap_or_default();
        let tmp = self.config.runtime_state_path.with_extension("tmp");
        if let Some(parent) = self.config.runtime_state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.config.runtime_state_path).await
    }

    /// Writes the routing YAML with `color` wired as the active backend
    /// for both `skills` and `api` routers. Atomic via temp-file-then-
    /// rename; a partially written temp file never becomes live.
    async fn write_route_file(&self, color: Color) -> std::io::Result<()> {
        let doc = serde_yaml::to_string(&route_document(color)).unwrap_or_default();
        let tmp = self.config.route_config_path.with_extension("tmp");
        if let Some(parent) = self.config.route_config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, doc).await?;
        tokio::fs::rename(&tmp, &self.config.route_config_path).await
    }

    async fn read_route_color(&self) -> Option<Color> {
        let contents = tokio::fs::read_to_string(&self.config.route_config_path).await.ok()?;
        if contents.contains("skills-green") {
            Some(Color::Green)
        } else if contents.contains("skills-blue") {
            Some(Color::Blue)
        } else {
            None
        }
    }

    /// Switches the route file and runtime state to `color`. A no-op
    /// (but still writes) if already the active color — idempotent on a
    /// second identical call.
    async fn switch_active_color(&self, color: Color) -> bool {
        let already = self.read_route_color().await == Some(color);
        if already {
            return true;
        }
        if self.write_route_file(color).await.is_err() {
            return false;
        }
        let mut state = self.read_state().await;
        state.active_color = color;
        self.write_state(&state).await.is_ok()
    }

    async fn run_cmd(&self, args: &str, timeout_seconds: u64) -> Option<String> {
        let cmd = format!("{} {}", compose_prefix(&self.config), args);
        run(&cmd, timeout_seconds, &self.config.project_dir).await
    }

    async fn git(&self, args: &str, timeout_seconds: u64) -> Option<String> {
        run(&format!("git {args}"), timeout_seconds, &self.config.project_dir).await
    }

    /// Runs `apply_update`'s state machine. Refuses with `status=failed`
    /// when another operation holds the lock or when `paused=true`.
    pub async fn apply_update(&self, tag: &str, version: &str) -> UpdateResult {
        let started_at = Utc::now();
        let started = Instant::now();

        let Ok(_guard) = self.lock.try_lock() else {
            let state = self.read_state().await;
            let mut result = UpdateResult::new(started_at, state.active_color);
            result.error = Some("Update already in progress".to_string());
            return result;
        };

        let mut state = self.read_state().await;
        if state.paused {
            let mut result = UpdateResult::new(started_at, state.active_color);
            result.error = Some(format!("updater paused: {}", state.pause_reason.clone().unwrap_or_default()));
            result.paused = true;
            result.pause_reason = state.pause_reason.clone();
            return result;
        }

        self.phase.store(PHASE_UPDATING, Ordering::SeqCst);

        let active = state.active_color;
        let target = active.other();
        let mut result = UpdateResult::new(started_at, active);
        result.target_color = Some(target);

        state.last_attempted_tag = Some(tag.to_string());
        state.last_checked_at = Some(started_at);
        let _ = self.write_state(&state).await;

        macro_rules! step {
            ($name:expr, $body:expr) => {
                match $body {
                    Some(v) => {
                        result.steps_completed.push($name.to_string());
                        v
                    }
                    None => {
                        warn!(step = %$name, "update step failed");
                        return self.pause_and_rollback(result, active, format!("{} failed", $name)).await;
                    }
                }
            };
        }

        let previous_sha = step!("capture_previous_sha", self.git("rev-parse HEAD", 30).await);
        result.previous_sha = Some(previous_sha.clone());

        step!(
            "fetch_tag",
            self.git(&format!("fetch --force origin refs/tags/{0}:refs/tags/{0}", shell_quote(tag)), 120).await
        );

        step!("checkout_tag", self.git(&format!("checkout --force refs/tags/{}", shell_quote(tag)), 30).await);

        let new_sha = step!("capture_new_sha", self.git("rev-parse HEAD", 30).await);
        result.new_sha = Some(new_sha);

        let target_str = target.as_str();
        step!(
            "build_target",
            self.run_cmd(&format!("build skills-{target_str} api-{target_str} bot"), 1200).await
        );

        for svc in ["skills", "api"] {
            step!(
                format!("up_{svc}_{target_str}"),
                self.run_cmd(&format!("up -d --no-deps {svc}-{target_str}"), 60).await
            );
            let direct_ok = check_service_health(
                &self.http,
                &self.health_url(&format!("{svc}-{target_str}")),
                HealthCheckConfig { retries: 8, delay_seconds: 8, timeout_seconds: 5 },
            )
            .await;
            if !direct_ok {
                return self.pause_and_rollback(result, active, format!("{svc} direct health probe failed")).await;
            }
            result.steps_completed.push(format!("probe_{svc}_direct"));
        }

        if !self.switch_active_color(target).await {
            return self.pause_and_rollback(result, active, "route switch failed".to_string()).await;
        }
        result.steps_completed.push("switch_route".to_string());

        let routed_urls = vec![self.health_url("routed_skills"), self.health_url("routed_api")];
        let routed_ok =
            check_all_services(&self.http, &routed_urls, HealthCheckConfig { retries: 8, delay_seconds: 5, timeout_seconds: 5 }).await;
        if !routed_ok {
            return self.pause_and_rollback(result, active, "routed health probe failed".to_string()).await;
        }
        result.steps_completed.push("probe_routed".to_string());

        step!("up_bot", self.run_cmd("up -d --no-deps bot", 60).await);
        let running = step!("ps_bot", self.run_cmd("ps --services --status running", 15).await);
        if !running.lines().any(|l| l.trim() == "bot") {
            return self.pause_and_rollback(result, active, "bot did not reach running state".to_string()).await;
        }
        result.steps_completed.push("verify_bot_running".to_string());

        let active_str = active.as_str();
        let _ = self.run_cmd(&format!("stop skills-{active_str} api-{active_str}"), 180).await;
        result.steps_completed.push("stop_previous".to_string());

        let mut state = self.read_state().await;
        state.active_color = target;
        state.last_good_tag = Some(tag.to_string());
        state.last_success_at = Some(Utc::now());
        state.paused = false;
        let _ = self.write_state(&state).await;

        result.status = UpdateResultStatus::Success;
        result.active_color = target;
        result.completed_at = Some(Utc::now());
        result.duration_seconds = started.elapsed().as_secs_f64();
        info!(tag, version, target = target_str, "update applied successfully");
        self.phase.store(PHASE_IDLE, Ordering::SeqCst);
        result
    }

    async fn pause_and_rollback(&self, mut result: UpdateResult, previous_color: Color, reason: String) -> UpdateResult {
        let previous_sha = result.previous_sha.clone().unwrap_or_default();
        warn!(reason = %reason, "apply_update step failed, attempting rollback");
        self.phase.store(PHASE_ROLLING_BACK, Ordering::SeqCst);

        let rolled_back = self.attempt_rollback(&previous_sha, previous_color).await;

        let mut state = self.read_state().await;
        state.active_color = previous_color;
        state.last_failure_at = Some(Utc::now());
        if self.config.pause_on_failure {
            state.paused = true;
            state.pause_reason = Some(reason.clone());
        }
        let _ = self.write_state(&state).await;

        result.status = if rolled_back { UpdateResultStatus::RolledBack } else { UpdateResultStatus::Failed };
        result.error = Some(reason);
        result.active_color = previous_color;
        result.paused = state.paused;
        result.pause_reason = state.pause_reason;
        result.completed_at = Some(Utc::now());
        self.phase.store(PHASE_IDLE, Ordering::SeqCst);
        result
    }

    /// Steps a-f of `spec.md` §4.8's rollback procedure.
    async fn attempt_rollback(&self, previous_sha: &str, previous_color: Color) -> bool {
        if previous_sha.is_empty() {
            return false;
        }
        if self.git(&format!("checkout --force {}", shell_quote(previous_sha)), 30).await.is_none() {
            return false;
        }

        let color_str = previous_color.as_str();
        if self.run_cmd(&format!("build skills-{color_str} api-{color_str} bot"), 1200).await.is_none() {
            return false;
        }
        if self.run_cmd(&format!("up -d --no-deps skills-{color_str} api-{color_str}"), 60).await.is_none() {
            return false;
        }

        let direct_ok = check_all_services(
            &self.http,
            &[self.health_url(&format!("skills-{color_str}")), self.health_url(&format!("api-{color_str}"))],
            HealthCheckConfig { retries: 8, delay_seconds: 8, timeout_seconds: 5 },
        )
        .await;
        if !direct_ok {
            return false;
        }

        if !self.switch_active_color(previous_color).await {
            return false;
        }

        let routed_ok = check_all_services(
            &self.http,
            &[self.health_url("routed_skills"), self.health_url("routed_api")],
            HealthCheckConfig { retries: 8, delay_seconds: 5, timeout_seconds: 5 },
        )
        .await;
        if !routed_ok {
            return false;
        }

        if self.run_cmd("up -d --no-deps bot", 60).await.is_none() {
            return false;
        }
        let running = self.run_cmd("ps --services --status running", 15).await.unwrap_or_default();
        if !running.lines().any(|l| l.trim() == "bot") {
            return false;
        }

        let inactive = previous_color.other();
        let inactive_str = inactive.as_str();
        let _ = self.run_cmd(&format!("stop skills-{inactive_str} api-{inactive_str}"), 180).await;

        true
    }

    /// Manual rollback: runs steps a-f directly with `previous_color =
    /// active_color`.
    pub async fn rollback(&self, previous_sha: &str) -> UpdateResult {
        let started_at = Utc::now();
        let started = Instant::now();

        let Ok(_guard) = self.lock.try_lock() else {
            let state = self.read_state().await;
            let mut result = UpdateResult::new(started_at, state.active_color);
            result.error = Some("Update already in progress".to_string());
            return result;
        };

        let state = self.read_state().await;
        let active = state.active_color;
        let mut result = UpdateResult::new(started_at, active);
        result.previous_sha = Some(previous_sha.to_string());

        self.phase.store(PHASE_ROLLING_BACK, Ordering::SeqCst);
        let ok = self.attempt_rollback(previous_sha, active).await;

        let mut state = self.read_state().await;
        state.last_failure_at = Some(Utc::now());
        let _ = self.write_state(&state).await;

        result.status = if ok { UpdateResultStatus::RolledBack } else { UpdateResultStatus::Failed };
        if !ok {
            result.error = Some("rollback failed".to_string());
        }
        result.active_color = state.active_color;
        result.paused = state.paused;
        result.pause_reason = state.pause_reason;
        result.completed_at = Some(Utc::now());
        result.duration_seconds = started.elapsed().as_secs_f64();
        self.phase.store(PHASE_IDLE, Ordering::SeqCst);
        result
    }

    /// Refused while any operation holds the lock.
    pub async fn unpause(&self) -> Result<(), String> {
        let Ok(_guard) = self.lock.try_lock() else {
            return Err("Update already in progress".to_string());
        };
        let mut state = self.read_state().await;
        state.paused = false;
        state.pause_reason = None;
        state.resumed_at = Some(Utc::now());
        self.write_state(&state).await.map_err(|e| e.to_string())
    }

    pub async fn get_diagnostics(&self) -> crate::models::Diagnostics {
        let state = self.read_state().await;
        let git_sha = self.git("rev-parse HEAD", 10).await;
        let git_ref = match self.git("describe --tags --exact-match", 10).await {
            Some(r) => Some(r),
            None => self.git("branch --show-current", 10).await,
        };
        let git_clean = self.git("status --porcelain", 10).await.map(|s| s.trim().is_empty());
        let containers_raw = self.run_cmd("ps --format json", 15).await;
        let disk_usage = run("df -h .", 10, &self.config.project_dir).await;

        crate::models::Diagnostics {
            git_sha,
            git_ref,
            git_clean,
            containers_raw,
            disk_usage,
            active_color: state.active_color,
            paused: state.paused,
            pause_reason: state.pause_reason,
            last_checked_at: state.last_checked_at,
            last_attempted_tag: state.last_attempted_tag,
            last_good_tag: state.last_good_tag,
            last_success_at: state.last_success_at,
            last_failure_at: state.last_failure_at,
            resumed_at: state.resumed_at,
        }
    }

    pub async fn current_state(&self) -> UpdateRuntimeState {
        self.read_state().await
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn operation_state(&self) -> OperationState {
        match self.phase.load(Ordering::SeqCst) {
            PHASE_UPDATING => OperationState::Updating,
            PHASE_ROLLING_BACK => OperationState::RollingBack,
            _ => OperationState::Idle,
        }
    }
}

fn route_document(color: Color) -> serde_yaml::Value {
    let color_str = color.as_str();
    serde_yaml::from_str(&format!(
        "http:\n  routers:\n    skills:\n      service: skills-{color_str}\n    api:\n      service: api-{color_str}\n"
    ))
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> ExecutorConfig {
        let mut health_urls = HashMap::new();
        for key in ["skills-blue", "skills-green", "api-blue", "api-green", "routed_skills", "routed_api"] {
            health_urls.insert(key.to_string(), "http://127.0.0.1:1/never".to_string());
        }
        ExecutorConfig {
            project_dir: dir.to_path_buf(),
            compose_file: dir.join("compose.yml"),
            route_config_path: dir.join("routes.yaml"),
            runtime_state_path: dir.join("state.json"),
            health_urls,
            pause_on_failure: true,
        }
    }

    #[tokio::test]
    async fn route_switch_is_idempotent_on_second_identical_call() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UpdateExecutor::new(test_config(dir.path()));
        assert!(executor.switch_active_color(Color::Green).await);
        let first = tokio::fs::read_to_string(dir.path().join("routes.yaml")).await.unwrap();
        assert!(executor.switch_active_color(Color::Green).await);
        let second = tokio::fs::read_to_string(dir.path().join("routes.yaml")).await.unwrap();
        assert_eq!(first, second);
        assert!(first.contains("skills-green"));
    }

    #[tokio::test]
    async fn unpause_clears_pause_state() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UpdateExecutor::new(test_config(dir.path()));
        let mut state = UpdateRuntimeState::default();
        state.paused = true;
        state.pause_reason = Some("boom".to_string());
        executor.write_state(&state).await.unwrap();

        executor.unpause().await.unwrap();
        let after = executor.current_state().await;
        assert!(!after.paused);
        assert!(after.pause_reason.is_none());
        assert!(after.resumed_at.is_some());
    }

    #[tokio::test]
    async fn apply_update_fails_fast_when_git_unavailable_in_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UpdateExecutor::new(test_config(dir.path()));
        let result = executor.apply_update("v1.0.0", "1.0.0").await;
        assert_ne!(result.status, UpdateResultStatus::Success);
        assert_eq!(result.active_color, Color::Blue);
    }

    #[tokio::test]
    async fn operation_state_returns_idle_before_and_after_a_failed_apply() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UpdateExecutor::new(test_config(dir.path()));
        assert_eq!(executor.operation_state(), OperationState::Idle);
        let _ = executor.apply_update("v1.0.0", "1.0.0").await;
        assert_eq!(executor.operation_state(), OperationState::Idle);
    }

    #[test]
    fn health_url_is_keyed_per_color_not_shared_between_blue_and_green() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.health_urls.insert("skills-blue".to_string(), "http://blue/health".to_string());
        config.health_urls.insert("skills-green".to_string(), "http://green/health".to_string());
        let executor = UpdateExecutor::new(config);
        assert_eq!(executor.health_url("skills-blue"), "http://blue/health");
        assert_eq!(executor.health_url("skills-green"), "http://green/health");
        assert_ne!(executor.health_url("skills-blue"), executor.health_url("skills-green"));
    }
}
