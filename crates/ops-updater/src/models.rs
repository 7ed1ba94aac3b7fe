//! Entities for the blue/green update executor (C8) and its control API
//! (C9): request/response bodies, persisted runtime state, and history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn other(self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateResultStatus {
    Success,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    pub tag: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollbackRequest {
    pub previous_sha: String,
}

/// Transient result of an apply/rollback operation. Every
/// instance owns a freshly allocated `steps_completed` — the Rust
/// analogue of guarding against a Python mutable-default-argument bug,
/// trivially satisfied here but stated as a test invariant.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub status: UpdateResultStatus,
    pub previous_sha: Option<String>,
    pub new_sha: Option<String>,
    pub steps_completed: Vec<String>,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub active_color: Color,
    pub target_color: Option<Color>,
    pub paused: bool,
    pub pause_reason: Option<String>,
}

impl UpdateResult {
    pub fn new(started_at: DateTime<Utc>, active_color: Color) -> Self {
        Self {
            status: UpdateResultStatus::Failed,
            previous_sha: None,
            new_sha: None,
            steps_completed: Vec::new(),
            error: None,
            duration_seconds: 0.0,
            started_at,
            completed_at: None,
            active_color,
            target_color: None,
            paused: false,
            pause_reason: None,
        }
    }
}

/// Single JSON document persisted atomically (temp-file-then-rename) by
/// C8. Initial value is `{active_color: blue, paused: false}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRuntimeState {
    pub active_color: Color,
    pub last_good_tag: Option<String>,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_attempted_tag: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
}

impl Default for UpdateRuntimeState {
    fn default() -> Self {
        Self {
            active_color: Color::Blue,
            last_good_tag: None,
            paused: false,
            pause_reason: None,
            last_checked_at: None,
            last_attempted_tag: None,
            last_success_at: None,
            last_failure_at: None,
            resumed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    Updating,
    RollingBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct SidecarStatus {
    pub state: OperationState,
    pub runtime: UpdateRuntimeState,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub tag: String,
    pub version: String,
    pub result: UpdateResultStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub git_sha: Option<String>,
    pub git_ref: Option<String>,
    pub git_clean: Option<bool>,
    pub containers_raw: Option<String>,
    pub disk_usage: Option<String>,
    pub active_color: Color,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_attempted_tag: Option<String>,
    pub last_good_tag: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_color_flips() {
        assert_eq!(Color::Blue.other(), Color::Green);
        assert_eq!(Color::Green.other(), Color::Blue);
    }

    #[test]
    fn fresh_update_result_owns_its_own_steps_vec() {
        let a = UpdateResult::new(Utc::now(), Color::Blue);
        let mut b = UpdateResult::new(Utc::now(), Color::Blue);
        b.steps_completed.push("fetch".to_string());
        assert!(a.steps_completed.is_empty());
        assert_eq!(b.steps_completed.len(), 1);
    }

    #[test]
    fn default_runtime_state_starts_blue_unpaused() {
        let state = UpdateRuntimeState::default();
        assert_eq!(state.active_color, Color::Blue);
        assert!(!state.paused);
    }
}
