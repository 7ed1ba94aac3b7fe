//! Entities shared between the audit store (C5), self-healer (C6), and
//! observer loop (C7): healing actions, incidents, update records, and
//! their enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl IncidentSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentSeverity::Low => "low",
            IncidentSeverity::Medium => "medium",
            IncidentSeverity::High => "high",
            IncidentSeverity::Critical => "critical",
        }
    }

    /// Never fails: unknown values deserialize to the documented default
    /// (`low`) when read back out of storage.
    pub fn parse_lenient(s: &str) -> Self {
        Self::from_str(s).unwrap_or(IncidentSeverity::Low)
    }
}

impl FromStr for IncidentSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(IncidentSeverity::Low),
            "medium" => Ok(IncidentSeverity::Medium),
            "high" => Ok(IncidentSeverity::High),
            "critical" => Ok(IncidentSeverity::Critical),
            other => Err(format!("unknown incident severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Checking,
    Downloading,
    Applying,
    Validating,
    Success,
    Failed,
    RolledBack,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Checking => "checking",
            UpdateStatus::Downloading => "downloading",
            UpdateStatus::Applying => "applying",
            UpdateStatus::Validating => "validating",
            UpdateStatus::Success => "success",
            UpdateStatus::Failed => "failed",
            UpdateStatus::RolledBack => "rolled_back",
        }
    }

    /// Never fails: unknown values deserialize to the documented default
    /// (`checking`) when read back out of storage.
    pub fn parse_lenient(s: &str) -> Self {
        Self::from_str(s).unwrap_or(UpdateStatus::Checking)
    }
}

impl FromStr for UpdateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checking" => Ok(UpdateStatus::Checking),
            "downloading" => Ok(UpdateStatus::Downloading),
            "applying" => Ok(UpdateStatus::Applying),
            "validating" => Ok(UpdateStatus::Validating),
            "success" => Ok(UpdateStatus::Success),
            "failed" => Ok(UpdateStatus::Failed),
            "rolled_back" => Ok(UpdateStatus::RolledBack),
            other => Err(format!("unknown update status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingAction {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub trigger: String,
    pub result: ActionResult,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub severity: IncidentSeverity,
    pub description: String,
    pub resolved: bool,
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub previous_version: Option<String>,
    pub git_sha: Option<String>,
    pub status: UpdateStatus,
    pub health_check_result: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_parse_rejects_unknown_severity() {
        assert!(IncidentSeverity::from_str("unknown").is_err());
    }

    #[test]
    fn lenient_parse_never_fails_and_defaults_to_low() {
        assert_eq!(IncidentSeverity::parse_lenient("unknown"), IncidentSeverity::Low);
        assert_eq!(IncidentSeverity::parse_lenient("critical"), IncidentSeverity::Critical);
    }

    #[test]
    fn update_status_lenient_defaults_to_checking() {
        assert_eq!(UpdateStatus::parse_lenient("bogus"), UpdateStatus::Checking);
    }
}
