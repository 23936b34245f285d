// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a short opaque identifier (8 hex chars).
///
/// Identifiers are produced locally and need not be globally unique across
/// machines.
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Why a session ended.  Orthogonal to [`SessionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TargetAchieved,
    BudgetExhausted,
    Plateau,
    RetryExhaustion,
    ModelEscalation,
    UserStop,
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TargetAchieved => "target_achieved",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Plateau => "plateau",
            Self::RetryExhaustion => "retry_exhaustion",
            Self::ModelEscalation => "model_escalation",
            Self::UserStop => "user_stop",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "target_achieved" => Some(Self::TargetAchieved),
            "budget_exhausted" => Some(Self::BudgetExhausted),
            "plateau" => Some(Self::Plateau),
            "retry_exhaustion" => Some(Self::RetryExhaustion),
            "model_escalation" => Some(Self::ModelEscalation),
            "user_stop" => Some(Self::UserStop),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// The session status implied when a session ends for this reason.
    pub fn final_status(&self) -> SessionStatus {
        match self {
            Self::TargetAchieved => SessionStatus::Completed,
            Self::Error | Self::RetryExhaustion => SessionStatus::Failed,
            _ => SessionStatus::Stopped,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of change an iteration applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Config,
    CliArgs,
    CodeHandoff,
    Initial,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::CliArgs => "cli_args",
            Self::CodeHandoff => "code_handoff",
            Self::Initial => "initial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config" => Some(Self::Config),
            "cli_args" => Some(Self::CliArgs),
            "code_handoff" => Some(Self::CodeHandoff),
            "initial" => Some(Self::Initial),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run compared to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Improved,
    Regressed,
    Plateau,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Improved => "improved",
            Self::Regressed => "regressed",
            Self::Plateau => "plateau",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "improved" => Some(Self::Improved),
            "regressed" => Some(Self::Regressed),
            "plateau" => Some(Self::Plateau),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetKind {
    /// Wall-clock seconds.
    Time,
    /// Run count.
    Runs,
}

impl BudgetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Runs => "runs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time" => Some(Self::Time),
            "runs" => Some(Self::Runs),
            _ => None,
        }
    }
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budget tracking for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    #[serde(rename = "type")]
    pub kind: BudgetKind,
    /// Seconds for time budgets, count for run budgets.
    pub value: i64,
    #[serde(default)]
    pub used: i64,
}

impl Budget {
    pub fn new(kind: BudgetKind, value: i64) -> Self {
        Self { kind, value, used: 0 }
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.value
    }

    pub fn remaining(&self) -> i64 {
        (self.value - self.used).max(0)
    }
}

/// One user-initiated campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub branch: String,
    pub base_sha: String,
    pub baseline_run_id: Option<String>,
    pub status: SessionStatus,
    pub termination_reason: Option<TerminationReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub budget: Budget,
    pub iteration_count: i64,
    pub pr_url: Option<String>,
    pub llm_cost_usd: f64,
    pub retry_budget: i64,
    pub exported_at: Option<DateTime<Utc>>,
    /// Holder process id, used to detect orphaned sessions.
    pub pid: Option<i64>,
}

/// One training attempt within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: String,
    /// 1-based, contiguous within the session.
    pub iteration_number: i64,
    pub config_json: String,
    pub git_sha: Option<String>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub change_type: Option<ChangeType>,
    pub change_description: Option<String>,
    pub diff: Option<String>,
    pub hypothesis: Option<String>,
    pub outcome: Option<RunOutcome>,
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub step: Option<i64>,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub kind: String,
    pub path: String,
    pub size_bytes: Option<i64>,
    pub uploaded_at: DateTime<Utc>,
}

/// Action type recorded with a [`Decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Config,
    CliArgs,
    CodeHandoff,
    CodePatch,
    Escalate,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::CliArgs => "cli_args",
            Self::CodeHandoff => "code_handoff",
            Self::CodePatch => "code_patch",
            Self::Escalate => "escalate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config" => Some(Self::Config),
            "cli_args" => Some(Self::CliArgs),
            "code_handoff" => Some(Self::CodeHandoff),
            "code_patch" => Some(Self::CodePatch),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ChangeType> for ActionType {
    fn from(c: ChangeType) -> Self {
        match c {
            ChangeType::Config | ChangeType::Initial => Self::Config,
            ChangeType::CliArgs => Self::CliArgs,
            ChangeType::CodeHandoff => Self::CodeHandoff,
        }
    }
}

/// A decision the model made for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action_type: ActionType,
    pub rationale: String,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Rejected,
    HandedOff,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::HandedOff => "handed_off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "handed_off" => Some(Self::HandedOff),
            _ => None,
        }
    }
}

impl std::fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending request for an out-of-band code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub session_id: String,
    pub run_id: Option<String>,
    pub content: String,
    pub status: SuggestionStatus,
    pub handoff_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One append-only trace event (tool call or tool result) for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
