//! Shared types for the consultation workflow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Conversation lifecycle ──────────────────────────────────────────

/// Lifecycle status of a conversation.
///
/// Moves only `Initialized → Processing → (Completed | Error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Initialized,
    Processing,
    Completed,
    Error,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn can_transition_to(&self, next: ConversationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initialized, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Error)
        )
    }

    /// Statuses from which `next` may be entered.
    pub fn predecessors(next: ConversationStatus) -> &'static [ConversationStatus] {
        match next {
            Self::Initialized => &[],
            Self::Processing => &[Self::Initialized],
            Self::Completed | Self::Error => &[Self::Processing],
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown conversation status '{other}'")),
        }
    }
}

// ── Urgency ─────────────────────────────────────────────────────────

/// Urgency of a consultation. Ordered `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Accepts English labels and the Japanese labels the model tends to emit.
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "low" | "低" => Some(Self::Low),
            "medium" | "normal" | "中" | "通常" => Some(Self::Medium),
            "high" | "urgent" | "高" | "緊急" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_label(s).ok_or_else(|| format!("unknown urgency '{s}'"))
    }
}

// ── Caller input ────────────────────────────────────────────────────

/// Optional hints supplied with a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl MessageContext {
    pub fn is_empty(&self) -> bool {
        self.urgency.as_deref().is_none_or(|s| s.trim().is_empty())
            && self.category.as_deref().is_none_or(|s| s.trim().is_empty())
    }
}

/// Identity of the caller, as forwarded by the authenticating proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub name: String,
}

impl UserInfo {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn anonymous() -> Self {
        Self {
            user_id: Self::ANONYMOUS.to_string(),
            email: String::new(),
            department: String::new(),
            role: String::new(),
            name: String::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == Self::ANONYMOUS
    }
}

impl Default for UserInfo {
    fn default() -> Self {
        Self::anonymous()
    }
}

// ── Analysis ────────────────────────────────────────────────────────

/// Structured result of the analysis step. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub category: String,
    pub urgency: Urgency,
    pub analysis: String,
    pub suggested_actions: Vec<String>,
    pub keywords: Vec<String>,
}

// ── Records ─────────────────────────────────────────────────────────

/// A conversation: one inbound message and its resulting suggestion.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub user: UserInfo,
    pub message: String,
    pub context: MessageContext,
    pub connection_id: Option<String>,
    pub status: ConversationStatus,
    pub analysis: Option<AnalysisResult>,
    pub error: Option<String>,
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Conversation {
    /// A freshly accepted conversation in `Initialized` state.
    pub fn new(
        id: impl Into<String>,
        user: UserInfo,
        message: impl Into<String>,
        context: MessageContext,
        connection_id: Option<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user,
            message: message.into(),
            context,
            connection_id,
            status: ConversationStatus::Initialized,
            analysis: None,
            error: None,
            execution_id: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }
}

/// One prior turn of a caller's history, fed to the analysis prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

/// The recommended recipient for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: String,
    pub conversation_id: String,
    pub recipient: String,
    pub department: Option<String>,
    pub rationale: String,
    pub category: String,
    pub urgency: Urgency,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

/// An entry of the organization directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUnit {
    pub id: String,
    pub organization_id: String,
    pub department_id: String,
    pub department_name: String,
    /// Display name of the recipient (unit or role).
    pub recipient: String,
    /// Categories this unit handles. Empty means any category.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Lowest urgency this unit accepts.
    #[serde(default)]
    pub min_urgency: Urgency,
    /// Lower wins among otherwise equal candidates.
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

/// A live push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ── Executions ──────────────────────────────────────────────────────

/// State of one workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Output recorded by a successful workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    pub conversation_id: String,
    pub analysis: String,
    pub category: String,
    pub urgency: Urgency,
    pub recommended_recipient: String,
    pub suggested_actions: Vec<String>,
}

/// Stored record of one workflow instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub id: String,
    pub conversation_id: String,
    pub status: ExecutionStatus,
    pub output: Option<ExecutionOutput>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

// ── Status reporting ────────────────────────────────────────────────

/// Client-facing status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Processing,
    Completed,
    Error,
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub conversation_id: String,
    pub status: ReportedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_lifecycle() {
        use ConversationStatus::*;
        assert!(Initialized.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));

        assert!(!Initialized.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Error.can_transition_to(Processing));
    }

    #[test]
    fn predecessors_agree_with_transitions() {
        use ConversationStatus::*;
        for next in [Initialized, Processing, Completed, Error] {
            for from in [Initialized, Processing, Completed, Error] {
                assert_eq!(
                    ConversationStatus::predecessors(next).contains(&from),
                    from.can_transition_to(next),
                    "{from} -> {next}"
                );
            }
        }
    }

    #[test]
    fn status_string_round_trip() {
        for s in ["initialized", "processing", "completed", "error"] {
            assert_eq!(s.parse::<ConversationStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<ConversationStatus>().is_err());
    }

    #[test]
    fn urgency_is_ordered() {
        assert!(Urgency::Low < Urgency::Medium);
        assert!(Urgency::Medium < Urgency::High);
    }

    #[test]
    fn urgency_accepts_japanese_labels() {
        assert_eq!(Urgency::parse_label("高"), Some(Urgency::High));
        assert_eq!(Urgency::parse_label("中"), Some(Urgency::Medium));
        assert_eq!(Urgency::parse_label("通常"), Some(Urgency::Medium));
        assert_eq!(Urgency::parse_label("低"), Some(Urgency::Low));
        assert_eq!(Urgency::parse_label(" HIGH "), Some(Urgency::High));
        assert_eq!(Urgency::parse_label("whenever"), None);
    }

    #[test]
    fn status_report_omits_absent_fields() {
        let report = StatusReport {
            conversation_id: "c1".into(),
            status: ReportedStatus::Processing,
            analysis: None,
            category: None,
            recommended_recipient: None,
            error: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["status"], "processing");
        assert!(json.get("analysis").is_none());
        assert!(json.get("recommendedRecipient").is_none());
    }

    #[test]
    fn empty_context_detection() {
        assert!(MessageContext::default().is_empty());
        assert!(
            MessageContext {
                urgency: Some("  ".into()),
                category: None
            }
            .is_empty()
        );
        assert!(
            !MessageContext {
                urgency: None,
                category: Some("業務相談".into())
            }
            .is_empty()
        );
    }
}
