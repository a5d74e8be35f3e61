//! Picks the organizational unit that should receive a consultation.

use std::cmp::{Ordering, Reverse};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::store::Directory;
use crate::workflow::types::{
    AnalysisResult, Conversation, ConversationStatus, OrgUnit, Suggestion, Urgency, UserInfo,
};

/// Selects a recipient from the organization directory.
pub struct RecipientMatcher {
    directory: Arc<dyn Directory>,
    fallback_recipient: String,
}

impl RecipientMatcher {
    pub fn new(directory: Arc<dyn Directory>, fallback_recipient: impl Into<String>) -> Self {
        Self {
            directory,
            fallback_recipient: fallback_recipient.into(),
        }
    }

    /// Build the suggestion for a conversation. Falls back to the
    /// configured recipient when no unit matches; only a directory lookup
    /// failure is an error.
    pub async fn recommend(
        &self,
        conversation: &Conversation,
        analysis: &AnalysisResult,
    ) -> Result<Suggestion, WorkflowError> {
        let units = self
            .directory
            .list_units()
            .await
            .map_err(|e| WorkflowError::ExternalService {
                service: "directory".to_string(),
                reason: e.to_string(),
            })?;

        let chosen = best_match(&units, analysis, &conversation.user);
        let (recipient, department, rationale) = match chosen {
            Some(unit) => {
                debug!(unit_id = %unit.id, candidates = units.len(), "Directory unit matched");
                (
                    unit.recipient.clone(),
                    Some(unit.department_name.clone()),
                    match_rationale(unit, analysis),
                )
            }
            None => (
                self.fallback_recipient.clone(),
                None,
                fallback_rationale(&self.fallback_recipient, analysis),
            ),
        };

        info!(
            recipient = %recipient,
            fallback = chosen.is_none(),
            "Recipient selected"
        );

        Ok(Suggestion {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            recipient,
            department,
            rationale,
            category: analysis.category.clone(),
            urgency: analysis.urgency,
            status: ConversationStatus::Completed,
            created_at: Utc::now(),
        })
    }
}

/// Whether a unit can take this analysis at all.
fn is_candidate(unit: &OrgUnit, analysis: &AnalysisResult) -> bool {
    let category_ok =
        unit.categories.is_empty() || unit.categories.iter().any(|c| c == &analysis.category);
    category_ok && unit.min_urgency <= analysis.urgency
}

fn in_department(unit: &OrgUnit, user: &UserInfo) -> bool {
    let department = user.department.trim();
    !department.is_empty() && (unit.department_name == department || unit.department_id == department)
}

/// Total order over candidates: explicit category, caller's department,
/// most specific escalation, priority, id.
fn rank(a: &OrgUnit, b: &OrgUnit, user: &UserInfo) -> Ordering {
    let key = |u: &OrgUnit| {
        (
            u.categories.is_empty(),
            !in_department(u, user),
            Reverse(u.min_urgency),
            u.priority,
        )
    };
    key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
}

/// The best unit for the analysis, if any.
fn best_match<'a>(
    units: &'a [OrgUnit],
    analysis: &AnalysisResult,
    user: &UserInfo,
) -> Option<&'a OrgUnit> {
    units
        .iter()
        .filter(|u| is_candidate(u, analysis))
        .min_by(|a, b| rank(a, b, user))
}

fn match_rationale(unit: &OrgUnit, analysis: &AnalysisResult) -> String {
    format!(
        "「{}」に関する相談（緊急度: {}）のため、{}の{}への相談をお勧めします。",
        analysis.category,
        urgency_label(analysis),
        unit.department_name,
        unit.recipient
    )
}

fn fallback_rationale(recipient: &str, analysis: &AnalysisResult) -> String {
    format!(
        "「{}」に対応する担当部署が見つからなかったため、まずは{}への相談をお勧めします。",
        analysis.category, recipient
    )
}

fn urgency_label(analysis: &AnalysisResult) -> &'static str {
    match analysis.urgency {
        Urgency::Low => "低",
        Urgency::Medium => "中",
        Urgency::High => "高",
    }
}
