//! Analysis step — asks the language model to classify a consultation.
//!
//! Flow:
//! 1. Load the caller's recent history (best effort)
//! 2. Build one Japanese prompt with message, hints and history
//! 3. Call the model with bounded retry and a per-attempt timeout
//! 4. Parse JSON, falling back to keyword heuristics (never fails)
//! 5. Record the result on the conversation

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::AnalysisConfig;
use crate::error::WorkflowError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::llm::retry::with_retry;
use crate::store::Database;
use crate::workflow::types::{
    AnalysisResult, Conversation, HistoryTurn, MessageContext, TurnRole, Urgency,
};

/// Category used when nothing better is known.
pub const DEFAULT_CATEGORY: &str = "その他";

/// Action suggested when none can be derived.
pub const DEFAULT_ACTION: &str = "適切な担当者への連絡";

/// Keywords reported when none can be derived.
const DEFAULT_KEYWORDS: [&str; 3] = ["報告", "相談", "連絡"];

/// Category vocabulary, checked in order. First match wins.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("技術的な問題", &["エラー", "バグ", "不具合", "システム"]),
    ("業務相談", &["業務", "仕事", "タスク", "プロジェクト"]),
    ("人事・組織", &["人事", "組織", "部署", "異動"]),
    ("人間関係", &["人間関係", "上司", "同僚", "合わない"]),
];

const HIGH_URGENCY_WORDS: &[&str] = &["緊急", "至急", "今すぐ", "大至急"];
const MEDIUM_URGENCY_WORDS: &[&str] = &["なるべく早く", "早めに", "急ぎ"];

const ACTION_KEYWORDS: &[(&str, &str)] = &[
    ("報告", "上司への報告"),
    ("相談", "チームメンバーへの相談"),
    ("確認", "関係者への確認"),
];

static QUOTED_PHRASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"「([^「」]{1,40})」").unwrap());

/// Runs the analysis step for one conversation.
pub struct Analyzer {
    llm: Arc<dyn LlmProvider>,
    db: Arc<dyn Database>,
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(llm: Arc<dyn LlmProvider>, db: Arc<dyn Database>, config: AnalysisConfig) -> Self {
        Self { llm, db, config }
    }

    /// Analyze the conversation's message and record the result on it.
    ///
    /// Model failures (after retries) propagate as `ExternalService`.
    pub async fn analyze(
        &self,
        conversation: &Conversation,
    ) -> Result<AnalysisResult, WorkflowError> {
        let history = self.load_history(conversation).await;
        let prompt = build_analysis_prompt(&conversation.message, &conversation.context, &history);

        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(self.config.temperature);

        let provider = self.llm.model_name().to_string();
        let response = with_retry(&self.config.retry, self.config.timeout, &provider, || {
            self.llm.complete(request.clone())
        })
        .await?;

        debug!(
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Analysis response received"
        );

        let result = parse_analysis(&response.content);
        self.db
            .set_conversation_analysis(&conversation.id, &result)
            .await?;

        info!(
            category = %result.category,
            urgency = %result.urgency,
            actions = result.suggested_actions.len(),
            "Analysis complete"
        );
        Ok(result)
    }

    async fn load_history(&self, conversation: &Conversation) -> Vec<HistoryTurn> {
        if conversation.user.is_anonymous() || self.config.history_window == 0 {
            return Vec::new();
        }
        match self
            .db
            .recent_history(
                &conversation.user.user_id,
                &conversation.id,
                self.config.history_window,
            )
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "Failed to load conversation history, continuing without it");
                Vec::new()
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the analysis prompt.
fn build_analysis_prompt(
    message: &str,
    context: &MessageContext,
    history: &[HistoryTurn],
) -> String {
    let mut prompt = String::with_capacity(1024 + message.len());

    prompt.push_str(
        "あなたは社内の「報告・連絡・相談」を支援するアシスタントです。\n\
         以下の相談内容を分析し、適切な相談先を判断するための情報を整理してください。\n\n",
    );

    if !history.is_empty() {
        prompt.push_str("■ これまでの会話履歴:\n");
        for turn in history {
            let role = match turn.role {
                TurnRole::User => "ユーザー",
                TurnRole::Assistant => "アシスタント",
            };
            prompt.push_str(&format!("{role}: {}\n", turn.content));
        }
        prompt.push('\n');
    }

    if !context.is_empty() {
        prompt.push_str("■ 追加情報:\n");
        if let Some(urgency) = context.urgency.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push_str(&format!("緊急度: {urgency}\n"));
        }
        if let Some(category) = context.category.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push_str(&format!("カテゴリ: {category}\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("■ 相談内容:\n{message}\n\n"));

    prompt.push_str(
        "■ 回答形式:\n\
         次のJSONオブジェクトのみを出力してください。\n\
         {\"category\": \"技術的な問題|業務相談|人事・組織|人間関係|その他\", \
         \"urgency\": \"low|medium|high\", \
         \"analysis\": \"相談内容の要約と分析\", \
         \"suggested_actions\": [\"推奨される行動\"], \
         \"keywords\": [\"キーワード\"]}",
    );

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// Model analysis response structure. Every field is optional.
#[derive(Debug, Default, serde::Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    urgency: Option<String>,
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default, alias = "suggestedActions")]
    suggested_actions: Option<Vec<String>>,
    #[serde(default)]
    keywords: Option<Vec<String>>,
}

/// Turn raw model output into an `AnalysisResult`. Never fails.
pub(crate) fn parse_analysis(raw: &str) -> AnalysisResult {
    let json_str = extract_json_object(raw);
    match serde_json::from_str::<RawAnalysis>(&json_str) {
        Ok(parsed) => from_structured(parsed, raw),
        Err(e) => {
            debug!(error = %e, "Analysis is not JSON, using keyword heuristics");
            from_text(raw)
        }
    }
}

fn from_structured(parsed: RawAnalysis, raw: &str) -> AnalysisResult {
    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let clean_list = |list: Option<Vec<String>>| -> Vec<String> {
        list.unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };

    let mut suggested_actions = clean_list(parsed.suggested_actions);
    if suggested_actions.is_empty() {
        suggested_actions.push(DEFAULT_ACTION.to_string());
    }

    AnalysisResult {
        category: non_empty(parsed.category).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        urgency: parsed
            .urgency
            .as_deref()
            .and_then(Urgency::parse_label)
            .unwrap_or_default(),
        analysis: non_empty(parsed.analysis).unwrap_or_else(|| raw.trim().to_string()),
        suggested_actions,
        keywords: clean_list(parsed.keywords),
    }
}

fn from_text(raw: &str) -> AnalysisResult {
    let text = raw.trim();
    AnalysisResult {
        category: extract_category(text).to_string(),
        urgency: extract_urgency(text),
        analysis: text.to_string(),
        suggested_actions: extract_suggested_actions(text),
        keywords: extract_keywords(text),
    }
}

fn extract_category(text: &str) -> &'static str {
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map(|(category, _)| *category)
        .unwrap_or(DEFAULT_CATEGORY)
}

fn extract_urgency(text: &str) -> Urgency {
    if HIGH_URGENCY_WORDS.iter().any(|w| text.contains(w)) {
        Urgency::High
    } else if MEDIUM_URGENCY_WORDS.iter().any(|w| text.contains(w)) {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

fn extract_suggested_actions(text: &str) -> Vec<String> {
    let actions: Vec<String> = ACTION_KEYWORDS
        .iter()
        .filter(|(word, _)| text.contains(word))
        .map(|(_, action)| action.to_string())
        .collect();
    if actions.is_empty() {
        vec![DEFAULT_ACTION.to_string()]
    } else {
        actions
    }
}

fn extract_keywords(text: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    let vocabulary = CATEGORY_KEYWORDS.iter().flat_map(|(_, words)| words.iter());
    for word in vocabulary {
        if text.contains(word) && !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
        }
    }
    for caps in QUOTED_PHRASE.captures_iter(text) {
        let phrase = caps[1].trim();
        if !phrase.is_empty() && !keywords.iter().any(|k| k == phrase) {
            keywords.push(phrase.to_string());
        }
    }
    if keywords.is_empty() {
        DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect()
    } else {
        keywords
    }
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
