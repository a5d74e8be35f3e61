//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{CompletionError, CompletionModel};
use rig::http_client;
use rig::message::{AssistantContent, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Wraps any rig completion model.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split our flat message list into rig's (preamble, history, prompt) shape.
///
/// System messages are joined into the preamble; the final non-system
/// message becomes the prompt.
fn split_messages(
    messages: Vec<ChatMessage>,
) -> Result<(Option<String>, Vec<Message>, Message), LlmError> {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system.push(msg.content),
            Role::User => turns.push(Message::user(msg.content)),
            Role::Assistant => turns.push(Message::assistant(msg.content)),
        }
    }

    let prompt = turns.pop().ok_or_else(|| LlmError::InvalidResponse {
        provider: "rig".to_string(),
        reason: "completion request has no user prompt".to_string(),
    })?;

    let preamble = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    Ok((preamble, turns, prompt))
}

/// Sort a rig failure into retryable and permanent errors.
///
/// Providers surface HTTP failures either as a status code or as the raw
/// error body, so both are inspected.
fn classify_error(provider: &str, err: CompletionError) -> LlmError {
    let provider = provider.to_string();
    match err {
        CompletionError::HttpError(
            http_client::Error::InvalidStatusCode(status)
            | http_client::Error::InvalidStatusCodeWithMessage(status, _),
        ) => match status.as_u16() {
            401 | 403 => LlmError::AuthFailed { provider },
            429 => LlmError::RateLimited {
                provider,
                retry_after: None,
            },
            408 => LlmError::RequestFailed {
                provider,
                reason: format!("HTTP {status}"),
            },
            400..=499 => LlmError::InvalidResponse {
                provider,
                reason: format!("HTTP {status}"),
            },
            _ => LlmError::RequestFailed {
                provider,
                reason: format!("HTTP {status}"),
            },
        },
        CompletionError::HttpError(e) => LlmError::RequestFailed {
            provider,
            reason: e.to_string(),
        },
        CompletionError::ProviderError(body) => classify_body(provider, body),
        other => LlmError::InvalidResponse {
            provider,
            reason: other.to_string(),
        },
    }
}

fn classify_body(provider: String, body: String) -> LlmError {
    let lower = body.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["authentication_error", "permission_error", "invalid_api_key", "incorrect api key"]) {
        LlmError::AuthFailed { provider }
    } else if has(&["rate_limit", "rate limit"]) {
        LlmError::RateLimited {
            provider,
            retry_after: None,
        }
    } else if has(&["invalid_request_error", "not_found_error", "request_too_large"]) {
        LlmError::InvalidResponse {
            provider,
            reason: body,
        }
    } else {
        // overloaded, api_error and anything unrecognised
        LlmError::RequestFailed {
            provider,
            reason: body,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = split_messages(request.messages)?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature as f64);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens as u64);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(&self.model_name, e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "response contained no text".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens: response.usage.output_tokens as u32,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;

    #[test]
    fn split_puts_system_into_preamble() {
        let (preamble, history, _prompt) = split_messages(vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("earlier question"),
            ChatMessage::assistant("earlier answer"),
            ChatMessage::user("now"),
        ])
        .unwrap();
        assert_eq!(preamble.as_deref(), Some("be brief"));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn split_without_prompt_fails() {
        let result = split_messages(vec![ChatMessage::system("only system")]);
        assert!(matches!(result, Err(LlmError::InvalidResponse { .. })));
    }

    fn status(code: StatusCode) -> CompletionError {
        CompletionError::HttpError(http_client::Error::InvalidStatusCodeWithMessage(
            code,
            "error".into(),
        ))
    }

    #[test]
    fn http_status_decides_retryability() {
        let auth = classify_error("m", status(StatusCode::UNAUTHORIZED));
        assert!(matches!(auth, LlmError::AuthFailed { .. }));
        assert!(!auth.is_transient());

        let forbidden = classify_error("m", status(StatusCode::FORBIDDEN));
        assert!(matches!(forbidden, LlmError::AuthFailed { .. }));

        let limited = classify_error("m", status(StatusCode::TOO_MANY_REQUESTS));
        assert!(matches!(limited, LlmError::RateLimited { .. }));
        assert!(limited.is_transient());

        let bad = classify_error("m", status(StatusCode::BAD_REQUEST));
        assert!(matches!(bad, LlmError::InvalidResponse { .. }));
        assert!(!bad.is_transient());

        let unavailable = classify_error(
            "m",
            CompletionError::HttpError(http_client::Error::InvalidStatusCode(
                StatusCode::SERVICE_UNAVAILABLE,
            )),
        );
        assert!(matches!(unavailable, LlmError::RequestFailed { .. }));
        assert!(unavailable.is_transient());

        assert!(classify_error("m", status(StatusCode::REQUEST_TIMEOUT)).is_transient());
    }

    #[test]
    fn provider_error_body_decides_retryability() {
        let auth = classify_error(
            "m",
            CompletionError::ProviderError(
                r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#.into(),
            ),
        );
        assert!(matches!(auth, LlmError::AuthFailed { .. }));

        let openai_key = classify_error(
            "m",
            CompletionError::ProviderError("Incorrect API key provided: sk-***".into()),
        );
        assert!(matches!(openai_key, LlmError::AuthFailed { .. }));

        let limited = classify_error(
            "m",
            CompletionError::ProviderError(r#"{"error":{"type":"rate_limit_error"}}"#.into()),
        );
        assert!(matches!(limited, LlmError::RateLimited { .. }));

        let invalid = classify_error(
            "m",
            CompletionError::ProviderError(r#"{"error":{"type":"invalid_request_error"}}"#.into()),
        );
        assert!(!invalid.is_transient());

        let overloaded = classify_error(
            "m",
            CompletionError::ProviderError(r#"{"error":{"type":"overloaded_error"}}"#.into()),
        );
        assert!(matches!(overloaded, LlmError::RequestFailed { .. }));
        assert!(overloaded.is_transient());
    }

    #[test]
    fn unreadable_response_is_not_retried() {
        let err = classify_error("m", CompletionError::ResponseError("no content".into()));
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
        assert!(!err.is_transient());
    }
}
