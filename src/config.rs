//! Configuration types.
//!
//! Everything is read once at boot by [`AppConfig::from_env`], validated, and
//! then handed to components explicitly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig, RetryPolicy};

/// Deployment environment. Selects defaults; explicit variables still win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }

    fn default_allowed_origins(&self) -> Vec<String> {
        match self {
            Self::Dev => vec!["http://localhost:8100".to_string()],
            Self::Staging | Self::Prod => Vec::new(),
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidValue {
                key: "HOUKOKUSOU_ENV".to_string(),
                message: format!("unknown environment '{other}'"),
            }),
        }
    }
}

/// Settings for the analysis step.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Output bound for the model.
    pub max_tokens: u32,
    /// Fixed sampling temperature.
    pub temperature: f32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retry policy for transient model failures.
    pub retry: RetryPolicy,
    /// How many prior turns of the caller's history go into the prompt.
    pub history_window: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.7,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            history_window: 5,
        }
    }
}

/// Settings for intake and workflow instances.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// How long conversation records live before the sweep may purge them.
    pub conversation_ttl: chrono::Duration,
    /// How long an idle connection record lives.
    pub connection_ttl: chrono::Duration,
    /// Upper bound on one workflow instance, up to the persisted result.
    pub workflow_timeout: Duration,
    /// Upper bound on the push of a finished result to the client.
    pub notify_timeout: Duration,
    /// Recipient used when the directory has no match.
    pub fallback_recipient: String,
    /// Longest accepted message, in characters.
    pub max_message_chars: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            conversation_ttl: chrono::Duration::days(7),
            connection_ttl: chrono::Duration::hours(2),
            workflow_timeout: Duration::from_secs(300),
            notify_timeout: Duration::from_secs(10),
            fallback_recipient: "直属の上司".to_string(),
            max_message_chars: 4000,
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub llm: LlmConfig,
    pub analysis: AnalysisConfig,
    pub workflow: WorkflowConfig,
    /// CORS origins. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
    /// Directory for daily rolling log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Interval of the expiry sweep.
    pub sweep_interval: Duration,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("HOUKOKUSOU_ENV") {
            Some(v) => v.parse()?,
            None => Environment::Dev,
        };

        let bind_addr = parse_or(&lookup, "HOUKOKUSOU_BIND", "0.0.0.0:8080".parse().ok())?;
        let db_path = lookup("HOUKOKUSOU_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/houkokusou.db"));

        let backend = match lookup("HOUKOKUSOU_LLM_BACKEND") {
            Some(v) => v.parse()?,
            None => LlmBackend::Anthropic,
        };
        let api_key = lookup(backend.api_key_var())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(backend.api_key_var().to_string()))?;
        let model = lookup("HOUKOKUSOU_MODEL").unwrap_or_else(|| backend.default_model().to_string());

        let defaults = AnalysisConfig::default();
        let analysis = AnalysisConfig {
            max_tokens: parse_or(&lookup, "HOUKOKUSOU_MAX_TOKENS", Some(defaults.max_tokens))?,
            temperature: parse_or(&lookup, "HOUKOKUSOU_TEMPERATURE", Some(defaults.temperature))?,
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "HOUKOKUSOU_ANALYSIS_TIMEOUT_SECS",
                Some(defaults.timeout.as_secs()),
            )?),
            retry: RetryPolicy {
                max_attempts: parse_or(
                    &lookup,
                    "HOUKOKUSOU_ANALYSIS_MAX_ATTEMPTS",
                    Some(defaults.retry.max_attempts),
                )?,
                ..defaults.retry
            },
            history_window: parse_or(
                &lookup,
                "HOUKOKUSOU_HISTORY_WINDOW",
                Some(defaults.history_window),
            )?,
        };

        let wf_defaults = WorkflowConfig::default();
        let workflow = WorkflowConfig {
            conversation_ttl: ttl_days(parse_or(
                &lookup,
                "HOUKOKUSOU_CONVERSATION_TTL_DAYS",
                Some(7i64),
            )?)?,
            workflow_timeout: Duration::from_secs(parse_or(
                &lookup,
                "HOUKOKUSOU_WORKFLOW_TIMEOUT_SECS",
                Some(wf_defaults.workflow_timeout.as_secs()),
            )?),
            notify_timeout: Duration::from_secs(parse_or(
                &lookup,
                "HOUKOKUSOU_NOTIFY_TIMEOUT_SECS",
                Some(wf_defaults.notify_timeout.as_secs()),
            )?),
            fallback_recipient: lookup("HOUKOKUSOU_FALLBACK_RECIPIENT")
                .unwrap_or(wf_defaults.fallback_recipient.clone()),
            ..wf_defaults
        };

        let allowed_origins = match lookup("HOUKOKUSOU_ALLOWED_ORIGINS") {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => environment.default_allowed_origins(),
        };

        let config = Self {
            environment,
            bind_addr,
            db_path,
            llm: LlmConfig {
                backend,
                api_key: secrecy::SecretString::from(api_key),
                model,
            },
            analysis,
            workflow,
            allowed_origins,
            log_dir: lookup("HOUKOKUSOU_LOG_DIR").map(PathBuf::from),
            sweep_interval: Duration::from_secs(60),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the service misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.analysis.temperature) {
            return Err(invalid("HOUKOKUSOU_TEMPERATURE", "must be between 0.0 and 1.0"));
        }
        if self.analysis.max_tokens == 0 {
            return Err(invalid("HOUKOKUSOU_MAX_TOKENS", "must be positive"));
        }
        if self.analysis.timeout.is_zero() {
            return Err(invalid("HOUKOKUSOU_ANALYSIS_TIMEOUT_SECS", "must be positive"));
        }
        if !(1..=10).contains(&self.analysis.retry.max_attempts) {
            return Err(invalid("HOUKOKUSOU_ANALYSIS_MAX_ATTEMPTS", "must be between 1 and 10"));
        }
        if self.workflow.conversation_ttl <= chrono::Duration::zero()
            || self.workflow.conversation_ttl > chrono::Duration::days(MAX_CONVERSATION_TTL_DAYS)
        {
            return Err(invalid(
                "HOUKOKUSOU_CONVERSATION_TTL_DAYS",
                "must be between 1 and 3650 days",
            ));
        }
        let analysis_budget = self.analysis.retry.worst_case(self.analysis.timeout);
        if self.workflow.workflow_timeout <= analysis_budget {
            return Err(ConfigError::InvalidValue {
                key: "HOUKOKUSOU_WORKFLOW_TIMEOUT_SECS".to_string(),
                message: format!(
                    "must exceed the worst-case analysis time of {}s (attempts, timeouts and backoff)",
                    analysis_budget.as_secs()
                ),
            });
        }
        if self.workflow.notify_timeout.is_zero() {
            return Err(invalid("HOUKOKUSOU_NOTIFY_TIMEOUT_SECS", "must be non-zero"));
        }
        if self.workflow.fallback_recipient.trim().is_empty() {
            return Err(invalid("HOUKOKUSOU_FALLBACK_RECIPIENT", "must not be empty"));
        }
        if self.environment == Environment::Prod
            && self.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(invalid(
                "HOUKOKUSOU_ALLOWED_ORIGINS",
                "wildcard origin is not allowed in prod",
            ));
        }
        Ok(())
    }
}

/// Upper bound on conversation retention.
const MAX_CONVERSATION_TTL_DAYS: i64 = 3650;

/// Checked before building the duration; `chrono::Duration::days` panics
/// far beyond this range.
fn ttl_days(days: i64) -> Result<chrono::Duration, ConfigError> {
    if !(1..=MAX_CONVERSATION_TTL_DAYS).contains(&days) {
        return Err(invalid(
            "HOUKOKUSOU_CONVERSATION_TTL_DAYS",
            "must be between 1 and 3650 days",
        ));
    }
    Ok(chrono::Duration::days(days))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: Option<T>) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse '{raw}'"),
        }),
        None => default.ok_or_else(|| ConfigError::MissingEnvVar(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_for_dev() {
        let config = load(&[("ANTHROPIC_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.environment, Environment::Dev);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.analysis.max_tokens, 1000);
        assert_eq!(config.analysis.retry.max_attempts, 3);
        assert_eq!(config.analysis.history_window, 5);
        assert_eq!(config.workflow.conversation_ttl, chrono::Duration::days(7));
        assert_eq!(config.allowed_origins, vec!["http://localhost:8100"]);
        assert_eq!(config.llm.backend, LlmBackend::Anthropic);
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "ANTHROPIC_API_KEY"));
    }

    #[test]
    fn openai_backend_reads_its_own_key() {
        let config = load(&[
            ("HOUKOKUSOU_LLM_BACKEND", "openai"),
            ("OPENAI_API_KEY", "sk-test"),
        ])
        .unwrap();
        assert_eq!(config.llm.backend, LlmBackend::OpenAi);
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn prod_has_no_default_origins() {
        let config = load(&[("HOUKOKUSOU_ENV", "prod"), ("ANTHROPIC_API_KEY", "k")]).unwrap();
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let err = load(&[("HOUKOKUSOU_ENV", "qa"), ("ANTHROPIC_API_KEY", "k")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn unparsable_number_is_rejected() {
        let err = load(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("HOUKOKUSOU_MAX_TOKENS", "lots"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HOUKOKUSOU_MAX_TOKENS"));
    }

    #[test]
    fn temperature_out_of_range_is_rejected() {
        let err = load(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("HOUKOKUSOU_TEMPERATURE", "1.5"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn wildcard_origin_rejected_in_prod() {
        let err = load(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("HOUKOKUSOU_ENV", "prod"),
            ("HOUKOKUSOU_ALLOWED_ORIGINS", "*"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn conversation_ttl_is_bounded() {
        for days in ["0", "-3", "3651", "9223372036854775807"] {
            let err = load(&[
                ("ANTHROPIC_API_KEY", "k"),
                ("HOUKOKUSOU_CONVERSATION_TTL_DAYS", days),
            ])
            .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HOUKOKUSOU_CONVERSATION_TTL_DAYS"),
                "{days}"
            );
        }

        let config = load(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("HOUKOKUSOU_CONVERSATION_TTL_DAYS", "3650"),
        ])
        .unwrap();
        assert_eq!(config.workflow.conversation_ttl, chrono::Duration::days(3650));
    }

    #[test]
    fn workflow_timeout_must_cover_every_retry() {
        // 3 attempts × 30 s + 2 s + 4 s backoff = 96 s
        let err = load(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("HOUKOKUSOU_WORKFLOW_TIMEOUT_SECS", "95"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HOUKOKUSOU_WORKFLOW_TIMEOUT_SECS"));

        assert!(
            load(&[
                ("ANTHROPIC_API_KEY", "k"),
                ("HOUKOKUSOU_WORKFLOW_TIMEOUT_SECS", "97"),
            ])
            .is_ok()
        );
    }

    #[test]
    fn workflow_timeout_must_exceed_analysis_timeout() {
        let err = load(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("HOUKOKUSOU_WORKFLOW_TIMEOUT_SECS", "10"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
