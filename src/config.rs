//! Runtime configuration
//!
//! Read from the environment (after `.env` is loaded). Every missing
//! required variable is reported at once, before any session starts.

use crate::error::AssistantError;
use crate::Result;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_AVAILABLE_CASH: u64 = 1_000_000;
/// Upper bound for every `*_SECS` setting, one hundred years
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Gemini,
    /// Offline heuristics, no network access
    Mock,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: LlmProvider,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub database_url: Option<String>,
    pub port: u16,
    pub workflow: WorkflowSettings,
    pub sweep_interval: Duration,
    pub available_cash: u64,
}

/// Knobs of the orchestrator itself
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// How long a confirmation request stays open
    pub confirmation_timeout: Duration,
    /// How long closed sessions are kept before deletion
    pub session_retention: Duration,
    /// How long a session may wait for the next client message
    pub idle_timeout: Duration,
    pub llm_timeout: Duration,
    pub llm_max_attempts: u32,
    pub max_tool_rounds: u32,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(900),
            session_retention: Duration::from_secs(86_400),
            idle_timeout: Duration::from_secs(3_600),
            llm_timeout: Duration::from_secs(30),
            llm_max_attempts: 2,
            max_tool_rounds: 5,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = match get("LLM_PROVIDER").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("gemini") => LlmProvider::Gemini,
            Some("mock") => LlmProvider::Mock,
            Some(other) => {
                return Err(AssistantError::InvalidConfiguration(format!(
                    "unknown LLM_PROVIDER '{}'",
                    other
                )))
            }
        };

        let mut required: Vec<String> = Vec::new();
        if provider == LlmProvider::Gemini {
            required.push("GEMINI_API_KEY".to_string());
        }
        if let Some(extra) = get("REQUIRED_ENV_VARS") {
            required.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            );
        }

        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|name| get(*name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(AssistantError::ConfigurationMissing(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let defaults = WorkflowSettings::default();
        let workflow = WorkflowSettings {
            confirmation_timeout: secs_or(&get, "CONFIRMATION_TIMEOUT_SECS", defaults.confirmation_timeout)?,
            session_retention: secs_or(&get, "SESSION_RETENTION_SECS", defaults.session_retention)?,
            idle_timeout: secs_or(&get, "IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            llm_timeout: secs_or(&get, "LLM_TIMEOUT_SECS", defaults.llm_timeout)?.max(Duration::from_secs(1)),
            llm_max_attempts: parse_or(&get, "LLM_MAX_ATTEMPTS", defaults.llm_max_attempts)?.max(1),
            max_tool_rounds: parse_or(&get, "MAX_TOOL_ROUNDS", defaults.max_tool_rounds)?,
        };

        Ok(Self {
            provider,
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            database_url: get("POSTGRES_URL").or_else(|| get("DATABASE_URL")),
            port: match get("PORT") {
                Some(_) => parse_or(&get, "PORT", DEFAULT_PORT)?,
                None => parse_or(&get, "API_PORT", DEFAULT_PORT)?,
            },
            workflow,
            sweep_interval: secs_or(&get, "SWEEP_INTERVAL_SECS", Duration::from_secs(60))?
                .max(Duration::from_secs(1)),
            available_cash: parse_or(&get, "AVAILABLE_CASH", DEFAULT_AVAILABLE_CASH)?,
        })
    }
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AssistantError::InvalidConfiguration(format!("{} has invalid value '{}'", key, raw))
        }),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let secs = parse_or(get, key, default.as_secs())?;
    if secs > MAX_DURATION_SECS {
        return Err(AssistantError::InvalidConfiguration(format!(
            "{} must be at most {} seconds, got {}",
            key, MAX_DURATION_SECS, secs
        )));
    }
    Ok(Duration::from_secs(secs))
}
