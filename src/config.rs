//! Configuration file handling.
//!
//! This module handles loading, merging and validating configuration from
//! `crashlens.toml` files. Everything here is read once at startup and never
//! mutated afterwards.

use crate::models::Severity;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "crashlens.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP gateway settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool and queue settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Completion providers, one or more per tier.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    /// Multi-provider verification of security-critical events.
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Alert dispatch.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Redaction rules.
    #[serde(default)]
    pub redaction: RedactionConfig,

    /// API keys accepted by the gateway.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            worker: WorkerConfig::default(),
            providers: default_providers(),
            consensus: ConsensusConfig::default(),
            notify: NotifyConfig::default(),
            redaction: RedactionConfig::default(),
            credentials: Vec::new(),
        }
    }
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// How long a resubmitted event_id returns the original acknowledgment.
    #[serde(default = "default_idempotency_retention")]
    pub idempotency_retention_seconds: u64,

    /// Maximum accepted request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            idempotency_retention_seconds: default_idempotency_retention(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_idempotency_retention() -> u64 {
    24 * 60 * 60
}

fn default_max_body_bytes() -> usize {
    256 * 1024
}

/// Worker pool and queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent consumers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Seconds before an unacknowledged job is redelivered.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,

    /// How long an idle worker waits for a job before polling again.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Deliveries beyond this count are stored as degraded and dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum number of pending jobs.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Days a completed event is kept before the cleanup sweep drops it.
    /// 0 keeps events forever.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds between cleanup sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    /// Maximum number of stored event records. 0 means unbounded.
    #[serde(default)]
    pub max_stored_events: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            visibility_timeout_seconds: default_visibility_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_attempts: default_max_attempts(),
            queue_capacity: default_queue_capacity(),
            retention_days: default_retention_days(),
            cleanup_interval_seconds: default_cleanup_interval(),
            max_stored_events: 0,
        }
    }
}

impl WorkerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Age after which completed events are dropped, if retention is on.
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0).then(|| Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_visibility_timeout() -> u64 {
    // Must exceed the worst-case router + consensus latency.
    120
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_retention_days() -> u32 {
    30
}

fn default_cleanup_interval() -> u64 {
    60 * 60
}

/// Provider tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Low latency and cost; the default.
    Fast,
    /// Higher-quality reasoning for high-severity events.
    Smart,
    /// Last resort after a failed primary call.
    Fallback,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Fast => write!(f, "fast"),
            Tier::Smart => write!(f, "smart"),
            Tier::Fallback => write!(f, "fallback"),
        }
    }
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStyle {
    /// Ollama `/api/chat`.
    Ollama,
    /// OpenAI-compatible `/chat/completions`.
    OpenAi,
}

/// A single completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name, referenced by the consensus section.
    pub name: String,

    pub tier: Tier,

    #[serde(default = "default_api_style")]
    pub api_style: ApiStyle,

    pub base_url: String,

    pub model: String,

    /// Environment variable holding the API key, if the provider needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Hard timeout for one completion call.
    #[serde(default = "default_provider_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_api_style() -> ApiStyle {
    ApiStyle::OpenAi
}

fn default_provider_timeout() -> u64 {
    20_000
}

fn default_max_tokens() -> u32 {
    1500
}

fn default_temperature() -> f32 {
    0.3
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "ollama-fast".to_string(),
            tier: Tier::Fast,
            api_style: ApiStyle::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:latest".to_string(),
            api_key_env: None,
            timeout_ms: default_provider_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        },
        ProviderConfig {
            name: "openai-smart".to_string(),
            tier: Tier::Smart,
            api_style: ApiStyle::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_ms: 30_000,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        },
        ProviderConfig {
            name: "anthropic-fallback".to_string(),
            tier: Tier::Fallback,
            api_style: ApiStyle::OpenAi,
            base_url: "https://api.anthropic.com/v1".to_string(),
            model: "claude-3-haiku-20240307".to_string(),
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            timeout_ms: default_provider_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        },
    ]
}

/// Consensus verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Names of providers that vote; at least three.
    #[serde(default = "default_consensus_providers")]
    pub providers: Vec<String>,

    /// One timeout shared by the whole fan-out.
    #[serde(default = "default_consensus_timeout")]
    pub timeout_seconds: u64,

    /// Minimum votes for a verdict other than UNCERTAIN.
    #[serde(default = "default_min_quorum")]
    pub min_quorum: usize,

    /// Also verify events the router itself classified as critical.
    #[serde(default = "default_true")]
    pub on_router_critical: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            providers: default_consensus_providers(),
            timeout_seconds: default_consensus_timeout(),
            min_quorum: default_min_quorum(),
            on_router_critical: true,
        }
    }
}

impl ConsensusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_consensus_providers() -> Vec<String> {
    default_providers().into_iter().map(|p| p.name).collect()
}

fn default_consensus_timeout() -> u64 {
    30
}

fn default_min_quorum() -> usize {
    2
}

fn default_true() -> bool {
    true
}

/// Kind of notifier used for alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    /// Write alerts to the log only.
    Log,
    /// POST alerts as JSON to `webhook_url`.
    Webhook,
}

/// Alert dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Results at or above this severity trigger an alert.
    #[serde(default = "default_threshold")]
    pub threshold: Severity,

    /// Channel name handed to the notifier.
    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_notifier_kind")]
    pub kind: NotifierKind,

    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            channel: default_channel(),
            kind: default_notifier_kind(),
            webhook_url: None,
        }
    }
}

fn default_threshold() -> Severity {
    Severity::High
}

fn default_channel() -> String {
    "email".to_string()
}

fn default_notifier_kind() -> NotifierKind {
    NotifierKind::Log
}

/// A redaction rule supplied through configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
}

/// Redaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// TOML rule table replacing the built-in one.
    #[serde(default)]
    pub rules_file: Option<String>,

    /// Rules evaluated before the table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_rules: Vec<RuleConfig>,

    /// Object keys whose values are always redacted wholesale.
    #[serde(default = "default_sensitive_keys")]
    pub sensitive_keys: Vec<String>,

    /// Nesting depth beyond which subtrees are redacted wholesale.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Strings longer than this are replaced by a placeholder.
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            rules_file: None,
            extra_rules: Vec::new(),
            sensitive_keys: default_sensitive_keys(),
            max_depth: default_max_depth(),
            max_input_bytes: default_max_input_bytes(),
        }
    }
}

fn default_sensitive_keys() -> Vec<String> {
    vec![
        "password",
        "passwd",
        "secret",
        "token",
        "api_key",
        "apikey",
        "authorization",
        "cookie",
        "set-cookie",
        "session",
        "credit_card",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_depth() -> usize {
    8
}

fn default_max_input_bytes() -> usize {
    64 * 1024
}

/// One accepted API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub app_id: String,

    #[serde(default)]
    pub app_name: Option<String>,

    /// Literal key (development only).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the key.
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_events_per_minute")]
    pub events_per_minute: u32,
}

impl CredentialConfig {
    /// Resolve the key from the literal value or the environment.
    pub fn resolve_key(&self) -> Result<String> {
        if let Some(ref key) = self.api_key {
            return Ok(key.clone());
        }
        match self.api_key_env {
            Some(ref var) => std::env::var(var)
                .with_context(|| format!("API key variable {} for app {} is not set", var, self.app_id)),
            None => bail!("credential for app {} has neither api_key nor api_key_env", self.app_id),
        }
    }
}

fn default_events_per_minute() -> u32 {
    600
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref bind) = args.bind {
            self.server.bind = bind.clone();
        }
        if let Some(workers) = args.workers {
            self.worker.concurrency = workers;
        }
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            bail!("worker.concurrency must be at least 1");
        }
        if self.worker.cleanup_interval_seconds == 0 {
            bail!("worker.cleanup_interval_seconds must be at least 1");
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                bail!("duplicate provider name '{}'", provider.name);
            }
            if provider.timeout_ms == 0 {
                bail!("provider '{}' has a zero timeout", provider.name);
            }
        }

        if !self.providers.iter().any(|p| p.tier == Tier::Fast) {
            bail!("at least one provider with tier = \"fast\" is required");
        }

        if self.consensus.enabled {
            let mut voters = HashSet::new();
            for name in &self.consensus.providers {
                if !names.contains(name.as_str()) {
                    bail!("consensus provider '{}' is not defined in [[providers]]", name);
                }
                if !voters.insert(name.as_str()) {
                    bail!("consensus provider '{}' is listed more than once", name);
                }
            }
            if voters.len() < 3 {
                bail!("consensus needs at least 3 distinct providers, got {}", voters.len());
            }
            if self.consensus.min_quorum < 2 {
                bail!("consensus.min_quorum must be at least 2");
            }
        }

        if self.notify.kind == NotifierKind::Webhook && self.notify.webhook_url.is_none() {
            bail!("notify.kind = \"webhook\" requires notify.webhook_url");
        }

        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        let mut content = toml::to_string_pretty(&config).unwrap_or_else(|_| String::new());
        content.push_str(
            r#"
# Accepted API keys. Keys must start with "cw_".
# [[credentials]]
# app_id = "my-app"
# app_name = "My App"
# api_key_env = "CRASHLENS_MY_APP_KEY"
# events_per_minute = 600
"#,
        );
        content
    }
}
