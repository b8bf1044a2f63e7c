//! AI router: picks a provider tier, makes at most two completion calls and
//! always returns an [`AnalysisResult`].
//!
//! Routing is an explicit state machine:
//!
//! ```text
//! Selecting -> Calling -> Success
//!                      -> RetryFallback -> Calling -> Success
//!                                                  -> Degraded
//!                      -> Degraded (no fallback configured)
//! ```
//!
//! Every transition is recorded in the [`RouteOutcome`].

pub mod prompt;
pub mod provider;

pub use provider::{CompletionProvider, CompletionRequest, ProviderRegistry};

use crate::config::Tier;
use crate::error::ProviderError;
use crate::models::{AnalysisResult, Severity, TelemetryJob};
use chrono::Utc;
use prompt::{build_analysis_prompt, parse_analysis, ANALYSIS_SYSTEM_PROMPT};
use tracing::{debug, error, info, warn};

/// One step of a routing run.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteState {
    Selecting,
    Calling { provider: String, tier: Tier },
    RetryFallback { failed: String, error: ProviderError },
    Success { provider: String },
    Degraded { reason: String },
}

/// Result of a routing run plus the path taken.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub result: AnalysisResult,
    pub transitions: Vec<RouteState>,
}

impl RouteOutcome {
    /// Number of provider calls that were made.
    pub fn calls(&self) -> usize {
        self.transitions
            .iter()
            .filter(|s| matches!(s, RouteState::Calling { .. }))
            .count()
    }
}

/// Tier for a given severity hint.
pub fn select_tier(hint: Option<Severity>) -> Tier {
    match hint {
        Some(severity) if severity >= Severity::High => Tier::Smart,
        _ => Tier::Fast,
    }
}

/// Routes analysis requests across the configured providers.
#[derive(Clone)]
pub struct AiRouter {
    providers: ProviderRegistry,
}

impl AiRouter {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self { providers }
    }

    /// Analyze a job. Never fails; total failure yields a degraded result.
    pub async fn analyze(&self, job: &TelemetryJob) -> AnalysisResult {
        self.route(job).await.result
    }

    /// Analyze a job and report the states visited.
    pub async fn route(&self, job: &TelemetryJob) -> RouteOutcome {
        let mut transitions = vec![RouteState::Selecting];

        let wanted = select_tier(job.severity_hint);
        let primary = self
            .providers
            .by_tier(wanted)
            .or_else(|| self.providers.by_tier(Tier::Fast));

        let Some(primary) = primary else {
            let reason = "no provider configured".to_string();
            error!(event_id = %job.event_id, "{}", reason);
            transitions.push(RouteState::Degraded {
                reason: reason.clone(),
            });
            return RouteOutcome {
                result: AnalysisResult::degraded(&job.event_id, &reason),
                transitions,
            };
        };

        debug!(
            event_id = %job.event_id,
            tier = %wanted,
            provider = %primary.name(),
            "Selected primary provider"
        );

        let request = CompletionRequest {
            system: ANALYSIS_SYSTEM_PROMPT.to_string(),
            prompt: build_analysis_prompt(job),
        };

        transitions.push(RouteState::Calling {
            provider: primary.name().to_string(),
            tier: primary.tier(),
        });
        let primary_error = match attempt(primary.as_ref(), &request, job).await {
            Ok(result) => {
                info!(event_id = %job.event_id, provider = %primary.name(), "Analysis complete");
                transitions.push(RouteState::Success {
                    provider: primary.name().to_string(),
                });
                return RouteOutcome { result, transitions };
            }
            Err(e) => e,
        };

        let fallback = self
            .providers
            .by_tier(Tier::Fallback)
            .filter(|f| f.name() != primary.name());

        let Some(fallback) = fallback else {
            let reason = primary_error.to_string();
            error!(event_id = %job.event_id, error = %reason, "Primary failed and no fallback is configured");
            transitions.push(RouteState::Degraded {
                reason: reason.clone(),
            });
            return RouteOutcome {
                result: AnalysisResult::degraded(&job.event_id, &reason),
                transitions,
            };
        };

        warn!(
            event_id = %job.event_id,
            failed = %primary.name(),
            fallback = %fallback.name(),
            error = %primary_error,
            "Primary provider failed, retrying on fallback"
        );
        transitions.push(RouteState::RetryFallback {
            failed: primary.name().to_string(),
            error: primary_error.clone(),
        });

        transitions.push(RouteState::Calling {
            provider: fallback.name().to_string(),
            tier: fallback.tier(),
        });
        match attempt(fallback.as_ref(), &request, job).await {
            Ok(result) => {
                info!(event_id = %job.event_id, provider = %fallback.name(), "Analysis complete on fallback");
                transitions.push(RouteState::Success {
                    provider: fallback.name().to_string(),
                });
                RouteOutcome { result, transitions }
            }
            Err(fallback_error) => {
                let reason = format!("{}; {}", primary_error, fallback_error);
                error!(event_id = %job.event_id, error = %reason, "All providers failed, storing degraded result");
                transitions.push(RouteState::Degraded {
                    reason: reason.clone(),
                });
                RouteOutcome {
                    result: AnalysisResult::degraded(&job.event_id, &reason),
                    transitions,
                }
            }
        }
    }
}

/// One bounded provider call followed by schema validation.
async fn attempt(
    provider: &dyn CompletionProvider,
    request: &CompletionRequest,
    job: &TelemetryJob,
) -> Result<AnalysisResult, ProviderError> {
    let timeout = provider.timeout();
    let text = tokio::time::timeout(timeout, provider.complete(request))
        .await
        .map_err(|_| ProviderError::Timeout {
            provider: provider.name().to_string(),
            timeout,
        })??;

    let parsed = parse_analysis(provider.name(), &text)?;

    Ok(AnalysisResult {
        event_id: job.event_id.clone(),
        provider_used: provider.name().to_string(),
        summary: parsed.summary,
        root_cause: parsed.root_cause,
        fix_suggestion: parsed.fix_suggestion,
        severity: parsed.severity,
        consensus_detail: None,
        degraded: false,
        analyzed_at: Utc::now(),
    })
}
