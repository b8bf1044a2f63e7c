//! Multi-provider consensus for security-critical events.
//!
//! The same classification prompt goes to every voter at once. Answers are
//! collected until all voters replied or the shared deadline passes; calls
//! still pending at that point are dropped.

use crate::config::ConsensusConfig;
use crate::error::ProviderError;
use crate::models::{AnalysisResult, ConsensusVerdict, ProviderVote, Severity, TelemetryJob, Verdict};
use crate::router::prompt::{build_analysis_prompt, extract_json_object};
use crate::router::{CompletionProvider, CompletionRequest};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const VERDICT_SYSTEM_PROMPT: &str = "You are a security analyst classifying application \
events. Decide whether the event is an actual attack. \
Always respond with valid JSON.";

#[derive(Debug, Deserialize)]
struct VerdictResponse {
    verdict: String,
    #[serde(default)]
    reason: String,
}

/// Whether a job must be verified by consensus.
///
/// The single place that decides escalation: security alerts, critical
/// hints, and (when enabled) events the router itself rated critical.
pub fn needs_consensus(job: &TelemetryJob, result: &AnalysisResult, config: &ConsensusConfig) -> bool {
    if !config.enabled {
        return false;
    }
    job.payload.body.is_security_alert()
        || job.severity_hint == Some(Severity::Critical)
        || (config.on_router_critical && result.severity == Severity::Critical)
}

/// Plurality vote over the received votes.
///
/// Each provider counts once; later votes from the same provider are
/// discarded. Ties among distinct verdicts and missing quorum both yield
/// UNCERTAIN with zero confidence.
pub fn tally(event_id: &str, votes: Vec<ProviderVote>, providers_asked: usize, min_quorum: usize) -> ConsensusVerdict {
    let mut seen = HashSet::new();
    let votes: Vec<ProviderVote> = votes
        .into_iter()
        .filter(|vote| seen.insert(vote.provider.clone()))
        .collect();

    let uncertain = |votes: Vec<ProviderVote>| ConsensusVerdict {
        event_id: event_id.to_string(),
        votes,
        winning_verdict: Verdict::Uncertain,
        confidence: 0.0,
        providers_asked,
    };

    if votes.is_empty() || votes.len() < min_quorum {
        return uncertain(votes);
    }

    let mut counts: HashMap<Verdict, usize> = HashMap::new();
    for vote in &votes {
        *counts.entry(vote.verdict).or_insert(0) += 1;
    }

    let top = counts.values().copied().max().unwrap_or(0);
    let leaders: Vec<Verdict> = counts
        .iter()
        .filter(|(_, n)| **n == top)
        .map(|(v, _)| *v)
        .collect();

    if leaders.len() != 1 {
        return uncertain(votes);
    }

    let confidence = top as f64 / votes.len() as f64;
    ConsensusVerdict {
        event_id: event_id.to_string(),
        winning_verdict: leaders[0],
        confidence,
        providers_asked,
        votes,
    }
}

/// Parse one voter's answer.
pub fn parse_vote(provider: &str, text: &str) -> Result<ProviderVote, ProviderError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ProviderError::malformed(provider, "no JSON object in verdict"))?;
    let response: VerdictResponse =
        serde_json::from_str(json).map_err(|e| ProviderError::malformed(provider, e.to_string()))?;
    let verdict = response
        .verdict
        .parse::<Verdict>()
        .map_err(|e| ProviderError::malformed(provider, e))?;

    Ok(ProviderVote {
        provider: provider.to_string(),
        verdict,
        reason: response.reason.trim().to_string(),
    })
}

fn build_verdict_prompt(job: &TelemetryJob) -> String {
    let mut prompt = build_analysis_prompt(job);
    // Replace the analysis answer format with the verdict format.
    if let Some(idx) = prompt.find("\nRespond with") {
        prompt.truncate(idx);
    }
    prompt.push_str("\nClassify this event as one of SAFE, ATTACK or UNCERTAIN.\n");
    prompt.push_str("Respond with a single JSON object in exactly this format:\n");
    prompt.push_str(r#"{"verdict": "SAFE|ATTACK|UNCERTAIN", "reason": "one sentence"}"#);
    prompt.push_str("\n\nOnly output JSON, no other text.");
    prompt
}

/// Fans a verdict prompt out to several providers and tallies the answers.
#[derive(Clone)]
pub struct ConsensusChecker {
    voters: Vec<Arc<dyn CompletionProvider>>,
    timeout: Duration,
    min_quorum: usize,
}

impl ConsensusChecker {
    /// Voters are keyed by provider name; repeated names are asked once.
    pub fn new(voters: Vec<Arc<dyn CompletionProvider>>, config: &ConsensusConfig) -> Self {
        let mut names = HashSet::new();
        let voters: Vec<Arc<dyn CompletionProvider>> = voters
            .into_iter()
            .filter(|voter| {
                let fresh = names.insert(voter.name().to_string());
                if !fresh {
                    warn!(provider = voter.name(), "Ignoring repeated consensus voter");
                }
                fresh
            })
            .collect();
        Self {
            voters,
            timeout: config.timeout(),
            min_quorum: config.min_quorum,
        }
    }

    pub fn voters(&self) -> usize {
        self.voters.len()
    }

    /// Ask every voter, wait at most the shared timeout, then tally.
    pub async fn verify(&self, job: &TelemetryJob) -> ConsensusVerdict {
        let request = CompletionRequest {
            system: VERDICT_SYSTEM_PROMPT.to_string(),
            prompt: build_verdict_prompt(job),
        };

        let mut pending: FuturesUnordered<_> = self
            .voters
            .iter()
            .map(|voter| {
                let request = &request;
                async move { (voter.name().to_string(), voter.complete(request).await) }
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut votes = Vec::new();

        loop {
            let next = tokio::time::timeout_at(deadline, pending.next()).await;
            match next {
                Ok(Some((name, Ok(text)))) => match parse_vote(&name, &text) {
                    Ok(vote) => {
                        debug!(event_id = %job.event_id, provider = %name, verdict = %vote.verdict, "Vote received");
                        votes.push(vote);
                    }
                    Err(e) => warn!(event_id = %job.event_id, error = %e, "Discarding unparseable vote"),
                },
                Ok(Some((name, Err(e)))) => {
                    warn!(event_id = %job.event_id, provider = %name, error = %e, "Voter failed")
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        event_id = %job.event_id,
                        outstanding = pending.len(),
                        "Consensus deadline reached, dropping pending voters"
                    );
                    break;
                }
            }
        }
        drop(pending);

        let verdict = tally(&job.event_id, votes, self.voters.len(), self.min_quorum);
        info!(
            event_id = %job.event_id,
            verdict = %verdict.winning_verdict,
            confidence = verdict.confidence,
            received = verdict.votes.len(),
            asked = verdict.providers_asked,
            "Consensus reached"
        );
        verdict
    }
}

/// Fold a consensus verdict into an analysis result.
pub fn apply_verdict(mut result: AnalysisResult, verdict: ConsensusVerdict) -> AnalysisResult {
    if verdict.winning_verdict == Verdict::Attack && result.severity < Severity::High {
        result.severity = Severity::High;
    }
    result.consensus_detail = Some(verdict);
    result
}
