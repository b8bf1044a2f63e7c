//! Analysis prompt construction and response validation.

use crate::error::ProviderError;
use crate::models::{EventBody, Severity, TelemetryJob};
use serde::Deserialize;
use serde_json::{Map, Value};

/// System prompt for every analysis request.
pub const ANALYSIS_SYSTEM_PROMPT: &str = "You are a senior software engineer analyzing \
production errors and security events. Be specific and practical. \
Always respond with valid JSON.";

/// The JSON object a provider must return.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisResponse {
    pub summary: String,
    pub root_cause: String,
    #[serde(alias = "suggested_fix")]
    pub fix_suggestion: String,
    pub severity: String,
}

/// Validated provider answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnalysis {
    pub summary: String,
    pub root_cause: String,
    pub fix_suggestion: String,
    pub severity: Severity,
}

fn context_json(context: &Map<String, Value>) -> String {
    if context.is_empty() {
        "none".to_string()
    } else {
        serde_json::to_string(context).unwrap_or_else(|_| "unavailable".to_string())
    }
}

/// Build the user prompt for one job.
pub fn build_analysis_prompt(job: &TelemetryJob) -> String {
    let event = &job.payload;
    let hint = job
        .severity_hint
        .map(|s| s.to_string())
        .unwrap_or_else(|| "not provided".to_string());

    let mut prompt = String::new();
    prompt.push_str("Analyze the following event and provide a concise, actionable explanation.\n\n");
    prompt.push_str("Event Details:\n");
    prompt.push_str(&format!("- Category: {}\n", event.body.category()));
    prompt.push_str(&format!("- Reported severity: {}\n", hint));
    prompt.push_str(&format!("- Environment: {}\n", event.environment));
    if let Some(ref source) = event.source {
        prompt.push_str(&format!("- Source: {}\n", source));
    }

    match &event.body {
        EventBody::Crash(crash) => {
            prompt.push_str(&format!("- Error Type: {}\n", crash.error_type));
            prompt.push_str(&format!("- Error Message: {}\n", crash.message));
            prompt.push_str(&format!(
                "- File: {}\n",
                crash.file.as_deref().unwrap_or("unknown")
            ));
            prompt.push_str(&format!(
                "- Line: {}\n",
                crash.line.map(|l| l.to_string()).unwrap_or_else(|| "unknown".to_string())
            ));
            prompt.push_str(&format!(
                "- Stack Trace:\n{}\n",
                crash.stack_trace.as_deref().unwrap_or("not available")
            ));
            prompt.push_str(&format!("- Additional Context: {}\n", context_json(&crash.context)));
        }
        EventBody::Message(msg) => {
            prompt.push_str(&format!("- Log Level: {}\n", msg.level));
            prompt.push_str(&format!("- Message: {}\n", msg.message));
            prompt.push_str(&format!("- Additional Context: {}\n", context_json(&msg.context)));
        }
        EventBody::SecurityAlert(alert) => {
            prompt.push_str(&format!("- Detector: {}\n", alert.kind));
            prompt.push_str(&format!("- Description: {}\n", alert.description));
            if let Some(ref ip) = alert.source_ip {
                prompt.push_str(&format!("- Source IP: {}\n", ip));
            }
            if let Some(ref request) = alert.request {
                prompt.push_str(&format!("- Request: {}\n", request));
            }
            prompt.push_str(&format!("- Additional Context: {}\n", context_json(&alert.context)));
        }
    }

    prompt.push_str("\nRespond with a single JSON object in exactly this format:\n");
    prompt.push_str(
        r#"{"summary": "one-sentence summary", "root_cause": "what is likely causing this", "fix_suggestion": "step-by-step instructions to fix it", "severity": "critical|high|medium|low"}"#,
    );
    prompt.push_str("\n\nOnly output JSON, no other text.");
    prompt
}

/// Locate the JSON object in a completion, tolerating code fences and chatter.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

fn require(provider: &str, field: &str, value: String) -> Result<String, ProviderError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::malformed(provider, format!("empty field '{}'", field)));
    }
    Ok(trimmed.to_string())
}

/// Validate a completion against the analysis schema.
pub fn parse_analysis(provider: &str, text: &str) -> Result<ParsedAnalysis, ProviderError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ProviderError::malformed(provider, "no JSON object in response"))?;

    let response: AnalysisResponse =
        serde_json::from_str(json).map_err(|e| ProviderError::malformed(provider, e.to_string()))?;

    let severity = match response.severity.parse::<Severity>() {
        Ok(Severity::Unknown) | Err(_) => {
            return Err(ProviderError::malformed(
                provider,
                format!("invalid severity '{}'", response.severity),
            ))
        }
        Ok(s) => s,
    };

    Ok(ParsedAnalysis {
        summary: require(provider, "summary", response.summary)?,
        root_cause: require(provider, "root_cause", response.root_cause)?,
        fix_suggestion: require(provider, "fix_suggestion", response.fix_suggestion)?,
        severity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrashReport, ScrubbedEvent};
    use chrono::Utc;

    fn crash_job() -> TelemetryJob {
        TelemetryJob {
            event_id: "evt-1".into(),
            app_id: "shop".into(),
            severity_hint: Some(Severity::High),
            payload: ScrubbedEvent {
                scrubbed: true,
                environment: "production".into(),
                source: Some("checkout".into()),
                occurred_at: None,
                body: EventBody::Crash(CrashReport {
                    error_type: "KeyError".into(),
                    message: "'user_id'".into(),
                    stack_trace: Some("File \"app.py\", line 10".into()),
                    file: Some("app.py".into()),
                    line: Some(10),
                    context: Map::new(),
                }),
            },
            enqueued_at: Utc::now(),
            attempt_count: 1,
        }
    }

    #[test]
    fn test_prompt_contains_event_details() {
        let prompt = build_analysis_prompt(&crash_job());
        assert!(prompt.contains("- Category: crash"));
        assert!(prompt.contains("- Error Type: KeyError"));
        assert!(prompt.contains("- Reported severity: high"));
        assert!(prompt.contains("\"fix_suggestion\""));
    }

    #[test]
    fn test_parse_plain_json() {
        let text = r#"{"summary":"Missing key","root_cause":"user_id absent","fix_suggestion":"Use .get()","severity":"medium"}"#;
        let parsed = parse_analysis("p", text).unwrap();
        assert_eq!(parsed.severity, Severity::Medium);
        assert_eq!(parsed.summary, "Missing key");
    }

    #[test]
    fn test_parse_tolerates_code_fences_and_alias() {
        let text = "Here you go:\n```json\n{\"summary\":\"s\",\"root_cause\":\"r\",\"suggested_fix\":\"f\",\"severity\":\"HIGH\"}\n```";
        let parsed = parse_analysis("p", text).unwrap();
        assert_eq!(parsed.fix_suggestion, "f");
        assert_eq!(parsed.severity, Severity::High);
    }

    #[test]
    fn test_schema_violations_are_malformed() {
        let cases = [
            "no json at all",
            r#"{"summary":"s","root_cause":"r","fix_suggestion":"f"}"#,
            r#"{"summary":"","root_cause":"r","fix_suggestion":"f","severity":"low"}"#,
            r#"{"summary":"s","root_cause":"r","fix_suggestion":"f","severity":"unknown"}"#,
            r#"{"summary":"s","root_cause":"r","fix_suggestion":"f","severity":"severe"}"#,
        ];

        for text in cases {
            assert!(
                matches!(parse_analysis("p", text), Err(ProviderError::Malformed { .. })),
                "accepted {:?}",
                text
            );
        }
    }
}
