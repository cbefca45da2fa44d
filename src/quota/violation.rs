//! Defensive parser for provider quota-error payloads
//!
//! The provider's 429 payloads are not contractually stable: the structured
//! `details` entries are sometimes present at the top level, sometimes
//! nested inside a string-encoded JSON `message`, and sometimes only
//! recoverable by pattern matching on the message text. This parser layers
//! those strategies and fails soft: any shape it cannot interpret yields
//! "no violation found" with a diagnostic trace, never an error.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{QuotaKind, QuotaViolation};

use super::limits::KNOWN_TIER_LABELS;

/// Structured description of a quota violation recovered from a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedViolation {
    /// Violated dimension, classified from the quota id
    pub kind: QuotaKind,

    /// Quota identifier, e.g.
    /// `GenerateRequestsPerMinutePerProjectPerModel-FreeTier`
    pub quota_id: Option<String>,

    /// Quota metric, when the structured entry carried one
    pub quota_metric: Option<String>,

    /// Quota value, when the structured entry carried one
    pub quota_value: Option<String>,

    /// Tier label matched inside the quota id, `"Unknown"` otherwise
    pub tier_label: String,

    /// Suggested retry delay in seconds (0 when absent or malformed)
    pub retry_delay_secs: u64,
}

impl ParsedViolation {
    /// Build the audit record for this violation
    pub fn into_violation(self, model: &str, payload: &Value) -> QuotaViolation {
        let now = Utc::now();
        QuotaViolation {
            id: Uuid::new_v4().to_string(),
            model: model.to_string(),
            raw_payload: serde_json::to_string(payload).ok(),
            quota_id: self.quota_id,
            kind: self.kind,
            tier_label: self.tier_label,
            retry_delay_secs: self.retry_delay_secs,
            created_at: now,
            expires_at: now + chrono::Duration::days(QuotaViolation::RETENTION_DAYS),
        }
    }
}

fn quota_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""quotaId"\s*:\s*"([^"]+)""#).expect("static regex"))
}

fn retry_delay_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""retryDelay"\s*:\s*"([^"]+)""#).expect("static regex"))
}

/// The `details` array, whether the object nests it under `error` or not
fn find_details(value: &Value) -> Option<&Vec<Value>> {
    value
        .get("error")
        .and_then(|e| e.get("details"))
        .or_else(|| value.get("details"))
        .and_then(Value::as_array)
}

/// The `message` field, whether the object nests it under `error` or not
fn find_message(value: &Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
}

/// Classify the violated dimension from a quota id.
///
/// Checked in order: `PerMinute`, `PerDay`, `Token`. A token quota that is
/// per-minute or per-day classifies by its window, not by `Token`.
fn classify_kind(quota_id: &str) -> QuotaKind {
    if quota_id.contains("PerMinute") {
        QuotaKind::Rpm
    } else if quota_id.contains("PerDay") {
        QuotaKind::Rpd
    } else if quota_id.contains("Token") {
        QuotaKind::Tpm
    } else {
        QuotaKind::Unknown
    }
}

/// Match a known tier label inside the quota id
fn classify_tier(quota_id: &str) -> String {
    KNOWN_TIER_LABELS
        .iter()
        .find(|label| quota_id.contains(*label))
        .map(|label| label.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Parse a `"<integer>s"` duration string into seconds
fn parse_retry_delay(raw: &str) -> u64 {
    raw.strip_suffix('s')
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Parse a raw provider error payload into a structured violation.
///
/// Returns `None` when no quota-violation evidence can be recovered.
pub fn parse_quota_error(payload: &Value) -> Option<ParsedViolation> {
    let raw_message = find_message(payload).map(str::to_string);

    // Unwrap up to two levels of string-encoded JSON inside the message
    // field, stopping as soon as a details array turns up.
    let mut details: Option<Vec<Value>> = find_details(payload).cloned();
    let mut unwrapped_message: Option<String> = None;
    let mut current_message = raw_message.clone();

    for level in 1..=2 {
        if details.is_some() {
            break;
        }
        let Some(message) = current_message.take() else {
            break;
        };
        match serde_json::from_str::<Value>(&message) {
            Ok(nested) => {
                details = find_details(&nested).cloned();
                current_message = find_message(&nested).map(str::to_string);
                if level == 1 {
                    unwrapped_message = current_message.clone();
                }
            }
            Err(err) => {
                tracing::debug!(level, error = %err, "quota error message is not nested JSON");
                break;
            }
        }
    }

    let mut quota_id: Option<String> = None;
    let mut quota_metric: Option<String> = None;
    let mut quota_value: Option<String> = None;
    let mut retry_raw: Option<String> = None;
    let mut structured_hit = false;

    if let Some(entries) = &details {
        for entry in entries {
            let type_name = entry.get("@type").and_then(Value::as_str).unwrap_or("");
            if type_name.contains("QuotaFailure") {
                if let Some(violation) = entry
                    .get("violations")
                    .and_then(Value::as_array)
                    .and_then(|a| a.first())
                {
                    structured_hit = true;
                    quota_metric = violation
                        .get("quotaMetric")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    quota_id = violation
                        .get("quotaId")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    quota_value = violation.get("quotaValue").map(|v| match v.as_str() {
                        Some(s) => s.to_string(),
                        None => v.to_string(),
                    });
                }
            } else if type_name.contains("RetryInfo") {
                retry_raw = entry
                    .get("retryDelay")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
    }

    // Regex fallback: once-unwrapped message first, raw message second
    let fallback_texts: Vec<&String> = unwrapped_message
        .iter()
        .chain(raw_message.iter())
        .collect();

    if quota_id.is_none() {
        for text in &fallback_texts {
            if let Some(caps) = quota_id_re().captures(text.as_str()) {
                quota_id = Some(caps[1].to_string());
                break;
            }
        }
    }

    if retry_raw.is_none() {
        for text in &fallback_texts {
            if let Some(caps) = retry_delay_re().captures(text.as_str()) {
                retry_raw = Some(caps[1].to_string());
                break;
            }
        }
    }

    if !structured_hit && quota_id.is_none() && retry_raw.is_none() {
        tracing::debug!("no quota violation found in provider payload");
        return None;
    }

    let kind = quota_id.as_deref().map(classify_kind).unwrap_or(QuotaKind::Unknown);
    let tier_label = quota_id
        .as_deref()
        .map(classify_tier)
        .unwrap_or_else(|| "Unknown".to_string());
    let retry_delay_secs = retry_raw.as_deref().map(parse_retry_delay).unwrap_or(0);

    Some(ParsedViolation {
        kind,
        quota_id,
        quota_metric,
        quota_value,
        tier_label,
        retry_delay_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const QUOTA_ID_RPD: &str = "GenerateContentInputTokensPerModelPerDay-FreeTier";
    const QUOTA_ID_RPM: &str = "GenerateRequestsPerMinutePerProjectPerModel-FreeTier";

    fn structured_error(quota_id: &str, retry: &str) -> Value {
        json!({
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "status": "RESOURCE_EXHAUSTED",
                "details": [
                    {
                        "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                        "violations": [{
                            "quotaMetric": "generativelanguage.googleapis.com/generate_content_input_tokens",
                            "quotaId": quota_id,
                            "quotaValue": "1000000"
                        }]
                    },
                    {
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": retry
                    }
                ]
            }
        })
    }

    #[test]
    fn test_top_level_structured_details() {
        let parsed = parse_quota_error(&structured_error(QUOTA_ID_RPM, "17s")).unwrap();
        assert_eq!(parsed.kind, QuotaKind::Rpm);
        assert_eq!(parsed.quota_id.as_deref(), Some(QUOTA_ID_RPM));
        assert_eq!(parsed.tier_label, "FreeTier");
        assert_eq!(parsed.retry_delay_secs, 17);
        assert!(parsed.quota_metric.is_some());
        assert_eq!(parsed.quota_value.as_deref(), Some("1000000"));
    }

    #[test]
    fn test_single_nested_message() {
        let inner = structured_error(QUOTA_ID_RPM, "17s");
        let payload = json!({ "message": inner.to_string() });

        let parsed = parse_quota_error(&payload).unwrap();
        assert_eq!(parsed.quota_id.as_deref(), Some(QUOTA_ID_RPM));
        assert_eq!(parsed.retry_delay_secs, 17);
    }

    #[test]
    fn test_double_nested_message() {
        let inner = structured_error(QUOTA_ID_RPM, "17s");
        let middle = json!({ "error": { "message": inner.to_string() } });
        let payload = json!({ "message": middle.to_string() });

        let parsed = parse_quota_error(&payload).unwrap();
        assert_eq!(parsed.quota_id.as_deref(), Some(QUOTA_ID_RPM));
    }

    #[test]
    fn test_nesting_levels_recover_identical_quota_id() {
        let top = structured_error(QUOTA_ID_RPD, "56s");
        let nested_once = json!({ "message": top.to_string() });
        let nested_twice =
            json!({ "message": json!({ "error": { "message": top.to_string() } }).to_string() });

        let a = parse_quota_error(&top).unwrap();
        let b = parse_quota_error(&nested_once).unwrap();
        let c = parse_quota_error(&nested_twice).unwrap();

        assert_eq!(a.quota_id, b.quota_id);
        assert_eq!(b.quota_id, c.quota_id);
    }

    #[test]
    fn test_scenario_double_nested_rpd_free_tier() {
        // {message: "{\"error\":{\"details\":[...QuotaFailure, ...RetryInfo 56s]}}"}
        let inner = json!({
            "error": {
                "details": [
                    {
                        "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                        "violations": [{ "quotaId": QUOTA_ID_RPD }]
                    },
                    {
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": "56s"
                    }
                ]
            }
        });
        let payload = json!({ "message": inner.to_string() });

        let parsed = parse_quota_error(&payload).unwrap();
        assert_eq!(parsed.kind, QuotaKind::Rpd);
        assert_eq!(parsed.tier_label, "FreeTier");
        assert_eq!(parsed.retry_delay_secs, 56);
    }

    #[test]
    fn test_regex_fallback_without_details() {
        let payload = json!({
            "error": {
                "message": format!(
                    "quota exceeded; \"quotaId\": \"{QUOTA_ID_RPM}\", \"retryDelay\": \"30s\""
                )
            }
        });

        let parsed = parse_quota_error(&payload).unwrap();
        assert_eq!(parsed.quota_id.as_deref(), Some(QUOTA_ID_RPM));
        assert_eq!(parsed.kind, QuotaKind::Rpm);
        assert_eq!(parsed.retry_delay_secs, 30);
    }

    #[test]
    fn test_no_violation_found() {
        assert!(parse_quota_error(&json!({ "message": "internal error" })).is_none());
        assert!(parse_quota_error(&json!({})).is_none());
        assert!(parse_quota_error(&json!("not an object")).is_none());
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            classify_kind("GenerateRequestsPerMinutePerProject"),
            QuotaKind::Rpm
        );
        assert_eq!(classify_kind("GenerateRequestsPerDay"), QuotaKind::Rpd);
        // A per-day token quota classifies by its window
        assert_eq!(classify_kind(QUOTA_ID_RPD), QuotaKind::Rpd);
        assert_eq!(classify_kind("GenerateContentInputTokens"), QuotaKind::Tpm);
        assert_eq!(classify_kind("SomethingElseEntirely"), QuotaKind::Unknown);
    }

    #[test]
    fn test_tier_classification_defaults_to_unknown() {
        assert_eq!(classify_tier("RequestsPerMinute-Tier2"), "Tier2");
        assert_eq!(classify_tier("RequestsPerMinute"), "Unknown");
    }

    #[test]
    fn test_retry_delay_parsing() {
        assert_eq!(parse_retry_delay("56s"), 56);
        assert_eq!(parse_retry_delay("0s"), 0);
        assert_eq!(parse_retry_delay("56"), 0);
        assert_eq!(parse_retry_delay("abcs"), 0);
        assert_eq!(parse_retry_delay(""), 0);
    }

    #[test]
    fn test_malformed_nested_json_degrades_to_regex() {
        let payload = json!({
            "message": format!("{{ not json, but \"quotaId\": \"{QUOTA_ID_RPM}\" appears")
        });
        let parsed = parse_quota_error(&payload).unwrap();
        assert_eq!(parsed.quota_id.as_deref(), Some(QUOTA_ID_RPM));
    }

    #[test]
    fn test_audit_record_shape() {
        let payload = structured_error(QUOTA_ID_RPM, "5s");
        let violation = parse_quota_error(&payload)
            .unwrap()
            .into_violation("gemini-2.0-flash", &payload);

        assert_eq!(violation.model, "gemini-2.0-flash");
        assert!(violation.is_rpm());
        assert!(violation.raw_payload.is_some());
        assert_eq!(violation.retry_delay_secs, 5);
    }
}
