//! Provider HTTP contract tests against a mock server

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use yeoul::config::{MetadataConfig, ProviderConfig};
use yeoul::provider::{
    parse_iso8601_duration, GeminiClient, GenerateRequest, HttpMetadataClient, InferenceProvider,
    MetadataProvider, ProviderError,
};
use yeoul::quota::parse_quota_error;
use yeoul::QuotaKind;

fn provider_config(endpoint: String) -> ProviderConfig {
    ProviderConfig {
        endpoint,
        api_key: "test-key".to_string(),
        timeout_secs: 5,
        streaming: false,
    }
}

fn metadata_config(endpoint: String) -> MetadataConfig {
    MetadataConfig {
        endpoint,
        api_key: "test-key".to_string(),
        timeout_secs: 5,
    }
}

#[tokio::test]
async fn test_generate_content_happy_path() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .and(body_string_contains("analyze this"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"summary\":\"done\"}" }] }
            }],
            "usageMetadata": { "totalTokenCount": 432 }
        })))
        .mount(&server)
        .await;

    let client = GeminiClient::new(&provider_config(server.uri())).unwrap();
    let response = client
        .generate(&GenerateRequest::text("gemini-2.0-flash", "analyze this"))
        .await
        .unwrap();

    assert_eq!(response.text, "{\"summary\":\"done\"}");
    assert_eq!(response.total_tokens, Some(432));
}

#[tokio::test]
async fn test_429_payload_reaches_the_violation_parser() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "status": "RESOURCE_EXHAUSTED",
                "details": [
                    {
                        "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                        "violations": [{
                            "quotaId": "GenerateRequestsPerMinutePerProjectPerModel-FreeTier"
                        }]
                    },
                    {
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": "41s"
                    }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = GeminiClient::new(&provider_config(server.uri())).unwrap();
    let err = client
        .generate(&GenerateRequest::text("gemini-2.0-flash", "p"))
        .await
        .unwrap_err();

    let ProviderError::QuotaRejected { payload } = err else {
        panic!("expected quota rejection, got {err:?}");
    };

    let parsed = parse_quota_error(&payload).expect("payload should parse");
    assert_eq!(parsed.kind, QuotaKind::Rpm);
    assert_eq!(parsed.tier_label, "FreeTier");
    assert_eq!(parsed.retry_delay_secs, 41);
}

#[tokio::test]
async fn test_503_maps_to_overloaded() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
            "error": {
                "code": 503,
                "message": "The model is overloaded. Please try again later.",
                "status": "UNAVAILABLE"
            }
        })))
        .mount(&server)
        .await;

    let client = GeminiClient::new(&provider_config(server.uri())).unwrap();
    let err = client
        .generate(&GenerateRequest::text("gemini-2.0-flash", "p"))
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Overloaded { .. }));
}

#[tokio::test]
async fn test_streaming_collects_sse_chunks() {
    let server = MockServer::start().await;

    let sse_body = concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello, \"}]}}]}\n\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"world\"}]}}],",
        "\"usageMetadata\":{\"totalTokenCount\":99}}\n\n",
    );

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .mount(&server)
        .await;

    let client = GeminiClient::new(&provider_config(server.uri())).unwrap();
    let response = client
        .generate(&GenerateRequest::text("gemini-2.0-flash", "p").streaming())
        .await
        .unwrap();

    assert_eq!(response.text, "Hello, world");
    assert_eq!(response.total_tokens, Some(99));
}

#[tokio::test]
async fn test_metadata_fetch_parses_video_payload() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{
                "snippet": {
                    "title": "A test video",
                    "description": "About testing",
                    "publishedAt": "2026-02-01T08:00:00Z"
                },
                "contentDetails": { "duration": "PT20M" },
                "statistics": { "viewCount": "4321" }
            }]
        })))
        .mount(&server)
        .await;

    let client = HttpMetadataClient::new(&metadata_config(server.uri())).unwrap();
    let meta = client.fetch("vid-http").await.unwrap();

    assert_eq!(meta.title, "A test video");
    assert_eq!(meta.duration_secs, 1_200);
    assert_eq!(meta.view_count, 4_321);
    assert!(meta.published_at.is_some());
}

#[tokio::test]
async fn test_metadata_missing_video_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "items": [] })))
        .mount(&server)
        .await;

    let client = HttpMetadataClient::new(&metadata_config(server.uri())).unwrap();
    let err = client.fetch("vid-nope").await.unwrap_err();

    assert!(matches!(err, ProviderError::NotFound(_)));
}

#[test]
fn test_duration_parser_matches_provider_formats() {
    assert_eq!(parse_iso8601_duration("PT20M13S"), Some(1_213));
    assert_eq!(parse_iso8601_duration("PT2H"), Some(7_200));
    assert_eq!(parse_iso8601_duration("not-a-duration"), None);
}
