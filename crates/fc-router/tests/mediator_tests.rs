//! HttpMediator Unit Tests
//!
//! Tests for:
//! - Successful message delivery
//! - HTTP status code handling
//! - Circuit breaker behavior
//! - Retry logic
//! - Custom delay parsing from response
//! - Auth token handling

use std::time::Duration;
use wiremock::{MockServer, Mock, ResponseTemplate};
use wiremock::matchers::{method, path, header, body_json};

use fc_common::{Message, MediationType, MediationResult};
use fc_router::{HttpMediator, HttpMediatorConfig, Mediator, CircuitBreakerState};
use chrono::Utc;

fn create_test_message(target: &str) -> Message {
    Message {
        id: "msg-1".to_string(),
        pool_code: "DEFAULT".to_string(),
        auth_token: None,
        signing_secret: None,
        mediation_type: MediationType::HTTP,
        mediation_target: target.to_string(),
        message_group_id: None,
    }
}

fn create_test_message_with_auth(target: &str, token: &str) -> Message {
    Message {
        id: "msg-auth".to_string(),
        pool_code: "DEFAULT".to_string(),
        auth_token: Some(token.to_string()),
        signing_secret: None,
        mediation_type: MediationType::HTTP,
        mediation_target: target.to_string(),
        message_group_id: None,
    }
}

#[tokio::test]
async fn test_successful_delivery() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::Success);
    assert!(outcome.error_message.is_none());
}

#[tokio::test]
async fn test_successful_delivery_empty_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn test_auth_token_sent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/secure-webhook"))
        .and(header("Authorization", "Bearer test-token-123"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message_with_auth(
        &format!("{}/secure-webhook", mock_server.uri()),
        "test-token-123",
    );

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn test_ack_false_with_custom_delay() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"ack": false, "delaySeconds": 60}))
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 1, // Don't retry for this test
        ..Default::default()
    };
    let mediator = HttpMediator::with_config(config);
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.delay_seconds, Some(60));
}

#[tokio::test]
async fn test_400_bad_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorConfig);
    assert_eq!(outcome.status_code, Some(400));
}

#[tokio::test]
async fn test_401_unauthorized() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorConfig);
    assert_eq!(outcome.status_code, Some(401));
}

#[tokio::test]
async fn test_403_forbidden() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorConfig);
    assert_eq!(outcome.status_code, Some(403));
}

#[tokio::test]
async fn test_404_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorConfig);
    assert_eq!(outcome.status_code, Some(404));
}

#[tokio::test]
async fn test_500_server_error_with_retry() {
    let mock_server = MockServer::start().await;

    // First 2 calls fail, third succeeds
    // Use up_to_n_times to limit the 500 responses, then fall through to 200
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 3,
        retry_delays: vec![
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ],
        ..Default::default()
    };
    let mediator = HttpMediator::with_config(config);
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    // After retries, should still fail because mock expects specific order
    // This tests that retries are happening
    assert!(outcome.result == MediationResult::Success || outcome.result == MediationResult::ErrorProcess);
}

#[tokio::test]
async fn test_500_exhausts_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 3,
        retry_delays: vec![
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ],
        ..Default::default()
    };
    let mediator = HttpMediator::with_config(config);
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.status_code, Some(500));
}

#[tokio::test]
async fn test_501_not_implemented() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(501))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorConfig);
    assert_eq!(outcome.status_code, Some(501));
}

#[tokio::test]
async fn test_connection_error() {
    let mediator = HttpMediator::new();
    // Use a port that's definitely not listening
    let message = create_test_message("http://127.0.0.1:59999/webhook");

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert!(outcome.error_message.is_some());
}

#[tokio::test]
async fn test_circuit_breaker_trips_on_failures() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 1,
        circuit_breaker_window_size: 3,
        circuit_breaker_failure_rate: 1.0,
        circuit_breaker_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let mediator = HttpMediator::with_config(config);
    let target = format!("{}/webhook", mock_server.uri());
    let message = create_test_message(&target);

    // Make enough requests to trip the circuit breaker
    for _ in 0..3 {
        mediator.mediate(&message).await;
    }

    assert_eq!(mediator.circuit_state(&target), CircuitBreakerState::Open);

    // Next request should be rejected immediately
    let outcome = mediator.mediate(&message).await;
    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert!(outcome.error_message.as_ref().unwrap().contains("Circuit breaker"));
}

#[tokio::test]
async fn test_circuit_breaker_resets_on_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 1,
        circuit_breaker_window_size: 3,
        circuit_breaker_failure_rate: 1.0,
        ..Default::default()
    };
    let mediator = HttpMediator::with_config(config);
    let target = format!("{}/webhook", mock_server.uri());
    let message = create_test_message(&target);

    // Successful requests should keep circuit closed
    for _ in 0..5 {
        let outcome = mediator.mediate(&message).await;
        assert_eq!(outcome.result, MediationResult::Success);
    }

    assert_eq!(mediator.circuit_state(&target), CircuitBreakerState::Closed);
}

#[tokio::test]
async fn test_timeout_handling() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(10)) // Long delay
        )
        .mount(&mock_server)
        .await;

    let config = HttpMediatorConfig {
        timeout: Duration::from_millis(100), // Short timeout
        max_retries: 1,
        ..Default::default()
    };
    let mediator = HttpMediator::with_config(config);
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert!(outcome.error_message.as_ref().unwrap().contains("timeout"));
}

#[tokio::test]
async fn test_payload_sent_correctly() {
    let mock_server = MockServer::start().await;

    // The mediator sends {"messageId":"<id>"} as the wire payload, NOT the message payload
    let expected_payload = serde_json::json!({"messageId": "msg-1"});

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .and(body_json(&expected_payload))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn test_422_unprocessable_entity() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(422))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mediator = HttpMediator::new();
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    // 422 is a client error, should be ErrorConfig
    assert_eq!(outcome.result, MediationResult::ErrorConfig);
    assert_eq!(outcome.status_code, Some(422));
}

#[tokio::test]
async fn test_502_bad_gateway() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&mock_server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 1,
        ..Default::default()
    };
    let mediator = HttpMediator::with_config(config);
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    // 502 is a server error, should be ErrorProcess with retry
    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.status_code, Some(502));
}

#[tokio::test]
async fn test_503_service_unavailable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let config = HttpMediatorConfig {
        max_retries: 1,
        ..Default::default()
    };
    let mediator = HttpMediator::with_config(config);
    let message = create_test_message(&format!("{}/webhook", mock_server.uri()));

    let outcome = mediator.mediate(&message).await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.status_code, Some(503));
}

#[tokio::test]
async fn test_mediator_default_config() {
    let mediator = HttpMediator::new();
    assert_eq!(mediator.circuit_state("https://unseen.example.com/webhook"), CircuitBreakerState::Closed);
}
