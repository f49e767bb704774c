use copyline::config::WorkerConfig;
use copyline::error::ErrorCategory;
use copyline::pipeline::{HttpStageWorker, StageContext, StageWorker};
use copyline::stage::StageGraph;
use copyline::types::{GenerationRequest, StageId};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn worker(server: &MockServer, timeout_secs: u64) -> HttpStageWorker {
    HttpStageWorker::new(&WorkerConfig {
        base_url: server.uri(),
        timeout_secs,
        api_key: Some("test-key".to_string()),
    })
    .unwrap()
}

fn context(stage: StageId) -> StageContext {
    StageContext {
        generation_key: "gen_0123456789abcdef".to_string(),
        stage,
        spec: StageGraph::standard().spec(stage),
        request: GenerationRequest::builder("Aurora Espresso Grinder", "Burr grinder.")
            .build()
            .unwrap(),
        use_grounding: true,
        launch_date: None,
        dependencies: BTreeMap::new(),
        attempt: 1,
    }
}

#[tokio::test]
async fn success_returns_response_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stages/faq"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "stage": "faq", "use_grounding": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "questions": 3 })))
        .expect(1)
        .mount(&server)
        .await;

    let payload = worker(&server, 5)
        .invoke(StageId::Faq, &context(StageId::Faq))
        .await
        .unwrap();
    assert_eq!(payload, json!({ "questions": 3 }));
}

#[tokio::test]
async fn rate_limit_reads_retry_after_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stages/faq"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let err = worker(&server, 5)
        .invoke(StageId::Faq, &context(StageId::Faq))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::RateLimit);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    assert!(err.message.contains("slow down"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn server_error_body_is_kept_and_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stages/chapters"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;

    let err = worker(&server, 5)
        .invoke(StageId::Chapters, &context(StageId::Chapters))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::ExternalApi);
    assert_eq!(err.code, "E_HTTP_503");
    assert!(err.message.contains("upstream overloaded"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn unparseable_success_body_is_an_external_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stages/keywords"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = worker(&server, 5)
        .invoke(StageId::Keywords, &context(StageId::Keywords))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::ExternalApi);
}

#[tokio::test]
async fn slow_worker_times_out_as_network_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stages/description"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "text": "late" }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = worker(&server, 1)
        .invoke(StageId::Description, &context(StageId::Description))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Network);
    assert!(err.is_retryable());
}
