use gcw_testutil::TestBackend;
use serde_json::{Value, json};

#[tokio::test]
async fn json_endpoint_issues_and_resumes_keys() {
    let backend = TestBackend::start().await.unwrap();
    let client = reqwest::Client::new();

    let issued: Value = client
        .post(backend.http_url())
        .json(&json!({"type": "handshake"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(issued["status"], "success");
    assert_eq!(issued["sessionKey"], "abc123");

    let resumed: Value = client
        .post(backend.http_url())
        .json(&json!({"type": "handshake", "sessionKey": "kept"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resumed["sessionKey"], "kept");
    assert_eq!(backend.requests_of_type("handshake").len(), 2);
}

#[tokio::test]
async fn jsonp_endpoint_wraps_reply_in_callback() {
    let backend = TestBackend::start().await.unwrap();
    let body = reqwest::Client::new()
        .get(format!(
            "{}?type=message&text=hi&sessionKey=k&callback=cb_1",
            backend.http_url()
        ))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.starts_with("cb_1("), "unexpected body {body}");
    assert!(body.ends_with(");"));
    assert!(body.contains("echo: hi"));
}

#[tokio::test]
async fn injected_failures_answer_unavailable() {
    let backend = TestBackend::start().await.unwrap();
    backend.fail_next(1);
    let client = reqwest::Client::new();
    let first = client
        .post(backend.http_url())
        .json(&json!({"type": "handshake"}))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let second = client
        .post(backend.http_url())
        .json(&json!({"type": "handshake"}))
        .send()
        .await
        .unwrap();
    assert!(second.status().is_success());
    assert_eq!(backend.hits(), 2);
    assert_eq!(backend.requests().len(), 1);
}
