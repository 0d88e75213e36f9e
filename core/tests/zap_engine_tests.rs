use std::time::Duration;

use serde_json::json;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use zapflow_core::core::backoff::RetryPolicy;
use zapflow_core::engine::{ScanEngine, ScanHandle, ScanPhase};
use zapflow_core::http::{ControlClient, HttpMethod, ProbeRequest};
use zapflow_core::{ScanError, ZapEngine};

fn engine_for(addr: &str) -> ZapEngine {
    let client = ControlClient::new(addr, Some("key"), 5, RetryPolicy::new(2, 1)).unwrap();
    ZapEngine::new(client)
}

fn target() -> Url {
    Url::parse("http://localhost:5000").unwrap()
}

fn alert_json(id: usize, plugin: &str) -> serde_json::Value {
    json!({
        "id": id.to_string(),
        "pluginId": plugin,
        "alert": format!("Alert {}", id),
        "risk": "Low",
        "url": "http://localhost:5000/api/items",
        "param": "",
        "description": "",
    })
}

#[tokio::test]
async fn test_start_spider_returns_handle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/JSON/spider/action/scan/"))
        .and(query_param("url", "http://localhost:5000/"))
        .and(header("X-ZAP-API-Key", "key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scan": "3"})))
        .expect(1)
        .mount(&server)
        .await;

    let handle = engine_for(&server.uri()).start_spider(&target()).await.unwrap();
    assert_eq!(handle.phase, ScanPhase::Spider);
    assert_eq!(handle.id, "3");
}

#[tokio::test]
async fn test_poll_status_accepts_string_and_number() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/spider/view/status/"))
        .and(query_param("scanId", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "55"})))
        .mount(&server)
        .await;
    Mock::given(path("/JSON/ascan/view/status/"))
        .and(query_param("scanId", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 140})))
        .mount(&server)
        .await;

    let engine = engine_for(&server.uri());
    let spider = ScanHandle::new(ScanPhase::Spider, "3");
    let active = ScanHandle::new(ScanPhase::ActiveScan, "3");
    assert_eq!(engine.poll_status(&spider).await.unwrap(), 55);
    assert_eq!(engine.poll_status(&active).await.unwrap(), 100);
}

#[tokio::test]
async fn test_engine_error_body_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/spider/view/status/"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"code": "bad_scan_id", "message": "Invalid scan ID"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = engine_for(&server.uri())
        .poll_status(&ScanHandle::new(ScanPhase::Spider, "9"))
        .await
        .unwrap_err();
    match err {
        ScanError::EngineError { operation, reason } => {
            assert_eq!(operation, "spider status");
            assert_eq!(reason, "bad_scan_id: Invalid scan ID");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_error_payload_with_success_status() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/ascan/action/scan/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": "url_not_found"})))
        .mount(&server)
        .await;

    let err = engine_for(&server.uri()).start_active_scan(&target()).await.unwrap_err();
    assert!(matches!(err, ScanError::EngineError { ref reason, .. } if reason == "url_not_found"));
}

#[tokio::test]
async fn test_server_error_maps_to_engine_error() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/core/view/hosts/"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let err = engine_for(&server.uri()).list_hosts().await.unwrap_err();
    assert!(matches!(err, ScanError::EngineError { ref reason, .. } if reason == "HTTP 500"));
}

#[tokio::test]
async fn test_unreachable_engine_after_retries() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let engine = engine_for(&format!("http://127.0.0.1:{}", port));
    let err = engine.start_spider(&target()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, ScanError::EngineUnreachable { ref operation, .. } if operation == "start spider"));
}

#[tokio::test]
async fn test_send_request_parses_response_message() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/core/action/sendRequest/"))
        .and(query_param("followRedirects", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sendRequest": [{
                "requestHeader": "GET http://localhost:5000/auth/user HTTP/1.1\r\n\r\n",
                "responseHeader": "HTTP/1.1 401 Unauthorized\r\nContent-Type: text/plain\r\nSet-Cookie: sid=abc; HttpOnly\r\n\r\n",
                "responseBody": "Unauthorized",
            }]
        })))
        .mount(&server)
        .await;

    let url = Url::parse("http://localhost:5000/auth/user").unwrap();
    let response = engine_for(&server.uri())
        .send_request(&ProbeRequest::get(url))
        .await
        .unwrap();
    assert_eq!(response.status, 401);
    assert_eq!(response.body, "Unauthorized");
    assert_eq!(response.cookies(), vec!["sid=abc"]);
}

#[tokio::test]
async fn test_send_request_without_message_fails() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/core/action/sendRequest/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sendRequest": []})))
        .mount(&server)
        .await;

    let url = Url::parse("http://localhost:5000/").unwrap();
    let err = engine_for(&server.uri())
        .send_request(&ProbeRequest::get(url))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::EngineError { .. }));
}

#[tokio::test]
async fn test_alerts_are_paged() {
    let server = MockServer::start().await;
    let first: Vec<_> = (0..500).map(|i| alert_json(i, "10038")).collect();
    let second: Vec<_> = (500..503).map(|i| alert_json(i, "10038")).collect();
    Mock::given(path("/JSON/core/view/alerts/"))
        .and(query_param("start", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"alerts": first})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/JSON/core/view/alerts/"))
        .and(query_param("start", "500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"alerts": second})))
        .expect(1)
        .mount(&server)
        .await;

    let alerts = engine_for(&server.uri()).list_alerts(&target()).await.unwrap();
    assert_eq!(alerts.len(), 503);
    assert_eq!(alerts[502].id, "502");
    assert_eq!(alerts[0].name, "Alert 0");
}

#[tokio::test]
async fn test_csrf_scan_keeps_anti_csrf_rules() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/core/action/sendRequest/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sendRequest": [{"responseHeader": "HTTP/1.1 200 OK\r\n\r\n", "responseBody": "<form></form>"}]
        })))
        .mount(&server)
        .await;
    Mock::given(path("/JSON/core/view/alerts/"))
        .and(query_param("baseurl", "http://localhost:5000/auth/logout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "alerts": [alert_json(1, "10202"), alert_json(2, "10038"), alert_json(3, "20012")]
        })))
        .mount(&server)
        .await;

    let url = Url::parse("http://localhost:5000/auth/logout").unwrap();
    let alerts = engine_for(&server.uri()).csrf_scan(&url).await.unwrap();
    let ids: Vec<_> = alerts.iter().map(|a| a.plugin_id.as_str()).collect();
    assert_eq!(ids, vec!["10202", "20012"]);
}

#[tokio::test]
async fn test_run_probe_sends_body_then_reads_alerts() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/core/action/sendRequest/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sendRequest": [{"responseHeader": "HTTP/1.1 201 Created\r\n\r\n", "responseBody": ""}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/JSON/core/view/alerts/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"alerts": [alert_json(7, "40012")]})))
        .expect(1)
        .mount(&server)
        .await;

    let url = Url::parse("http://localhost:5000/api/items").unwrap();
    let alerts = engine_for(&server.uri())
        .run_probe(&ProbeRequest::json(HttpMethod::Post, url, &json!({"test": "data"})))
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].plugin_id, "40012");
}

#[tokio::test]
async fn test_run_probe_replays_form_body() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/core/action/sendRequest/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sendRequest": [{"responseHeader": "HTTP/1.1 200 OK\r\n\r\n", "responseBody": ""}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/JSON/core/view/alerts/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"alerts": []})))
        .mount(&server)
        .await;

    let url = Url::parse("http://localhost:5000/").unwrap();
    let request = ProbeRequest::form(HttpMethod::Post, url, &[("customText", "<script>alert(\"XSS\")</script>")]);
    engine_for(&server.uri()).run_probe(&request).await.unwrap();

    let received = server.received_requests().await.unwrap();
    let replayed = received
        .iter()
        .find(|r| r.url.path() == "/JSON/core/action/sendRequest/")
        .and_then(|r| r.url.query_pairs().find(|(k, _)| k == "request").map(|(_, v)| v.to_string()))
        .unwrap();
    assert!(replayed.starts_with("POST http://localhost:5000/ HTTP/1.1\r\n"));
    assert!(replayed.contains("content-type: application/x-www-form-urlencoded\r\n"));
    assert!(replayed.ends_with("customText=%3Cscript%3Ealert%28%22XSS%22%29%3C%2Fscript%3E"));
}

/// A scan start that timed out may already have started a scan on the
/// engine, so it is not sent again.
#[tokio::test]
async fn test_slow_scan_start_is_not_repeated() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/spider/action/scan/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"scan": "3"}))
                .set_delay(Duration::from_millis(1500)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ControlClient::new(&server.uri(), Some("key"), 1, RetryPolicy::new(3, 1)).unwrap();
    let err = ZapEngine::new(client).start_spider(&target()).await.unwrap_err();
    assert!(matches!(err, ScanError::EngineUnreachable { ref operation, .. } if operation == "start spider"));
}

/// Views are safe to repeat, so a slow status read is retried.
#[tokio::test]
async fn test_slow_status_view_is_retried() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/spider/view/status/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "10"}))
                .set_delay(Duration::from_millis(1500)),
        )
        .expect(3)
        .mount(&server)
        .await;

    let client = ControlClient::new(&server.uri(), Some("key"), 1, RetryPolicy::new(3, 1)).unwrap();
    let err = ZapEngine::new(client)
        .poll_status(&ScanHandle::new(ScanPhase::Spider, "3"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_hosts_and_passive_queue() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/core/view/hosts/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hosts": ["localhost", "accounts.google.com"]})))
        .mount(&server)
        .await;
    Mock::given(path("/JSON/pscan/view/recordsToScan/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"recordsToScan": "12"})))
        .mount(&server)
        .await;

    let engine = engine_for(&server.uri());
    let hosts = engine.list_hosts().await.unwrap();
    assert_eq!(hosts.into_iter().collect::<Vec<_>>(), vec!["accounts.google.com", "localhost"]);
    assert_eq!(engine.passive_queue_len().await.unwrap(), 12);
}

#[tokio::test]
async fn test_render_report_returns_raw_bytes() {
    let server = MockServer::start().await;
    Mock::given(path("/OTHER/core/other/htmlreport/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>engine</html>"))
        .mount(&server)
        .await;

    let bytes = engine_for(&server.uri()).render_report().await.unwrap();
    assert_eq!(bytes, b"<html>engine</html>".to_vec());
}

#[tokio::test]
async fn test_stop_scan_targets_phase() {
    let server = MockServer::start().await;
    Mock::given(path("/JSON/ascan/action/stop/"))
        .and(query_param("scanId", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Result": "OK"})))
        .expect(1)
        .mount(&server)
        .await;

    engine_for(&server.uri())
        .stop_scan(&ScanHandle::new(ScanPhase::ActiveScan, "1"))
        .await
        .unwrap();
}
