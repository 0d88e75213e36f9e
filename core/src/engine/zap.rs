use std::collections::BTreeSet;

use async_trait::async_trait;
use log::debug;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use url::Url;

use crate::core::backoff::RetryPolicy;
use crate::engine::{EngineAlert, ScanEngine, ScanHandle, ScanPhase};
use crate::error::{Result, ScanError};
use crate::http::{ControlClient, ProbeRequest, ProbeResponse};
use crate::ScanConfig;

/// Plugin ids of the engine's anti-CSRF rules.
const CSRF_PLUGIN_IDS: &[&str] = &["10202", "20012"];

const ALERT_PAGE_SIZE: usize = 500;

/// `ScanEngine` over the ZAP JSON control API.
pub struct ZapEngine {
    client: ControlClient,
}

impl ZapEngine {
    pub fn new(client: ControlClient) -> Self {
        Self { client }
    }

    pub fn from_config(config: &ScanConfig) -> Result<Self> {
        let client = ControlClient::new(
            &config.engine_addr,
            config.api_key_ref(),
            config.request_timeout,
            RetryPolicy::new(config.retry_attempts, config.retry_base_ms),
        )?;
        Ok(Self::new(client))
    }

    async fn alerts_for(&self, operation: &str, base: &str) -> Result<Vec<EngineAlert>> {
        let mut alerts = Vec::new();
        let mut start = 0usize;
        loop {
            let start_str = start.to_string();
            let count_str = ALERT_PAGE_SIZE.to_string();
            let v = self
                .client
                .get_json(
                    operation,
                    "/JSON/core/view/alerts/",
                    &[("baseurl", base), ("start", start_str.as_str()), ("count", count_str.as_str())],
                )
                .await?;

            let page = v
                .get("alerts")
                .and_then(|a| a.as_array())
                .ok_or_else(|| ScanError::engine(operation, "response has no 'alerts' list"))?;

            let fetched = page.len();
            alerts.extend(page.iter().filter_map(parse_alert));

            if fetched < ALERT_PAGE_SIZE {
                break;
            }
            start += fetched;
        }
        Ok(alerts)
    }
}

#[async_trait]
impl ScanEngine for ZapEngine {
    async fn access_url(&self, url: &Url) -> Result<()> {
        self.client
            .act_json(
                "access url",
                "/JSON/core/action/accessUrl/",
                &[("url", url.as_str()), ("followRedirects", "true")],
            )
            .await?;
        Ok(())
    }

    async fn start_spider(&self, target: &Url) -> Result<ScanHandle> {
        let v = self
            .client
            .act_json(
                "start spider",
                "/JSON/spider/action/scan/",
                &[("url", target.as_str()), ("recurse", "true")],
            )
            .await?;
        let id = string_field(&v, "scan").ok_or_else(|| ScanError::engine("start spider", "response has no scan id"))?;
        debug!("Spider started with id {}", id);
        Ok(ScanHandle::new(ScanPhase::Spider, id))
    }

    async fn start_active_scan(&self, target: &Url) -> Result<ScanHandle> {
        let v = self
            .client
            .act_json(
                "start active scan",
                "/JSON/ascan/action/scan/",
                &[("url", target.as_str()), ("recurse", "true"), ("inScopeOnly", "false")],
            )
            .await?;
        let id = string_field(&v, "scan")
            .ok_or_else(|| ScanError::engine("start active scan", "response has no scan id"))?;
        debug!("Active scan started with id {}", id);
        Ok(ScanHandle::new(ScanPhase::ActiveScan, id))
    }

    async fn poll_status(&self, handle: &ScanHandle) -> Result<u8> {
        let (operation, path) = match handle.phase {
            ScanPhase::Spider => ("spider status", "/JSON/spider/view/status/"),
            ScanPhase::ActiveScan => ("active scan status", "/JSON/ascan/view/status/"),
        };
        let v = self.client.get_json(operation, path, &[("scanId", handle.id.as_str())]).await?;
        let raw = string_field(&v, "status").ok_or_else(|| ScanError::engine(operation, "response has no status"))?;
        let percent: u32 = raw
            .trim()
            .parse()
            .map_err(|_| ScanError::engine(operation, format!("non-numeric status '{}'", raw)))?;
        Ok(percent.min(100) as u8)
    }

    async fn stop_scan(&self, handle: &ScanHandle) -> Result<()> {
        let (operation, path) = match handle.phase {
            ScanPhase::Spider => ("stop spider", "/JSON/spider/action/stop/"),
            ScanPhase::ActiveScan => ("stop active scan", "/JSON/ascan/action/stop/"),
        };
        self.client.get_json(operation, path, &[("scanId", handle.id.as_str())]).await?;
        Ok(())
    }

    async fn passive_queue_len(&self) -> Result<u64> {
        let v = self
            .client
            .get_json("passive queue", "/JSON/pscan/view/recordsToScan/", &[])
            .await?;
        string_field(&v, "recordsToScan")
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| ScanError::engine("passive queue", "response has no recordsToScan"))
    }

    async fn send_request(&self, request: &ProbeRequest) -> Result<ProbeResponse> {
        let raw = raw_request(request);
        let v = self
            .client
            .act_json(
                "send request",
                "/JSON/core/action/sendRequest/",
                &[("request", raw.as_str()), ("followRedirects", "false")],
            )
            .await?;

        let message = v
            .get("sendRequest")
            .and_then(|m| m.as_array())
            .and_then(|m| m.first())
            .ok_or_else(|| ScanError::engine("send request", "response has no message"))?;

        let header = message
            .get("responseHeader")
            .and_then(|h| h.as_str())
            .ok_or_else(|| ScanError::engine("send request", "message has no response header"))?;
        let body = message
            .get("responseBody")
            .and_then(|b| b.as_str())
            .unwrap_or("");

        parse_response(header, body).ok_or_else(|| {
            ScanError::engine("send request", format!("unparseable status line in '{}'", first_line(header)))
        })
    }

    async fn run_probe(&self, request: &ProbeRequest) -> Result<Vec<EngineAlert>> {
        self.send_request(request).await?;
        self.alerts_for("probe alerts", request.url.as_str()).await
    }

    async fn csrf_scan(&self, url: &Url) -> Result<Vec<EngineAlert>> {
        self.send_request(&ProbeRequest::get(url.clone())).await?;
        let alerts = self.alerts_for("csrf alerts", url.as_str()).await?;
        Ok(alerts
            .into_iter()
            .filter(|a| CSRF_PLUGIN_IDS.contains(&a.plugin_id.as_str()))
            .collect())
    }

    async fn list_hosts(&self) -> Result<BTreeSet<String>> {
        let v = self.client.get_json("list hosts", "/JSON/core/view/hosts/", &[]).await?;
        let hosts = v
            .get("hosts")
            .and_then(|h| h.as_array())
            .ok_or_else(|| ScanError::engine("list hosts", "response has no 'hosts' list"))?;
        Ok(hosts
            .iter()
            .filter_map(|h| h.as_str())
            .map(|h| h.to_string())
            .collect())
    }

    async fn list_alerts(&self, base: &Url) -> Result<Vec<EngineAlert>> {
        self.alerts_for("list alerts", base.as_str()).await
    }

    async fn render_report(&self) -> Result<Vec<u8>> {
        self.client
            .get_bytes("render report", "/OTHER/core/other/htmlreport/", &[])
            .await
    }
}

/// Reads a field the engine may encode either as a string or as a number.
fn string_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_alert(v: &Value) -> Option<EngineAlert> {
    let name = v
        .get("alert")
        .or_else(|| v.get("name"))
        .and_then(|n| n.as_str())?;

    let text = |key: &str| v.get(key).and_then(|x| x.as_str()).unwrap_or("").to_string();

    Some(EngineAlert {
        id: string_field(v, "id").unwrap_or_default(),
        plugin_id: string_field(v, "pluginId").unwrap_or_default(),
        name: name.to_string(),
        risk: text("risk"),
        url: text("url"),
        param: text("param"),
        description: text("description"),
    })
}

/// Serializes a probe request into the raw HTTP message the engine replays.
fn raw_request(req: &ProbeRequest) -> String {
    let host = match (req.url.host_str(), req.url.port()) {
        (Some(h), Some(p)) => format!("{}:{}", h, p),
        (Some(h), None) => h.to_string(),
        _ => String::new(),
    };

    let mut raw = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", req.method, req.url, host);
    for (name, value) in req.headers.iter() {
        if let Ok(v) = value.to_str() {
            raw.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    if !req.body.is_empty() {
        if !req.headers.contains_key(CONTENT_TYPE) {
            raw.push_str("Content-Type: text/plain\r\n");
        }
        raw.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
    }

    raw.push_str("\r\n");
    raw.push_str(&req.body);
    raw
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn parse_response(header: &str, body: &str) -> Option<ProbeResponse> {
    let mut lines = header.lines();
    let status: u16 = lines.next()?.split_whitespace().nth(1)?.parse().ok()?;

    let mut response = ProbeResponse::new(status, body);
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            response = response.with_header(name.trim(), value.trim());
        }
    }
    Some(response)
}
