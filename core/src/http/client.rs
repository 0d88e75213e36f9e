use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::core::backoff::RetryPolicy;
use crate::error::{Result, ScanError};

const API_KEY_HEADER: &str = "X-ZAP-API-Key";

/// HTTP transport for the engine's control API.
///
/// Maps transport failures to `EngineUnreachable` (retried per the policy) and
/// non-success answers to `EngineError`. Actions go through
/// [`ControlClient::act_json`], which never repeats a call the engine may have
/// received.
pub struct ControlClient {
    inner: Client,
    base: Url,
    retry: RetryPolicy,
}

impl ControlClient {
    pub fn new(
        engine_addr: &str,
        api_key: Option<&str>,
        timeout_seconds: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let base = Url::parse(engine_addr)
            .map_err(|e| ScanError::InvalidConfig(format!("engine address '{}': {}", engine_addr, e)))?;

        let mut default_headers = HeaderMap::new();
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|_| ScanError::InvalidConfig("API key is not a valid header value".into()))?;
            default_headers.insert(HeaderName::from_static("x-zap-api-key"), value);
        }

        let inner = ClientBuilder::new()
            .timeout(Duration::from_secs(timeout_seconds))
            .default_headers(default_headers)
            .build()
            .map_err(|e| ScanError::InvalidConfig(format!("control client: {}", e)))?;

        debug!(
            "Control client for {} ({} set: {})",
            base,
            API_KEY_HEADER,
            api_key.is_some()
        );

        Ok(Self { inner, base, retry })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| ScanError::InvalidConfig(format!("control path '{}': {}", path, e)))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn send_once(&self, operation: &str, url: &Url) -> std::result::Result<Response, CallError> {
        let response = self
            .inner
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify(operation, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<Value>(&body) {
            Ok(v) => engine_error_message(&v).unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            Err(_) => format!("HTTP {}", status.as_u16()),
        };
        Err(CallError::delivered(ScanError::engine(operation, reason)))
    }

    async fn fetch_json(&self, operation: &str, url: &Url) -> std::result::Result<Value, CallError> {
        let response = self.send_once(operation, url).await?;
        let value: Value = response.json().await.map_err(|e| classify(operation, e))?;
        if let Some(message) = engine_error_message(&value) {
            return Err(CallError::delivered(ScanError::engine(operation, message)));
        }
        Ok(value)
    }

    /// GETs a JSON view, or an action that is safe to repeat, and returns the
    /// decoded body.
    pub async fn get_json(&self, operation: &str, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = &self.endpoint(path, params)?;
        self.retry
            .run_if(operation, move || self.fetch_json(operation, url), |e: &CallError| e.error.is_retryable())
            .await
            .map_err(|e| e.error)
    }

    /// GETs an action the engine must not perform twice (starting a scan,
    /// replaying a request). Retried only when the call never reached the
    /// engine; a timeout may mean the engine already acted on it.
    pub async fn act_json(&self, operation: &str, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = &self.endpoint(path, params)?;
        self.retry
            .run_if(
                operation,
                move || self.fetch_json(operation, url),
                |e: &CallError| e.error.is_retryable() && !e.reached_engine,
            )
            .await
            .map_err(|e| e.error)
    }

    /// GETs a non-JSON resource (e.g. a rendered report).
    pub async fn get_bytes(&self, operation: &str, path: &str, params: &[(&str, &str)]) -> Result<Vec<u8>> {
        let url = &self.endpoint(path, params)?;
        self.retry
            .run_if(
                operation,
                move || async move {
                    let response = self.send_once(operation, url).await?;
                    let bytes = response.bytes().await.map_err(|e| classify(operation, e))?;
                    Ok::<_, CallError>(bytes.to_vec())
                },
                |e: &CallError| e.error.is_retryable(),
            )
            .await
            .map_err(|e| e.error)
    }
}

/// A failed control call, and whether the engine may have seen it.
#[derive(Debug)]
struct CallError {
    error: ScanError,
    reached_engine: bool,
}

impl CallError {
    fn delivered(error: ScanError) -> Self {
        Self {
            error,
            reached_engine: true,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Only a failed connect guarantees the request never reached the engine.
fn classify(operation: &str, err: reqwest::Error) -> CallError {
    let reached_engine = !err.is_connect();
    let error = if err.is_connect() || err.is_timeout() || err.is_request() {
        ScanError::unreachable(operation, err)
    } else {
        ScanError::engine(operation, err)
    };
    CallError { error, reached_engine }
}

/// The engine reports failures as `{"code": "...", "message": "..."}`.
fn engine_error_message(value: &Value) -> Option<String> {
    let code = value.get("code")?.as_str()?;
    let message = value.get("message").and_then(|m| m.as_str()).unwrap_or("");
    Some(if message.is_empty() {
        code.to_string()
    } else {
        format!("{}: {}", code, message)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_error_message_shapes() {
        assert_eq!(
            engine_error_message(&json!({"code": "bad_scan_id", "message": "Invalid scan ID"})).as_deref(),
            Some("bad_scan_id: Invalid scan ID")
        );
        assert_eq!(engine_error_message(&json!({"code": "no_implementor"})).as_deref(), Some("no_implementor"));
        assert_eq!(engine_error_message(&json!({"scan": "3"})), None);
    }

    #[test]
    fn test_rejects_bad_engine_address() {
        let err = ControlClient::new("not a url", None, 5, RetryPolicy::default());
        assert!(matches!(err, Err(ScanError::InvalidConfig(_))));
    }

    #[test]
    fn test_endpoint_appends_params() {
        let client = ControlClient::new("http://127.0.0.1:8080", Some("k"), 5, RetryPolicy::default()).unwrap();
        let url = client
            .endpoint("/JSON/spider/view/status/", &[("scanId", "4")])
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/JSON/spider/view/status/?scanId=4");
    }
}
