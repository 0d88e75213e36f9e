pub mod client;

pub use client::ControlClient;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use url::Url;

/// Characters left alone when form-encoding a key or value.
const FORM_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

pub fn form_escape(text: &str) -> String {
    utf8_percent_encode(text, FORM_VALUE).to_string()
}

/// `application/x-www-form-urlencoded` text for `pairs`, in order.
pub fn form_encode<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", form_escape(k.as_ref()), form_escape(v.as_ref())))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Methods whose parameters travel in the request body rather than the query.
    pub fn carries_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents the type of body content in an HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyType {
    Json,
    FormUrlEncoded,
    Raw,
    None,
}

impl BodyType {
    /// Detects the body type from the Content-Type header.
    pub fn detect_body_type(headers: &HeaderMap) -> BodyType {
        if let Some(content_type) = headers.get(CONTENT_TYPE) {
            if let Ok(value) = content_type.to_str() {
                let value_lower = value.to_lowercase();
                if value_lower.contains("application/json") {
                    return BodyType::Json;
                } else if value_lower.contains("application/x-www-form-urlencoded") {
                    return BodyType::FormUrlEncoded;
                } else {
                    return BodyType::Raw;
                }
            }
        }
        BodyType::None
    }
}

/// A request a probe wants sent to the target, routed through the engine.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: String,
    pub body_type: BodyType,
}

impl ProbeRequest {
    /// Creates a new `ProbeRequest`, auto-detecting the body type from headers.
    pub fn new(method: HttpMethod, url: Url, headers: HeaderMap, body: String) -> Self {
        let body_type = BodyType::detect_body_type(&headers);
        Self {
            method,
            url,
            headers,
            body,
            body_type,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(HttpMethod::Get, url, HeaderMap::new(), String::new())
    }

    pub fn json(method: HttpMethod, url: Url, body: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self::new(method, url, headers, body.to_string())
    }

    pub fn form<K: AsRef<str>, V: AsRef<str>>(method: HttpMethod, url: Url, pairs: &[(K, V)]) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        Self::new(method, url, headers, form_encode(pairs))
    }

    /// Adds headers without replacing ones the probe set explicitly.
    pub fn with_headers(mut self, extra: &[(String, String)]) -> Self {
        for (key, val) in extra {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(val),
            ) {
                if !self.headers.contains_key(&name) {
                    self.headers.insert(name, value);
                }
            }
        }
        self.body_type = BodyType::detect_body_type(&self.headers);
        self
    }
}

/// What came back from the target for a [`ProbeRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ProbeResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `name=value` pairs from every `Set-Cookie` header, attributes dropped.
    pub fn cookies(&self) -> Vec<String> {
        self.header_values("set-cookie")
            .filter_map(|v| v.split(';').next())
            .map(|c| c.trim().to_string())
            .filter(|c| c.contains('='))
            .collect()
    }
}
