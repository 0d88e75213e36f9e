use crate::http::{form_escape, BodyType, ProbeRequest};
use reqwest::header::{HeaderValue, CONTENT_LENGTH};
use serde_json::Value;

/// A place in a probe request where a payload can be injected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionPoint {
    /// URL query parameter, by name.
    UrlParam(String),
    /// JSON body field, by dotted path (e.g. "user.profile.name").
    JsonField(String),
    /// form-urlencoded body parameter, by name.
    FormParam(String),
}

impl std::fmt::Display for InjectionPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InjectionPoint::UrlParam(p) => write!(f, "param: {}", p),
            InjectionPoint::JsonField(p) => write!(f, "json: {}", p),
            InjectionPoint::FormParam(p) => write!(f, "form: {}", p),
        }
    }
}

/// Recursively collects the paths of all leaf values in a JSON document.
fn extract_json_paths_recursive(value: &Value, current_path: &str, points: &mut Vec<InjectionPoint>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let new_path = if current_path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", current_path, key)
                };
                extract_json_paths_recursive(val, &new_path, points);
            }
        }
        Value::Array(arr) => {
            for (index, val) in arr.iter().enumerate() {
                let new_path = if current_path.is_empty() {
                    format!("[{}]", index)
                } else {
                    format!("{}[{}]", current_path, index)
                };
                extract_json_paths_recursive(val, &new_path, points);
            }
        }
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => {
            if !current_path.is_empty() {
                points.push(InjectionPoint::JsonField(current_path.to_string()));
            }
        }
    }
}

/// Lists every query parameter and body field of `req` a probe can inject into.
pub fn extract_injection_points(req: &ProbeRequest) -> Vec<InjectionPoint> {
    let mut points = Vec::new();

    for (key, _value) in req.url.query_pairs() {
        points.push(InjectionPoint::UrlParam(key.to_string()));
    }

    match req.body_type {
        BodyType::Json => {
            if let Ok(json_value) = serde_json::from_str::<Value>(&req.body) {
                extract_json_paths_recursive(&json_value, "", &mut points);
            }
        }
        BodyType::FormUrlEncoded => {
            for pair in req.body.split('&') {
                if let Some((key, _value)) = pair.split_once('=') {
                    if !key.is_empty() {
                        points.push(InjectionPoint::FormParam(key.to_string()));
                    }
                }
            }
        }
        _ => {}
    }

    points
}

/// Walks `path` ("a.b[0].c") down `value`, returning the addressed node.
fn json_node_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for part in path.split('.') {
        let (field, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !field.is_empty() {
            current = current.get_mut(field)?;
        }
        while let Some(start) = rest.find('[') {
            let end = rest.find(']')?;
            let index: usize = rest[start + 1..end].parse().ok()?;
            current = current.get_mut(index)?;
            rest = &rest[end + 1..];
        }
    }
    Some(current)
}

/// Creates a copy of `req` with `payload` injected as a string at `point`.
pub fn mutate_request(req: &ProbeRequest, point: &InjectionPoint, payload: &str) -> ProbeRequest {
    let mut new_request = req.clone();

    match point {
        InjectionPoint::UrlParam(param_name) => {
            mutate_url_param(&mut new_request, param_name, payload);
        }
        InjectionPoint::JsonField(json_path) => {
            mutate_json_field(&mut new_request, json_path, Value::String(payload.to_string()));
        }
        InjectionPoint::FormParam(form_key) => {
            mutate_form_param(&mut new_request, form_key, payload);
        }
    }

    update_content_length(&mut new_request);
    new_request
}

/// Like [`mutate_request`], but a JSON field receives `value` verbatim, so
/// structured payloads (operator objects) keep their shape. Other points get
/// the value's compact JSON text.
pub fn mutate_request_with_value(req: &ProbeRequest, point: &InjectionPoint, value: &Value) -> ProbeRequest {
    match point {
        InjectionPoint::JsonField(json_path) => {
            let mut new_request = req.clone();
            mutate_json_field(&mut new_request, json_path, value.clone());
            update_content_length(&mut new_request);
            new_request
        }
        _ => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            mutate_request(req, point, &text)
        }
    }
}

fn mutate_url_param(req: &mut ProbeRequest, param_name: &str, payload: &str) {
    let mut url = req.url.clone();

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if k == param_name {
                (k.to_string(), payload.to_string())
            } else {
                (k.to_string(), v.to_string())
            }
        })
        .collect();

    url.query_pairs_mut().clear().extend_pairs(pairs);
    req.url = url;
}

fn mutate_json_field(req: &mut ProbeRequest, json_path: &str, replacement: Value) {
    if let Ok(mut json_value) = serde_json::from_str::<Value>(&req.body) {
        if let Some(node) = json_node_mut(&mut json_value, json_path) {
            *node = replacement;
            req.body = json_value.to_string();
        }
    }
}

fn mutate_form_param(req: &mut ProbeRequest, form_key: &str, payload: &str) {
    let new_pairs: Vec<String> = req
        .body
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key == form_key => {
                format!("{}={}", key, form_escape(payload))
            }
            _ => pair.to_string(),
        })
        .collect();

    req.body = new_pairs.join("&");
}

fn update_content_length(req: &mut ProbeRequest) {
    if req.body.is_empty() {
        req.headers.remove(CONTENT_LENGTH);
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&req.body.len().to_string()) {
        req.headers.insert(CONTENT_LENGTH, value);
    }
}
