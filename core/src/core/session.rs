use std::collections::BTreeSet;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::engine::ScanEngine;
use crate::error::{Result, ScanError};
use crate::http::ProbeRequest;
use crate::parse_custom_headers;

/// How a run establishes its authenticated session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Path requested through the engine to start a login; any cookies it
    /// sets become part of the session.
    pub login_path: Option<String>,
    /// Static headers, e.g. "Authorization: Bearer TOKEN".
    pub headers: Vec<String>,
    /// Who the session acts as.
    pub principal: Option<String>,
    /// Object identifiers that belong to the principal.
    pub owned_ids: Vec<String>,
}

impl SessionConfig {
    pub fn is_configured(&self) -> bool {
        self.login_path.is_some() || !self.headers.is_empty()
    }
}

/// Authentication context for one run. Read-only once established.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    principal: Option<String>,
    headers: Vec<(String, String)>,
    owned_ids: BTreeSet<String>,
}

impl Session {
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    pub fn authenticated(
        principal: Option<String>,
        headers: Vec<(String, String)>,
        owned_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            principal,
            headers,
            owned_ids: owned_ids.into_iter().collect(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.headers.is_empty()
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn owns(&self, object_id: &str) -> bool {
        self.owned_ids.contains(object_id)
    }

    /// Attaches the session's credentials to a request.
    pub fn apply(&self, request: ProbeRequest) -> ProbeRequest {
        if self.headers.is_empty() {
            request
        } else {
            request.with_headers(&self.headers)
        }
    }
}

/// Begins the authenticated session described by `config`.
///
/// The login request goes through the engine so it lands in the engine's
/// history like every other probe request.
pub async fn begin_session(
    engine: &dyn ScanEngine,
    base: &Url,
    config: &SessionConfig,
) -> Result<Session> {
    let mut headers = parse_custom_headers(&config.headers);

    if let Some(ref login_path) = config.login_path {
        let mut login_base = base.clone();
        if !login_base.path().ends_with('/') {
            let with_slash = format!("{}/", login_base.path());
            login_base.set_path(&with_slash);
        }
        let url = login_base
            .join(login_path.trim_start_matches('/'))
            .map_err(|e| ScanError::InvalidConfig(format!("login path '{}': {}", login_path, e)))?;

        let response = engine.send_request(&ProbeRequest::get(url.clone())).await?;
        let cookies = response.cookies();
        if cookies.is_empty() {
            warn!("Login request to {} (HTTP {}) set no cookies", url, response.status);
        } else {
            info!("Login request to {} set {} cookie(s)", url, cookies.len());
            headers.push(("Cookie".to_string(), cookies.join("; ")));
        }
    }

    if headers.is_empty() {
        return Ok(Session::unauthenticated());
    }

    Ok(Session::authenticated(
        config.principal.clone(),
        headers,
        config.owned_ids.iter().cloned(),
    ))
}
