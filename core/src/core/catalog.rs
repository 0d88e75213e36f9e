use std::collections::{BTreeSet, HashSet};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::EndpointRef;
use crate::error::{Result, ScanError};
use crate::http::HttpMethod;

/// Placeholder an object-referencing path uses for its identifier.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Identifier substituted into templated paths by probes that do not vary it.
pub const DEFAULT_OBJECT_ID: &str = "1";

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Sensitivity {
    Public,
    AuthRequired,
    StateChanging,
    ObjectReferencing,
}

impl std::fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sensitivity::Public => write!(f, "public"),
            Sensitivity::AuthRequired => write!(f, "auth-required"),
            Sensitivity::StateChanging => write!(f, "state-changing"),
            Sensitivity::ObjectReferencing => write!(f, "object-referencing"),
        }
    }
}

/// How body-carrying requests to an endpoint encode their parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    Json,
    /// `application/x-www-form-urlencoded`.
    Form,
}

fn default_methods() -> BTreeSet<HttpMethod> {
    BTreeSet::from([HttpMethod::Get])
}

/// One entry of the target's endpoint catalog. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub path: String,
    pub sensitivity: Sensitivity,
    #[serde(default = "default_methods")]
    pub methods: BTreeSet<HttpMethod>,
    /// Query or body parameter names the endpoint accepts.
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, sensitivity: Sensitivity) -> Self {
        Self {
            path: path.into(),
            sensitivity,
            methods: default_methods(),
            params: Vec::new(),
            body_encoding: BodyEncoding::default(),
        }
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn with_params<S: Into<String>>(mut self, params: impl IntoIterator<Item = S>) -> Self {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_body_encoding(mut self, encoding: BodyEncoding) -> Self {
        self.body_encoding = encoding;
        self
    }

    pub fn reference(&self) -> EndpointRef {
        EndpointRef {
            path: self.path.clone(),
            sensitivity: self.sensitivity,
        }
    }

    pub fn accepts_params(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn is_template(&self) -> bool {
        self.path.contains(ID_PLACEHOLDER)
    }

    /// Resolves the endpoint against the target base URL. Templated paths get
    /// `object_id` (or [`DEFAULT_OBJECT_ID`]) in place of the placeholder.
    pub fn url_for(&self, base: &Url, object_id: Option<&str>) -> Result<Url> {
        let path = if self.is_template() {
            let id = object_id.unwrap_or(DEFAULT_OBJECT_ID);
            let encoded = utf8_percent_encode(id, PATH_SEGMENT).to_string();
            self.path.replace(ID_PLACEHOLDER, &encoded)
        } else {
            self.path.clone()
        };

        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }

        base.join(path.trim_start_matches('/'))
            .map_err(|e| ScanError::InvalidConfig(format!("endpoint '{}': {}", self.path, e)))
    }

    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(ScanError::InvalidConfig(format!(
                "endpoint path '{}' must start with '/'",
                self.path
            )));
        }
        if self.methods.is_empty() {
            return Err(ScanError::InvalidConfig(format!(
                "endpoint '{}' declares no methods",
                self.path
            )));
        }
        if self.sensitivity == Sensitivity::ObjectReferencing && !self.is_template() {
            return Err(ScanError::InvalidConfig(format!(
                "object-referencing endpoint '{}' needs an {} placeholder",
                self.path, ID_PLACEHOLDER
            )));
        }
        Ok(())
    }
}

/// Ordered, de-duplicated set of endpoints a run will probe.
#[derive(Debug, Clone, Default)]
pub struct EndpointCatalog {
    entries: Vec<Endpoint>,
    seen: HashSet<EndpointRef>,
}

impl EndpointCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Result<Self> {
        let mut catalog = Self::new();
        for endpoint in endpoints {
            catalog.add(endpoint)?;
        }
        Ok(catalog)
    }

    /// Adds an endpoint unless an entry with the same path and class exists.
    /// Returns whether the entry was new.
    pub fn add(&mut self, endpoint: Endpoint) -> Result<bool> {
        endpoint.validate()?;
        if self.seen.insert(endpoint.reference()) {
            self.entries.push(endpoint);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.entries.iter()
    }

    pub fn contains(&self, reference: &EndpointRef) -> bool {
        self.seen.contains(reference)
    }

    pub fn references(&self) -> HashSet<EndpointRef> {
        self.seen.clone()
    }

    /// First catalog entry (in catalog order) whose concrete path matches `path`.
    /// Templated entries match any single segment in place of the placeholder.
    pub fn find_by_path(&self, path: &str) -> Option<&Endpoint> {
        let path = path.trim_end_matches('/');
        self.entries.iter().find(|e| path_matches(&e.path, path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn path_matches(template: &str, path: &str) -> bool {
    let template = template.trim_end_matches('/');
    if !template.contains(ID_PLACEHOLDER) {
        return template == path;
    }
    let left: Vec<&str> = template.split('/').collect();
    let right: Vec<&str> = path.split('/').collect();
    left.len() == right.len()
        && left
            .iter()
            .zip(&right)
            .all(|(t, p)| (*t == ID_PLACEHOLDER && !p.is_empty()) || t == p)
}
