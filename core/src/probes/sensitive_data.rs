use async_trait::async_trait;
use log::debug;

use crate::core::catalog::{Endpoint, Sensitivity};
use crate::core::{Observation, Severity};
use crate::error::Result;
use crate::http::ProbeRequest;
use crate::probes::{Probe, ProbeContext, ProbeKind};

/// Fetches an auth-required endpoint as the session's principal and looks
/// for sensitive field names in the body.
pub struct SensitiveDataProbe {
    fields: Vec<String>,
}

impl SensitiveDataProbe {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl Probe for SensitiveDataProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::SensitiveData
    }

    fn applies_to(&self, endpoint: &Endpoint) -> bool {
        endpoint.sensitivity == Sensitivity::AuthRequired
    }

    async fn run(&self, ctx: &ProbeContext<'_>) -> Result<Vec<Observation>> {
        if !ctx.session.is_authenticated() {
            debug!("No authenticated session, skipping sensitive data check on {}", ctx.endpoint.path);
            return Ok(Vec::new());
        }

        let url = ctx.endpoint.url_for(ctx.base, None)?;
        let request = ctx.session.apply(ProbeRequest::get(url.clone()));
        let response = ctx.engine.send_request(&request).await?;

        let exposed: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| response.body.contains(f.as_str()))
            .map(|f| f.as_str())
            .collect();
        if exposed.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![Observation::probe(
            Severity::High,
            Some(ctx.endpoint.reference()),
            "Sensitive data exposure",
            format!(
                "{} returned field(s) {} to {}",
                ctx.endpoint.path,
                exposed.join(", "),
                ctx.session.principal().unwrap_or("the authenticated session")
            ),
        )
        .with_url(url.as_str())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Session;
    use crate::engine::testing::ScriptedEngine;
    use crate::http::ProbeResponse;
    use url::Url;

    fn session() -> Session {
        Session::authenticated(Some("alice".into()), vec![("Cookie".into(), "sid=1".into())], Vec::new())
    }

    async fn run_against(engine: &ScriptedEngine, session: &Session) -> Vec<Observation> {
        let base = Url::parse("http://localhost:5000").unwrap();
        let endpoint = Endpoint::new("/auth/user", Sensitivity::AuthRequired);
        let ctx = ProbeContext {
            endpoint: &endpoint,
            session,
            engine,
            base: &base,
        };
        SensitiveDataProbe::new(vec!["password".into(), "token".into()])
            .run(&ctx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_exposed_fields_are_reported() {
        let engine = ScriptedEngine::new().respond(
            "/auth/user",
            ProbeResponse::new(200, r#"{"name":"alice","token":"ya29.a0"}"#),
        );
        let found = run_against(&engine, &session()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::High);
        assert_eq!(found[0].description, "/auth/user returned field(s) token to alice");
        assert_eq!(engine.sent_requests()[0].headers.get("cookie").unwrap(), "sid=1");
    }

    #[tokio::test]
    async fn test_clean_body_is_not_reported() {
        let engine = ScriptedEngine::new().respond("/auth/user", ProbeResponse::new(200, r#"{"name":"alice"}"#));
        assert!(run_against(&engine, &session()).await.is_empty());
    }

    #[tokio::test]
    async fn test_skipped_without_session() {
        let engine = ScriptedEngine::new().respond("/auth/user", ProbeResponse::new(200, "password"));
        assert!(run_against(&engine, &Session::unauthenticated()).await.is_empty());
        assert!(engine.sent_requests().is_empty());
    }
}
