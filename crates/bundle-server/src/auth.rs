use axum::{extract::{Request, State}, http::header, middleware::Next, response::{IntoResponse, Response}};
use std::sync::Arc;
use crate::error::ApiError;

pub const ANONYMOUS: &str = "anonymous";

/// Caller of a publisher endpoint. The subject owns the apps it creates and is
/// recorded as `released_by` on packages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity { pub subject: String }

/// Static bearer tokens, each mapped to a subject. Empty means auth is off.
#[derive(Clone, Debug, Default)]
pub struct TokenAuth { entries: Vec<(String, String)> }

impl TokenAuth {
    /// Parse `token:subject` entries.
    pub fn from_entries(entries: &[String]) -> anyhow::Result<Self> {
        let mut parsed = Vec::with_capacity(entries.len());
        for raw in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            let Some((token, subject)) = raw.split_once(':') else {
                anyhow::bail!("api token entry must look like token:subject");
            };
            let (token, subject) = (token.trim(), subject.trim());
            if token.is_empty() || subject.is_empty() { anyhow::bail!("api token entry has an empty token or subject"); }
            parsed.push((token.to_string(), subject.to_string()));
        }
        Ok(Self { entries: parsed })
    }

    pub fn disabled() -> Self { Self::default() }

    pub fn enabled(&self) -> bool { !self.entries.is_empty() }

    fn lookup(&self, token: &str) -> Option<Identity> {
        // compare against every entry so timing does not reveal which one matched
        let mut found = None;
        for (t, subject) in &self.entries {
            if ct_equal(t, token) && found.is_none() { found = Some(Identity { subject: subject.clone() }); }
        }
        found
    }
}

fn extract_bearer(req: &Request) -> Option<String> {
    let header = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len()==2 && parts[0].eq_ignore_ascii_case("Bearer") { Some(parts[1].trim().to_string()) } else { None }
}

// Constant-time equality
fn ct_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() { return false; }
    let mut diff: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) { diff |= x ^ y; }
    diff == 0
}

/// Resolve the caller and stash an `Identity` in the request extensions.
pub async fn auth_layer(State(auth): State<Arc<TokenAuth>>, mut req: Request, next: Next) -> Result<Response, Response> {
    if !auth.enabled() {
        req.extensions_mut().insert(Identity { subject: ANONYMOUS.into() });
        return Ok(next.run(req).await);
    }
    let path = req.uri().path().to_string();
    let Some(token) = extract_bearer(&req) else {
        tracing::debug!(%path, "auth_missing_bearer");
        return Err(ApiError::unauthorized("missing bearer token").into_response());
    };
    let Some(identity) = auth.lookup(&token) else {
        tracing::debug!(%path, "auth_invalid_token");
        return Err(ApiError::unauthorized("invalid token").into_response());
    };
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
