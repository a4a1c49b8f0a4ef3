//! Authentication at the edge of the system (spec.md §4.9): either a
//! constant-time-compared API key, or a JWT when the token has three
//! dot-separated parts and JWT verification is configured.
//!
//! Grounded in `sven-gateway::http::auth`'s bearer-token middleware shape
//! (constant-time compare via `subtle`, `Authorization` header parsing),
//! generalized to also accept `X-API-Key` and to add JWT as a second
//! credential kind per spec.md §4.9(b). JWT verification itself uses
//! `jsonwebtoken`, the one dependency in this crate not grounded in the
//! retrieved corpus (see `DESIGN.md`).

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::HeaderMap;
use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::Validation;
use serde::Deserialize;
use serde::Serialize;
use subtle::ConstantTimeEq;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
    #[error("token expired")]
    Expired,
}

/// Claims this system cares about; JWT libraries generally require the
/// exact claim set to be modeled to deserialize at all, so unrecognized
/// claims are allowed through via `#[serde(flatten)]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// The outcome of a successful authentication: who the caller is, used as
/// the rate-limit key when present (spec.md §4.9's "user id when
/// authenticated").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

pub struct JwtConfig {
    pub decoding_key: DecodingKey,
    pub algorithm: Algorithm,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// A caller-supplied credential check (spec.md §4.9's third auth
/// mechanism, alongside a configured key set and JWT). Takes the raw
/// bearer/API-key token and reports whether it is valid; the identity
/// recorded on success is always `"validator"`, since the function itself
/// owns whatever finer-grained subject it wants to track.
pub type Validator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct AuthConfig {
    api_keys: HashSet<String>,
    jwt: Option<JwtConfig>,
    validator: Option<Validator>,
}

impl AuthConfig {
    pub fn new(api_keys: Vec<String>, jwt: Option<JwtConfig>) -> Self {
        Self {
            api_keys: api_keys.into_iter().collect(),
            jwt,
            validator: None,
        }
    }

    /// Attach a caller-supplied validator, tried after the configured key
    /// set and JWT both fail to account for the credential.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Extract credentials from `Authorization: Bearer …` or
    /// `X-API-Key: …` and authenticate. A JWT is only attempted when the
    /// bearer token has three dot-separated parts and JWT is configured;
    /// otherwise it is compared as an API key, and failing that, handed to
    /// the caller-supplied validator if one is configured.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let credential = extract_bearer(headers)
            .or_else(|| extract_api_key_header(headers))
            .ok_or(AuthError::Missing)?;

        if credential.splitn(3, '.').count() == 3 && self.jwt.is_some() {
            return self.verify_jwt(credential);
        }

        if self.verify_api_key(credential) {
            return Ok(Identity {
                subject: "api-key".to_string(),
            });
        }

        if let Some(validator) = &self.validator
            && validator(credential)
        {
            return Ok(Identity {
                subject: "validator".to_string(),
            });
        }

        Err(AuthError::Invalid)
    }

    fn verify_api_key(&self, candidate: &str) -> bool {
        self.api_keys
            .iter()
            .any(|key| constant_time_eq(key.as_bytes(), candidate.as_bytes()))
    }

    fn verify_jwt(&self, token: &str) -> Result<Identity, AuthError> {
        let jwt = self.jwt.as_ref().ok_or(AuthError::Invalid)?;
        let mut validation = Validation::new(jwt.algorithm);
        if let Some(iss) = &jwt.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = &jwt.audience {
            validation.set_audience(&[aud]);
        }

        let data = jsonwebtoken::decode::<Claims>(token, &jwt.decoding_key, &validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            },
        )?;

        Ok(Identity {
            subject: data.claims.sub,
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn extract_api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("X-API-Key")?.to_str().ok()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn accepts_a_configured_api_key() {
        let auth = AuthConfig::new(vec!["secret-key".to_string()], None);
        let identity = auth.authenticate(&headers_with_bearer("secret-key")).unwrap();
        assert_eq!(identity.subject, "api-key");
    }

    #[test]
    fn rejects_an_unknown_api_key() {
        let auth = AuthConfig::new(vec!["secret-key".to_string()], None);
        assert_eq!(
            auth.authenticate(&headers_with_bearer("wrong-key")),
            Err(AuthError::Invalid)
        );
    }

    #[test]
    fn missing_credentials_is_reported_distinctly() {
        let auth = AuthConfig::new(vec!["secret-key".to_string()], None);
        assert_eq!(auth.authenticate(&HeaderMap::new()), Err(AuthError::Missing));
    }

    #[test]
    fn x_api_key_header_is_also_accepted() {
        let auth = AuthConfig::new(vec!["secret-key".to_string()], None);
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", "secret-key".parse().unwrap());
        assert!(auth.authenticate(&headers).is_ok());
    }

    #[test]
    fn dotted_token_without_jwt_config_falls_back_to_api_key_compare() {
        let auth = AuthConfig::new(vec!["a.b.c".to_string()], None);
        assert!(auth.authenticate(&headers_with_bearer("a.b.c")).is_ok());
    }

    #[test]
    fn caller_supplied_validator_is_tried_after_api_keys() {
        let auth = AuthConfig::new(vec![], None)
            .with_validator(Arc::new(|token: &str| token == "from-elsewhere"));
        let identity = auth
            .authenticate(&headers_with_bearer("from-elsewhere"))
            .unwrap();
        assert_eq!(identity.subject, "validator");
        assert_eq!(
            auth.authenticate(&headers_with_bearer("nope")),
            Err(AuthError::Invalid)
        );
    }
}
