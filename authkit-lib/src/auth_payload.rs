//! Authentication payload builder.
//!
//! Assembles the claim set binding an identity key to an account and a
//! request, stamps `iat`/`exp`, and hands the canonical encoding to the
//! [`IdentitySigner`]. Signing failures are surfaced, never retried.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::{DidKey, IdentitySigner};
use crate::jwt::{self, JwtClaims};
use crate::{unix_now, Account, AuthKitError, Result};

/// Validity window of assertions unless configured otherwise.
pub const DEFAULT_ASSERTION_TTL_SECS: i64 = 3600;

/// `did:web` identifier of a domain.
pub fn did_web(domain: &str) -> String {
    format!("did:web:{}", domain)
}

/// Who is asserting what, to whom.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthSubject {
    pub account: Account,
    /// Audience domain, rendered as `did:web:{domain}`.
    pub domain: String,
    /// Requested capability (`act` claim).
    pub action: String,
    /// Request-specific claims merged into the claim set.
    pub extra: Map<String, Value>,
}

impl AuthSubject {
    pub fn new(account: Account, domain: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            account,
            domain: domain.into(),
            action: action.into(),
            extra: Map::new(),
        }
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// Claim set of an authentication assertion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub act: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssertionClaims {
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

impl JwtClaims for AssertionClaims {
    fn issuer(&self) -> &str {
        &self.iss
    }

    fn issued_at(&self) -> i64 {
        self.iat
    }

    fn expires_at(&self) -> i64 {
        self.exp
    }
}

/// A signed assertion. Immutable once built.
#[derive(Clone, Debug)]
pub struct AuthAssertion {
    token: String,
    claims: AssertionClaims,
}

impl AuthAssertion {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &AssertionClaims {
        &self.claims
    }

    /// Wrap for transport under `field` (e.g. `watchSubscriptionsAuth`).
    pub fn wrap(&self, field: impl Into<String>) -> AuthPayloadWrapper {
        AuthPayloadWrapper {
            field: field.into(),
            jwt: self.token.clone(),
        }
    }

    /// Decode and verify a received assertion.
    ///
    /// The signature is checked against `expected_issuer` when given,
    /// otherwise against the token's own `iss`.
    pub fn verify(token: &str, expected_issuer: Option<&DidKey>, now: i64) -> Result<Self> {
        let decoded = jwt::decode::<AssertionClaims>(token)?;
        match expected_issuer {
            Some(key) => {
                decoded.verify_signature(key)?;
                if decoded.claims.exp < now {
                    return Err(AuthKitError::Signing("assertion expired".into()));
                }
            }
            None => decoded.verify(now)?,
        }
        Ok(Self {
            token: token.to_string(),
            claims: decoded.claims,
        })
    }
}

/// `{ "<field>": "<jwt>" }` params object carrying an assertion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthPayloadWrapper {
    pub field: String,
    pub jwt: String,
}

impl AuthPayloadWrapper {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.field.clone(), Value::String(self.jwt.clone()));
        Value::Object(map)
    }

    pub fn from_value(value: &Value, field: &str) -> Result<Self> {
        let jwt = value
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| AuthKitError::Decode(format!("missing {} in params", field)))?;
        Ok(Self {
            field: field.to_string(),
            jwt: jwt.to_string(),
        })
    }
}

/// Builds signed assertions with a fixed issuer/audience/expiry policy.
#[derive(Clone)]
pub struct AuthPayloadBuilder {
    signer: Arc<dyn IdentitySigner>,
    ttl_secs: i64,
}

impl AuthPayloadBuilder {
    pub fn new(signer: Arc<dyn IdentitySigner>) -> Self {
        Self {
            signer,
            ttl_secs: DEFAULT_ASSERTION_TTL_SECS,
        }
    }

    pub fn with_ttl_secs(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Assemble the claims for `subject`, stamping `iat = now` and `exp = iat + ttl`.
    pub async fn claims(&self, subject: &AuthSubject) -> Result<AssertionClaims> {
        let issuer = self
            .signer
            .identity_key(&subject.account)
            .await
            .map_err(into_signing_error)?;
        let iat = unix_now();
        Ok(AssertionClaims {
            iss: issuer.to_string(),
            aud: did_web(&subject.domain),
            sub: subject.account.did_pkh(),
            act: subject.action.clone(),
            iat,
            exp: iat + self.ttl_secs,
            extra: subject.extra.clone(),
        })
    }

    /// Build and sign an assertion.
    pub async fn build(&self, subject: &AuthSubject) -> Result<AuthAssertion> {
        let claims = self.claims(subject).await?;
        let token = jwt::encode(&claims, self.signer.as_ref(), &subject.account)
            .await
            .map_err(into_signing_error)?;
        tracing::debug!(account = %subject.account, act = %subject.action, "signed assertion");
        Ok(AuthAssertion { token, claims })
    }
}

fn into_signing_error(err: AuthKitError) -> AuthKitError {
    match err {
        AuthKitError::Signing(_) => err,
        other => AuthKitError::Signing(other.to_string()),
    }
}
