//! Auth request payloads, CACAO responses and their verification.
//!
//! The app sends an [`AuthPayload`] describing what the wallet should sign.
//! The wallet formats it as a sign-in message for one of its accounts,
//! signs that message and answers with a [`Cacao`] (chain-agnostic object
//! capability) whose `iss` names the account as a `did:pkh`.

use async_trait::async_trait;
use authkit_lib::config::AppMetadata;
use authkit_lib::crypto::AgreementPublicKey;
use authkit_lib::identity::DidKey;
use authkit_lib::Account;
use serde::{Deserialize, Serialize};

use crate::{InteractiveError, Result};

/// Payload/header type of sign-in messages.
pub const CACAO_PAYLOAD_TYPE: &str = "eip4361";

/// Signature type of Ed25519 account signatures.
pub const ED25519_SIGNATURE_TYPE: &str = "ed25519";

/// What the app asks for. Validated before anything is sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub domain: String,
    pub chain_id: String,
    pub nonce: String,
    pub aud: String,
    pub nbf: Option<String>,
    pub exp: Option<String>,
    pub statement: Option<String>,
    pub request_id: Option<String>,
    pub resources: Option<Vec<String>>,
}

impl RequestParams {
    pub fn new(
        domain: impl Into<String>,
        chain_id: impl Into<String>,
        nonce: impl Into<String>,
        aud: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            chain_id: chain_id.into(),
            nonce: nonce.into(),
            aud: aud.into(),
            ..Default::default()
        }
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("domain", &self.domain),
            ("chain_id", &self.chain_id),
            ("nonce", &self.nonce),
            ("aud", &self.aud),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(InteractiveError::MalformedInput(format!("{} is empty", field)));
            }
        }
        if self.domain.contains(char::is_whitespace) {
            return Err(InteractiveError::MalformedInput("domain contains whitespace".into()));
        }
        Ok(())
    }
}

/// Payload of an auth request as sent on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub chain_id: String,
    pub domain: String,
    pub aud: String,
    pub version: String,
    pub nonce: String,
    /// RFC 3339 issue time.
    pub iat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

impl AuthPayload {
    /// Stamp `params` with the current time.
    pub fn new(params: RequestParams) -> Self {
        Self {
            payload_type: CACAO_PAYLOAD_TYPE.to_string(),
            chain_id: params.chain_id,
            domain: params.domain,
            aud: params.aud,
            version: "1".to_string(),
            nonce: params.nonce,
            iat: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            nbf: params.nbf,
            exp: params.exp,
            statement: params.statement,
            request_id: params.request_id,
            resources: params.resources,
        }
    }

    /// Whether `exp` has passed. Unparseable times count as expired.
    pub fn is_expired(&self, now: i64) -> bool {
        match &self.exp {
            None => false,
            Some(exp) => chrono::DateTime::parse_from_rfc3339(exp)
                .map(|t| t.timestamp() <= now)
                .unwrap_or(true),
        }
    }
}

/// The app's agreement key and metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub public_key: AgreementPublicKey,
    pub metadata: AppMetadata,
}

/// `params` of `wc_authRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequestParams {
    pub requester: Requester,
    pub payload_params: AuthPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacaoHeader {
    pub t: String,
}

/// Signed fields of a CACAO.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacaoPayload {
    /// `did:pkh` of the signing account.
    pub iss: String,
    pub domain: String,
    pub aud: String,
    pub version: String,
    pub nonce: String,
    pub iat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

impl CacaoPayload {
    pub fn new(payload: &AuthPayload, account: &Account) -> Self {
        Self {
            iss: account.did_pkh(),
            domain: payload.domain.clone(),
            aud: payload.aud.clone(),
            version: payload.version.clone(),
            nonce: payload.nonce.clone(),
            iat: payload.iat.clone(),
            nbf: payload.nbf.clone(),
            exp: payload.exp.clone(),
            statement: payload.statement.clone(),
            request_id: payload.request_id.clone(),
            resources: payload.resources.clone(),
        }
    }

    /// Account named by `iss`.
    pub fn account(&self) -> Result<Account> {
        Account::from_did_pkh(&self.iss).map_err(InteractiveError::from)
    }

    /// True if this payload answers `request` (same domain, audience, nonce and times).
    pub fn matches(&self, request: &AuthPayload) -> bool {
        self.domain == request.domain
            && self.aud == request.aud
            && self.version == request.version
            && self.nonce == request.nonce
            && self.iat == request.iat
            && self.nbf == request.nbf
            && self.exp == request.exp
            && self.statement == request.statement
            && self.request_id == request.request_id
            && self.resources == request.resources
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacaoSignature {
    pub t: String,
    pub s: String,
}

impl CacaoSignature {
    pub fn new(t: impl Into<String>, s: impl Into<String>) -> Self {
        Self {
            t: t.into(),
            s: s.into(),
        }
    }
}

/// Chain-agnostic object capability returned by the wallet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cacao {
    pub h: CacaoHeader,
    pub p: CacaoPayload,
    pub s: CacaoSignature,
}

impl Cacao {
    pub fn new(payload: CacaoPayload, signature: CacaoSignature) -> Self {
        Self {
            h: CacaoHeader {
                t: CACAO_PAYLOAD_TYPE.to_string(),
            },
            p: payload,
            s: signature,
        }
    }
}

/// Render the message an account signs for `payload`.
pub fn format_message(payload: &CacaoPayload, account: &Account) -> String {
    let mut message = format!(
        "{} wants you to sign in with your account:\n{}\n",
        payload.domain,
        account.address()
    );
    if let Some(statement) = &payload.statement {
        message.push_str(&format!("\n{}\n", statement));
    }
    message.push_str(&format!(
        "\nURI: {}\nVersion: {}\nChain ID: {}\nNonce: {}\nIssued At: {}",
        payload.aud,
        payload.version,
        account.reference(),
        payload.nonce,
        payload.iat
    ));
    if let Some(exp) = &payload.exp {
        message.push_str(&format!("\nExpiration Time: {}", exp));
    }
    if let Some(nbf) = &payload.nbf {
        message.push_str(&format!("\nNot Before: {}", nbf));
    }
    if let Some(request_id) = &payload.request_id {
        message.push_str(&format!("\nRequest ID: {}", request_id));
    }
    if let Some(resources) = payload.resources.as_ref().filter(|r| !r.is_empty()) {
        message.push_str("\nResources:");
        for resource in resources {
            message.push_str(&format!("\n- {}", resource));
        }
    }
    message
}

/// Verifies account signatures over sign-in messages.
#[async_trait]
pub trait MessageVerifier: Send + Sync {
    /// Returns `Ok(false)` for a well-formed but wrong signature.
    async fn verify(
        &self,
        signature: &CacaoSignature,
        message: &str,
        account: &Account,
    ) -> Result<bool>;
}

/// Verifier for accounts whose address is a hex Ed25519 public key.
#[derive(Debug, Default)]
pub struct Ed25519MessageVerifier;

#[async_trait]
impl MessageVerifier for Ed25519MessageVerifier {
    async fn verify(
        &self,
        signature: &CacaoSignature,
        message: &str,
        account: &Account,
    ) -> Result<bool> {
        if signature.t != ED25519_SIGNATURE_TYPE {
            return Ok(false);
        }
        let Ok(public_key) = hex::decode(account.address()) else {
            return Ok(false);
        };
        let Ok(key) = DidKey::from_slice(&public_key) else {
            return Ok(false);
        };
        let Ok(signature) = hex::decode(&signature.s) else {
            return Ok(false);
        };
        Ok(key.verify(message.as_bytes(), &signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authkit_lib::test_utils::TestAccount;

    fn payload() -> AuthPayload {
        AuthPayload::new(
            RequestParams::new("app.example.com", "ed25519:1", "n0nce", "https://app.example.com/login")
                .with_statement("Sign in to App")
                .with_resources(vec!["ipfs://x".into()]),
        )
    }

    #[test]
    fn test_format_message_layout() {
        let wallet = TestAccount::from_seed(3);
        let cacao = CacaoPayload::new(&payload(), &wallet.account);
        let message = format_message(&cacao, &wallet.account);

        let lines: Vec<&str> = message.lines().collect();
        assert_eq!(lines[0], "app.example.com wants you to sign in with your account:");
        assert_eq!(lines[1], wallet.account.address());
        assert_eq!(lines[3], "Sign in to App");
        assert!(message.contains("\nChain ID: 1\n"));
        assert!(message.ends_with("Resources:\n- ipfs://x"));
    }

    #[tokio::test]
    async fn test_ed25519_verifier() {
        let wallet = TestAccount::from_seed(3);
        let cacao = CacaoPayload::new(&payload(), &wallet.account);
        let message = format_message(&cacao, &wallet.account);
        let signature = CacaoSignature::new(ED25519_SIGNATURE_TYPE, wallet.sign(message.as_bytes()));

        let verifier = Ed25519MessageVerifier;
        assert!(verifier.verify(&signature, &message, &wallet.account).await.unwrap());

        let other = TestAccount::from_seed(4);
        assert!(!verifier.verify(&signature, &message, &other.account).await.unwrap());
        let wrong_type = CacaoSignature::new("eip191", signature.s.clone());
        assert!(!verifier.verify(&wrong_type, &message, &wallet.account).await.unwrap());
    }

    #[test]
    fn test_request_params_validation() {
        assert!(RequestParams::new("a.com", "ed25519:1", "n", "https://a.com").validate().is_ok());
        assert!(RequestParams::new("", "ed25519:1", "n", "https://a.com").validate().is_err());
        assert!(RequestParams::new("a .com", "ed25519:1", "n", "https://a.com").validate().is_err());
    }

    #[test]
    fn test_cacao_payload_matches_request() {
        let request = payload();
        let account = TestAccount::from_seed(1).account;
        let mut cacao = CacaoPayload::new(&request, &account);
        assert!(cacao.matches(&request));
        assert_eq!(cacao.account().unwrap(), account);

        cacao.nonce = "other".into();
        assert!(!cacao.matches(&request));
    }

    #[test]
    fn test_payload_expiry() {
        let mut p = payload();
        assert!(!p.is_expired(0));
        p.exp = Some("2020-01-01T00:00:00Z".into());
        assert!(p.is_expired(chrono::Utc::now().timestamp()));
        p.exp = Some("garbage".into());
        assert!(p.is_expired(0));
    }
}
