//! Compact JWS (`EdDSA`) encoding for identity assertions.
//!
//! Tokens are `base64url(header).base64url(claims).base64url(signature)` with
//! no padding. The signature covers the first two segments joined by `.`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{DidKey, IdentitySigner};
use crate::{Account, AuthKitError, Result};

pub const JWT_ALG: &str = "EdDSA";
pub const JWT_TYP: &str = "JWT";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    pub typ: String,
}

impl Default for JwtHeader {
    fn default() -> Self {
        Self {
            alg: JWT_ALG.to_string(),
            typ: JWT_TYP.to_string(),
        }
    }
}

/// Claims every assertion carries.
pub trait JwtClaims {
    /// `did:key` of the signer.
    fn issuer(&self) -> &str;
    fn issued_at(&self) -> i64;
    fn expires_at(&self) -> i64;
}

/// A decoded, not yet verified token.
#[derive(Clone, Debug)]
pub struct DecodedJwt<C> {
    pub header: JwtHeader,
    pub claims: C,
    signing_input: String,
    signature: Vec<u8>,
}

impl<C> DecodedJwt<C> {
    /// Check the signature against `key`.
    pub fn verify_signature(&self, key: &DidKey) -> Result<()> {
        if key.verify(self.signing_input.as_bytes(), &self.signature) {
            Ok(())
        } else {
            Err(AuthKitError::Signing("JWT signature verification failed".into()))
        }
    }
}

impl<C: JwtClaims> DecodedJwt<C> {
    /// Verify against the issuer key and reject expired tokens.
    pub fn verify(&self, now: i64) -> Result<()> {
        let issuer = DidKey::parse(self.claims.issuer())?;
        self.verify_signature(&issuer)?;
        if self.claims.expires_at() < now {
            return Err(AuthKitError::Signing(format!(
                "JWT expired at {}",
                self.claims.expires_at()
            )));
        }
        Ok(())
    }
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String> {
    Ok(B64URL.encode(serde_json::to_vec(value)?))
}

/// Sign `claims` with the identity key of `account`.
pub async fn encode<C: Serialize + Sync>(
    claims: &C,
    signer: &dyn IdentitySigner,
    account: &Account,
) -> Result<String> {
    let signing_input = format!(
        "{}.{}",
        encode_segment(&JwtHeader::default())?,
        encode_segment(claims)?
    );
    let signature = signer.sign(signing_input.as_bytes(), account).await?;
    Ok(format!("{}.{}", signing_input, B64URL.encode(signature)))
}

/// Split and decode a compact token.
pub fn decode<C: DeserializeOwned>(token: &str) -> Result<DecodedJwt<C>> {
    let mut parts = token.split('.');
    let (header, claims, signature) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(h), Some(c), Some(s), None) => (h, c, s),
        _ => return Err(AuthKitError::Decode("JWT must have three segments".into())),
    };

    let decode_segment = |segment: &str| {
        B64URL
            .decode(segment)
            .map_err(|e| AuthKitError::Decode(format!("JWT segment: {}", e)))
    };

    let header_json: JwtHeader = serde_json::from_slice(&decode_segment(header)?)
        .map_err(|e| AuthKitError::Decode(format!("JWT header: {}", e)))?;
    if header_json.alg != JWT_ALG {
        return Err(AuthKitError::Decode(format!(
            "unsupported JWT alg {}",
            header_json.alg
        )));
    }
    let claims_json: C = serde_json::from_slice(&decode_segment(claims)?)
        .map_err(|e| AuthKitError::Decode(format!("JWT claims: {}", e)))?;

    Ok(DecodedJwt {
        header: header_json,
        claims: claims_json,
        signing_input: format!("{}.{}", header, claims),
        signature: decode_segment(signature)?,
    })
}

#[derive(Deserialize)]
struct IssuerOnly {
    iss: String,
}

/// Verify a token's signature against its own `iss` did:key.
pub fn verify_issuer_signature(token: &str) -> Result<bool> {
    let decoded = decode::<IssuerOnly>(token)?;
    let issuer = DidKey::parse(&decoded.claims.iss)?;
    Ok(decoded.verify_signature(&issuer).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentitySigner;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestClaims {
        iss: String,
        iat: i64,
        exp: i64,
    }

    impl JwtClaims for TestClaims {
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

    async fn signed(exp: i64) -> String {
        let account = Account::parse("eip155:1:0xabc").unwrap();
        let signer = LocalIdentitySigner::new();
        let did = signer.register_identity(&account).unwrap();
        let claims = TestClaims {
            iss: did.to_string(),
            iat: 100,
            exp,
        };
        encode(&claims, &signer, &account).await.unwrap()
    }

    #[tokio::test]
    async fn test_encode_decode_verify() {
        let token = signed(200).await;
        assert_eq!(token.split('.').count(), 3);
        assert!(!token.contains('='));

        let decoded = decode::<TestClaims>(&token).unwrap();
        assert_eq!(decoded.header, JwtHeader::default());
        decoded.verify(150).unwrap();
        assert!(verify_issuer_signature(&token).unwrap());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let token = signed(200).await;
        let decoded = decode::<TestClaims>(&token).unwrap();
        assert!(decoded.verify(201).is_err());
    }

    #[tokio::test]
    async fn test_tampered_claims_rejected() {
        let token = signed(200).await;
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = B64URL.encode(br#"{"iss":"did:key:fed01","iat":100,"exp":999}"#);
        parts[1] = &forged;
        let forged_token = parts.join(".");

        let original = decode::<TestClaims>(&token).unwrap();
        let issuer = DidKey::parse(&original.claims.iss).unwrap();
        let decoded = decode::<TestClaims>(&forged_token).unwrap();
        assert!(decoded.verify_signature(&issuer).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        assert!(decode::<TestClaims>("a.b").is_err());
        assert!(decode::<TestClaims>("a.b.c.d").is_err());
        assert!(decode::<TestClaims>("!!.??.##").is_err());
    }
}
