//! Pairing URI codec.
//!
//! A pairing is shared out of band (QR code, deep link) as:
//!
//! ```text
//! wc:{topic}@2?relay-protocol=irn&symKey={hex}&expiryTimestamp={secs}&methods=[wc_authRequest]
//! ```
//!
//! # Examples
//!
//! ```rust
//! use authkit_lib::uri::PairingUri;
//!
//! let uri = PairingUri::parse(
//!     "wc:7f6e504bfad60b485450578e05678ed3e8e8c4751d3c6160be17160d63ec90f9@2\
//!      ?relay-protocol=irn\
//!      &symKey=587d5484ce2a2a6ee3ba1962fdd7e8588e06200c46823bd18fbd67def96ad303\
//!      &expiryTimestamp=1705000000",
//! )
//! .unwrap();
//! assert_eq!(uri.relay_protocol, "irn");
//! assert_eq!(uri.to_string().parse::<PairingUri>().unwrap(), uri);
//! ```

use std::str::FromStr;

use crate::crypto::SymmetricKey;
use crate::{AuthKitError, Result, Topic};

/// URI scheme of pairing links.
pub const PAIRING_URI_SCHEME: &str = "wc:";

/// Pairing protocol version carried after `@`.
pub const PAIRING_URI_VERSION: &str = "2";

/// A parsed pairing URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    /// Pairing topic. Pairings created locally use sha256(symKey).
    pub topic: Topic,
    pub relay_protocol: String,
    pub sym_key: SymmetricKey,
    /// Unix seconds after which the pairing is no longer valid.
    pub expiry_timestamp: i64,
    /// Protocol methods the creator expects on this pairing.
    pub methods: Vec<String>,
}

impl PairingUri {
    /// Parse and validate a pairing URI.
    ///
    /// Pure: nothing is registered or subscribed.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();

        let rest = uri
            .strip_prefix(PAIRING_URI_SCHEME)
            .ok_or_else(|| malformed(format!("expected {} scheme", PAIRING_URI_SCHEME)))?;
        let (path, query) = rest
            .split_once('?')
            .ok_or_else(|| malformed("missing query parameters"))?;
        let (topic, version) = path
            .split_once('@')
            .ok_or_else(|| malformed("missing version"))?;
        if version != PAIRING_URI_VERSION {
            return Err(malformed(format!("unsupported version {}", version)));
        }
        let topic = Topic::from_hex(topic).map_err(|_| malformed("topic is not 64 hex characters"))?;

        let mut relay_protocol = None;
        let mut sym_key = None;
        let mut expiry_timestamp = None;
        let mut methods = Vec::new();

        for param in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| malformed(format!("parameter without value: {}", param)))?;
            let value = url_decode(value)?;
            match key {
                "relay-protocol" => relay_protocol = Some(value),
                "symKey" => {
                    sym_key = Some(
                        SymmetricKey::from_hex(&value).map_err(|_| malformed("invalid symKey"))?,
                    )
                }
                "expiryTimestamp" => {
                    expiry_timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| malformed("expiryTimestamp is not a number"))?,
                    )
                }
                "methods" => methods = parse_methods(&value)?,
                _ => {
                    // Unknown parameters are ignored
                }
            }
        }

        let relay_protocol = relay_protocol
            .filter(|p| !p.is_empty())
            .ok_or_else(|| malformed("missing relay-protocol"))?;
        let sym_key = sym_key.ok_or_else(|| malformed("missing symKey"))?;
        let expiry_timestamp =
            expiry_timestamp.ok_or_else(|| malformed("missing expiryTimestamp"))?;

        Ok(Self {
            topic,
            relay_protocol,
            sym_key,
            expiry_timestamp,
            methods,
        })
    }
}

impl FromStr for PairingUri {
    type Err = AuthKitError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for PairingUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}@{}?relay-protocol={}&symKey={}&expiryTimestamp={}",
            PAIRING_URI_SCHEME,
            self.topic,
            PAIRING_URI_VERSION,
            self.relay_protocol,
            self.sym_key.to_hex(),
            self.expiry_timestamp
        )?;
        if !self.methods.is_empty() {
            write!(f, "&methods=[{}]", self.methods.join(","))?;
        }
        Ok(())
    }
}

fn malformed(reason: impl Into<String>) -> AuthKitError {
    AuthKitError::malformed("pairing uri", reason)
}

/// Parse `[m1,m2]`.
fn parse_methods(value: &str) -> Result<Vec<String>> {
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .ok_or_else(|| malformed("methods must be a bracketed list"))?;
    Ok(inner
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect())
}

/// Percent-decoding of query values.
fn url_decode(encoded: &str) -> Result<String> {
    let mut decoded = Vec::with_capacity(encoded.len());
    let mut bytes = encoded.bytes();

    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next().ok_or_else(|| malformed("incomplete percent encoding"))?;
            let lo = bytes.next().ok_or_else(|| malformed("incomplete percent encoding"))?;
            let pair = [hi, lo];
            let hex = std::str::from_utf8(&pair).map_err(|_| malformed("invalid percent encoding"))?;
            decoded.push(
                u8::from_str_radix(hex, 16).map_err(|_| malformed("invalid hex in percent encoding"))?,
            );
        } else {
            decoded.push(b);
        }
    }

    String::from_utf8(decoded).map_err(|_| malformed("percent encoding is not utf-8"))
}
