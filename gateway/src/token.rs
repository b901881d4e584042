use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ACCESS_TOKEN_FALLBACK_TTL_SECS;
use crate::errors::GatewayResult;

/// Claims carried by the backend's access token.
///
/// These are read for display and expiry bookkeeping only. The signature is never
/// checked here and nothing in the client makes access decisions from them; the
/// backend stays the only authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject, a user id or email depending on the backend
    #[serde(default)]
    pub sub: Option<Value>,
    #[serde(default)]
    pub role: Option<String>,
    /// Expiry as a unix timestamp
    #[serde(default)]
    pub exp: Option<i64>,
    /// Issuance as a unix timestamp
    #[serde(default)]
    pub iat: Option<i64>,
    /// Anything else the backend put in the payload
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }

    /// Subject rendered as a string, whatever its JSON type.
    pub fn subject(&self) -> Option<String> {
        match self.sub.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }
}

/// Decode the payload of a JWT without verifying its signature.
pub fn decode_claims(token: &str) -> GatewayResult<Claims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}

/// When a token issued at `issued_at` stops being usable.
pub fn expiry_for(claims: Option<&Claims>, issued_at: DateTime<Utc>) -> DateTime<Utc> {
    claims
        .and_then(Claims::expires_at)
        .unwrap_or_else(|| issued_at + chrono::Duration::seconds(ACCESS_TOKEN_FALLBACK_TTL_SECS))
}
