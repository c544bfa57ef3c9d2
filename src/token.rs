use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;

use crate::error::DecodeError;

/// Reads the expiry of bearer tokens issued by the Envoice backend.
///
/// Signatures are never checked here; the backend is the only party that
/// can vouch for a token. This only answers "should we bother sending it".
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCodec {
    leeway_secs: i64,
}

impl TokenCodec {
    pub fn new(leeway_secs: u64) -> Self {
        Self {
            leeway_secs: i64::try_from(leeway_secs).unwrap_or(i64::MAX),
        }
    }

    /// Extract the `exp` claim (seconds since epoch) from a three-segment token.
    pub fn decode_expiry(token: &str) -> Result<i64, DecodeError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(DecodeError::SegmentCount(parts.len()));
        }

        let segment = parts[1].trim_end_matches('=');
        let payload = match URL_SAFE_NO_PAD.decode(segment) {
            Ok(bytes) => bytes,
            // Some issuers use the standard alphabet for the payload
            Err(e) => STANDARD_NO_PAD.decode(segment).map_err(|_| e)?,
        };

        let claims: Value = serde_json::from_slice(&payload)?;
        match claims.get("exp") {
            Some(exp) => exp
                .as_i64()
                .or_else(|| exp.as_f64().map(|f| f.floor() as i64))
                .ok_or(DecodeError::MissingExpiry),
            None => Err(DecodeError::MissingExpiry),
        }
    }

    pub fn is_expired(&self, token: &str) -> bool {
        self.is_expired_at(token, chrono::Utc::now().timestamp())
    }

    /// Undecodable tokens count as expired.
    pub fn is_expired_at(&self, token: &str, now: i64) -> bool {
        match Self::decode_expiry(token) {
            Ok(exp) => exp < now.saturating_add(self.leeway_secs),
            Err(e) => {
                tracing::debug!("Treating undecodable token as expired: {}", e);
                true
            }
        }
    }
}
