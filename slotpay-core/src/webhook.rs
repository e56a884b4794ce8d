use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Lifecycle notification pushed by a payment gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookEvent {
    pub gateway: String,
    pub external_transaction_id: String,
    pub event_id: String,
    pub state: String,
    pub timestamp: DateTime<Utc>,
    /// Local transaction id handed to the gateway at session creation.
    #[serde(default)]
    pub reference: Option<Uuid>,
}

impl WebhookEvent {
    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey {
            gateway: self.gateway.clone(),
            external_transaction_id: self.external_transaction_id.clone(),
            event_id: self.event_id.clone(),
        }
    }
}

/// Dedup ledger key. Unique at the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub gateway: String,
    pub external_transaction_id: String,
    pub event_id: String,
}

/// HMAC-SHA256 over the raw body, hex encoded.
pub fn sign_payload(secret: &str, body: &[u8]) -> CoreResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::InternalError(format!("invalid webhook key: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature against the expected one.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = sign_payload(secret, body) else {
        return false;
    };
    let provided = signature.trim().to_ascii_lowercase();
    if expected.len() != provided.len() {
        return false;
    }
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"gateway":"datatrans","external_transaction_id":"X1","event_id":"E1","state":"SUCCESS","timestamp":"2026-03-02T10:00:00Z"}"#;

    #[test]
    fn test_signature_round_trip() {
        let signature = sign_payload("whsec", BODY).unwrap();
        assert!(verify_signature("whsec", BODY, &signature));
        assert!(verify_signature("whsec", BODY, &signature.to_ascii_uppercase()));
    }

    #[test]
    fn test_signature_rejects_tampering() {
        let signature = sign_payload("whsec", BODY).unwrap();
        let tampered = br#"{"gateway":"datatrans","external_transaction_id":"X1","event_id":"E1","state":"FAILED","timestamp":"2026-03-02T10:00:00Z"}"#;
        assert!(!verify_signature("whsec", tampered, &signature));
        assert!(!verify_signature("other", BODY, &signature));
        assert!(!verify_signature("whsec", BODY, "deadbeef"));
    }

    #[test]
    fn test_event_parses_without_reference() {
        let event: WebhookEvent = serde_json::from_slice(BODY).unwrap();
        assert_eq!(event.reference, None);
        assert_eq!(event.ledger_key().event_id, "E1");
    }
}
