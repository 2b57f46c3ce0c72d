// SPDX-License-Identifier: MIT
//! Message signing — HMAC-SHA256 over the canonical envelope tuple.
//!
//! The session secret arrives hex-encoded in the `agent_connect_ack` and is
//! installed here. Until then the signer is a pass-through: outbound signing
//! is a no-op and inbound verification accepts everything (the auth
//! handshake alone protects that window, which never carries task traffic).
//!
//! Canonical tuple: `type | id | timestamp_rfc3339_nanos | raw_payload_bytes`,
//! joined with `|`. The signature is the lowercase hex HMAC-SHA256 of that
//! byte string.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::RwLock;

use crate::error::AgentError;
use crate::protocol::Envelope;

type HmacSha256 = Hmac<Sha256>;

/// Accepted secret lengths, in bytes. The control plane sends 32.
const MIN_SECRET_LEN: usize = 16;
const MAX_SECRET_LEN: usize = 64;

pub struct Signer {
    secret: RwLock<Option<Vec<u8>>>,
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer {
    /// A signer with no secret — pass-through until [`install_hex`](Self::install_hex).
    pub fn new() -> Self {
        Self {
            secret: RwLock::new(None),
        }
    }

    /// Install the session secret from its hex wire form. Re-installation on
    /// reconnect replaces the previous secret.
    pub fn install_hex(&self, secret_hex: &str) -> Result<(), AgentError> {
        let secret = hex::decode(secret_hex)
            .map_err(|e| AgentError::Config(format!("session secret is not valid hex: {e}")))?;
        if secret.len() < MIN_SECRET_LEN || secret.len() > MAX_SECRET_LEN {
            return Err(AgentError::Config(format!(
                "session secret must be {MIN_SECRET_LEN}-{MAX_SECRET_LEN} bytes, got {}",
                secret.len()
            )));
        }
        *self.secret.write().expect("signer lock poisoned") = Some(secret);
        Ok(())
    }

    /// `true` once a secret has been installed.
    pub fn ready(&self) -> bool {
        self.secret.read().expect("signer lock poisoned").is_some()
    }

    fn canonical(envelope: &Envelope) -> Vec<u8> {
        let mut buf = Vec::with_capacity(envelope.payload.get().len() + 128);
        buf.extend_from_slice(envelope.kind.as_bytes());
        buf.push(b'|');
        buf.extend_from_slice(envelope.id.as_bytes());
        buf.push(b'|');
        buf.extend_from_slice(envelope.canonical_timestamp().as_bytes());
        buf.push(b'|');
        buf.extend_from_slice(envelope.payload.get().as_bytes());
        buf
    }

    /// Sign the envelope in place if its kind is critical and a secret is
    /// installed. Non-critical kinds and the pre-secret window are no-ops.
    pub fn sign(&self, envelope: &mut Envelope) {
        let critical = envelope
            .message_kind()
            .map(|k| k.is_signed())
            .unwrap_or(false);
        if !critical {
            return;
        }
        let guard = self.secret.read().expect("signer lock poisoned");
        let Some(secret) = guard.as_ref() else {
            return;
        };
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&Self::canonical(envelope));
        envelope.signature = Some(hex::encode(mac.finalize().into_bytes()));
    }

    /// Verify an inbound envelope.
    ///
    /// - Non-critical kind: accepted, signature ignored.
    /// - No secret installed yet: accepted.
    /// - Critical kind without a signature: rejected.
    /// - Otherwise: constant-time HMAC comparison.
    pub fn verify(&self, envelope: &Envelope) -> bool {
        let critical = envelope
            .message_kind()
            .map(|k| k.is_signed())
            .unwrap_or(false);
        if !critical {
            return true;
        }
        let guard = self.secret.read().expect("signer lock poisoned");
        let Some(secret) = guard.as_ref() else {
            return true;
        };
        let Some(signature_hex) = envelope.signature.as_deref() else {
            return false;
        };
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&Self::canonical(envelope));
        mac.verify_slice(&signature).is_ok()
    }
}
