//! Signed message envelopes
//!
//! Every message the agent reports (request outcomes, expiry notices,
//! tracker registration and heartbeats) is wrapped in a [`SignedEnvelope`]
//! so the receiving side can attribute it to this cluster's key.

use crate::error::{AgentError, AgentResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A payload together with its signature and the signer's address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub payload: Value,
    /// Top-level key names of the payload
    pub fields: Vec<String>,
    /// Hex-encoded signature over the JSON bytes of `payload`
    pub signature: String,
    /// Hex-encoded public key of the signer
    pub address: String,
}

/// Trait for anything able to sign outgoing payloads
pub trait MessageSigner: Send + Sync {
    /// Address identifying the signer
    fn address(&self) -> String;

    /// Wrap and sign a payload
    fn sign(&self, payload: Value) -> AgentResult<SignedEnvelope>;
}

/// ed25519 signer
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Build a signer from a 32-byte hex secret (optional `0x` prefix)
    pub fn from_hex(secret: &str) -> AgentResult<Self> {
        let trimmed = secret.trim().trim_start_matches("0x");
        let bytes = hex::decode(trimmed)
            .map_err(|e| AgentError::Config(format!("Invalid secret key hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            AgentError::Config(format!("Secret key must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl MessageSigner for Ed25519Signer {
    fn address(&self) -> String {
        format!("0x{}", hex::encode(self.key.verifying_key().to_bytes()))
    }

    fn sign(&self, payload: Value) -> AgentResult<SignedEnvelope> {
        let bytes = serde_json::to_vec(&payload)?;
        let signature = self.key.sign(&bytes);
        let fields = payload
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        Ok(SignedEnvelope {
            payload,
            fields,
            signature: hex::encode(signature.to_bytes()),
            address: self.address(),
        })
    }
}

/// Check an envelope's signature against its embedded address
pub fn verify(envelope: &SignedEnvelope) -> AgentResult<()> {
    let key_bytes = hex::decode(envelope.address.trim_start_matches("0x"))
        .map_err(|e| AgentError::InvalidParams(format!("Invalid address: {}", e)))?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| AgentError::InvalidParams("Address must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| AgentError::InvalidParams(format!("Invalid public key: {}", e)))?;

    let sig_bytes = hex::decode(&envelope.signature)
        .map_err(|e| AgentError::InvalidParams(format!("Invalid signature hex: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| AgentError::InvalidParams(format!("Invalid signature: {}", e)))?;

    let message = serde_json::to_vec(&envelope.payload)?;
    key.verify(&message, &signature)
        .map_err(|e| AgentError::InvalidParams(format!("Signature mismatch: {}", e)))
}
