//! Transaction signing abstraction.
//!
//! The signer is the only component that sees key-adjacent state, and the
//! digest → (r, s, v) interface is the only thing the submitter knows about
//! it. Two variants: a local in-memory key for development and a remote
//! key-management service for production.

use crate::chain::encode::{keccak256, EcdsaSig};
use crate::types::Asset;
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    #[error("signing rejected: {0}")]
    Rejected(String),
}

/// ECDSA producer over 32-byte digests. Never exposes key material.
#[async_trait]
pub trait Signer: Send + Sync {
    /// EVM address of the signing key.
    fn address(&self) -> Asset;

    async fn sign_digest(&self, digest: [u8; 32]) -> Result<EcdsaSig, SignerError>;
}

/// Holds a secp256k1 key in memory. Development use; production should point
/// at a remote HSM.
pub struct LocalSigner {
    key: SigningKey,
    address: Asset,
}

impl LocalSigner {
    pub fn from_hex(hex_key: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex_key.trim_start_matches("0x"))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid secp256k1 key: {e}"))?;
        let address = derive_address(&key);
        warn!(address = %address, "local signer initialized; use a remote signer in production");
        Ok(Self { key, address })
    }
}

/// keccak of the uncompressed public key, last 20 bytes.
fn derive_address(key: &SigningKey) -> Asset {
    let encoded = key.verifying_key().to_encoded_point(false);
    let digest = keccak256(&encoded.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    Asset(address)
}

#[async_trait]
impl Signer for LocalSigner {
    fn address(&self) -> Asset {
        self.address
    }

    async fn sign_digest(&self, digest: [u8; 32]) -> Result<EcdsaSig, SignerError> {
        let (mut signature, mut recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| SignerError::Rejected(e.to_string()))?;

        // EIP-2 low-s form; flipping s flips the recovery parity.
        if let Some(normalized) = signature.normalize_s() {
            signature = normalized;
            recovery_id = k256::ecdsa::RecoveryId::from_byte(recovery_id.to_byte() ^ 1)
                .ok_or_else(|| SignerError::Rejected("recovery id out of range".into()))?;
        }

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&signature.r().to_bytes());
        s.copy_from_slice(&signature.s().to_bytes());
        Ok(EcdsaSig { r, s, rec_id: recovery_id.to_byte() })
    }
}

/// Delegates to a key-management service that signs 32-byte digests with a
/// key it never releases.
pub struct RemoteSigner {
    client: reqwest::Client,
    url: String,
    address: Asset,
}

#[derive(Serialize)]
struct RemoteSignRequest {
    digest: String,
}

#[derive(Deserialize)]
struct RemoteSignResponse {
    r: String,
    s: String,
    v: u8,
}

impl RemoteSigner {
    /// `address` is the key's EVM address as reported by the service's
    /// enrollment flow.
    pub fn new(client: reqwest::Client, url: impl Into<String>, address: Asset) -> Self {
        let url = url.into();
        info!(address = %address, "remote signer configured");
        Self { client, url, address }
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    fn address(&self) -> Asset {
        self.address
    }

    async fn sign_digest(&self, digest: [u8; 32]) -> Result<EcdsaSig, SignerError> {
        let request = RemoteSignRequest { digest: format!("0x{}", hex::encode(digest)) };
        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&request)
            .send()
            .await
            .map_err(|e| SignerError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(SignerError::Unavailable(format!("{status}: {body}")));
            }
            return Err(SignerError::Rejected(format!("{status}: {body}")));
        }

        let parsed: RemoteSignResponse =
            response.json().await.map_err(|e| SignerError::Rejected(e.to_string()))?;

        let decode_word = |label: &str, value: &str| -> Result<[u8; 32], SignerError> {
            let bytes = hex::decode(value.trim_start_matches("0x"))
                .map_err(|e| SignerError::Rejected(format!("bad {label}: {e}")))?;
            let mut word = [0u8; 32];
            if bytes.len() > 32 {
                return Err(SignerError::Rejected(format!("{label} longer than 32 bytes")));
            }
            word[32 - bytes.len()..].copy_from_slice(&bytes);
            Ok(word)
        };

        let rec_id = match parsed.v {
            0 | 1 => parsed.v,
            27 | 28 => parsed.v - 27,
            other => return Err(SignerError::Rejected(format!("unexpected v value {other}"))),
        };

        Ok(EcdsaSig {
            r: decode_word("r", &parsed.r)?,
            s: decode_word("s", &parsed.s)?,
            rec_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{RecoveryId, VerifyingKey};

    // Throwaway key for tests only.
    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn address_derivation_is_deterministic() {
        let a = LocalSigner::from_hex(TEST_KEY).unwrap();
        let b = LocalSigner::from_hex(&format!("0x{TEST_KEY}")).unwrap();
        assert_eq!(a.address(), b.address());
        assert!(!a.address().is_zero());
    }

    #[test]
    fn rejects_invalid_key_material() {
        assert!(LocalSigner::from_hex("zz").is_err());
        assert!(LocalSigner::from_hex("0011").is_err());
        // Zero is outside the scalar field.
        assert!(LocalSigner::from_hex(&"00".repeat(32)).is_err());
    }

    #[tokio::test]
    async fn signature_recovers_to_signer_address() {
        let signer = LocalSigner::from_hex(TEST_KEY).unwrap();
        let digest = keccak256(b"canonical transaction preimage");
        let sig = signer.sign_digest(digest).await.unwrap();

        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&sig.r);
        compact[32..].copy_from_slice(&sig.s);
        let signature = k256::ecdsa::Signature::from_slice(&compact).unwrap();
        let recovery_id = RecoveryId::from_byte(sig.rec_id).unwrap();
        let recovered =
            VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id).unwrap();

        let recovered_address = {
            let encoded = recovered.to_encoded_point(false);
            let digest = keccak256(&encoded.as_bytes()[1..]);
            let mut address = [0u8; 20];
            address.copy_from_slice(&digest[12..]);
            Asset(address)
        };
        assert_eq!(recovered_address, signer.address());
    }

    #[tokio::test]
    async fn signing_is_deterministic_rfc6979() {
        let signer = LocalSigner::from_hex(TEST_KEY).unwrap();
        let digest = keccak256(b"same preimage");
        let a = signer.sign_digest(digest).await.unwrap();
        let b = signer.sign_digest(digest).await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn remote_response_shapes_parse() {
        let raw = r#"{"r":"0x11","s":"0x22","v":27}"#;
        let parsed: RemoteSignResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.v, 27);
    }
}
