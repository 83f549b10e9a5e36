// backend/api/src/identity.rs
//
// Wallet signature gate.
//
// A wallet proves control of its key by signing an arbitrary message with
// `personal_sign` (EIP-191). We recover the secp256k1 signer, compare it to
// the claimed address and record a timestamped attestation. The voting
// engine only reads attestations; it never verifies signatures itself.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use serde::Serialize;
use sha3::{Digest, Keccak256};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    store::{AttestationStore, StoreError},
    types::{Attestation, WalletAddress},
};

/// How long an attestation stays usable.
pub const DEFAULT_ATTESTATION_TTL_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature must be 65 bytes of hex")]
    Malformed,

    #[error("unsupported recovery id {0}")]
    RecoveryId(u8),

    #[error("signature does not recover to a public key")]
    Unrecoverable,

    #[error("signature was produced by {recovered}, not {claimed}")]
    Mismatch {
        claimed: WalletAddress,
        recovered: WalletAddress,
    },
}

impl From<SignatureError> for Error {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Mismatch { .. } => Error::Unauthorized("Invalid signature".to_string()),
            other => Error::InvalidArgument(format!("Invalid signature format: {other}")),
        }
    }
}

fn keccak256(input: &[u8]) -> [u8; 32] {
    Keccak256::digest(input).into()
}

/// `keccak256("\x19Ethereum Signed Message:\n" ‖ len ‖ message)`
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut payload = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    payload.extend_from_slice(message.as_bytes());
    keccak256(&payload)
}

pub fn address_of(key: &VerifyingKey) -> WalletAddress {
    let point = key.to_encoded_point(false);
    // Drop the 0x04 SEC1 tag; the address is the low 20 bytes of the hash.
    let hash = keccak256(&point.as_bytes()[1..]);
    WalletAddress::from_key_hash(&hash)
}

/// Recover the address that produced `signature` over `message`.
pub fn recover_signer(message: &str, signature: &str) -> Result<WalletAddress, SignatureError> {
    let raw = signature.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).map_err(|_| SignatureError::Malformed)?;
    if bytes.len() != 65 {
        return Err(SignatureError::Malformed);
    }

    let v = bytes[64];
    let recovery_id = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => return Err(SignatureError::RecoveryId(other)),
    };
    let recovery_id =
        RecoveryId::from_byte(recovery_id).ok_or(SignatureError::RecoveryId(v))?;
    let signature = Signature::from_slice(&bytes[..64]).map_err(|_| SignatureError::Malformed)?;

    let key = VerifyingKey::recover_from_prehash(
        &personal_message_hash(message),
        &signature,
        recovery_id,
    )
    .map_err(|_| SignatureError::Unrecoverable)?;

    Ok(address_of(&key))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub is_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verified_at: Option<DateTime<Utc>>,
}

pub struct IdentityGate {
    attestations: Arc<dyn AttestationStore>,
    ttl: Duration,
}

impl IdentityGate {
    pub fn new(attestations: Arc<dyn AttestationStore>, ttl: Duration) -> Self {
        Self { attestations, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn verify(
        &self,
        address: &WalletAddress,
        message: &str,
        signature: &str,
    ) -> Result<Attestation, Error> {
        self.verify_at(address, message, signature, Utc::now()).await
    }

    /// Check the signature and, if it belongs to `address`, record an
    /// attestation issued at `now`.
    pub async fn verify_at(
        &self,
        address: &WalletAddress,
        message: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Attestation, Error> {
        let recovered = recover_signer(message, signature).map_err(|e| {
            debug!(%address, error = %e, "Rejected malformed signature");
            e
        })?;

        if &recovered != address {
            warn!(claimed = %address, %recovered, "Signature belongs to another wallet");
            return Err(SignatureError::Mismatch {
                claimed: address.clone(),
                recovered,
            }
            .into());
        }

        let attestation = Attestation {
            address: address.normalized(),
            signature: signature.trim().to_string(),
            verified_at: now,
        };
        self.attestations.record_attestation(&attestation).await?;

        info!(%address, "Wallet signature verified");
        Ok(attestation)
    }

    pub async fn get_attestation(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<Attestation>, StoreError> {
        self.attestations.get_attestation(address).await
    }

    pub async fn status_at(
        &self,
        address: &WalletAddress,
        now: DateTime<Utc>,
    ) -> Result<SignatureStatus, StoreError> {
        let attestation = self.get_attestation(address).await?;

        Ok(SignatureStatus {
            is_verified: attestation
                .as_ref()
                .is_some_and(|a| a.is_valid_at(now, self.ttl)),
            last_verified_at: attestation.map(|a| a.verified_at),
        })
    }

    /// Fails with `Unauthorized` unless `address` holds an attestation that
    /// is still inside the validity window at `now`.
    pub async fn require_attestation(
        &self,
        address: &WalletAddress,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        match self.get_attestation(address).await? {
            None => Err(Error::Unauthorized(
                "Wallet signature verification required before voting".to_string(),
            )),
            Some(a) if !a.is_valid_at(now, self.ttl) => Err(Error::Unauthorized(
                "Signature verification expired. Please sign again.".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }
}
