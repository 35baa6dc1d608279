//! NIP-01: event structure, canonical serialization and signing.
//!
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical serialization `[0, pubkey, created_at, kind, tags, content]`
//! - Event id derivation (SHA-256 of the canonical serialization)
//! - Event signing with BIP-340 Schnorr signatures (requires `full` feature)

use std::sync::LazyLock;

use bitcoin::secp256k1::{All, Secp256k1};
#[cfg(feature = "full")]
use bitcoin::secp256k1::{Keypair, Message, SecretKey};
#[cfg(feature = "full")]
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::codec::{VerifyFailure, verify_event};

pub(crate) static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// Errors that can occur while building or signing events.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// The event without its id and signature.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Run the full validation, id and signature check on an already-typed event.
    pub fn verify(&self) -> Result<(), VerifyFailure> {
        let raw = serde_json::to_value(self)
            .map_err(|_| VerifyFailure::Invalid(crate::codec::InvalidReason::MalformedContainer))?;
        verify_event(&raw).map(|_| ())
    }
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// A template for creating events (without pubkey, which comes from the signing key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

pub const KIND_SHORT_TEXT_NOTE: u16 = 1;

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Derive the event id: lowercase hex SHA-256 of the canonical serialization.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

/// Generate a random 32-byte secret key.
#[cfg(feature = "full")]
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the public key (x-only, 32 bytes) from a secret key.
#[cfg(feature = "full")]
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&SECP);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
#[cfg(feature = "full")]
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Sign an event template with a secret key, producing a complete signed event.
#[cfg(feature = "full")]
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&SECP, &sk);
    let (xonly_pk, _parity) = keypair.x_only_public_key();

    let unsigned = UnsignedEvent {
        pubkey: hex::encode(xonly_pk.serialize()),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let id = get_event_hash(&unsigned)?;

    let mut digest = [0u8; 32];
    hex::decode_to_slice(&id, &mut digest)
        .map_err(|e| Nip01Error::Signing(format!("invalid id hex: {}", e)))?;
    let sig = SECP.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig.serialize()),
    })
}
