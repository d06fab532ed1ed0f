//! Entity identity and Ed25519 signing keys.
//!
//! An [`Entity`] is the local user identity: an immutable opaque id, a signing
//! key pair generated at creation, and the profile shared with peers.

use crate::utils::{CryptoError, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// File holding the public entity record
pub const ENTITY_FILE: &str = "entity.json";

/// File holding the raw signing key
pub const ENTITY_KEY_FILE: &str = "entity.key";

/// Ed25519 key pair used by an entity
#[derive(Debug, Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Restore a key pair from a 32-byte secret key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the secret key has the wrong size
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SECRET_KEY_LENGTH] =
            secret_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey {
                    reason: format!(
                        "Invalid secret key length: expected {}, got {}",
                        SECRET_KEY_LENGTH,
                        secret_bytes.len()
                    ),
                })?;
        let signing_key = SigningKey::from_bytes(&bytes);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this key pair's public key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
            return false;
        };
        self.verifying_key
            .verify(message, &Signature::from_bytes(&bytes))
            .is_ok()
    }
}

/// Profile metadata shared with peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Display name
    pub name: String,
    /// Avatar filename inside the `image/` file namespace
    pub avatar: Option<String>,
    /// Last time the profile changed
    pub updated: DateTime<Utc>,
}

impl Profile {
    /// Create a profile stamped now
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar: None,
            updated: Utc::now(),
        }
    }
}

/// Serializable public part of an entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRecord {
    /// Opaque entity id
    pub id: String,
    /// Ed25519 public key
    #[serde(with = "serde_bytes")]
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Current profile
    pub profile: Profile,
}

/// The local identity
#[derive(Debug, Clone)]
pub struct Entity {
    /// Public record
    pub record: EntityRecord,
    /// Signing keys, never shared
    pub keypair: SigningKeyPair,
}

impl Entity {
    /// Create a new entity with a fresh id and key pair
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), display_name)
    }

    /// Create a new entity with a caller-chosen id
    pub fn with_id(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let keypair = SigningKeyPair::generate();
        let record = EntityRecord {
            id: id.into(),
            public_key: keypair.public_key_bytes(),
            created_at: Utc::now(),
            profile: Profile::new(display_name),
        };

        Self { record, keypair }
    }

    /// Rebuild an entity from stored parts
    ///
    /// # Errors
    ///
    /// Returns error if the key pair does not match the record
    pub fn from_parts(record: EntityRecord, keypair: SigningKeyPair) -> Result<Self> {
        if keypair.public_key_bytes() != record.public_key {
            return Err(CryptoError::InvalidKey {
                reason: "Key pair and entity public keys don't match".to_string(),
            }
            .into());
        }

        Ok(Self { record, keypair })
    }

    /// Entity id
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Current profile
    pub fn profile(&self) -> &Profile {
        &self.record.profile
    }

    /// Hex-encoded public key
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.record.public_key)
    }

    /// Sign a message with the entity key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.keypair.sign(message)
    }

    /// Short identifier (first 8 chars of the id)
    pub fn short_id(&self) -> &str {
        let id = self.id();
        id.get(..8).unwrap_or(id)
    }

    /// Load the entity stored in `keys_dir`, if any
    pub fn load(keys_dir: &Path) -> Result<Option<Self>> {
        let record_path = keys_dir.join(ENTITY_FILE);
        let key_path = keys_dir.join(ENTITY_KEY_FILE);
        if !record_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let record: EntityRecord = serde_json::from_str(&std::fs::read_to_string(&record_path)?)?;
        let keypair = SigningKeyPair::from_secret_bytes(&std::fs::read(&key_path)?)?;
        Self::from_parts(record, keypair).map(Some)
    }

    /// Write the entity to `keys_dir`
    pub fn save(&self, keys_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(keys_dir)?;
        std::fs::write(
            keys_dir.join(ENTITY_FILE),
            serde_json::to_string_pretty(&self.record)?,
        )?;
        std::fs::write(keys_dir.join(ENTITY_KEY_FILE), self.keypair.secret_key_bytes())?;
        Ok(())
    }

    /// Load the stored entity or create and persist a new one
    pub fn load_or_create(keys_dir: &Path, display_name: &str) -> Result<Self> {
        if let Some(entity) = Self::load(keys_dir)? {
            return Ok(entity);
        }

        let entity = Self::new(display_name);
        entity.save(keys_dir)?;
        log::info!("Created entity {} ({})", entity.record.profile.name, entity.id());
        Ok(entity)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.record.profile.name, self.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keypair_from_secret() {
        let original = SigningKeyPair::generate();
        let restored = SigningKeyPair::from_secret_bytes(&original.secret_key_bytes()).unwrap();
        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());

        assert!(SigningKeyPair::from_secret_bytes(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_signature_verification() {
        let keypair = SigningKeyPair::generate();
        let signature = keypair.sign(b"Hello, world!");

        assert!(keypair.verify(b"Hello, world!", &signature));
        assert!(!keypair.verify(b"Hello, universe!", &signature));
        assert!(!keypair.verify(b"Hello, world!", &signature[..10]));
    }

    #[test]
    fn test_entity_persistence() {
        let dir = TempDir::new().unwrap();

        let created = Entity::load_or_create(dir.path(), "Alice").unwrap();
        let loaded = Entity::load_or_create(dir.path(), "Ignored").unwrap();

        assert_eq!(created.id(), loaded.id());
        assert_eq!(loaded.profile().name, "Alice");
        assert_eq!(created.public_key_hex(), loaded.public_key_hex());
    }

    #[test]
    fn test_entity_key_mismatch() {
        let entity = Entity::new("Mismatch");
        let other = SigningKeyPair::generate();

        assert!(Entity::from_parts(entity.record.clone(), other).is_err());
    }

    #[test]
    fn test_short_id() {
        let entity = Entity::with_id("a1", "Short");
        assert_eq!(entity.short_id(), "a1");

        let entity = Entity::new("Long");
        assert_eq!(entity.short_id().len(), 8);
        assert!(entity.id().starts_with(entity.short_id()));
    }
}
