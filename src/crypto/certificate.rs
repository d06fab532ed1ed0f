//! Peer certificates and the verification challenge.
//!
//! An issuer hands each peer a [`Certificate`] carrying a fresh X25519 public
//! key and keeps the private half. To verify, the peer seals its stored copy
//! of the certificate to that public key; only the issuer can open it and
//! compare it with what it issued.
//!
//! Sealing is an ephemeral X25519 exchange, HKDF-SHA256 key derivation and
//! ChaCha20-Poly1305. The challenge carries no nonce, so a captured
//! presentation can be replayed.

use crate::utils::{CryptoError, Result};
use base64::{engine::general_purpose, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Current certificate format version
pub const CERTIFICATE_VERSION: u32 = 1;

const SEAL_INFO: &[u8] = b"peerway-certificate-presentation";
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Public certificate handed to a peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    /// Issuing entity id
    pub issuer: String,
    /// Base64 X25519 public key of the verifier
    pub public: String,
    /// Issue time
    pub created: DateTime<Utc>,
    /// Format version
    pub version: u32,
}

impl Certificate {
    /// Issue a new certificate; returns it together with its private key
    pub fn issue(issuer: impl Into<String>) -> (Self, StaticSecret) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let certificate = Self {
            issuer: issuer.into(),
            public: general_purpose::STANDARD.encode(public.as_bytes()),
            created: Utc::now(),
            version: CERTIFICATE_VERSION,
        };

        (certificate, secret)
    }

    /// Decode the verifier public key
    pub fn public_key(&self) -> Result<PublicKey> {
        let bytes = general_purpose::STANDARD.decode(&self.public)?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: "certificate public key must be 32 bytes".to_string(),
        })?;
        Ok(PublicKey::from(bytes))
    }

    /// Canonical string form used for the presentation comparison
    pub fn canonical(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Seal this certificate to its own verifier key, producing a `cert.present` payload
    pub fn present(&self) -> Result<String> {
        seal(&self.public_key()?, self.canonical()?.as_bytes())
    }
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret can read it
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<String> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes())?;
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut sealed = Vec::with_capacity(KEY_SIZE + NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(general_purpose::STANDARD.encode(sealed))
}

/// Decrypt a payload produced by [`seal`]
pub fn open(secret: &StaticSecret, sealed: &str) -> Result<Vec<u8>> {
    let sealed = general_purpose::STANDARD.decode(sealed)?;
    if sealed.len() < KEY_SIZE + NONCE_SIZE {
        return Err(CryptoError::Decryption {
            reason: "sealed payload too short".to_string(),
        }
        .into());
    }

    let (ephemeral, rest) = sealed.split_at(KEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
    let mut ephemeral_bytes = [0u8; KEY_SIZE];
    ephemeral_bytes.copy_from_slice(ephemeral);

    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_bytes));
    let key = derive_key(shared.as_bytes(), &ephemeral_bytes)?;

    ChaCha20Poly1305::new(Key::from_slice(&key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| {
            CryptoError::Decryption {
                reason: e.to_string(),
            }
            .into()
        })
}

fn derive_key(shared: &[u8], salt: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(SEAL_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivation {
            reason: e.to_string(),
        })?;
    Ok(key)
}

/// Persisted form of an issued certificate and its private key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCertificate {
    /// The certificate handed out
    pub certificate: Certificate,
    /// Base64 private key
    pub secret: String,
}

struct Issued {
    certificate: Certificate,
    secret: StaticSecret,
}

/// Certificates this entity issued, and the verification state of each peer
#[derive(Default)]
pub struct CertificateAuthority {
    issued: Mutex<HashMap<String, Issued>>,
    verified: Mutex<HashMap<String, bool>>,
}

impl CertificateAuthority {
    /// Create an empty authority
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a certificate for `peer_id`, replacing any previous one
    pub fn issue(&self, issuer: &str, peer_id: &str) -> (Certificate, StoredCertificate) {
        let (certificate, secret) = Certificate::issue(issuer);
        let stored = StoredCertificate {
            certificate: certificate.clone(),
            secret: general_purpose::STANDARD.encode(secret.to_bytes()),
        };

        if let Ok(mut issued) = self.issued.lock() {
            issued.insert(
                peer_id.to_string(),
                Issued {
                    certificate: certificate.clone(),
                    secret,
                },
            );
        }
        if let Ok(mut verified) = self.verified.lock() {
            verified.remove(peer_id);
        }

        (certificate, stored)
    }

    /// Reload a previously persisted certificate
    pub fn restore(&self, peer_id: &str, stored: StoredCertificate) -> Result<()> {
        let bytes = general_purpose::STANDARD.decode(&stored.secret)?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: "stored certificate secret must be 32 bytes".to_string(),
        })?;

        if let Ok(mut issued) = self.issued.lock() {
            issued.insert(
                peer_id.to_string(),
                Issued {
                    certificate: stored.certificate,
                    secret: StaticSecret::from(bytes),
                },
            );
        }
        Ok(())
    }

    /// Whether a certificate was issued to `peer_id`
    pub fn has_issued(&self, peer_id: &str) -> bool {
        self.issued
            .lock()
            .map(|issued| issued.contains_key(peer_id))
            .unwrap_or(false)
    }

    /// Check a `cert.present` payload and record the outcome
    pub fn check_presentation(&self, peer_id: &str, sealed: &str) -> bool {
        let outcome = self.compare(peer_id, sealed);
        if let Ok(mut verified) = self.verified.lock() {
            verified.insert(peer_id.to_string(), outcome);
        }
        outcome
    }

    fn compare(&self, peer_id: &str, sealed: &str) -> bool {
        let Ok(issued) = self.issued.lock() else {
            return false;
        };
        let Some(entry) = issued.get(peer_id) else {
            log::warn!("cert.present from {peer_id} without an issued certificate");
            return false;
        };

        let expected = match entry.certificate.canonical() {
            Ok(expected) => expected,
            Err(_) => return false,
        };
        match open(&entry.secret, sealed) {
            Ok(plaintext) => plaintext == expected.as_bytes(),
            Err(e) => {
                log::warn!("Certificate presentation from {peer_id} failed to open: {e}");
                false
            }
        }
    }

    /// Verification flag for `peer_id`, if a presentation was checked
    pub fn is_verified(&self, peer_id: &str) -> Option<bool> {
        self.verified
            .lock()
            .ok()
            .and_then(|verified| verified.get(peer_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let sealed = seal(&public, b"certificate body").unwrap();
        assert_eq!(open(&secret, &sealed).unwrap(), b"certificate body");

        let stranger = StaticSecret::random_from_rng(OsRng);
        assert!(open(&stranger, &sealed).is_err());
    }

    #[test]
    fn test_presentation_of_issued_certificate() {
        let authority = CertificateAuthority::new();
        let (certificate, _) = authority.issue("a1", "b1");

        assert_eq!(authority.is_verified("b1"), None);
        let presentation = certificate.present().unwrap();
        assert!(authority.check_presentation("b1", &presentation));
        assert_eq!(authority.is_verified("b1"), Some(true));
    }

    #[test]
    fn test_presentation_of_altered_certificate() {
        let authority = CertificateAuthority::new();
        let (certificate, _) = authority.issue("a1", "b1");

        let mut altered = certificate.clone();
        altered.issuer = "a2".to_string();
        // Still sealed to the genuine key, so only the content differs.
        let presentation = seal(
            &certificate.public_key().unwrap(),
            altered.canonical().unwrap().as_bytes(),
        )
        .unwrap();

        assert!(!authority.check_presentation("b1", &presentation));
        assert_eq!(authority.is_verified("b1"), Some(false));
    }

    #[test]
    fn test_restore_round_trip() {
        let authority = CertificateAuthority::new();
        let (certificate, stored) = authority.issue("a1", "b1");

        let restored = CertificateAuthority::new();
        restored.restore("b1", stored).unwrap();
        assert!(restored.has_issued("b1"));
        assert!(restored.check_presentation("b1", &certificate.present().unwrap()));
    }

    #[test]
    fn test_reissue_resets_verification() {
        let authority = CertificateAuthority::new();
        let (first, _) = authority.issue("a1", "b1");
        assert!(authority.check_presentation("b1", &first.present().unwrap()));

        let (second, _) = authority.issue("a1", "b1");
        assert_ne!(first.public, second.public);
        assert_eq!(authority.is_verified("b1"), None);
        assert!(!authority.check_presentation("b1", &first.present().unwrap()));
    }
}
