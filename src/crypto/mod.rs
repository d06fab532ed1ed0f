//! Cryptographic primitives: entity identity and peer certificates.

pub mod certificate;
pub mod identity;

pub use certificate::{Certificate, CertificateAuthority, StoredCertificate, CERTIFICATE_VERSION};
pub use identity::*;
