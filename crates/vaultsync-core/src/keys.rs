//! Crypto provider and device identity.
//!
//! Ed25519 signs handshakes, X25519 is the device's encryption key pair and
//! SHA-256 addresses file content. The free functions are pure; only
//! [`DeviceIdentity`] touches disk.

use crate::error::CryptoError;
use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

pub const SIGNING_KEY_FILE: &str = "identity.key";
pub const ENCRYPTION_KEY_FILE: &str = "encryption.key";

/// Hex characters kept from the public key digest for display.
const FINGERPRINT_LEN: usize = 16;

#[derive(Clone)]
pub struct EncryptionKeyPair {
    pub secret: StaticSecret,
    pub public: X25519Public,
}

pub fn generate_signing_key_pair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn generate_encryption_key_pair() -> EncryptionKeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    EncryptionKeyPair { secret, public }
}

pub fn sign(key: &SigningKey, msg: &[u8]) -> Vec<u8> {
    key.sign(msg).to_bytes().to_vec()
}

/// Check `signature` over `msg` against an exported public key.
///
/// A well-formed signature that does not match is `Ok(false)`; key or
/// signature bytes that cannot even be parsed are an error.
pub fn verify(public_key: &str, msg: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    let pk = import_public_key(public_key)?;
    let sig = Signature::from_slice(signature)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    Ok(pk.verify(msg, &sig).is_ok())
}

/// Content address of a byte sequence: lowercase hex SHA-256.
pub fn hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Short fingerprint for visual comparison during manual key exchange.
/// 8 bytes is not collision resistant; never use it to decide trust.
pub fn fingerprint(public_key_export: &str) -> String {
    let mut digest = hash(public_key_export.as_bytes());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

pub fn export_public_key(key: &VerifyingKey) -> String {
    hex::encode(key.to_bytes())
}

pub fn import_public_key(export: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(export.trim()).map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::MalformedKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::MalformedKey(e.to_string()))
}

/// Random 128-bit device id, hex encoded.
pub fn new_device_id() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// This device: id plus signing and encryption key pairs.
///
/// Key files hold the raw 32-byte secrets in the data directory. Production
/// deployments should prefer an OS keystore.
#[derive(Clone)]
pub struct DeviceIdentity {
    pub id: String,
    pub signing_key: SigningKey,
    pub encryption: EncryptionKeyPair,
}

impl DeviceIdentity {
    pub fn generate(id: String) -> Self {
        Self {
            id,
            signing_key: generate_signing_key_pair(),
            encryption: generate_encryption_key_pair(),
        }
    }

    /// Generate fresh keys for `id` and persist them under `dir`.
    pub fn generate_and_store(dir: &Path, id: String) -> Result<Self> {
        let identity = Self::generate(id);
        fs::create_dir_all(dir)?;

        fs::write(dir.join(SIGNING_KEY_FILE), identity.signing_key.to_bytes())
            .context("writing identity file")?;
        fs::write(dir.join(ENCRYPTION_KEY_FILE), identity.encryption.secret.to_bytes())
            .context("writing encryption key file")?;

        tracing::info!("Generated new identity in {:?}", dir);
        Ok(identity)
    }

    pub fn load(dir: &Path, id: String) -> Result<Self> {
        let mut signing = read_key_file(&dir.join(SIGNING_KEY_FILE))?;
        let signing_key = SigningKey::from_bytes(&signing);
        signing.zeroize();

        let mut enc = read_key_file(&dir.join(ENCRYPTION_KEY_FILE))?;
        let secret = StaticSecret::from(enc);
        enc.zeroize();
        let public = X25519Public::from(&secret);

        tracing::info!("Loaded identity from {:?}", dir);
        Ok(Self {
            id,
            signing_key,
            encryption: EncryptionKeyPair { secret, public },
        })
    }

    pub fn load_or_generate(dir: &Path, id: String) -> Result<Self> {
        if dir.join(SIGNING_KEY_FILE).exists() {
            Self::load(dir, id)
        } else {
            Self::generate_and_store(dir, id)
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_export(&self) -> String {
        export_public_key(&self.verifying_key())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_export())
    }

    pub fn encryption_public_key(&self) -> String {
        hex::encode(self.encryption.public.as_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        sign(&self.signing_key, msg)
    }
}

fn read_key_file(path: &Path) -> Result<[u8; 32]> {
    let mut data = fs::read(path).with_context(|| format!("reading key file {:?}", path))?;
    if data.len() != 32 {
        let len = data.len();
        data.zeroize();
        return Err(CryptoError::KeyFile(format!(
            "invalid key file length: expected 32 bytes, got {}",
            len
        ))
        .into());
    }
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&data);
    data.zeroize();
    Ok(key_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_verify() {
        let key = generate_signing_key_pair();
        let export = export_public_key(&key.verifying_key());
        let sig = sign(&key, b"device-a");

        assert!(verify(&export, b"device-a", &sig).unwrap());
        assert!(!verify(&export, b"device-b", &sig).unwrap());
    }

    #[test]
    fn test_verify_with_unrelated_key_is_false() {
        let signer = generate_signing_key_pair();
        let other = generate_signing_key_pair();
        let sig = sign(&signer, b"device-a");

        let export = export_public_key(&other.verifying_key());
        assert!(!verify(&export, b"device-a", &sig).unwrap());
    }

    #[test]
    fn test_malformed_material_is_an_error() {
        let key = generate_signing_key_pair();
        let export = export_public_key(&key.verifying_key());

        assert!(matches!(
            verify("not-hex", b"x", &[0u8; 64]),
            Err(CryptoError::MalformedKey(_))
        ));
        assert!(matches!(
            verify("abcd", b"x", &[0u8; 64]),
            Err(CryptoError::MalformedKey(_))
        ));
        assert!(matches!(
            verify(&export, b"x", &[0u8; 10]),
            Err(CryptoError::MalformedSignature(_))
        ));
    }

    #[test]
    fn test_hash_and_fingerprint() {
        assert_eq!(
            hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let fp = fingerprint("some-public-key");
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, hash(b"some-public-key")[..16]);
    }

    #[test]
    fn test_identity_persists() -> Result<()> {
        let temp = TempDir::new()?;
        let created = DeviceIdentity::load_or_generate(temp.path(), "dev-1".into())?;
        let loaded = DeviceIdentity::load_or_generate(temp.path(), "dev-1".into())?;

        assert_eq!(created.public_key_export(), loaded.public_key_export());
        assert_eq!(created.encryption_public_key(), loaded.encryption_public_key());
        assert_eq!(created.fingerprint().len(), 16);
        Ok(())
    }

    #[test]
    fn test_truncated_key_file_rejected() -> Result<()> {
        let temp = TempDir::new()?;
        fs::write(temp.path().join(SIGNING_KEY_FILE), [1u8; 5])?;
        assert!(DeviceIdentity::load(temp.path(), "dev".into()).is_err());
        Ok(())
    }

    #[test]
    fn test_device_ids_are_distinct() {
        let a = new_device_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, new_device_id());
    }
}
