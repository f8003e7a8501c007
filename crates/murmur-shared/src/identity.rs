use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use crate::error::IdentityError;
use crate::types::UserId;

/// A node's cryptographic identity based on Ed25519.
///
/// The public key is the peer's address everywhere in the messaging core.
/// The same key material also yields an X25519 secret, so two identities can
/// agree on a shared secret from their public keys alone.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

/// On-disk format of an identity key file.
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    pub fn from_export(export: &IdentityExport) -> Result<Self, IdentityError> {
        let identity = Self::from_secret_bytes(&export.secret_key);
        if identity.public_key_bytes() != export.public_key {
            return Err(IdentityError::KeyFile(
                "public key does not match secret key".into(),
            ));
        }
        Ok(identity)
    }

    /// Load the identity stored at `path`, or create and persist a new one.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let bytes =
                std::fs::read(path).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            let export: IdentityExport = bincode::deserialize(&bytes)
                .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            return Self::from_export(&export);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        }
        let bytes = bincode::serialize(&identity.to_export())
            .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        Ok(identity)
    }

    pub fn user_id(&self) -> UserId {
        UserId(self.signing_key.verifying_key().to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// X25519 secret corresponding to [`UserId::dh_public`].
    pub fn dh_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Diffie-Hellman agreement between this identity and `peer`'s identity key.
    pub fn agree(&self, peer: &UserId) -> Result<[u8; 32], IdentityError> {
        let public = peer.dh_public()?;
        Ok(*self.dh_secret().diffie_hellman(&public).as_bytes())
    }
}

/// Verify an Ed25519 signature produced by `signer`.
pub fn verify_signature(
    signer: &UserId,
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(&signer.0).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
