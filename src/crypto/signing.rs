use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

/// Signing capability consumed by the action store.
///
/// The store only needs to sign canonical bytes and name the actor; key
/// storage and DID documents live outside this crate.
pub trait Signer: Send + Sync {
    /// Stable actor identifier recorded on every action.
    fn identifier(&self) -> &str;

    fn sign(&self, message: &[u8]) -> Vec<u8>;

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 signer backed by an in-memory key pair.
pub struct Ed25519Signer {
    secret_key: SigningKey,
    public_key: VerifyingKey,
    identifier: String,
}

impl Ed25519Signer {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        Self::from_seed(&secret_bytes)
    }

    /// Derive the key pair deterministically from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret_key = SigningKey::from_bytes(seed);
        let public_key = secret_key.verifying_key();
        let identifier = format!("did:worklog:{}", hex::encode(public_key.to_bytes()));

        Self {
            secret_key,
            public_key,
            identifier,
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.public_key
    }
}

impl Signer for Ed25519Signer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret_key.sign(message).to_bytes().to_vec()
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let signature_bytes: [u8; 64] = match signature.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let sig = Signature::from_bytes(&signature_bytes);
        self.public_key.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}
