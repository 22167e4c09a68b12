//! Cipher, hash and KDF selection.
//!
//! This module does not implement primitives. It picks them and sequences
//! them:
//! - [`SessionCipher`]: AEAD selected by [`CipherKind`], random nonce
//!   prepended to every ciphertext
//! - [`HashKind`]: SHA-2, SHA-3 and BLAKE3 families for identifiers
//! - [`KdfKind`]: Argon2id (device-adaptive) or HKDF-SHA256 for group secrets
//! - [`EphemeralKeyPair`]: X25519 agreement for per-session keys
//!
//! # Security Notes
//!
//! - Session and group keys are always 256-bit
//! - Every derived key passes through HKDF-SHA256 with a domain label
//! - Secrets are zeroized on drop and redacted from `Debug` output

use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, XChaCha20Poly1305,
};
use hkdf::Hkdf;
use rand_core::OsRng;
use relay_types::GroupId;
use sha2::{Digest, Sha256, Sha512};
use sha3::{Sha3_256, Sha3_512};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub use relay_types::CipherKind;

/// Key size for every supported cipher (256 bits).
pub const KEY_SIZE: usize = 32;

/// HKDF label for per-session keys.
const SESSION_INFO: &[u8] = b"shroud-session-v1";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Ciphertext shorter than its nonce.
    #[error("ciphertext truncated: {0} bytes")]
    Truncated(usize),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// No key has been set on the channel.
    #[error("session channel has no key")]
    NoKey,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The OS random source failed.
    #[error("random source failed: {0}")]
    Random(String),
}

fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|e| CryptoError::Random(e.to_string()))
}

/// Nonce length of `kind` in bytes.
pub fn nonce_len(kind: CipherKind) -> usize {
    match kind {
        CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 12,
        CipherKind::XChaCha20Poly1305 => 24,
    }
}

/// An AEAD instance keyed for one session or group.
#[derive(Clone)]
pub enum SessionCipher {
    /// AES-256-GCM.
    Aes256Gcm(Box<Aes256Gcm>),
    /// ChaCha20-Poly1305.
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    /// XChaCha20-Poly1305.
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
}

impl SessionCipher {
    /// Key a cipher of `kind`. The key must be [`KEY_SIZE`] bytes.
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }
        let invalid = |_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: key.len(),
        };
        Ok(match kind {
            CipherKind::Aes256Gcm => {
                Self::Aes256Gcm(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?))
            }
            CipherKind::ChaCha20Poly1305 => Self::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?,
            )),
            CipherKind::XChaCha20Poly1305 => Self::XChaCha20Poly1305(Box::new(
                XChaCha20Poly1305::new_from_slice(key).map_err(invalid)?,
            )),
        })
    }

    /// Which cipher this is.
    pub fn kind(&self) -> CipherKind {
        match self {
            Self::Aes256Gcm(_) => CipherKind::Aes256Gcm,
            Self::ChaCha20Poly1305(_) => CipherKind::ChaCha20Poly1305,
            Self::XChaCha20Poly1305(_) => CipherKind::XChaCha20Poly1305,
        }
    }

    /// Encrypt under a fresh random nonce. Output is `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = vec![0u8; nonce_len(self.kind())];
        random_bytes(&mut nonce)?;

        let ciphertext = match self {
            Self::Aes256Gcm(c) => c.encrypt(nonce.as_slice().into(), plaintext),
            Self::ChaCha20Poly1305(c) => c.encrypt(nonce.as_slice().into(), plaintext),
            Self::XChaCha20Poly1305(c) => c.encrypt(nonce.as_slice().into(), plaintext),
        }
        .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        nonce.extend_from_slice(&ciphertext);
        Ok(nonce)
    }

    /// Decrypt `nonce || ciphertext`.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let split = nonce_len(self.kind());
        if data.len() < split {
            return Err(CryptoError::Truncated(data.len()));
        }
        let (nonce, ciphertext) = data.split_at(split);

        match self {
            Self::Aes256Gcm(c) => c.decrypt(nonce.into(), ciphertext),
            Self::ChaCha20Poly1305(c) => c.decrypt(nonce.into(), ciphertext),
            Self::XChaCha20Poly1305(c) => c.decrypt(nonce.into(), ciphertext),
        }
        .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionCipher({:?}, key: [REDACTED])", self.kind())
    }
}

/// Hash family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashKind {
    /// SHA-256.
    #[default]
    Sha256,
    /// SHA-512.
    Sha512,
    /// SHA3-256.
    Sha3_256,
    /// SHA3-512.
    Sha3_512,
    /// BLAKE3.
    Blake3,
}

impl HashKind {
    /// Hash `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Sha256 => Sha256::digest(data).to_vec(),
            HashKind::Sha512 => Sha512::digest(data).to_vec(),
            HashKind::Sha3_256 => Sha3_256::digest(data).to_vec(),
            HashKind::Sha3_512 => Sha3_512::digest(data).to_vec(),
            HashKind::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        }
    }

    /// Hash `data`, truncated to 256 bits.
    pub fn digest32(self, data: &[u8]) -> [u8; 32] {
        let full = self.digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&full[..32]);
        out
    }
}

/// Passphrase key derivation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KdfKind {
    /// Argon2id with device-adaptive cost.
    #[default]
    Argon2id,
    /// Single HKDF-SHA256 extract/expand. Cheap; for high-entropy input.
    HkdfSha256,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    memory_mib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Argon2Params {
    /// Pick a cost tier for a device with `ram_mb` of memory.
    ///
    /// | RAM        | Memory | Passes | Lanes |
    /// |------------|--------|--------|-------|
    /// | < 2 GB     | 12 MiB | 3      | 1     |
    /// | < 4 GB     | 19 MiB | 2      | 1     |
    /// | < 8 GB     | 46 MiB | 1      | 1     |
    /// | otherwise  | 64 MiB | 3      | 4     |
    pub fn for_ram_mb(ram_mb: u64) -> Self {
        let (memory_mib, iterations, parallelism) = match ram_mb {
            0..=1999 => (12, 3, 1),
            2000..=3999 => (19, 2, 1),
            4000..=7999 => (46, 1, 1),
            _ => (64, 3, 4),
        };
        Self {
            memory_mib,
            iterations,
            parallelism,
        }
    }

    /// Memory cost in MiB.
    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    /// Number of passes.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn to_argon2(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_mib * 1024,
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
    }
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self::for_ram_mb(detect_total_ram_mb())
    }
}

/// Total system memory in megabytes.
pub fn detect_total_ram_mb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory() / (1024 * 1024)
}

/// Root secret shared by every member of a group.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupSecret([u8; KEY_SIZE]);

impl GroupSecret {
    /// Derive from a passphrase with `kdf`.
    pub fn derive(kdf: KdfKind, passphrase: &str) -> Result<Self, CryptoError> {
        Self::derive_with_params(kdf, passphrase, Argon2Params::default())
    }

    /// Derive with explicit Argon2 cost (ignored for HKDF).
    pub fn derive_with_params(
        kdf: KdfKind,
        passphrase: &str,
        params: Argon2Params,
    ) -> Result<Self, CryptoError> {
        let salt = b"shroud-group-secret-v1";
        let mut output = [0u8; KEY_SIZE];

        match kdf {
            KdfKind::Argon2id => {
                Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?)
                    .hash_password_into(passphrase.as_bytes(), salt, &mut output)
                    .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
            }
            KdfKind::HkdfSha256 => {
                Hkdf::<Sha256>::new(Some(salt), passphrase.as_bytes())
                    .expand(b"group-secret", &mut output)
                    .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
            }
        }

        Ok(Self(output))
    }

    /// Fresh random secret.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_SIZE];
        random_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Identifier the router sees for this group.
    pub fn group_id(&self, hash: HashKind) -> GroupId {
        let mut input = Vec::with_capacity(18 + KEY_SIZE);
        input.extend_from_slice(b"shroud-group-id-v1");
        input.extend_from_slice(&self.0);
        GroupId::from_digest(hash.digest32(&input))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for GroupSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupSecret([REDACTED])")
    }
}

/// End-to-end key for payloads relayed through the group.
#[derive(Clone)]
pub struct GroupKey {
    cipher: SessionCipher,
}

impl GroupKey {
    /// Derive a key of `kind` from the group secret.
    pub fn derive(secret: &GroupSecret, kind: CipherKind) -> Result<Self, CryptoError> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        Hkdf::<Sha256>::new(Some(b"shroud-group-key-v1"), secret.as_bytes())
            .expand(b"encryption", key.as_mut())
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self {
            cipher: SessionCipher::new(kind, key.as_ref())?,
        })
    }

    /// Encrypt, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.encrypt(plaintext)
    }

    /// Decrypt `nonce || ciphertext`.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.decrypt(data)
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupKey {{ cipher: {:?} }}", self.cipher.kind())
    }
}

/// One side of an X25519 exchange.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate from the OS random source.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half to send to the peer.
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Agree with the peer and derive the 256-bit session key.
    pub fn agree(self, peer_public: [u8; 32]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::KeyDerivationFailed(
                "non-contributory peer key".into(),
            ));
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        Hkdf::<Sha256>::new(None, shared.as_bytes())
            .expand(SESSION_INFO, key.as_mut())
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(key)
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}
