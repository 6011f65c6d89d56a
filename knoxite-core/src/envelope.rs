/*!
Key derivation and the AEAD sealing envelope that every persisted record
(chunks, snapshots, the repository index) is wrapped in.

Every sealed record is `{nonce, ciphertext_and_tag}`, produced by one of the
two supported AEAD constructions. Unlike an encrypt-then-MAC split, the tag
is bound to the ciphertext by the construction itself, so a single
`open` call both decrypts and authenticates.
*/

use aes_gcm::aead::{Aead, NewAead};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::prelude::*;
use rust_argon2::{self, Config, ThreadMode, Variant, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use zeroize::Zeroize;

/// Errors that can occur while sealing, opening, or deriving key material.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The AEAD tag did not validate: either the key is wrong, or the
    /// ciphertext was tampered with.
    #[error("integrity check failed, data may be corrupt or the key may be wrong")]
    IntegrityFailure,
    #[error("argon2 key derivation failed: {0}")]
    Argon2(#[from] rust_argon2::Error),
}

type Result<T> = std::result::Result<T, EnvelopeError>;

/// The symmetric key material for a repository.
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    /// Securely generates a new random 32-byte key.
    pub fn random() -> Key {
        let mut bytes = vec![0_u8; 32];
        thread_rng().fill_bytes(&mut bytes);
        Key { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(..)")
    }
}

/// Which AEAD construction sealed a particular record.
///
/// Stored alongside the nonce and ciphertext so that a repository could, in
/// principle, mix algorithms across records; in practice every record in a
/// given repository uses the same variant.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Envelope {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope::Aes256Gcm
    }
}

impl Envelope {
    const NONCE_LEN: usize = 12;

    /// Seals `plaintext` under `key`, returning the nonce and the
    /// ciphertext-with-appended-tag.
    ///
    /// # Panics
    ///
    /// Panics if the AEAD construction itself fails to seal the data. This
    /// only happens if the plaintext exceeds the construction's maximum
    /// message length, which is not a concern for chunk- or record-sized
    /// payloads.
    pub fn seal(self, key: &Key, plaintext: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut nonce_bytes = vec![0_u8; Self::NONCE_LEN];
        thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = aes_gcm::aead::generic_array::GenericArray::from_slice(&nonce_bytes);
        let ciphertext = match self {
            Envelope::Aes256Gcm => {
                let cipher = Aes256Gcm::new(key_array(key));
                cipher
                    .encrypt(nonce, plaintext)
                    .expect("AEAD sealing should never fail for a chunk-sized payload")
            }
            Envelope::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(key_array(key));
                cipher
                    .encrypt(nonce, plaintext)
                    .expect("AEAD sealing should never fail for a chunk-sized payload")
            }
        };
        (nonce_bytes, ciphertext)
    }

    /// Opens a previously sealed record.
    ///
    /// # Errors
    ///
    /// Returns `Err(IntegrityFailure)` if the tag does not validate, which
    /// covers both a wrong key and a tampered ciphertext.
    pub fn open(self, key: &Key, nonce_bytes: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = aes_gcm::aead::generic_array::GenericArray::from_slice(nonce_bytes);
        let result = match self {
            Envelope::Aes256Gcm => {
                let cipher = Aes256Gcm::new(key_array(key));
                cipher.decrypt(nonce, ciphertext)
            }
            Envelope::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(key_array(key));
                cipher.decrypt(nonce, ciphertext)
            }
        };
        result.map_err(|_| EnvelopeError::IntegrityFailure)
    }
}

fn key_array(key: &Key) -> &aes_gcm::aead::generic_array::GenericArray<u8, aes_gcm::aead::consts::U32> {
    aes_gcm::aead::generic_array::GenericArray::from_slice(key.bytes())
}

/// The repository's symmetric [`Key`], encrypted with a key encryption key
/// derived from the user's passphrase via Argon2id, and sealed with an
/// AEAD [`Envelope`].
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EncryptedKey {
    nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
    salt: [u8; 32],
    mem_cost: u32,
    time_cost: u32,
    envelope: Envelope,
}

impl EncryptedKey {
    /// Derives a key-encryption-key from `passphrase` with Argon2id, and
    /// uses it to seal `key`.
    pub fn encrypt(
        key: &Key,
        passphrase: &[u8],
        mem_cost: u32,
        time_cost: u32,
        envelope: Envelope,
    ) -> EncryptedKey {
        let mut salt = [0_u8; 32];
        thread_rng().fill_bytes(&mut salt);
        let kek = derive_kek(passphrase, &salt, mem_cost, time_cost);
        let kek = Key { bytes: kek };
        let (nonce, ciphertext) = envelope.seal(&kek, key.bytes());
        trace!("encrypted repository key with argon2-derived kek");
        EncryptedKey {
            nonce,
            ciphertext,
            salt,
            mem_cost,
            time_cost,
            envelope,
        }
    }

    /// Argon2 parameters chosen to cost at least ~100ms on commodity
    /// hardware, per the repository's encryption design requirement.
    pub fn encrypt_defaults(key: &Key, passphrase: &[u8]) -> EncryptedKey {
        EncryptedKey::encrypt(key, passphrase, 65536, 12, Envelope::default())
    }

    /// Attempts to recover the repository [`Key`] with the given
    /// passphrase.
    ///
    /// # Errors
    ///
    /// Returns `Err(IntegrityFailure)` if the passphrase is wrong (the AEAD
    /// tag will not validate against a kek derived from the wrong
    /// passphrase). Callers authenticating a repository open should map
    /// this to `WrongPassword`.
    pub fn decrypt(&self, passphrase: &[u8]) -> Result<Key> {
        let kek = derive_kek(passphrase, &self.salt, self.mem_cost, self.time_cost);
        let kek = Key { bytes: kek };
        let bytes = self.envelope.open(&kek, &self.nonce, &self.ciphertext)?;
        Ok(Key { bytes })
    }
}

fn derive_kek(passphrase: &[u8], salt: &[u8; 32], mem_cost: u32, time_cost: u32) -> Vec<u8> {
    let config = Config {
        variant: Variant::Argon2id,
        version: Version::Version13,
        mem_cost,
        time_cost,
        thread_mode: ThreadMode::Sequential,
        lanes: 1,
        secret: &[],
        ad: &[],
        hash_length: 32,
    };
    rust_argon2::hash_raw(passphrase, salt, &config)
        .expect("argon2 hashing should not fail for well-formed parameters")
}
