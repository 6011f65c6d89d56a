/*!
The outer framing every persisted record is written in.

A sealed record on disk is:

```text
u16 LE   format version
u8       envelope algorithm tag
u32 LE   nonce length, followed by the nonce
u32 LE   ciphertext length, followed by the ciphertext
u32 LE   tag length, followed by the AEAD tag
```

[`seal_record`]/[`open_record`] wrap the plaintext as a versioned JSON
encoding of a structured record (a `RepositoryIndex`, `Snapshot`, ...), per
the data model's canonical field names. [`seal_bytes`]/[`open_bytes`] use
the identical framing but carry raw bytes directly, for payloads that are
not themselves structured records (chunk plaintext).
*/

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeError, Key};

pub const WIRE_VERSION: u16 = 1;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("unsupported wire format version {0}")]
    UnsupportedVersion(u16),
    #[error("unrecognized envelope algorithm tag {0}")]
    UnknownEnvelope(u8),
    #[error("truncated or malformed record framing: {0}")]
    Framing(#[from] std::io::Error),
    #[error("record plaintext was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

type Result<T> = std::result::Result<T, WireError>;

fn envelope_tag(e: Envelope) -> u8 {
    match e {
        Envelope::Aes256Gcm => 0,
        Envelope::ChaCha20Poly1305 => 1,
    }
}

fn envelope_from_tag(tag: u8) -> Result<Envelope> {
    match tag {
        0 => Ok(Envelope::Aes256Gcm),
        1 => Ok(Envelope::ChaCha20Poly1305),
        other => Err(WireError::UnknownEnvelope(other)),
    }
}

/// Seals raw `plaintext` bytes under `key` and frames them for storage.
///
/// Used for payloads that are not themselves a JSON record, namely chunk
/// plaintext (which may already carry its own compression tag byte).
pub fn seal_bytes(key: &Key, envelope: Envelope, plaintext: &[u8]) -> Vec<u8> {
    let (nonce, sealed) = envelope.seal(key, plaintext);
    // AEAD crates append the tag to the ciphertext; split it back out so the
    // on-disk framing keeps the four fields explicit and separate.
    let tag_len = 16;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - tag_len);

    let mut out =
        Vec::with_capacity(2 + 1 + 4 + nonce.len() + 4 + ciphertext.len() + 4 + tag.len());
    out.write_u16::<LittleEndian>(WIRE_VERSION).unwrap();
    out.push(envelope_tag(envelope));
    out.write_u32::<LittleEndian>(nonce.len() as u32).unwrap();
    out.extend_from_slice(&nonce);
    out.write_u32::<LittleEndian>(ciphertext.len() as u32)
        .unwrap();
    out.extend_from_slice(ciphertext);
    out.write_u32::<LittleEndian>(tag.len() as u32).unwrap();
    out.extend_from_slice(tag);
    out
}

/// Unframes and opens a record previously produced by [`seal_bytes`].
///
/// # Errors
///
/// Returns `Err(Envelope(IntegrityFailure))` if the AEAD tag does not
/// validate (wrong key or tampered bytes), or `Err(UnsupportedVersion)` if
/// the framing version is not understood.
pub fn open_bytes(key: &Key, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(bytes);
    let version = cursor.read_u16::<LittleEndian>()?;
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let envelope = envelope_from_tag(cursor.read_u8()?)?;

    let nonce_len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut nonce = vec![0_u8; nonce_len];
    std::io::Read::read_exact(&mut cursor, &mut nonce)?;

    let ciphertext_len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut ciphertext = vec![0_u8; ciphertext_len];
    std::io::Read::read_exact(&mut cursor, &mut ciphertext)?;

    let tag_len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut tag = vec![0_u8; tag_len];
    std::io::Read::read_exact(&mut cursor, &mut tag)?;

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    envelope.open(key, &nonce, &sealed).map_err(Into::into)
}

/// Serializes `value` to JSON, seals it under `key` with `envelope`, and
/// frames it for storage.
pub fn seal_record<T: Serialize>(key: &Key, envelope: Envelope, value: &T) -> Vec<u8> {
    let json = serde_json::to_vec(value).expect("record types do not fail to serialize to JSON");
    seal_bytes(key, envelope, &json)
}

/// Unframes and opens a record previously produced by [`seal_record`],
/// then deserializes the recovered plaintext as JSON.
///
/// # Errors
///
/// Returns `Err(Envelope(IntegrityFailure))` if the AEAD tag does not
/// validate (wrong key or tampered bytes), `Err(UnsupportedVersion)` if the
/// framing version is not understood, or `Err(Json)` if the decrypted
/// plaintext does not deserialize to `T`.
pub fn open_record<T: DeserializeOwned>(key: &Key, bytes: &[u8]) -> Result<T> {
    let plaintext = open_bytes(key, bytes)?;
    let value = serde_json::from_slice(&plaintext)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Dummy {
        a: u32,
        b: String,
    }

    #[test]
    fn roundtrip() {
        let key = Key::random();
        let value = Dummy {
            a: 7,
            b: "hello".to_string(),
        };
        let bytes = seal_record(&key, Envelope::Aes256Gcm, &value);
        let out: Dummy = open_record(&key, &bytes).unwrap();
        assert_eq!(value, out);
    }

    #[test]
    fn tampered_bytes_fail_to_open() {
        let key = Key::random();
        let value = Dummy {
            a: 1,
            b: "x".to_string(),
        };
        let mut bytes = seal_record(&key, Envelope::Aes256Gcm, &value);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let out: Result<Dummy> = open_record(&key, &bytes);
        assert!(out.is_err());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key = Key::random();
        let other = Key::random();
        let value = Dummy {
            a: 1,
            b: "x".to_string(),
        };
        let bytes = seal_record(&key, Envelope::Aes256Gcm, &value);
        let out: Result<Dummy> = open_record(&other, &bytes);
        assert!(out.is_err());
    }

    #[test]
    fn raw_bytes_roundtrip() {
        let key = Key::random();
        let payload = vec![1_u8, 2, 3, 4, 5, 255, 0, 128];
        let sealed = seal_bytes(&key, Envelope::ChaCha20Poly1305, &payload);
        let out = open_bytes(&key, &sealed).unwrap();
        assert_eq!(out, payload);
    }
}
