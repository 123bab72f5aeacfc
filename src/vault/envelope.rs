//! `TSE1` encrypted-at-rest container.
//!
//! ```text
//! "TSE1" | header_len: u32 BE | header (JSON) | ciphertext | tag (16 bytes)
//! ```
//!
//! Every envelope carries its own random content key, sealed to a long-lived
//! X25519 key-encrypting key (KEK). The magic, length prefix and header bytes
//! are bound into the AEAD as associated data, so tampering with any of them
//! fails authentication.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const MAGIC: &[u8; 4] = b"TSE1";
pub const FORMAT_VERSION: u16 = 1;
pub const CIPHER_ID: &str = "chacha20poly1305";
pub const TAG_LEN: usize = 16;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PREFIX_LEN: usize = MAGIC.len() + 4;
const MAX_HEADER_LEN: usize = 64 * 1024;
const WRAPPED_KEY_LEN: usize = KEY_LEN + NONCE_LEN + KEY_LEN + TAG_LEN;
const WRAP_INFO: &[u8] = b"TSE1 content-key wrap";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("not a TSE1 envelope")]
    BadMagic,
    #[error("envelope truncated")]
    Truncated,
    #[error("header length {0} exceeds limit")]
    HeaderTooLarge(usize),
    #[error("malformed envelope header: {0}")]
    MalformedHeader(#[from] serde_json::Error),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported cipher '{0}'")]
    UnsupportedCipher(String),
    #[error("malformed {0} in header")]
    BadEncoding(&'static str),
    #[error("no key-encrypting key with id {0}")]
    UnknownKey(String),
    #[error("content key unwrap failed")]
    Unwrap,
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("encryption failed")]
    Encrypt,
}

/// Symmetric key protecting one envelope (or the database key itself).
/// Wiped from memory on drop.
#[derive(Clone)]
pub struct ContentKey(Zeroizing<[u8; KEY_LEN]>);

impl ContentKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(Zeroizing::new(array)))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

/// Public half of a KEK, identified by a short fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct KekPublic {
    id: String,
    key: PublicKey,
}

impl KekPublic {
    pub fn new(key: PublicKey) -> Self {
        Self {
            id: kek_id(&key),
            key,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self::new(PublicKey::from(array)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.key.to_bytes()
    }
}

impl fmt::Debug for KekPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KekPublic").field("id", &self.id).finish()
    }
}

/// Private half of a KEK.
pub struct KekSecret {
    secret: StaticSecret,
    public: KekPublic,
}

impl KekSecret {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self::from_bytes(*bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = KekPublic::new(PublicKey::from(&secret));
        Self { secret, public }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self::from_bytes(array))
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn public(&self) -> &KekPublic {
        &self.public
    }

    fn unseal_content_key(&self, wrapped: &[u8]) -> Result<ContentKey, EnvelopeError> {
        if wrapped.len() != WRAPPED_KEY_LEN {
            return Err(EnvelopeError::Unwrap);
        }
        let (ephemeral, rest) = wrapped.split_at(KEY_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let ephemeral: [u8; KEY_LEN] = ephemeral.try_into().map_err(|_| EnvelopeError::Unwrap)?;
        let ephemeral = PublicKey::from(ephemeral);

        let shared = self.secret.diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(EnvelopeError::Unwrap);
        }
        let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral, &self.public.key)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&wrap_key[..]));
        let plain = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| EnvelopeError::Unwrap)?,
        );
        ContentKey::from_slice(&plain).ok_or(EnvelopeError::Unwrap)
    }
}

impl fmt::Debug for KekSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KekSecret").field("id", &self.public.id).finish()
    }
}

/// Anything that can recover a content key from its sealed form, given the
/// id of the KEK it was sealed to.
pub trait ContentKeyUnwrapper {
    fn unwrap_content_key(&self, kek_id: &str, wrapped: &[u8]) -> Result<ContentKey, EnvelopeError>;
}

impl ContentKeyUnwrapper for KekSecret {
    fn unwrap_content_key(&self, kek_id: &str, wrapped: &[u8]) -> Result<ContentKey, EnvelopeError> {
        if kek_id != self.public.id {
            return Err(EnvelopeError::UnknownKey(kek_id.to_string()));
        }
        self.unseal_content_key(wrapped)
    }
}

impl ContentKeyUnwrapper for [KekSecret] {
    fn unwrap_content_key(&self, kek_id: &str, wrapped: &[u8]) -> Result<ContentKey, EnvelopeError> {
        self.iter()
            .find(|secret| secret.public.id == kek_id)
            .ok_or_else(|| EnvelopeError::UnknownKey(kek_id.to_string()))?
            .unseal_content_key(wrapped)
    }
}

/// First 8 bytes of SHA-256 over the public key, hex encoded.
pub fn kek_id(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest[..8].iter().map(|byte| format!("{byte:02x}")).collect()
}

fn derive_wrap_key(
    shared: &[u8; KEY_LEN],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<Zeroizing<[u8; KEY_LEN]>, EnvelopeError> {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(WRAP_INFO, &mut okm[..])
        .map_err(|_| EnvelopeError::Encrypt)?;
    Ok(okm)
}

/// Seals `key` to `kek`: `ephemeral_pub | nonce | ChaCha20-Poly1305(key)`.
pub fn wrap_content_key(key: &ContentKey, kek: &KekPublic) -> Result<Vec<u8>, EnvelopeError> {
    let ephemeral = KekSecret::generate();
    let shared = ephemeral.secret.diffie_hellman(&kek.key);
    if !shared.was_contributory() {
        return Err(EnvelopeError::Encrypt);
    }
    let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral.public.key, &kek.key)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&wrap_key[..]));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), key.as_bytes().as_slice())
        .map_err(|_| EnvelopeError::Encrypt)?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(ephemeral.public.key.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentType {
    Image {
        mime: String,
        width: u32,
        height: u32,
    },
    Payload {
        payload_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub version: u16,
    pub cipher: String,
    pub created_at: DateTime<Utc>,
    pub content: ContentType,
    pub kek_id: String,
    /// Base64 of the sealed content key.
    pub wrapped_key: String,
    /// Base64 of the 12-byte AEAD nonce.
    pub nonce: String,
}

/// A parsed (not yet decrypted) envelope.
#[derive(Debug, Clone)]
pub struct EncryptedEnvelope {
    header: EnvelopeHeader,
    header_bytes: Vec<u8>,
    sealed: Vec<u8>,
}

impl EncryptedEnvelope {
    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREFIX_LEN + self.header_bytes.len() + self.sealed.len());
        out.extend_from_slice(&associated_data(&self.header_bytes));
        out.extend_from_slice(&self.sealed);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < PREFIX_LEN {
            return Err(if bytes.starts_with(&MAGIC[..bytes.len().min(MAGIC.len())]) {
                EnvelopeError::Truncated
            } else {
                EnvelopeError::BadMagic
            });
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(EnvelopeError::BadMagic);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[MAGIC.len()..PREFIX_LEN]);
        let header_len = u32::from_be_bytes(len_bytes) as usize;
        if header_len > MAX_HEADER_LEN {
            return Err(EnvelopeError::HeaderTooLarge(header_len));
        }

        let body = &bytes[PREFIX_LEN..];
        if body.len() < header_len + TAG_LEN {
            return Err(EnvelopeError::Truncated);
        }
        let (header_bytes, sealed) = body.split_at(header_len);
        let header: EnvelopeHeader = serde_json::from_slice(header_bytes)?;

        if header.version != FORMAT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(header.version));
        }
        if header.cipher != CIPHER_ID {
            return Err(EnvelopeError::UnsupportedCipher(header.cipher));
        }

        Ok(Self {
            header,
            header_bytes: header_bytes.to_vec(),
            sealed: sealed.to_vec(),
        })
    }
}

fn associated_data(header_bytes: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PREFIX_LEN + header_bytes.len());
    aad.extend_from_slice(MAGIC);
    aad.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    aad.extend_from_slice(header_bytes);
    aad
}

/// Encrypts `plaintext` under a fresh content key and nonce, sealing the
/// content key to `kek`.
pub fn seal(
    plaintext: &[u8],
    content: ContentType,
    kek: &KekPublic,
) -> Result<EncryptedEnvelope, EnvelopeError> {
    let content_key = ContentKey::generate();
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let header = EnvelopeHeader {
        version: FORMAT_VERSION,
        cipher: CIPHER_ID.to_string(),
        created_at: Utc::now(),
        content,
        kek_id: kek.id.clone(),
        wrapped_key: BASE64.encode(wrap_content_key(&content_key, kek)?),
        nonce: BASE64.encode(nonce),
    };
    let header_bytes = serde_json::to_vec(&header)?;
    if header_bytes.len() > MAX_HEADER_LEN {
        return Err(EnvelopeError::HeaderTooLarge(header_bytes.len()));
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(content_key.as_bytes()));
    let aad = associated_data(&header_bytes);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| EnvelopeError::Encrypt)?;

    Ok(EncryptedEnvelope {
        header,
        header_bytes,
        sealed,
    })
}

/// Reads the header without decrypting. Useful for routing (which KEK, what
/// payload) before authentication is available.
pub fn peek_header(bytes: &[u8]) -> Result<EnvelopeHeader, EnvelopeError> {
    EncryptedEnvelope::parse(bytes).map(|envelope| envelope.header)
}

/// Decrypts an envelope. Fails closed: any framing, unwrap or tag problem is
/// an error and no plaintext is returned.
pub fn open(
    bytes: &[u8],
    keys: &(impl ContentKeyUnwrapper + ?Sized),
) -> Result<(EnvelopeHeader, Vec<u8>), EnvelopeError> {
    let envelope = EncryptedEnvelope::parse(bytes)?;
    let plaintext = open_envelope(&envelope, keys)?;
    Ok((envelope.header, plaintext))
}

pub fn open_envelope(
    envelope: &EncryptedEnvelope,
    keys: &(impl ContentKeyUnwrapper + ?Sized),
) -> Result<Vec<u8>, EnvelopeError> {
    let header = &envelope.header;
    let wrapped = BASE64
        .decode(&header.wrapped_key)
        .map_err(|_| EnvelopeError::BadEncoding("wrapped_key"))?;
    let nonce = BASE64
        .decode(&header.nonce)
        .map_err(|_| EnvelopeError::BadEncoding("nonce"))?;
    if nonce.len() != NONCE_LEN {
        return Err(EnvelopeError::BadEncoding("nonce"));
    }

    let content_key = keys.unwrap_content_key(&header.kek_id, &wrapped)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(content_key.as_bytes()));
    let aad = associated_data(&envelope.header_bytes);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &envelope.sealed,
                aad: &aad,
            },
        )
        .map_err(|_| EnvelopeError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ContentType {
        ContentType::Payload {
            payload_type: "test".into(),
        }
    }

    #[test]
    fn round_trip_for_varied_payloads() {
        let kek = KekSecret::generate();
        for len in [0usize, 1, 15, 16, 17, 4096] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let bytes = seal(&plaintext, payload(), kek.public()).unwrap().to_bytes();
            let (header, opened) = open(&bytes, &kek).unwrap();
            assert_eq!(opened, plaintext);
            assert_eq!(header.kek_id, kek.public().id());
        }
    }

    #[test]
    fn wire_layout() {
        let kek = KekSecret::generate();
        let envelope = seal(b"abc", payload(), kek.public()).unwrap();
        let bytes = envelope.to_bytes();

        assert_eq!(&bytes[..4], b"TSE1");
        let header_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let header: EnvelopeHeader = serde_json::from_slice(&bytes[8..8 + header_len]).unwrap();
        assert_eq!(header.version, FORMAT_VERSION);
        assert_eq!(header.cipher, CIPHER_ID);
        assert_eq!(bytes.len(), 8 + header_len + 3 + TAG_LEN);
    }

    #[test]
    fn every_flipped_body_bit_fails_closed() {
        let kek = KekSecret::generate();
        let bytes = seal(b"sensitive pixels", payload(), kek.public())
            .unwrap()
            .to_bytes();
        let header_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let body_start = 8 + header_len;

        for index in body_start..bytes.len() {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[index] ^= 1 << bit;
                assert!(matches!(
                    open(&tampered, &kek),
                    Err(EnvelopeError::Authentication)
                ));
            }
        }
    }

    #[test]
    fn header_tampering_is_rejected() {
        let kek = KekSecret::generate();
        let bytes = seal(b"x", payload(), kek.public()).unwrap().to_bytes();
        let header_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;

        for index in 0..8 + header_len {
            let mut tampered = bytes.clone();
            tampered[index] ^= 0x01;
            assert!(open(&tampered, &kek).is_err(), "byte {index} accepted");
        }
    }

    #[test]
    fn wrong_key_and_truncation() {
        let kek = KekSecret::generate();
        let other = KekSecret::generate();
        let bytes = seal(b"x", payload(), kek.public()).unwrap().to_bytes();

        assert!(matches!(open(&bytes, &other), Err(EnvelopeError::UnknownKey(_))));
        assert!(matches!(open(&bytes[..6], &kek), Err(EnvelopeError::Truncated)));
        assert!(matches!(
            open(&bytes[..bytes.len() - 1], &kek),
            Err(EnvelopeError::Authentication) | Err(EnvelopeError::Truncated)
        ));
        assert!(matches!(open(b"PNG\x00\x00\x00\x00\x00", &kek), Err(EnvelopeError::BadMagic)));
    }

    #[test]
    fn key_ring_routes_by_id() {
        let legacy = KekSecret::generate();
        let shared = KekSecret::generate();
        let bytes = seal(b"old", payload(), legacy.public()).unwrap().to_bytes();

        let ring = [shared, legacy];
        let (_, plain) = open(&bytes, &ring[..]).unwrap();
        assert_eq!(plain, b"old");
    }

    #[test]
    fn fresh_key_and_nonce_per_envelope() {
        let kek = KekSecret::generate();
        let a = seal(b"same", payload(), kek.public()).unwrap();
        let b = seal(b"same", payload(), kek.public()).unwrap();
        assert_ne!(a.header().nonce, b.header().nonce);
        assert_ne!(a.header().wrapped_key, b.header().wrapped_key);
    }
}
