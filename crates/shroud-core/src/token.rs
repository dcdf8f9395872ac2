//! Authenticated ciphertext tokens.
//!
//! Wire format (url-safe base64 with padding over the binary frame):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 1    | version (`0x80`) |
//! | 1      | 8    | creation time, UNIX seconds, big-endian |
//! | 9      | 16   | AES-CBC IV |
//! | 25     | n    | AES-128-CBC ciphertext, PKCS7 padded (n % 16 == 0) |
//! | 25+n   | 32   | HMAC-SHA256 over bytes `0..25+n` |
//!
//! This is the Fernet token layout, so files written by earlier releases of the
//! desktop tool decrypt unchanged.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const TOKEN_VERSION: u8 = 0x80;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;
const BLOCK_LEN: usize = 16;
const HEADER_LEN: usize = 1 + 8 + IV_LEN;
const MIN_FRAME_LEN: usize = HEADER_LEN + BLOCK_LEN + TAG_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not valid base64")]
    Encoding,
    #[error("token is truncated or misframed ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported token version 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("token signature mismatch: tampered data or wrong key")]
    Signature,
    #[error("token payload padding is invalid")]
    Padding,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is not valid url-safe base64")]
    Encoding,
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

/// Symmetric key material: signing half followed by encryption half.
#[derive(Clone)]
pub struct TransformKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl TransformKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self { bytes }
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, KeyError> {
        if raw.len() != KEY_LEN {
            return Err(KeyError::Length(raw.len()));
        }
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        bytes.copy_from_slice(raw);
        Ok(Self { bytes })
    }

    /// Parses the 44-character text form; surrounding whitespace is ignored.
    pub fn from_base64(text: &str) -> Result<Self, KeyError> {
        let raw = Zeroizing::new(
            general_purpose::URL_SAFE
                .decode(text.trim())
                .map_err(|_| KeyError::Encoding)?,
        );
        Self::from_bytes(&raw)
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(general_purpose::URL_SAFE.encode(&self.bytes[..]))
    }

    fn signing_key(&self) -> &[u8] {
        &self.bytes[..16]
    }

    fn encryption_key(&self) -> &[u8; 16] {
        self.bytes[16..]
            .try_into()
            .expect("key halves are 16 bytes")
    }
}

impl fmt::Debug for TransformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Unauthenticated header fields, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenHeader {
    pub version: u8,
    pub timestamp: u64,
}

pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

pub fn encrypt(key: &TransformKey, plaintext: &[u8]) -> Vec<u8> {
    let now = Utc::now().timestamp().max(0) as u64;
    encrypt_with(key, plaintext, &generate_iv(), now)
}

pub fn encrypt_with(
    key: &TransformKey,
    plaintext: &[u8],
    iv: &[u8; IV_LEN],
    timestamp: u64,
) -> Vec<u8> {
    let ciphertext = Aes128CbcEnc::new(key.encryption_key().into(), iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut frame = Vec::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
    frame.push(TOKEN_VERSION);
    frame.extend_from_slice(&timestamp.to_be_bytes());
    frame.extend_from_slice(iv);
    frame.extend_from_slice(&ciphertext);

    let tag = sign(key, &frame);
    frame.extend_from_slice(&tag);
    general_purpose::URL_SAFE.encode(frame).into_bytes()
}

pub fn decrypt(key: &TransformKey, token: &[u8]) -> Result<Vec<u8>, TokenError> {
    let frame = decode_frame(token)?;
    let (signed, tag) = frame.split_at(frame.len() - TAG_LEN);

    let mut mac = mac_for(key);
    mac.update(signed);
    mac.verify_slice(tag).map_err(|_| TokenError::Signature)?;

    let iv: [u8; IV_LEN] = signed[9..HEADER_LEN]
        .try_into()
        .map_err(|_| TokenError::Truncated(frame.len()))?;
    Aes128CbcDec::new(key.encryption_key().into(), (&iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(&signed[HEADER_LEN..])
        .map_err(|_| TokenError::Padding)
}

pub fn inspect(token: &[u8]) -> Result<TokenHeader, TokenError> {
    let frame = decode_frame(token)?;
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&frame[1..9]);
    Ok(TokenHeader {
        version: frame[0],
        timestamp: u64::from_be_bytes(ts),
    })
}

/// Exact token length produced for a plaintext of `plaintext_len` bytes.
pub fn encoded_len(plaintext_len: u64) -> u64 {
    let padded = (plaintext_len / BLOCK_LEN as u64 + 1) * BLOCK_LEN as u64;
    let frame = (HEADER_LEN + TAG_LEN) as u64 + padded;
    frame.div_ceil(3) * 4
}

fn decode_frame(token: &[u8]) -> Result<Vec<u8>, TokenError> {
    let text = token.trim_ascii();
    let frame = general_purpose::URL_SAFE
        .decode(text)
        .map_err(|_| TokenError::Encoding)?;
    if frame.len() < MIN_FRAME_LEN || (frame.len() - HEADER_LEN - TAG_LEN) % BLOCK_LEN != 0 {
        return Err(TokenError::Truncated(frame.len()));
    }
    if frame[0] != TOKEN_VERSION {
        return Err(TokenError::UnsupportedVersion(frame[0]));
    }
    Ok(frame)
}

fn mac_for(key: &TransformKey) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(key.signing_key()).expect("HMAC accepts any key length")
}

fn sign(key: &TransformKey, data: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = mac_for(key);
    mac.update(data);
    mac.finalize().into_bytes().into()
}
