//! AEAD wrapper for encapsulated frames
//!
//! Supports AES-128/192/256-GCM, ChaCha20-Poly1305 and XChaCha20-Poly1305
//! using pure Rust crates, behind one unified seal/open API.
//!
//! Every frame gets a fresh random nonce; the wire form is
//! `nonce ‖ ciphertext ‖ tag` with no associated data. The per-peer key is
//! derived from the configured passphrase with HKDF-SHA256, bound to the
//! method name so switching methods never reuses key material.
//!
//! A tag mismatch is a per-frame event: the frame drops, the tunnel flow
//! survives. Middleboxes probe long-lived TCP flows; a torn-down session
//! would be the real signal.

use std::fmt;
use std::str::FromStr;

use aes::Aes192;
use aes_gcm::{
    aead::{consts::U12, Aead, KeyInit},
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CryptoError;

/// AES-192 in GCM mode; the `aes-gcm` crate aliases only 128 and 256
pub type Aes192Gcm = AesGcm<Aes192, U12>;

/// Authentication tag length for every supported method
pub const TAG_LEN: usize = 16;

/// Nonce length for the GCM family and ChaCha20-Poly1305
pub const GCM_NONCE_LEN: usize = 12;

/// Nonce length for XChaCha20-Poly1305
pub const XCHACHA_NONCE_LEN: usize = 24;

/// Salt binding derived keys to this protocol
const HKDF_SALT: &[u8] = b"rust-tunnel/psk/v1";

/// Configurable encryption method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Plain,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

impl Method {
    /// Canonical configuration name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes192Gcm => "aes-192-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    /// Key length in bytes; zero for plain
    #[must_use]
    pub fn key_len(self) -> usize {
        match self {
            Self::Plain => 0,
            Self::Aes128Gcm => 16,
            Self::Aes192Gcm => 24,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 | Self::XChaCha20Poly1305 => 32,
        }
    }

    /// Nonce length in bytes; zero for plain
    #[must_use]
    pub fn nonce_len(self) -> usize {
        match self {
            Self::Plain => 0,
            Self::XChaCha20Poly1305 => XCHACHA_NONCE_LEN,
            _ => GCM_NONCE_LEN,
        }
    }

    /// Whether frames pass through unencrypted
    #[must_use]
    pub fn is_plain(self) -> bool {
        self == Self::Plain
    }
}

impl FromStr for Method {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "aes-128-gcm" => Ok(Self::Aes128Gcm),
            "aes-192-gcm" => Ok(Self::Aes192Gcm),
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" => Ok(Self::ChaCha20Poly1305),
            "xchacha20-poly1305" => Ok(Self::XChaCha20Poly1305),
            other => Err(CryptoError::UnknownMethod(other.into())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ready-to-use cipher for one tunnel.
///
/// Create once per peer and reuse for every frame in both directions.
pub enum Cipher {
    Plain,
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha20(Box<ChaCha20Poly1305>),
    XChaCha20(Box<XChaCha20Poly1305>),
}

impl Cipher {
    /// Build a cipher from the configured method and passphrase.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MissingPassword` when a non-plain method has no
    /// passphrase, or `CryptoError::KeyDerivation` if HKDF expansion fails.
    pub fn new(method: Method, password: Option<&str>) -> Result<Self, CryptoError> {
        if method.is_plain() {
            return Ok(Self::Plain);
        }
        let password = match password {
            Some(p) if !p.is_empty() => p,
            _ => return Err(CryptoError::MissingPassword(method.to_string())),
        };
        let key = derive_key(password, method)?;

        let invalid = |_| CryptoError::KeyDerivation("derived key has wrong length".into());
        Ok(match method {
            Method::Plain => unreachable!("handled above"),
            Method::Aes128Gcm => {
                Self::Aes128(Box::new(Aes128Gcm::new_from_slice(&key).map_err(invalid)?))
            }
            Method::Aes192Gcm => {
                Self::Aes192(Box::new(Aes192Gcm::new_from_slice(&key).map_err(invalid)?))
            }
            Method::Aes256Gcm => {
                Self::Aes256(Box::new(Aes256Gcm::new_from_slice(&key).map_err(invalid)?))
            }
            Method::ChaCha20Poly1305 => Self::ChaCha20(Box::new(
                ChaCha20Poly1305::new_from_slice(&key).map_err(invalid)?,
            )),
            Method::XChaCha20Poly1305 => Self::XChaCha20(Box::new(
                XChaCha20Poly1305::new_from_slice(&key).map_err(invalid)?,
            )),
        })
    }

    /// The method this cipher implements
    #[must_use]
    pub fn method(&self) -> Method {
        match self {
            Self::Plain => Method::Plain,
            Self::Aes128(_) => Method::Aes128Gcm,
            Self::Aes192(_) => Method::Aes192Gcm,
            Self::Aes256(_) => Method::Aes256Gcm,
            Self::ChaCha20(_) => Method::ChaCha20Poly1305,
            Self::XChaCha20(_) => Method::XChaCha20Poly1305,
        }
    }

    /// Whether this cipher passes frames through unencrypted
    #[must_use]
    pub fn is_plain(&self) -> bool {
        matches!(self, Self::Plain)
    }

    /// Encrypt one frame with a fresh random nonce.
    ///
    /// Returns `nonce ‖ ciphertext ‖ tag`; plain mode copies through.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Seal` if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.is_plain() {
            return Ok(plaintext.to_vec());
        }

        let nonce_len = self.method().nonce_len();
        let mut out = vec![0u8; nonce_len];
        OsRng.fill_bytes(&mut out);

        let ciphertext = match self {
            Self::Plain => unreachable!("handled above"),
            Self::Aes128(cipher) => cipher.encrypt(Nonce::from_slice(&out), plaintext),
            Self::Aes192(cipher) => cipher.encrypt(Nonce::from_slice(&out), plaintext),
            Self::Aes256(cipher) => cipher.encrypt(Nonce::from_slice(&out), plaintext),
            Self::ChaCha20(cipher) => {
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(&out), plaintext)
            }
            Self::XChaCha20(cipher) => cipher.encrypt(XNonce::from_slice(&out), plaintext),
        }
        .map_err(|_| CryptoError::Seal)?;

        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt one `nonce ‖ ciphertext ‖ tag` frame.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::ShortFrame` when the frame cannot even hold a
    /// nonce and tag, or `CryptoError::Open` on tag mismatch. Both are
    /// per-frame: drop and carry on.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.is_plain() {
            return Ok(frame.to_vec());
        }

        let nonce_len = self.method().nonce_len();
        if frame.len() < nonce_len + TAG_LEN {
            return Err(CryptoError::ShortFrame { len: frame.len() });
        }
        let (nonce, ciphertext) = frame.split_at(nonce_len);

        match self {
            Self::Plain => unreachable!("handled above"),
            Self::Aes128(cipher) => cipher.decrypt(Nonce::from_slice(nonce), ciphertext),
            Self::Aes192(cipher) => cipher.decrypt(Nonce::from_slice(nonce), ciphertext),
            Self::Aes256(cipher) => cipher.decrypt(Nonce::from_slice(nonce), ciphertext),
            Self::ChaCha20(cipher) => {
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            }
            Self::XChaCha20(cipher) => cipher.decrypt(XNonce::from_slice(nonce), ciphertext),
        }
        .map_err(|_| CryptoError::Open)
    }
}

/// Derive the method-length key from a passphrase with HKDF-SHA256
fn derive_key(password: &str, method: Method) -> Result<Vec<u8>, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), password.as_bytes());
    let mut key = vec![0u8; method.key_len()];
    hkdf.expand(method.as_str().as_bytes(), &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}
