//! Sealing of key material at rest and in flight to custodian nodes.
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use rand_core::OsRng;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::{
    serde::{decode, encode},
    sss::KeyShare,
};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("custody key must be {KEY_LEN} bytes of hex")]
    BadKey,
    #[error("sealed data is truncated")]
    Truncated,
    #[error("sealed data failed authentication")]
    Authentication,
    #[error("sealed data is not a key share")]
    Malformed,
}

/// AES-256-GCM under the server's custody key.
///
/// Sealed data is `nonce || ciphertext`, bound to caller-chosen associated data.
#[derive(Clone)]
pub struct ShareCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl ShareCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, CipherError> {
        let mut bytes = hex::decode(s.trim()).map_err(|_| CipherError::BadKey)?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| CipherError::BadKey)?;
        bytes.zeroize();
        Ok(Self::new(key))
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()))
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead()
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .expect("aes-gcm encryption of in-memory data cannot fail");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        if sealed.len() < NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| CipherError::Authentication)
    }

    /// Seal a custodian share, bound to the wallet's public key.
    pub fn seal_share(&self, share: &KeyShare, public_key: &[u8]) -> Vec<u8> {
        let plaintext = Zeroizing::new(encode(share));
        self.seal(&plaintext, public_key)
    }

    pub fn open_share(&self, sealed: &[u8], public_key: &[u8]) -> Result<KeyShare, CipherError> {
        let plaintext = self.open(sealed, public_key)?;
        decode(&plaintext).map_err(|_| CipherError::Malformed)
    }
}

impl std::fmt::Debug for ShareCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShareCipher(..)")
    }
}
