//! Password-encrypted private keys in the Ethereum v3 keystore format.
//!
//! Key derivation is scrypt, the key is encrypted with AES-128-CTR, and the
//! MAC is `keccak256(derived_key[16..32] ‖ ciphertext)`. Every buffer that
//! holds key material or derived secrets is wrapped in [`Zeroizing`], so it is
//! cleared on every exit path including early returns.

use aes::Aes128;
use alloy::primitives::{Address, keccak256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::EngineError;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const KEYSTORE_VERSION: u32 = 3;
const CIPHER: &str = "aes-128-ctr";
const KDF: &str = "scrypt";
const IV_LEN: usize = 16;
const SALT_LEN: usize = 32;
const MAC_LEN: usize = 32;
const MIN_DKLEN: u32 = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeystoreError {
    #[error("invalid password")]
    InvalidPassword,

    #[error("unsupported keystore version {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported cipher {0}")]
    UnsupportedCipher(String),

    #[error("unsupported kdf {0}")]
    UnsupportedKdf(String),

    #[error("invalid kdf parameters: {0}")]
    InvalidKdfParams(String),

    #[error("malformed keystore: {0}")]
    Malformed(String),

    #[error("private key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

impl From<KeystoreError> for EngineError {
    fn from(err: KeystoreError) -> Self {
        EngineError::custody("local", err.to_string())
    }
}

/// scrypt work parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
    pub dklen: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            n: 8192,
            r: 8,
            p: 1,
            dklen: 32,
        }
    }
}

impl KdfParams {
    fn to_scrypt(self) -> Result<scrypt::Params, KeystoreError> {
        if self.n < 2 || !self.n.is_power_of_two() {
            return Err(KeystoreError::InvalidKdfParams(format!(
                "n must be a power of two greater than one, got {}",
                self.n
            )));
        }
        if self.dklen < MIN_DKLEN {
            return Err(KeystoreError::InvalidKdfParams(format!(
                "dklen must be at least {MIN_DKLEN}, got {}",
                self.dklen
            )));
        }

        let log_n = self.n.trailing_zeros() as u8;
        scrypt::Params::new(log_n, self.r, self.p, self.dklen as usize)
            .map_err(|e| KeystoreError::InvalidKdfParams(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystore {
    pub version: u32,
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub crypto: KeystoreCrypto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreCrypto {
    pub cipher: String,
    pub cipherparams: CipherParams,
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
    pub kdf: String,
    pub kdfparams: ScryptParams,
    #[serde(with = "hex")]
    pub mac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    #[serde(with = "hex")]
    pub iv: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScryptParams {
    pub dklen: u32,
    pub n: u32,
    pub r: u32,
    pub p: u32,
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
}

impl ScryptParams {
    fn kdf_params(&self) -> KdfParams {
        KdfParams {
            n: self.n,
            r: self.r,
            p: self.p,
            dklen: self.dklen,
        }
    }
}

fn derive_key(
    password: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
    let scrypt_params = params.to_scrypt()?;
    let mut derived = Zeroizing::new(vec![0u8; params.dklen as usize]);
    scrypt::scrypt(password, salt, &scrypt_params, derived.as_mut_slice())
        .map_err(|e| KeystoreError::InvalidKdfParams(e.to_string()))?;
    Ok(derived)
}

fn compute_mac(derived: &[u8], ciphertext: &[u8]) -> [u8; MAC_LEN] {
    let mut preimage = Zeroizing::new(Vec::with_capacity(16 + ciphertext.len()));
    preimage.extend_from_slice(&derived[16..32]);
    preimage.extend_from_slice(ciphertext);
    keccak256(preimage.as_slice()).0
}

fn apply_cipher(derived: &[u8], iv: &[u8], buffer: &mut [u8]) -> Result<(), KeystoreError> {
    let mut cipher = Aes128Ctr::new_from_slices(&derived[..16], iv)
        .map_err(|e| KeystoreError::Malformed(format!("bad cipher parameters: {e}")))?;
    cipher.apply_keystream(buffer);
    Ok(())
}

/// Encrypts a raw 32-byte private key under `password` with default parameters.
pub fn encrypt_key(private_key: &[u8], password: &[u8]) -> Result<Keystore, KeystoreError> {
    encrypt_key_with_params(private_key, password, KdfParams::default())
}

pub fn encrypt_key_with_params(
    private_key: &[u8],
    password: &[u8],
    params: KdfParams,
) -> Result<Keystore, KeystoreError> {
    if private_key.len() != 32 {
        return Err(KeystoreError::InvalidKeyLength(private_key.len()));
    }

    let mut rng = rand::rng();
    let mut salt = vec![0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut iv = vec![0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let derived = derive_key(password, &salt, params)?;

    let mut ciphertext = private_key.to_vec();
    apply_cipher(&derived, &iv, &mut ciphertext)?;
    let mac = compute_mac(&derived, &ciphertext);

    let address = alloy::signers::local::PrivateKeySigner::from_slice(private_key)
        .ok()
        .map(|signer| signer.address());

    Ok(Keystore {
        version: KEYSTORE_VERSION,
        id: Uuid::new_v4(),
        address,
        crypto: KeystoreCrypto {
            cipher: CIPHER.to_string(),
            cipherparams: CipherParams { iv },
            ciphertext,
            kdf: KDF.to_string(),
            kdfparams: ScryptParams {
                dklen: params.dklen,
                n: params.n,
                r: params.r,
                p: params.p,
                salt,
            },
            mac: mac.to_vec(),
        },
    })
}

/// Decrypts the private key. A MAC mismatch fails with
/// [`KeystoreError::InvalidPassword`] before any plaintext is produced.
pub fn decrypt_key(
    keystore: &Keystore,
    password: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
    if keystore.version != KEYSTORE_VERSION {
        return Err(KeystoreError::UnsupportedVersion(keystore.version));
    }

    let crypto = &keystore.crypto;
    if crypto.cipher != CIPHER {
        return Err(KeystoreError::UnsupportedCipher(crypto.cipher.clone()));
    }
    if crypto.kdf != KDF {
        return Err(KeystoreError::UnsupportedKdf(crypto.kdf.clone()));
    }
    if crypto.cipherparams.iv.len() != IV_LEN {
        return Err(KeystoreError::Malformed(format!(
            "iv must be {IV_LEN} bytes, got {}",
            crypto.cipherparams.iv.len()
        )));
    }
    if crypto.mac.len() != MAC_LEN {
        return Err(KeystoreError::Malformed(format!(
            "mac must be {MAC_LEN} bytes, got {}",
            crypto.mac.len()
        )));
    }

    let derived = derive_key(
        password,
        &crypto.kdfparams.salt,
        crypto.kdfparams.kdf_params(),
    )?;

    let computed = Zeroizing::new(compute_mac(&derived, &crypto.ciphertext));
    if !bool::from(computed.as_slice().ct_eq(crypto.mac.as_slice())) {
        return Err(KeystoreError::InvalidPassword);
    }

    let mut plaintext = Zeroizing::new(crypto.ciphertext.clone());
    apply_cipher(&derived, &crypto.cipherparams.iv, plaintext.as_mut_slice())?;
    Ok(plaintext)
}
