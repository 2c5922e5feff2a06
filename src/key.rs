// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! Key objects, operation options and the [CryptoProvider] trait shared by
//! the HSM provider and its software fallback

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;

use sha2::digest::DynDigest;

/// A key handed out by a provider
///
/// Keys are shared as `Arc<dyn Key>`; a provider recognizes its own keys
/// with [Key::as_any] and forwards any other key to its fallback.
pub trait Key: Debug + Send + Sync + Any {
    /// Exported form of the key, when the key allows it
    fn bytes(&self) -> Result<Vec<u8>>;

    /// The identifier used to find this key again with `get_key`
    fn ski(&self) -> Vec<u8>;

    /// True for secret keys
    fn symmetric(&self) -> bool;

    /// True for secret keys and the private half of key pairs
    fn private(&self) -> bool;

    /// Public half of an asymmetric key pair
    fn public_key(&self) -> Result<Arc<dyn Key>>;

    /// Allows providers to recognize their own key types
    fn as_any(&self) -> &dyn Any;
}

/// Key generation requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyGenOpts {
    /// ECDSA on the curve selected by the configured security level
    Ecdsa {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
    /// ECDSA on P-256
    EcdsaP256 {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
    /// ECDSA on P-384
    EcdsaP384 {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
    /// AES with a 128 bit key
    Aes128 {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
    /// AES with a 192 bit key
    Aes192 {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
    /// AES with a 256 bit key
    Aes256 {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
}

impl KeyGenOpts {
    /// Whether the key lives only as long as the session
    pub fn ephemeral(&self) -> bool {
        match self {
            KeyGenOpts::Ecdsa { ephemeral }
            | KeyGenOpts::EcdsaP256 { ephemeral }
            | KeyGenOpts::EcdsaP384 { ephemeral }
            | KeyGenOpts::Aes128 { ephemeral }
            | KeyGenOpts::Aes192 { ephemeral }
            | KeyGenOpts::Aes256 { ephemeral } => *ephemeral,
        }
    }
}

/// Key derivation requests
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyDerivOpts {
    /// ECDSA key re-randomization
    EcdsaReRand {
        /// Session only key, not persisted on the token
        ephemeral: bool,
        /// Re-randomization factor
        expansion: Vec<u8>,
    },
    /// HMAC derived AES-256 key
    HmacTruncated256Aes {
        /// Session only key, not persisted on the token
        ephemeral: bool,
        /// HMAC input
        arg: Vec<u8>,
    },
    /// HMAC derived key
    Hmac {
        /// Session only key, not persisted on the token
        ephemeral: bool,
        /// HMAC input
        arg: Vec<u8>,
    },
}

/// Key import requests, the raw material is passed alongside
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyImportOpts {
    /// Raw AES-256 key
    Aes256 {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
    /// Raw HMAC key
    Hmac {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
    /// DER SubjectPublicKeyInfo
    EcdsaPkixPublicKey {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
    /// DER EC private key
    EcdsaPrivateKey {
        /// Session only key, not persisted on the token
        ephemeral: bool,
    },
}

/// Hash function requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashOpts {
    /// The hash family of the provider configuration
    Sha,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA3-256
    Sha3_256,
    /// SHA3-384
    Sha3_384,
}

/// A streaming hash function handed out by [CryptoProvider::get_hash]
pub type Hasher = Box<dyn DynDigest + Send>;

/// Symmetric encryption modes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncrypterOpts {
    /// AES-CBC with PKCS#7 padding, a random IV is used when none is given
    AesCbcPkcs7 {
        /// Explicit IV, a random one is used when None
        iv: Option<Vec<u8>>,
    },
}

/// The operations a cryptographic service provider offers
///
/// `sign` takes a digest computed by the caller and `verify` checks a
/// signature over such a digest.
pub trait CryptoProvider: Debug + Send + Sync {
    /// Generates a new key
    fn key_gen(&self, opts: &KeyGenOpts) -> Result<Arc<dyn Key>>;

    /// Derives a new key from `key`
    fn key_deriv(
        &self,
        key: &dyn Key,
        opts: &KeyDerivOpts,
    ) -> Result<Arc<dyn Key>>;

    /// Imports raw key material
    fn key_import(
        &self,
        raw: &[u8],
        opts: &KeyImportOpts,
    ) -> Result<Arc<dyn Key>>;

    /// Finds the key whose SKI is `ski`
    fn get_key(&self, ski: &[u8]) -> Result<Arc<dyn Key>>;

    /// Hashes `msg`
    fn hash(&self, msg: &[u8], opts: &HashOpts) -> Result<Vec<u8>>;

    /// Returns a hasher for messages fed in chunks
    fn get_hash(&self, opts: &HashOpts) -> Result<Hasher>;

    /// Signs a digest
    fn sign(&self, key: &dyn Key, digest: &[u8]) -> Result<Vec<u8>>;

    /// Checks a signature over a digest
    fn verify(
        &self,
        key: &dyn Key,
        signature: &[u8],
        digest: &[u8],
    ) -> Result<bool>;

    /// Encrypts with a symmetric key
    fn encrypt(
        &self,
        key: &dyn Key,
        plaintext: &[u8],
        opts: &EncrypterOpts,
    ) -> Result<Vec<u8>>;

    /// Decrypts with a symmetric key
    fn decrypt(
        &self,
        key: &dyn Key,
        ciphertext: &[u8],
        opts: &EncrypterOpts,
    ) -> Result<Vec<u8>>;
}
