// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

#![warn(missing_docs)]

//! This is p11csp, a cryptographic service provider that keeps its EC
//! keys on a PKCS#11 token.
//!
//! The [Provider] generates, finds and uses ECDSA keys on the token
//! through a small [device::Device] interface, pooling the expensive
//! device sessions and caching object handles and key objects for as long
//! as a session is open. Every ECDSA signature it returns is in low-S
//! form, and signatures with a high S value are refused at verification.
//! Operations on any other kind of key are handed over to a software
//! [CryptoProvider] given at construction time.
//!
//! ```no_run
//! use std::sync::Arc;
//! use p11csp::device::pkcs11::Pkcs11Device;
//! use p11csp::{CryptoProvider, KeyGenOpts, Opts, Provider};
//!
//! # fn fallback() -> Arc<dyn CryptoProvider> { unimplemented!() }
//! let opts = Opts::from_env();
//! let device = Arc::new(Pkcs11Device::new(&opts.library)?);
//! let csp = Provider::new(&opts, device, Some(fallback()))?;
//! let key = csp.key_gen(&KeyGenOpts::Ecdsa { ephemeral: true })?;
//! let signature = csp.sign(key.as_ref(), &[0x42; 32])?;
//! assert!(csp.verify(key.as_ref(), &signature, &[0x42; 32])?);
//! # Ok::<(), p11csp::Error>(())
//! ```

pub mod cache;
pub mod config;
pub mod device;
pub mod ec;
pub mod error;
pub mod key;
mod log;
mod provider;
pub mod session;

pub use config::Opts;
pub use error::{Error, ErrorKind, Result};
pub use key::{
    CryptoProvider, EncrypterOpts, HashOpts, Hasher, Key, KeyDerivOpts,
    KeyGenOpts, KeyImportOpts,
};
pub use provider::Provider;

#[cfg(test)]
mod tests;
