// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! The HSM backed [CryptoProvider]
//!
//! EC keys live on the token and are found again by their SKI, which is
//! stored as both CKA_ID and (hex encoded) CKA_LABEL on the public and
//! private objects. Anything else is forwarded to the software fallback.

use std::sync::Arc;

use crate::config::{HashFamily, Opts};
use crate::device::*;
use crate::ec::ecdsa::*;
use crate::ec::{compute_ski, parse_ec_point, Curve};
use crate::error::{Error, Result};
use crate::key::*;
use crate::session::SessionPool;

use log::{debug, info};
use num_bigint::BigUint;
use uuid::Uuid;

/// A cryptographic service provider backed by a PKCS#11 token
#[derive(Debug)]
pub struct Provider {
    device: Arc<dyn Device>,
    pool: SessionPool,
    curve: Curve,
    hash_family: HashFamily,
    software_verify: bool,
    immutable: bool,
    fallback: Arc<dyn CryptoProvider>,
}

impl Provider {
    /// Creates a provider on the token labeled `opts.label`
    ///
    /// The configuration is fully validated before the device is
    /// touched. One session is opened (and logged in) right away so that
    /// a wrong PIN or an unreachable token is reported here.
    pub fn new(
        opts: &Opts,
        device: Arc<dyn Device>,
        fallback: Option<Arc<dyn CryptoProvider>>,
    ) -> Result<Provider> {
        crate::log::p11csp_log_init();

        let curve = Curve::from_security_level(opts.security).map_err(|e| {
            e.context("Failed initializing configuration".to_string())
        })?;
        let hash_family = opts.hash_family().map_err(|e| {
            e.context("Failed initializing fallback provider".to_string())
        })?;
        let fallback = match fallback {
            Some(f) => f,
            None => {
                return Err(Error::config(
                    "Invalid fallback provider. It must be provided"
                        .to_string(),
                ))
            }
        };

        let slot = device.find_slot(&opts.label).map_err(|e| {
            e.context(format!(
                "Failed initializing PKCS11 library {} {}",
                opts.library, opts.label
            ))
        })?;
        let pool = SessionPool::new(device.clone(), slot, opts);
        let session = pool.acquire()?;
        pool.release(session);

        debug!(
            "Initialized provider on slot {:?} with curve {}",
            slot,
            curve.name()
        );
        Ok(Provider {
            device: device,
            pool: pool,
            curve: curve,
            hash_family: hash_family,
            software_verify: opts.software_verify,
            immutable: opts.immutable,
            fallback: fallback,
        })
    }

    /// Curve used for new keys when none is explicitly requested
    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// Hash family configured for the fallback
    pub fn hash_family(&self) -> HashFamily {
        self.hash_family
    }

    /// The session pool, with its caches
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    fn read_ec_point(
        &self,
        session: SessionHandle,
        handle: ObjectHandle,
        curve: Curve,
    ) -> Result<Vec<u8>> {
        let attrs = self.device.get_attributes(
            session,
            handle,
            &[AttributeType::EcPoint],
        )?;
        match find_attribute(&attrs, AttributeType::EcPoint)
            .and_then(|a| a.as_bytes())
        {
            Some(value) => parse_ec_point(curve, value),
            None => Err(Error::device("CKA_EC_POINT not available".to_string())),
        }
    }

    fn generate_ec_key(
        &self,
        curve: Curve,
        ephemeral: bool,
    ) -> Result<EcdsaPrivateKey> {
        self.pool.with_session(|session| {
            /* the real id depends on the public point, which is only
             * known once the pair exists */
            let tmp_id = Uuid::new_v4().to_string().into_bytes();
            let public_template = [
                Attribute::Class(ObjectClass::Public),
                Attribute::KeyType(KeyType::Ec),
                Attribute::Token(!ephemeral),
                Attribute::Verify(true),
                Attribute::EcParams(curve.ec_params()?),
                Attribute::Private(false),
                Attribute::Id(tmp_id.clone()),
                Attribute::Label(tmp_id.clone()),
            ];
            let private_template = [
                Attribute::Class(ObjectClass::Private),
                Attribute::KeyType(KeyType::Ec),
                Attribute::Token(!ephemeral),
                Attribute::Private(true),
                Attribute::Sign(true),
                Attribute::Id(tmp_id.clone()),
                Attribute::Label(tmp_id),
                Attribute::Extractable(false),
                Attribute::Sensitive(true),
            ];
            let (public, private) = self
                .device
                .generate_key_pair(session, &public_template, &private_template)
                .map_err(|e| e.context("P11: keypair generate failed".to_string()))?;

            let point = self.read_ec_point(session, public, curve)?;
            let ski = compute_ski(&point);
            let update = [
                Attribute::Id(ski.clone()),
                Attribute::Label(hex::encode(&ski).into_bytes()),
            ];
            for handle in [public, private] {
                self.device
                    .set_attributes(session, handle, &update)
                    .map_err(|e| {
                        e.context("P11: set-ID-to-SKI failed".to_string())
                    })?;
            }

            if self.immutable {
                let clone_template = [Attribute::Modifiable(false)];
                for handle in [public, private] {
                    self.device
                        .copy_object(session, handle, &clone_template)
                        .map_err(|e| {
                            e.context("P11: CopyObject failed".to_string())
                        })?;
                    self.device.destroy_object(session, handle).map_err(
                        |e| e.context("P11: DestroyObject failed".to_string()),
                    )?;
                }
            }

            info!(
                "Generated {} key [{}] ephemeral: {}",
                curve.name(),
                hex::encode(&ski),
                ephemeral
            );
            Ok(EcdsaPrivateKey::new(EcdsaPublicKey::new(curve, point)))
        })
    }

    /// Returns the device handle of the `class` object with CKA_ID `ski`,
    /// remembering it for later calls
    fn find_key_handle(
        &self,
        session: SessionHandle,
        class: ObjectClass,
        ski: &[u8],
    ) -> Result<ObjectHandle> {
        if let Some(handle) = self.pool.cache(|c| c.lookup_handle(class, ski))
        {
            return Ok(handle);
        }
        match self.device.find_object(session, class, ski)? {
            Some(handle) => {
                self.pool.cache(|c| c.populate_handle(class, ski, handle));
                Ok(handle)
            }
            None => {
                Err(Error::not_found(format!("Key not found [{}]", hex::encode(ski))))
            }
        }
    }

    /// Returns the (public, private) handles of the pair with this SKI
    pub fn find_key_pair_from_ski(
        &self,
        ski: &[u8],
    ) -> Result<(ObjectHandle, ObjectHandle)> {
        self.pool.with_session(|session| {
            let public = self.find_key_handle(session, ObjectClass::Public, ski)?;
            let private =
                self.find_key_handle(session, ObjectClass::Private, ski)?;
            Ok((public, private))
        })
    }

    fn get_ec_key(&self, ski: &[u8]) -> Result<Arc<dyn Key>> {
        self.pool.with_session(|session| {
            let public = self
                .find_key_handle(session, ObjectClass::Public, ski)
                .map_err(|e| {
                    Error::not_found(format!(
                        "Public key not found [{}] for SKI [{}]",
                        e,
                        hex::encode(ski)
                    ))
                })?;
            let is_private =
                match self.find_key_handle(session, ObjectClass::Private, ski) {
                    Ok(_) => true,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e),
                };

            let attrs = self.device.get_attributes(
                session,
                public,
                &[AttributeType::EcParams, AttributeType::EcPoint],
            )?;
            let params = find_attribute(&attrs, AttributeType::EcParams)
                .and_then(|a| a.as_bytes())
                .ok_or(Error::device("CKA_EC_PARAMS not available".to_string()))?;
            let curve = Curve::from_ec_params(params)?;
            let value = find_attribute(&attrs, AttributeType::EcPoint)
                .and_then(|a| a.as_bytes())
                .ok_or(Error::device("CKA_EC_POINT not available".to_string()))?;
            let public = EcdsaPublicKey::new(curve, parse_ec_point(curve, value)?);

            let key: Arc<dyn Key> = if is_private {
                Arc::new(EcdsaPrivateKey::new(public))
            } else {
                Arc::new(public)
            };
            /* still inside the session, so no purge can race with this */
            self.pool.cache(|c| c.populate_key(ski, key.clone()));
            Ok(key)
        })
    }

    /// Raw device signature, before any canonicalization
    pub(crate) fn sign_p11(
        &self,
        key: &EcdsaPrivateKey,
        digest: &[u8],
    ) -> Result<(BigUint, BigUint)> {
        let ski = key.ski();
        let raw = self.pool.with_session(|session| {
            let private = self
                .find_key_handle(session, ObjectClass::Private, &ski)
                .map_err(|e| {
                    if e.is_not_found() {
                        Error::not_found(format!(
                            "Private key not found [{}]",
                            hex::encode(&ski)
                        ))
                    } else {
                        e
                    }
                })?;
            self.device
                .sign(session, private, digest)
                .map_err(|e| e.context("P11: sign failed".to_string()))
        })?;
        split_raw_signature(key.curve(), &raw)
    }

    fn sign_ecdsa(
        &self,
        key: &EcdsaPrivateKey,
        digest: &[u8],
    ) -> Result<Vec<u8>> {
        let (r, s) = self.sign_p11(key, digest)?;
        let s = to_low_s(key.curve(), s);
        marshal_signature(&r, &s)
    }

    fn verify_p11(
        &self,
        key: &EcdsaPublicKey,
        digest: &[u8],
        r: &BigUint,
        s: &BigUint,
    ) -> Result<bool> {
        let raw = match signature_to_raw(key.curve(), r, s) {
            Ok(raw) => raw,
            Err(_) => return Ok(false),
        };
        let ski = key.ski();
        self.pool.with_session(|session| {
            let public = self
                .find_key_handle(session, ObjectClass::Public, &ski)
                .map_err(|e| {
                    e.context(format!(
                        "Public key not found [{}]",
                        hex::encode(&ski)
                    ))
                })?;
            self.device
                .verify(session, public, digest, &raw)
                .map_err(|e| e.context("P11: verify failed".to_string()))
        })
    }

    fn verify_ecdsa(
        &self,
        key: &EcdsaPublicKey,
        signature: &[u8],
        digest: &[u8],
    ) -> Result<bool> {
        let (r, s) = unmarshal_signature(signature)?;
        let curve = key.curve();
        if !is_low_s(curve, &s) {
            return Err(Error::invalid_argument(format!(
                "Invalid S. Must be smaller than half the order [{}][{}]",
                s,
                curve.half_order()
            )));
        }
        if self.software_verify {
            verify_software(curve, key.point(), digest, &r, &s)
        } else {
            self.verify_p11(key, digest, &r, &s)
        }
    }
}

impl CryptoProvider for Provider {
    fn key_gen(&self, opts: &KeyGenOpts) -> Result<Arc<dyn Key>> {
        let curve = match opts {
            KeyGenOpts::Ecdsa { .. } => self.curve,
            KeyGenOpts::EcdsaP256 { .. } => Curve::P256,
            KeyGenOpts::EcdsaP384 { .. } => Curve::P384,
            _ => return self.fallback.key_gen(opts),
        };
        let key = self
            .generate_ec_key(curve, opts.ephemeral())
            .map_err(|e| {
                e.context(format!("Failed generating ECDSA {} key", curve.name()))
            })?;
        Ok(Arc::new(key))
    }

    fn key_deriv(
        &self,
        key: &dyn Key,
        opts: &KeyDerivOpts,
    ) -> Result<Arc<dyn Key>> {
        self.fallback.key_deriv(key, opts)
    }

    fn key_import(
        &self,
        raw: &[u8],
        opts: &KeyImportOpts,
    ) -> Result<Arc<dyn Key>> {
        self.fallback.key_import(raw, opts)
    }

    /// Finds the key with this SKI on the token, then in the fallback
    fn get_key(&self, ski: &[u8]) -> Result<Arc<dyn Key>> {
        if ski.is_empty() {
            return Err(Error::invalid_argument(
                "Failed getting key for SKI [[]]: invalid SKI. Cannot be of zero length"
                    .to_string(),
            ));
        }
        if let Some(key) = self.pool.cache(|c| c.lookup_key(ski)) {
            return Ok(key);
        }
        match self.get_ec_key(ski) {
            Ok(key) => Ok(key),
            Err(e) => {
                debug!("Key [{}] not on the token: {}", hex::encode(ski), e);
                self.fallback.get_key(ski).map_err(|e| {
                    e.context(format!(
                        "Failed getting key for SKI [{}]",
                        hex::encode(ski)
                    ))
                })
            }
        }
    }

    fn hash(&self, msg: &[u8], opts: &HashOpts) -> Result<Vec<u8>> {
        self.fallback.hash(msg, opts)
    }

    fn get_hash(&self, opts: &HashOpts) -> Result<Hasher> {
        self.fallback.get_hash(opts)
    }

    fn sign(&self, key: &dyn Key, digest: &[u8]) -> Result<Vec<u8>> {
        if digest.is_empty() {
            return Err(Error::invalid_argument(
                "Invalid digest. Cannot be empty".to_string(),
            ));
        }
        match key.as_any().downcast_ref::<EcdsaPrivateKey>() {
            Some(k) => self.sign_ecdsa(k, digest),
            None => self.fallback.sign(key, digest),
        }
    }

    fn verify(
        &self,
        key: &dyn Key,
        signature: &[u8],
        digest: &[u8],
    ) -> Result<bool> {
        if signature.is_empty() {
            return Err(Error::invalid_argument(
                "Invalid signature. Cannot be empty".to_string(),
            ));
        }
        if digest.is_empty() {
            return Err(Error::invalid_argument(
                "Invalid digest. Cannot be empty".to_string(),
            ));
        }
        let any = key.as_any();
        if let Some(k) = any.downcast_ref::<EcdsaPrivateKey>() {
            return self.verify_ecdsa(k.public(), signature, digest);
        }
        if let Some(k) = any.downcast_ref::<EcdsaPublicKey>() {
            return self.verify_ecdsa(k, signature, digest);
        }
        self.fallback.verify(key, signature, digest)
    }

    fn encrypt(
        &self,
        key: &dyn Key,
        plaintext: &[u8],
        opts: &EncrypterOpts,
    ) -> Result<Vec<u8>> {
        self.fallback.encrypt(key, plaintext, opts)
    }

    fn decrypt(
        &self,
        key: &dyn Key,
        ciphertext: &[u8],
        opts: &EncrypterOpts,
    ) -> Result<Vec<u8>> {
        self.fallback.decrypt(key, ciphertext, opts)
    }
}
