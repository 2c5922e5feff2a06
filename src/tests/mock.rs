// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! An in-memory token and a minimal software provider for the tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::device::*;
use crate::ec::ecdsa::*;
use crate::ec::{encode_ec_point, parse_ec_point, Curve};
use crate::error::{Error, Result};
use crate::key::*;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384};

pub const MOCK_SLOT: SlotId = SlotId(1);

#[derive(Clone, Debug)]
enum Secret {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

#[derive(Clone, Debug)]
struct MockObject {
    attrs: Vec<Attribute>,
    secret: Option<Secret>,
    /* session objects die with the session that created them */
    owner: Option<SessionHandle>,
}

impl MockObject {
    fn get(&self, atype: AttributeType) -> Option<&Attribute> {
        find_attribute(&self.attrs, atype)
    }

    fn set(&mut self, attr: Attribute) {
        let atype = attr.attribute_type();
        self.attrs.retain(|a| a.attribute_type() != atype);
        self.attrs.push(attr);
    }

    fn modifiable(&self) -> bool {
        self.get(AttributeType::Modifiable)
            .and_then(|a| a.as_bool())
            .unwrap_or(true)
    }

    fn token(&self) -> bool {
        self.get(AttributeType::Token)
            .and_then(|a| a.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct MockState {
    sessions: HashSet<SessionHandle>,
    objects: BTreeMap<u64, MockObject>,
    next_session: u64,
    next_object: u64,
}

/// A token holding EC keys in memory
#[derive(Debug)]
pub struct MockDevice {
    label: String,
    pin: String,
    state: Mutex<MockState>,
    open_attempts: AtomicUsize,
    fail_open: AtomicBool,
    high_s: AtomicBool,
}

impl MockDevice {
    pub fn new(label: &str, pin: &str) -> MockDevice {
        MockDevice {
            label: label.to_string(),
            pin: pin.to_string(),
            state: Mutex::new(MockState {
                next_session: 1,
                next_object: 1,
                ..Default::default()
            }),
            open_attempts: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            high_s: AtomicBool::new(false),
        }
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn reset_open_attempts(&self) {
        self.open_attempts.store(0, Ordering::SeqCst);
    }

    /// Makes every following session open fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Makes the token return the high-S form of every signature
    pub fn set_high_s(&self, high: bool) {
        self.high_s.store(high, Ordering::SeqCst);
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Simulates a token reset: every open session becomes invalid
    pub fn invalidate_sessions(&self) {
        let mut state = self.state.lock().unwrap();
        state.sessions.clear();
        state.objects.retain(|_, o| o.owner.is_none());
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Returns the handles of the objects with CKA_ID `id`
    pub fn objects_with_id(&self, id: &[u8]) -> Vec<ObjectHandle> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(_, o)| {
                o.get(AttributeType::Id).and_then(|a| a.as_bytes()) == Some(id)
            })
            .map(|(h, _)| ObjectHandle(*h))
            .collect()
    }

    pub fn attribute(
        &self,
        handle: ObjectHandle,
        atype: AttributeType,
    ) -> Option<Attribute> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&handle.0)
            .and_then(|o| o.get(atype).cloned())
    }

    /// Removes objects behind the back of any session
    pub fn remove_objects(&self, class: ObjectClass, id: &[u8]) {
        self.state.lock().unwrap().objects.retain(|_, o| {
            o.get(AttributeType::Class) != Some(&Attribute::Class(class))
                || o.get(AttributeType::Id).and_then(|a| a.as_bytes())
                    != Some(id)
        });
    }

    fn check_session(state: &MockState, session: SessionHandle) -> Result<()> {
        if state.sessions.contains(&session) {
            Ok(())
        } else {
            Err(Error::device("CKR_SESSION_HANDLE_INVALID".to_string()))
        }
    }

    fn object(state: &MockState, handle: ObjectHandle) -> Result<&MockObject> {
        state
            .objects
            .get(&handle.0)
            .ok_or(Error::device("CKR_OBJECT_HANDLE_INVALID".to_string()))
    }

    fn insert(
        state: &mut MockState,
        session: SessionHandle,
        mut object: MockObject,
    ) -> ObjectHandle {
        object.owner = if object.token() { None } else { Some(session) };
        let handle = state.next_object;
        state.next_object += 1;
        state.objects.insert(handle, object);
        ObjectHandle(handle)
    }
}

impl Device for MockDevice {
    fn find_slot(&self, label: &str) -> Result<SlotId> {
        if label == self.label {
            Ok(MOCK_SLOT)
        } else {
            Err(Error::config(format!(
                "could not find token with label {}",
                label
            )))
        }
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::device("CKR_TOKEN_NOT_PRESENT".to_string()));
        }
        if slot != MOCK_SLOT {
            return Err(Error::device("CKR_SLOT_ID_INVALID".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let session = SessionHandle(state.next_session);
        state.next_session += 1;
        state.sessions.insert(session);
        Ok(session)
    }

    fn close_session(&self, session: SessionHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.remove(&session) {
            return Err(Error::device("CKR_SESSION_HANDLE_INVALID".to_string()));
        }
        state.objects.retain(|_, o| o.owner != Some(session));
        Ok(())
    }

    fn login(&self, session: SessionHandle, pin: &str) -> Result<()> {
        let state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        if pin != self.pin {
            return Err(Error::device("CKR_PIN_INCORRECT".to_string()));
        }
        Ok(())
    }

    fn find_object(
        &self,
        session: SessionHandle,
        class: ObjectClass,
        id: &[u8],
    ) -> Result<Option<ObjectHandle>> {
        let state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        Ok(state
            .objects
            .iter()
            .find(|(_, o)| {
                o.get(AttributeType::Class) == Some(&Attribute::Class(class))
                    && o.get(AttributeType::Id).and_then(|a| a.as_bytes())
                        == Some(id)
            })
            .map(|(h, _)| ObjectHandle(*h)))
    }

    fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>> {
        let state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        let obj = MockDevice::object(&state, object)?;
        Ok(types.iter().filter_map(|t| obj.get(*t).cloned()).collect())
    }

    fn set_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attrs: &[Attribute],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        let obj = match state.objects.get_mut(&object.0) {
            Some(o) => o,
            None => {
                return Err(Error::device(
                    "CKR_OBJECT_HANDLE_INVALID".to_string(),
                ))
            }
        };
        if !obj.modifiable() {
            return Err(Error::device("CKR_ATTRIBUTE_READ_ONLY".to_string()));
        }
        for attr in attrs {
            obj.set(attr.clone());
        }
        Ok(())
    }

    fn copy_object(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        template: &[Attribute],
    ) -> Result<ObjectHandle> {
        let mut state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        let mut copy = MockDevice::object(&state, object)?.clone();
        for attr in template {
            copy.set(attr.clone());
        }
        Ok(MockDevice::insert(&mut state, session, copy))
    }

    fn destroy_object(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        match state.objects.remove(&object.0) {
            Some(_) => Ok(()),
            None => Err(Error::device("CKR_OBJECT_HANDLE_INVALID".to_string())),
        }
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle)> {
        let params = find_attribute(public_template, AttributeType::EcParams)
            .and_then(|a| a.as_bytes())
            .ok_or(Error::device("CKR_TEMPLATE_INCOMPLETE".to_string()))?;
        let (secret, point) = match Curve::from_ec_params(params)? {
            Curve::P256 => {
                let sk =
                    p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
                let point = sk.verifying_key().to_encoded_point(false);
                (Secret::P256(sk), point.as_bytes().to_vec())
            }
            Curve::P384 => {
                let sk =
                    p384::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
                let point = sk.verifying_key().to_encoded_point(false);
                (Secret::P384(sk), point.as_bytes().to_vec())
            }
            _ => return Err(Error::device("CKR_CURVE_NOT_SUPPORTED".to_string())),
        };

        let mut public = MockObject {
            attrs: public_template.to_vec(),
            secret: None,
            owner: None,
        };
        public.set(Attribute::EcPoint(encode_ec_point(&point)?));
        let mut private = MockObject {
            attrs: private_template.to_vec(),
            secret: Some(secret),
            owner: None,
        };
        private.set(Attribute::EcParams(params.to_vec()));

        let mut state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        let public = MockDevice::insert(&mut state, session, public);
        let private = MockDevice::insert(&mut state, session, private);
        Ok((public, private))
    }

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        digest: &[u8],
    ) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        let (curve, raw) = match &MockDevice::object(&state, key)?.secret {
            Some(Secret::P256(sk)) => {
                let sig: p256::ecdsa::Signature = sk
                    .sign_prehash(digest)
                    .map_err(|_| Error::device("CKR_DATA_INVALID".to_string()))?;
                (Curve::P256, sig.to_bytes().to_vec())
            }
            Some(Secret::P384(sk)) => {
                let sig: p384::ecdsa::Signature = sk
                    .sign_prehash(digest)
                    .map_err(|_| Error::device("CKR_DATA_INVALID".to_string()))?;
                (Curve::P384, sig.to_bytes().to_vec())
            }
            None => {
                return Err(Error::device(
                    "CKR_KEY_FUNCTION_NOT_PERMITTED".to_string(),
                ))
            }
        };
        if !self.high_s.load(Ordering::SeqCst) {
            return Ok(raw);
        }
        let (r, s) = split_raw_signature(curve, &raw)?;
        let s = if is_low_s(curve, &s) {
            curve.order() - s
        } else {
            s
        };
        signature_to_raw(curve, &r, &s)
    }

    fn verify(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let state = self.state.lock().unwrap();
        MockDevice::check_session(&state, session)?;
        let obj = MockDevice::object(&state, key)?;
        let params = obj
            .get(AttributeType::EcParams)
            .and_then(|a| a.as_bytes())
            .ok_or(Error::device("CKR_KEY_TYPE_INCONSISTENT".to_string()))?;
        let curve = Curve::from_ec_params(params)?;
        let point = obj
            .get(AttributeType::EcPoint)
            .and_then(|a| a.as_bytes())
            .ok_or(Error::device("CKR_KEY_TYPE_INCONSISTENT".to_string()))?;
        let point = parse_ec_point(curve, point)?;
        if signature.len() != 2 * curve.byte_size() {
            return Err(Error::device("CKR_SIGNATURE_LEN_RANGE".to_string()));
        }
        let (r, s) = match split_raw_signature(curve, signature) {
            Ok(rs) => rs,
            Err(_) => return Ok(false),
        };
        verify_software(curve, &point, digest, &r, &s)
    }
}

/// A token that numbers sessions the way softhsm does, giving closed
/// numbers back before fresh ones
///
/// Once armed with [ReuseDevice::park_next_close], the next
/// `close_session` frees its number and then blocks until another session
/// has been opened.
#[derive(Debug, Default)]
pub struct ReuseDevice {
    state: Mutex<ReuseState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct ReuseState {
    next: u64,
    free: Vec<u64>,
    parked: bool,
    reopened: bool,
}

impl ReuseDevice {
    pub fn park_next_close(&self) {
        let mut state = self.state.lock().unwrap();
        state.parked = true;
        state.reopened = false;
    }

    /// Waits until some closed session number is available again
    pub fn wait_for_free(&self) {
        let mut state = self.state.lock().unwrap();
        while state.free.is_empty() {
            state = self.cond.wait(state).unwrap();
        }
    }

    fn unsupported() -> Error {
        Error::device("CKR_FUNCTION_NOT_SUPPORTED".to_string())
    }
}

impl Device for ReuseDevice {
    fn find_slot(&self, _label: &str) -> Result<SlotId> {
        Ok(MOCK_SLOT)
    }

    fn open_session(&self, _slot: SlotId) -> Result<SessionHandle> {
        let mut state = self.state.lock().unwrap();
        let number = match state.free.pop() {
            Some(n) => n,
            None => {
                state.next += 1;
                state.next
            }
        };
        state.reopened = true;
        self.cond.notify_all();
        Ok(SessionHandle(number))
    }

    fn close_session(&self, session: SessionHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.free.push(session.0);
        self.cond.notify_all();
        if state.parked {
            state.parked = false;
            while !state.reopened {
                state = self.cond.wait(state).unwrap();
            }
        }
        Ok(())
    }

    fn login(&self, _session: SessionHandle, _pin: &str) -> Result<()> {
        Ok(())
    }

    fn find_object(
        &self,
        _session: SessionHandle,
        _class: ObjectClass,
        _id: &[u8],
    ) -> Result<Option<ObjectHandle>> {
        Ok(None)
    }

    fn get_attributes(
        &self,
        _session: SessionHandle,
        _object: ObjectHandle,
        _types: &[AttributeType],
    ) -> Result<Vec<Attribute>> {
        Err(ReuseDevice::unsupported())
    }

    fn set_attributes(
        &self,
        _session: SessionHandle,
        _object: ObjectHandle,
        _attrs: &[Attribute],
    ) -> Result<()> {
        Err(ReuseDevice::unsupported())
    }

    fn copy_object(
        &self,
        _session: SessionHandle,
        _object: ObjectHandle,
        _template: &[Attribute],
    ) -> Result<ObjectHandle> {
        Err(ReuseDevice::unsupported())
    }

    fn destroy_object(
        &self,
        _session: SessionHandle,
        _object: ObjectHandle,
    ) -> Result<()> {
        Err(ReuseDevice::unsupported())
    }

    fn generate_key_pair(
        &self,
        _session: SessionHandle,
        _public_template: &[Attribute],
        _private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle)> {
        Err(ReuseDevice::unsupported())
    }

    fn sign(
        &self,
        _session: SessionHandle,
        _key: ObjectHandle,
        _digest: &[u8],
    ) -> Result<Vec<u8>> {
        Err(ReuseDevice::unsupported())
    }

    fn verify(
        &self,
        _session: SessionHandle,
        _key: ObjectHandle,
        _digest: &[u8],
        _signature: &[u8],
    ) -> Result<bool> {
        Err(ReuseDevice::unsupported())
    }
}

/// A symmetric key held by [MockFallback]
#[derive(Debug)]
pub struct AesKey {
    key: Vec<u8>,
}

impl Key for AesKey {
    fn bytes(&self) -> Result<Vec<u8>> {
        Err(Error::unsupported("Not supported.".to_string()))
    }

    fn ski(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update([0x01]);
        hasher.update(&self.key);
        hasher.finalize().to_vec()
    }

    fn symmetric(&self) -> bool {
        true
    }

    fn private(&self) -> bool {
        true
    }

    fn public_key(&self) -> Result<Arc<dyn Key>> {
        Err(Error::unsupported(
            "Cannot call this method on a symmetric key.".to_string(),
        ))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Software provider handling symmetric keys and hashes
#[derive(Debug, Default)]
pub struct MockFallback {
    keys: Mutex<HashMap<Vec<u8>, Arc<dyn Key>>>,
    calls: AtomicUsize,
}

impl MockFallback {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn called(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn store(&self, key: Vec<u8>, ephemeral: bool) -> Arc<dyn Key> {
        let key: Arc<dyn Key> = Arc::new(AesKey { key: key });
        if !ephemeral {
            self.keys.lock().unwrap().insert(key.ski(), key.clone());
        }
        key
    }

    fn aes_key<'a>(&self, key: &'a dyn Key) -> Result<&'a AesKey> {
        key.as_any()
            .downcast_ref::<AesKey>()
            .ok_or(Error::unsupported("Unsupported key type".to_string()))
    }

    fn keystream(key: &AesKey, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(key.key.iter().cycle())
            .map(|(d, k)| d ^ k)
            .collect()
    }
}

impl CryptoProvider for MockFallback {
    fn key_gen(&self, opts: &KeyGenOpts) -> Result<Arc<dyn Key>> {
        self.called();
        let len = match opts {
            KeyGenOpts::Aes128 { .. } => 16,
            KeyGenOpts::Aes192 { .. } => 24,
            KeyGenOpts::Aes256 { .. } => 32,
            _ => return Err(Error::unsupported("Unsupported key type".to_string())),
        };
        let mut key = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut key);
        Ok(self.store(key, opts.ephemeral()))
    }

    fn key_deriv(
        &self,
        key: &dyn Key,
        opts: &KeyDerivOpts,
    ) -> Result<Arc<dyn Key>> {
        self.called();
        let aes = self.aes_key(key)?;
        match opts {
            KeyDerivOpts::Hmac { ephemeral, arg } => {
                let mut hasher = Sha256::new();
                hasher.update(&aes.key);
                hasher.update(arg);
                Ok(self.store(hasher.finalize().to_vec(), *ephemeral))
            }
            _ => Err(Error::unsupported("Unsupported derivation".to_string())),
        }
    }

    fn key_import(
        &self,
        raw: &[u8],
        opts: &KeyImportOpts,
    ) -> Result<Arc<dyn Key>> {
        self.called();
        match opts {
            KeyImportOpts::Aes256 { ephemeral } => {
                if raw.len() != 32 {
                    return Err(Error::invalid_argument(
                        "Invalid Key Length".to_string(),
                    ));
                }
                Ok(self.store(raw.to_vec(), *ephemeral))
            }
            _ => Err(Error::unsupported("Unsupported import".to_string())),
        }
    }

    fn get_key(&self, ski: &[u8]) -> Result<Arc<dyn Key>> {
        self.called();
        match self.keys.lock().unwrap().get(ski) {
            Some(k) => Ok(k.clone()),
            None => Err(Error::not_found(format!(
                "Key with SKI {} not found",
                hex::encode(ski)
            ))),
        }
    }

    fn hash(&self, msg: &[u8], opts: &HashOpts) -> Result<Vec<u8>> {
        self.called();
        match opts {
            HashOpts::Sha | HashOpts::Sha256 => Ok(Sha256::digest(msg).to_vec()),
            HashOpts::Sha384 => Ok(Sha384::digest(msg).to_vec()),
            _ => Err(Error::unsupported("Unsupported hash".to_string())),
        }
    }

    fn get_hash(&self, opts: &HashOpts) -> Result<Hasher> {
        self.called();
        match opts {
            HashOpts::Sha | HashOpts::Sha256 => Ok(Box::new(Sha256::new())),
            HashOpts::Sha384 => Ok(Box::new(Sha384::new())),
            _ => Err(Error::unsupported("Unsupported hash".to_string())),
        }
    }

    fn sign(&self, _key: &dyn Key, _digest: &[u8]) -> Result<Vec<u8>> {
        self.called();
        Err(Error::unsupported("Unsupported 'SignKey' provided".to_string()))
    }

    fn verify(
        &self,
        _key: &dyn Key,
        _signature: &[u8],
        _digest: &[u8],
    ) -> Result<bool> {
        self.called();
        Err(Error::unsupported(
            "Unsupported 'VerifyKey' provided".to_string(),
        ))
    }

    fn encrypt(
        &self,
        key: &dyn Key,
        plaintext: &[u8],
        _opts: &EncrypterOpts,
    ) -> Result<Vec<u8>> {
        self.called();
        Ok(MockFallback::keystream(self.aes_key(key)?, plaintext))
    }

    fn decrypt(
        &self,
        key: &dyn Key,
        ciphertext: &[u8],
        _opts: &EncrypterOpts,
    ) -> Result<Vec<u8>> {
        self.called();
        Ok(MockFallback::keystream(self.aes_key(key)?, ciphertext))
    }
}
