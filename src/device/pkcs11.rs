// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! [Device] implementation on top of a PKCS#11 shared library, driven
//! through the `cryptoki` crate

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::*;
use crate::error::{Error, ErrorKind, Result};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CkError, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object;
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use log::debug;

fn ck_class(class: ObjectClass) -> object::ObjectClass {
    match class {
        ObjectClass::Public => object::ObjectClass::PUBLIC_KEY,
        ObjectClass::Private => object::ObjectClass::PRIVATE_KEY,
    }
}

fn to_ck_attribute(attr: &Attribute) -> object::Attribute {
    match attr {
        Attribute::Class(c) => object::Attribute::Class(ck_class(*c)),
        Attribute::KeyType(KeyType::Ec) => {
            object::Attribute::KeyType(object::KeyType::EC)
        }
        Attribute::Token(b) => object::Attribute::Token(*b),
        Attribute::Private(b) => object::Attribute::Private(*b),
        Attribute::Modifiable(b) => object::Attribute::Modifiable(*b),
        Attribute::Extractable(b) => object::Attribute::Extractable(*b),
        Attribute::Sensitive(b) => object::Attribute::Sensitive(*b),
        Attribute::Sign(b) => object::Attribute::Sign(*b),
        Attribute::Verify(b) => object::Attribute::Verify(*b),
        Attribute::Id(v) => object::Attribute::Id(v.clone()),
        Attribute::Label(v) => object::Attribute::Label(v.clone()),
        Attribute::EcParams(v) => object::Attribute::EcParams(v.clone()),
        Attribute::EcPoint(v) => object::Attribute::EcPoint(v.clone()),
    }
}

fn to_ck_attribute_type(atype: AttributeType) -> object::AttributeType {
    match atype {
        AttributeType::Class => object::AttributeType::Class,
        AttributeType::KeyType => object::AttributeType::KeyType,
        AttributeType::Token => object::AttributeType::Token,
        AttributeType::Private => object::AttributeType::Private,
        AttributeType::Modifiable => object::AttributeType::Modifiable,
        AttributeType::Extractable => object::AttributeType::Extractable,
        AttributeType::Sensitive => object::AttributeType::Sensitive,
        AttributeType::Sign => object::AttributeType::Sign,
        AttributeType::Verify => object::AttributeType::Verify,
        AttributeType::Id => object::AttributeType::Id,
        AttributeType::Label => object::AttributeType::Label,
        AttributeType::EcParams => object::AttributeType::EcParams,
        AttributeType::EcPoint => object::AttributeType::EcPoint,
    }
}

/* Attributes we do not model are silently dropped */
fn from_ck_attribute(attr: object::Attribute) -> Option<Attribute> {
    match attr {
        object::Attribute::Class(c) => {
            if c == object::ObjectClass::PUBLIC_KEY {
                Some(Attribute::Class(ObjectClass::Public))
            } else if c == object::ObjectClass::PRIVATE_KEY {
                Some(Attribute::Class(ObjectClass::Private))
            } else {
                None
            }
        }
        object::Attribute::KeyType(k) => {
            if k == object::KeyType::EC {
                Some(Attribute::KeyType(KeyType::Ec))
            } else {
                None
            }
        }
        object::Attribute::Token(b) => Some(Attribute::Token(b)),
        object::Attribute::Private(b) => Some(Attribute::Private(b)),
        object::Attribute::Modifiable(b) => Some(Attribute::Modifiable(b)),
        object::Attribute::Extractable(b) => Some(Attribute::Extractable(b)),
        object::Attribute::Sensitive(b) => Some(Attribute::Sensitive(b)),
        object::Attribute::Sign(b) => Some(Attribute::Sign(b)),
        object::Attribute::Verify(b) => Some(Attribute::Verify(b)),
        object::Attribute::Id(v) => Some(Attribute::Id(v)),
        object::Attribute::Label(v) => Some(Attribute::Label(v)),
        object::Attribute::EcParams(v) => Some(Attribute::EcParams(v)),
        object::Attribute::EcPoint(v) => Some(Attribute::EcPoint(v)),
        _ => None,
    }
}

/// A token reached through a PKCS#11 module
///
/// `cryptoki` sessions and object handles cannot be rebuilt from raw
/// numbers, so this device keeps its own tables mapping the numbers it
/// hands out to the live `cryptoki` objects. A number missing from the
/// tables is reported exactly as the token would report a stale handle.
pub struct Pkcs11Device {
    ctx: Pkcs11,
    sessions: Mutex<HashMap<u64, Arc<Mutex<Session>>>>,
    objects: Mutex<HashMap<u64, object::ObjectHandle>>,
    next_session: AtomicU64,
    next_object: AtomicU64,
}

impl fmt::Debug for Pkcs11Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pkcs11Device")
            .field("next_session", &self.next_session)
            .finish()
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::device("pkcs11: lock poisoned".to_string())
}

impl Pkcs11Device {
    /// Loads and initializes the PKCS#11 module at `library`
    pub fn new(library: &str) -> Result<Pkcs11Device> {
        if library.is_empty() {
            return Err(Error::config(
                "pkcs11: library path not provided".to_string(),
            ));
        }
        let ctx = Pkcs11::new(library).map_err(|e| {
            Error::with_origin(
                ErrorKind::Configuration,
                format!("pkcs11: instantiation failed for {}", library),
                e,
            )
        })?;
        match ctx.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => (),
            Err(CkError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
                debug!("pkcs11 module {} already initialized", library)
            }
            Err(e) => {
                return Err(Error::with_origin(
                    ErrorKind::Configuration,
                    "pkcs11: initialization failed".to_string(),
                    e,
                ))
            }
        }
        Ok(Pkcs11Device {
            ctx: ctx,
            sessions: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
        })
    }

    fn slot(&self, slot: SlotId) -> Result<Slot> {
        match self.ctx.get_all_slots()?.into_iter().find(|s| s.id() == slot.0)
        {
            Some(s) => Ok(s),
            None => Err(Error::device("CKR_SLOT_ID_INVALID".to_string())),
        }
    }

    fn session(&self, session: SessionHandle) -> Result<Arc<Mutex<Session>>> {
        match self.sessions.lock().map_err(poisoned)?.get(&session.0) {
            Some(s) => Ok(s.clone()),
            None => {
                Err(Error::device("CKR_SESSION_HANDLE_INVALID".to_string()))
            }
        }
    }

    /* runs f with the cryptoki session behind `session` */
    fn with_session<T, F>(&self, session: SessionHandle, f: F) -> Result<T>
    where
        F: FnOnce(&MutexGuard<'_, Session>) -> Result<T>,
    {
        let sess = self.session(session)?;
        let guard = sess.lock().map_err(poisoned)?;
        f(&guard)
    }

    /* the same token object always maps to the same number */
    fn register(&self, handle: object::ObjectHandle) -> Result<ObjectHandle> {
        let mut objects = self.objects.lock().map_err(poisoned)?;
        if let Some((num, _)) = objects.iter().find(|(_, h)| **h == handle) {
            return Ok(ObjectHandle(*num));
        }
        let num = self.next_object.fetch_add(1, Ordering::Relaxed);
        objects.insert(num, handle);
        Ok(ObjectHandle(num))
    }

    fn object(&self, object: ObjectHandle) -> Result<object::ObjectHandle> {
        match self.objects.lock().map_err(poisoned)?.get(&object.0) {
            Some(o) => Ok(*o),
            None => {
                Err(Error::device("CKR_OBJECT_HANDLE_INVALID".to_string()))
            }
        }
    }
}

impl Device for Pkcs11Device {
    fn find_slot(&self, label: &str) -> Result<SlotId> {
        for slot in self.ctx.get_slots_with_token()? {
            let info = self.ctx.get_token_info(slot)?;
            if info.label().trim_end() == label {
                return Ok(SlotId(slot.id()));
            }
        }
        Err(Error::config(format!(
            "could not find token with label {}",
            label
        )))
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle> {
        let session = self.ctx.open_rw_session(self.slot(slot)?)?;
        let num = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .map_err(poisoned)?
            .insert(num, Arc::new(Mutex::new(session)));
        Ok(SessionHandle(num))
    }

    fn close_session(&self, session: SessionHandle) -> Result<()> {
        /* dropping the last reference closes the cryptoki session */
        match self.sessions.lock().map_err(poisoned)?.remove(&session.0) {
            Some(_) => Ok(()),
            None => {
                Err(Error::device("CKR_SESSION_HANDLE_INVALID".to_string()))
            }
        }
    }

    fn login(&self, session: SessionHandle, pin: &str) -> Result<()> {
        let pin = AuthPin::new(pin.into());
        self.with_session(session, |s| {
            match s.login(UserType::User, Some(&pin)) {
                Ok(()) => Ok(()),
                Err(CkError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn find_object(
        &self,
        session: SessionHandle,
        class: ObjectClass,
        id: &[u8],
    ) -> Result<Option<ObjectHandle>> {
        let template = [
            object::Attribute::Class(ck_class(class)),
            object::Attribute::Id(id.to_vec()),
        ];
        let found = self.with_session(session, |s| {
            Ok(s.find_objects(&template)?)
        })?;
        match found.into_iter().next() {
            Some(h) => Ok(Some(self.register(h)?)),
            None => Ok(None),
        }
    }

    fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>> {
        let handle = self.object(object)?;
        let types: Vec<object::AttributeType> =
            types.iter().map(|t| to_ck_attribute_type(*t)).collect();
        let attrs = self.with_session(session, |s| {
            Ok(s.get_attributes(handle, &types)?)
        })?;
        Ok(attrs.into_iter().filter_map(from_ck_attribute).collect())
    }

    fn set_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attrs: &[Attribute],
    ) -> Result<()> {
        let handle = self.object(object)?;
        let template: Vec<object::Attribute> =
            attrs.iter().map(to_ck_attribute).collect();
        self.with_session(session, |s| {
            Ok(s.update_attributes(handle, &template)?)
        })
    }

    fn copy_object(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        template: &[Attribute],
    ) -> Result<ObjectHandle> {
        let handle = self.object(object)?;
        let template: Vec<object::Attribute> =
            template.iter().map(to_ck_attribute).collect();
        let copy = self.with_session(session, |s| {
            Ok(s.copy_object(handle, &template)?)
        })?;
        self.register(copy)
    }

    fn destroy_object(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
    ) -> Result<()> {
        let handle = self.object(object)?;
        self.with_session(session, |s| Ok(s.destroy_object(handle)?))?;
        self.objects.lock().map_err(poisoned)?.remove(&object.0);
        Ok(())
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle)> {
        let public: Vec<object::Attribute> =
            public_template.iter().map(to_ck_attribute).collect();
        let private: Vec<object::Attribute> =
            private_template.iter().map(to_ck_attribute).collect();
        let (pubh, privh) = self.with_session(session, |s| {
            Ok(s.generate_key_pair(&Mechanism::EccKeyPairGen, &public, &private)?)
        })?;
        Ok((self.register(pubh)?, self.register(privh)?))
    }

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        digest: &[u8],
    ) -> Result<Vec<u8>> {
        let handle = self.object(key)?;
        self.with_session(session, |s| {
            Ok(s.sign(&Mechanism::Ecdsa, handle, digest)?)
        })
    }

    fn verify(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let handle = self.object(key)?;
        self.with_session(session, |s| {
            match s.verify(&Mechanism::Ecdsa, handle, digest, signature) {
                Ok(()) => Ok(true),
                Err(CkError::Pkcs11(RvError::SignatureInvalid, _)) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }
}
