// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! This module defines the boundary with the hardware token
//!
//! The [Device] trait is the only way the provider talks to the token.
//! Every call is synchronous and may fail at any time; handles returned
//! by the device are plain numbers that can become stale without notice,
//! so callers find out about invalid handles only when they use them.

use std::fmt::Debug;

use crate::error::Result;

pub mod pkcs11;

/// Identifies a slot of the token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(pub u64);

/// An open device session, as numbered by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

/// A device object, valid only as long as the device says so
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

/// The role of a key object on the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// CKO_PUBLIC_KEY
    Public,
    /// CKO_PRIVATE_KEY
    Private,
}

/// Key types understood by the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    /// CKK_EC
    Ec,
}

/// The subset of object attributes the provider reads and writes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attribute {
    /// CKA_CLASS
    Class(ObjectClass),
    /// CKA_KEY_TYPE
    KeyType(KeyType),
    /// CKA_TOKEN, false for session objects
    Token(bool),
    /// CKA_PRIVATE
    Private(bool),
    /// CKA_MODIFIABLE
    Modifiable(bool),
    /// CKA_EXTRACTABLE
    Extractable(bool),
    /// CKA_SENSITIVE
    Sensitive(bool),
    /// CKA_SIGN
    Sign(bool),
    /// CKA_VERIFY
    Verify(bool),
    /// CKA_ID, the SKI once a key pair is finalized
    Id(Vec<u8>),
    /// CKA_LABEL
    Label(Vec<u8>),
    /// CKA_EC_PARAMS, the DER encoded curve OID
    EcParams(Vec<u8>),
    /// CKA_EC_POINT, DER OCTET STRING wrapped or raw
    EcPoint(Vec<u8>),
}

/// Attribute selectors for [Device::get_attributes]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeType {
    /// Selects [Attribute::Class]
    Class,
    /// Selects [Attribute::KeyType]
    KeyType,
    /// Selects [Attribute::Token]
    Token,
    /// Selects [Attribute::Private]
    Private,
    /// Selects [Attribute::Modifiable]
    Modifiable,
    /// Selects [Attribute::Extractable]
    Extractable,
    /// Selects [Attribute::Sensitive]
    Sensitive,
    /// Selects [Attribute::Sign]
    Sign,
    /// Selects [Attribute::Verify]
    Verify,
    /// Selects [Attribute::Id]
    Id,
    /// Selects [Attribute::Label]
    Label,
    /// Selects [Attribute::EcParams]
    EcParams,
    /// Selects [Attribute::EcPoint]
    EcPoint,
}

impl Attribute {
    /// The selector matching this attribute
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::Class,
            Attribute::KeyType(_) => AttributeType::KeyType,
            Attribute::Token(_) => AttributeType::Token,
            Attribute::Private(_) => AttributeType::Private,
            Attribute::Modifiable(_) => AttributeType::Modifiable,
            Attribute::Extractable(_) => AttributeType::Extractable,
            Attribute::Sensitive(_) => AttributeType::Sensitive,
            Attribute::Sign(_) => AttributeType::Sign,
            Attribute::Verify(_) => AttributeType::Verify,
            Attribute::Id(_) => AttributeType::Id,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::EcParams(_) => AttributeType::EcParams,
            Attribute::EcPoint(_) => AttributeType::EcPoint,
        }
    }

    /// The value of byte string attributes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Attribute::Id(v)
            | Attribute::Label(v)
            | Attribute::EcParams(v)
            | Attribute::EcPoint(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attribute::Token(b)
            | Attribute::Private(b)
            | Attribute::Modifiable(b)
            | Attribute::Extractable(b)
            | Attribute::Sensitive(b)
            | Attribute::Sign(b)
            | Attribute::Verify(b) => Some(*b),
            _ => None,
        }
    }
}

/// Finds the attribute of type `atype` in a list returned by the device
pub fn find_attribute(
    attrs: &[Attribute],
    atype: AttributeType,
) -> Option<&Attribute> {
    attrs.iter().find(|a| a.attribute_type() == atype)
}

/// The operations the provider needs from a PKCS#11 class token
pub trait Device: Debug + Send + Sync {
    /// Returns the slot holding the token with the given label
    fn find_slot(&self, label: &str) -> Result<SlotId>;

    /// Opens a read/write session on the slot
    fn open_session(&self, slot: SlotId) -> Result<SessionHandle>;

    /// Closes a session, any session objects it owns go with it
    fn close_session(&self, session: SessionHandle) -> Result<()>;

    /// Logs the user in; a session already logged in is not an error
    fn login(&self, session: SessionHandle, pin: &str) -> Result<()>;

    /// Returns the first key object of `class` whose CKA_ID is `id`
    fn find_object(
        &self,
        session: SessionHandle,
        class: ObjectClass,
        id: &[u8],
    ) -> Result<Option<ObjectHandle>>;

    /// Reads the requested attributes, skipping unavailable ones
    fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>>;

    /// Updates attributes of an existing object
    fn set_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attrs: &[Attribute],
    ) -> Result<()>;

    /// Copies an object, overriding the attributes in `template`
    fn copy_object(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        template: &[Attribute],
    ) -> Result<ObjectHandle>;

    /// Deletes an object from the device
    fn destroy_object(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
    ) -> Result<()>;

    /// Generates an EC key pair, returns (public, private)
    fn generate_key_pair(
        &self,
        session: SessionHandle,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle)>;

    /// Raw ECDSA over a digest, the output is R || S
    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        digest: &[u8],
    ) -> Result<Vec<u8>>;

    /// Raw ECDSA verification of R || S, a bad signature returns false
    fn verify(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<bool>;
}
