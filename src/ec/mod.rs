// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! This module provides the Elliptic Curve parameters the provider works
//! with, and the helpers to move EC public points in and out of the
//! device encoding

use crate::error::{Error, Result};

use asn1;
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

pub mod ecdsa;

/// id-ecPublicKey
pub const EC_PUBLIC_KEY: asn1::ObjectIdentifier =
    asn1::oid!(1, 2, 840, 10045, 2, 1);
/// secp224r1, NIST P-224
pub const EC_SECP224R1: asn1::ObjectIdentifier = asn1::oid!(1, 3, 132, 0, 33);
/// prime256v1, NIST P-256
pub const EC_SECP256R1: asn1::ObjectIdentifier =
    asn1::oid!(1, 2, 840, 10045, 3, 1, 7);
/// secp384r1, NIST P-384
pub const EC_SECP384R1: asn1::ObjectIdentifier = asn1::oid!(1, 3, 132, 0, 34);
/// secp521r1, NIST P-521
pub const EC_SECP521R1: asn1::ObjectIdentifier = asn1::oid!(1, 3, 132, 0, 35);

/* Group orders, big endian */
const P224_ORDER: [u8; 28] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0x16, 0xa2, 0xe0, 0xb8, 0xf0, 0x3e, 0x13, 0xdd, 0x29, 0x45,
    0x5c, 0x5c, 0x2a, 0x3d,
];
const P256_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xbc, 0xe6, 0xfa, 0xad, 0xa7, 0x17, 0x9e, 0x84,
    0xf3, 0xb9, 0xca, 0xc2, 0xfc, 0x63, 0x25, 0x51,
];
const P384_ORDER: [u8; 48] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xc7, 0x63, 0x4d, 0x81, 0xf4, 0x37, 0x2d, 0xdf, 0x58, 0x1a, 0x0d, 0xb2,
    0x48, 0xb0, 0xa7, 0x7a, 0xec, 0xec, 0x19, 0x6a, 0xcc, 0xc5, 0x29, 0x73,
];
const P521_ORDER: [u8; 66] = [
    0x01, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfa, 0x51, 0x86,
    0x87, 0x83, 0xbf, 0x2f, 0x96, 0x6b, 0x7f, 0xcc, 0x01, 0x48, 0xf7, 0x09,
    0xa5, 0xd0, 0x3b, 0xb5, 0xc9, 0xb8, 0x89, 0x9c, 0x47, 0xae, 0xbb, 0x6f,
    0xb7, 0x1e, 0x91, 0x38, 0x64, 0x09,
];

static ORDER_P224: Lazy<BigUint> =
    Lazy::new(|| BigUint::from_bytes_be(&P224_ORDER));
static ORDER_P256: Lazy<BigUint> =
    Lazy::new(|| BigUint::from_bytes_be(&P256_ORDER));
static ORDER_P384: Lazy<BigUint> =
    Lazy::new(|| BigUint::from_bytes_be(&P384_ORDER));
static ORDER_P521: Lazy<BigUint> =
    Lazy::new(|| BigUint::from_bytes_be(&P521_ORDER));

static HALF_ORDER_P224: Lazy<BigUint> = Lazy::new(|| &*ORDER_P224 >> 1);
static HALF_ORDER_P256: Lazy<BigUint> = Lazy::new(|| &*ORDER_P256 >> 1);
static HALF_ORDER_P384: Lazy<BigUint> = Lazy::new(|| &*ORDER_P384 >> 1);
static HALF_ORDER_P521: Lazy<BigUint> = Lazy::new(|| &*ORDER_P521 >> 1);

/// The NIST prime curves a key may live on
///
/// Only P-256 and P-384 can be requested for new keys; the others are
/// recognized so that keys provisioned by other tools can still be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Curve {
    /// NIST P-224
    P224,
    /// NIST P-256
    P256,
    /// NIST P-384
    P384,
    /// NIST P-521
    P521,
}

impl Curve {
    /// Maps a security level to the curve used for new keys
    pub fn from_security_level(level: usize) -> Result<Curve> {
        match level {
            256 => Ok(Curve::P256),
            384 => Ok(Curve::P384),
            _ => Err(Error::config(format!(
                "security level not supported [{}]",
                level
            ))),
        }
    }

    /// Maps a named curve OID to the curve
    pub fn from_oid(oid: &asn1::ObjectIdentifier) -> Result<Curve> {
        if *oid == EC_SECP224R1 {
            Ok(Curve::P224)
        } else if *oid == EC_SECP256R1 {
            Ok(Curve::P256)
        } else if *oid == EC_SECP384R1 {
            Ok(Curve::P384)
        } else if *oid == EC_SECP521R1 {
            Ok(Curve::P521)
        } else {
            Err(Error::unsupported(format!("Unknown curve OID [{}]", oid)))
        }
    }

    /// Parses the DER encoded CKA_EC_PARAMS of a key object
    pub fn from_ec_params(params: &[u8]) -> Result<Curve> {
        let oid = asn1::parse_single::<asn1::ObjectIdentifier>(params)?;
        Curve::from_oid(&oid)
    }

    /// The named curve OID
    pub fn oid(&self) -> asn1::ObjectIdentifier {
        match self {
            Curve::P224 => EC_SECP224R1,
            Curve::P256 => EC_SECP256R1,
            Curve::P384 => EC_SECP384R1,
            Curve::P521 => EC_SECP521R1,
        }
    }

    /// Returns the DER encoding of the named curve OID
    pub fn ec_params(&self) -> Result<Vec<u8>> {
        Ok(asn1::write_single(&self.oid())?)
    }

    /// The NIST name, for messages
    pub fn name(&self) -> &'static str {
        match self {
            Curve::P224 => "P-224",
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
            Curve::P521 => "P-521",
        }
    }

    /// Size in bytes of a scalar or a point coordinate
    pub fn byte_size(&self) -> usize {
        match self {
            Curve::P224 => 28,
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }

    /// The group order n
    pub fn order(&self) -> &'static BigUint {
        match self {
            Curve::P224 => &ORDER_P224,
            Curve::P256 => &ORDER_P256,
            Curve::P384 => &ORDER_P384,
            Curve::P521 => &ORDER_P521,
        }
    }

    /// n / 2, the largest S value accepted in signatures
    pub fn half_order(&self) -> &'static BigUint {
        match self {
            Curve::P224 => &HALF_ORDER_P224,
            Curve::P256 => &HALF_ORDER_P256,
            Curve::P384 => &HALF_ORDER_P384,
            Curve::P521 => &HALF_ORDER_P521,
        }
    }

    fn point_size(&self) -> usize {
        2 * self.byte_size() + 1
    }
}

/// Extracts the uncompressed point from a CKA_EC_POINT value
///
/// Tokens disagree on whether the attribute holds a DER OCTET STRING or
/// the bare point, so both are accepted.
pub fn parse_ec_point(curve: Curve, value: &[u8]) -> Result<Vec<u8>> {
    let size = curve.point_size();
    if value.len() == size && value[0] == 0x04 {
        return Ok(value.to_vec());
    }
    match asn1::parse_single::<&[u8]>(value) {
        Ok(point) if point.len() == size && point[0] == 0x04 => {
            Ok(point.to_vec())
        }
        _ => Err(Error::invalid_argument(format!(
            "Invalid EC point for curve {}",
            curve.name()
        ))),
    }
}

/// DER OCTET STRING wrapping of a point, as stored in CKA_EC_POINT
#[cfg(test)]
pub fn encode_ec_point(point: &[u8]) -> Result<Vec<u8>> {
    Ok(asn1::write_single(&point)?)
}

/// The key identifier: SHA-256 over the uncompressed public point
pub fn compute_ski(point: &[u8]) -> Vec<u8> {
    Sha256::digest(point).to_vec()
}
