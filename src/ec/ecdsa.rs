// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! ECDSA keys and signature encoding
//!
//! Signatures leave the provider as a DER `SEQUENCE { r INTEGER,
//! s INTEGER }` in canonical low-S form. The device only deals with the
//! fixed size `r || s` concatenation.

use std::any::Any;
use std::sync::Arc;

use crate::ec::{compute_ski, Curve, EC_PUBLIC_KEY};
use crate::error::{Error, Result};
use crate::key::Key;

use asn1;
use num_bigint::BigUint;
use num_traits::Zero;

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
struct EcdsaSignature<'a> {
    r: asn1::BigUint<'a>,
    s: asn1::BigUint<'a>,
}

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
struct AlgorithmIdentifier {
    algorithm: asn1::ObjectIdentifier,
    parameters: asn1::ObjectIdentifier,
}

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
struct SubjectPublicKeyInfo<'a> {
    algorithm: AlgorithmIdentifier,
    subject_public_key: asn1::BitString<'a>,
}

/// Minimal unsigned DER INTEGER contents, with a leading zero when the
/// high bit would otherwise mark the number as negative
fn der_uint(n: &BigUint) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    if bytes[0] & 0x80 == 0x80 {
        let mut v = Vec::with_capacity(bytes.len() + 1);
        v.push(0);
        v.extend_from_slice(&bytes);
        v
    } else {
        bytes
    }
}

/// Encodes (r, s) as a DER ECDSA signature
pub fn marshal_signature(r: &BigUint, s: &BigUint) -> Result<Vec<u8>> {
    let rbytes = der_uint(r);
    let sbytes = der_uint(s);
    let sig = EcdsaSignature {
        r: asn1::BigUint::new(&rbytes).ok_or(Error::invalid_argument(
            "Invalid R value".to_string(),
        ))?,
        s: asn1::BigUint::new(&sbytes).ok_or(Error::invalid_argument(
            "Invalid S value".to_string(),
        ))?,
    };
    Ok(asn1::write_single(&sig)?)
}

/// Decodes a DER ECDSA signature, both values must be positive
pub fn unmarshal_signature(signature: &[u8]) -> Result<(BigUint, BigUint)> {
    let sig = match asn1::parse_single::<EcdsaSignature>(signature) {
        Ok(s) => s,
        Err(e) => {
            return Err(Error::invalid_argument(format!(
                "Failed unmarshalling signature [{}]",
                e
            )))
        }
    };
    let r = BigUint::from_bytes_be(sig.r.as_bytes());
    if r.is_zero() {
        return Err(Error::invalid_argument(
            "Invalid signature. R must be larger than zero".to_string(),
        ));
    }
    let s = BigUint::from_bytes_be(sig.s.as_bytes());
    if s.is_zero() {
        return Err(Error::invalid_argument(
            "Invalid signature. S must be larger than zero".to_string(),
        ));
    }
    Ok((r, s))
}

/// True when `s` is at most half the group order
pub fn is_low_s(curve: Curve, s: &BigUint) -> bool {
    s <= curve.half_order()
}

/// Returns the low-S representative of `s`, which must be below the order
pub fn to_low_s(curve: Curve, s: BigUint) -> BigUint {
    if is_low_s(curve, &s) {
        s
    } else {
        curve.order() - s
    }
}

/// Splits the raw `r || s` output of the device for a key on `curve`
///
/// Both halves must be exactly the curve size and lie in `[1, n)`.
pub fn split_raw_signature(
    curve: Curve,
    raw: &[u8],
) -> Result<(BigUint, BigUint)> {
    let size = curve.byte_size();
    if raw.len() != 2 * size {
        return Err(Error::device(format!(
            "Invalid raw signature length [{}] for curve {}",
            raw.len(),
            curve.name()
        )));
    }
    let r = BigUint::from_bytes_be(&raw[..size]);
    let s = BigUint::from_bytes_be(&raw[size..]);
    for v in [&r, &s] {
        if v.is_zero() || v >= curve.order() {
            return Err(Error::device(format!(
                "Invalid raw signature value for curve {}",
                curve.name()
            )));
        }
    }
    Ok((r, s))
}

fn pad_to(n: &BigUint, size: usize, out: &mut Vec<u8>) -> Result<()> {
    let bytes = n.to_bytes_be();
    if bytes.len() > size {
        return Err(Error::invalid_argument(
            "Invalid signature. Value larger than the curve size".to_string(),
        ));
    }
    out.resize(out.len() + size - bytes.len(), 0);
    out.extend_from_slice(&bytes);
    Ok(())
}

/// Encodes (r, s) as the fixed size `r || s` the device expects
pub fn signature_to_raw(
    curve: Curve,
    r: &BigUint,
    s: &BigUint,
) -> Result<Vec<u8>> {
    let size = curve.byte_size();
    let mut raw = Vec::with_capacity(2 * size);
    pad_to(r, size, &mut raw)?;
    pad_to(s, size, &mut raw)?;
    Ok(raw)
}

/// Verifies (r, s) over `digest` against an uncompressed public point
///
/// A malformed signature or a mismatch both yield `Ok(false)`.
pub fn verify_software(
    curve: Curve,
    point: &[u8],
    digest: &[u8],
    r: &BigUint,
    s: &BigUint,
) -> Result<bool> {
    use p256::ecdsa::signature::hazmat::PrehashVerifier;

    let raw = match signature_to_raw(curve, r, s) {
        Ok(raw) => raw,
        Err(_) => return Ok(false),
    };
    match curve {
        Curve::P256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map_err(|_| {
                    Error::invalid_argument("Invalid public key".to_string())
                })?;
            let sig = match p256::ecdsa::Signature::from_slice(&raw) {
                Ok(sig) => sig,
                Err(_) => return Ok(false),
            };
            Ok(key.verify_prehash(digest, &sig).is_ok())
        }
        Curve::P384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map_err(|_| {
                    Error::invalid_argument("Invalid public key".to_string())
                })?;
            let sig = match p384::ecdsa::Signature::from_slice(&raw) {
                Ok(sig) => sig,
                Err(_) => return Ok(false),
            };
            Ok(key.verify_prehash(digest, &sig).is_ok())
        }
        _ => Err(Error::unsupported(format!(
            "Software verification not available for curve {}",
            curve.name()
        ))),
    }
}

/// Public half of an EC key pair held by the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EcdsaPublicKey {
    curve: Curve,
    point: Vec<u8>,
    ski: Vec<u8>,
}

impl EcdsaPublicKey {
    /// `point` is the uncompressed SEC1 encoding
    pub fn new(curve: Curve, point: Vec<u8>) -> EcdsaPublicKey {
        let ski = compute_ski(&point);
        EcdsaPublicKey {
            curve: curve,
            point: point,
            ski: ski,
        }
    }

    /// The curve of the key
    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// The uncompressed SEC1 public point
    pub fn point(&self) -> &[u8] {
        &self.point
    }
}

impl Key for EcdsaPublicKey {
    /// DER encoded SubjectPublicKeyInfo
    fn bytes(&self) -> Result<Vec<u8>> {
        let spki = SubjectPublicKeyInfo {
            algorithm: AlgorithmIdentifier {
                algorithm: EC_PUBLIC_KEY,
                parameters: self.curve.oid(),
            },
            subject_public_key: asn1::BitString::new(&self.point, 0).ok_or(
                Error::invalid_argument("Invalid EC point".to_string()),
            )?,
        };
        Ok(asn1::write_single(&spki)?)
    }

    fn ski(&self) -> Vec<u8> {
        self.ski.clone()
    }

    fn symmetric(&self) -> bool {
        false
    }

    fn private(&self) -> bool {
        false
    }

    fn public_key(&self) -> Result<Arc<dyn Key>> {
        Ok(Arc::new(self.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An EC private key that never leaves the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EcdsaPrivateKey {
    public: EcdsaPublicKey,
}

impl EcdsaPrivateKey {
    /// Wraps the public half of a pair whose private object is on the device
    pub fn new(public: EcdsaPublicKey) -> EcdsaPrivateKey {
        EcdsaPrivateKey { public: public }
    }

    /// The curve of the key pair
    pub fn curve(&self) -> Curve {
        self.public.curve
    }

    /// The public half of the pair
    pub fn public(&self) -> &EcdsaPublicKey {
        &self.public
    }
}

impl Key for EcdsaPrivateKey {
    fn bytes(&self) -> Result<Vec<u8>> {
        Err(Error::unsupported("Not supported.".to_string()))
    }

    fn ski(&self) -> Vec<u8> {
        self.public.ski.clone()
    }

    fn symmetric(&self) -> bool {
        false
    }

    fn private(&self) -> bool {
        true
    }

    fn public_key(&self) -> Result<Arc<dyn Key>> {
        Ok(Arc::new(self.public.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
