use core::fmt;
use std::str::FromStr;

use curve25519_dalek::{constants::ED25519_BASEPOINT_POINT, edwards::CompressedEdwardsY};
use elliptic_curve::{
    ff::{Field, PrimeField},
    sec1::ToEncodedPoint,
};
use k256::{ProjectivePoint, PublicKey, Secp256k1};
use serde::{Deserialize, Serialize};

/// The curves a wallet can be issued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveType {
    Secp256k1,
    Ed25519,
}

impl CurveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurveType::Secp256k1 => "secp256k1",
            CurveType::Ed25519 => "ed25519",
        }
    }

    /// Check that some bytes encode a valid public key on this curve.
    pub fn validate_public_key(&self, bytes: &[u8]) -> bool {
        match self {
            CurveType::Secp256k1 => Secp256k1::validate_public_key(bytes),
            CurveType::Ed25519 => Ed25519::validate_public_key(bytes),
        }
    }
}

impl fmt::Display for CurveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secp256k1" => Ok(CurveType::Secp256k1),
            "ed25519" => Ok(CurveType::Ed25519),
            other => Err(format!("unknown curve type: {other}")),
        }
    }
}

/// Represents a curve whose keys can be held in custody.
///
/// Custodian shares live in the scalar field of the wallet's curve, so that
/// the reconstructed component can be checked against the public key.
///
/// Beyond the field, we need a name for domain separation, and a way to
/// derive and validate public keys in their canonical encoding.
pub trait CustodyCurve: Send + Sync + 'static {
    const NAME: &'static [u8];
    const CURVE_TYPE: CurveType;

    type Scalar: PrimeField + Send + Sync;

    /// The public key for a secret scalar, in canonical compressed form.
    fn public_key(secret: &Self::Scalar) -> Vec<u8>;

    /// Check that some bytes encode a valid public key.
    fn validate_public_key(bytes: &[u8]) -> bool;
}

impl CustodyCurve for Secp256k1 {
    const NAME: &'static [u8] = b"Secp256k1";
    const CURVE_TYPE: CurveType = CurveType::Secp256k1;

    type Scalar = k256::Scalar;

    fn public_key(secret: &Self::Scalar) -> Vec<u8> {
        (ProjectivePoint::GENERATOR * secret)
            .to_affine()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    fn validate_public_key(bytes: &[u8]) -> bool {
        PublicKey::from_sec1_bytes(bytes).is_ok()
    }
}

/// Marker type for the ed25519 curve, using the scalar field of the
/// prime order subgroup.
#[derive(Debug, Clone, Copy)]
pub struct Ed25519;

impl CustodyCurve for Ed25519 {
    const NAME: &'static [u8] = b"Ed25519";
    const CURVE_TYPE: CurveType = CurveType::Ed25519;

    type Scalar = curve25519_dalek::Scalar;

    fn public_key(secret: &Self::Scalar) -> Vec<u8> {
        (ED25519_BASEPOINT_POINT * secret)
            .compress()
            .to_bytes()
            .to_vec()
    }

    fn validate_public_key(bytes: &[u8]) -> bool {
        CompressedEdwardsY::from_slice(bytes)
            .ok()
            .and_then(|c| c.decompress())
            .is_some()
    }
}

/// Serialize a scalar into its canonical byte representation.
pub(crate) fn scalar_to_bytes<F: PrimeField>(scalar: &F) -> Vec<u8> {
    scalar.to_repr().as_ref().to_vec()
}

/// Parse a scalar from its canonical representation.
///
/// Returns None if the length is wrong or the value is not reduced.
pub(crate) fn scalar_from_bytes<F: PrimeField>(bytes: &[u8]) -> Option<F> {
    let mut repr = F::Repr::default();
    if repr.as_ref().len() != bytes.len() {
        return None;
    }
    repr.as_mut().copy_from_slice(bytes);
    Option::from(F::from_repr(repr))
}

/// Sample a uniformly random non-zero scalar.
pub(crate) fn random_nonzero<F: Field>(rng: &mut impl rand_core::CryptoRngCore) -> F {
    loop {
        let x = F::random(&mut *rng);
        if !bool::from(x.is_zero()) {
            return x;
        }
    }
}

#[cfg(test)]
mod test {
    use rand_core::OsRng;

    use super::*;

    fn check_scalar_roundtrip<C: CustodyCurve>() {
        let x: C::Scalar = random_nonzero(&mut OsRng);
        let bytes = scalar_to_bytes(&x);
        assert_eq!(bytes.len(), 32);
        assert_eq!(scalar_from_bytes::<C::Scalar>(&bytes), Some(x));
        assert_eq!(scalar_from_bytes::<C::Scalar>(&bytes[1..]), None);
    }

    #[test]
    fn test_scalar_bytes() {
        check_scalar_roundtrip::<Secp256k1>();
        check_scalar_roundtrip::<Ed25519>();
    }

    #[test]
    fn test_unreduced_scalar_rejected() {
        assert_eq!(scalar_from_bytes::<k256::Scalar>(&[0xff; 32]), None);
        assert_eq!(scalar_from_bytes::<curve25519_dalek::Scalar>(&[0xff; 32]), None);
    }

    #[test]
    fn test_public_keys_validate() {
        let x: k256::Scalar = random_nonzero(&mut OsRng);
        let pk = Secp256k1::public_key(&x);
        assert_eq!(pk.len(), 33);
        assert!(CurveType::Secp256k1.validate_public_key(&pk));
        assert!(!CurveType::Secp256k1.validate_public_key(&pk[1..]));

        let y: curve25519_dalek::Scalar = random_nonzero(&mut OsRng);
        let pk = Ed25519::public_key(&y);
        assert_eq!(pk.len(), 32);
        assert!(CurveType::Ed25519.validate_public_key(&pk));
    }

    #[test]
    fn test_curve_type_names() {
        assert_eq!("ed25519".parse::<CurveType>(), Ok(CurveType::Ed25519));
        assert!("p256".parse::<CurveType>().is_err());
        assert_eq!(
            serde_json::to_string(&CurveType::Secp256k1).unwrap(),
            "\"secp256k1\""
        );
    }
}
