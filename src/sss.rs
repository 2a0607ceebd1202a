//! Shamir secret sharing over the scalar field of a custody curve.
//!
//! A secret `s` is split by picking a random polynomial `f` of degree `t - 1`
//! with `f(0) = s`, and handing the node with index `i` the value `f(i + 1)`.
//! Any `t` shares determine `f`, and thus `s`, by Lagrange interpolation at zero,
//! while fewer than `t` shares are consistent with every possible secret.
//!
//! Shares also carry a generation. A fresh split for the same secret uses
//! a new generation, and shares of different generations are never combined.
use std::collections::BTreeMap;

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    compat::{scalar_from_bytes, scalar_to_bytes, CustodyCurve},
    math::Polynomial,
    participants::{ShareIndex, ShareIndexList},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharingError {
    #[error("bad parameters: {0}")]
    BadParameters(String),
    #[error("insufficient shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },
    #[error("malformed share with index {0}")]
    MalformedShare(u32),
    #[error("shares contain duplicate indices")]
    DuplicateIndex,
    #[error("shares come from different generations")]
    MixedGenerations,
}

/// One custodian's share of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    pub index: ShareIndex,
    pub generation: u64,
    /// The canonical encoding of the share's scalar.
    #[serde(with = "crate::serde::hex_bytes")]
    pub value: Vec<u8>,
}

/// Split a secret into `count` shares, any `threshold` of which reconstruct it.
pub fn split<C: CustodyCurve>(
    rng: &mut impl CryptoRngCore,
    secret: &C::Scalar,
    threshold: usize,
    count: usize,
    generation: u64,
) -> Result<Vec<KeyShare>, SharingError> {
    if threshold < 1 {
        return Err(SharingError::BadParameters(
            "threshold must be at least 1".to_string(),
        ));
    }
    if threshold > count {
        return Err(SharingError::BadParameters(format!(
            "threshold {threshold} exceeds share count {count}"
        )));
    }
    let count = u32::try_from(count)
        .map_err(|_| SharingError::BadParameters("share count too large".to_string()))?;

    let f = Polynomial::<C::Scalar>::extend_random(rng, threshold, secret);

    Ok((0..count)
        .map(ShareIndex::from)
        .map(|index| KeyShare {
            index,
            generation,
            value: scalar_to_bytes(&f.evaluate(&index.scalar())),
        })
        .collect())
}

/// Combine shares of one generation back into the secret.
///
/// Only the `threshold` shares with the lowest indices are used; any subset of
/// that size gives the same answer for honestly generated shares.
pub fn combine<C: CustodyCurve>(
    shares: &[KeyShare],
    threshold: usize,
) -> Result<C::Scalar, SharingError> {
    if threshold < 1 {
        return Err(SharingError::BadParameters(
            "threshold must be at least 1".to_string(),
        ));
    }
    if shares.len() < threshold {
        return Err(SharingError::InsufficientShares {
            got: shares.len(),
            need: threshold,
        });
    }
    if shares.windows(2).any(|w| w[0].generation != w[1].generation) {
        return Err(SharingError::MixedGenerations);
    }

    let indices: Vec<ShareIndex> = shares.iter().map(|s| s.index).collect();
    let all = ShareIndexList::new(&indices).ok_or(SharingError::DuplicateIndex)?;

    let chosen: Vec<ShareIndex> = all.iter().take(threshold).collect();
    let subset = ShareIndexList::new(&chosen).ok_or(SharingError::DuplicateIndex)?;

    let mut points = Vec::with_capacity(threshold);
    for share in shares.iter().filter(|s| subset.contains(s.index)) {
        let y = scalar_from_bytes::<C::Scalar>(&share.value)
            .ok_or(SharingError::MalformedShare(share.index.into()))?;
        points.push((share.index, y));
    }

    Ok(subset.interpolate(&points))
}

/// Pick the newest generation for which at least `threshold` shares are present.
///
/// Returns the shares of that generation, or None when no generation reaches
/// the threshold.
pub fn select_generation(shares: Vec<KeyShare>, threshold: usize) -> Option<(u64, Vec<KeyShare>)> {
    let mut by_generation: BTreeMap<u64, Vec<KeyShare>> = BTreeMap::new();
    for share in shares {
        by_generation.entry(share.generation).or_default().push(share);
    }
    by_generation
        .into_iter()
        .rev()
        .find(|(_, shares)| shares.len() >= threshold)
}

/// The largest generation among some shares.
pub fn latest_generation(shares: &[KeyShare]) -> Option<u64> {
    shares.iter().map(|s| s.generation).max()
}

#[cfg(test)]
mod test {
    use elliptic_curve::ff::Field;
    use k256::{Scalar, Secp256k1};
    use proptest::prelude::*;
    use rand_core::OsRng;

    use super::*;
    use crate::compat::Ed25519;

    /// All subsets of `0..n` with exactly `k` elements.
    fn subsets(n: usize, k: usize) -> Vec<Vec<usize>> {
        (0u32..(1 << n))
            .filter(|mask| mask.count_ones() as usize == k)
            .map(|mask| (0..n).filter(|i| mask & (1 << i) != 0).collect())
            .collect()
    }

    fn pick(shares: &[KeyShare], which: &[usize]) -> Vec<KeyShare> {
        which.iter().map(|i| shares[*i].clone()).collect()
    }

    #[test]
    fn test_every_quorum_reconstructs() {
        let secret = Scalar::random(&mut OsRng);
        let shares = split::<Secp256k1>(&mut OsRng, &secret, 3, 5, 0).unwrap();
        assert_eq!(shares.len(), 5);
        for k in 3..=5 {
            for subset in subsets(5, k) {
                let got = combine::<Secp256k1>(&pick(&shares, &subset), 3).unwrap();
                assert_eq!(got, secret, "subset {subset:?}");
            }
        }
    }

    #[test]
    fn test_below_threshold_does_not_reconstruct() {
        let secret = Scalar::random(&mut OsRng);
        let shares = split::<Secp256k1>(&mut OsRng, &secret, 3, 5, 0).unwrap();
        for subset in subsets(5, 2) {
            let partial = pick(&shares, &subset);
            assert_eq!(
                combine::<Secp256k1>(&partial, 3),
                Err(SharingError::InsufficientShares { got: 2, need: 3 })
            );
            // Forcing interpolation of too few points yields garbage.
            let forced = combine::<Secp256k1>(&partial, 2).unwrap();
            assert_ne!(forced, secret);
        }
    }

    #[test]
    fn test_ed25519_split() {
        let secret = curve25519_dalek::Scalar::random(&mut OsRng);
        let shares = split::<Ed25519>(&mut OsRng, &secret, 2, 3, 4).unwrap();
        assert!(shares.iter().all(|s| s.generation == 4));
        let got = combine::<Ed25519>(&shares[1..], 2).unwrap();
        assert_eq!(got, secret);
    }

    #[test]
    fn test_bad_parameters() {
        let secret = Scalar::ONE;
        assert!(matches!(
            split::<Secp256k1>(&mut OsRng, &secret, 4, 3, 0),
            Err(SharingError::BadParameters(_))
        ));
        assert!(matches!(
            split::<Secp256k1>(&mut OsRng, &secret, 0, 3, 0),
            Err(SharingError::BadParameters(_))
        ));
    }

    #[test]
    fn test_mixed_generations_rejected() {
        let secret = Scalar::random(&mut OsRng);
        let old = split::<Secp256k1>(&mut OsRng, &secret, 2, 3, 0).unwrap();
        let new = split::<Secp256k1>(&mut OsRng, &secret, 2, 3, 1).unwrap();
        let mixed = vec![old[0].clone(), new[1].clone()];
        assert_eq!(
            combine::<Secp256k1>(&mixed, 2),
            Err(SharingError::MixedGenerations)
        );
    }

    #[test]
    fn test_duplicates_and_malformed() {
        let secret = Scalar::random(&mut OsRng);
        let shares = split::<Secp256k1>(&mut OsRng, &secret, 2, 3, 0).unwrap();
        let dup = vec![shares[0].clone(), shares[0].clone()];
        assert_eq!(combine::<Secp256k1>(&dup, 2), Err(SharingError::DuplicateIndex));

        let mut bad = shares.clone();
        bad[0].value = vec![0xff; 32];
        assert_eq!(
            combine::<Secp256k1>(&bad, 2),
            Err(SharingError::MalformedShare(0))
        );
    }

    #[test]
    fn test_select_generation_prefers_newest_quorum() {
        let secret = Scalar::random(&mut OsRng);
        let old = split::<Secp256k1>(&mut OsRng, &secret, 2, 3, 0).unwrap();
        let new = split::<Secp256k1>(&mut OsRng, &secret, 2, 3, 1).unwrap();

        // A half-applied resplit: one node has the new generation.
        let seen = vec![new[0].clone(), old[1].clone(), old[2].clone()];
        let (generation, chosen) = select_generation(seen, 2).unwrap();
        assert_eq!(generation, 0);
        assert_eq!(combine::<Secp256k1>(&chosen, 2).unwrap(), secret);

        let seen = vec![new[0].clone(), new[1].clone(), old[2].clone()];
        let (generation, chosen) = select_generation(seen.clone(), 2).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(combine::<Secp256k1>(&chosen, 2).unwrap(), secret);
        assert_eq!(latest_generation(&seen), Some(1));

        assert!(select_generation(vec![new[0].clone(), old[1].clone()], 2).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_any_quorum_reconstructs(
            seed in any::<u64>(),
            (n, t) in (1usize..8).prop_flat_map(|n| (Just(n), 1..=n)),
            rotate in 0usize..8,
        ) {
            let secret = Scalar::from(seed);
            let shares = split::<Secp256k1>(&mut OsRng, &secret, t, n, 0).unwrap();
            let mut shares = shares;
            shares.rotate_left(rotate % n);
            let got = combine::<Secp256k1>(&shares[..t], t).unwrap();
            prop_assert_eq!(got, secret);
        }
    }
}
