//! This module holds some utilities for working with share indices.
//!
//! Every custodian share is the evaluation of a polynomial at a point
//! derived from its index. Reconstruction needs the Lagrange coefficient
//! of each index relative to the set of shares at hand, which this module computes.

use std::collections::HashSet;

use elliptic_curve::ff::PrimeField;
use serde::{Deserialize, Serialize};

/// The index of a share.
///
/// Indices start at zero, and are mapped to the field element `index + 1`,
/// since the polynomial evaluated at zero is the secret itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareIndex(u32);

impl ShareIndex {
    /// Return the scalar associated with this index.
    pub fn scalar<F: PrimeField>(&self) -> F {
        F::from(u64::from(self.0) + 1)
    }
}

impl From<ShareIndex> for u32 {
    fn from(p: ShareIndex) -> Self {
        p.0
    }
}

impl From<u32> for ShareIndex {
    fn from(x: u32) -> Self {
        ShareIndex(x)
    }
}

/// Represents a sorted list of share indices, without duplicates.
#[derive(Debug, Clone)]
pub struct ShareIndexList {
    indices: Vec<ShareIndex>,
}

impl ShareIndexList {
    /// Create a list from a slice of indices.
    ///
    /// This will return None if the indices have duplicates.
    pub fn new(indices: &[ShareIndex]) -> Option<Self> {
        let mut out = indices.to_owned();
        out.sort();

        let unique: HashSet<_> = out.iter().collect();
        if unique.len() < out.len() {
            return None;
        }

        Some(Self { indices: out })
    }

    /// Check if this list has a given index.
    pub fn contains(&self, index: ShareIndex) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = ShareIndex> + '_ {
        self.indices.iter().copied()
    }

    /// Get the lagrange coefficient for an index, relative to this list,
    /// for interpolating at zero.
    ///
    /// The index must be part of the list.
    pub fn lagrange<F: PrimeField>(&self, p: ShareIndex) -> F {
        let p_scalar = p.scalar::<F>();

        let mut top = F::ONE;
        let mut bot = F::ONE;
        for q in self.iter() {
            if p == q {
                continue;
            }
            let q_scalar = q.scalar::<F>();
            top *= q_scalar;
            bot *= q_scalar - p_scalar;
        }

        // Distinct indices map to distinct non-zero scalars, so bot is invertible.
        top * bot.invert().unwrap()
    }

    /// Interpolate the polynomial through some points, evaluated at zero.
    ///
    /// Every index among the points must be part of this list.
    pub fn interpolate<F: PrimeField>(&self, values: &[(ShareIndex, F)]) -> F {
        values
            .iter()
            .fold(F::ZERO, |acc, (p, y)| acc + self.lagrange::<F>(*p) * y)
    }
}
