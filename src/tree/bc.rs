//! Boundary conditions and neighbor lookup (spec.md §4.4.8, §6, §8).

use super::key::Key;
use serde::{Deserialize, Serialize};

/// Per-axis, per-side boundary condition. `0 = zero`, `1 = periodic` in
/// spec.md §6's factory option matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryCondition {
    /// Stepping off the domain on this side yields the invalid sentinel.
    Zero,
    /// Stepping off the domain on this side wraps modulo `2^n`.
    Periodic,
}

/// The `D x 2` boundary condition matrix from spec.md §6's factory options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BcMatrix<const D: usize> {
    /// Condition applied on the low side of each axis.
    pub lo: [BoundaryCondition; D],
    /// Condition applied on the high side of each axis.
    pub hi: [BoundaryCondition; D],
}

impl<const D: usize> Default for BcMatrix<D> {
    fn default() -> Self {
        Self {
            lo: [BoundaryCondition::Periodic; D],
            hi: [BoundaryCondition::Periodic; D],
        }
    }
}

impl<const D: usize> BcMatrix<D> {
    /// All axes bound by a zero (Dirichlet-style) boundary.
    #[must_use]
    pub fn all_zero() -> Self {
        Self {
            lo: [BoundaryCondition::Zero; D],
            hi: [BoundaryCondition::Zero; D],
        }
    }

    /// All axes periodic.
    #[must_use]
    pub fn all_periodic() -> Self {
        Self::default()
    }

    /// Resolve the key reached from `key` by adding `displacement` to its
    /// translation vector, applying this boundary condition per axis.
    ///
    /// Returns [`Key::invalid`] if any axis exits `[0, 2^n)` under a zero
    /// boundary. Periodic directions wrap modulo `2^n`; callers that need
    /// the "cap displacement to avoid double counting" rule from spec.md
    /// §4.4.6 must apply it themselves before calling this.
    #[must_use]
    pub fn neighbor(&self, key: Key<D>, displacement: [i64; D]) -> Key<D> {
        let modulus = key.boxes_per_axis();
        let mut l = [0i64; D];
        for i in 0..D {
            let mut coord = key.l[i] + displacement[i];
            if coord < 0 {
                match self.lo[i] {
                    BoundaryCondition::Zero => return Key::invalid(),
                    BoundaryCondition::Periodic => {
                        coord = coord.rem_euclid(modulus);
                    }
                }
            } else if coord >= modulus {
                match self.hi[i] {
                    BoundaryCondition::Zero => return Key::invalid(),
                    BoundaryCondition::Periodic => {
                        coord = coord.rem_euclid(modulus);
                    }
                }
            }
            l[i] = coord;
        }
        Key { n: key.n, l }
    }

    /// Single-axis, single-step neighbor (`neighbor(key, axis, step)` from
    /// spec.md §4.4.8).
    #[must_use]
    pub fn neighbor_axis(&self, key: Key<D>, axis: usize, step: i64) -> Key<D> {
        let mut d = [0i64; D];
        d[axis] = step;
        self.neighbor(key, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_round_trips() {
        let bc = BcMatrix::<1>::all_periodic();
        let k = Key::<1> { n: 2, l: [0] };
        let stepped = bc.neighbor_axis(k, 0, -1);
        let back = bc.neighbor_axis(stepped, 0, 1);
        assert_eq!(back, k);
    }

    #[test]
    fn zero_bc_exits_to_invalid() {
        let bc = BcMatrix::<1>::all_zero();
        let k = Key::<1> { n: 2, l: [0] };
        let stepped = bc.neighbor_axis(k, 0, -1);
        assert!(!stepped.is_valid());
    }

    #[test]
    fn periodic_caps_high_side() {
        let bc = BcMatrix::<1>::all_periodic();
        let k = Key::<1> { n: 2, l: [3] };
        let stepped = bc.neighbor_axis(k, 0, 1);
        assert_eq!(stepped.l[0], 0);
    }
}
