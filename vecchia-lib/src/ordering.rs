//! Pre-permutation of the points.
//!
//! A permutation `perm` maps internal positions to user positions:
//! internal point `r` is user point `perm[r]`.

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{config::VecchiaOrdering, coords::Coords, VecchiaError};

/// Compute the ordering of `coords`
///
/// Random shuffles are skipped when `allow_shuffle` is false (inducing points keep the user order).
///
/// # Errors
///
/// Time based orderings need a space-time covariance function
pub fn ordering_permutation(
    ordering: VecchiaOrdering,
    coords: &Coords,
    is_space_time: bool,
    allow_shuffle: bool,
    seed: u64,
) -> Result<Vec<usize>, VecchiaError> {
    let mut perm: Vec<usize> = (0..coords.len()).collect();
    let by_time = matches!(
        ordering,
        VecchiaOrdering::Time | VecchiaOrdering::TimeRandomSpace
    );
    if by_time && !is_space_time {
        return Err(VecchiaError::NotSpaceTime(ordering.to_string()));
    }
    let shuffle = matches!(
        ordering,
        VecchiaOrdering::Random | VecchiaOrdering::TimeRandomSpace
    );
    if shuffle {
        if allow_shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            perm.shuffle(&mut rng);
        } else {
            log::info!("random ordering is not applied with inducing points");
        }
    }
    if by_time {
        // stable, so a preceding shuffle randomises points with equal times
        perm.sort_by(|&a, &b| coords.get(a, 0).total_cmp(&coords.get(b, 0)));
    }
    Ok(perm)
}

/// Reorder `values` (in user order) into internal order
#[must_use]
pub fn permute<T: Clone>(values: &[T], perm: &[usize]) -> Vec<T> {
    perm.iter().map(|&p| values[p].clone()).collect()
}

/// Reorder `values` (in internal order) back into user order
#[must_use]
pub fn unpermute<T: Clone + Default>(values: &[T], perm: &[usize]) -> Vec<T> {
    let mut out = vec![T::default(); values.len()];
    for (v, &p) in values.iter().zip(perm) {
        out[p] = v.clone();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times() -> Coords {
        Coords::from_rows(&[
            vec![3., 0.],
            vec![1., 1.],
            vec![2., 2.],
            vec![1., 3.],
            vec![0., 4.],
        ])
        .unwrap()
    }

    #[test]
    fn none_is_identity() {
        let perm = ordering_permutation(VecchiaOrdering::None, &times(), false, true, 0).unwrap();
        assert_eq!(perm, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn time_sorts_stably() {
        let perm = ordering_permutation(VecchiaOrdering::Time, &times(), true, true, 0).unwrap();
        assert_eq!(perm, vec![4, 1, 3, 2, 0]);
    }

    #[test]
    fn time_random_space_keeps_time_order() {
        let c = times();
        let perm =
            ordering_permutation(VecchiaOrdering::TimeRandomSpace, &c, true, true, 11).unwrap();
        let t: Vec<f64> = perm.iter().map(|&p| c.get(p, 0)).collect();
        assert_eq!(t, vec![0., 1., 1., 2., 3.]);
    }

    #[test]
    fn time_needs_space_time_kernel() {
        assert!(matches!(
            ordering_permutation(VecchiaOrdering::Time, &times(), false, true, 0),
            Err(VecchiaError::NotSpaceTime(_))
        ));
    }

    #[test]
    fn random_is_seeded_permutation() {
        let c = Coords::from_fn(50, 1, |i, _| i as f64);
        let a = ordering_permutation(VecchiaOrdering::Random, &c, false, true, 3).unwrap();
        let b = ordering_permutation(VecchiaOrdering::Random, &c, false, true, 3).unwrap();
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_ne!(a, sorted);
        let kept = ordering_permutation(VecchiaOrdering::Random, &c, false, false, 3).unwrap();
        assert_eq!(kept, sorted);

        let vals: Vec<f64> = (0..50).map(|i| i as f64 * 2.).collect();
        assert_eq!(unpermute(&permute(&vals, &a), &a), vals);
    }
}
