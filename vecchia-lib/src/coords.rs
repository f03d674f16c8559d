//! Point sets in $\mathbb{R}^{d}$.
//!
//! Points are stored row-major so a point is a contiguous slice, which is how
//! the covariance functions consume them.

use std::collections::HashMap;

use faer::Mat;

use crate::VecchiaError;

/// An ordered set of points in $\mathbb{R}^{d}$
#[derive(Clone, Debug, PartialEq)]
pub struct Coords {
    data: Vec<f64>,
    dim: usize,
}

impl Coords {
    /// Wrap row-major data of points with `dim` coordinates each
    ///
    /// # Errors
    ///
    /// Returns an error if `dim` is zero or does not divide the data length
    pub fn new(data: Vec<f64>, dim: usize) -> Result<Self, VecchiaError> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(VecchiaError::MismatchedInputs(format!(
                "{} values cannot be split into points of dimension {dim}",
                data.len()
            )));
        }
        Ok(Coords { data, dim })
    }

    /// Build from a list of points
    ///
    /// # Errors
    ///
    /// Returns an error if the points do not all have the same non-zero dimension
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, VecchiaError> {
        let dim = rows.first().map_or(1, Vec::len);
        if rows.iter().any(|r| r.len() != dim) {
            return Err(VecchiaError::MismatchedInputs(
                "points have different dimensions".to_string(),
            ));
        }
        Coords::new(rows.iter().flatten().copied().collect(), dim)
    }

    /// Build `n` points of dimension `dim` with `f(point, coordinate)`
    ///
    /// # Panics
    ///
    /// Panics if `dim` is zero
    pub fn from_fn(n: usize, dim: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        assert!(dim > 0, "points need at least one coordinate");
        let mut data = Vec::with_capacity(n * dim);
        for i in 0..n {
            for d in 0..dim {
                data.push(f(i, d));
            }
        }
        Coords { data, dim }
    }

    /// Copy the rows of an $n \times d$ matrix
    ///
    /// # Panics
    ///
    /// Panics if the matrix has no columns
    #[must_use]
    pub fn from_mat(mat: &Mat<f64>) -> Self {
        Coords::from_fn(mat.nrows(), mat.ncols(), |i, d| mat.read(i, d))
    }

    /// Number of points
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Dimension of every point
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Point `i`
    #[must_use]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    #[must_use]
    pub fn get(&self, i: usize, d: usize) -> f64 {
        self.data[i * self.dim + d]
    }

    /// Sum of the coordinates of point `i`
    #[must_use]
    pub fn row_sum(&self, i: usize) -> f64 {
        self.row(i).iter().sum()
    }

    /// Euclidean distance between points `i` and `j`
    #[must_use]
    pub fn euclidean(&self, i: usize, j: usize) -> f64 {
        euclidean(self.row(i), self.row(j))
    }

    /// The points at `idx`, in that order
    #[must_use]
    pub fn select(&self, idx: &[usize]) -> Coords {
        let mut data = Vec::with_capacity(idx.len() * self.dim);
        for &i in idx {
            data.extend_from_slice(self.row(i));
        }
        Coords {
            data,
            dim: self.dim,
        }
    }

    /// The points of `self` followed by those of `other`
    ///
    /// # Errors
    ///
    /// Returns an error if the dimensions differ
    pub fn concat(&self, other: &Coords) -> Result<Coords, VecchiaError> {
        if self.dim != other.dim {
            return Err(VecchiaError::MismatchedInputs(format!(
                "cannot stack points of dimension {} and {}",
                self.dim, other.dim
            )));
        }
        let mut data = self.data.clone();
        data.extend_from_slice(&other.data);
        Ok(Coords {
            data,
            dim: self.dim,
        })
    }
}

pub(crate) fn euclidean(x: &[f64], y: &[f64]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Unique locations of a point set and the incidence map into them
#[derive(Clone, Debug)]
pub struct UniqueCoords {
    /// the distinct points, in order of first appearance
    pub unique: Coords,
    /// for every input point, the index of its location in `unique`
    pub unique_idx: Vec<usize>,
}

impl UniqueCoords {
    /// Number of distinct locations
    #[must_use]
    pub fn num_unique(&self) -> usize {
        self.unique.len()
    }
}

fn bits_key(row: &[f64]) -> Vec<u64> {
    // +0 and -0 are the same location
    row.iter()
        .map(|&x| if x == 0. { 0 } else { x.to_bits() })
        .collect()
}

/// Find the distinct locations of `coords`, keeping first appearance order
#[must_use]
pub fn unique_coords(coords: &Coords) -> UniqueCoords {
    let mut seen: HashMap<Vec<u64>, usize> = HashMap::with_capacity(coords.len());
    let mut first = Vec::new();
    let unique_idx = (0..coords.len())
        .map(|i| {
            let next = seen.len();
            let id = *seen.entry(bits_key(coords.row(i))).or_insert(next);
            if id == next {
                first.push(i);
            }
            id
        })
        .collect();
    UniqueCoords {
        unique: coords.select(&first),
        unique_idx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_and_dims() {
        let c = Coords::from_rows(&[vec![0., 1.], vec![2., 3.], vec![4., 5.]]).unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c.dim(), 2);
        assert_eq!(c.row(1), &[2., 3.]);
        assert_eq!(c.row_sum(2), 9.);
        assert!((c.euclidean(0, 1) - 8_f64.sqrt()).abs() < 1e-15);
        assert!(Coords::new(vec![1., 2., 3.], 2).is_err());
        assert!(Coords::from_rows(&[vec![0.], vec![1., 2.]]).is_err());
        assert_eq!(Coords::from_mat(&faer::mat![[0., 1.], [2., 3.], [4., 5.]]), c);
    }

    #[test]
    fn select_and_concat() {
        let c = Coords::from_fn(4, 1, |i, _| i as f64);
        let s = c.select(&[3, 1]);
        assert_eq!(s.row(0), &[3.]);
        let both = s.concat(&c).unwrap();
        assert_eq!(both.len(), 6);
        assert_eq!(both.row(5), &[3.]);
        assert!(both.concat(&Coords::from_fn(1, 2, |_, _| 0.)).is_err());
    }

    #[test]
    fn unique_locations() {
        let c = Coords::from_rows(&[
            vec![0., 1.],
            vec![1., 1.],
            vec![0., 1.],
            vec![-0., 1.],
            vec![2., 2.],
        ])
        .unwrap();
        let u = unique_coords(&c);
        assert_eq!(u.num_unique(), 3);
        assert_eq!(u.unique_idx, vec![0, 1, 0, 0, 2]);
        assert_eq!(u.unique.row(2), &[2., 2.]);
    }
}
