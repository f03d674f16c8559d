//! Conditioning sets of the Vecchia approximation.
//!
//! Point $i$ may only condition on earlier points. Two selection rules are provided:
//!
//! * Euclidean: exact k nearest neighbours by a mean-distance-ordered search
//!   (points are ranked by the sum of their coordinates, and
//!   $(\sum x_{j} - \sum x_{i})^{2}/d \le \|x_{j} - x_{i}\|^{2}$ bounds the search)
//! * residual correlation: brute force for short prefixes, cover trees afterwards

use std::collections::BinaryHeap;

use faer::Mat;
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::{
    coords::Coords,
    cover_tree::{brute_force_knn, build_segmented, forest_knn, Candidate},
    distance::IndexMetric,
    EPSILON_NUMBERS,
};

/// Extra brute force prefix after the first prediction point
const PREDICTION_BRUTE_FORCE_EXTRA: usize = 500;

/// Which points get neighbours and which may be neighbours
#[derive(Clone, Copy, Debug)]
pub struct NeighborQuery {
    /// $k$
    pub num_neighbors: usize,
    /// first point that receives a conditioning set
    pub start_at: usize,
    /// last point that may be a neighbour, all earlier points if `None`
    pub end_search_at: Option<usize>,
    /// keep Euclidean distances for the covariance function
    pub save_distances: bool,
    pub check_duplicates: bool,
    /// searching for prediction points (affects the brute force prefix)
    pub prediction: bool,
}

impl NeighborQuery {
    /// Training query over all points
    #[must_use]
    pub fn training(num_neighbors: usize, save_distances: bool, check_duplicates: bool) -> Self {
        NeighborQuery {
            num_neighbors,
            start_at: 0,
            end_search_at: None,
            save_distances,
            check_duplicates,
            prediction: false,
        }
    }

    /// Number of points that may serve as neighbours, and the clamped $k$
    fn clamp(&self, n: usize) -> (usize, usize) {
        let limit = match self.end_search_at {
            Some(e) => (e + 1).min(n),
            None => n.saturating_sub(1),
        };
        let mut k = self.num_neighbors;
        if k > limit {
            log::info!(
                "number of neighbours reduced from {k} to {limit}: not enough candidate points"
            );
            k = limit;
        }
        (k, limit)
    }
}

/// Conditioning sets for the points `start_at..`
#[derive(Clone, Debug, Default)]
pub struct Neighborhoods {
    /// first point with a conditioning set
    pub start_at: usize,
    /// $k$ after clamping
    pub num_neighbors: usize,
    /// `neighbors[r]` is $N(\text{start\_at} + r)$, nearest first
    pub neighbors: Vec<Vec<usize>>,
    /// distances from the point to each neighbour ($|N| \times 1$), empty when not saved
    pub dist_obs_neighbors: Vec<Mat<f64>>,
    /// distances between the neighbours ($|N| \times |N|$), empty when not saved
    pub dist_between_neighbors: Vec<Mat<f64>>,
    /// some point coincides with one of its neighbours, or two neighbours coincide
    pub has_duplicates: bool,
}

impl Neighborhoods {
    /// Number of points with a conditioning set
    #[must_use]
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// $N(i)$ for the global index `i`
    #[must_use]
    pub fn of(&self, i: usize) -> &[usize] {
        &self.neighbors[i - self.start_at]
    }

    #[must_use]
    pub fn saves_distances(&self) -> bool {
        !self.dist_obs_neighbors.is_empty()
    }

    /// Same conditioning sets (distances are derived data)
    #[must_use]
    pub fn same_sets(&self, other: &Neighborhoods) -> bool {
        self.start_at == other.start_at && self.neighbors == other.neighbors
    }
}

/// Exact Euclidean k nearest earlier neighbours of every queried point of `coords`
#[must_use]
pub fn find_neighbors_euclidean(coords: &Coords, query: &NeighborQuery) -> Neighborhoods {
    let n = coords.len();
    let (k, limit) = query.clamp(n);
    let sums: Vec<f64> = (0..n).map(|i| coords.row_sum(i)).collect();
    let mut sorted: Vec<usize> = (0..n).collect();
    sorted.sort_by(|&a, &b| sums[a].total_cmp(&sums[b]).then(a.cmp(&b)));
    let mut rank = vec![0; n];
    for (r, &j) in sorted.iter().enumerate() {
        rank[j] = r;
    }

    let lists: Vec<Vec<usize>> = (query.start_at..n)
        .into_par_iter()
        .map(|i| {
            let cand = i.min(limit);
            if cand <= k {
                (0..cand).collect()
            } else {
                mean_distance_ordered_knn(coords, &sums, &sorted, rank[i], i, k, cand)
            }
        })
        .collect();
    finalize(coords, lists, query, k)
}

fn mean_distance_ordered_knn(
    coords: &Coords,
    sums: &[f64],
    sorted: &[usize],
    pos: usize,
    i: usize,
    k: usize,
    cand: usize,
) -> Vec<usize> {
    #[allow(clippy::cast_precision_loss)]
    let dim = coords.dim() as f64;
    let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
    let mut up = pos + 1;
    let mut down = pos;
    let (mut go_up, mut go_down) = (true, pos > 0);
    let bound_exceeded = |heap: &BinaryHeap<Candidate>, j: usize| {
        heap.len() == k
            && heap
                .peek()
                .is_some_and(|&(OrderedFloat(worst), _)| (sums[j] - sums[i]).powi(2) / dim > worst)
    };
    let consider = |heap: &mut BinaryHeap<Candidate>, j: usize| {
        if j < cand {
            let d2: f64 = coords
                .row(i)
                .iter()
                .zip(coords.row(j))
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            heap.push((OrderedFloat(d2), j));
            if heap.len() > k {
                heap.pop();
            }
        }
    };
    while go_up || go_down {
        if go_up {
            if up >= sorted.len() || bound_exceeded(&heap, sorted[up]) {
                go_up = false;
            } else {
                consider(&mut heap, sorted[up]);
                up += 1;
            }
        }
        if go_down {
            let j = sorted[down - 1];
            if bound_exceeded(&heap, j) {
                go_down = false;
            } else {
                consider(&mut heap, j);
                down -= 1;
                go_down = down > 0;
            }
        }
    }
    heap.into_sorted_vec().into_iter().map(|(_, j)| j).collect()
}

/// Nearest earlier neighbours under the residual correlation distance
///
/// Points before `brute_force_threshold` (at least $k$) are scanned exhaustively,
/// later ones query one cover tree per rayon worker thread over contiguous segments of the
/// candidates.
#[must_use]
pub fn find_neighbors_residual<M: IndexMetric + ?Sized>(
    metric: &M,
    coords: &Coords,
    query: &NeighborQuery,
    cover_tree_base: f64,
    brute_force_threshold: usize,
) -> Neighborhoods {
    let n = coords.len();
    let (k, limit) = query.clamp(n);
    let first_i = (k + 1).max(query.start_at);
    let threshold = if query.prediction {
        n.min((first_i + PREDICTION_BRUTE_FORCE_EXTRA).max(k))
    } else {
        n.min(brute_force_threshold.max(k))
    };
    let trees = if threshold < n {
        let num_trees = rayon::current_num_threads();
        log::debug!("building {num_trees} cover trees over {limit} points");
        build_segmented(metric, limit, cover_tree_base, num_trees)
    } else {
        Vec::new()
    };

    let lists: Vec<Vec<usize>> = (query.start_at..n)
        .into_par_iter()
        .map(|i| {
            let cand = i.min(limit);
            if cand <= k {
                return (0..cand).collect();
            }
            let found = if i < threshold {
                brute_force_knn(metric, i, 0..cand, k)
            } else {
                forest_knn(&trees, metric, i, k, cover_tree_base)
            };
            found.into_iter().map(|(_, j)| j).collect()
        })
        .collect();
    finalize(coords, lists, query, k)
}

/// Attach Euclidean distances and check for duplicates
fn finalize(
    coords: &Coords,
    lists: Vec<Vec<usize>>,
    query: &NeighborQuery,
    k: usize,
) -> Neighborhoods {
    let start = query.start_at;
    let dists: Vec<(Mat<f64>, Mat<f64>)> = if query.save_distances || query.check_duplicates {
        lists
            .par_iter()
            .enumerate()
            .map(|(r, nb)| {
                let i = start + r;
                let obs = Mat::from_fn(nb.len(), 1, |a, _| coords.euclidean(i, nb[a]));
                let mut between = Mat::<f64>::zeros(nb.len(), nb.len());
                for a in 0..nb.len() {
                    for b in a + 1..nb.len() {
                        let d = coords.euclidean(nb[a], nb[b]);
                        between.write(a, b, d);
                        between.write(b, a, d);
                    }
                }
                (obs, between)
            })
            .collect()
    } else {
        Vec::new()
    };

    let has_duplicates = query.check_duplicates
        && dists.par_iter().any(|(obs, between)| {
            let n = between.nrows();
            (0..n).any(|a| obs.read(a, 0) < EPSILON_NUMBERS)
                || (0..n).any(|a| (a + 1..n).any(|b| between.read(a, b) < EPSILON_NUMBERS))
        });

    let (dist_obs_neighbors, dist_between_neighbors) = if query.save_distances {
        dists.into_iter().unzip()
    } else {
        (Vec::new(), Vec::new())
    };
    Neighborhoods {
        start_at: start,
        num_neighbors: k,
        neighbors: lists,
        dist_obs_neighbors,
        dist_between_neighbors,
        has_duplicates,
    }
}
