//! Cover tree over a contiguous segment of points for k nearest neighbour queries
//! among *earlier* points.
//!
//! The tree is a flat map from a node to its children. At level $\ell$ a node covers
//! every descendant within $R_{\ell} = \text{base}^{-\ell}$ (distances lie in $[0, 1]$, so
//! $R_{0} = 1$). Children are sorted by index and every node lists itself as its first child.

use std::{collections::BinaryHeap, collections::HashMap, ops::Range};

use itertools::Itertools;
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::distance::IndexMetric;

/// Past this depth every remaining point becomes its own node (duplicates never separate)
const MAX_LEVELS: usize = 64;

/// A neighbour candidate: distance and global index, ordered by distance then index
pub type Candidate = (OrderedFloat<f64>, usize);

/// Cover tree over the points `offset..offset + len`
#[derive(Clone, Debug)]
pub struct CoverTree {
    offset: usize,
    len: usize,
    levels: usize,
    nodes: HashMap<usize, Vec<usize>>,
}

impl CoverTree {
    /// Build the tree over `offset..offset + len`
    #[must_use]
    pub fn build<M: IndexMetric + ?Sized>(
        metric: &M,
        offset: usize,
        len: usize,
        base: f64,
    ) -> Self {
        let mut nodes: HashMap<usize, Vec<usize>> = HashMap::with_capacity(len);
        let mut levels = 0;
        if len > 0 {
            let mut uncovered: Vec<(usize, Vec<usize>)> =
                vec![(offset, (offset + 1..offset + len).collect())];
            while nodes.len() < len {
                levels += 1;
                let radius = if levels >= MAX_LEVELS {
                    f64::NEG_INFINITY
                } else {
                    base.powi(-i32::try_from(levels).unwrap_or(i32::MAX))
                };
                let mut next = Vec::new();
                for (parent, mut remaining) in uncovered {
                    let mut children = vec![parent];
                    while let Some((&sample, rest)) = remaining.split_first() {
                        children.push(sample);
                        let dists = metric.distances(sample, rest);
                        let mut covered = Vec::new();
                        let mut kept = Vec::with_capacity(rest.len());
                        for (&j, d) in rest.iter().zip(dists) {
                            if d <= radius {
                                covered.push(j);
                            } else {
                                kept.push(j);
                            }
                        }
                        next.push((sample, covered));
                        remaining = kept;
                    }
                    nodes.insert(parent, children);
                }
                uncovered = next;
            }
        }
        CoverTree {
            offset,
            len,
            levels,
            nodes,
        }
    }

    /// First index covered by the tree, which is also its root
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of levels created while building
    #[must_use]
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Children of `node` (starting with `node` itself)
    #[must_use]
    pub fn children(&self, node: usize) -> &[usize] {
        self.nodes.get(&node).map_or(&[], Vec::as_slice)
    }

    /// The `k` points of the tree with index below `i` closest to `i`, sorted by distance
    #[must_use]
    pub fn knn<M: IndexMetric + ?Sized>(
        &self,
        metric: &M,
        i: usize,
        k: usize,
        base: f64,
    ) -> Vec<Candidate> {
        let max_dist = 1.;
        let root = self.offset;
        let mut q: Vec<usize> = Vec::new();
        let mut q_dist: Vec<f64> = Vec::new();
        let mut diff_rev = vec![root];
        let mut q_before_size = 1;
        for ii in 1..self.levels {
            let mut added = Vec::new();
            if ii == 1 {
                added.push(root);
            }
            for &p in &diff_rev {
                for &c in self.children(p) {
                    if c >= i {
                        break;
                    }
                    if c != p {
                        added.push(c);
                    }
                }
            }
            diff_rev.clear();
            let early_stop = added.is_empty() || ii == self.levels - 1;
            q_dist.extend(metric.distances(i, &added));
            q.extend_from_slice(&added);

            let mut dist_k = max_dist;
            if ii > 1 {
                // descendants of a node from level ii - 1 lie within base^-(ii - 1) of it
                let level = i32::try_from(ii).unwrap_or(i32::MAX);
                dist_k = kth_smallest(&q_dist, k) + base.powi(1 - level);
            }
            if dist_k >= max_dist {
                if !early_stop {
                    diff_rev = if ii == 1 { added.split_off(1) } else { added };
                }
            } else {
                let mut kept_q = Vec::with_capacity(q.len());
                let mut kept_dist = Vec::with_capacity(q.len());
                for (pos, (&c, &d)) in q.iter().zip(&q_dist).enumerate() {
                    if d <= dist_k {
                        kept_q.push(c);
                        kept_dist.push(d);
                        if pos >= q_before_size {
                            diff_rev.push(c);
                        }
                    }
                }
                q = kept_q;
                q_dist = kept_dist;
            }
            q_before_size = q.len();
            if early_stop {
                break;
            }
        }

        if q.len() >= k && !q.is_empty() {
            top_k(q_dist.into_iter().zip(q), k)
        } else {
            brute_force_knn(metric, i, self.offset..i.min(self.offset + self.len), k)
        }
    }
}

fn kth_smallest(dists: &[f64], k: usize) -> f64 {
    if dists.len() < k || k == 0 {
        dists.iter().copied().fold(0., f64::max)
    } else {
        let mut tmp = dists.to_vec();
        let (_, kth, _) = tmp.select_nth_unstable_by(k - 1, f64::total_cmp);
        *kth
    }
}

/// The `k` smallest candidates, ties to the smaller index
pub(crate) fn top_k(cands: impl IntoIterator<Item = (f64, usize)>, k: usize) -> Vec<Candidate> {
    let mut heap = BinaryHeap::with_capacity(k + 1);
    for (d, j) in cands {
        heap.push((OrderedFloat(d), j));
        if heap.len() > k {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
}

/// Exact k nearest neighbours of `i` among `candidates`
pub(crate) fn brute_force_knn<M: IndexMetric + ?Sized>(
    metric: &M,
    i: usize,
    candidates: Range<usize>,
    k: usize,
) -> Vec<Candidate> {
    let js: Vec<usize> = candidates.collect();
    let dists = metric.distances(i, &js);
    top_k(dists.into_iter().zip(js), k)
}

/// Independent cover trees over `num_segments` contiguous segments of `0..len`, built in parallel
///
/// The last segment absorbs the remainder.
#[must_use]
pub fn build_segmented<M: IndexMetric + ?Sized>(
    metric: &M,
    len: usize,
    base: f64,
    num_segments: usize,
) -> Vec<CoverTree> {
    let t = num_segments.clamp(1, len.max(1));
    let seg = len / t;
    (0..t)
        .into_par_iter()
        .map(|s| {
            let offset = s * seg;
            let l = if s == t - 1 { len - offset } else { seg };
            CoverTree::build(metric, offset, l, base)
        })
        .collect()
}

/// k nearest earlier neighbours of `i` over all trees, merged by distance then index
#[must_use]
pub fn forest_knn<M: IndexMetric + ?Sized>(
    trees: &[CoverTree],
    metric: &M,
    i: usize,
    k: usize,
    base: f64,
) -> Vec<Candidate> {
    if k == 0 {
        return Vec::new();
    }
    let lists: Vec<Vec<Candidate>> = trees
        .iter()
        .filter(|t| !t.is_empty() && t.offset < i)
        .map(|t| {
            if t.offset + k <= i {
                t.knn(metric, i, k, base)
            } else {
                brute_force_knn(metric, i, t.offset..i.min(t.offset + t.len), k)
            }
        })
        .collect();
    if lists.len() == 1 {
        return lists.into_iter().flatten().collect();
    }
    lists.into_iter().kmerge().take(k).collect()
}
