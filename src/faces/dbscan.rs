//! Order-independent DBSCAN over L2-normalized embeddings.
//!
//! Neighborhoods are computed in parallel. Core components are found by
//! breadth-first search over core points only, so they do not depend on
//! visiting order. A border point reachable from several components joins the
//! component of its nearest core neighbor, lowest index on ties; callers pass
//! points sorted by face id so that tie-break is by lowest face id.

use rayon::prelude::*;
use std::collections::VecDeque;

/// Runs DBSCAN with Euclidean distance.
///
/// # Parameters
/// - `vectors`: the data points, already L2-normalized
/// - `eps`: maximum distance for two points to be neighbors (inclusive)
/// - `min_pts`: minimum neighborhood size for a core point, the point itself included
/// - `expired`: polled during the neighborhood scan; returning true aborts
///
/// # Returns
/// A label per vector: `Some(k)` for cluster `k` (numbered by lowest member
/// index), `None` for noise. `None` overall when `expired` fired.
pub(crate) fn dbscan<F>(vectors: &[Vec<f32>], eps: f32, min_pts: usize, expired: F) -> Option<Vec<Option<usize>>>
where
    F: Fn() -> bool + Sync,
{
    let n = vectors.len();
    let eps_sq = (eps as f64) * (eps as f64);

    let neighborhoods: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| {
            if expired() {
                None
            } else {
                Some(range_query(vectors, i, eps_sq))
            }
        })
        .collect::<Option<Vec<_>>>()?;

    let core: Vec<bool> = neighborhoods.iter().map(|nb| nb.len() >= min_pts).collect();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut next_label = 0;

    for start in 0..n {
        if !core[start] || labels[start].is_some() {
            continue;
        }
        labels[start] = Some(next_label);
        let mut queue = VecDeque::from([start]);
        while let Some(p) = queue.pop_front() {
            for &q in &neighborhoods[p] {
                if core[q] && labels[q].is_none() {
                    labels[q] = Some(next_label);
                    queue.push_back(q);
                }
            }
        }
        next_label += 1;
    }

    for i in 0..n {
        if core[i] {
            continue;
        }
        // Neighborhoods are in index order, so min_by keeps the lowest index on ties.
        let nearest = neighborhoods[i]
            .iter()
            .copied()
            .filter(|&j| core[j])
            .map(|j| (j, squared_distance(&vectors[i], &vectors[j])))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((j, _)) = nearest {
            labels[i] = labels[j];
        }
    }

    Some(labels)
}

/// Indices of all vectors within `eps` of vectors[idx], in index order.
fn range_query(vectors: &[Vec<f32>], idx: usize, eps_sq: f64) -> Vec<usize> {
    let q = &vectors[idx];
    vectors
        .iter()
        .enumerate()
        .filter(|(_, v)| squared_distance(q, v) <= eps_sq)
        .map(|(i, _)| i)
        .collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum()
}

/// Normalizes a vector to unit length in-place. Zero vectors are left as is.
pub(crate) fn l2_norm(v: &mut [f32]) {
    let sum: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum();
    let norm = sum.sqrt();
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}

/// Collect labels into groups of indices, ordered by label.
pub(crate) fn groups(labels: &[Option<usize>]) -> Vec<Vec<usize>> {
    let count = labels.iter().flatten().max().map_or(0, |&max| max + 1);
    let mut groups = vec![Vec::new(); count];
    for (i, label) in labels.iter().enumerate() {
        if let Some(label) = label {
            groups[*label].push(i);
        }
    }
    groups
}
