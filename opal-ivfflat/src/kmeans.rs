//! k-means++ seeding and Elkan-accelerated Lloyd refinement.
//!
//! Training runs over a reservoir sample in Euclidean geometry (Elkan's
//! pruning needs the triangle inequality). Cosine variants work on
//! normalized samples and re-normalize centroids every iteration;
//! inner-product variants never normalize.

use opal_core::host::{Interrupt, TupleScan};
use opal_core::types::MAX_DIM;
use opal_core::{Error, Result};
use opal_vector::distance::l2_squared;
use rand::Rng;
use rand::rngs::StdRng;
use rayon::prelude::*;

/// Hard cap on refinement rounds.
const MAX_ITERATIONS: usize = 500;

/// Stop once fewer than one point per thousand changes assignment.
const CONVERGENCE_DENOMINATOR: usize = 1000;

/// Flat row-major sample matrix.
pub(crate) struct TrainingSet {
    data: Vec<f32>,
    dim: usize,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

pub(crate) fn validate_tuple(dim: usize, data: &[f32]) -> Result<()> {
    if data.len() != dim {
        return Err(Error::DimensionMismatch {
            expected: dim,
            actual: data.len(),
        });
    }
    if data.len() > MAX_DIM {
        return Err(Error::BadInput(format!(
            "vector cannot have more than {MAX_DIM} dimensions"
        )));
    }
    if data.iter().any(|x| !x.is_finite()) {
        return Err(Error::BadInput(
            "NaN and infinity not allowed in vector".into(),
        ));
    }
    Ok(())
}

fn normalize_in_place(row: &mut [f32]) {
    let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in row {
            *x /= norm;
        }
    }
}

/// Algorithm-R reservoir sample of up to `target` tuples.
pub(crate) fn reservoir_sample(
    scan: &dyn TupleScan,
    dim: usize,
    target: usize,
    normalize: bool,
    rng: &mut StdRng,
    interrupt: &Interrupt,
) -> Result<TrainingSet> {
    let mut set = TrainingSet {
        data: Vec::new(),
        dim,
    };
    for (seen, (_tuple, data)) in scan.scan().enumerate() {
        if seen % 1024 == 0 {
            interrupt.check()?;
        }
        validate_tuple(dim, &data)?;
        if set.len() < target {
            set.data.extend_from_slice(&data);
            if normalize {
                let start = (set.len() - 1) * dim;
                normalize_in_place(&mut set.data[start..start + dim]);
            }
        } else {
            let j = rng.random_range(0..=seen);
            if j < target {
                let start = j * dim;
                set.data[start..start + dim].copy_from_slice(&data);
                if normalize {
                    normalize_in_place(&mut set.data[start..start + dim]);
                }
            }
        }
    }
    Ok(set)
}

/// k-means++ seeding: first centroid uniform, the rest weighted by
/// squared distance to the nearest chosen centroid.
pub(crate) fn kmeans_pp_seed(
    set: &TrainingSet,
    k: usize,
    rng: &mut StdRng,
    interrupt: &Interrupt,
) -> Result<Vec<f32>> {
    let n = set.len();
    let dim = set.dim;
    let mut centroids = Vec::with_capacity(k * dim);

    let first = rng.random_range(0..n);
    centroids.extend_from_slice(set.row(first));

    let mut nearest: Vec<f32> = (0..n)
        .into_par_iter()
        .map(|i| l2_squared(set.row(i), &centroids[..dim]))
        .collect();

    for _ in 1..k {
        interrupt.check()?;
        let total: f64 = nearest.iter().map(|x| f64::from(*x)).sum();
        let chosen = if total > 0.0 {
            let mut r = rng.random::<f64>() * total;
            let mut chosen = n - 1;
            for (i, w) in nearest.iter().enumerate() {
                r -= f64::from(*w);
                if r <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            // Sample collapse: every remaining point coincides with a
            // chosen centroid, so duplicates are the best we can do.
            rng.random_range(0..n)
        };
        let row = set.row(chosen).to_vec();
        nearest
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, best)| {
                let d = l2_squared(set.row(i), &row);
                if d < *best {
                    *best = d;
                }
            });
        centroids.extend_from_slice(&row);
    }
    Ok(centroids)
}

pub(crate) struct Training {
    pub centroids: Vec<f32>,
    pub iterations: usize,
    pub empty_lists: usize,
}

/// Lloyd refinement with Elkan's triangle-inequality pruning.
///
/// Keeps per-point upper bounds on the assigned distance and per-point
/// lower bounds per centroid, so most point-centroid distances are never
/// computed. Bounds and training distances are true Euclidean.
pub(crate) fn elkan_lloyd(
    set: &TrainingSet,
    mut centroids: Vec<f32>,
    k: usize,
    renormalize: bool,
    interrupt: &Interrupt,
) -> Result<Training> {
    let n = set.len();
    let dim = set.dim;

    // Exact initial assignment also fills every lower bound.
    let mut lower = vec![0f32; n * k];
    let mut assign = vec![0usize; n];
    let mut upper = vec![0f32; n];
    let mut tight = vec![true; n];
    {
        let centroids = &centroids;
        lower
            .par_chunks_mut(k)
            .zip(assign.par_iter_mut())
            .zip(upper.par_iter_mut())
            .enumerate()
            .for_each(|(i, ((bounds, a), u))| {
                let point = set.row(i);
                let mut best = 0usize;
                let mut best_d = f32::INFINITY;
                for (c, bound) in bounds.iter_mut().enumerate() {
                    let d = l2_squared(point, &centroids[c * dim..(c + 1) * dim]).sqrt();
                    *bound = d;
                    if d < best_d {
                        best_d = d;
                        best = c;
                    }
                }
                *a = best;
                *u = best_d;
            });
    }

    let mut half_cc = vec![0f32; k * k];
    let mut closest_half = vec![0f32; k];
    let mut iterations = 0usize;

    for round in 0..MAX_ITERATIONS {
        interrupt.check()?;
        iterations = round + 1;

        // Half distances between centroids, and each centroid's nearest
        // other centroid, for the two Elkan skip conditions.
        {
            let centroids = &centroids;
            half_cc
                .par_chunks_mut(k)
                .enumerate()
                .for_each(|(a, row)| {
                    for (b, slot) in row.iter_mut().enumerate() {
                        *slot = if a == b {
                            0.0
                        } else {
                            0.5 * l2_squared(
                                &centroids[a * dim..(a + 1) * dim],
                                &centroids[b * dim..(b + 1) * dim],
                            )
                            .sqrt()
                        };
                    }
                });
        }
        for c in 0..k {
            closest_half[c] = (0..k)
                .filter(|other| *other != c)
                .map(|other| half_cc[c * k + other])
                .fold(f32::INFINITY, f32::min);
        }

        let changed = std::sync::atomic::AtomicUsize::new(0);
        {
            let centroids = &centroids;
            let half_cc = &half_cc;
            let closest_half = &closest_half;
            let changed = &changed;
            lower
                .par_chunks_mut(k)
                .zip(assign.par_iter_mut())
                .zip(upper.par_iter_mut())
                .zip(tight.par_iter_mut())
                .enumerate()
                .for_each(|(i, (((bounds, a), u), is_tight))| {
                    if *u <= closest_half[*a] {
                        return;
                    }
                    let point = set.row(i);
                    let mut moved = false;
                    for c in 0..k {
                        if c == *a || *u <= bounds[c] || *u <= half_cc[*a * k + c] {
                            continue;
                        }
                        if !*is_tight {
                            let exact =
                                l2_squared(point, &centroids[*a * dim..(*a + 1) * dim]).sqrt();
                            *u = exact;
                            bounds[*a] = exact;
                            *is_tight = true;
                            if *u <= bounds[c] || *u <= half_cc[*a * k + c] {
                                continue;
                            }
                        }
                        let d = l2_squared(point, &centroids[c * dim..(c + 1) * dim]).sqrt();
                        bounds[c] = d;
                        if d < *u {
                            *a = c;
                            *u = d;
                            moved = true;
                        }
                    }
                    if moved {
                        changed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                });
        }

        // Recompute centroids as assignment means; empty clusters keep
        // their old position until the repair pass.
        let mut sums = vec![0f64; k * dim];
        let mut counts = vec![0usize; k];
        for i in 0..n {
            let c = assign[i];
            counts[c] += 1;
            for (slot, x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(set.row(i)) {
                *slot += f64::from(*x);
            }
        }
        let mut shift = vec![0f32; k];
        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            let mut updated: Vec<f32> = sums[c * dim..(c + 1) * dim]
                .iter()
                .map(|x| (*x / counts[c] as f64) as f32)
                .collect();
            if renormalize {
                normalize_in_place(&mut updated);
            }
            shift[c] = l2_squared(&updated, &centroids[c * dim..(c + 1) * dim]).sqrt();
            centroids[c * dim..(c + 1) * dim].copy_from_slice(&updated);
        }

        // Bound maintenance after the centroid moves.
        lower
            .par_chunks_mut(k)
            .zip(assign.par_iter())
            .zip(upper.par_iter_mut())
            .zip(tight.par_iter_mut())
            .for_each(|(((bounds, a), u), is_tight)| {
                for (c, bound) in bounds.iter_mut().enumerate() {
                    *bound = (*bound - shift[c]).max(0.0);
                }
                if shift[*a] > 0.0 {
                    *u += shift[*a];
                    *is_tight = false;
                }
            });

        let changed = changed.into_inner();
        if changed * CONVERGENCE_DENOMINATOR < n.max(1) {
            break;
        }
    }

    // Empty-list repair: an unused centroid moves onto the point that sits
    // farthest out in its nearest populated cluster, then one plain Lloyd
    // round re-settles the assignment.
    let mut counts = vec![0usize; k];
    for a in &assign {
        counts[*a] += 1;
    }
    if counts.iter().any(|c| *c == 0) {
        repair_empty_clusters(set, &mut centroids, k, &counts, renormalize);
        assign = plain_assign(set, &centroids, k);
        recompute_means(set, &mut centroids, k, &assign, renormalize);
        iterations += 1;
        counts = vec![0usize; k];
        for a in &assign {
            counts[*a] += 1;
        }
    }

    Ok(Training {
        centroids,
        iterations,
        empty_lists: counts.iter().filter(|c| **c == 0).count(),
    })
}

fn repair_empty_clusters(
    set: &TrainingSet,
    centroids: &mut [f32],
    k: usize,
    counts: &[usize],
    renormalize: bool,
) {
    let dim = set.dim;
    let assign = plain_assign(set, centroids, k);
    for empty in 0..k {
        if counts[empty] > 0 {
            continue;
        }
        // Nearest populated centroid to the empty one.
        let Some(donor) = (0..k)
            .filter(|c| counts[*c] > 0 && *c != empty)
            .min_by(|a, b| {
                let da = l2_squared(
                    &centroids[a * dim..(a + 1) * dim],
                    &centroids[empty * dim..(empty + 1) * dim],
                );
                let db = l2_squared(
                    &centroids[b * dim..(b + 1) * dim],
                    &centroids[empty * dim..(empty + 1) * dim],
                );
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
        else {
            continue;
        };
        // Farthest point of the donor cluster becomes the new centroid.
        let farthest = (0..set.len())
            .filter(|i| assign[*i] == donor)
            .max_by(|a, b| {
                let da = l2_squared(set.row(*a), &centroids[donor * dim..(donor + 1) * dim]);
                let db = l2_squared(set.row(*b), &centroids[donor * dim..(donor + 1) * dim]);
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(point) = farthest {
            centroids[empty * dim..(empty + 1) * dim].copy_from_slice(set.row(point));
            if renormalize {
                normalize_in_place(&mut centroids[empty * dim..(empty + 1) * dim]);
            }
        }
    }
}

fn plain_assign(set: &TrainingSet, centroids: &[f32], k: usize) -> Vec<usize> {
    let dim = set.dim;
    (0..set.len())
        .into_par_iter()
        .map(|i| {
            let point = set.row(i);
            let mut best = 0usize;
            let mut best_d = f32::INFINITY;
            for c in 0..k {
                let d = l2_squared(point, &centroids[c * dim..(c + 1) * dim]);
                if d < best_d {
                    best_d = d;
                    best = c;
                }
            }
            best
        })
        .collect()
}

fn recompute_means(
    set: &TrainingSet,
    centroids: &mut [f32],
    k: usize,
    assign: &[usize],
    renormalize: bool,
) {
    let dim = set.dim;
    let mut sums = vec![0f64; k * dim];
    let mut counts = vec![0usize; k];
    for i in 0..set.len() {
        let c = assign[i];
        counts[c] += 1;
        for (slot, x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(set.row(i)) {
            *slot += f64::from(*x);
        }
    }
    for c in 0..k {
        if counts[c] == 0 {
            continue;
        }
        for (slot, sum) in centroids[c * dim..(c + 1) * dim]
            .iter_mut()
            .zip(&sums[c * dim..(c + 1) * dim])
        {
            *slot = (*sum / counts[c] as f64) as f32;
        }
        if renormalize {
            normalize_in_place(&mut centroids[c * dim..(c + 1) * dim]);
        }
    }
}

/// Full training pipeline over an already-collected sample.
pub(crate) fn train(
    set: &TrainingSet,
    k: usize,
    renormalize: bool,
    rng: &mut StdRng,
    interrupt: &Interrupt,
) -> Result<Training> {
    let n = set.len();
    let dim = set.dim;

    if n == 0 {
        // Empty table: centroids at the origin, populated by later inserts.
        return Ok(Training {
            centroids: vec![0f32; k * dim],
            iterations: 0,
            empty_lists: k,
        });
    }

    if n <= k {
        // Fewer samples than lists: each sample seeds one centroid and the
        // remainder repeat, leaving duplicate centroids and empty lists.
        let mut centroids = Vec::with_capacity(k * dim);
        for c in 0..k {
            centroids.extend_from_slice(set.row(c % n));
        }
        return Ok(Training {
            centroids,
            iterations: 0,
            empty_lists: k.saturating_sub(n),
        });
    }

    let seeds = kmeans_pp_seed(set, k, rng, interrupt)?;
    elkan_lloyd(set, seeds, k, renormalize, interrupt)
}
