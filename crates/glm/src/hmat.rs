//! Hierarchical matrix factorization of the discretized covariance.
//!
//! Points are ordered along a binary cluster tree built by recursive bisection along the
//! widest axis. The covariance matrix in that ordering is stored as a 2x2 block tree:
//! diagonal blocks are split recursively down to dense leaves while off-diagonal blocks
//! are approximated by low-rank products `U.Vt`, computed by adaptive cross approximation (ACA)
//! then recompressed with a truncated SVD.
//!
//! The Cholesky factorization works in place on the same structure, the Schur complement
//! updates being low-rank products recompressed on the fly.

use crate::covariance_models::CovarianceModel;
use crate::errors::{GlmError, Result};
use crate::factorization::{full_svd, CholeskyFactor, Regularization};
use linfa::Float;
use linfa_linalg::{cholesky::*, qr::*, triangular::*};
use log::debug;
use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use ndarray_stats::QuantileExt;
use std::cmp::Ordering;

/// Settings of the hierarchical matrix backend
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HMatrixParameters {
    /// Relative accuracy of the cross approximation of off-diagonal blocks
    pub assembly_epsilon: f64,
    /// Relative accuracy of the low-rank recompressions
    pub recompression_epsilon: f64,
    /// Maximum number of points in a leaf of the cluster tree
    pub max_leaf_size: usize,
}

impl Default for HMatrixParameters {
    fn default() -> Self {
        HMatrixParameters {
            assembly_epsilon: 1e-5,
            recompression_epsilon: 1e-5,
            max_leaf_size: 100,
        }
    }
}

/// A low-rank block `U.Vt`
#[derive(Clone, Debug)]
struct LowRank<F: Float> {
    u: Array2<F>,
    v: Array2<F>,
}

impl<F: Float> LowRank<F> {
    fn rank(&self) -> usize {
        self.u.ncols()
    }

    fn to_dense(&self) -> Array2<F> {
        self.u.dot(&self.v.t())
    }

    /// Cross approximation of the (m, n) block given by `entry` with partial pivoting
    fn cross_approximation(
        m: usize,
        n: usize,
        entry: impl Fn(usize, usize) -> F,
        epsilon: F,
    ) -> Self {
        let max_rank = m.min(n);
        let mut us: Vec<Array1<F>> = Vec::new();
        let mut vs: Vec<Array1<F>> = Vec::new();
        let mut used_rows = vec![false; m];
        let mut norm2 = F::zero();
        let mut pivot_row = if m > 0 { Some(0) } else { None };

        while let Some(i) = pivot_row {
            if us.len() >= max_rank {
                break;
            }
            used_rows[i] = true;
            let mut row = Array1::from_shape_fn(n, |j| entry(i, j));
            for (u, v) in us.iter().zip(vs.iter()) {
                row.scaled_add(-u[i], v);
            }
            let j = row.mapv(|x| x.abs()).argmax().unwrap_or(0);
            let pivot = row[j];
            if pivot == F::zero() || !pivot.is_finite() {
                // row already reproduced, try the next unused one
                pivot_row = used_rows.iter().position(|used| !used);
                continue;
            }
            let v = row.mapv(|x| x / pivot);
            let mut u = Array1::from_shape_fn(m, |k| entry(k, j));
            for (uk, vk) in us.iter().zip(vs.iter()) {
                u.scaled_add(-vk[j], uk);
            }

            let step2 = u.dot(&u) * v.dot(&v);
            let cross = us
                .iter()
                .zip(vs.iter())
                .fold(F::zero(), |acc, (uk, vk)| acc + u.dot(uk) * v.dot(vk));
            norm2 += step2 + F::cast(2.) * cross;
            let converged = step2 <= epsilon * epsilon * norm2.abs();

            pivot_row = u
                .iter()
                .enumerate()
                .filter(|(k, _)| !used_rows[*k])
                .fold(None, |best: Option<(usize, F)>, (k, x)| match best {
                    Some((_, bx)) if bx >= x.abs() => best,
                    _ => Some((k, x.abs())),
                })
                .map(|(k, _)| k);
            us.push(u);
            vs.push(v);
            if converged {
                break;
            }
        }
        LowRank {
            u: stack_columns(&us, m),
            v: stack_columns(&vs, n),
        }
    }

    /// Approximation of the off-diagonal block of the given rows and columns.
    ///
    /// Each (marginal, marginal) sub-block is crossed separately: marginals may be
    /// uncorrelated and partial pivoting cannot reach the rows of a marginal from the
    /// pivots of another one.
    fn assemble(
        entry: &impl Fn(usize, usize) -> F,
        rows: &[usize],
        cols: &[usize],
        settings: &BlockSettings<F>,
    ) -> Result<Self> {
        let dim = settings.dim;
        let marginal = |indices: &[usize], k: usize| -> Vec<usize> {
            (0..indices.len()).filter(|&i| indices[i] % dim == k).collect()
        };
        let mut parts = Vec::with_capacity(dim * dim);
        for k in 0..dim {
            let sub_rows = marginal(rows, k);
            for l in 0..dim {
                let sub_cols = marginal(cols, l);
                let part = LowRank::cross_approximation(
                    sub_rows.len(),
                    sub_cols.len(),
                    |i, j| entry(rows[sub_rows[i]], cols[sub_cols[j]]),
                    settings.assembly_epsilon,
                );
                parts.push((sub_rows.clone(), sub_cols, part));
            }
        }

        let rank: usize = parts.iter().map(|(_, _, part)| part.rank()).sum();
        let mut u = Array2::zeros((rows.len(), rank));
        let mut v = Array2::zeros((cols.len(), rank));
        let mut offset = 0;
        for (sub_rows, sub_cols, part) in parts {
            let r = part.rank();
            for (i, &row) in sub_rows.iter().enumerate() {
                u.slice_mut(s![row, offset..offset + r]).assign(&part.u.row(i));
            }
            for (j, &col) in sub_cols.iter().enumerate() {
                v.slice_mut(s![col, offset..offset + r]).assign(&part.v.row(j));
            }
            offset += r;
        }
        LowRank { u, v }.recompress(settings.recompression_epsilon)
    }

    /// Truncate to the singular values above `epsilon` times the largest one
    fn recompress(self, epsilon: F) -> Result<Self> {
        let (m, n, k) = (self.u.nrows(), self.v.nrows(), self.rank());
        if k == 0 {
            return Ok(self);
        }
        if k >= m.min(n) {
            return truncated_svd(&self.to_dense(), epsilon);
        }
        let (qu, ru) = self.u.qr()?.into_decomp();
        let (qv, rv) = self.v.qr()?.into_decomp();
        let (w, sv, zt) = full_svd(&ru.dot(&rv.t()))?;
        let kept = significant_values(&sv, epsilon);
        Ok(LowRank {
            u: qu.dot(&scaled_columns(&w, &sv, &kept)),
            v: qv.dot(&zt.select(Axis(0), &kept).t()),
        })
    }
}

fn stack_columns<F: Float>(vectors: &[Array1<F>], len: usize) -> Array2<F> {
    Array2::from_shape_fn((len, vectors.len()), |(i, k)| vectors[k][i])
}

/// Indices of singular values greater than `epsilon` times the largest one, in decreasing order
fn significant_values<F: Float>(sv: &Array1<F>, epsilon: F) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..sv.len()).collect();
    indices.sort_by(|&a, &b| sv[b].partial_cmp(&sv[a]).unwrap_or(Ordering::Equal));
    let threshold = indices.first().map_or(F::zero(), |&i| sv[i] * epsilon);
    indices
        .into_iter()
        .filter(|&i| sv[i] > threshold && sv[i] > F::zero())
        .collect()
}

fn scaled_columns<F: Float>(w: &Array2<F>, sv: &Array1<F>, kept: &[usize]) -> Array2<F> {
    Array2::from_shape_fn((w.nrows(), kept.len()), |(i, c)| {
        w[[i, kept[c]]] * sv[kept[c]]
    })
}

/// Low-rank approximation of a dense block by truncated SVD
fn truncated_svd<F: Float>(block: &Array2<F>, epsilon: F) -> Result<LowRank<F>> {
    if block.nrows() >= block.ncols() {
        let (q, r) = block.qr()?.into_decomp();
        let (w, sv, zt) = full_svd(&r)?;
        let kept = significant_values(&sv, epsilon);
        Ok(LowRank {
            u: q.dot(&scaled_columns(&w, &sv, &kept)),
            v: zt.select(Axis(0), &kept).t().to_owned(),
        })
    } else {
        // block.t = q.r = q.w.s.zt
        let (q, r) = block.t().to_owned().qr()?.into_decomp();
        let (w, sv, zt) = full_svd(&r)?;
        let kept = significant_values(&sv, epsilon);
        Ok(LowRank {
            u: scaled_columns(&zt.t().to_owned(), &sv, &kept),
            v: q.dot(&w.select(Axis(1), &kept)),
        })
    }
}

struct BlockSettings<F: Float> {
    dim: usize,
    max_leaf_size: usize,
    assembly_epsilon: F,
    recompression_epsilon: F,
}

impl<F: Float> BlockSettings<F> {
    /// Settings of the given factorization retry, both accuracies being divided by 10 per retry
    fn new(params: &HMatrixParameters, dim: usize, retry: usize) -> Self {
        let tightening = F::cast(10f64.powi(retry as i32));
        BlockSettings {
            dim,
            max_leaf_size: params.max_leaf_size.max(1),
            assembly_epsilon: F::cast(params.assembly_epsilon) / tightening,
            recompression_epsilon: F::cast(params.recompression_epsilon) / tightening,
        }
    }
}

/// Node of the block tree, rows and columns follow the cluster ordering
#[derive(Clone, Debug)]
enum HBlock<F: Float> {
    Full(Array2<F>),
    Split {
        n1: usize,
        a11: Box<HBlock<F>>,
        a21: LowRank<F>,
        a22: Box<HBlock<F>>,
    },
}

impl<F: Float> HBlock<F> {
    /// Assemble the block of the given matrix rows (original indices in cluster order)
    fn assemble(
        entry: &impl Fn(usize, usize) -> F,
        rows: &[usize],
        settings: &BlockSettings<F>,
    ) -> Result<Self> {
        let n = rows.len();
        let n_points = n / settings.dim;
        if n_points <= settings.max_leaf_size {
            return Ok(HBlock::Full(Array2::from_shape_fn((n, n), |(i, j)| {
                entry(rows[i], rows[j])
            })));
        }
        let n1 = (n_points / 2) * settings.dim;
        let (rows1, rows2) = rows.split_at(n1);
        let a11 = HBlock::assemble(entry, rows1, settings)?;
        let a22 = HBlock::assemble(entry, rows2, settings)?;
        let a21 = LowRank::assemble(entry, rows2, rows1, settings)?;
        Ok(HBlock::Split {
            n1,
            a11: Box::new(a11),
            a21,
            a22: Box::new(a22),
        })
    }

    fn size(&self) -> usize {
        match self {
            HBlock::Full(a) => a.nrows(),
            HBlock::Split { n1, a21, .. } => n1 + a21.u.nrows(),
        }
    }

    /// Number of stored values
    fn storage(&self) -> usize {
        match self {
            HBlock::Full(a) => a.len(),
            HBlock::Split { a11, a21, a22, .. } => {
                a11.storage() + a21.u.len() + a21.v.len() + a22.storage()
            }
        }
    }

    /// In place block Cholesky factorization
    fn factorize(&mut self, epsilon: F) -> Result<()> {
        match self {
            HBlock::Full(a) => {
                *a = a.cholesky()?;
                Ok(())
            }
            HBlock::Split { a11, a21, a22, .. } => {
                a11.factorize(epsilon)?;
                if a21.rank() > 0 {
                    // L21 = A21.L11^-t = U.(L11^-1.V)t
                    let w = a11.solve_lower(&a21.v.view())?;
                    let y = a21.u.dot(&w.t().dot(&w));
                    a22.subtract_low_rank(&a21.u.view(), &y.view(), epsilon)?;
                    a21.v = w;
                }
                a22.factorize(epsilon)
            }
        }
    }

    /// In place `A -= X.Yt` on the lower block triangle
    fn subtract_low_rank(&mut self, x: &ArrayView2<F>, y: &ArrayView2<F>, epsilon: F) -> Result<()> {
        if x.ncols() == 0 {
            return Ok(());
        }
        match self {
            HBlock::Full(a) => {
                *a -= &x.dot(&y.t());
                Ok(())
            }
            HBlock::Split { n1, a11, a21, a22 } => {
                let n1 = *n1;
                let (x1, x2) = (x.slice(s![..n1, ..]), x.slice(s![n1.., ..]));
                let (y1, y2) = (y.slice(s![..n1, ..]), y.slice(s![n1.., ..]));
                a11.subtract_low_rank(&x1, &y1, epsilon)?;
                a22.subtract_low_rank(&x2, &y2, epsilon)?;
                let u = concatenate![Axis(1), a21.u, x2.mapv(|v| -v)];
                let v = concatenate![Axis(1), a21.v, y1];
                *a21 = LowRank { u, v }.recompress(epsilon)?;
                Ok(())
            }
        }
    }

    fn solve_lower(&self, b: &ArrayView2<F>) -> Result<Array2<F>> {
        match self {
            HBlock::Full(l) => Ok(l.solve_triangular(b, UPLO::Lower)?),
            HBlock::Split { n1, a11, a21, a22 } => {
                let n1 = *n1;
                let z1 = a11.solve_lower(&b.slice(s![..n1, ..]))?;
                let rhs = &b.slice(s![n1.., ..]) - &a21.u.dot(&a21.v.t().dot(&z1));
                let z2 = a22.solve_lower(&rhs.view())?;
                Ok(concatenate![Axis(0), z1, z2])
            }
        }
    }

    fn solve_upper(&self, b: &ArrayView2<F>) -> Result<Array2<F>> {
        match self {
            HBlock::Full(l) => Ok(l.t().solve_triangular(b, UPLO::Upper)?),
            HBlock::Split { n1, a11, a21, a22 } => {
                let n1 = *n1;
                let z2 = a22.solve_upper(&b.slice(s![n1.., ..]))?;
                let rhs = &b.slice(s![..n1, ..]) - &a21.v.dot(&a21.u.t().dot(&z2));
                let z1 = a11.solve_upper(&rhs.view())?;
                Ok(concatenate![Axis(0), z1, z2])
            }
        }
    }

    fn diagonal(&self) -> Array1<F> {
        match self {
            HBlock::Full(l) => l.diag().to_owned(),
            HBlock::Split { a11, a22, .. } => {
                concatenate![Axis(0), a11.diagonal(), a22.diagonal()]
            }
        }
    }

    fn scale(&mut self, alpha: F) {
        match self {
            HBlock::Full(l) => l.mapv_inplace(|v| v * alpha),
            HBlock::Split { a11, a21, a22, .. } => {
                a11.scale(alpha);
                a21.u.mapv_inplace(|v| v * alpha);
                a22.scale(alpha);
            }
        }
    }

    /// Dense lower block triangle
    fn to_dense(&self) -> Array2<F> {
        match self {
            HBlock::Full(l) => l.to_owned(),
            HBlock::Split { n1, a11, a21, a22 } => {
                let n1 = *n1;
                let n = self.size();
                let mut m = Array2::zeros((n, n));
                m.slice_mut(s![..n1, ..n1]).assign(&a11.to_dense());
                m.slice_mut(s![n1.., ..n1]).assign(&a21.to_dense());
                m.slice_mut(s![n1.., n1..]).assign(&a22.to_dense());
                m
            }
        }
    }
}

/// Order `indices` of points so that each half of a recursive bisection along the
/// widest axis is contiguous, down to `max_leaf_size` points.
fn cluster_order<F: Float>(points: &Array2<F>, indices: &mut [usize], max_leaf_size: usize) {
    if indices.len() <= max_leaf_size {
        return;
    }
    let extents: Array1<F> = points
        .columns()
        .into_iter()
        .map(|col| {
            let (lo, up) = indices.iter().fold(
                (F::infinity(), F::neg_infinity()),
                |(lo, up), &i| (lo.min(col[i]), up.max(col[i])),
            );
            up - lo
        })
        .collect();
    let axis = extents.argmax().unwrap_or(0);
    indices.sort_by(|&a, &b| {
        points[[a, axis]]
            .partial_cmp(&points[[b, axis]])
            .unwrap_or(Ordering::Equal)
    });
    let (left, right) = indices.split_at_mut(indices.len() / 2);
    cluster_order(points, left, max_leaf_size);
    cluster_order(points, right, max_leaf_size);
}

/// Hierarchical Cholesky factor of a covariance matrix `C`: `P.C.Pt = L.Lt`
/// where `P` is the cluster ordering permutation.
#[derive(Clone, Debug)]
pub struct HMatrix<F: Float> {
    /// `permutation[k]` is the covariance matrix row stored at row `k`
    permutation: Vec<usize>,
    root: HBlock<F>,
}

impl<F: Float> HMatrix<F> {
    /// Assemble the covariance of `model` discretized on `points` with `noise` variances added
    /// and factorize it. On failure the diagonal is regularized and both accuracies are
    /// divided by 10 for each retry.
    pub(crate) fn factorize<M: CovarianceModel<F>>(
        model: &M,
        points: &Array2<F>,
        noise: Option<&Array1<F>>,
        params: &HMatrixParameters,
        regularization: &Regularization<F>,
    ) -> Result<(Self, F)> {
        let dim = model.dim();
        let max_leaf_size = params.max_leaf_size.max(1);
        let mut order: Vec<usize> = (0..points.nrows()).collect();
        cluster_order(points, &mut order, max_leaf_size);
        let permutation: Vec<usize> = order
            .iter()
            .flat_map(|&p| (0..dim).map(move |k| p * dim + k))
            .collect();
        let nugget = model.nugget_diagonal();

        regularization.run(|cumulated_scaling, retry| {
            let settings = BlockSettings::new(params, dim, retry);
            if retry > 0 {
                debug!(
                    "Hierarchical accuracies tightened to {} and {}",
                    settings.assembly_epsilon, settings.recompression_epsilon
                );
            }
            let entry = |i: usize, j: usize| {
                let c = model.compute(&points.row(i / dim), &points.row(j / dim))[[i % dim, j % dim]];
                if i == j {
                    c + nugget[i % dim]
                        + noise.map_or(F::zero(), |nu| nu[i / dim])
                        + cumulated_scaling
                } else {
                    c
                }
            };
            let attempt = HBlock::assemble(&entry, &permutation, &settings).and_then(|mut root| {
                root.factorize(settings.recompression_epsilon)?;
                Ok(root)
            });
            match attempt {
                Ok(root) => {
                    let n = permutation.len();
                    debug!(
                        "Hierarchical factor of size {n} stores {} values ({} dense)",
                        root.storage(),
                        n * n
                    );
                    Ok(Some(HMatrix {
                        permutation: permutation.clone(),
                        root,
                    }))
                }
                Err(err) => {
                    debug!("Hierarchical factorization failed: {err}");
                    Ok(None)
                }
            }
        })
    }

    /// Cluster ordering of the covariance matrix rows
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Dense matrix `Pt.L` such that `C = (Pt.L).(Pt.L)t`
    pub fn factor_matrix(&self) -> Array2<F> {
        let l = self.root.to_dense();
        let mut m = Array2::zeros(l.raw_dim());
        for (k, &p) in self.permutation.iter().enumerate() {
            m.row_mut(p).assign(&l.row(k));
        }
        m
    }

    fn check_rows(&self, b: &Array2<F>) -> Result<()> {
        if b.nrows() != self.size() {
            return Err(GlmError::dimension_mismatch(
                "right hand side rows",
                self.size(),
                b.nrows(),
            ));
        }
        Ok(())
    }
}

impl<F: Float> CholeskyFactor<F> for HMatrix<F> {
    fn size(&self) -> usize {
        self.permutation.len()
    }

    fn solve_lower(&self, b: &Array2<F>) -> Result<Array2<F>> {
        self.check_rows(b)?;
        let permuted = b.select(Axis(0), &self.permutation);
        self.root.solve_lower(&permuted.view())
    }

    fn solve_upper(&self, b: &Array2<F>) -> Result<Array2<F>> {
        self.check_rows(b)?;
        let z = self.root.solve_upper(&b.view())?;
        let mut x = Array2::zeros(z.raw_dim());
        for (k, &p) in self.permutation.iter().enumerate() {
            x.row_mut(p).assign(&z.row(k));
        }
        Ok(x)
    }

    /// Diagonal of `L` in cluster ordering
    fn diagonal(&self) -> Array1<F> {
        self.root.diagonal()
    }

    fn scale(&mut self, alpha: F) {
        self.root.scale(alpha)
    }
}
