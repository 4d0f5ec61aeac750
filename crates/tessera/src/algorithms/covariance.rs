//! Covariance and correlation matrices.
//!
//! The partial result keeps the observation count, the column sums and the
//! `p × p` matrix of cross products of the mean-centered data. Shards merge
//! with the pairwise cross-product update:
//!
//! ```text
//! C = C_a + C_b + (n_a·n_b / n)·(μ_b - μ_a)(μ_b - μ_a)ᵀ
//! ```

use super::{filled, map_row_blocks, read_shaped, slot, write_slot};
use crate::compute::{
    Algorithm, CpuTier, Input, Kernel, KernelContext, KernelRegistry, Key, PartialSet, ResultSet,
};
use crate::error::ComputeError;

/// Covariance algorithm marker.
#[derive(Clone, Copy, Debug, Default)]
pub struct Covariance;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputId {
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartialId {
    /// 1 × 1 (i64).
    Count,
    /// 1 × p.
    Sum,
    /// p × p, centered.
    CrossProduct,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultId {
    /// p × p.
    Covariance,
    /// p × p. Undefined entries (zero variance) are NaN.
    Correlation,
    /// 1 × p.
    Mean,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Default,
}

impl crate::compute::Method for Method {
    fn name(self) -> &'static str {
        "default"
    }
}

/// Covariance parameter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Parameter {
    /// Divide by `n` instead of `n - 1`.
    pub biased: bool,
}

impl Key for InputId {
    fn name(self) -> &'static str {
        "data"
    }

    fn all() -> &'static [Self] {
        &[InputId::Data]
    }
}

impl Key for PartialId {
    fn name(self) -> &'static str {
        match self {
            PartialId::Count => "count",
            PartialId::Sum => "sum",
            PartialId::CrossProduct => "cross_product",
        }
    }

    fn all() -> &'static [Self] {
        &[PartialId::Count, PartialId::Sum, PartialId::CrossProduct]
    }
}

impl Key for ResultId {
    fn name(self) -> &'static str {
        match self {
            ResultId::Covariance => "covariance",
            ResultId::Correlation => "correlation",
            ResultId::Mean => "mean",
        }
    }

    fn all() -> &'static [Self] {
        &[ResultId::Covariance, ResultId::Correlation, ResultId::Mean]
    }
}

impl Algorithm for Covariance {
    const NAME: &'static str = "covariance";

    type Method = Method;
    type Parameter = Parameter;
    type InputId = InputId;
    type PartialId = PartialId;
    type ResultId = ResultId;

    fn check_partial(
        input: &Input<Self>,
        partial: &PartialSet<Self>,
        _param: &Parameter,
    ) -> Result<(), ComputeError> {
        let data_cols = input.table(InputId::Data)?.n_cols();
        let partial_cols = slot(partial, PartialId::Sum)?.n_cols();
        if data_cols != partial_cols {
            return Err(ComputeError::dimension_mismatch(
                "data columns",
                partial_cols,
                data_cols,
            ));
        }
        Ok(())
    }

    fn allocate_partial(
        input: &Input<Self>,
        _param: &Parameter,
    ) -> Result<PartialSet<Self>, ComputeError> {
        let p = input.table(InputId::Data)?.n_cols();
        let mut partial = PartialSet::<Self>::new();
        partial.insert_allocated(PartialId::Count, filled(1, 1, 0i64)?);
        partial.insert_allocated(PartialId::Sum, filled(1, p, 0.0f64)?);
        partial.insert_allocated(PartialId::CrossProduct, filled(p, p, 0.0f64)?);
        Ok(partial)
    }

    fn allocate_result(
        partial: &PartialSet<Self>,
        _param: &Parameter,
    ) -> Result<ResultSet<Self>, ComputeError> {
        let p = slot(partial, PartialId::Sum)?.n_cols();
        let mut result = ResultSet::<Self>::new();
        result.insert_allocated(ResultId::Covariance, filled(p, p, 0.0f64)?);
        result.insert_allocated(ResultId::Correlation, filled(p, p, 0.0f64)?);
        result.insert_allocated(ResultId::Mean, filled(1, p, 0.0f64)?);
        Ok(result)
    }

    fn register_kernels(registry: &mut KernelRegistry) {
        registry.register::<Self>(Method::Default, CpuTier::Baseline, CovarianceKernel::baseline());
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        registry.register::<Self>(Method::Default, CpuTier::Avx2, CovarianceKernel::avx2());
    }
}

// =============================================================================
// Accumulator
// =============================================================================

/// In-memory form of a covariance partial.
#[derive(Clone, Debug, PartialEq)]
pub struct CrossProducts {
    pub n: i64,
    pub sum: Vec<f64>,
    /// Row-major `p × p`.
    pub cross: Vec<f64>,
}

impl CrossProducts {
    pub fn empty(p: usize) -> Self {
        Self {
            n: 0,
            sum: vec![0.0; p],
            cross: vec![0.0; p * p],
        }
    }

    pub fn n_cols(&self) -> usize {
        self.sum.len()
    }

    /// Fold `other` into `self`. Zero-observation operands are identities.
    pub fn merge(&mut self, other: &CrossProducts) {
        if other.n == 0 {
            return;
        }
        if self.n == 0 {
            *self = other.clone();
            return;
        }
        let p = self.n_cols();
        let na = self.n as f64;
        let nb = other.n as f64;
        let weight = na * nb / (na + nb);
        let delta: Vec<f64> = (0..p)
            .map(|j| other.sum[j] / nb - self.sum[j] / na)
            .collect();
        for i in 0..p {
            for k in 0..p {
                let idx = i * p + k;
                self.cross[idx] = self.cross[idx] + other.cross[idx] + weight * delta[i] * delta[k];
            }
        }
        for (s, o) in self.sum.iter_mut().zip(&other.sum) {
            *s += o;
        }
        self.n += other.n;
    }

    pub fn read(partial: &PartialSet<Covariance>) -> Result<Self, ComputeError> {
        let p = slot(partial, PartialId::Sum)?.n_cols();
        let count = read_shaped::<_, i64>(partial, PartialId::Count, 1, 1)?;
        Ok(Self {
            n: count[0],
            sum: read_shaped(partial, PartialId::Sum, 1, p)?,
            cross: read_shaped(partial, PartialId::CrossProduct, p, p)?,
        })
    }

    pub fn write(&self, partial: &PartialSet<Covariance>) -> Result<(), ComputeError> {
        write_slot(partial, PartialId::Count, &[self.n])?;
        write_slot(partial, PartialId::Sum, &self.sum)?;
        write_slot(partial, PartialId::CrossProduct, &self.cross)
    }
}

fn block_sums(values: &[f64], n_rows: usize, p: usize) -> (CrossProducts, Vec<f64>) {
    let mut acc = CrossProducts::empty(p);
    acc.n = n_rows as i64;
    for row in values.chunks_exact(p) {
        for (s, &v) in acc.sum.iter_mut().zip(row) {
            *s += v;
        }
    }
    let n = n_rows as f64;
    let mean = acc.sum.iter().map(|&s| s / n).collect();
    (acc, mean)
}

/// Cross products of a row-major `n_rows × p` block.
pub(crate) fn block_cross(values: &[f64], n_rows: usize, p: usize) -> CrossProducts {
    if n_rows == 0 || p == 0 {
        let mut acc = CrossProducts::empty(p);
        acc.n = n_rows as i64;
        return acc;
    }
    let (mut acc, mean) = block_sums(values, n_rows, p);
    let mut centered = vec![0.0; p];
    for row in values.chunks_exact(p) {
        for j in 0..p {
            centered[j] = row[j] - mean[j];
        }
        for i in 0..p {
            let ci = centered[i];
            let dst = &mut acc.cross[i * p..(i + 1) * p];
            for (c, &ck) in dst.iter_mut().zip(&centered) {
                *c += ci * ck;
            }
        }
    }
    acc
}

// =============================================================================
// Kernel
// =============================================================================

type BlockFn = fn(&[f64], usize, usize) -> CrossProducts;

#[derive(Clone, Copy, Debug)]
pub struct CovarianceKernel {
    block: BlockFn,
}

impl CovarianceKernel {
    pub fn baseline() -> Self {
        Self { block: block_cross }
    }

    #[cfg(all(feature = "simd", target_arch = "x86_64"))]
    pub fn avx2() -> Self {
        Self {
            block: avx2::block_cross,
        }
    }
}

impl Kernel<Covariance> for CovarianceKernel {
    fn accumulate(
        &self,
        ctx: &KernelContext,
        input: &Input<Covariance>,
        _param: &Parameter,
        partial: &PartialSet<Covariance>,
    ) -> Result<(), ComputeError> {
        let data = input.table(InputId::Data)?;
        let p = data.n_cols();
        let blocks = map_row_blocks(ctx, data, |values, rows| (self.block)(values, rows.len(), p))?;
        let mut acc = CrossProducts::read(partial)?;
        for b in &blocks {
            acc.merge(b);
        }
        acc.write(partial)
    }

    fn merge(
        &self,
        _ctx: &KernelContext,
        _param: &Parameter,
        into: &PartialSet<Covariance>,
        other: &PartialSet<Covariance>,
    ) -> Result<(), ComputeError> {
        let mut acc = CrossProducts::read(into)?;
        let other = CrossProducts::read(other)?;
        if acc.n_cols() != other.n_cols() {
            return Err(ComputeError::dimension_mismatch(
                "partial columns",
                acc.n_cols(),
                other.n_cols(),
            ));
        }
        acc.merge(&other);
        acc.write(into)
    }

    fn finalize(
        &self,
        _ctx: &KernelContext,
        param: &Parameter,
        partial: &PartialSet<Covariance>,
        result: &ResultSet<Covariance>,
    ) -> Result<(), ComputeError> {
        let acc = CrossProducts::read(partial)?;
        let p = acc.n_cols();
        let n = acc.n as f64;
        let denom = if param.biased { n } else { n - 1.0 };

        let mean: Vec<f64> = if acc.n > 0 {
            acc.sum.iter().map(|&s| s / n).collect()
        } else {
            vec![f64::NAN; p]
        };
        let cov: Vec<f64> = if denom > 0.0 {
            acc.cross.iter().map(|&c| c / denom).collect()
        } else {
            vec![f64::NAN; p * p]
        };

        let mut corr = vec![f64::NAN; p * p];
        for i in 0..p {
            for k in 0..p {
                let scale = (acc.cross[i * p + i] * acc.cross[k * p + k]).sqrt();
                if acc.n > 1 && scale > 0.0 {
                    corr[i * p + k] = if i == k {
                        1.0
                    } else {
                        acc.cross[i * p + k] / scale
                    };
                }
            }
        }

        write_slot(result, ResultId::Mean, &mean)?;
        write_slot(result, ResultId::Covariance, &cov)?;
        write_slot(result, ResultId::Correlation, &corr)
    }
}

// =============================================================================
// AVX2
// =============================================================================

#[cfg(all(feature = "simd", target_arch = "x86_64"))]
mod avx2 {
    use wide::f64x4;

    use super::{block_sums, CrossProducts};
    use crate::compute::cpu;

    const LANES: usize = 4;

    pub(super) fn block_cross(values: &[f64], n_rows: usize, p: usize) -> CrossProducts {
        if cpu::caps().avx2 {
            // SAFETY: AVX2 availability was checked on the line above.
            unsafe { block_cross_avx2(values, n_rows, p) }
        } else {
            super::block_cross(values, n_rows, p)
        }
    }

    #[target_feature(enable = "avx2")]
    unsafe fn block_cross_avx2(values: &[f64], n_rows: usize, p: usize) -> CrossProducts {
        lanes(values, n_rows, p)
    }

    #[inline(always)]
    fn lanes(values: &[f64], n_rows: usize, p: usize) -> CrossProducts {
        if n_rows == 0 || p == 0 {
            let mut acc = CrossProducts::empty(p);
            acc.n = n_rows as i64;
            return acc;
        }
        let (mut acc, mean) = block_sums(values, n_rows, p);
        let full = p - p % LANES;
        let mut centered = vec![0.0; p];
        for row in values.chunks_exact(p) {
            for j in 0..p {
                centered[j] = row[j] - mean[j];
            }
            for i in 0..p {
                let ci = centered[i];
                let civ = f64x4::splat(ci);
                let dst = &mut acc.cross[i * p..(i + 1) * p];
                for k in (0..full).step_by(LANES) {
                    let c = f64x4::new([dst[k], dst[k + 1], dst[k + 2], dst[k + 3]]);
                    let ck = f64x4::new([
                        centered[k],
                        centered[k + 1],
                        centered[k + 2],
                        centered[k + 3],
                    ]);
                    let out = c + civ * ck;
                    dst[k..k + LANES].copy_from_slice(&out.to_array());
                }
                for k in full..p {
                    dst[k] += ci * centered[k];
                }
            }
        }
        acc
    }

}
