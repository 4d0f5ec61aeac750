//! Low-order moments per column.
//!
//! # Partial result
//!
//! | Key | Shape | Contents |
//! |---|---|---|
//! | `Count` | 1 × 1 (i64) | observations |
//! | `Min`, `Max` | 1 × p | extrema (`+∞` / `-∞` with no observations) |
//! | `Sum`, `SumSquares` | 1 × p | `Σx`, `Σx²` |
//! | `SumSquaresCentered` | 1 × p | `Σ(x - x̄)²` |
//!
//! Two partials merge with the pairwise update of the centered sum of
//! squares, so merging is exact for the additive fields and independent of
//! the order of shards.
//!
//! # Methods
//!
//! - [`Method::Default`]: two passes per row block (centered sums computed
//!   around the block mean). Baseline and AVX2 kernels.
//! - [`Method::SinglePass`]: one pass per block; the centered sum is derived
//!   from `Σx` and `Σx²`. Baseline kernel only.

use serde::{Deserialize, Serialize};

use super::{filled, map_row_blocks, read_shaped, slot, write_slot};
use crate::compute::{
    Algorithm, CpuTier, Input, Kernel, KernelContext, KernelRegistry, Key, PartialSet, ResultSet,
};
use crate::error::ComputeError;

/// Moments algorithm marker.
#[derive(Clone, Copy, Debug, Default)]
pub struct Moments;

/// Input slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputId {
    /// `n × p` observations.
    Data,
}

/// Partial-result slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartialId {
    Count,
    Min,
    Max,
    Sum,
    SumSquares,
    SumSquaresCentered,
}

/// Result slots. Every result is `1 × p`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultId {
    Minimum,
    Maximum,
    Sum,
    SumSquares,
    SumSquaresCentered,
    Mean,
    SecondOrderRawMoment,
    /// Sample variance (`n - 1` denominator).
    Variance,
    StandardDeviation,
    /// Coefficient of variation, `σ / x̄`.
    Variation,
}

/// Computation method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[default]
    Default,
    SinglePass,
}

impl crate::compute::Method for Method {
    fn name(self) -> &'static str {
        match self {
            Method::Default => "default",
            Method::SinglePass => "single_pass",
        }
    }
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
            PartialId::Min => "min",
            PartialId::Max => "max",
            PartialId::Sum => "sum",
            PartialId::SumSquares => "sum_squares",
            PartialId::SumSquaresCentered => "sum_squares_centered",
        }
    }

    fn all() -> &'static [Self] {
        &[
            PartialId::Count,
            PartialId::Min,
            PartialId::Max,
            PartialId::Sum,
            PartialId::SumSquares,
            PartialId::SumSquaresCentered,
        ]
    }
}

impl Key for ResultId {
    fn name(self) -> &'static str {
        match self {
            ResultId::Minimum => "minimum",
            ResultId::Maximum => "maximum",
            ResultId::Sum => "sum",
            ResultId::SumSquares => "sum_squares",
            ResultId::SumSquaresCentered => "sum_squares_centered",
            ResultId::Mean => "mean",
            ResultId::SecondOrderRawMoment => "second_order_raw_moment",
            ResultId::Variance => "variance",
            ResultId::StandardDeviation => "standard_deviation",
            ResultId::Variation => "variation",
        }
    }

    fn all() -> &'static [Self] {
        &[
            ResultId::Minimum,
            ResultId::Maximum,
            ResultId::Sum,
            ResultId::SumSquares,
            ResultId::SumSquaresCentered,
            ResultId::Mean,
            ResultId::SecondOrderRawMoment,
            ResultId::Variance,
            ResultId::StandardDeviation,
            ResultId::Variation,
        ]
    }
}

impl Algorithm for Moments {
    const NAME: &'static str = "moments";

    type Method = Method;
    type Parameter = ();
    type InputId = InputId;
    type PartialId = PartialId;
    type ResultId = ResultId;

    fn check_partial(
        input: &Input<Self>,
        partial: &PartialSet<Self>,
        _param: &(),
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

    fn allocate_partial(input: &Input<Self>, _param: &()) -> Result<PartialSet<Self>, ComputeError> {
        let p = input.table(InputId::Data)?.n_cols();
        let mut partial = PartialSet::<Self>::new();
        partial.insert_allocated(PartialId::Count, filled(1, 1, 0i64)?);
        partial.insert_allocated(PartialId::Min, filled(1, p, f64::INFINITY)?);
        partial.insert_allocated(PartialId::Max, filled(1, p, f64::NEG_INFINITY)?);
        for key in [
            PartialId::Sum,
            PartialId::SumSquares,
            PartialId::SumSquaresCentered,
        ] {
            partial.insert_allocated(key, filled(1, p, 0.0f64)?);
        }
        Ok(partial)
    }

    fn allocate_result(partial: &PartialSet<Self>, _param: &()) -> Result<ResultSet<Self>, ComputeError> {
        let p = slot(partial, PartialId::Sum)?.n_cols();
        let mut result = ResultSet::<Self>::new();
        for &key in ResultId::all() {
            result.insert_allocated(key, filled(1, p, 0.0f64)?);
        }
        Ok(result)
    }

    fn register_kernels(registry: &mut KernelRegistry) {
        registry.register::<Self>(Method::Default, CpuTier::Baseline, MomentsKernel::baseline());
        registry.register::<Self>(
            Method::SinglePass,
            CpuTier::Baseline,
            MomentsKernel::single_pass(),
        );
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        registry.register::<Self>(Method::Default, CpuTier::Avx2, MomentsKernel::avx2());
    }
}

// =============================================================================
// Accumulator
// =============================================================================

/// In-memory form of a moments partial.
#[derive(Clone, Debug, PartialEq)]
pub struct Stats {
    pub n: i64,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub sum: Vec<f64>,
    pub sum_sq: Vec<f64>,
    pub m2: Vec<f64>,
}

impl Stats {
    /// Zero observations over `p` columns.
    pub fn empty(p: usize) -> Self {
        Self {
            n: 0,
            min: vec![f64::INFINITY; p],
            max: vec![f64::NEG_INFINITY; p],
            sum: vec![0.0; p],
            sum_sq: vec![0.0; p],
            m2: vec![0.0; p],
        }
    }

    /// Number of columns.
    pub fn n_cols(&self) -> usize {
        self.sum.len()
    }

    /// Fold `other` into `self`. Zero-observation operands are identities.
    pub fn merge(&mut self, other: &Stats) {
        if other.n == 0 {
            return;
        }
        if self.n == 0 {
            *self = other.clone();
            return;
        }
        let na = self.n as f64;
        let nb = other.n as f64;
        let weight = na * nb / (na + nb);
        for j in 0..self.n_cols() {
            let delta = other.sum[j] / nb - self.sum[j] / na;
            self.m2[j] = self.m2[j] + other.m2[j] + delta * delta * weight;
            self.sum[j] += other.sum[j];
            self.sum_sq[j] += other.sum_sq[j];
            self.min[j] = self.min[j].min(other.min[j]);
            self.max[j] = self.max[j].max(other.max[j]);
        }
        self.n += other.n;
    }

    /// Load from a partial collection.
    pub fn read(partial: &PartialSet<Moments>) -> Result<Self, ComputeError> {
        let p = slot(partial, PartialId::Sum)?.n_cols();
        let row = |key| read_shaped::<_, f64>(partial, key, 1, p);
        let count = read_shaped::<_, i64>(partial, PartialId::Count, 1, 1)?;
        Ok(Self {
            n: count[0],
            min: row(PartialId::Min)?,
            max: row(PartialId::Max)?,
            sum: row(PartialId::Sum)?,
            sum_sq: row(PartialId::SumSquares)?,
            m2: row(PartialId::SumSquaresCentered)?,
        })
    }

    /// Store into a partial collection.
    pub fn write(&self, partial: &PartialSet<Moments>) -> Result<(), ComputeError> {
        write_slot(partial, PartialId::Count, &[self.n])?;
        write_slot(partial, PartialId::Min, &self.min)?;
        write_slot(partial, PartialId::Max, &self.max)?;
        write_slot(partial, PartialId::Sum, &self.sum)?;
        write_slot(partial, PartialId::SumSquares, &self.sum_sq)?;
        write_slot(partial, PartialId::SumSquaresCentered, &self.m2)
    }
}

/// Two-pass statistics of a row-major `n_rows × p` block.
pub(crate) fn block_stats(values: &[f64], n_rows: usize, p: usize) -> Stats {
    let mut s = Stats::empty(p);
    s.n = n_rows as i64;
    if n_rows == 0 || p == 0 {
        return s;
    }
    for row in values.chunks_exact(p) {
        for (j, &v) in row.iter().enumerate() {
            s.sum[j] += v;
            s.sum_sq[j] += v * v;
            s.min[j] = s.min[j].min(v);
            s.max[j] = s.max[j].max(v);
        }
    }
    let n = n_rows as f64;
    let mean: Vec<f64> = s.sum.iter().map(|&v| v / n).collect();
    for row in values.chunks_exact(p) {
        for (j, &v) in row.iter().enumerate() {
            let d = v - mean[j];
            s.m2[j] += d * d;
        }
    }
    s
}

/// One-pass statistics; the centered sum comes from `Σx² - (Σx)²/n`.
fn block_stats_single_pass(values: &[f64], n_rows: usize, p: usize) -> Stats {
    let mut s = Stats::empty(p);
    s.n = n_rows as i64;
    if n_rows == 0 || p == 0 {
        return s;
    }
    for row in values.chunks_exact(p) {
        for (j, &v) in row.iter().enumerate() {
            s.sum[j] += v;
            s.sum_sq[j] += v * v;
            s.min[j] = s.min[j].min(v);
            s.max[j] = s.max[j].max(v);
        }
    }
    let n = n_rows as f64;
    for j in 0..p {
        s.m2[j] = (s.sum_sq[j] - s.sum[j] * s.sum[j] / n).max(0.0);
    }
    s
}

// =============================================================================
// Kernel
// =============================================================================

type BlockFn = fn(&[f64], usize, usize) -> Stats;

/// Moments kernel parameterized by its per-block routine.
#[derive(Clone, Copy, Debug)]
pub struct MomentsKernel {
    block: BlockFn,
}

impl MomentsKernel {
    /// Portable two-pass kernel.
    pub fn baseline() -> Self {
        Self { block: block_stats }
    }

    /// Portable one-pass kernel.
    pub fn single_pass() -> Self {
        Self {
            block: block_stats_single_pass,
        }
    }

    /// AVX2 two-pass kernel. Falls back to baseline code on CPUs without AVX2.
    #[cfg(all(feature = "simd", target_arch = "x86_64"))]
    pub fn avx2() -> Self {
        Self {
            block: avx2::block_stats,
        }
    }

    /// Statistics of a whole table.
    pub fn table_stats(
        &self,
        ctx: &KernelContext,
        table: &crate::table::Table,
    ) -> Result<Stats, ComputeError> {
        let p = table.n_cols();
        let blocks = map_row_blocks(ctx, table, |values, rows| (self.block)(values, rows.len(), p))?;
        let mut acc = Stats::empty(p);
        for s in &blocks {
            acc.merge(s);
        }
        Ok(acc)
    }
}

impl Kernel<Moments> for MomentsKernel {
    fn accumulate(
        &self,
        ctx: &KernelContext,
        input: &Input<Moments>,
        _param: &(),
        partial: &PartialSet<Moments>,
    ) -> Result<(), ComputeError> {
        let data = input.table(InputId::Data)?;
        let chunk = self.table_stats(ctx, data)?;
        let mut acc = Stats::read(partial)?;
        acc.merge(&chunk);
        acc.write(partial)
    }

    fn merge(
        &self,
        _ctx: &KernelContext,
        _param: &(),
        into: &PartialSet<Moments>,
        other: &PartialSet<Moments>,
    ) -> Result<(), ComputeError> {
        let mut acc = Stats::read(into)?;
        let other = Stats::read(other)?;
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
        _param: &(),
        partial: &PartialSet<Moments>,
        result: &ResultSet<Moments>,
    ) -> Result<(), ComputeError> {
        let s = Stats::read(partial)?;
        let p = s.n_cols();
        let n = s.n as f64;

        let mut mean = vec![f64::NAN; p];
        let mut raw2 = vec![f64::NAN; p];
        let mut variance = vec![f64::NAN; p];
        if s.n > 0 {
            for j in 0..p {
                mean[j] = s.sum[j] / n;
                raw2[j] = s.sum_sq[j] / n;
            }
        }
        if s.n > 1 {
            for j in 0..p {
                variance[j] = s.m2[j] / (n - 1.0);
            }
        }
        let std: Vec<f64> = variance.iter().map(|v| v.sqrt()).collect();
        let variation: Vec<f64> = std.iter().zip(&mean).map(|(s, m)| s / m).collect();

        write_slot(result, ResultId::Minimum, &s.min)?;
        write_slot(result, ResultId::Maximum, &s.max)?;
        write_slot(result, ResultId::Sum, &s.sum)?;
        write_slot(result, ResultId::SumSquares, &s.sum_sq)?;
        write_slot(result, ResultId::SumSquaresCentered, &s.m2)?;
        write_slot(result, ResultId::Mean, &mean)?;
        write_slot(result, ResultId::SecondOrderRawMoment, &raw2)?;
        write_slot(result, ResultId::Variance, &variance)?;
        write_slot(result, ResultId::StandardDeviation, &std)?;
        write_slot(result, ResultId::Variation, &variation)
    }
}

// =============================================================================
// AVX2
// =============================================================================

#[cfg(all(feature = "simd", target_arch = "x86_64"))]
mod avx2 {
    use wide::f64x4;

    use super::Stats;
    use crate::compute::cpu;

    const LANES: usize = 4;

    pub(super) fn block_stats(values: &[f64], n_rows: usize, p: usize) -> Stats {
        if cpu::caps().avx2 {
            // SAFETY: AVX2 availability was checked on the line above.
            unsafe { block_stats_avx2(values, n_rows, p) }
        } else {
            super::block_stats(values, n_rows, p)
        }
    }

    #[target_feature(enable = "avx2")]
    unsafe fn block_stats_avx2(values: &[f64], n_rows: usize, p: usize) -> Stats {
        lanes(values, n_rows, p)
    }

    #[inline(always)]
    fn load(row: &[f64], j: usize) -> f64x4 {
        f64x4::new([row[j], row[j + 1], row[j + 2], row[j + 3]])
    }

    #[inline(always)]
    fn store(dst: &mut [f64], j: usize, v: f64x4) {
        dst[j..j + LANES].copy_from_slice(&v.to_array());
    }

    #[inline(always)]
    fn lanes(values: &[f64], n_rows: usize, p: usize) -> Stats {
        let mut s = Stats::empty(p);
        s.n = n_rows as i64;
        if n_rows == 0 || p == 0 {
            return s;
        }
        let n = f64x4::splat(n_rows as f64);
        let full = p - p % LANES;

        for j in (0..full).step_by(LANES) {
            let mut sum = f64x4::splat(0.0);
            let mut sum_sq = f64x4::splat(0.0);
            let mut min = f64x4::splat(f64::INFINITY);
            let mut max = f64x4::splat(f64::NEG_INFINITY);
            for row in values.chunks_exact(p) {
                let v = load(row, j);
                sum += v;
                sum_sq += v * v;
                min = min.min(v);
                max = max.max(v);
            }
            let mean = sum / n;
            let mut m2 = f64x4::splat(0.0);
            for row in values.chunks_exact(p) {
                let d = load(row, j) - mean;
                m2 += d * d;
            }
            store(&mut s.sum, j, sum);
            store(&mut s.sum_sq, j, sum_sq);
            store(&mut s.min, j, min);
            store(&mut s.max, j, max);
            store(&mut s.m2, j, m2);
        }

        // Remaining columns, scalar.
        let nf = n_rows as f64;
        for j in full..p {
            for row in values.chunks_exact(p) {
                let v = row[j];
                s.sum[j] += v;
                s.sum_sq[j] += v * v;
                s.min[j] = s.min[j].min(v);
                s.max[j] = s.max[j].max(v);
            }
            let mean = s.sum[j] / nf;
            for row in values.chunks_exact(p) {
                let d = row[j] - mean;
                s.m2[j] += d * d;
            }
        }
        s
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn avx2_matches_baseline() {
            let p = 7;
            let values: Vec<f64> = (0..(13 * p)).map(|i| ((i * 37) % 23) as f64 - 11.5).collect();
            assert_eq!(block_stats(&values, 13, p), super::super::block_stats(&values, 13, p));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stats_of(values: &[f64], p: usize) -> Stats {
        block_stats(values, values.len() / p, p)
    }

    #[test]
    fn block_stats_two_columns() {
        let s = stats_of(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0], 2);
        assert_eq!(s.n, 3);
        assert_eq!(s.sum, vec![6.0, 60.0]);
        assert_eq!(s.min, vec![1.0, 10.0]);
        assert_eq!(s.max, vec![3.0, 30.0]);
        assert_relative_eq!(s.m2[0], 2.0);
        assert_relative_eq!(s.m2[1], 200.0);
    }

    #[test]
    fn merge_matches_whole() {
        let values = [4.0, 7.0, 13.0, 16.0, 1.0, -3.0, 8.5];
        let whole = stats_of(&values, 1);
        let mut left = stats_of(&values[..3], 1);
        left.merge(&stats_of(&values[3..], 1));
        assert_eq!(left.n, whole.n);
        assert_relative_eq!(left.sum[0], whole.sum[0]);
        assert_relative_eq!(left.m2[0], whole.m2[0], epsilon = 1e-9);
        assert_eq!(left.min, whole.min);
        assert_eq!(left.max, whole.max);
    }

    #[test]
    fn merge_empty_is_identity() {
        let s = stats_of(&[1.0, 2.0, 4.0], 1);
        let mut merged = s.clone();
        merged.merge(&Stats::empty(1));
        assert_eq!(merged, s);

        let mut from_empty = Stats::empty(1);
        from_empty.merge(&s);
        assert_eq!(from_empty, s);
    }

    #[test]
    fn single_pass_agrees() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let a = stats_of(&values, 1);
        let b = block_stats_single_pass(&values, 8, 1);
        assert_relative_eq!(a.m2[0], 32.0);
        assert_relative_eq!(b.m2[0], 32.0);
    }

    #[test]
    fn zero_width_block() {
        let s = block_stats(&[], 5, 0);
        assert_eq!(s.n, 5);
        assert_eq!(s.n_cols(), 0);
    }
}
