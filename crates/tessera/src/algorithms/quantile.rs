//! Per-column quantile by distributed bisection.
//!
//! For a column with `n` non-NaN values the `q`-quantile is the `k`-th
//! smallest value, `k = max(1, ⌈q·n⌉)`. Nodes never exchange values, only
//! counts and extrema, so the search keeps a bracket `[lower, upper]` of data
//! values that always contains the answer and narrows it once per round:
//!
//! ```text
//! step1Local      count, min, max                     per shard
//! step2Master     total, lower = min, upper = max     merged
//! step3Local      count(x ≤ pivot), below, above      per shard, pivot from the bracket
//! step4Master     narrowed bracket                    merged
//! ...             one local/master pair per round
//! ```
//!
//! Every step after the second takes the previous master output as its
//! broadcast, on the nodes and on the master alike.
//!
//! `below` is the largest value `≤ pivot` and `above` the smallest value
//! `> pivot`, so the bracket ends are always data values and a converged
//! bracket (`lower == upper`) is the exact quantile. Counts, minima and
//! maxima merge exactly, so any split of the rows into shards gives the same
//! answer as [`Batch`](crate::compute::Batch), which runs the protocol
//! in-process.
//!
//! NaNs are ignored. A column without values yields NaN.

use super::{map_row_blocks, read_shaped, slot, write_slot};
use crate::compute::{
    fold_partials, Algorithm, CpuTier, Input, Kernel, KernelContext, KernelRegistry, Key,
    PartialSet, Protocol, ResultSet, Step, StepArgs, StepRole,
};
use crate::error::ComputeError;
use crate::table::Table;

/// Upper bound on [`Parameter::rounds`].
pub const MAX_ROUNDS: u32 = 1024;

/// Quantile algorithm marker.
#[derive(Clone, Copy, Debug, Default)]
pub struct Quantile;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputId {
    Data,
}

/// Partial-result slots. All are `1 × p`; which are present depends on the
/// step that produced the partial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartialId {
    /// Local: non-NaN values (step 1) or values `≤ pivot` (later steps). i64.
    Count,
    Min,
    Max,
    /// Largest value `≤ pivot`.
    Below,
    /// Smallest value `> pivot`.
    Above,
    /// Master: non-NaN values over all shards. i64.
    Total,
    Lower,
    Upper,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultId {
    /// 1 × p.
    Quantile,
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

/// Quantile parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Parameter {
    /// Quantile level in `[0, 1]`.
    pub q: f64,
    /// Narrowing rounds after the initial min/max pass.
    pub rounds: u32,
}

impl Default for Parameter {
    fn default() -> Self {
        Self { q: 0.5, rounds: 64 }
    }
}

impl Parameter {
    /// Rank of the quantile among `total` values.
    fn rank(&self, total: i64) -> i64 {
        ((self.q * total as f64).ceil() as i64).clamp(1, total.max(1))
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
            PartialId::Below => "below",
            PartialId::Above => "above",
            PartialId::Total => "total",
            PartialId::Lower => "lower",
            PartialId::Upper => "upper",
        }
    }

    fn all() -> &'static [Self] {
        &[
            PartialId::Count,
            PartialId::Min,
            PartialId::Max,
            PartialId::Below,
            PartialId::Above,
            PartialId::Total,
            PartialId::Lower,
            PartialId::Upper,
        ]
    }
}

impl Key for ResultId {
    fn name(self) -> &'static str {
        "quantile"
    }

    fn all() -> &'static [Self] {
        &[ResultId::Quantile]
    }
}

fn width(partial: &PartialSet<Quantile>) -> Result<usize, ComputeError> {
    partial
        .keys()
        .first()
        .and_then(|&k| partial.get(k))
        .map(|t| t.n_cols())
        .ok_or_else(|| ComputeError::invalid_argument("empty quantile partial result"))
}

impl Algorithm for Quantile {
    const NAME: &'static str = "quantile";
    const SUPPORTS_ONLINE: bool = false;

    type Method = Method;
    type Parameter = Parameter;
    type InputId = InputId;
    type PartialId = PartialId;
    type ResultId = ResultId;

    fn check_parameter(param: &Parameter) -> Result<(), ComputeError> {
        if !(0.0..=1.0).contains(&param.q) {
            return Err(ComputeError::InvalidParameter {
                name: "q",
                reason: format!("must be in [0, 1], got {}", param.q),
            });
        }
        if param.rounds > MAX_ROUNDS {
            return Err(ComputeError::InvalidParameter {
                name: "rounds",
                reason: format!("must be at most {MAX_ROUNDS}, got {}", param.rounds),
            });
        }
        Ok(())
    }

    fn check_partial(
        input: &Input<Self>,
        partial: &PartialSet<Self>,
        _param: &Parameter,
    ) -> Result<(), ComputeError> {
        let data_cols = input.table(InputId::Data)?.n_cols();
        let partial_cols = width(partial)?;
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
        Extrema::empty(input.table(InputId::Data)?.n_cols()).into_partial()
    }

    fn allocate_result(
        partial: &PartialSet<Self>,
        _param: &Parameter,
    ) -> Result<ResultSet<Self>, ComputeError> {
        let p = width(partial)?;
        let mut result = ResultSet::<Self>::new();
        result.insert_allocated(ResultId::Quantile, super::filled(1, p, f64::NAN)?);
        Ok(result)
    }

    fn protocol(param: &Parameter) -> Protocol {
        Protocol::rounds(param.rounds.min(MAX_ROUNDS) + 1)
    }

    fn register_kernels(registry: &mut KernelRegistry) {
        registry.register::<Self>(Method::Default, CpuTier::Baseline, QuantileKernel);
    }
}

// =============================================================================
// Step state
// =============================================================================

fn row_table<T: crate::table::Element>(values: Vec<T>) -> Result<Table, ComputeError> {
    let p = values.len();
    Table::dense(values, 1, p)
}

/// Step 1 output: non-NaN count and extrema per column.
#[derive(Clone, Debug, PartialEq)]
struct Extrema {
    count: Vec<i64>,
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Extrema {
    fn empty(p: usize) -> Self {
        Self {
            count: vec![0; p],
            min: vec![f64::INFINITY; p],
            max: vec![f64::NEG_INFINITY; p],
        }
    }

    fn of_block(values: &[f64], p: usize) -> Self {
        let mut e = Self::empty(p);
        if p == 0 {
            return e;
        }
        for row in values.chunks_exact(p) {
            for (j, &v) in row.iter().enumerate() {
                if v.is_nan() {
                    continue;
                }
                e.count[j] += 1;
                e.min[j] = e.min[j].min(v);
                e.max[j] = e.max[j].max(v);
            }
        }
        e
    }

    fn merge(&mut self, other: &Extrema) {
        for j in 0..self.count.len() {
            self.count[j] += other.count[j];
            self.min[j] = self.min[j].min(other.min[j]);
            self.max[j] = self.max[j].max(other.max[j]);
        }
    }

    fn read(partial: &PartialSet<Quantile>) -> Result<Self, ComputeError> {
        let p = slot(partial, PartialId::Count)?.n_cols();
        Ok(Self {
            count: read_shaped(partial, PartialId::Count, 1, p)?,
            min: read_shaped(partial, PartialId::Min, 1, p)?,
            max: read_shaped(partial, PartialId::Max, 1, p)?,
        })
    }

    fn into_partial(self) -> Result<PartialSet<Quantile>, ComputeError> {
        let mut partial = PartialSet::<Quantile>::new();
        partial.insert_allocated(PartialId::Count, row_table(self.count)?);
        partial.insert_allocated(PartialId::Min, row_table(self.min)?);
        partial.insert_allocated(PartialId::Max, row_table(self.max)?);
        Ok(partial)
    }
}

/// Round output: values at or below the pivot, and the data values either
/// side of it.
#[derive(Clone, Debug, PartialEq)]
struct Counts {
    count: Vec<i64>,
    below: Vec<f64>,
    above: Vec<f64>,
}

impl Counts {
    fn empty(p: usize) -> Self {
        Self {
            count: vec![0; p],
            below: vec![f64::NEG_INFINITY; p],
            above: vec![f64::INFINITY; p],
        }
    }

    fn of_block(values: &[f64], pivots: &[f64]) -> Self {
        let p = pivots.len();
        let mut c = Self::empty(p);
        if p == 0 {
            return c;
        }
        for row in values.chunks_exact(p) {
            for (j, &v) in row.iter().enumerate() {
                // NaN fails both comparisons.
                if v <= pivots[j] {
                    c.count[j] += 1;
                    c.below[j] = c.below[j].max(v);
                } else if v > pivots[j] {
                    c.above[j] = c.above[j].min(v);
                }
            }
        }
        c
    }

    fn merge(&mut self, other: &Counts) {
        for j in 0..self.count.len() {
            self.count[j] += other.count[j];
            self.below[j] = self.below[j].max(other.below[j]);
            self.above[j] = self.above[j].min(other.above[j]);
        }
    }

    fn read(partial: &PartialSet<Quantile>) -> Result<Self, ComputeError> {
        let p = slot(partial, PartialId::Count)?.n_cols();
        Ok(Self {
            count: read_shaped(partial, PartialId::Count, 1, p)?,
            below: read_shaped(partial, PartialId::Below, 1, p)?,
            above: read_shaped(partial, PartialId::Above, 1, p)?,
        })
    }

    fn into_partial(self) -> Result<PartialSet<Quantile>, ComputeError> {
        let mut partial = PartialSet::<Quantile>::new();
        partial.insert_allocated(PartialId::Count, row_table(self.count)?);
        partial.insert_allocated(PartialId::Below, row_table(self.below)?);
        partial.insert_allocated(PartialId::Above, row_table(self.above)?);
        Ok(partial)
    }
}

/// Master output: the current search bracket.
#[derive(Clone, Debug, PartialEq)]
struct Bracket {
    total: Vec<i64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Bracket {
    fn from_extrema(e: Extrema) -> Self {
        Self {
            total: e.count,
            lower: e.min,
            upper: e.max,
        }
    }

    fn pivots(&self) -> Vec<f64> {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(&lo, &hi)| pivot(lo, hi))
            .collect()
    }

    fn is_converged(&self) -> bool {
        (0..self.total.len()).all(|j| self.total[j] == 0 || self.lower[j] == self.upper[j])
    }

    /// Shrink every column's bracket using the merged round counts.
    fn narrow(&mut self, counts: &Counts, param: &Parameter) {
        for j in 0..self.total.len() {
            if self.total[j] == 0 {
                continue;
            }
            if counts.count[j] >= param.rank(self.total[j]) {
                self.upper[j] = counts.below[j];
            } else {
                self.lower[j] = counts.above[j];
            }
        }
    }

    fn read(partial: &PartialSet<Quantile>) -> Result<Self, ComputeError> {
        let p = slot(partial, PartialId::Total)?.n_cols();
        Ok(Self {
            total: read_shaped(partial, PartialId::Total, 1, p)?,
            lower: read_shaped(partial, PartialId::Lower, 1, p)?,
            upper: read_shaped(partial, PartialId::Upper, 1, p)?,
        })
    }

    fn into_partial(self) -> Result<PartialSet<Quantile>, ComputeError> {
        let mut partial = PartialSet::<Quantile>::new();
        partial.insert_allocated(PartialId::Total, row_table(self.total)?);
        partial.insert_allocated(PartialId::Lower, row_table(self.lower)?);
        partial.insert_allocated(PartialId::Upper, row_table(self.upper)?);
        Ok(partial)
    }

    fn quantiles(&self) -> Vec<f64> {
        self.total
            .iter()
            .zip(&self.upper)
            .map(|(&n, &hi)| if n == 0 { f64::NAN } else { hi })
            .collect()
    }
}

/// Split point of `[lo, hi]`, clamped to finite values so that infinite
/// ends still make progress.
fn pivot(lo: f64, hi: f64) -> f64 {
    if lo >= hi {
        return lo;
    }
    let a = lo.max(-f64::MAX);
    let b = hi.min(f64::MAX);
    (a / 2.0 + b / 2.0).clamp(a, b)
}

// =============================================================================
// Kernel
// =============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct QuantileKernel;

impl QuantileKernel {
    fn count_round(
        &self,
        ctx: &KernelContext,
        input: &Input<Quantile>,
        bracket: &Bracket,
    ) -> Result<Counts, ComputeError> {
        let pivots = bracket.pivots();
        let data = input.table(InputId::Data)?;
        let blocks = map_row_blocks(ctx, data, |values, _| Counts::of_block(values, &pivots))?;
        let mut acc = Counts::empty(pivots.len());
        for c in &blocks {
            acc.merge(c);
        }
        Ok(acc)
    }
}

impl Kernel<Quantile> for QuantileKernel {
    fn accumulate(
        &self,
        ctx: &KernelContext,
        input: &Input<Quantile>,
        _param: &Parameter,
        partial: &PartialSet<Quantile>,
    ) -> Result<(), ComputeError> {
        let data = input.table(InputId::Data)?;
        let p = data.n_cols();
        let blocks = map_row_blocks(ctx, data, |values, _| Extrema::of_block(values, p))?;
        let mut acc = Extrema::read(partial)?;
        for e in &blocks {
            acc.merge(e);
        }
        write_slot(partial, PartialId::Count, &acc.count)?;
        write_slot(partial, PartialId::Min, &acc.min)?;
        write_slot(partial, PartialId::Max, &acc.max)
    }

    fn merge(
        &self,
        _ctx: &KernelContext,
        _param: &Parameter,
        into: &PartialSet<Quantile>,
        other: &PartialSet<Quantile>,
    ) -> Result<(), ComputeError> {
        if width(into)? != width(other)? {
            return Err(ComputeError::dimension_mismatch(
                "partial columns",
                width(into)?,
                width(other)?,
            ));
        }
        if into.contains(PartialId::Min) {
            let mut acc = Extrema::read(into)?;
            acc.merge(&Extrema::read(other)?);
            write_slot(into, PartialId::Count, &acc.count)?;
            write_slot(into, PartialId::Min, &acc.min)?;
            write_slot(into, PartialId::Max, &acc.max)
        } else if into.contains(PartialId::Below) {
            let mut acc = Counts::read(into)?;
            acc.merge(&Counts::read(other)?);
            write_slot(into, PartialId::Count, &acc.count)?;
            write_slot(into, PartialId::Below, &acc.below)?;
            write_slot(into, PartialId::Above, &acc.above)
        } else {
            Err(ComputeError::invalid_argument(
                "only local quantile partial results can be merged",
            ))
        }
    }

    fn finalize(
        &self,
        _ctx: &KernelContext,
        _param: &Parameter,
        partial: &PartialSet<Quantile>,
        result: &ResultSet<Quantile>,
    ) -> Result<(), ComputeError> {
        let bracket = Bracket::read(partial)?;
        write_slot(result, ResultId::Quantile, &bracket.quantiles())
    }

    fn run_batch(
        &self,
        ctx: &KernelContext,
        input: &Input<Quantile>,
        param: &Parameter,
        partial: &PartialSet<Quantile>,
        result: &ResultSet<Quantile>,
    ) -> Result<(), ComputeError> {
        self.accumulate(ctx, input, param, partial)?;
        let mut bracket = Bracket::from_extrema(Extrema::read(partial)?);
        for _ in 0..param.rounds {
            if bracket.is_converged() {
                break;
            }
            ctx.check_cancelled()?;
            let counts = self.count_round(ctx, input, &bracket)?;
            bracket.narrow(&counts, param);
        }
        write_slot(result, ResultId::Quantile, &bracket.quantiles())
    }

    fn step(
        &self,
        ctx: &KernelContext,
        step: Step,
        args: StepArgs<'_, Quantile>,
    ) -> Result<PartialSet<Quantile>, ComputeError> {
        match (step.role, step.index) {
            (StepRole::Local, 1) => {
                let input = args.input()?;
                let partial = Quantile::allocate_partial(input, args.param)?;
                self.accumulate(ctx, input, args.param, &partial)?;
                Ok(partial)
            }
            (StepRole::Master, 2) => {
                let merged = fold_partials::<Quantile, Self>(self, ctx, args.param, args.partials)?;
                Bracket::from_extrema(Extrema::read(&merged)?).into_partial()
            }
            (StepRole::Local, _) => {
                let bracket = Bracket::read(args.broadcast()?)?;
                self.count_round(ctx, args.input()?, &bracket)?
                    .into_partial()
            }
            (StepRole::Master, _) => {
                let mut bracket = Bracket::read(args.broadcast()?)?;
                let merged = fold_partials::<Quantile, Self>(self, ctx, args.param, args.partials)?;
                let counts = Counts::read(&merged)?;
                if counts.count.len() != bracket.total.len() {
                    return Err(ComputeError::dimension_mismatch(
                        "round counts",
                        bracket.total.len(),
                        counts.count.len(),
                    ));
                }
                bracket.narrow(&counts, args.param);
                bracket.into_partial()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(mut column: Vec<f64>, q: f64) -> f64 {
        column.sort_by(f64::total_cmp);
        let k = Parameter { q, rounds: 0 }.rank(column.len() as i64);
        column[(k - 1) as usize]
    }

    fn bisect(column: &[f64], q: f64, rounds: u32) -> f64 {
        let param = Parameter { q, rounds };
        let mut bracket = Bracket::from_extrema(Extrema::of_block(column, 1));
        for _ in 0..rounds {
            let counts = Counts::of_block(column, &bracket.pivots());
            bracket.narrow(&counts, &param);
        }
        bracket.quantiles()[0]
    }

    #[test]
    fn rank_bounds() {
        let p = Parameter { q: 0.0, rounds: 1 };
        assert_eq!(p.rank(10), 1);
        let p = Parameter { q: 1.0, rounds: 1 };
        assert_eq!(p.rank(10), 10);
        let p = Parameter { q: 0.5, rounds: 1 };
        assert_eq!(p.rank(5), 3);
        assert_eq!(p.rank(4), 2);
    }

    #[test]
    fn bisection_finds_exact_value() {
        let column: Vec<f64> = (0..97).map(|i| ((i * 53) % 97) as f64 * 1.5 - 30.0).collect();
        for q in [0.0, 0.1, 0.25, 0.5, 0.9, 1.0] {
            assert_eq!(bisect(&column, q, 64), exact(column.clone(), q), "q = {q}");
        }
    }

    #[test]
    fn bisection_with_duplicates_and_infinities() {
        let column = vec![3.0, f64::NEG_INFINITY, 3.0, 1.0, f64::INFINITY, 3.0, 2.0];
        for q in [0.0, 0.3, 0.5, 0.75, 1.0] {
            assert_eq!(bisect(&column, q, 64), exact(column.clone(), q), "q = {q}");
        }
    }

    #[test]
    fn zero_rounds_reports_maximum() {
        assert_eq!(bisect(&[4.0, 1.0, 9.0], 0.5, 0), 9.0);
    }

    #[test]
    fn nan_values_are_ignored() {
        let column = [f64::NAN, 5.0, 1.0, f64::NAN, 3.0];
        assert_eq!(bisect(&column, 0.5, 64), 3.0);

        let e = Extrema::of_block(&[f64::NAN, f64::NAN], 1);
        assert_eq!(e.count, vec![0]);
        assert!(Bracket::from_extrema(e).quantiles()[0].is_nan());
    }

    #[test]
    fn pivot_stays_inside_bracket() {
        assert_eq!(pivot(2.0, 2.0), 2.0);
        assert_eq!(pivot(0.0, 4.0), 2.0);
        assert_eq!(pivot(f64::NEG_INFINITY, f64::INFINITY), 0.0);
        assert!(pivot(f64::NEG_INFINITY, 1.0).is_finite());
        assert!(pivot(1.0, f64::INFINITY).is_finite());
    }

    #[test]
    fn invalid_parameters() {
        let bad_q = Parameter { q: 1.5, rounds: 4 };
        assert!(matches!(
            Quantile::check_parameter(&bad_q),
            Err(ComputeError::InvalidParameter { name: "q", .. })
        ));
        let nan_q = Parameter { q: f64::NAN, rounds: 4 };
        assert!(Quantile::check_parameter(&nan_q).is_err());
        let many = Parameter {
            q: 0.5,
            rounds: MAX_ROUNDS + 1,
        };
        assert!(matches!(
            Quantile::check_parameter(&many),
            Err(ComputeError::InvalidParameter { name: "rounds", .. })
        ));
    }

    #[test]
    fn protocol_has_one_pair_per_round() {
        let param = Parameter { q: 0.5, rounds: 3 };
        let protocol = Quantile::protocol(&param);
        assert_eq!(protocol.steps().len(), 8);
        assert_eq!(protocol.final_step(), Step::master(8));
    }
}
