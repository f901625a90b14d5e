//! Cartesian sweep enumeration.
//!
//! The sweep is a product of value lists addressed by a flat index, so
//! resuming at step `k` is index arithmetic rather than a replay. Axes nest in
//! declaration order with the last axis varying fastest.

use std::fmt::Write as _;

/// Mixed-radix index over a list of axis lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartesianIndex {
    dims: Vec<usize>,
}

impl CartesianIndex {
    /// Index over axes of the given lengths, outermost first.
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Number of combinations. An index with no axes has one (empty) combination.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    /// True when some axis is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-axis positions of combination `index`, or `None` past the end.
    pub fn unravel(&self, index: usize) -> Option<Vec<usize>> {
        if index >= self.len() {
            return None;
        }
        let mut rest = index;
        let mut digits = vec![0; self.dims.len()];
        for (digit, dim) in digits.iter_mut().zip(&self.dims).rev() {
            *digit = rest % dim;
            rest /= dim;
        }
        Some(digits)
    }
}

/// One inner sweep combination.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    /// Repetition index, starting at 0
    pub iteration: usize,
    /// Overvoltage in volts
    pub overvoltage: f64,
    /// T1 threshold
    pub t1: u32,
    /// T2 threshold
    pub t2: u32,
    /// E threshold
    pub e: u32,
}

/// Inner sweep axes: iteration, overvoltage, T1, T2, E.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepAxes {
    iterations: usize,
    overvoltage: Vec<f64>,
    t1: Vec<u32>,
    t2: Vec<u32>,
    e: Vec<u32>,
    index: CartesianIndex,
}

impl SweepAxes {
    /// Build the axes.
    pub fn new(iterations: usize, overvoltage: Vec<f64>, t1: Vec<u32>, t2: Vec<u32>, e: Vec<u32>) -> Self {
        let index = CartesianIndex::new(vec![iterations, overvoltage.len(), t1.len(), t2.len(), e.len()]);
        Self {
            iterations,
            overvoltage,
            t1,
            t2,
            e,
            index,
        }
    }

    /// Number of inner combinations.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when any axis is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Repetitions of the threshold sweep.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Combination `index` in nesting order.
    pub fn point(&self, index: usize) -> Option<SweepPoint> {
        let d = self.index.unravel(index)?;
        Some(SweepPoint {
            iteration: d[0],
            overvoltage: self.overvoltage[d[1]],
            t1: self.t1[d[2]],
            t2: self.t2[d[3]],
            e: self.e[d[4]],
        })
    }

    /// All combinations in nesting order.
    pub fn iter(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        (0..self.len()).filter_map(|i| self.point(i))
    }
}

/// Outer sweep over stage positions, one position list per axis.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    axes: Vec<(String, Vec<f64>)>,
    index: CartesianIndex,
}

impl StagePlan {
    /// Plan over `(axis name, positions)` pairs, outermost first.
    ///
    /// With no axes the plan holds a single combination with no positions.
    pub fn new(axes: Vec<(String, Vec<f64>)>) -> Self {
        let index = CartesianIndex::new(axes.iter().map(|(_, p)| p.len()).collect());
        Self { axes, index }
    }

    /// Axis names in plan order.
    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Number of stage combinations.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when some axis has no positions.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Positions of combination `index`, one per axis.
    pub fn combination(&self, index: usize) -> Option<Vec<f64>> {
        let digits = self.index.unravel(index)?;
        Some(
            self.axes
                .iter()
                .zip(digits)
                .map(|((_, positions), d)| positions[d])
                .collect(),
        )
    }

    /// Combinations from `start` onwards, with their indices.
    pub fn iter_from(&self, start: usize) -> impl Iterator<Item = (usize, Vec<f64>)> + '_ {
        (start..self.len()).filter_map(|i| self.combination(i).map(|c| (i, c)))
    }
}

/// Output base name encoding every active axis value.
///
/// `stage` pairs an axis label (for example `X`) with its position. Positions
/// and the overvoltage always carry a fractional part (`90.0`, `1.0`) so names
/// match those of earlier runs.
pub fn output_base_name(out_name: &str, stage: &[(&str, f64)], point: &SweepPoint) -> String {
    let mut name = out_name.to_string();
    for (label, position) in stage {
        let _ = write!(name, "_{label}{position:?}");
    }
    let _ = write!(
        name,
        "_{}it_{:?}OV_{}T1_{}T2_{}E",
        point.iteration, point.overvoltage, point.t1, point.t2, point.e
    );
    name
}
