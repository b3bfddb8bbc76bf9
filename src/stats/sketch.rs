//! Greenwald-Khanna streaming quantile sketch over `f64`.
//!
//! The summary answers any quantile query with a rank error of at most
//! `epsilon * N`. Values are first collected in an unsorted buffer; while
//! every value still fits in the buffer the sketch is exact and queries
//! interpolate linearly between the two closest ranks. Min and max are
//! tracked separately so `query(0.0)` and `query(1.0)` are always exact.
//!
//! Sketches built on different partitions merge into one summary with the
//! same error bound, so the result does not depend on how rows were split.
//!
//! NaN values are ignored.

/// One tuple of the GK summary.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tuple {
    value: f64,
    /// Rank difference to the previous tuple.
    g: usize,
    /// Maximum rank uncertainty of this tuple.
    delta: usize,
}

#[derive(Debug, Clone)]
pub struct QuantileSketch {
    tuples: Vec<Tuple>,
    /// Values merged into `tuples` (excludes the buffer).
    count: usize,
    epsilon: f64,
    min: f64,
    max: f64,
    buffer: Vec<f64>,
    buffer_capacity: usize,
}

impl QuantileSketch {
    /// Create a sketch with rank error bound `epsilon`.
    pub fn new(epsilon: f64) -> Self {
        let buffer_capacity = ((1.0 / (2.0 * epsilon)).ceil() as usize).max(1);
        Self {
            tuples: Vec::new(),
            count: 0,
            epsilon,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            buffer: Vec::new(),
            buffer_capacity,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Number of values observed.
    pub fn count(&self) -> usize {
        self.count + self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// True while no value has left the exact buffer.
    pub fn is_exact(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.max)
    }

    pub fn insert(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.buffer.push(value);
        if self.buffer.len() >= self.buffer_capacity {
            self.flush();
        }
    }

    /// Move buffered values into the summary.
    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut values = std::mem::take(&mut self.buffer);
        values.sort_by(f64::total_cmp);
        for value in values {
            self.insert_one(value);
        }
        self.compress();
    }

    fn insert_one(&mut self, value: f64) {
        self.count += 1;
        // First tuple whose value is >= the new value.
        let pos = self.tuples.partition_point(|t| t.value < value);
        let delta = if pos == 0 || pos == self.tuples.len() {
            0
        } else {
            self.band_width().saturating_sub(1)
        };
        self.tuples.insert(
            pos,
            Tuple {
                value,
                g: 1,
                delta,
            },
        );
    }

    /// floor(2 * epsilon * count)
    fn band_width(&self) -> usize {
        (2.0 * self.epsilon * self.count as f64).floor() as usize
    }

    /// Merge adjacent tuples whose combined rank uncertainty fits the band.
    /// The first and last tuples are always kept.
    fn compress(&mut self) {
        let n = self.tuples.len();
        if n < 3 {
            return;
        }
        let threshold = self.band_width();
        let tuples = std::mem::take(&mut self.tuples);

        let mut reversed: Vec<Tuple> = Vec::with_capacity(n);
        reversed.push(tuples[n - 1]);
        for tuple in tuples[1..n - 1].iter().rev() {
            if let Some(right) = reversed.last_mut() {
                if tuple.g + right.g + right.delta <= threshold {
                    right.g += tuple.g;
                    continue;
                }
            }
            reversed.push(*tuple);
        }
        reversed.push(tuples[0]);
        reversed.reverse();
        self.tuples = reversed;
    }

    /// Fold another sketch into this one.
    pub fn merge(&mut self, other: &QuantileSketch) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);

        if self.is_exact()
            && other.is_exact()
            && self.buffer.len() + other.buffer.len() < self.buffer_capacity
        {
            self.buffer.extend_from_slice(&other.buffer);
            return;
        }

        self.flush();
        let mut other = other.clone();
        other.flush();

        if self.tuples.is_empty() {
            self.tuples = other.tuples;
            self.count = other.count;
            return;
        }

        let mut merged = Vec::with_capacity(self.tuples.len() + other.tuples.len());
        let (mut i, mut j) = (0, 0);
        while i < self.tuples.len() && j < other.tuples.len() {
            if self.tuples[i].value <= other.tuples[j].value {
                merged.push(self.tuples[i]);
                i += 1;
            } else {
                merged.push(other.tuples[j]);
                j += 1;
            }
        }
        merged.extend_from_slice(&self.tuples[i..]);
        merged.extend_from_slice(&other.tuples[j..]);

        self.tuples = merged;
        self.count += other.count;
        self.compress();
    }

    /// Value at quantile `q` in `[0, 1]`, or `None` when empty.
    pub fn query(&self, q: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        if q <= 0.0 {
            return Some(self.min);
        }
        if q >= 1.0 {
            return Some(self.max);
        }

        if self.is_exact() {
            let mut sorted = self.buffer.clone();
            sorted.sort_by(f64::total_cmp);
            return Some(interpolate(&sorted, q));
        }
        if !self.buffer.is_empty() {
            let mut flushed = self.clone();
            flushed.flush();
            return flushed.query(q);
        }

        let desired = ((q * self.count as f64).ceil() as usize).clamp(1, self.count);
        let mut rank = 0usize;
        let mut best = self.tuples[0].value;
        let mut best_dist = usize::MAX;
        for tuple in &self.tuples {
            rank += tuple.g;
            let dist = rank.abs_diff(desired);
            if dist < best_dist {
                best_dist = dist;
                best = tuple.value;
            }
        }
        Some(best)
    }
}

/// Linear interpolation between closest ranks of a sorted slice.
fn interpolate(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
