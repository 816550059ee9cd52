use std::cmp::Ordering;
use time::OffsetDateTime;

/// Running mean and variance (Welford) over f64 samples.
#[derive(Debug, Default, Clone)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation (divides by n, not n - 1). Zero when empty.
    pub fn population_stddev(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.m2 / (self.n as f64)).sqrt()
        }
    }
}

/// Bound `v` to `[min, max]`.
pub fn clamp<T: PartialOrd>(min: T, v: T, max: T) -> T {
    let upper = if v > max { max } else { v };
    if upper < min {
        min
    } else {
        upper
    }
}

/// Index picked by lower-median selection on a sorted slice of length `n`.
///
/// 1 or 2 elements pick index 0; otherwise the element just below the
/// midpoint, `n/2 - 1`.
fn lower_median_index(n: usize) -> Option<usize> {
    match n {
        0 => None,
        1 | 2 => Some(0),
        _ => Some(clamp(0, n / 2 - 1, n - 1)),
    }
}

/// Lower median of `values`. Returns `T::default()` for an empty slice.
///
/// The result is always one of the inputs; nothing is interpolated.
pub fn median<T>(values: &[T]) -> T
where
    T: Copy + PartialOrd + Default,
{
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    lower_median_index(sorted.len())
        .map(|i| sorted[i])
        .unwrap_or_default()
}

/// Lower median of a set of instants, ordered chronologically regardless of
/// the offset each one carries. Returns the Unix epoch for an empty slice.
pub fn median_time(values: &[OffsetDateTime]) -> OffsetDateTime {
    let mut sorted = values.to_vec();
    sorted.sort();
    lower_median_index(sorted.len())
        .map(|i| sorted[i])
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
