use serde::Serialize;

/// Online accumulator for a stream of numbers.
///
/// O(1) per value. There is no reset: start a fresh instance instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CumulativeStatistics {
    count: u64,
    sum: f64,
    sum_squares: f64,
    min: f64,
    max: f64,
}

impl CumulativeStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.sum_squares += value * value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// 0 until the first value arrives.
    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        // Rounding can push the radicand slightly below zero.
        let variance = (self.sum_squares / self.count as f64 - mean * mean).max(0.0);
        variance.sqrt()
    }
}
