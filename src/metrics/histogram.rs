use hdrhistogram::Histogram as HdrHistogram;
use serde::Serialize;

/// Values above this are clamped for percentile purposes; one hour in µs.
const HIGHEST_TRACKABLE: u64 = 3_600_000_000;
const SIGNIFICANT_FIGURES: u8 = 3;

/// HDR histogram for percentiles plus exact count, min, max and sum.
#[derive(Debug, Clone)]
pub struct Histogram {
    hdr: HdrHistogram<u64>,
    count: u64,
    min: u64,
    max: u64,
    sum: u128,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        let hdr = HdrHistogram::new_with_bounds(1, HIGHEST_TRACKABLE, SIGNIFICANT_FIGURES)
            .expect("static histogram bounds are valid");
        Self {
            hdr,
            count: 0,
            min: 0,
            max: 0,
            sum: 0,
        }
    }

    pub fn record(&mut self, value: u64) {
        self.hdr.saturating_record(value);
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += u128::from(value);
    }

    pub fn merge(&mut self, other: &Histogram) {
        if other.count == 0 {
            return;
        }
        for bucket in other.hdr.iter_recorded() {
            self.hdr
                .saturating_record_n(bucket.value_iterated_to(), bucket.count_at_value());
        }
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.sum += other.sum;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Smallest recorded value; 0 when empty.
    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Mean rounded up to the next integer.
    pub fn mean_ceil(&self) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let count = u128::from(self.count);
        ((self.sum + count - 1) / count).min(u128::from(u64::MAX)) as u64
    }

    /// Mean rounded to the nearest integer, halves rounding up.
    pub fn mean_round(&self) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let count = u128::from(self.count);
        ((2 * self.sum + count) / (2 * count)).min(u128::from(u64::MAX)) as u64
    }

    /// Value at quantile `q` in `[0, 1]`, within three significant figures
    /// and clamped to the exact observed range.
    pub fn percentile(&self, q: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        if q >= 1.0 {
            return self.max;
        }
        if q <= 0.0 {
            return self.min;
        }
        self.hdr.value_at_quantile(q).clamp(self.min, self.max)
    }

    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            count: self.count,
            min: self.min,
            max: self.max,
            mean: self.mean(),
            p50: self.percentile(0.50),
            p90: self.percentile(0.90),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
        }
    }
}

/// Serializable digest of a [`Histogram`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}
