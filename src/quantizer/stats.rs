//! Observed-range accumulation across calibration samples.

use crate::config::CalibrationMethod;

const HISTOGRAM_BINS: usize = 100;

/// Running range statistics for one tensor, fed once per calibration sample.
#[derive(Debug, Clone)]
pub struct TensorStats {
    pub min: f32,
    pub max: f32,
    pub count: usize,
    histogram: Vec<(f32, usize)>,
}

impl Default for TensorStats {
    fn default() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            count: 0,
            histogram: Vec::new(),
        }
    }
}

impl TensorStats {
    pub fn observe(&mut self, data: &[f32]) {
        if data.is_empty() {
            return;
        }
        let batch_min = data.iter().copied().fold(f32::INFINITY, f32::min);
        let batch_max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        self.min = self.min.min(batch_min);
        self.max = self.max.max(batch_max);
        self.count += data.len();

        let batch = build_histogram(data, batch_min, batch_max);
        merge(&mut self.histogram, batch);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Calibrated `(low, high)` range under the configured method.
    pub fn range(&self, method: CalibrationMethod) -> (f32, f32) {
        match method {
            CalibrationMethod::MinMax => (self.min, self.max),
            CalibrationMethod::Percentile => {
                (self.percentile(100.0 - PERCENTILE), self.percentile(PERCENTILE))
            }
        }
    }

    /// Smallest observed value at or above the given cumulative percentile.
    pub fn percentile(&self, p: f32) -> f32 {
        if self.histogram.is_empty() {
            return self.min;
        }
        // ceil so the returned bin actually covers the target rank.
        let target = ((self.count as f32) * p / 100.0).ceil() as usize;
        let mut cumulative = 0;
        for &(value, count) in &self.histogram {
            cumulative += count;
            if cumulative >= target {
                return value;
            }
        }
        self.max
    }
}

/// Clip fraction used by [`CalibrationMethod::Percentile`].
pub const PERCENTILE: f32 = 99.9;

fn build_histogram(data: &[f32], min: f32, max: f32) -> Vec<(f32, usize)> {
    let width = (max - min) / HISTOGRAM_BINS as f32;
    if width <= 0.0 {
        return vec![(min, data.len())];
    }
    let mut bins = vec![0usize; HISTOGRAM_BINS];
    for &v in data {
        let idx = (((v - min) / width) as usize).min(HISTOGRAM_BINS - 1);
        bins[idx] += 1;
    }
    bins.iter()
        .enumerate()
        .filter(|(_, &c)| c > 0)
        .map(|(i, &c)| (min + (i as f32 + 1.0) * width, c))
        .collect()
}

fn merge(into: &mut Vec<(f32, usize)>, mut batch: Vec<(f32, usize)>) {
    into.append(&mut batch);
    into.sort_by(|a, b| a.0.total_cmp(&b.0));
}
