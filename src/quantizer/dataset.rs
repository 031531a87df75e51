//! Calibration sample sources.

use crate::config::QuantizationConfig;
use crate::errors::{ConvertError, Result};
use ndarray::{Array, IxDyn};
use std::path::Path;

/// A set of representative model inputs used to observe activation ranges.
#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    pub samples: Vec<Vec<f32>>,
    /// Per-sample shape, without the leading sample axis.
    pub shape: Vec<usize>,
}

impl CalibrationDataset {
    /// Build the dataset the configuration describes: an `.npy` file if
    /// `calibration_dataset` is set, the inline sample list otherwise.
    /// Validation has already guaranteed one of the two is present.
    pub fn from_config(config: &QuantizationConfig, input_shape: &[usize]) -> Result<Self> {
        let mut dataset = match (&config.calibration_dataset, &config.calibration_samples) {
            (Some(path), _) => Self::from_numpy(path)?,
            (None, Some(samples)) => Self::from_samples(samples.clone(), input_shape.to_vec())?,
            (None, None) => {
                return Err(ConvertError::Quantize {
                    reason: "no calibration source configured".into(),
                })
            }
        };
        let expected: usize = input_shape.iter().product();
        if dataset.sample_size() != expected {
            return Err(ConvertError::Quantize {
                reason: format!(
                    "calibration samples have {} values but the model input {:?} needs {}",
                    dataset.sample_size(),
                    input_shape,
                    expected
                ),
            });
        }
        dataset.shape = input_shape.to_vec();
        if let (Some(mean), Some(std)) = (&config.mean_values, &config.std_values) {
            dataset.normalize(mean, std)?;
        }
        Ok(dataset)
    }

    /// Read samples from an `.npy` array whose leading axis indexes samples.
    pub fn from_numpy(path: &Path) -> Result<Self> {
        let array: Array<f32, IxDyn> =
            ndarray_npy::read_npy(path).map_err(|e| ConvertError::Quantize {
                reason: format!("failed to read '{}': {e}", path.display()),
            })?;
        let shape = array.shape().to_vec();
        if shape.is_empty() || shape[0] == 0 {
            return Err(ConvertError::Quantize {
                reason: format!("'{}' holds no samples", path.display()),
            });
        }

        let num_samples = shape[0];
        let sample_size: usize = shape[1..].iter().product();
        let data = array.into_raw_vec();
        let samples = (0..num_samples)
            .map(|i| data[i * sample_size..(i + 1) * sample_size].to_vec())
            .collect();
        Ok(Self {
            samples,
            shape: shape[1..].to_vec(),
        })
    }

    /// Uniform random samples in the given range. Good enough for smoke
    /// runs where no representative data exists yet; never a substitute for
    /// real calibration inputs.
    pub fn random(shape: Vec<usize>, num_samples: usize, range: (f32, f32)) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let sample_size: usize = shape.iter().product();
        let samples = (0..num_samples)
            .map(|_| (0..sample_size).map(|_| rng.gen_range(range.0..range.1)).collect())
            .collect();
        Self { samples, shape }
    }

    pub fn from_samples(samples: Vec<Vec<f32>>, shape: Vec<usize>) -> Result<Self> {
        if samples.is_empty() {
            return Err(ConvertError::Quantize {
                reason: "calibration sample list is empty".into(),
            });
        }
        let expected: usize = shape.iter().product();
        for (i, sample) in samples.iter().enumerate() {
            if sample.len() != expected {
                return Err(ConvertError::Quantize {
                    reason: format!(
                        "calibration sample {i} has {} values, expected {expected}",
                        sample.len()
                    ),
                });
            }
        }
        Ok(Self { samples, shape })
    }

    /// Apply per-channel `(x - mean) / std` preprocessing. The channel axis
    /// is the first non-batch axis of the sample shape.
    pub fn normalize(&mut self, mean: &[f32], std: &[f32]) -> Result<()> {
        let channels = self.channels();
        if mean.len() != channels || std.len() != channels {
            return Err(ConvertError::Quantize {
                reason: format!(
                    "normalization expects {channels} channel values, got {} mean / {} std",
                    mean.len(),
                    std.len()
                ),
            });
        }
        let per_channel = self.sample_size() / channels;
        for sample in &mut self.samples {
            for (c, chunk) in sample.chunks_mut(per_channel).enumerate() {
                for v in chunk {
                    *v = (*v - mean[c]) / std[c];
                }
            }
        }
        Ok(())
    }

    fn channels(&self) -> usize {
        // NCHW samples carry a leading batch axis of 1; flat samples are a
        // single channel.
        match self.shape.as_slice() {
            [1, c, ..] => *c,
            [c, ..] if self.shape.len() > 1 => *c,
            _ => 1,
        }
    }

    pub fn sample_size(&self) -> usize {
        self.samples.first().map(Vec::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
