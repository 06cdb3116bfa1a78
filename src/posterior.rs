//! Module for turning raw HMM posteriors into per-site ROH probabilities.
use crate::calling::CallingError;
use crate::PosteriorMode;
use ndarray::Array1;

impl PosteriorMode {
    /// Probability of the ROH state for one raw posterior value
    #[inline]
    pub fn decode_value(&self, raw: f64) -> f64 {
        match self {
            PosteriorMode::Identity => raw,
            PosteriorMode::LogComplement => 1.0 - raw.exp(),
        }
    }

    /// Decodes a whole raw posterior vector
    pub fn decode(&self, raw: &Array1<f64>) -> Array1<f64> {
        raw.mapv(|v| self.decode_value(v))
    }
}

/// Raw posterior and genetic map of one chromosome, index-aligned.
#[derive(Debug, Clone)]
pub struct ChromPosterior {
    /// Raw per-site posterior as produced by the HMM
    pub raw: Array1<f64>,
    /// Genetic map in Morgans, non-decreasing
    pub map: Array1<f64>,
}

impl ChromPosterior {
    /// Pairs a posterior with its map. Fails when the lengths differ or the
    /// map is not finite and non-decreasing.
    pub fn new(raw: Array1<f64>, map: Array1<f64>) -> Result<Self, CallingError> {
        if raw.len() != map.len() {
            return Err(CallingError::LengthMismatch {
                posterior: raw.len(),
                map: map.len(),
            });
        }
        if let Some(i) = map.iter().position(|m| !m.is_finite()) {
            return Err(CallingError::NonFiniteMap { index: i });
        }
        if let Some(i) = (1..map.len()).find(|&i| map[i] < map[i - 1]) {
            return Err(CallingError::UnsortedMap { index: i });
        }
        Ok(ChromPosterior { raw, map })
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Per-site P(ROH) under `mode`
    pub fn probabilities(&self, mode: PosteriorMode) -> Array1<f64> {
        mode.decode(&self.raw)
    }
}
