//! Module for iterative contamination refinement.
//!
//! ROH calls depend on the contamination rate assumed by the HMM, and the
//! contamination estimate is computed inside the called ROH. The loop
//! alternates the two until the estimate stops moving or the iteration
//! budget runs out.
use crate::calling::{call_genome, CallingError, CallingParams, ModelParams, PosteriorSource};
use crate::{CollaboratorError, ContaminationEstimate, GenomeCalls};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RefineError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Calling(#[from] CallingError),
    #[error("Genotyping error-rate estimation failed: {0}")]
    ErrorRate(#[source] CollaboratorError),
    #[error("Invalid genotyping error rate: {0}")]
    InvalidErrorRate(f64),
    #[error("Contamination estimation failed in iteration {iteration}: {source}")]
    Estimator {
        iteration: usize,
        #[source]
        source: CollaboratorError,
    },
}

/// Point estimate and standard error returned by the contamination optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContaminationFit {
    pub rate: f64,
    pub standard_error: f64,
}

/// Estimates the genotyping error rate of a sample from its raw reads.
pub trait ErrorRateEstimator {
    fn estimate_error_rate(&self, sample_id: &str) -> Result<f64, CollaboratorError>;
}

/// A genotyping error rate known up front.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedErrorRate(pub f64);

impl ErrorRateEstimator for FixedErrorRate {
    fn estimate_error_rate(&self, _sample_id: &str) -> Result<f64, CollaboratorError> {
        Ok(self.0)
    }
}

/// Maximum-likelihood contamination estimate restricted to called ROH.
pub trait ContaminationEstimator {
    fn estimate(&self, calls: &GenomeCalls, error_rate: f64) -> Result<ContaminationFit, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinementConfig {
    /// Contamination assumed by the first calling pass
    pub seed: f64,
    /// Stop once two consecutive estimates differ by at most this
    pub tolerance: f64,
    /// Maximum number of calling + estimation passes
    pub max_iter: usize,
    /// Below this the first estimate is accepted without refinement
    pub negligible_floor: f64,
    /// Re-call ROH once more with the final estimate
    pub final_recall: bool,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        RefinementConfig {
            seed: 0.05,
            tolerance: 0.005,
            max_iter: 5,
            negligible_floor: 0.05,
            final_recall: false,
        }
    }
}

impl RefinementConfig {
    pub fn validate(&self) -> Result<(), RefineError> {
        if !(self.seed >= 0.0 && self.seed < 1.0) {
            return Err(RefineError::Config(format!(
                "contamination seed must lie in [0, 1), got {}",
                self.seed
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(RefineError::Config(format!(
                "tolerance must be > 0, got {}",
                self.tolerance
            )));
        }
        if self.max_iter == 0 {
            return Err(RefineError::Config("max_iter must be at least 1".into()));
        }
        if !self.negligible_floor.is_finite() {
            return Err(RefineError::Config(format!(
                "negligible contamination floor must be finite, got {}",
                self.negligible_floor
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementStatus {
    Converged,
    MaxIterReached,
}

/// Result of a refinement run: the final estimate and the calls it was
/// computed from.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub status: RefinementStatus,
    pub estimate: ContaminationEstimate,
    pub error_rate: f64,
    pub calls: GenomeCalls,
}

impl RefinementOutcome {
    pub fn converged(&self) -> bool {
        self.status == RefinementStatus::Converged
    }
}

/// Alternates ROH calling and contamination estimation until convergence.
///
/// Each iteration runs exactly one whole-genome calling pass with the current
/// contamination and one estimation pass over the resulting calls. The loop
/// stops when `|c' - c| <= tolerance` (converged), when `max_iter` passes have
/// run (not converged, last estimate reported), or right after the first pass
/// if the seed or the first estimate is below `negligible_floor` (converged).
#[allow(clippy::too_many_arguments)]
pub fn refine_contamination<S, R, C>(
    source: &S,
    error_model: &R,
    estimator: &C,
    sample_id: &str,
    chromosomes: &[String],
    calling: &CallingParams,
    config: &RefinementConfig,
) -> Result<RefinementOutcome, RefineError>
where
    S: PosteriorSource + ?Sized,
    R: ErrorRateEstimator + ?Sized,
    C: ContaminationEstimator + ?Sized,
{
    config.validate()?;
    calling.validate()?;

    let error_rate = error_model
        .estimate_error_rate(sample_id)
        .map_err(RefineError::ErrorRate)?;
    if !(error_rate >= 0.0 && error_rate < 1.0) {
        return Err(RefineError::InvalidErrorRate(error_rate));
    }
    log::info!("Estimated genotyping error for {}: {:.6}", sample_id, error_rate);

    let mut contamination = config.seed;
    let mut iteration = 0;
    let (status, mut calls, fit) = loop {
        iteration += 1;
        let model = ModelParams {
            contamination,
            error_rate,
        };

        let calls = call_genome(source, sample_id, chromosomes, calling, &model)?;

        let fit = estimator
            .estimate(&calls, error_rate)
            .map_err(|source| RefineError::Estimator { iteration, source })?;
        if !fit.rate.is_finite() || !fit.standard_error.is_finite() {
            return Err(RefineError::Estimator {
                iteration,
                source: format!("non-finite estimate {} (se {})", fit.rate, fit.standard_error).into(),
            });
        }

        let delta = (fit.rate - contamination).abs();
        log::info!(
            "Iteration {} done, prev contam: {:.6}, current contam: {:.6} (se {:.6})",
            iteration,
            contamination,
            fit.rate,
            fit.standard_error
        );

        if iteration == 1 && (config.seed < config.negligible_floor || fit.rate < config.negligible_floor) {
            log::info!(
                "Contamination below {} for {}; no refinement needed",
                config.negligible_floor,
                sample_id
            );
            break (RefinementStatus::Converged, calls, fit);
        }
        if delta <= config.tolerance {
            log::info!("Contamination rate converged after {} iterations", iteration);
            break (RefinementStatus::Converged, calls, fit);
        }
        if iteration >= config.max_iter {
            log::warn!(
                "Contamination rate did not converge after {} iterations (last change {:.6} > {}). Try increasing max_iter.",
                iteration,
                delta,
                config.tolerance
            );
            break (RefinementStatus::MaxIterReached, calls, fit);
        }
        contamination = fit.rate;
    };

    if config.final_recall {
        log::info!("Re-calling ROH with final contamination {:.6}", fit.rate);
        let model = ModelParams {
            contamination: fit.rate,
            error_rate,
        };
        calls = call_genome(source, sample_id, chromosomes, calling, &model)?;
    }

    Ok(RefinementOutcome {
        status,
        estimate: ContaminationEstimate {
            rate: fit.rate,
            standard_error: fit.standard_error,
            iteration,
            converged: status == RefinementStatus::Converged,
        },
        error_rate,
        calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posterior::ChromPosterior;
    use crate::PosteriorMode;
    use ndarray::array;
    use std::cell::Cell;
    use std::sync::Mutex;

    /// Returns the same posterior every time and records the contamination
    /// each pass was run with.
    #[derive(Default)]
    struct RecordingSource {
        seen: Mutex<Vec<f64>>,
    }

    impl RecordingSource {
        fn passes(&self) -> Vec<f64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl PosteriorSource for RecordingSource {
        fn decode(&self, _sample_id: &str, _chromosome: &str, model: &ModelParams) -> Result<ChromPosterior, CollaboratorError> {
            self.seen.lock().unwrap().push(model.contamination);
            Ok(ChromPosterior::new(
                array![0.1, 0.1, 0.9, 0.9, 0.9, 0.1, 0.9, 0.9, 0.1, 0.1],
                array![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9],
            )?)
        }
    }

    /// Plays back a fixed sequence of estimates.
    struct Scripted {
        rates: Vec<f64>,
        next: Cell<usize>,
    }

    impl Scripted {
        fn new(rates: &[f64]) -> Self {
            Scripted {
                rates: rates.to_vec(),
                next: Cell::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.next.get()
        }
    }

    impl ContaminationEstimator for Scripted {
        fn estimate(&self, calls: &GenomeCalls, _error_rate: f64) -> Result<ContaminationFit, CollaboratorError> {
            assert!(!calls.chromosomes.is_empty());
            let i = self.next.get();
            self.next.set(i + 1);
            let rate = *self.rates.get(i).ok_or("optimizer did not converge")?;
            Ok(ContaminationFit {
                rate,
                standard_error: 0.01,
            })
        }
    }

    struct FailingErrorModel;

    impl ErrorRateEstimator for FailingErrorModel {
        fn estimate_error_rate(&self, _sample_id: &str) -> Result<f64, CollaboratorError> {
            Err("no reads".into())
        }
    }

    fn chromosomes() -> Vec<String> {
        vec!["1".to_string()]
    }

    fn calling() -> CallingParams {
        CallingParams::new(PosteriorMode::Identity, 0.8, 0.0, 0.05, true).unwrap()
    }

    fn config(seed: f64) -> RefinementConfig {
        RefinementConfig {
            seed,
            tolerance: 0.005,
            max_iter: 5,
            negligible_floor: 0.05,
            final_recall: false,
        }
    }

    #[test]
    fn converges_on_third_iteration() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.070, 0.065, 0.0648]);
        let outcome = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.10),
        )
        .unwrap();

        assert!(outcome.converged());
        assert_eq!(outcome.estimate.iteration, 3);
        assert!(outcome.estimate.converged);
        assert!((outcome.estimate.rate - 0.0648).abs() < 1e-12);
        assert_eq!(outcome.error_rate, 0.01);
        // One calling pass per iteration, each with the previous estimate.
        assert_eq!(source.passes(), vec![0.10, 0.070, 0.065]);
        assert_eq!(estimator.calls(), 3);
        assert_eq!(outcome.calls.block_count(), 2);
    }

    #[test]
    fn oscillation_hits_iteration_budget() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.20, 0.10, 0.20, 0.10, 0.20, 0.10]);
        let outcome = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.10),
        )
        .unwrap();

        assert_eq!(outcome.status, RefinementStatus::MaxIterReached);
        assert!(!outcome.estimate.converged);
        assert_eq!(outcome.estimate.iteration, 5);
        assert_eq!(outcome.estimate.rate, 0.20);
        assert_eq!(source.passes().len(), 5);
        assert_eq!(estimator.calls(), 5);
    }

    #[test]
    fn negligible_first_estimate_stops_immediately() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.01, 0.3]);
        let outcome = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.10),
        )
        .unwrap();

        assert!(outcome.converged());
        assert_eq!(outcome.estimate.iteration, 1);
        assert_eq!(outcome.estimate.rate, 0.01);
        assert_eq!(estimator.calls(), 1);
    }

    #[test]
    fn first_estimate_at_floor_keeps_refining() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.05, 0.05]);
        let outcome = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.10),
        )
        .unwrap();

        // The floor itself is not negligible: a second pass runs.
        assert!(outcome.converged());
        assert_eq!(outcome.estimate.iteration, 2);
        assert_eq!(source.passes(), vec![0.10, 0.05]);
        assert_eq!(estimator.calls(), 2);
    }

    #[test]
    fn negligible_seed_stops_immediately() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.2, 0.2]);
        let outcome = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.0),
        )
        .unwrap();

        assert!(outcome.converged());
        assert_eq!(outcome.estimate.iteration, 1);
        assert_eq!(source.passes(), vec![0.0]);
    }

    #[test]
    fn single_iteration_budget() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.3]);
        let cfg = RefinementConfig {
            max_iter: 1,
            ..config(0.10)
        };
        let outcome = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &cfg,
        )
        .unwrap();
        assert_eq!(outcome.status, RefinementStatus::MaxIterReached);
        assert_eq!(outcome.estimate.iteration, 1);
    }

    #[test]
    fn final_recall_uses_final_estimate() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.070, 0.069]);
        let cfg = RefinementConfig {
            final_recall: true,
            ..config(0.10)
        };
        let outcome = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &cfg,
        )
        .unwrap();
        assert_eq!(outcome.estimate.iteration, 2);
        assert_eq!(source.passes(), vec![0.10, 0.070, 0.069]);
        assert_eq!(estimator.calls(), 2);
    }

    #[test]
    fn estimator_failure_is_surfaced() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.2]);
        let err = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.10),
        )
        .unwrap_err();
        assert!(matches!(err, RefineError::Estimator { iteration: 2, .. }), "{err}");
    }

    #[test]
    fn non_finite_estimate_is_a_failure() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[f64::NAN]);
        let err = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.10),
        )
        .unwrap_err();
        assert!(matches!(err, RefineError::Estimator { iteration: 1, .. }));
    }

    #[test]
    fn error_rate_failure_is_surfaced() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.2]);
        let err = refine_contamination(
            &source,
            &FailingErrorModel,
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.10),
        )
        .unwrap_err();
        assert!(matches!(err, RefineError::ErrorRate(_)));
        assert!(source.passes().is_empty());

        let err = refine_contamination(
            &source,
            &FixedErrorRate(1.5),
            &estimator,
            "iid0",
            &chromosomes(),
            &calling(),
            &config(0.10),
        )
        .unwrap_err();
        assert!(matches!(err, RefineError::InvalidErrorRate(_)));
    }

    #[test]
    fn invalid_configuration_fails_before_any_pass() {
        let source = RecordingSource::default();
        let estimator = Scripted::new(&[0.2]);
        for cfg in [
            RefinementConfig { max_iter: 0, ..config(0.1) },
            RefinementConfig { tolerance: 0.0, ..config(0.1) },
            RefinementConfig { seed: 1.0, ..config(0.1) },
        ] {
            let err = refine_contamination(
                &source,
                &FixedErrorRate(0.01),
                &estimator,
                "iid0",
                &chromosomes(),
                &calling(),
                &cfg,
            )
            .unwrap_err();
            assert!(matches!(err, RefineError::Config(_)));
        }

        let bad_calling = CallingParams {
            cutoff: 1.2,
            ..CallingParams::default()
        };
        let err = refine_contamination(
            &source,
            &FixedErrorRate(0.01),
            &estimator,
            "iid0",
            &chromosomes(),
            &bad_calling,
            &config(0.1),
        )
        .unwrap_err();
        assert!(matches!(err, RefineError::Calling(CallingError::InvalidParameter(_))));
        assert!(source.passes().is_empty());
        assert_eq!(estimator.calls(), 0);
    }
}
