//! Module for the per-sample summary report.
use crate::refine::{RefinementOutcome, RefinementStatus};
use crate::{GenomeCalls, PosteriorMode};
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Confidence level must lie in (0, 1), got {0}")]
    InvalidLevel(f64),
    #[error("Distribution error: {0}")]
    Distribution(String),
}

/// Contamination part of the report.
#[derive(Debug, Clone, PartialEq)]
pub struct ContaminationSummary {
    pub rate: f64,
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
    pub status: RefinementStatus,
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryReport {
    pub sample_id: String,
    pub method: &'static str,
    pub error_rate: Option<f64>,
    pub block_count: usize,
    /// Total ROH length in centiMorgans
    pub total_length_cm: f64,
    pub contamination: Option<ContaminationSummary>,
}

/// Two-sided standard normal quantile for a confidence `level`
/// (1.959964 for 0.95).
pub fn normal_quantile(level: f64) -> Result<f64, ReportError> {
    if !(level > 0.0 && level < 1.0) {
        return Err(ReportError::InvalidLevel(level));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| ReportError::Distribution(e.to_string()))?;
    Ok(normal.inverse_cdf(0.5 + level / 2.0))
}

impl SummaryReport {
    /// Report for a plain calling pass, without a contamination estimate.
    pub fn from_calls(calls: &GenomeCalls, mode: PosteriorMode) -> Self {
        SummaryReport {
            sample_id: calls.sample_id.clone(),
            method: mode.method_name(),
            error_rate: None,
            block_count: calls.block_count(),
            total_length_cm: calls.total_genetic_length() * 100.0,
            contamination: None,
        }
    }

    /// Report for a finished refinement run with a `level` confidence interval.
    pub fn from_outcome(outcome: &RefinementOutcome, mode: PosteriorMode, level: f64) -> Result<Self, ReportError> {
        let z = normal_quantile(level)?;
        let estimate = &outcome.estimate;
        let half_width = z * estimate.standard_error;

        let mut report = SummaryReport::from_calls(&outcome.calls, mode);
        report.error_rate = Some(outcome.error_rate);
        report.contamination = Some(ContaminationSummary {
            rate: estimate.rate,
            lower: estimate.rate - half_width,
            upper: estimate.rate + half_width,
            level,
            status: outcome.status,
            iterations: estimate.iteration,
        });
        Ok(report)
    }
}

impl fmt::Display for SummaryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sample: {}", self.sample_id)?;
        write!(f, "Calling method: {}", self.method)?;
        match self.error_rate {
            Some(e) => writeln!(f, ", fixing genotyping error rate at {:.6}", e)?,
            None => writeln!(f)?,
        }
        writeln!(f, "\tNumber of ROH blocks found: {}", self.block_count)?;
        writeln!(f, "\tTotal length of ROH: {:.3}cM", self.total_length_cm)?;
        if let Some(c) = &self.contamination {
            writeln!(
                f,
                "\tMLE for contamination: {:.6} ({:.6} - {:.6}, {}% CI)",
                c.rate,
                c.lower,
                c.upper,
                c.level * 100.0
            )?;
            match c.status {
                RefinementStatus::Converged => {
                    writeln!(f, "\tStatus: converged after {} iterations", c.iterations)?
                }
                RefinementStatus::MaxIterReached => {
                    writeln!(f, "\tStatus: did not converge after {} iterations", c.iterations)?
                }
            }
        }
        Ok(())
    }
}
