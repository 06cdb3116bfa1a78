//! Module for calling ROH blocks from per-site posteriors.
//!
//! One pass is: decode -> threshold into maximal runs -> drop short runs ->
//! merge runs separated by small genetic gaps. Chromosomes are independent,
//! so a whole-genome pass runs them on the rayon pool.
use crate::posterior::ChromPosterior;
use crate::{CallSet, CollaboratorError, GenomeCalls, Interval, PosteriorMode};
use ndarray::Array1;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallingError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Posterior has {posterior} sites but genetic map has {map}")]
    LengthMismatch { posterior: usize, map: usize },
    #[error("Genetic map decreases at site {index}")]
    UnsortedMap { index: usize },
    #[error("Genetic map value at site {index} is not finite")]
    NonFiniteMap { index: usize },
    #[error("Posterior decoding failed for chromosome {chromosome}: {source}")]
    Decoder {
        chromosome: String,
        #[source]
        source: CollaboratorError,
    },
}

/// Parameters of one calling pass. Passed by value into every call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallingParams {
    /// How raw posteriors are decoded
    pub mode: PosteriorMode,
    /// Sites with P(ROH) strictly above this are in ROH
    pub cutoff: f64,
    /// Blocks must be strictly longer than this (Morgans)
    pub min_len: f64,
    /// Gaps strictly shorter than this are merged (Morgans)
    pub max_gap: f64,
    /// Whether to merge blocks at all
    pub merge: bool,
}

impl Default for CallingParams {
    fn default() -> Self {
        CallingParams {
            mode: PosteriorMode::LogComplement,
            cutoff: 0.8,
            min_len: 0.01,
            max_gap: 0.01,
            merge: true,
        }
    }
}

impl CallingParams {
    /// Builds validated parameters.
    pub fn new(mode: PosteriorMode, cutoff: f64, min_len: f64, max_gap: f64, merge: bool) -> Result<Self, CallingError> {
        let params = CallingParams {
            mode,
            cutoff,
            min_len,
            max_gap,
            merge,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), CallingError> {
        if !(self.cutoff > 0.0 && self.cutoff < 1.0) {
            return Err(CallingError::InvalidParameter(format!(
                "cutoff must lie in (0, 1), got {}",
                self.cutoff
            )));
        }
        if !(self.min_len.is_finite() && self.min_len >= 0.0) {
            return Err(CallingError::InvalidParameter(format!(
                "minimum block length must be >= 0, got {}",
                self.min_len
            )));
        }
        if !(self.max_gap.is_finite() && self.max_gap > 0.0) {
            return Err(CallingError::InvalidParameter(format!(
                "maximum merge gap must be > 0, got {}",
                self.max_gap
            )));
        }
        Ok(())
    }
}

/// Model parameters handed to the HMM decoder for one pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParams {
    pub contamination: f64,
    pub error_rate: f64,
}

/// Produces the raw posterior and genetic map of one chromosome.
///
/// Implementations wrap the HMM forward-backward run (or precomputed files).
pub trait PosteriorSource: Sync {
    fn decode(&self, sample_id: &str, chromosome: &str, model: &ModelParams) -> Result<ChromPosterior, CollaboratorError>;
}

/// Extracts every maximal run of sites with probability > `cutoff`.
///
/// The classification is padded with an out-of-state site on both ends; in
/// the first difference a rising edge is a run start and a falling edge is
/// one past a run end. Genetic bounds are taken at the first and the last
/// site of the run.
pub fn call_segments(probs: &Array1<f64>, map: &Array1<f64>, cutoff: f64) -> Result<Vec<Interval>, CallingError> {
    if probs.len() != map.len() {
        return Err(CallingError::LengthMismatch {
            posterior: probs.len(),
            map: map.len(),
        });
    }

    let padded: Vec<i8> = std::iter::once(0)
        .chain(probs.iter().map(|&p| i8::from(p > cutoff)))
        .chain(std::iter::once(0))
        .collect();

    let mut starts = Vec::new();
    let mut ends = Vec::new();
    for (i, w) in padded.windows(2).enumerate() {
        match w[1] - w[0] {
            1 => starts.push(i),
            -1 => ends.push(i),
            _ => {}
        }
    }
    debug_assert_eq!(starts.len(), ends.len());

    Ok(starts
        .into_iter()
        .zip(ends)
        .map(|(start, end)| Interval::new(start, end, map[start], map[end - 1]))
        .collect())
}

/// Keeps blocks strictly longer than `min_len` Morgans, order preserved.
pub fn filter_short(intervals: Vec<Interval>, min_len: f64) -> Vec<Interval> {
    intervals
        .into_iter()
        .filter(|iv| iv.genetic_length() > min_len)
        .collect()
}

/// Fuses neighbouring blocks whose genetic gap is below `max_gap`.
///
/// Single left-to-right sweep with one accumulator: each block is compared
/// against the accumulator's current (possibly already extended) end, so a
/// chain of small gaps collapses into one block. Input must be sorted by
/// start index.
pub fn merge_blocks(intervals: Vec<Interval>, max_gap: f64) -> Vec<Interval> {
    let mut iter = intervals.into_iter();
    let Some(mut current) = iter.next() else {
        return Vec::new();
    };

    let mut merged = Vec::new();
    for next in iter {
        if current.gap_to(&next) < max_gap {
            current.absorb(&next);
        } else {
            merged.push(std::mem::replace(&mut current, next));
        }
    }
    merged.push(current);
    merged
}

/// Calls ROH on one chromosome.
pub fn call_roh(
    posterior: &ChromPosterior,
    params: &CallingParams,
    sample_id: &str,
    chromosome_id: &str,
) -> Result<CallSet, CallingError> {
    params.validate()?;

    if posterior.is_empty() {
        log::warn!("No sites for {} on chromosome {}; nothing to call", sample_id, chromosome_id);
        return Ok(CallSet::new(sample_id, chromosome_id, Vec::new()));
    }

    let probs = posterior.probabilities(params.mode);
    let n_in_roh = probs.iter().filter(|&&p| p > params.cutoff).count();
    log::debug!(
        "Chromosome {}: fraction of sites in ROH {:.4}",
        chromosome_id,
        n_in_roh as f64 / probs.len() as f64
    );

    let raw_runs = call_segments(&probs, &posterior.map, params.cutoff)?;
    let n_raw = raw_runs.len();
    let mut blocks = filter_short(raw_runs, params.min_len);
    log::trace!(
        "Chromosome {}: {} runs, {} longer than {} M",
        chromosome_id,
        n_raw,
        blocks.len(),
        params.min_len
    );

    if params.merge {
        let n_before = blocks.len();
        blocks = merge_blocks(blocks, params.max_gap);
        log::debug!(
            "Chromosome {}: merged n={} gaps < {} M",
            chromosome_id,
            n_before - blocks.len(),
            params.max_gap
        );
    }

    Ok(CallSet::new(sample_id, chromosome_id, blocks))
}

/// Runs one calling pass over all `chromosomes` in parallel.
///
/// The result keeps the order of `chromosomes`. Any decoder failure aborts
/// the pass.
pub fn call_genome<S: PosteriorSource + ?Sized>(
    source: &S,
    sample_id: &str,
    chromosomes: &[String],
    params: &CallingParams,
    model: &ModelParams,
) -> Result<GenomeCalls, CallingError> {
    params.validate()?;

    log::info!(
        "Calling ROH for {} on {} chromosomes (c = {:.6}, e = {:.6})",
        sample_id,
        chromosomes.len(),
        model.contamination,
        model.error_rate
    );

    let per_chromosome = chromosomes
        .par_iter()
        .map(|ch| {
            let posterior = source
                .decode(sample_id, ch, model)
                .map_err(|source| CallingError::Decoder {
                    chromosome: ch.clone(),
                    source,
                })?;
            call_roh(&posterior, params, sample_id, ch)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let calls = GenomeCalls {
        sample_id: sample_id.to_string(),
        chromosomes: per_chromosome,
    };
    log::info!(
        "Called n={} ROH blocks > {:.3} cM for {}, longest {:.3} cM",
        calls.block_count(),
        params.min_len * 100.0,
        sample_id,
        calls.longest_block() * 100.0
    );
    Ok(calls)
}
