//! # HAPCON-RUST Crate
//!
//! This library turns per-site HMM posteriors over the "homozygous by descent"
//! state into Runs of Homozygosity (ROH) and refines a sample's contamination
//! estimate by re-calling ROH until the estimate stabilizes.
//! The `call-roh` binary calls functions from this library.

pub mod calling;
pub mod io;
pub mod posterior;
pub mod refine;
pub mod report;

/// Error type returned by external collaborators (HMM decoder, error-rate
/// estimator, contamination optimizer).
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// A called run of homozygosity on one chromosome.
///
/// `end_index` is exclusive. `start_position` and `end_position` are the
/// genetic-map values (Morgans) of the first and the last site of the run.
/// Lengths are always derived from the boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub start_index: usize,
    pub end_index: usize,
    pub start_position: f64,
    pub end_position: f64,
}

impl Interval {
    pub fn new(start_index: usize, end_index: usize, start_position: f64, end_position: f64) -> Self {
        debug_assert!(end_index > start_index);
        Interval {
            start_index,
            end_index,
            start_position,
            end_position,
        }
    }

    /// Number of sites covered
    pub fn site_length(&self) -> usize {
        self.end_index - self.start_index
    }

    /// Genetic length in Morgans
    pub fn genetic_length(&self) -> f64 {
        self.end_position - self.start_position
    }

    /// Genetic distance from the end of `self` to the start of `next`
    pub fn gap_to(&self, next: &Interval) -> f64 {
        next.start_position - self.end_position
    }

    /// Moves the right boundary of `self` to the right boundary of `other`.
    pub fn absorb(&mut self, other: &Interval) {
        self.end_index = other.end_index;
        self.end_position = other.end_position;
    }
}

/// Ordered ROH calls for one (sample, chromosome) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSet {
    pub sample_id: String,
    pub chromosome_id: String,
    pub intervals: Vec<Interval>,
}

impl CallSet {
    pub fn new(sample_id: impl Into<String>, chromosome_id: impl Into<String>, intervals: Vec<Interval>) -> Self {
        CallSet {
            sample_id: sample_id.into(),
            chromosome_id: chromosome_id.into(),
            intervals,
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Sum of genetic lengths (Morgans)
    pub fn total_genetic_length(&self) -> f64 {
        self.intervals.iter().map(Interval::genetic_length).sum()
    }
}

/// All per-chromosome call sets of one sample, in chromosome order.
#[derive(Debug, Clone, PartialEq)]
pub struct GenomeCalls {
    pub sample_id: String,
    pub chromosomes: Vec<CallSet>,
}

impl GenomeCalls {
    pub fn block_count(&self) -> usize {
        self.chromosomes.iter().map(CallSet::len).sum()
    }

    /// Total ROH genetic length (Morgans) over all chromosomes
    pub fn total_genetic_length(&self) -> f64 {
        self.chromosomes.iter().map(CallSet::total_genetic_length).sum()
    }

    /// Longest single block (Morgans), 0 if nothing was called
    pub fn longest_block(&self) -> f64 {
        self.chromosomes
            .iter()
            .flat_map(|c| c.intervals.iter())
            .map(Interval::genetic_length)
            .fold(0.0, f64::max)
    }
}

/// Contamination rate after a refinement pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContaminationEstimate {
    pub rate: f64,
    pub standard_error: f64,
    /// Number of calling + estimation passes that produced this estimate
    pub iteration: usize,
    pub converged: bool,
}

/// How raw posterior values are turned into P(ROH).
///
/// The policy must match the upstream model variant; a mismatch produces
/// plausible-looking but wrong probabilities and cannot be detected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PosteriorMode {
    /// Raw value already is P(ROH). Method name "MMR".
    Identity,
    /// Raw value is ln P(non-ROH); P(ROH) = 1 - exp(raw). Method name "Standard".
    #[default]
    LogComplement,
}

impl PosteriorMode {
    /// Calling method name used in reports
    pub fn method_name(&self) -> &'static str {
        match self {
            PosteriorMode::Identity => "MMR",
            PosteriorMode::LogComplement => "Standard",
        }
    }
}

impl std::str::FromStr for PosteriorMode {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" | "s" | "log-complement" => Ok(PosteriorMode::LogComplement),
            "mmr" | "m" | "identity" => Ok(PosteriorMode::Identity),
            _ => Err("Unknown posterior mode. Use 'standard' or 'mmr'."),
        }
    }
}
