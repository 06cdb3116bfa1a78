//! Module for handling I/O: posterior/map loading and the ROH call table.
use crate::calling::{CallingError, ModelParams, PosteriorSource};
use crate::posterior::ChromPosterior;
use crate::report::SummaryReport;
use crate::{CallSet, CollaboratorError, GenomeCalls, Interval};
use csv::{ReaderBuilder, Trim, Writer, WriterBuilder};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },
    #[error(transparent)]
    Calling(#[from] CallingError),
}

/// Column names of the call table, in output order.
pub const CALL_TABLE_HEADER: [&str; 8] = ["Start", "End", "StartM", "EndM", "length", "lengthM", "iid", "ch"];

/// Allowed difference between a stored `lengthM` and `EndM - StartM`
const LENGTH_TOLERANCE: f64 = 1e-9;

/// One row of the ROH call table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRow {
    #[serde(rename = "Start")]
    pub start_index: usize,
    #[serde(rename = "End")]
    pub end_index: usize,
    #[serde(rename = "StartM")]
    pub start_position: f64,
    #[serde(rename = "EndM")]
    pub end_position: f64,
    #[serde(rename = "length")]
    pub site_length: usize,
    #[serde(rename = "lengthM")]
    pub genetic_length: f64,
    pub iid: String,
    pub ch: String,
}

impl CallRow {
    pub fn new(interval: &Interval, sample_id: &str, chromosome_id: &str) -> Self {
        CallRow {
            start_index: interval.start_index,
            end_index: interval.end_index,
            start_position: interval.start_position,
            end_position: interval.end_position,
            site_length: interval.site_length(),
            genetic_length: interval.genetic_length(),
            iid: sample_id.to_string(),
            ch: chromosome_id.to_string(),
        }
    }

    /// Rebuilds the interval, checking the stored lengths against the
    /// boundaries.
    pub fn interval(&self) -> Result<Interval, String> {
        if self.end_index <= self.start_index {
            return Err(format!("End {} is not after Start {}", self.end_index, self.start_index));
        }
        if !(self.start_position.is_finite() && self.end_position.is_finite()) {
            return Err(format!(
                "non-finite genetic bounds {} - {}",
                self.start_position, self.end_position
            ));
        }
        if self.end_position < self.start_position {
            return Err(format!("EndM {} is before StartM {}", self.end_position, self.start_position));
        }
        let interval = Interval::new(self.start_index, self.end_index, self.start_position, self.end_position);
        if self.site_length != interval.site_length() {
            return Err(format!(
                "length {} does not match End - Start = {}",
                self.site_length,
                interval.site_length()
            ));
        }
        if (self.genetic_length - interval.genetic_length()).abs() > LENGTH_TOLERANCE {
            return Err(format!(
                "lengthM {} does not match EndM - StartM = {}",
                self.genetic_length,
                interval.genetic_length()
            ));
        }
        Ok(interval)
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

fn open_input(path: &Path) -> Result<Box<dyn Read>, IoError> {
    if !path.exists() {
        return Err(IoError::NotFound(path.to_string_lossy().into()));
    }
    let file = File::open(path)?;
    if is_gzip(path) {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// `folder/name`, or `folder/name.gz` if only the compressed file exists
fn find_file(folder: &Path, name: &str) -> Option<PathBuf> {
    let plain = folder.join(name);
    if plain.exists() {
        return Some(plain);
    }
    let gz = folder.join(format!("{}.gz", name));
    gz.exists().then_some(gz)
}

/// Reads a headerless file of floats, one per line or comma-separated.
pub fn read_float_column(path: &Path) -> Result<Array1<f64>, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(open_input(path)?);

    let mut values = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        for field in record.iter().filter(|f| !f.is_empty()) {
            let value = field.parse::<f64>().map_err(|e| IoError::Parse {
                path: path.to_string_lossy().into(),
                message: format!("line {}: '{}' is not a number ({})", line + 1, field, e),
            })?;
            values.push(value);
        }
    }
    Ok(Array1::from_vec(values))
}

/// Loads `posterior0.csv` and `map.csv` from one chromosome folder.
///
/// Without a map file the site index is used as the map.
pub fn load_chromosome_posterior(folder: &Path) -> Result<ChromPosterior, IoError> {
    let posterior_path = find_file(folder, "posterior0.csv")
        .ok_or_else(|| IoError::NotFound(folder.join("posterior0.csv").to_string_lossy().into()))?;
    let raw = read_float_column(&posterior_path)?;

    let map = match find_file(folder, "map.csv") {
        Some(map_path) => read_float_column(&map_path)?,
        None => {
            log::warn!("No genetic map found in {:?}! Defaulting to site indices", folder);
            Array1::from_iter((0..raw.len()).map(|i| i as f64))
        }
    };

    log::debug!("Loaded {} sites from {:?}", raw.len(), folder);
    Ok(ChromPosterior::new(raw, map)?)
}

/// Precomputed posteriors laid out as `<root>/chr<ch>/posterior0.csv`.
///
/// The files were decoded under fixed model parameters, so the parameters
/// passed to `decode` are ignored.
#[derive(Debug, Clone)]
pub struct PosteriorFolder {
    pub root: PathBuf,
}

impl PosteriorFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PosteriorFolder { root: root.into() }
    }

    pub fn chromosome_dir(&self, chromosome: &str) -> PathBuf {
        self.root.join(format!("chr{}", chromosome))
    }
}

impl PosteriorSource for PosteriorFolder {
    fn decode(&self, _sample_id: &str, chromosome: &str, _model: &ModelParams) -> Result<ChromPosterior, CollaboratorError> {
        Ok(load_chromosome_posterior(&self.chromosome_dir(chromosome))?)
    }
}

/// Writes header and one row per called block, in chromosome order.
pub fn write_calls<W: Write>(csv_writer: &mut Writer<W>, calls: &GenomeCalls) -> Result<(), IoError> {
    csv_writer.write_record(CALL_TABLE_HEADER)?;
    for call_set in &calls.chromosomes {
        for interval in &call_set.intervals {
            csv_writer.serialize(CallRow::new(interval, &call_set.sample_id, &call_set.chromosome_id))?;
        }
    }
    csv_writer.flush()?;
    Ok(())
}

/// Writes the call table to `path`, gzip-compressed if it ends in `.gz`.
pub fn write_call_table(path: &Path, calls: &GenomeCalls) -> Result<(), IoError> {
    log::info!("Writing {} ROH blocks to {:?}", calls.block_count(), path);
    let file = File::create(path)?;

    if is_gzip(path) {
        let mut csv_writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(GzEncoder::new(file, Compression::default()));
        write_calls(&mut csv_writer, calls)?;
        let encoder = csv_writer.into_inner().map_err(|e| IoError::Io(e.into_error()))?;
        encoder.finish()?;
    } else {
        let mut csv_writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        write_calls(&mut csv_writer, calls)?;
    }
    Ok(())
}

fn parse_error(path: &Path, message: String) -> IoError {
    IoError::Parse {
        path: path.to_string_lossy().into(),
        message,
    }
}

/// Reads a call table written by [`write_call_table`].
///
/// Every row must describe a well-formed block whose stored lengths agree
/// with its boundaries.
pub fn read_call_table(path: &Path) -> Result<Vec<CallRow>, IoError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(open_input(path)?);
    let rows = reader.deserialize().collect::<Result<Vec<CallRow>, _>>()?;
    for (i, row) in rows.iter().enumerate() {
        // header is line 1
        row.interval()
            .map_err(|message| parse_error(path, format!("line {}: {}", i + 2, message)))?;
    }
    log::debug!("Read {} ROH blocks from {:?}", rows.len(), path);
    Ok(rows)
}

/// Rebuilds per-chromosome call sets of a single sample from a call table.
///
/// Chromosomes keep their order of first appearance. Chromosomes without
/// any call are not represented in the table and are absent here. Blocks of
/// one chromosome must be ascending and non-overlapping.
pub fn read_genome_calls(path: &Path) -> Result<GenomeCalls, IoError> {
    let rows = read_call_table(path)?;
    let sample_id = rows.first().map(|r| r.iid.clone()).unwrap_or_default();

    let mut chromosomes: Vec<CallSet> = Vec::new();
    for (i, row) in rows.into_iter().enumerate() {
        let line = i + 2;
        if row.iid != sample_id {
            return Err(parse_error(
                path,
                format!("line {}: table mixes samples '{}' and '{}'", line, sample_id, row.iid),
            ));
        }
        let interval = row
            .interval()
            .map_err(|message| parse_error(path, format!("line {}: {}", line, message)))?;
        match chromosomes.iter_mut().find(|c| c.chromosome_id == row.ch) {
            Some(call_set) => {
                if let Some(last) = call_set.intervals.last() {
                    if interval.start_index < last.end_index {
                        return Err(parse_error(
                            path,
                            format!(
                                "line {}: block at {} on chromosome {} overlaps or precedes the block ending at {}",
                                line, interval.start_index, row.ch, last.end_index
                            ),
                        ));
                    }
                }
                call_set.intervals.push(interval);
            }
            None => chromosomes.push(CallSet::new(&sample_id, &row.ch, vec![interval])),
        }
    }
    Ok(GenomeCalls { sample_id, chromosomes })
}

/// Writes the per-sample summary report as plain text.
pub fn write_summary_report(path: &Path, report: &SummaryReport) -> Result<(), IoError> {
    log::info!("Writing summary for {} to {:?}", report.sample_id, path);
    std::fs::write(path, report.to_string())?;
    Ok(())
}
