//! Run a simulation and record per-step snapshots to a structured file
//!
//! The record container is a JSON-lines file: a metadata line (grid shape,
//! planned steps, shuffled step schedule, config snapshot), one line per
//! captured step, and a footer marking the record complete or not. Every
//! line is flushed as it is written, so the file stays readable while a run
//! is in progress and a crash loses at most the in-flight line.

use crate::controller::{FuelFire, ProcessError};
use crate::mosaic::{Grid, MosaicError};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default record file name inside a model directory
pub const RECORD_FILE: &str = "record.jsonl";

const RECORD_VERSION: u32 = 1;

/// Record metadata, written as the first line of the container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Container format version
    pub version: u32,
    /// Grid rows shared by every snapshot
    pub rows: usize,
    /// Grid columns shared by every snapshot
    pub cols: usize,
    /// Number of snapshots the run was asked to capture
    pub planned_steps: usize,
    /// Internal simulation steps advanced per captured snapshot
    pub stride: usize,
    /// Randomly ordered step indices, inherited by replication experiments
    pub shuffled_steps: Vec<u32>,
    /// Verbatim configuration file contents at record time
    pub config_text: String,
    /// Recording timestamp
    pub recorded_at: DateTime<Utc>,
}

/// One captured step: the landscape state after the step completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    /// 1-based capture ordinal
    pub step: usize,
    /// Cumulative internal steps completed by the simulation
    pub steps_completed: usize,
    /// Time-since-fire mosaic
    pub age: Grid,
    /// Fuel mosaic
    pub fuel: Grid,
}

/// Final line of the container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFooter {
    /// False when the run failed partway through
    pub complete: bool,
    /// Snapshots actually captured
    pub steps_recorded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecordLine {
    Meta(RecordMeta),
    Step(StepSnapshot),
    Footer(RecordFooter),
}

/// Errors raised while recording or reading a record container
#[derive(Debug)]
pub enum RecordError {
    /// The underlying simulation failed
    Process(ProcessError),
    /// A model mosaic file could not be read or written
    Mosaic(MosaicError),
    /// Record file I/O failed
    Io(String),
    /// Record file contents were not a valid container
    Format(String),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Process(err) => write!(f, "record run failed: {err}"),
            RecordError::Mosaic(err) => write!(f, "record mosaic access failed: {err}"),
            RecordError::Io(msg) => write!(f, "record I/O failed: {msg}"),
            RecordError::Format(msg) => write!(f, "malformed record file: {msg}"),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Process(err) => Some(err),
            RecordError::Mosaic(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProcessError> for RecordError {
    fn from(err: ProcessError) -> Self {
        RecordError::Process(err)
    }
}

impl From<MosaicError> for RecordError {
    fn from(err: MosaicError) -> Self {
        RecordError::Mosaic(err)
    }
}

/// Incremental, append-only writer for the record container
pub struct RecordWriter {
    out: BufWriter<File>,
    steps_recorded: usize,
}

impl RecordWriter {
    /// Create the container and write its metadata line
    ///
    /// # Errors
    /// Returns `RecordError::Io` on file or serialization failure.
    pub fn create<P: AsRef<Path>>(path: P, meta: RecordMeta) -> Result<Self, RecordError> {
        let file = File::create(path).map_err(|e| RecordError::Io(e.to_string()))?;
        let mut writer = Self {
            out: BufWriter::new(file),
            steps_recorded: 0,
        };
        writer.write_line(&RecordLine::Meta(meta))?;
        Ok(writer)
    }

    /// Append one captured step and flush
    ///
    /// # Errors
    /// Returns `RecordError::Io` on write failure.
    pub fn append(&mut self, snapshot: StepSnapshot) -> Result<(), RecordError> {
        self.write_line(&RecordLine::Step(snapshot))?;
        self.steps_recorded += 1;
        Ok(())
    }

    /// Snapshots appended so far
    pub fn steps_recorded(&self) -> usize {
        self.steps_recorded
    }

    /// Write the footer and close the container
    ///
    /// # Errors
    /// Returns `RecordError::Io` on write failure.
    pub fn finalize(mut self, complete: bool) -> Result<usize, RecordError> {
        let footer = RecordFooter {
            complete,
            steps_recorded: self.steps_recorded,
        };
        self.write_line(&RecordLine::Footer(footer))?;
        Ok(self.steps_recorded)
    }

    fn write_line(&mut self, line: &RecordLine) -> Result<(), RecordError> {
        let mut json =
            serde_json::to_string(line).map_err(|e| RecordError::Io(e.to_string()))?;
        json.push('\n');
        self.out
            .write_all(json.as_bytes())
            .and_then(|()| self.out.flush())
            .map_err(|e| RecordError::Io(e.to_string()))
    }
}

/// A fully loaded record container
#[derive(Debug, Clone)]
pub struct RecordedSeries {
    pub meta: RecordMeta,
    pub snapshots: Vec<StepSnapshot>,
    /// True only when the footer marks the run complete
    pub complete: bool,
}

impl RecordedSeries {
    /// Load a record container from disk
    ///
    /// A missing footer (crashed writer) is tolerated and read as an
    /// incomplete record.
    ///
    /// # Errors
    /// Returns `RecordError::Io` on read failure and `RecordError::Format`
    /// on malformed content or a snapshot whose shape disagrees with the
    /// metadata.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RecordError> {
        let file = File::open(&path).map_err(|e| RecordError::Io(e.to_string()))?;
        let reader = BufReader::new(file);

        let mut meta: Option<RecordMeta> = None;
        let mut snapshots = Vec::new();
        let mut complete = false;
        let mut footer_seen = false;

        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| RecordError::Io(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            if footer_seen {
                return Err(RecordError::Format(format!(
                    "content after footer at line {}",
                    lineno + 1
                )));
            }
            let parsed: RecordLine = serde_json::from_str(&line).map_err(|e| {
                RecordError::Format(format!("line {}: {e}", lineno + 1))
            })?;
            match parsed {
                RecordLine::Meta(m) => {
                    if meta.is_some() {
                        return Err(RecordError::Format(format!(
                            "second metadata line at line {}",
                            lineno + 1
                        )));
                    }
                    meta = Some(m);
                }
                RecordLine::Step(snapshot) => {
                    let Some(meta) = meta.as_ref() else {
                        return Err(RecordError::Format(
                            "snapshot before metadata".to_string(),
                        ));
                    };
                    let shape = (meta.rows, meta.cols);
                    if snapshot.age.shape() != shape || snapshot.fuel.shape() != shape {
                        return Err(RecordError::Format(format!(
                            "snapshot {} shape disagrees with metadata {}x{}",
                            snapshot.step, meta.rows, meta.cols
                        )));
                    }
                    snapshots.push(snapshot);
                }
                RecordLine::Footer(footer) => {
                    complete = footer.complete;
                    footer_seen = true;
                }
            }
        }

        let Some(meta) = meta else {
            return Err(RecordError::Format("missing metadata line".to_string()));
        };
        if !footer_seen {
            warn!("record has no footer, treating as incomplete");
        }

        Ok(Self {
            meta,
            snapshots,
            complete,
        })
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Write a recorded step's mosaics back into a model directory
    ///
    /// Restores the landscape files so the external program resumes from
    /// that step's state.
    ///
    /// # Errors
    /// Returns `RecordError::Format` for an out-of-range index and
    /// `RecordError::Mosaic` on write failure.
    pub fn restore_into(&self, index: usize, ff: &FuelFire) -> Result<(), RecordError> {
        let snapshot = self.snapshots.get(index).ok_or_else(|| {
            RecordError::Format(format!(
                "no snapshot {index} in a record of {}",
                self.snapshots.len()
            ))
        })?;
        ff.write_age(&snapshot.age)?;
        ff.write_fuel(&snapshot.fuel)?;
        Ok(())
    }
}

/// Finite, non-restartable stream of per-step snapshots
///
/// Drives the controller one capture at a time; the first failure ends the
/// stream after yielding the error. A snapshot whose age mosaic is mostly
/// identical to the previous one is treated as a failed step, not recorded.
pub struct StepStream<'a> {
    ff: &'a mut FuelFire,
    stride: usize,
    remaining: usize,
    captured: usize,
    prev_age: Option<Grid>,
    done: bool,
}

impl<'a> StepStream<'a> {
    pub fn new(ff: &'a mut FuelFire, steps: usize, stride: usize) -> Self {
        Self {
            ff,
            stride: stride.max(1),
            remaining: steps,
            captured: 0,
            prev_age: None,
            done: false,
        }
    }

    fn advance(&mut self) -> Result<StepSnapshot, ProcessError> {
        self.ff.step(self.stride)?;
        let age = self
            .ff
            .load_age()
            .map_err(|e| ProcessError::Runtime(format!("age mosaic unreadable: {e}")))?;
        let fuel = self
            .ff
            .load_fuel()
            .map_err(|e| ProcessError::Runtime(format!("fuel mosaic unreadable: {e}")))?;

        if let Some(prev) = &self.prev_age {
            if age.equal_fraction(prev) > 0.5 {
                return Err(ProcessError::Runtime(
                    "age mosaic is mostly unchanged from the previous step".to_string(),
                ));
            }
        }
        self.prev_age = Some(age.clone());
        self.captured += 1;

        Ok(StepSnapshot {
            step: self.captured,
            steps_completed: self.ff.steps_completed(),
            age,
            fuel,
        })
    }
}

impl Iterator for StepStream<'_> {
    type Item = Result<StepSnapshot, ProcessError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == 0 {
            return None;
        }
        match self.advance() {
            Ok(snapshot) => {
                self.remaining -= 1;
                Some(Ok(snapshot))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Drive a controller through a fixed step sequence, recording each step
pub struct RecordedFuelFire {
    ff: FuelFire,
    record_path: PathBuf,
    stride: usize,
    seed: Option<u64>,
}

impl RecordedFuelFire {
    /// Record runs of the model in `dir` with default layout and timings
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_controller(FuelFire::new(dir))
    }

    /// Record runs of a custom-configured controller
    pub fn with_controller(ff: FuelFire) -> Self {
        let record_path = ff.dir().join(RECORD_FILE);
        Self {
            ff,
            record_path,
            stride: 1,
            seed: None,
        }
    }

    /// Advance this many internal steps per captured snapshot
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    /// Seed the shuffled step schedule for reproducible experiments
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    pub fn controller(&self) -> &FuelFire {
        &self.ff
    }

    /// Start the simulation, capture `num_steps` snapshots, stop, finalize
    ///
    /// Returns the number of snapshots recorded. On a mid-run process
    /// failure the partial container is flushed with an incomplete footer
    /// and the underlying error is re-raised; captured steps are never lost.
    /// Temp files are cleaned on both paths.
    ///
    /// # Errors
    /// `RecordError::Process` for simulation failures, `Io`/`Mosaic` for
    /// container and model file failures.
    pub fn run(&mut self, num_steps: usize) -> Result<usize, RecordError> {
        let shape = self.ff.load_age()?;
        let (rows, cols) = shape.shape();
        let config_text = fs::read_to_string(self.ff.config_path())
            .map_err(|e| RecordError::Io(e.to_string()))?;

        let mut schedule: Vec<u32> = (0..num_steps as u32).collect();
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        schedule.shuffle(&mut rng);

        let meta = RecordMeta {
            version: RECORD_VERSION,
            rows,
            cols,
            planned_steps: num_steps,
            stride: self.stride,
            shuffled_steps: schedule,
            config_text,
            recorded_at: Utc::now(),
        };
        let mut writer = RecordWriter::create(&self.record_path, meta)?;
        info!(
            "recording {num_steps} steps of {} to {}",
            self.ff.dir().display(),
            self.record_path.display()
        );

        let mut failure: Option<ProcessError> = None;
        if let Err(err) = self.ff.start() {
            failure = Some(err);
        } else {
            let stream = StepStream::new(&mut self.ff, num_steps, self.stride);
            for item in stream {
                match item {
                    Ok(snapshot) => {
                        if snapshot.age.shape() != (rows, cols)
                            || snapshot.fuel.shape() != (rows, cols)
                        {
                            failure = Some(ProcessError::Runtime(format!(
                                "snapshot shape {:?} disagrees with the {rows}x{cols} model grid",
                                snapshot.age.shape()
                            )));
                            break;
                        }
                        writer.append(snapshot)?;
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        if let Some(err) = failure {
            let recorded = writer.steps_recorded();
            // keep what we have: flush the partial record with an
            // incomplete marker before surfacing the failure
            let _ = writer.finalize(false);
            if let Err(clean) = self.ff.clean_temp_files() {
                warn!("temp cleanup after failure: {clean}");
            }
            warn!("record run failed after {recorded} captured steps: {err}");
            return Err(err.into());
        }

        self.ff.stop()?;
        let recorded = writer.finalize(true)?;
        if let Err(clean) = self.ff.clean_temp_files() {
            warn!("temp cleanup after run: {clean}");
        }
        info!("recorded {recorded} steps");
        Ok(recorded)
    }
}
