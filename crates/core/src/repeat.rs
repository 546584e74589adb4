//! Replay a recorded experiment as independent replicate runs
//!
//! Each replicate gets a fresh copy of the starting model state in its own
//! directory and records into its own container file, so no state crosses a
//! replicate boundary. By default one replicate's failure is collected and
//! the rest keep running; a summary is reported at the end.

use crate::controller::{FuelFire, RunTimings};
use crate::propagate::{copy_model, CopyError, CopyOptions};
use crate::record::RecordedFuelFire;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default replicate summary file name inside a model directory
pub const REPLICATES_FILE: &str = "repeat.json";

/// Tunables for a replicate batch
#[derive(Debug, Clone, Copy)]
pub struct RepeatOptions {
    /// Abort the batch on the first failed replicate instead of collecting
    pub fail_fast: bool,
    /// Worker pool width; 1 runs replicates sequentially. Fail-fast mode
    /// always runs sequentially.
    pub parallelism: usize,
    /// Internal steps per captured snapshot in each replicate
    pub stride: usize,
    /// Base seed for the per-replicate step schedules (offset by index)
    pub seed: Option<u64>,
    /// Protocol timings handed to every replicate's controller
    pub timings: RunTimings,
}

impl Default for RepeatOptions {
    fn default() -> Self {
        Self {
            fail_fast: false,
            parallelism: 1,
            stride: 1,
            seed: None,
            timings: RunTimings::default(),
        }
    }
}

/// Result of one replicate run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplicateOutcome {
    /// The replicate recorded every requested step
    Completed { record: PathBuf, steps: usize },
    /// The replicate failed; its partial record (if any) is retained
    Failed { error: String },
}

/// Replicate index → outcome for one batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicateSet {
    pub outcomes: BTreeMap<usize, ReplicateOutcome>,
}

impl ReplicateSet {
    pub fn successes(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, ReplicateOutcome::Completed { .. }))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }

    /// One-line batch summary
    pub fn summary(&self) -> String {
        format!(
            "{} replicates: {} completed, {} failed",
            self.outcomes.len(),
            self.successes(),
            self.failures()
        )
    }

    /// Save the summary as pretty-printed JSON
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RepeatError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| RepeatError::Io(e.to_string()))?;
        fs::write(path, contents).map_err(|e| RepeatError::Io(e.to_string()))
    }

    /// Load a saved summary
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RepeatError> {
        let contents =
            fs::read_to_string(path).map_err(|e| RepeatError::Io(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| RepeatError::Io(e.to_string()))
    }
}

/// Errors raised by a replicate batch
#[derive(Debug)]
pub enum RepeatError {
    /// Staging a replicate copy failed
    Copy(CopyError),
    /// Fail-fast mode aborted on this replicate
    Replicate { index: usize, message: String },
    /// Summary or working-directory I/O failed
    Io(String),
}

impl std::fmt::Display for RepeatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepeatError::Copy(err) => write!(f, "replicate staging failed: {err}"),
            RepeatError::Replicate { index, message } => {
                write!(f, "replicate {index} failed: {message}")
            }
            RepeatError::Io(msg) => write!(f, "replicate I/O failed: {msg}"),
        }
    }
}

impl std::error::Error for RepeatError {}

impl From<CopyError> for RepeatError {
    fn from(err: CopyError) -> Self {
        RepeatError::Copy(err)
    }
}

/// Run replicate trials of one model's recorded experiment
pub struct RepeatedFuelFire {
    source: PathBuf,
    work_dir: PathBuf,
    options: RepeatOptions,
}

impl RepeatedFuelFire {
    /// Replicate the model in `source`; copies are staged under
    /// `source/reps/` and the summary lands in `source/repeat.json`
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let work_dir = source.join("reps");
        Self {
            source,
            work_dir,
            options: RepeatOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RepeatOptions) -> Self {
        self.options = options;
        self
    }

    /// Stage replicate copies somewhere other than `source/reps`
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Path of the batch summary file
    pub fn summary_path(&self) -> PathBuf {
        self.source.join(REPLICATES_FILE)
    }

    /// Run `num_replicates` independent recorded runs of `num_steps` each
    ///
    /// Every replicate starts from a fresh copy of the source model. In the
    /// default mode failures are collected into the returned set; with
    /// `fail_fast` the first failure aborts the batch. The summary is saved
    /// next to the source model on both paths.
    ///
    /// # Errors
    /// `RepeatError::Io` if staging directories cannot be created,
    /// `RepeatError::Replicate` on a fail-fast abort.
    pub fn run(
        &self,
        num_replicates: usize,
        num_steps: usize,
    ) -> Result<ReplicateSet, RepeatError> {
        fs::create_dir_all(&self.work_dir).map_err(|e| RepeatError::Io(e.to_string()))?;
        info!(
            "running {num_replicates} replicates of {num_steps} steps from {}",
            self.source.display()
        );

        let run_one = |index: usize| -> ReplicateOutcome {
            let rep_dir = self.work_dir.join(format!("rep{index:03}"));
            let staging = CopyOptions {
                overwrite: true,
                ..CopyOptions::default()
            };
            if let Err(err) = copy_model(&self.source, &rep_dir, &staging) {
                return ReplicateOutcome::Failed {
                    error: err.to_string(),
                };
            }

            let controller = FuelFire::new(&rep_dir).with_timings(self.options.timings);
            let mut recorder = RecordedFuelFire::with_controller(controller)
                .with_stride(self.options.stride);
            if let Some(seed) = self.options.seed {
                recorder = recorder.with_seed(seed.wrapping_add(index as u64));
            }
            match recorder.run(num_steps) {
                Ok(steps) => ReplicateOutcome::Completed {
                    record: recorder.record_path().to_path_buf(),
                    steps,
                },
                Err(err) => ReplicateOutcome::Failed {
                    error: err.to_string(),
                },
            }
        };

        let mut set = ReplicateSet::default();
        let parallel = self.options.parallelism.max(1) > 1 && !self.options.fail_fast;
        if parallel {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.options.parallelism)
                .build()
                .map_err(|e| RepeatError::Io(e.to_string()))?;
            let outcomes: Vec<(usize, ReplicateOutcome)> = pool.install(|| {
                (0..num_replicates)
                    .into_par_iter()
                    .map(|index| (index, run_one(index)))
                    .collect()
            });
            set.outcomes.extend(outcomes);
        } else {
            for index in 0..num_replicates {
                let outcome = run_one(index);
                let mut abort = None;
                if self.options.fail_fast {
                    if let ReplicateOutcome::Failed { error } = &outcome {
                        abort = Some(error.clone());
                    }
                }
                set.outcomes.insert(index, outcome);
                if let Some(message) = abort {
                    // the summary of what did run is still worth keeping
                    set.save(self.summary_path())?;
                    return Err(RepeatError::Replicate { index, message });
                }
            }
        }

        for (index, outcome) in &set.outcomes {
            if let ReplicateOutcome::Failed { error } = outcome {
                warn!("replicate {index}: {error}");
            }
        }
        info!("{}", set.summary());
        set.save(self.summary_path())?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_missing_source_collects_failures() {
        let dir = temp_dir("repeat_missing_source");
        // no model files at all: every replicate fails at staging
        let runner = RepeatedFuelFire::new(&dir);
        let set = runner.run(3, 5).unwrap();

        assert_eq!(set.outcomes.len(), 3);
        assert_eq!(set.failures(), 3);
        assert_eq!(set.successes(), 0);
        assert_eq!(set.summary(), "3 replicates: 0 completed, 3 failed");

        // the summary was persisted next to the source
        assert!(runner.summary_path().exists());
        let loaded = ReplicateSet::load(runner.summary_path()).unwrap();
        assert_eq!(loaded.failures(), 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fail_fast_aborts_on_first_failure() {
        let dir = temp_dir("repeat_fail_fast");
        let runner = RepeatedFuelFire::new(&dir).with_options(RepeatOptions {
            fail_fast: true,
            ..RepeatOptions::default()
        });

        let err = runner.run(4, 5).unwrap_err();
        assert!(matches!(err, RepeatError::Replicate { index: 0, .. }));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_outcome_set_round_trip() {
        let mut set = ReplicateSet::default();
        set.outcomes.insert(
            0,
            ReplicateOutcome::Completed {
                record: PathBuf::from("rep000/record.jsonl"),
                steps: 10,
            },
        );
        set.outcomes.insert(
            1,
            ReplicateOutcome::Failed {
                error: "simulation failed: process exited".to_string(),
            },
        );

        let path = std::env::temp_dir().join("repeat_set_round_trip.json");
        set.save(&path).unwrap();
        let loaded = ReplicateSet::load(&path).unwrap();

        assert_eq!(loaded.outcomes.len(), 2);
        assert_eq!(loaded.successes(), 1);
        assert_eq!(loaded.failures(), 1);
        assert!(matches!(
            loaded.outcomes[&0],
            ReplicateOutcome::Completed { steps: 10, .. }
        ));

        let _ = fs::remove_file(&path);
    }
}
