//! Create and run a derived experiment from an existing model
//!
//! `propagate` is the orchestration entry point: clone a model directory,
//! optionally apply configuration edits, optionally equilibrate the copy
//! with a spinup run (discarded except for its final state), then
//! optionally dispatch the record or repeat procedure against the prepared
//! model. It sequences the other components and validates options; it has
//! no algorithm of its own.

use crate::config::{ConfigEdit, ConfigError, ConfigFile, SetMode};
use crate::controller::{FuelFire, ModelLayout, ProcessError, RunTimings};
use crate::record::{RecordError, RecordedFuelFire, RECORD_FILE};
use crate::repeat::{
    RepeatError, RepeatOptions, RepeatedFuelFire, ReplicateSet, REPLICATES_FILE,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// What a model copy carries besides the required files
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Replace an existing destination instead of failing
    pub overwrite: bool,
    /// Also copy a prior record container
    pub copy_records: bool,
    /// Also copy a prior replicate summary
    pub copy_replicates: bool,
}

/// Errors raised while cloning a model directory
#[derive(Debug)]
pub enum CopyError {
    /// Destination exists and overwrite was not requested
    DestinationExists(PathBuf),
    /// A required source file is missing
    MissingSource(PathBuf),
    /// Filesystem failure during the copy
    Io(String),
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::DestinationExists(path) => {
                write!(f, "destination {} already exists", path.display())
            }
            CopyError::MissingSource(path) => {
                write!(f, "required model file {} is missing", path.display())
            }
            CopyError::Io(msg) => write!(f, "model copy failed: {msg}"),
        }
    }
}

impl std::error::Error for CopyError {}

impl From<std::io::Error> for CopyError {
    fn from(err: std::io::Error) -> Self {
        CopyError::Io(err.to_string())
    }
}

/// Copy a model's files from `src` to `dst`, preserving relative layout
///
/// The executable, configuration, and both mosaics are required; prior run
/// outputs are copied only when the options ask for them. An existing
/// destination without `overwrite` fails and is left untouched.
///
/// # Errors
/// See [`CopyError`].
pub fn copy_model(src: &Path, dst: &Path, options: &CopyOptions) -> Result<(), CopyError> {
    let layout = ModelLayout::default();

    if dst.exists() {
        if !options.overwrite {
            return Err(CopyError::DestinationExists(dst.to_path_buf()));
        }
        fs::remove_dir_all(dst)?;
    }
    fs::create_dir_all(dst)?;

    for name in [
        &layout.executable,
        &layout.config,
        &layout.age_mosaic,
        &layout.fuel_mosaic,
    ] {
        let from = src.join(name);
        if !from.exists() {
            return Err(CopyError::MissingSource(from));
        }
        fs::copy(&from, dst.join(name))?;
    }

    for (wanted, name) in [
        (options.copy_records, RECORD_FILE),
        (options.copy_replicates, REPLICATES_FILE),
    ] {
        let from = src.join(name);
        if wanted && from.exists() {
            fs::copy(&from, dst.join(name))?;
        }
    }

    info!("copied model {} -> {}", src.display(), dst.display());
    Ok(())
}

/// Everything `propagate` may do after the copy
#[derive(Debug, Clone, Default)]
pub struct PropagateOptions {
    pub copy: CopyOptions,
    /// Configuration edits applied to the copy
    pub edits: Vec<ConfigEdit>,
    /// Caption identifying the created model
    pub caption: Option<String>,
    /// Insert unknown config keys instead of failing
    pub insert_unknown_keys: bool,
    /// Equilibration steps run and discarded before any experiment
    pub spinup_steps: usize,
    /// Record phase: capture this many steps
    pub record_steps: Option<usize>,
    /// Repeat phase: (replicates, steps per replicate)
    pub repeat: Option<(usize, usize)>,
    /// Tunables for the repeat phase
    pub repeat_options: RepeatOptions,
    /// Protocol timings for the spinup and record phases
    pub timings: RunTimings,
    /// Seed for the record phase's step schedule
    pub seed: Option<u64>,
}

/// What `propagate` actually did
#[derive(Debug, Clone)]
pub struct PropagateReport {
    pub destination: PathBuf,
    pub edits_applied: usize,
    pub spinup_steps: usize,
    pub recorded_steps: Option<usize>,
    pub replicates: Option<ReplicateSet>,
}

/// Errors raised by the propagate sequence
#[derive(Debug)]
pub enum PropagateError {
    /// Options describe no valid experiment
    InvalidOptions(String),
    Copy(CopyError),
    Config(ConfigError),
    Process(ProcessError),
    Record(RecordError),
    Repeat(RepeatError),
}

impl std::fmt::Display for PropagateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropagateError::InvalidOptions(msg) => write!(f, "invalid options: {msg}"),
            PropagateError::Copy(err) => write!(f, "{err}"),
            PropagateError::Config(err) => write!(f, "{err}"),
            PropagateError::Process(err) => write!(f, "{err}"),
            PropagateError::Record(err) => write!(f, "{err}"),
            PropagateError::Repeat(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PropagateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PropagateError::InvalidOptions(_) => None,
            PropagateError::Copy(err) => Some(err),
            PropagateError::Config(err) => Some(err),
            PropagateError::Process(err) => Some(err),
            PropagateError::Record(err) => Some(err),
            PropagateError::Repeat(err) => Some(err),
        }
    }
}

impl From<CopyError> for PropagateError {
    fn from(err: CopyError) -> Self {
        PropagateError::Copy(err)
    }
}

impl From<ConfigError> for PropagateError {
    fn from(err: ConfigError) -> Self {
        PropagateError::Config(err)
    }
}

impl From<ProcessError> for PropagateError {
    fn from(err: ProcessError) -> Self {
        PropagateError::Process(err)
    }
}

impl From<RecordError> for PropagateError {
    fn from(err: RecordError) -> Self {
        PropagateError::Record(err)
    }
}

impl From<RepeatError> for PropagateError {
    fn from(err: RepeatError) -> Self {
        PropagateError::Repeat(err)
    }
}

fn validate(options: &PropagateOptions) -> Result<(), PropagateError> {
    if options.record_steps == Some(0) {
        return Err(PropagateError::InvalidOptions(
            "record phase with zero steps".to_string(),
        ));
    }
    if let Some((replicates, steps)) = options.repeat {
        if replicates == 0 || steps == 0 {
            return Err(PropagateError::InvalidOptions(format!(
                "repeat phase needs positive counts, got {replicates} replicates x {steps} steps"
            )));
        }
    }
    Ok(())
}

/// Clone `source` to `dest` and run the requested preparation and phases
///
/// Phases run in a fixed order: copy, config edits, spinup, record, repeat;
/// each is skipped when its option is unset. Options are validated before
/// any filesystem mutation.
///
/// # Errors
/// See [`PropagateError`]; the first failing phase aborts the sequence.
pub fn propagate(
    source: &Path,
    dest: &Path,
    options: &PropagateOptions,
) -> Result<PropagateReport, PropagateError> {
    validate(options)?;

    copy_model(source, dest, &options.copy)?;

    let mut edits_applied = 0;
    if !options.edits.is_empty() || options.caption.is_some() {
        let config_path = dest.join(&ModelLayout::default().config);
        let mode = if options.insert_unknown_keys {
            SetMode::Insert
        } else {
            SetMode::Strict
        };
        let mut config = ConfigFile::read(&config_path)?.with_mode(mode);
        config.apply_edits(&options.edits, options.caption.as_deref())?;
        config.write(&config_path)?;
        edits_applied = options.edits.len();
        info!("applied {edits_applied} config edits to {}", dest.display());
    }

    if options.spinup_steps > 0 {
        info!("spinup: {} steps", options.spinup_steps);
        let mut ff = FuelFire::new(dest).with_timings(options.timings);
        ff.start()?;
        let run = ff.run_for(options.spinup_steps);
        let stop = ff.stop();
        let clean = ff.clean_temp_files();
        run?;
        stop?;
        clean?;
    }

    let mut recorded_steps = None;
    if let Some(steps) = options.record_steps {
        let controller = FuelFire::new(dest).with_timings(options.timings);
        let mut recorder = RecordedFuelFire::with_controller(controller);
        if let Some(seed) = options.seed {
            recorder = recorder.with_seed(seed);
        }
        recorded_steps = Some(recorder.run(steps)?);
    }

    let mut replicates = None;
    if let Some((reps, steps)) = options.repeat {
        let runner = RepeatedFuelFire::new(dest).with_options(options.repeat_options);
        replicates = Some(runner.run(reps, steps)?);
    }

    Ok(PropagateReport {
        destination: dest.to_path_buf(),
        edits_applied,
        spinup_steps: options.spinup_steps,
        recorded_steps,
        replicates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigValue;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_model(dir: &Path) {
        let layout = ModelLayout::default();
        fs::write(dir.join(&layout.executable), "#!/bin/sh\nexit 0\n").unwrap();
        fs::write(
            dir.join(&layout.config),
            "&GETBASIC\n  CAPTION = 'source'\n  NSTEPS = 10\n/\n",
        )
        .unwrap();
        fs::write(dir.join(&layout.age_mosaic), "1 2\n3 4\n").unwrap();
        fs::write(dir.join(&layout.fuel_mosaic), "5 6\n7 8\n").unwrap();
    }

    #[test]
    fn test_copy_refuses_existing_destination() {
        let src = temp_dir("prop_copy_src");
        write_model(&src);
        let dst = temp_dir("prop_copy_dst");
        fs::write(dst.join("sentinel.txt"), "keep me").unwrap();

        let err = copy_model(&src, &dst, &CopyOptions::default()).unwrap_err();
        assert!(matches!(err, CopyError::DestinationExists(_)));
        // destination untouched
        assert_eq!(
            fs::read_to_string(dst.join("sentinel.txt")).unwrap(),
            "keep me"
        );

        let _ = fs::remove_dir_all(&src);
        let _ = fs::remove_dir_all(&dst);
    }

    #[test]
    fn test_copy_requires_model_files() {
        let src = temp_dir("prop_copy_empty_src");
        let dst = std::env::temp_dir().join("prop_copy_empty_dst");
        let _ = fs::remove_dir_all(&dst);

        let err = copy_model(&src, &dst, &CopyOptions::default()).unwrap_err();
        assert!(matches!(err, CopyError::MissingSource(_)));

        let _ = fs::remove_dir_all(&src);
        let _ = fs::remove_dir_all(&dst);
    }

    #[test]
    fn test_copy_excludes_outputs_by_default() {
        let src = temp_dir("prop_copy_outputs_src");
        write_model(&src);
        fs::write(src.join(RECORD_FILE), "{}").unwrap();
        fs::write(src.join(REPLICATES_FILE), "{}").unwrap();

        let dst = std::env::temp_dir().join("prop_copy_outputs_dst");
        let _ = fs::remove_dir_all(&dst);
        copy_model(&src, &dst, &CopyOptions::default()).unwrap();

        assert!(dst.join("FUELFIRE.CFG").exists());
        assert!(!dst.join(RECORD_FILE).exists());
        assert!(!dst.join(REPLICATES_FILE).exists());

        // requested explicitly, outputs come along
        let with_outputs = CopyOptions {
            overwrite: true,
            copy_records: true,
            copy_replicates: true,
        };
        copy_model(&src, &dst, &with_outputs).unwrap();
        assert!(dst.join(RECORD_FILE).exists());
        assert!(dst.join(REPLICATES_FILE).exists());

        let _ = fs::remove_dir_all(&src);
        let _ = fs::remove_dir_all(&dst);
    }

    #[test]
    fn test_propagate_applies_edits() {
        let src = temp_dir("prop_edit_src");
        write_model(&src);
        let dst = std::env::temp_dir().join("prop_edit_dst");
        let _ = fs::remove_dir_all(&dst);

        let options = PropagateOptions {
            edits: vec![ConfigEdit::new(
                "GETBASIC",
                "NSTEPS",
                ConfigValue::Integer(500),
            )],
            caption: Some("derived model".to_string()),
            ..PropagateOptions::default()
        };
        let report = propagate(&src, &dst, &options).unwrap();
        assert_eq!(report.edits_applied, 1);
        assert_eq!(report.recorded_steps, None);

        let config = ConfigFile::read(dst.join("FUELFIRE.CFG")).unwrap();
        assert_eq!(
            config.get("GETBASIC", "NSTEPS").unwrap(),
            ConfigValue::Integer(500)
        );
        assert_eq!(
            config.get("GETBASIC", "CAPTION").unwrap(),
            ConfigValue::Text("derived model".to_string())
        );
        // the source is untouched
        let source_config = ConfigFile::read(src.join("FUELFIRE.CFG")).unwrap();
        assert_eq!(
            source_config.get("GETBASIC", "NSTEPS").unwrap(),
            ConfigValue::Integer(10)
        );

        let _ = fs::remove_dir_all(&src);
        let _ = fs::remove_dir_all(&dst);
    }

    #[test]
    fn test_option_validation_before_any_mutation() {
        let src = temp_dir("prop_validate_src");
        write_model(&src);
        let dst = std::env::temp_dir().join("prop_validate_dst");
        let _ = fs::remove_dir_all(&dst);

        let zero_record = PropagateOptions {
            record_steps: Some(0),
            ..PropagateOptions::default()
        };
        assert!(matches!(
            propagate(&src, &dst, &zero_record).unwrap_err(),
            PropagateError::InvalidOptions(_)
        ));
        assert!(!dst.exists(), "no copy happens for invalid options");

        let zero_reps = PropagateOptions {
            repeat: Some((0, 5)),
            ..PropagateOptions::default()
        };
        assert!(matches!(
            propagate(&src, &dst, &zero_reps).unwrap_err(),
            PropagateError::InvalidOptions(_)
        ));

        let _ = fs::remove_dir_all(&src);
    }
}
