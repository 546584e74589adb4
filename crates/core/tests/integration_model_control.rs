//! End-to-end tests driving the controller, recorder, replicate batch, and
//! propagate sequence against a scripted stand-in for the external program.
//!
//! The stand-in honors the real control protocol: it rewrites the mosaics
//! and drops a numbered marker file per step, exits when it finds the
//! stop-request file, and can be told to die after a fixed number of steps.
#![cfg(unix)]

use fuelfire_core::{
    ConfigEdit, ConfigFile, ConfigValue, FuelFire, ProcessError, PropagateOptions, RecordError,
    RecordedFuelFire, RecordedSeries, RepeatOptions, RepeatedFuelFire, ReplicateOutcome,
    RunState, RunTimings, RECORD_FILE, REPLICATES_FILE,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FAKE_SIM: &str = r#"#!/bin/sh
cd "$(dirname "$0")" || exit 1
__FAIL_CASE__
i=0
while [ "$i" -lt __STEPS__ ]; do
  if [ -f FUELFIRE.STOP ]; then
    exit 0
  fi
  sleep 0.4
  v=$((i+1))
  printf '%4d %4d %4d\n%4d %4d %4d\n%4d %4d %4d\n' "$v" "$v" "$v" "$v" "$v" "$v" "$v" "$v" "$v" > AGEPIX.DAT
  w=$((100-v))
  printf '%4d %4d %4d\n%4d %4d %4d\n%4d %4d %4d\n' "$w" "$w" "$w" "$w" "$w" "$w" "$w" "$w" "$w" > CANOPIX.DAT
  printf 'head1\nhead2\nhead3\nhead4\nhead5\nhead6\n   0    1    0\n   1    0    1\n   0    1    0\n' > "BURNT${i}OUT.TXT"
  i=$v
done
if [ __EXIT__ -ne 0 ]; then
  exit __EXIT__
fi
while [ ! -f FUELFIRE.STOP ]; do
  sleep 0.05
done
exit 0
"#;

const SAMPLE_CONFIG: &str = "\
&GETBASIC
  CAPTION = 'integration source'
  NSTEPS = 100
/
&GETFUEL
  IMMATURE_FUEL_FACTOR = 2.5
  MATURE_FUEL_FACTOR = 0.4
/
";

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn fast_timings() -> RunTimings {
    RunTimings {
        launch_wait: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        quiescence: Duration::from_millis(60),
        step_timeout: Duration::from_secs(10),
        kill_grace: Duration::from_secs(5),
    }
}

/// Create a model directory whose executable simulates `steps` steps, then
/// exits with `exit_code` (0 = wait for the stop request instead).
/// `fail_rep` injects an immediate failure when run from that replicate
/// directory.
fn setup_model(name: &str, steps: usize, exit_code: i32, fail_rep: Option<&str>) -> PathBuf {
    let dir = std::env::temp_dir().join(name);
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();

    let fail_case = if let Some(rep) = fail_rep {
        format!("case \"$(basename \"$(pwd)\")\" in {rep}) exit 7 ;; esac")
    } else {
        String::new()
    };
    let script = FAKE_SIM
        .replace("__STEPS__", &steps.to_string())
        .replace("__EXIT__", &exit_code.to_string())
        .replace("__FAIL_CASE__", &fail_case);

    let exe = dir.join("FUELFIRE.EXE");
    fs::write(&exe, script).unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

    fs::write(dir.join("FUELFIRE.CFG"), SAMPLE_CONFIG).unwrap();
    write_zero_mosaics(&dir);
    dir
}

fn write_zero_mosaics(dir: &Path) {
    fs::write(dir.join("AGEPIX.DAT"), "0 0 0\n0 0 0\n0 0 0\n").unwrap();
    fs::write(dir.join("CANOPIX.DAT"), "0 0 0\n0 0 0\n0 0 0\n").unwrap();
}

#[test]
fn test_start_step_stop_lifecycle() {
    init_tracing();
    let dir = setup_model("itc_lifecycle", 100, 0, None);
    let mut ff = FuelFire::new(&dir).with_timings(fast_timings());

    ff.start().unwrap();
    assert_eq!(ff.state(), RunState::Running);

    let grids = ff.step(1).unwrap();
    assert_eq!(grids.len(), 1);
    assert_eq!(grids[0].shape(), (3, 3));
    // burned cells are the non-positive marker values
    assert_eq!(grids[0].le_mask(0).iter().filter(|&&b| b).count(), 5);

    ff.step(2).unwrap();
    assert_eq!(ff.steps_completed(), 3);
    let age = ff.load_age().unwrap();
    assert_eq!(age.get(0, 0), Some(3));

    ff.stop().unwrap();
    assert_eq!(ff.state(), RunState::Stopped);

    // never a silent no-op on an inactive instance
    let err = ff.step(1).unwrap_err();
    assert!(matches!(
        err,
        ProcessError::InvalidState {
            state: RunState::Stopped,
            ..
        }
    ));

    ff.clean_temp_files().unwrap();
    assert!(!dir.join("BURNT0OUT.TXT").exists());
    assert!(!dir.join("FUELFIRE.STOP").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_step_timeout_marks_failed() {
    init_tracing();
    // the stand-in completes two steps, then idles waiting for a stop
    let dir = setup_model("itc_timeout", 2, 0, None);
    let mut timings = fast_timings();
    timings.step_timeout = Duration::from_millis(1500);
    let mut ff = FuelFire::new(&dir).with_timings(timings);

    ff.start().unwrap();
    let err = ff.step(3).unwrap_err();
    assert!(matches!(err, ProcessError::Timeout(_)));
    assert_eq!(ff.state(), RunState::Failed);
    assert_eq!(ff.steps_completed(), 2);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_run_for_honors_stop_request() {
    init_tracing();
    let dir = setup_model("itc_coop_stop", 100, 0, None);
    let mut ff = FuelFire::new(&dir).with_timings(fast_timings());

    ff.start().unwrap();
    ff.step(1).unwrap();
    ff.request_stop();
    // honored at the boundary: no further steps run
    assert_eq!(ff.run_for(50).unwrap(), 0);
    assert_eq!(ff.steps_completed(), 1);
    ff.stop().unwrap();

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_recorded_run_captures_every_step() {
    init_tracing();
    let dir = setup_model("itc_record_ok", 100, 0, None);
    let controller = FuelFire::new(&dir).with_timings(fast_timings());
    let mut recorder = RecordedFuelFire::with_controller(controller).with_seed(7);

    let recorded = recorder.run(5).unwrap();
    assert_eq!(recorded, 5);

    let series = RecordedSeries::load(dir.join(RECORD_FILE)).unwrap();
    assert!(series.complete);
    assert_eq!(series.len(), 5);
    assert_eq!((series.meta.rows, series.meta.cols), (3, 3));
    assert_eq!(series.meta.planned_steps, 5);
    assert!(series.meta.config_text.contains("integration source"));

    // the schedule is a permutation of the planned step indices
    let mut schedule = series.meta.shuffled_steps.clone();
    schedule.sort_unstable();
    assert_eq!(schedule, vec![0, 1, 2, 3, 4]);

    for (i, snapshot) in series.snapshots.iter().enumerate() {
        assert_eq!(snapshot.step, i + 1);
        assert_eq!(snapshot.steps_completed, i + 1);
        assert_eq!(snapshot.age.get(1, 1), Some(i as i32 + 1));
        assert_eq!(snapshot.fuel.get(1, 1), Some(100 - (i as i32 + 1)));
    }

    // temp markers are cleaned on the normal path
    assert!(!dir.join("BURNT0OUT.TXT").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_recorded_run_keeps_partial_data_on_failure() {
    init_tracing();
    // the stand-in dies with a failure code after six steps
    let dir = setup_model("itc_record_fail", 6, 3, None);
    let controller = FuelFire::new(&dir).with_timings(fast_timings());
    let mut recorder = RecordedFuelFire::with_controller(controller);

    let err = recorder.run(10).unwrap_err();
    assert!(matches!(err, RecordError::Process(ProcessError::Runtime(_))));
    assert_eq!(recorder.controller().state(), RunState::Failed);

    // exactly the six completed steps survive, marked incomplete
    let series = RecordedSeries::load(dir.join(RECORD_FILE)).unwrap();
    assert!(!series.complete);
    assert_eq!(series.len(), 6);
    assert_eq!(series.snapshots[5].age.get(2, 2), Some(6));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_replicate_batch_collects_one_failure() {
    init_tracing();
    // rep002's process dies on launch; the other replicates are unaffected
    let dir = setup_model("itc_repeat_partial", 100, 0, Some("rep002"));
    let runner = RepeatedFuelFire::new(&dir).with_options(RepeatOptions {
        parallelism: 2,
        timings: fast_timings(),
        ..RepeatOptions::default()
    });

    let set = runner.run(5, 2).unwrap();
    assert_eq!(set.outcomes.len(), 5);
    assert_eq!(set.successes(), 4);
    assert_eq!(set.failures(), 1);
    assert!(matches!(
        set.outcomes[&2],
        ReplicateOutcome::Failed { .. }
    ));

    // each successful replicate owns its own complete record
    for index in [0usize, 1, 3, 4] {
        match &set.outcomes[&index] {
            ReplicateOutcome::Completed { record, steps } => {
                assert_eq!(*steps, 2);
                let series = RecordedSeries::load(record).unwrap();
                assert!(series.complete);
                assert_eq!(series.len(), 2);
            }
            ReplicateOutcome::Failed { error } => {
                panic!("replicate {index} unexpectedly failed: {error}")
            }
        }
    }

    // summary persisted next to the source model
    assert!(dir.join(REPLICATES_FILE).exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_propagate_full_sequence() {
    init_tracing();
    let src = setup_model("itc_propagate_src", 100, 0, None);
    let dst = std::env::temp_dir().join("itc_propagate_dst");
    let _ = fs::remove_dir_all(&dst);

    let options = PropagateOptions {
        edits: vec![ConfigEdit::new(
            "GETBASIC",
            "NSTEPS",
            ConfigValue::Integer(50),
        )],
        caption: Some("propagated".to_string()),
        spinup_steps: 2,
        record_steps: Some(3),
        repeat: Some((2, 2)),
        repeat_options: RepeatOptions {
            timings: fast_timings(),
            ..RepeatOptions::default()
        },
        timings: fast_timings(),
        seed: Some(11),
        ..PropagateOptions::default()
    };

    let report = fuelfire_core::propagate(&src, &dst, &options).unwrap();
    assert_eq!(report.edits_applied, 1);
    assert_eq!(report.spinup_steps, 2);
    assert_eq!(report.recorded_steps, Some(3));
    let set = report.replicates.as_ref().unwrap();
    assert_eq!(set.successes(), 2);
    assert_eq!(set.failures(), 0);

    // the copy got the edits, the source kept its own config
    let config = ConfigFile::read(dst.join("FUELFIRE.CFG")).unwrap();
    assert_eq!(
        config.get("GETBASIC", "NSTEPS").unwrap(),
        ConfigValue::Integer(50)
    );
    assert_eq!(
        config.get("GETBASIC", "CAPTION").unwrap(),
        ConfigValue::Text("propagated".to_string())
    );
    let source_config = ConfigFile::read(src.join("FUELFIRE.CFG")).unwrap();
    assert_eq!(
        source_config.get("GETBASIC", "CAPTION").unwrap(),
        ConfigValue::Text("integration source".to_string())
    );

    // record and replicate outputs live in the destination
    let series = RecordedSeries::load(dst.join(RECORD_FILE)).unwrap();
    assert!(series.complete);
    assert_eq!(series.len(), 3);
    assert!(dst.join(REPLICATES_FILE).exists());
    let rep_record = dst.join("reps").join("rep000").join(RECORD_FILE);
    assert!(RecordedSeries::load(rep_record).unwrap().complete);

    // spinup and record markers were cleaned everywhere
    assert!(!dst.join("BURNT0OUT.TXT").exists());

    let _ = fs::remove_dir_all(&src);
    let _ = fs::remove_dir_all(&dst);
}

#[test]
fn test_timed_run_discards_markers() {
    init_tracing();
    let dir = setup_model("itc_timed_run", 100, 0, None);
    let mut ff = FuelFire::new(&dir).with_timings(fast_timings());

    ff.timed_run(Duration::from_millis(900)).unwrap();
    assert_eq!(ff.state(), RunState::Stopped);

    // markers are gone, the rewritten landscape stays
    assert!(!dir.join("BURNT0OUT.TXT").exists());
    let age = ff.load_age().unwrap();
    assert!(age.get(0, 0).unwrap() >= 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_restore_recorded_step_into_model() {
    init_tracing();
    let dir = setup_model("itc_restore", 100, 0, None);
    let controller = FuelFire::new(&dir).with_timings(fast_timings());
    let mut recorder = RecordedFuelFire::with_controller(controller);
    recorder.run(4).unwrap();

    let series = RecordedSeries::load(dir.join(RECORD_FILE)).unwrap();
    let ff = FuelFire::new(&dir);
    // roll the landscape back to the second captured step
    series.restore_into(1, &ff).unwrap();
    let age = ff.load_age().unwrap();
    assert_eq!(age.get(0, 0), Some(2));

    let _ = fs::remove_dir_all(&dir);
}
