//! Process control for one external simulation instance
//!
//! The simulation itself is an external executable owned by a model
//! directory. It advances in discrete steps and reports each completed step
//! by writing a numbered marker file; the controller never parses the
//! program's internals, it only launches the process, watches the marker
//! protocol, and terminates the run.
//!
//! Lifecycle: `Uninitialized → Running → Stopped` (terminal), with
//! `Running → Failed` (terminal) reachable from `step`/`run_for` when the
//! process dies, reports a failure, or stalls past the step timeout.

use crate::mosaic::{Grid, MosaicError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// File names the external program owns inside a model directory
#[derive(Debug, Clone)]
pub struct ModelLayout {
    /// Simulation executable
    pub executable: String,
    /// Namelist configuration file
    pub config: String,
    /// Age mosaic (time since fire per cell)
    pub age_mosaic: String,
    /// Fuel mosaic
    pub fuel_mosaic: String,
    /// Step marker file name prefix (`BURNT<n>OUT.TXT`)
    pub burn_prefix: String,
    /// Step marker file name suffix
    pub burn_suffix: String,
    /// Header lines preceding the grid in a marker file
    pub burn_header_rows: usize,
    /// Stop-request file polled by the external program
    pub stop_request: String,
}

impl Default for ModelLayout {
    fn default() -> Self {
        Self {
            executable: "FUELFIRE.EXE".to_string(),
            config: "FUELFIRE.CFG".to_string(),
            age_mosaic: "AGEPIX.DAT".to_string(),
            fuel_mosaic: "CANOPIX.DAT".to_string(),
            burn_prefix: "BURNT".to_string(),
            burn_suffix: "OUT.TXT".to_string(),
            burn_header_rows: 6,
            stop_request: "FUELFIRE.STOP".to_string(),
        }
    }
}

impl ModelLayout {
    /// Marker file name for a completed step index
    pub fn burn_marker(&self, step: usize) -> String {
        format!("{}{}{}", self.burn_prefix, step, self.burn_suffix)
    }

    fn is_burn_marker(&self, name: &str) -> bool {
        name.strip_prefix(&self.burn_prefix)
            .and_then(|rest| rest.strip_suffix(&self.burn_suffix))
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
    }
}

/// Timing constants for the marker-polling protocol
#[derive(Debug, Clone, Copy)]
pub struct RunTimings {
    /// Pause after spawning before the program accepts work
    pub launch_wait: Duration,
    /// Sleep between marker/exit polls
    pub poll_interval: Duration,
    /// A marker counts once unmodified for this long
    pub quiescence: Duration,
    /// Abort a step that takes longer than this
    pub step_timeout: Duration,
    /// Wait for voluntary exit after a stop request before killing
    pub kill_grace: Duration,
}

impl Default for RunTimings {
    fn default() -> Self {
        Self {
            launch_wait: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            quiescence: Duration::from_secs(2),
            step_timeout: Duration::from_secs(180),
            kill_grace: Duration::from_secs(20),
        }
    }
}

/// Lifecycle state of a controller instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Uninitialized => "uninitialized",
            RunState::Running => "running",
            RunState::Stopped => "stopped",
            RunState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Errors raised by process control
#[derive(Debug)]
pub enum ProcessError {
    /// The executable or a required input file was missing, or spawn failed
    Launch(String),
    /// The process exited unexpectedly or reported an internal failure
    Runtime(String),
    /// A step stalled past the configured timeout
    Timeout(String),
    /// An operation was called in the wrong lifecycle state
    InvalidState {
        operation: &'static str,
        state: RunState,
    },
    /// Filesystem failure outside the marker protocol
    Io(String),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Launch(msg) => write!(f, "launch failed: {msg}"),
            ProcessError::Runtime(msg) => write!(f, "simulation failed: {msg}"),
            ProcessError::Timeout(msg) => write!(f, "simulation timed out: {msg}"),
            ProcessError::InvalidState { operation, state } => {
                write!(f, "cannot {operation} a {state} instance")
            }
            ProcessError::Io(msg) => write!(f, "controller I/O failed: {msg}"),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::Io(err.to_string())
    }
}

/// Controller for one simulation process bound to a model directory
pub struct FuelFire {
    dir: PathBuf,
    layout: ModelLayout,
    timings: RunTimings,
    state: RunState,
    child: Option<Child>,
    steps_completed: usize,
    stop_requested: bool,
}

impl FuelFire {
    /// Bind a controller to a model directory with default layout and timings
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            layout: ModelLayout::default(),
            timings: RunTimings::default(),
            state: RunState::Uninitialized,
            child: None,
            steps_completed: 0,
            stop_requested: false,
        }
    }

    /// Override the model file layout
    pub fn with_layout(mut self, layout: ModelLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Override the protocol timings
    pub fn with_timings(mut self, timings: RunTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn steps_completed(&self) -> usize {
        self.steps_completed
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    /// Path of the configuration file inside the model directory
    pub fn config_path(&self) -> PathBuf {
        self.dir.join(&self.layout.config)
    }

    fn exe_path(&self) -> PathBuf {
        self.dir.join(&self.layout.executable)
    }

    fn age_path(&self) -> PathBuf {
        self.dir.join(&self.layout.age_mosaic)
    }

    fn fuel_path(&self) -> PathBuf {
        self.dir.join(&self.layout.fuel_mosaic)
    }

    fn burn_path(&self, step: usize) -> PathBuf {
        self.dir.join(self.layout.burn_marker(step))
    }

    fn stop_path(&self) -> PathBuf {
        self.dir.join(&self.layout.stop_request)
    }

    /// Launch the simulation process
    ///
    /// # Errors
    /// `InvalidState` unless the instance is fresh; `Launch` if the
    /// executable or a required input file is missing or the spawn fails.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        if self.state != RunState::Uninitialized {
            return Err(ProcessError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        for required in [
            self.exe_path(),
            self.config_path(),
            self.age_path(),
            self.fuel_path(),
        ] {
            if !required.exists() {
                return Err(ProcessError::Launch(format!(
                    "missing required file {}",
                    required.display()
                )));
            }
        }

        // stale markers from a previous run would satisfy step waits
        self.clean_temp_files()?;

        let child = Command::new(self.exe_path())
            .current_dir(&self.dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProcessError::Launch(format!("spawn failed: {e}")))?;
        self.child = Some(child);

        thread::sleep(self.timings.launch_wait);

        if let Some(child) = self.child.as_mut() {
            if let Some(status) = child.try_wait()? {
                self.state = RunState::Failed;
                return Err(ProcessError::Launch(format!(
                    "process exited during launch ({status})"
                )));
            }
        }

        self.state = RunState::Running;
        self.steps_completed = 0;
        self.stop_requested = false;
        info!("started simulation in {}", self.dir.display());
        Ok(())
    }

    /// Advance the simulation by `n` steps, returning each step's burn grid
    ///
    /// Blocks until the external process has produced each step's marker
    /// file. Any failure transitions the instance to `Failed` and kills the
    /// process.
    ///
    /// # Errors
    /// `InvalidState` unless running; `Runtime` if the process exits or a
    /// marker is unreadable; `Timeout` if a step stalls.
    pub fn step(&mut self, n: usize) -> Result<Vec<Grid>, ProcessError> {
        if self.state != RunState::Running {
            return Err(ProcessError::InvalidState {
                operation: "step",
                state: self.state,
            });
        }

        let mut grids = Vec::with_capacity(n);
        for _ in 0..n {
            let marker = self.burn_path(self.steps_completed);
            if let Err(err) = self.wait_for_marker(&marker) {
                self.fail();
                return Err(err);
            }
            let grid = match Grid::load_skipping(&marker, self.layout.burn_header_rows) {
                Ok(grid) => grid,
                Err(err) => {
                    self.fail();
                    return Err(ProcessError::Runtime(format!(
                        "unreadable burn marker {}: {err}",
                        marker.display()
                    )));
                }
            };
            self.steps_completed += 1;
            debug!("completed step {}", self.steps_completed);
            grids.push(grid);
        }
        Ok(grids)
    }

    /// Run forward steps, honoring a pending stop request at step boundaries
    ///
    /// Returns the number of steps actually completed. A stop requested via
    /// [`request_stop`](Self::request_stop) ends the loop early without an
    /// error; the in-flight step is never interrupted.
    ///
    /// # Errors
    /// Propagates the first failing [`step`](Self::step).
    pub fn run_for(&mut self, steps: usize) -> Result<usize, ProcessError> {
        info!("running {steps} steps in {}", self.dir.display());
        for done in 0..steps {
            if self.stop_requested {
                info!("stop requested, halting after {done} steps");
                return Ok(done);
            }
            self.step(1)?;
            if (done + 1) % 20 == 0 {
                info!("completed {} steps", done + 1);
            }
        }
        Ok(steps)
    }

    /// Ask a run loop to halt at the next step boundary
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Run the simulation unwatched for a wall-clock duration
    ///
    /// Spinup-style convenience: start, let the program run freely, stop,
    /// and remove the markers it produced. Only the landscape files it
    /// rewrote are kept.
    ///
    /// # Errors
    /// Propagates `start`/`stop` failures.
    pub fn timed_run(&mut self, duration: Duration) -> Result<(), ProcessError> {
        info!("timed run ({duration:?}) in {}", self.dir.display());
        self.start()?;
        thread::sleep(duration);
        self.stop()?;
        self.clean_temp_files()
    }

    /// Terminate the process and mark the instance inactive
    ///
    /// Writes the stop-request file, waits up to the kill grace period for a
    /// voluntary exit, then kills. Idempotent on already-inactive instances;
    /// a `Failed` instance stays failed.
    ///
    /// # Errors
    /// Returns `Io` if the stop request cannot be written.
    pub fn stop(&mut self) -> Result<(), ProcessError> {
        match self.state {
            RunState::Running => {
                fs::write(self.stop_path(), "stop\n")?;
                let deadline = Instant::now() + self.timings.kill_grace;
                let mut exited = false;
                if let Some(child) = self.child.as_mut() {
                    while Instant::now() < deadline {
                        if child.try_wait()?.is_some() {
                            exited = true;
                            break;
                        }
                        thread::sleep(self.timings.poll_interval);
                    }
                    if !exited {
                        warn!("no voluntary exit within grace period, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                }
                self.child = None;
                self.state = RunState::Stopped;
                info!("stopped after {} steps", self.steps_completed);
                Ok(())
            }
            RunState::Uninitialized | RunState::Stopped => {
                self.state = RunState::Stopped;
                Ok(())
            }
            RunState::Failed => Ok(()),
        }
    }

    /// Remove scratch files created during a run
    ///
    /// Deletes every step marker and any stop-request file. Idempotent and
    /// safe after `stop()` or a failed `start()`.
    ///
    /// # Errors
    /// Returns `Io` if the model directory cannot be scanned.
    pub fn clean_temp_files(&self) -> Result<(), ProcessError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if self.layout.is_burn_marker(name) {
                remove_if_present(&entry.path())?;
            }
        }
        remove_if_present(&self.stop_path())?;
        debug!("cleaned temp files in {}", self.dir.display());
        Ok(())
    }

    /// Load the current age mosaic
    ///
    /// # Errors
    /// Propagates mosaic read failures.
    pub fn load_age(&self) -> Result<Grid, MosaicError> {
        Grid::load(self.age_path())
    }

    /// Load the current fuel mosaic
    ///
    /// # Errors
    /// Propagates mosaic read failures.
    pub fn load_fuel(&self) -> Result<Grid, MosaicError> {
        Grid::load(self.fuel_path())
    }

    /// Overwrite the age mosaic (used when replaying a recorded step)
    ///
    /// # Errors
    /// Propagates mosaic write failures.
    pub fn write_age(&self, grid: &Grid) -> Result<(), MosaicError> {
        grid.save(self.age_path())
    }

    /// Overwrite the fuel mosaic (used when replaying a recorded step)
    ///
    /// # Errors
    /// Propagates mosaic write failures.
    pub fn write_fuel(&self, grid: &Grid) -> Result<(), MosaicError> {
        grid.save(self.fuel_path())
    }

    fn fail(&mut self) {
        self.state = RunState::Failed;
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.child = None;
    }

    fn wait_for_marker(&mut self, marker: &Path) -> Result<(), ProcessError> {
        let deadline = Instant::now() + self.timings.step_timeout;
        loop {
            // the marker check comes first: a process that wrote its final
            // marker and exited cleanly still counts as a completed step
            if marker_quiescent(marker, self.timings.quiescence) {
                return Ok(());
            }
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(ProcessError::Runtime(format!(
                        "process exited while waiting for {} ({status})",
                        marker.display()
                    )));
                }
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::Timeout(format!(
                    "no marker {} within {:?}",
                    marker.display(),
                    self.timings.step_timeout
                )));
            }
            thread::sleep(self.timings.poll_interval);
        }
    }
}

impl Drop for FuelFire {
    fn drop(&mut self) {
        if self.state == RunState::Running {
            if let Some(child) = self.child.as_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), ProcessError> {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    Ok(())
}

// A marker counts once its file exists and has been unmodified past the
// threshold; the external program writes markers in place.
fn marker_quiescent(marker: &Path, quiescence: Duration) -> bool {
    let Ok(metadata) = fs::metadata(marker) else {
        return false;
    };
    let Ok(mtime) = metadata.modified() else {
        // mtime unsupported on this filesystem; existence has to do
        return true;
    };
    SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO)
        >= quiescence
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_model_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_marker_names() {
        let layout = ModelLayout::default();
        assert_eq!(layout.burn_marker(0), "BURNT0OUT.TXT");
        assert_eq!(layout.burn_marker(37), "BURNT37OUT.TXT");
        assert!(layout.is_burn_marker("BURNT12OUT.TXT"));
        assert!(!layout.is_burn_marker("BURNTOUT.TXT"));
        assert!(!layout.is_burn_marker("AGEPIX.DAT"));
    }

    #[test]
    fn test_step_before_start_is_invalid_state() {
        let dir = temp_model_dir("ff_step_uninit");
        let mut ff = FuelFire::new(&dir);

        let err = ff.step(1).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::InvalidState {
                operation: "step",
                state: RunState::Uninitialized
            }
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_step_after_stop_is_invalid_state() {
        let dir = temp_model_dir("ff_step_stopped");
        let mut ff = FuelFire::new(&dir);
        ff.stop().unwrap();
        assert_eq!(ff.state(), RunState::Stopped);

        // never a silent no-op
        let err = ff.step(1).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::InvalidState {
                operation: "step",
                state: RunState::Stopped
            }
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_start_without_executable_fails_launch() {
        let dir = temp_model_dir("ff_missing_exe");
        let mut ff = FuelFire::new(&dir);

        let err = ff.start().unwrap_err();
        assert!(matches!(err, ProcessError::Launch(_)));
        assert_eq!(ff.state(), RunState::Uninitialized);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_clean_temp_files_is_idempotent() {
        let dir = temp_model_dir("ff_clean");
        let ff = FuelFire::new(&dir);

        fs::write(dir.join("BURNT0OUT.TXT"), "x").unwrap();
        fs::write(dir.join("BURNT1OUT.TXT"), "x").unwrap();
        fs::write(dir.join("FUELFIRE.STOP"), "stop").unwrap();
        fs::write(dir.join("AGEPIX.DAT"), "1 2\n3 4\n").unwrap();

        ff.clean_temp_files().unwrap();
        assert!(!dir.join("BURNT0OUT.TXT").exists());
        assert!(!dir.join("BURNT1OUT.TXT").exists());
        assert!(!dir.join("FUELFIRE.STOP").exists());
        // model files are untouched
        assert!(dir.join("AGEPIX.DAT").exists());

        // safe to call again
        ff.clean_temp_files().unwrap();

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_stop_is_idempotent_and_failed_stays_failed() {
        let dir = temp_model_dir("ff_stop_idem");
        let mut ff = FuelFire::new(&dir);

        ff.stop().unwrap();
        ff.stop().unwrap();
        assert_eq!(ff.state(), RunState::Stopped);

        let mut failed = FuelFire::new(&dir);
        failed.fail();
        failed.stop().unwrap();
        assert_eq!(failed.state(), RunState::Failed);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_marker_quiescence_threshold() {
        let dir = temp_model_dir("ff_quiescent");
        let marker = dir.join("BURNT0OUT.TXT");

        assert!(!marker_quiescent(&marker, Duration::ZERO));

        fs::write(&marker, "x").unwrap();
        assert!(marker_quiescent(&marker, Duration::ZERO));
        assert!(!marker_quiescent(&marker, Duration::from_secs(3600)));

        let _ = fs::remove_dir_all(&dir);
    }
}
