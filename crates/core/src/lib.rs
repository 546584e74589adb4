//! FUELFIRE8 Control and Experiment Toolkit
//!
//! Helper utilities around the external FUELFIRE8 coupled fire-vegetation
//! simulation: process control for one simulation instance, editing of its
//! namelist configuration files, recording per-step landscape snapshots to a
//! structured container, replicate experiment batches, and spatial selection
//! of grid cells by bearing and distance.
//!
//! The simulation itself is an external executable; this crate never
//! implements the model, it launches, watches, and records it.

// Model file formats and configuration
pub mod config;
pub mod mosaic;

// Spatial cell selection
pub mod wedge;

// Process control and experiments
pub mod controller;
pub mod propagate;
pub mod record;
pub mod repeat;

// Re-export the toolkit surface
pub use config::{ConfigEdit, ConfigError, ConfigFile, ConfigValue, SetMode};
pub use controller::{FuelFire, ModelLayout, ProcessError, RunState, RunTimings};
pub use mosaic::{Grid, MosaicError};
pub use propagate::{
    copy_model, propagate, CopyError, CopyOptions, PropagateError, PropagateOptions,
    PropagateReport,
};
pub use record::{
    RecordError, RecordMeta, RecordWriter, RecordedFuelFire, RecordedSeries, StepSnapshot,
    StepStream, RECORD_FILE,
};
pub use repeat::{
    RepeatError, RepeatOptions, RepeatedFuelFire, ReplicateOutcome, ReplicateSet,
    REPLICATES_FILE,
};
pub use wedge::{GridCell, GridGeometry, WedgeError, WedgeShape};
