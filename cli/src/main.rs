use clap::{Parser, Subcommand};
use fuelfire_core::{
    wedge, ConfigEdit, ConfigFile, ConfigValue, CopyOptions, GridGeometry, PropagateOptions,
    RecordedFuelFire, RepeatOptions, RepeatedFuelFire, ReplicateOutcome, SetMode, WedgeShape,
};
use nalgebra::Point2;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// FUELFIRE8 model control and experiment toolkit
#[derive(Parser, Debug)]
#[command(name = "fuelfire")]
#[command(about = "Control, record, and replicate FUELFIRE8 simulation runs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Clone a model, edit its config, and run spinup/record/repeat phases
    Propagate {
        /// Source model directory
        source: PathBuf,
        /// Destination model directory
        dest: PathBuf,
        /// Replace the destination if it already exists
        #[arg(long)]
        overwrite: bool,
        /// Also copy a prior record container
        #[arg(long)]
        copy_records: bool,
        /// Also copy a prior replicate summary
        #[arg(long)]
        copy_replicates: bool,
        /// Config edits as GROUP.KEY=VALUE (repeatable)
        #[arg(long = "edit", value_name = "GROUP.KEY=VALUE")]
        edits: Vec<String>,
        /// Caption identifying the created model
        #[arg(long)]
        caption: Option<String>,
        /// Insert unknown config keys instead of failing
        #[arg(long)]
        insert: bool,
        /// Equilibration steps run and discarded before any experiment
        #[arg(long, default_value_t = 0)]
        spinup: usize,
        /// Record phase: capture this many steps
        #[arg(long)]
        record_steps: Option<usize>,
        /// Repeat phase: number of replicates (requires --replicate-steps)
        #[arg(long)]
        replicates: Option<usize>,
        /// Repeat phase: steps per replicate
        #[arg(long)]
        replicate_steps: Option<usize>,
        /// Abort the replicate batch on the first failure
        #[arg(long)]
        fail_fast: bool,
        /// Replicate worker pool width
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        /// Seed for shuffled step schedules
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Record a run of an existing model
    Record {
        /// Model directory
        model: PathBuf,
        /// Snapshots to capture
        steps: usize,
        /// Internal steps per captured snapshot
        #[arg(long, default_value_t = 1)]
        stride: usize,
        /// Seed for the shuffled step schedule
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run replicate trials of a model
    Repeat {
        /// Model directory
        model: PathBuf,
        /// Number of replicates
        replicates: usize,
        /// Steps per replicate
        steps: usize,
        /// Abort on the first failed replicate
        #[arg(long)]
        fail_fast: bool,
        /// Worker pool width (1 = sequential)
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        /// Base seed for per-replicate step schedules
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print grid cells selected by a bearing/distance region
    Wedge {
        /// Grid rows
        #[arg(long, default_value_t = 11)]
        rows: usize,
        /// Grid columns
        #[arg(long, default_value_t = 11)]
        cols: usize,
        /// Cell size in map units
        #[arg(long, default_value_t = 1.0)]
        cell_size: f64,
        /// X coordinate of cell (0,0)'s center
        #[arg(long, default_value_t = 0.0)]
        origin_x: f64,
        /// Y coordinate of cell (0,0)'s center
        #[arg(long, default_value_t = 0.0)]
        origin_y: f64,
        /// X coordinate of the selection center
        #[arg(long)]
        center_x: f64,
        /// Y coordinate of the selection center
        #[arg(long)]
        center_y: f64,
        /// Region shape: circle, ring, wedge, or arc
        #[arg(long)]
        shape: String,
        /// Outer radius (circle, wedge)
        #[arg(long)]
        radius: Option<f64>,
        /// Inner radius (ring, arc)
        #[arg(long)]
        inner: Option<f64>,
        /// Outer radius (ring, arc)
        #[arg(long)]
        outer: Option<f64>,
        /// Start bearing in degrees clockwise from north (wedge, arc)
        #[arg(long)]
        start: Option<f64>,
        /// End bearing in degrees clockwise from north (wedge, arc)
        #[arg(long)]
        end: Option<f64>,
    },
    /// Read or edit a model configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print a parameter value
    Get {
        file: PathBuf,
        group: String,
        key: String,
    },
    /// Replace a parameter value
    Set {
        file: PathBuf,
        group: String,
        key: String,
        value: String,
        /// Insert the key if the file does not contain it
        #[arg(long)]
        insert: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Commands::Propagate {
            source,
            dest,
            overwrite,
            copy_records,
            copy_replicates,
            edits,
            caption,
            insert,
            spinup,
            record_steps,
            replicates,
            replicate_steps,
            fail_fast,
            jobs,
            seed,
        } => {
            let repeat = match (replicates, replicate_steps) {
                (Some(reps), Some(steps)) => Some((reps, steps)),
                (None, None) => None,
                _ => {
                    return Err("--replicates and --replicate-steps go together".into());
                }
            };
            let options = PropagateOptions {
                copy: CopyOptions {
                    overwrite,
                    copy_records,
                    copy_replicates,
                },
                edits: parse_edits(&edits)?,
                caption,
                insert_unknown_keys: insert,
                spinup_steps: spinup,
                record_steps,
                repeat,
                repeat_options: RepeatOptions {
                    fail_fast,
                    parallelism: jobs,
                    seed,
                    ..RepeatOptions::default()
                },
                seed,
                ..PropagateOptions::default()
            };

            let report = fuelfire_core::propagate(&source, &dest, &options)?;
            println!("propagated {} -> {}", source.display(), dest.display());
            if report.edits_applied > 0 {
                println!("  config edits: {}", report.edits_applied);
            }
            if report.spinup_steps > 0 {
                println!("  spinup steps: {}", report.spinup_steps);
            }
            if let Some(steps) = report.recorded_steps {
                println!("  recorded steps: {steps}");
            }
            if let Some(set) = &report.replicates {
                println!("  {}", set.summary());
            }
            Ok(())
        }
        Commands::Record {
            model,
            steps,
            stride,
            seed,
        } => {
            let mut recorder = RecordedFuelFire::new(&model).with_stride(stride);
            if let Some(seed) = seed {
                recorder = recorder.with_seed(seed);
            }
            let recorded = recorder.run(steps)?;
            println!(
                "recorded {recorded} steps to {}",
                recorder.record_path().display()
            );
            Ok(())
        }
        Commands::Repeat {
            model,
            replicates,
            steps,
            fail_fast,
            jobs,
            seed,
        } => {
            let runner = RepeatedFuelFire::new(&model).with_options(RepeatOptions {
                fail_fast,
                parallelism: jobs,
                seed,
                ..RepeatOptions::default()
            });
            let set = runner.run(replicates, steps)?;
            println!("{}", set.summary());
            for (index, outcome) in &set.outcomes {
                match outcome {
                    ReplicateOutcome::Completed { record, steps } => {
                        println!("  rep{index:03}: {steps} steps -> {}", record.display());
                    }
                    ReplicateOutcome::Failed { error } => {
                        println!("  rep{index:03}: FAILED ({error})");
                    }
                }
            }
            Ok(())
        }
        Commands::Wedge {
            rows,
            cols,
            cell_size,
            origin_x,
            origin_y,
            center_x,
            center_y,
            shape,
            radius,
            inner,
            outer,
            start,
            end,
        } => {
            let shape = build_shape(&shape, radius, inner, outer, start, end)?;
            let geometry = GridGeometry::new(
                Point2::new(origin_x, origin_y),
                cell_size,
                rows,
                cols,
            );
            let cells = wedge::select(&geometry, Point2::new(center_x, center_y), &shape)?;
            for cell in cells {
                println!("{},{}", cell.row, cell.col);
            }
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { file, group, key } => {
                let config = ConfigFile::read(&file)?;
                let value = config.get(&group, &key)?;
                println!("{value}");
                Ok(())
            }
            ConfigAction::Set {
                file,
                group,
                key,
                value,
                insert,
            } => {
                let mode = if insert { SetMode::Insert } else { SetMode::Strict };
                let mut config = ConfigFile::read(&file)?.with_mode(mode);
                config.set(&group, &key, &ConfigValue::infer(&value))?;
                config.write(&file)?;
                println!("set &{} {} = {}", group.to_uppercase(), key.to_uppercase(), value);
                Ok(())
            }
        },
    }
}

fn parse_edits(raw: &[String]) -> Result<Vec<ConfigEdit>, Box<dyn Error>> {
    raw.iter()
        .map(|spec| {
            let (target, value) = spec
                .split_once('=')
                .ok_or_else(|| format!("edit '{spec}' is not GROUP.KEY=VALUE"))?;
            let (group, key) = target
                .split_once('.')
                .ok_or_else(|| format!("edit '{spec}' is not GROUP.KEY=VALUE"))?;
            Ok(ConfigEdit::new(group, key, ConfigValue::infer(value)))
        })
        .collect()
}

fn build_shape(
    shape: &str,
    radius: Option<f64>,
    inner: Option<f64>,
    outer: Option<f64>,
    start: Option<f64>,
    end: Option<f64>,
) -> Result<WedgeShape, Box<dyn Error>> {
    let need = |name: &str, value: Option<f64>| -> Result<f64, Box<dyn Error>> {
        value.ok_or_else(|| format!("--{name} is required for shape '{shape}'").into())
    };
    match shape {
        "circle" => Ok(WedgeShape::Circle {
            radius: need("radius", radius)?,
        }),
        "ring" => Ok(WedgeShape::Ring {
            inner: need("inner", inner)?,
            outer: need("outer", outer)?,
        }),
        "wedge" => Ok(WedgeShape::Wedge {
            start: need("start", start)?,
            end: need("end", end)?,
            radius: need("radius", radius)?,
        }),
        "arc" => Ok(WedgeShape::Arc {
            start: need("start", start)?,
            end: need("end", end)?,
            inner: need("inner", inner)?,
            outer: need("outer", outer)?,
        }),
        other => Err(format!("unknown shape '{other}' (circle, ring, wedge, arc)").into()),
    }
}
