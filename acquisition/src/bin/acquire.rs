//! Acquisition CLI against the simulated output task and a mock camera.
//!
//! Subcommands:
//! - `sequence`: Run a time/position/channel/z sequence and print its summary
//! - `live`: Run live mode for a fixed time and print the loop report
//! - `snap`: Take a single live-channel frame
//! - `dump`: Compose one cycle and write it to CSV

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acquisition::dump::write_csv_file;
use acquisition::{
    AcquisitionController, CycleMode, FrameEvent, SequencePlan, SharedSink, WaveformLibrary,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hardware::SimulatedOutputTask;
use shared::camera_interface::mock::MockCamera;
use shared::settings_storage::{load_from_file, SettingsStorage};
use shared::{trigger_line, Settings, Step};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Mock camera frame size
const FRAME_SIZE: usize = 64;

/// Hardware-synchronized acquisition runner
#[derive(Parser, Debug)]
#[command(name = "acquire")]
#[command(about = "Run sequences and live mode against simulated hardware")]
#[command(version)]
struct Args {
    /// Settings document (defaults to the stored settings)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Override the exposure time in milliseconds
    #[arg(long, global = true)]
    exposure_ms: Option<f64>,

    /// Override the output sample rate in Hz
    #[arg(long, global = true)]
    sample_rate: Option<f64>,

    /// Override the live channel
    #[arg(long, global = true)]
    channel: Option<String>,

    /// Set a channel power as NAME=PERCENT (repeatable)
    #[arg(long = "power", global = true, value_parser = parse_power)]
    powers: Vec<(String, f64)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a sequence
    Sequence {
        /// Sequence plan as JSON; overrides the loop and channel flags
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Number of time points
        #[arg(short, long, default_value = "1")]
        loops: usize,

        /// Channels imaged at every time point
        #[arg(long, value_delimiter = ',', default_value = "488")]
        channels: Vec<String>,

        /// First z offset in µm
        #[arg(long)]
        z_start: Option<f64>,

        /// Last z offset in µm
        #[arg(long, default_value = "0")]
        z_stop: f64,

        /// z spacing in µm
        #[arg(long, default_value = "1")]
        z_step: f64,
    },

    /// Run live mode
    Live {
        /// How long to run in seconds
        #[arg(short, long, default_value = "2.0")]
        duration: f64,
    },

    /// Take one frame on the live channel
    Snap,

    /// Write one composed cycle to CSV
    Dump {
        /// Output file
        #[arg(short, long, default_value = "cycle.csv")]
        output: PathBuf,

        /// Channel of the dumped step
        #[arg(long, default_value = "488")]
        step_channel: String,

        /// Focus offset of the dumped step in µm
        #[arg(long)]
        z: Option<f64>,

        /// Use the live settings block
        #[arg(long)]
        live: bool,
    },
}

fn parse_power(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PERCENT, got '{s}'"))?;
    let value: f64 = value
        .parse()
        .map_err(|e| format!("invalid power '{value}': {e}"))?;
    Ok((name.to_string(), value))
}

fn load_settings(args: &Args) -> Result<Settings> {
    let base = match &args.settings {
        Some(path) => load_from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => SettingsStorage::default()
            .load_or_default()
            .context("Failed to load stored settings")?,
    };

    let settings = base.edited(|file| {
        if let Some(ms) = args.exposure_ms {
            file.exposure_time = ms / 1000.0;
        }
        if let Some(rate) = args.sample_rate {
            file.sample_rate = rate;
        }
        if let Some(channel) = &args.channel {
            file.live.channel = channel.clone();
        }
        for (name, power) in &args.powers {
            file.laser_powers.insert(name.clone(), *power);
            file.live.laser_powers.insert(name.clone(), *power);
        }
    })?;
    Ok(settings)
}

fn build_controller(
    settings: Settings,
    sink: SharedSink,
) -> Result<AcquisitionController<SimulatedOutputTask, MockCamera>> {
    let (trigger_tx, trigger_rx) = trigger_line();
    let task = SimulatedOutputTask::new().with_trigger(trigger_tx);
    let camera = MockCamera::new(FRAME_SIZE, FRAME_SIZE).with_trigger(trigger_rx);
    Ok(AcquisitionController::new(task, camera, settings, sink)?)
}

fn run_with_controller<F>(settings: Settings, body: F) -> Result<()>
where
    F: FnOnce(&mut AcquisitionController<SimulatedOutputTask, MockCamera>) -> Result<()>,
{
    let (tx, rx) = crossbeam_channel::unbounded::<FrameEvent>();
    let consumer = thread::spawn(move || {
        let mut frames = 0usize;
        for event in rx {
            frames += 1;
            debug!(
                kind = %event.kind,
                step = event.step.index,
                channel = %event.step.channel,
                "Frame {}x{} after {:?}",
                event.frame.image.nrows(),
                event.frame.image.ncols(),
                event.timing.camera_time()
            );
        }
        frames
    });

    let mut controller = build_controller(settings, Arc::new(tx))?;
    let result = body(&mut controller);
    drop(controller);

    let frames = consumer.join().unwrap_or(0);
    info!("{frames} frames received");
    result
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = load_settings(&args)?;
    let counts = settings.counts();
    info!(
        "{} Hz, {} exposure + {} readout samples",
        settings.sample_rate(),
        counts.exposure_points(),
        counts.readout_points()
    );

    match args.command {
        Command::Sequence {
            plan,
            loops,
            channels,
            z_start,
            z_stop,
            z_step,
        } => {
            let plan = match plan {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read plan {}", path.display()))?;
                    serde_json::from_str::<SequencePlan>(&text)
                        .with_context(|| format!("Invalid plan {}", path.display()))?
                }
                None => {
                    let plan = SequencePlan::new(channels).with_loops(loops);
                    match z_start {
                        Some(start) => plan.with_z_range(start, z_stop, z_step),
                        None => plan,
                    }
                }
            };
            info!("Running {} steps", plan.len());

            run_with_controller(settings, |controller| {
                let summary = controller.run_sequence(plan.steps())?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(())
            })
        }

        Command::Live { duration } => run_with_controller(settings, |controller| {
            controller.start_live()?;
            thread::sleep(Duration::from_secs_f64(duration.max(0.0)));
            if let Some(report) = controller.stop_live() {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Ok(())
        }),

        Command::Snap => run_with_controller(settings, |controller| {
            let report = controller.snap()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }),

        Command::Dump {
            output,
            step_channel,
            z,
            live,
        } => {
            let mut step = Step::new(0, step_channel);
            step.z = z;
            let mode = if live {
                CycleMode::Live
            } else {
                CycleMode::Sequenced
            };
            let waveform =
                WaveformLibrary::new().compose_step(&settings, mode, &step, None)?;
            write_csv_file(&waveform, settings.sample_rate(), &output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(
                "Wrote {} samples ({mode}) to {}",
                waveform.columns(),
                output.display()
            );
            Ok(())
        }
    }
}
