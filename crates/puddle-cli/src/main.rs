//! puddle: command-line driver for the robot
//!
//! Loads the robot topology (writing defaults on first run), warms the buses
//! up, then runs one of the commands below at a fixed rate until it finishes
//! or Ctrl-C arrives. Every exit path brakes all motors before the serial
//! ports close.
//!
//! Usage:
//!   puddle [--config robot.json] [-v [general|move|motor|pos]]... [-f] [--simulate] <command>

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use tracing::{info, warn};

use puddle_core::config::CONFIG_FILE;
use puddle_core::sim::SimulatedMotors;
use puddle_core::{
    Bus, ChecksumVersion, Clock, ControlLoop, ControlLoopConfig, MonotonicClock, Player, Recorder,
    Robot, RobotConfig, Side, Trace, Trajectory, Verbosity,
};

#[derive(Parser, Debug)]
#[command(name = "puddle")]
#[command(about = "Drive the legs of a puddle robot")]
struct Cli {
    /// Robot topology file; created with defaults if missing.
    #[arg(long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Diagnostic trace: general, move, motor or pos. Repeatable.
    #[arg(
        short = 'v',
        long = "verbose",
        value_name = "TRACE",
        num_args = 0..=1,
        default_missing_value = "general"
    )]
    verbose: Vec<Trace>,

    /// Carry on when motors do not answer at start-up, ignoring them.
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Run against simulated motors instead of serial adapters.
    #[arg(long)]
    simulate: bool,

    /// Control loop rate in Hz.
    #[arg(long, default_value_t = 100.0)]
    rate: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stiffen both legs where they are and hold.
    Stand {
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<f64>,
    },
    /// Move the joints by hand through their travel; Ctrl-C saves the ranges.
    Calibrate,
    /// Record a relaxed leg being moved by hand until Ctrl-C.
    Record {
        #[arg(long, default_value = "trajectory.json")]
        out: PathBuf,
        #[arg(long, default_value = "left")]
        leg: Side,
        /// Also print the samples to stdout.
        #[arg(long)]
        dump: bool,
    },
    /// Replay a recorded trajectory on a leg.
    Play {
        path: PathBuf,
        /// Defaults to the leg the trajectory was recorded on.
        #[arg(long)]
        leg: Option<Side>,
    },
    /// Reassign a motor's bus id (15 addresses every motor on the bus).
    ChangeId {
        port: String,
        old: u8,
        new: u8,
        #[arg(long, default_value_t = 1)]
        version: u8,
    },
}

/// Everything a robot command needs while it runs
struct Session {
    robot: Robot,
    config: RobotConfig,
    config_path: PathBuf,
    clock: Arc<dyn Clock>,
    verbosity: Verbosity,
    loop_config: ControlLoopConfig,
    stop: Receiver<()>,
}

struct Options {
    config_path: PathBuf,
    verbosity: Verbosity,
    force: bool,
    simulate: bool,
    rate: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Cli {
        config,
        verbose,
        force,
        simulate,
        rate,
        command,
    } = Cli::parse();
    let options = Options {
        config_path: config,
        verbosity: verbose.into_iter().collect(),
        force,
        simulate,
        rate,
    };

    match command {
        Command::ChangeId { port, old, new, version } => {
            change_id(&port, old, new, version, options.simulate, options.verbosity)
        }
        Command::Stand { seconds } => with_session(&options, |s| stand(s, seconds)),
        Command::Calibrate => with_session(&options, calibrate),
        Command::Record { out, leg, dump } => with_session(&options, |s| record(s, leg, &out, dump)),
        Command::Play { path, leg } => with_session(&options, |s| play(s, &path, leg)),
    }
}

/// Bring the robot up, run `task`, then brake and release the buses
fn with_session<F>(options: &Options, task: F) -> Result<()>
where
    F: FnOnce(&mut Session) -> Result<()>,
{
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("failed to install Ctrl-C handler")?;

    let config = RobotConfig::load_or_init(&options.config_path)
        .with_context(|| format!("failed to load {}", options.config_path.display()))?;
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let robot = build_robot(&config, clock.clone(), options.verbosity, options.simulate)?;

    let mut session = Session {
        robot,
        config,
        config_path: options.config_path.clone(),
        clock,
        verbosity: options.verbosity,
        loop_config: ControlLoopConfig::new(options.rate).with_name("puddle"),
        stop: stop_rx,
    };

    let result = session
        .robot
        .init(options.force)
        .context("motors missing; rerun with -f to continue without them")
        .and_then(|()| {
            if !session.robot.check_ranges() {
                warn!("some joints have no range or no readings; run `puddle calibrate` before moving them");
            }
            task(&mut session)
        });

    session.robot.shutdown();
    result
}

fn build_robot(
    config: &RobotConfig,
    clock: Arc<dyn Clock>,
    verbosity: Verbosity,
    simulate: bool,
) -> Result<Robot> {
    if !simulate {
        return Ok(Robot::open(config, clock, verbosity)?);
    }
    let sims = config
        .bus
        .iter()
        .map(|bus| SimulatedMotors::for_bus(config, bus).map(|sim| (bus.name.clone(), sim)))
        .collect::<puddle_core::Result<Vec<_>>>()?;
    info!("simulating {} bus(es)", sims.len());
    let robot = Robot::with_links(config, clock, verbosity, |cfg| {
        sims.iter()
            .find(|(name, _)| *name == cfg.name)
            .map(|(_, sim)| sim.link())
    })?;
    Ok(robot)
}

fn stand(s: &mut Session, seconds: Option<f64>) -> Result<()> {
    let robot = &mut s.robot;
    robot.stand();
    let start = Instant::now();
    let stats = ControlLoop::run_until(s.loop_config.clone(), &s.stop, |_, _| {
        robot.update();
        seconds.map_or(true, |limit| start.elapsed().as_secs_f64() < limit)
    })?;
    info!("stood for {} cycles ({} overruns)", stats.iterations, stats.overruns);
    Ok(())
}

fn calibrate(s: &mut Session) -> Result<()> {
    info!("move every joint through its full travel, then press Ctrl-C");
    let robot = &mut s.robot;
    robot.relax();
    ControlLoop::run_until(s.loop_config.clone(), &s.stop, |_, _| {
        robot.update();
        true
    })?;

    robot.update_joint_ranges(&mut s.config);
    s.config
        .save(&s.config_path)
        .with_context(|| format!("failed to save {}", s.config_path.display()))?;
    info!("ranges written to {}", s.config_path.display());
    if !robot.check_ranges() {
        warn!("some joints still have no usable range");
    }
    Ok(())
}

fn record(s: &mut Session, side: Side, out: &Path, dump: bool) -> Result<()> {
    let robot = &mut s.robot;
    robot.relax();
    robot.update();
    let mut recorder = Recorder::new(s.clock.clone(), s.verbosity);
    recorder.start(robot.leg(side));
    info!("recording {} leg, press Ctrl-C to stop", side);

    ControlLoop::run_until(s.loop_config.clone(), &s.stop, |_, _| {
        robot.update();
        recorder.update(robot.leg(side));
        true
    })?;
    recorder.stop();

    if dump {
        recorder.dump(&mut std::io::stdout().lock())?;
    }
    let trajectory = recorder.trajectory().with_leg(side.name());
    trajectory
        .save(out)
        .with_context(|| format!("failed to save {}", out.display()))?;
    info!(
        "saved {} samples ({} ms) to {}",
        trajectory.len(),
        trajectory.duration_ms(),
        out.display()
    );
    Ok(())
}

fn play(s: &mut Session, path: &Path, side: Option<Side>) -> Result<()> {
    let trajectory = Trajectory::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    if trajectory.is_empty() {
        bail!("{} holds no samples", path.display());
    }
    let side = match (side, trajectory.leg.as_deref()) {
        (Some(side), _) => side,
        (None, Some(leg)) => leg.parse()?,
        (None, None) => Side::Left,
    };

    let robot = &mut s.robot;
    let mut player = Player::new(s.clock.clone(), s.verbosity);
    player.load(&trajectory);
    player.start(robot.leg_mut(side))?;
    info!("playing {} samples on {} leg", trajectory.len(), side);

    let mut failure = None;
    ControlLoop::run_until(s.loop_config.clone(), &s.stop, |_, _| {
        robot.update();
        if !player.is_playing() {
            return false;
        }
        if let Err(e) = player.update(robot.leg_mut(side)) {
            failure = Some(e);
            return false;
        }
        true
    })?;

    if player.is_playing() {
        player.stop(robot.leg_mut(side));
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn change_id(
    port: &str,
    old: u8,
    new: u8,
    version: u8,
    simulate: bool,
    verbosity: Verbosity,
) -> Result<()> {
    let version = ChecksumVersion::try_from(version)?;
    let mut bus = if simulate {
        let motors = SimulatedMotors::new(version, &[old]);
        Bus::new("provision", port, version, Some(motors.link()), verbosity)
    } else {
        Bus::open("provision", port, version, verbosity)
    };
    if !bus.is_enabled() {
        bail!("cannot open {}", port);
    }
    bus.change_motor_id(old, new)
        .with_context(|| format!("failed to change motor id {} to {}", old, new))?;
    info!("motor {} is now {}", old, new);
    bus.close();
    Ok(())
}
