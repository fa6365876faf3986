// src/main.rs
//
// Thin harness around the gaitctl library.
// Loads a controller config, builds the state machine and drives it at the
// control rate. Only the simulated robot is available in this binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use gaitctl::config::{config_digest, read_file, Chord};
use gaitctl::{build_state_machine, ControlLoop, ControllerConfig, RobotChannel, SimRobot};

/// Command-line arguments for the gaitctl binary.
#[derive(Parser, Debug)]
#[command(name = "gaitctl", version, about = "Legged-robot mode controller")]
struct Cli {
    /// Controller YAML file.
    #[arg(long)]
    config: PathBuf,

    /// Drive a simulated robot instead of hardware.
    #[arg(long)]
    sim: bool,

    /// Seed for the simulated robot's sensor noise.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Stop after this many seconds (default: script length + 5 s).
    #[arg(long)]
    duration_s: Option<f64>,

    /// Comma-separated joystick script for --sim, one step per second:
    /// `passive`, `stand`, `policy:<name>`, `fixed:<name>`, `wait`.
    #[arg(long)]
    script: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG wins if set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Seconds between script steps.
const SCRIPT_STEP_S: f64 = 1.0;

/// One scripted gesture, starting at `at_tick`.
#[derive(Debug, Clone, Copy)]
struct ScriptStep {
    at_tick: u64,
    chord: Option<Chord>,
}

fn parse_script(script: &str, cfg: &ControllerConfig) -> Result<Vec<ScriptStep>> {
    let ticks_per_step = (SCRIPT_STEP_S / cfg.control_dt).round().max(3.0) as u64;
    let mut steps = Vec::new();
    for (i, raw) in script.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
        let chord = match raw.split_once(':') {
            None if raw == "passive" => Some(cfg.safety.stop_chord),
            None if raw == "stand" => Some(cfg.fix_stand.chord),
            None if raw == "wait" => None,
            Some(("policy", name)) => Some(find_policy(cfg, name)?.chord),
            Some(("fixed", name)) => Some(find_policy(cfg, name)?.fixed_command.chord),
            _ => bail!("unknown script step '{raw}'"),
        };
        steps.push(ScriptStep {
            at_tick: (i as u64 + 1) * ticks_per_step,
            chord,
        });
    }
    Ok(steps)
}

fn find_policy<'a>(cfg: &'a ControllerConfig, name: &str) -> Result<&'a gaitctl::config::PolicyStateConfig> {
    cfg.policies
        .iter()
        .find(|p| p.name == name)
        .with_context(|| format!("script refers to unknown policy '{name}'"))
}

/// Hold `held` for one tick, add `trigger` on the next, release on the third.
fn drive_script(sim: &SimRobot, steps: &[ScriptStep], tick: u64) {
    for step in steps {
        let Some(chord) = step.chord else {
            continue;
        };
        match tick.checked_sub(step.at_tick) {
            Some(0) => sim.press(&[chord.held]),
            Some(1) => {
                log::info!("[script] {:?}+{:?}", chord.held, chord.trigger);
                sim.press(&[chord.held, chord.trigger]);
            }
            Some(2) => sim.release_all(),
            _ => {}
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let contents = read_file(&cli.config)?;
    let cfg = ControllerConfig::from_yaml_file(&cli.config)
        .with_context(|| format!("loading controller config {}", cli.config.display()))?;
    log::info!(
        "gaitctl starting: config={} control_dt={}s policies={} sha256={}",
        cli.config.display(),
        cfg.control_dt,
        cfg.policies.len(),
        config_digest(&contents)
    );

    if !cli.sim {
        bail!("no hardware driver is built into this binary; run with --sim");
    }

    let sim = Arc::new(SimRobot::new(cfg.num_motors, cfg.control_dt, cli.seed).with_gyro_noise(0.01));
    let channel: Arc<dyn RobotChannel> = sim.clone();

    let machine = build_state_machine(&cfg, channel).context("building state machine")?;

    let steps = match &cli.script {
        Some(s) => parse_script(s, &cfg)?,
        None => Vec::new(),
    };
    let script_ticks = steps.last().map_or(0, |s| s.at_tick + 3);
    let max_ticks = match cli.duration_s {
        Some(d) if d > 0.0 => (d / cfg.control_dt).round() as u64,
        Some(_) => bail!("--duration-s must be > 0"),
        None => script_ticks + (5.0 / cfg.control_dt).round() as u64,
    };

    let mut control = ControlLoop::new(machine, cfg.control_dt);
    let ticks = control.run(Some(max_ticks), |tick, _| drive_script(&sim, &steps, tick));

    let mut machine = control.into_machine();
    log::info!(
        "gaitctl finished: {} ticks, final mode {} ({}), {} commands published",
        ticks,
        machine.active_name(),
        machine.active_mode(),
        sim.publish_count()
    );
    machine.shutdown();
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    if let Err(err) = run(&cli) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
