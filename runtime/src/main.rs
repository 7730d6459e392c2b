//! Balancebot runtime: fixed-frequency balance loop for a wheeled biped.
//!
//! Without hardware attached, the loop runs against a simulated wheeled
//! pendulum so tuning can be checked on a desk.
//!
//! Usage:
//!   balancebot-runtime --config ~/balancer.json [OPTIONS]

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use balancebot_runtime::config::{BalancerConfig, ControlLaw};
use balancebot_runtime::gamepad::GamepadReference;
use balancebot_runtime::reference::{ConstantReference, Reference};
use balancebot_runtime::spine::PendulumSpine;
use balancebot_runtime::{BalanceLoop, OperatorCommand};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Law {
    Direct,
    Mpc,
    WholeBody,
}

impl From<Law> for ControlLaw {
    fn from(law: Law) -> Self {
        match law {
            Law::Direct => ControlLaw::DirectFeedback,
            Law::Mpc => ControlLaw::ModelPredictive,
            Law::WholeBody => ControlLaw::WholeBody,
        }
    }
}

/// Balancebot: real-time balance control for a two-wheeled robot.
#[derive(Parser, Debug)]
#[command(name = "balancebot-runtime")]
#[command(about = "Balance control loop for a two-wheeled self-balancing robot")]
struct Args {
    /// Path to the balancer configuration JSON file.
    #[arg(long, default_value = "~/balancer.json")]
    config: PathBuf,

    /// Control loop frequency in Hz (overrides the config file).
    #[arg(short = 'c', long)]
    frequency: Option<f64>,

    /// Control law (overrides the config file).
    #[arg(long, value_enum)]
    law: Option<Law>,

    /// Initial pitch of the simulated body in radians.
    #[arg(long, default_value_t = 0.05)]
    initial_pitch: f64,

    /// Constant ground velocity reference in m/s (ignored with --gamepad).
    #[arg(long, default_value_t = 0.0)]
    velocity: f64,

    /// Take references and start/stop/reset from a gamepad.
    #[arg(long, default_value_t = false)]
    gamepad: bool,

    /// Stop after this many seconds. Runs until Ctrl-C if not set.
    #[arg(long)]
    duration: Option<f64>,
}

fn main() -> Result<()> {
    // Initialize structured JSON logging
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = expand_home(&args.config);

    tracing::info!("Balancebot runtime starting");
    tracing::info!("Config: {}", config_path.display());

    let mut config = BalancerConfig::load(&config_path).context("Failed to load balancer config")?;
    if let Some(frequency) = args.frequency {
        config.cycle.frequency = frequency;
    }
    if let Some(law) = args.law {
        config.controller.law = law.into();
    }

    let spine = PendulumSpine::new(&config, args.initial_pitch);
    let mut balance_loop =
        BalanceLoop::new(&config, spine).context("Failed to assemble balance loop")?;

    // The loop owns the gamepad; dropping it stops the polling thread.
    if args.gamepad {
        let (gamepad, commands) = GamepadReference::spawn(50);
        balance_loop = balance_loop.with_reference(gamepad).with_commands(commands);
    } else {
        balance_loop = balance_loop.with_reference(ConstantReference(Reference::velocity(args.velocity)));
        balance_loop.command(OperatorCommand::Start);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let max_cycles = args
        .duration
        .map(|seconds| (seconds * config.cycle.frequency).ceil() as u64);
    let stats = balance_loop.run_for(&shutdown, max_cycles).clone();

    tracing::info!(
        cycles = stats.cycles,
        overruns = stats.overruns,
        fallbacks = stats.fallbacks,
        faults = stats.faults,
        "Mean processing {:.3}ms, max {:.3}ms, overrun ratio {:.4}",
        stats.mean_processing().as_secs_f64() * 1000.0,
        stats.max_processing.as_secs_f64() * 1000.0,
        stats.overrun_ratio()
    );
    tracing::info!(
        "Final mode {}, pitch {:.4} rad, ground position {:.3} m",
        balance_loop.mode(),
        balance_loop.spine().pitch(),
        balance_loop.spine().ground_position()
    );

    Ok(())
}

/// Expand `~` at the start of a path to the user's home directory.
fn expand_home(path: &PathBuf) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(rest) = s.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
    }
    path.clone()
}
