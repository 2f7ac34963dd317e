//! `st-run` - ticks a demo patrol tree headlessly.
//!
//! The agent walks and rests in turns until an `alarm` event arrives, then stays alert for a
//! few ticks before resuming its patrol.

use std::path::PathBuf;
use std::sync::Arc;

use ai_core::{PropertyBag, RunStatus};
use ai_state_tree::{
    Event, EventDesc, ExecutionConfig, ExecutionContext, NodeContext, NodeSpec, StateSpec,
    StateTree, StateTreeBuilder, Task, TransitionInfo, TransitionPriority, TransitionSpec,
};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "st-run")]
#[command(about = "Run a demo state tree", version)]
struct Cli {
    /// Execution config (YAML); defaults are used when the file does not exist
    #[arg(short, long, default_value = "state-tree.yaml")]
    config: PathBuf,

    /// Number of ticks to run
    #[arg(short, long, default_value_t = 20)]
    ticks: u32,

    /// Seed for selection and delay jitter
    #[arg(long)]
    seed: Option<u64>,

    /// Tick at which the alarm event is sent
    #[arg(long, default_value_t = 6)]
    alarm_at: u32,

    /// Seconds per tick
    #[arg(long, default_value_t = 0.1)]
    dt: f32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Succeeds after `ticks` ticks.
struct Timed {
    ticks: i64,
}

impl Task for Timed {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new().with("elapsed", 0i64)
    }

    fn enter_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) -> RunStatus {
        debug!(task = ctx.name(), "enter");
        RunStatus::Running
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        let elapsed = ctx.data().int("elapsed").unwrap_or(0) + 1;
        ctx.data_mut().set_by_name("elapsed", elapsed);
        if elapsed >= self.ticks {
            RunStatus::Succeeded
        } else {
            RunStatus::Running
        }
    }
}

fn timed(name: &'static str, ticks: i64) -> NodeSpec {
    NodeSpec::task(name, Timed { ticks })
}

fn patrol_tree() -> Result<Arc<StateTree>> {
    let tree = StateTreeBuilder::new("patrol")
        .state(
            StateSpec::new("Root").transition(
                TransitionSpec::on_event(EventDesc::tag("alarm"), "Alert")
                    .priority(TransitionPriority::High),
            ),
        )
        .child(
            "Root",
            StateSpec::new("Alert")
                .required_event(EventDesc::tag("alarm"))
                .task(timed("watch", 3))
                .transition(TransitionSpec::on_completed("Patrol")),
        )
        .child("Root", StateSpec::group("Patrol"))
        .child(
            "Patrol",
            StateSpec::new("Walk")
                .task(timed("walk", 4))
                .transition(TransitionSpec::on_succeeded("Rest")),
        )
        .child(
            "Patrol",
            StateSpec::new("Rest")
                .task(timed("rest", 2))
                .transition(TransitionSpec::on_succeeded("Walk")),
        )
        .build()?;
    Ok(tree)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let config = ExecutionConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let tree = patrol_tree().context("Failed to build the patrol tree")?;
    let mut ctx = ExecutionContext::with_config(tree, config);

    let mut status = ctx.start(None, cli.seed);
    info!(?status, states = ?ctx.active_state_names(), "started");

    for tick in 1..=cli.ticks {
        if status != RunStatus::Running {
            break;
        }
        if tick == cli.alarm_at {
            ctx.send_event(Event::new("alarm").with_origin("st-run"));
        }
        status = ctx.tick(cli.dt);
        info!(tick, ?status, states = ?ctx.active_state_names(), "tick");
    }

    if let Some(err) = ctx.last_error() {
        info!(error = %err, "last recorded error");
    }
    let changes = ctx.state_change_count();
    let status = ctx.stop(RunStatus::Stopped);
    info!(?status, changes, "stopped");
    Ok(())
}
