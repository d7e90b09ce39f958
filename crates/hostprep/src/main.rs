//! hostprep - prepare a Windows host for containers
//!
//! Terminal front end for the provisioning engine: shows the current step,
//! runs actions with live progress, walks the whole flow, and restarts the
//! host when an install asks for it.

mod display;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Term};
use hostprep::{select_provisioner, Backend, Config, EventChannel, Provisioner, Scenario, StepSummary};
use hostprep_shared::Step;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::display::EventRenderer;

#[derive(Parser)]
#[command(name = "hostprep")]
#[command(about = "Prepare a Windows host for containers (WSL 2 + Docker Desktop)", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: $HOSTPREP_CONFIG or <config dir>/hostprep/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated backend with this scenario
    #[arg(long, global = true, value_enum)]
    simulate: Option<Scenario>,

    /// Debug logging and raw feature tool output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the host and show the current step
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Run one action (default: the one the host currently needs)
    Run {
        /// Action number: 1 = features, 2 = subsystem, 3 = engine
        #[arg(long)]
        step: Option<u32>,

        /// One JSON event envelope per line instead of progress bars
        #[arg(long)]
        json: bool,
    },

    /// Run actions until complete, a failure, or a required restart
    Flow {
        #[arg(long)]
        json: bool,
    },

    /// Restart now and resume at next logon
    Reboot {
        /// Seconds to wait before restarting
        #[arg(long, default_value_t = 10)]
        delay: u64,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    hostprep::logging::init(cli.verbose);

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(scenario) = cli.simulate {
        config.backend = Backend::Simulated;
        config.simulation.scenario = scenario;
    }

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let provisioner = select_provisioner(&config).context("selecting a provisioner")?;
    info!("hostprep v{} ({} backend)", env!("CARGO_PKG_VERSION"), provisioner.name());

    match cli.command {
        Commands::Status { json } => status(provisioner.as_ref(), json).await,
        Commands::Run { step, json } => run(provisioner.as_ref(), step, json, cli.verbose).await,
        Commands::Flow { json } => flow(provisioner.as_ref(), json, cli.verbose).await,
        Commands::Reboot { delay, yes } => reboot(provisioner, delay, yes).await,
        Commands::Config => Ok(()),
    }
}

async fn status(provisioner: &dyn Provisioner, json: bool) -> Result<()> {
    let step = provisioner.probe_current_step().await;
    if json {
        let out = serde_json::json!({
            "backend": provisioner.name(),
            "step": step,
            "ordinal": step.ordinal(),
            "action": step.action_number(),
        });
        println!("{}", out);
        return Ok(());
    }

    println!(
        "Step {}/{}: {}",
        step.ordinal(),
        Step::Complete.ordinal(),
        style(step.title()).bold()
    );
    match step.action_number() {
        Some(action) => println!("Next: hostprep run --step {}", action),
        None => println!("{}", style("Nothing left to do").green()),
    }
    Ok(())
}

async fn run(provisioner: &dyn Provisioner, step: Option<u32>, json: bool, verbose: bool) -> Result<()> {
    let action = match step {
        Some(action) => action,
        None => match provisioner.probe_current_step().await.action_number() {
            Some(action) => action,
            None => {
                println!("{}", style("Host is already provisioned").green());
                return Ok(());
            }
        },
    };

    let channel = provisioner.execute_step(action).await?;
    let summary = consume(channel, json, verbose).await;
    if let Some(error) = summary.errors.first() {
        bail!("step {} failed: {}", action, error);
    }
    if summary.needs_restart && !json {
        println!(
            "{} Restart required: run {}",
            style("!").yellow(),
            style("hostprep reboot").bold()
        );
    }
    Ok(())
}

async fn flow(provisioner: &dyn Provisioner, json: bool, verbose: bool) -> Result<()> {
    let mut step = provisioner.probe_current_step().await;
    while let Some(action) = step.action_number() {
        if !json {
            println!("{} {}", style(format!("[{}/3]", action)).cyan(), step.title());
        }
        let summary = consume(provisioner.execute_step(action).await?, json, verbose).await;
        if let Some(error) = summary.errors.first() {
            bail!("step {} failed: {}", action, error);
        }
        if summary.needs_restart {
            if !json {
                println!("Restart required: run hostprep reboot, then hostprep flow");
            }
            return Ok(());
        }

        let next = provisioner.probe_current_step().await;
        if next == step {
            // Typical for features: enabled, but only active after a restart
            warn!("{} still pending after a successful run", step);
            if !json {
                println!("Restart required to finish this step: run hostprep reboot");
            }
            return Ok(());
        }
        step = next;
    }

    provisioner.clear_resume().await;
    if !json {
        println!("{}", style(Step::Complete.title()).green());
    }
    Ok(())
}

async fn consume(channel: EventChannel, json: bool, verbose: bool) -> StepSummary {
    if json {
        return channel
            .subscribe(|event| match event.to_envelope().to_json() {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("could not serialize {}: {}", event.transport_name(), e),
            })
            .await;
    }

    let mut renderer = EventRenderer::new(verbose);
    let summary = channel.subscribe(|event| renderer.handle(event)).await;
    renderer.finish();
    summary
}

async fn reboot(provisioner: Arc<dyn Provisioner>, delay: u64, yes: bool) -> Result<()> {
    if !yes {
        let term = Term::stderr();
        term.write_str("Restart this computer now? [y/N] ")?;
        let answer = term.read_line().context("reading confirmation")?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Restart cancelled");
            return Ok(());
        }
    }

    if delay > 0 {
        let bar = ProgressBar::new(delay);
        if let Ok(s) = ProgressStyle::with_template("Restarting in {msg}s [{bar:20}]") {
            bar.set_style(s);
        }
        for left in (1..=delay).rev() {
            bar.set_message(left.to_string());
            tokio::time::sleep(Duration::from_secs(1)).await;
            bar.inc(1);
        }
        bar.finish_and_clear();
    }

    provisioner
        .request_immediate_reboot()
        .await
        .context("requesting restart")?;
    Ok(())
}
