//! Content cache operator entry point.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;

mod config;
mod dispatcher;
mod ingress;
mod logscan;
mod plan;
mod reconciler;
mod snapshot;
mod state;
mod supervisor;
mod template;
mod types;
mod visits;

use config::Config;
use dispatcher::{Dispatcher, Outcome};
use types::{ActionName, Trigger};

#[derive(Debug, Parser)]
#[command(name = "content-cache", version, about = "Operates an nginx content cache")]
struct Cli {
    /// TOML configuration file (defaults to ./content-cache.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dispatch events until interrupted
    Run,
    /// Handle a single lifecycle trigger and print the resulting status
    Reconcile {
        #[arg(long, default_value = "config-changed")]
        trigger: Trigger,
    },
    /// Count requests per client address over the last 20 minutes
    ReportVisitsByIp {
        /// Access log to scan instead of the configured one
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => {
            info!("Starting content cache operator for {}", cfg.unit_name);
            Dispatcher::from_config(cfg).run(cli.config).await?;
        }
        Command::Reconcile { trigger } => {
            if let Trigger::ActionInvoked(action) = trigger {
                anyhow::bail!("{} is an action, use its own subcommand", action.as_str());
            }
            let dispatcher = Dispatcher::from_config(cfg);
            if let Outcome::Reconciled(transition) = dispatcher.dispatch(trigger).await? {
                println!("{}", transition.status);
                if transition.applied {
                    println!("Updated supervisor plan applied");
                }
                if let Some(delay) = transition.retry_after {
                    println!("{} deferred, retry in {}s", trigger, delay.as_secs());
                }
            }
        }
        Command::ReportVisitsByIp { log } => {
            if let Some(log) = log {
                cfg.paths.access_log = log;
            }
            let dispatcher = Dispatcher::from_config(cfg);
            let trigger = Trigger::ActionInvoked(ActionName::ReportVisitsByIp);
            if let Outcome::Report(report) = dispatcher.dispatch(trigger).await? {
                print!("{report}");
            }
        }
    }

    Ok(())
}
