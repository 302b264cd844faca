//! Multi-service lifecycle orchestrator.
//!
//! Brings the services declared in a topology file up and down against a container runtime, in dependency order.

#![deny(warnings)]
#![deny(missing_docs)]
use std::sync::Arc;

use clap::Parser as _;
use stevedore_app::prelude::*;
use stevedore_core::{
    options::OptionSet,
    orchestrator::{Orchestrator, OrchestratorError, Progress},
    runtime::{ExecRequest, InMemoryRuntime, RuntimeAdapter},
    topology::TopologySource,
};
use stevedore_error::{single_line_chain, ErrorContext as _, GenericError};
use tracing::{error, info, warn};

mod cli;
use self::cli::{Action, Cli};

mod config;
use self::config::RunnerConfiguration;

mod docker;
use self::docker::DockerRuntime;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(cli).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("{}", single_line_chain(&e));
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, GenericError> {
    let base_dir = std::env::current_dir().error_context("Failed to determine the current directory.")?;
    let config = RunnerConfiguration::load(cli.config.as_deref())?;
    let project = config.project_name(cli.project.as_deref(), &base_dir);

    let base_options = cli.base_options()?;
    let source = TopologySource::from_options(&base_options, &base_dir);
    let topology = Arc::new(
        source
            .load()
            .with_error_context(|| format!("Failed to load topology from '{}'.", source.path().display()))?,
    );
    info!(project, services = topology.len(), "Loaded topology.");

    let simulated = cli.dry_run.then(|| Arc::new(InMemoryRuntime::new()));
    let runtime: Arc<dyn RuntimeAdapter> = match &simulated {
        Some(runtime) => runtime.clone(),
        None => Arc::new(DockerRuntime::connect(project, &topology)?),
    };
    let orchestrator = Orchestrator::new(topology.clone(), runtime, config.orchestrator_config());

    let exit_code = match cli.action {
        Action::Up(up) => {
            let options = up.options(base_options)?;
            let result = match &up.service {
                Some(service) => {
                    let scale = match up.scale {
                        Some(scale) => scale,
                        None => default_scale(&orchestrator, service, &options),
                    };
                    orchestrator.start_service(service, scale, &options).await
                }
                None => orchestrator.start_all(&options).await,
            };
            report("Started", result)?;
            0
        }
        Action::Down(down) => {
            let options = down.options(base_options)?;
            let result = match &down.service {
                Some(service) => orchestrator.stop_service(service, &options).await,
                None => orchestrator.stop_all(&options).await,
            };
            report("Stopped", result)?;
            0
        }
        Action::Exec(exec) => {
            let request = ExecRequest {
                command: exec.command,
                privileged: exec.privileged,
                workdir: exec.workdir,
            };
            let exit_code = orchestrator.exec(&exec.service, exec.index, &request).await?;
            i32::try_from(exit_code).unwrap_or(1)
        }
        Action::Plan(plan) => {
            let options = plan.options(base_options)?;
            let plan = if plan.stop {
                orchestrator.plan_stop(plan.service.as_deref(), &options)?
            } else {
                orchestrator.plan_start(plan.service.as_deref(), &options)?
            };

            println!("{} plan:", plan.direction());
            for (rank, services) in plan.ranks().iter().enumerate() {
                let services = services.iter().map(|id| id.as_str()).collect::<Vec<_>>();
                println!("  {}: {}", rank, services.join(", "));
            }
            0
        }
    };

    if let Some(runtime) = simulated {
        for call in runtime.mutations() {
            println!("{:?}", call);
        }
    }

    Ok(exit_code)
}

/// Falls back to the declared scale of `service`; unknown services are reported by the orchestrator itself.
fn default_scale(orchestrator: &Orchestrator, service: &str, options: &OptionSet) -> usize {
    orchestrator
        .topology()
        .get(service)
        .map(|s| options.scale_for(s.id()).unwrap_or(s.default_scale()))
        .unwrap_or(1)
}

fn report(verb: &str, result: Result<Progress, OrchestratorError>) -> Result<(), GenericError> {
    match result {
        Ok(progress) => {
            info!(%progress, "{} services.", verb);
            Ok(())
        }
        Err(e) => {
            if let Some(progress) = e.progress() {
                warn!(%progress, "Operation did not complete.");
            }
            Err(e.into())
        }
    }
}
