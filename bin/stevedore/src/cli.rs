use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use stevedore_core::options::{OptionError, OptionName, OptionSet};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Project name.
    ///
    /// Prefixes every container and network created for the topology. Defaults to the configured project name, or the
    /// name of the current directory.
    #[arg(global = true, short = 'p', long)]
    pub project: Option<String>,

    /// Path to the runner configuration file.
    #[arg(global = true, short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Path to the topology file.
    ///
    /// Relative paths are resolved against the current directory. Defaults to `stevedore.yaml`.
    #[arg(global = true, short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Simulate the container runtime in memory and print the calls that would have been made.
    #[arg(global = true, long)]
    pub dry_run: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Builds the option set shared by every subcommand.
    pub fn base_options(&self) -> Result<OptionSet, OptionError> {
        let options = OptionSet::default();
        match &self.file {
            Some(file) => options.with_override(OptionName::File.as_str(), file.clone()),
            None => Ok(options),
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Create and start services, along with their dependencies.
    #[command(name = "up")]
    Up(UpConfig),

    /// Stop and remove services, along with the services depending on them.
    #[command(name = "down")]
    Down(DownConfig),

    /// Run a command inside a running service instance.
    #[command(name = "exec")]
    Exec(ExecConfig),

    /// Print the order in which services would be started or stopped.
    #[command(name = "plan")]
    Plan(PlanConfig),
}

/// `up` configuration.
#[derive(Args, Clone)]
pub struct UpConfig {
    /// Service to start. Starts every service when omitted.
    pub service: Option<String>,

    /// Number of instances of the service to run.
    ///
    /// Requires a service to be named. Defaults to the scale declared in the topology.
    #[arg(long, requires = "service")]
    pub scale: Option<usize>,

    /// Number of instances of another service to run, in the form of `SERVICE=COUNT`.
    #[arg(long = "scale-service", value_name = "SERVICE=COUNT")]
    pub scale_overrides: Vec<String>,

    /// Don't start dependencies.
    #[arg(long)]
    pub no_deps: bool,

    /// Stop every started service if any instance exits once started.
    #[arg(long)]
    pub abort_on_container_exit: bool,

    /// Recreate dependencies, even when they are up to date.
    #[arg(long)]
    pub always_recreate_deps: bool,

    /// Recreate instances, even when they are up to date.
    #[arg(long)]
    pub force_recreate: bool,

    /// Recreate instances whose definition changed, according to each service's recreate policy.
    ///
    /// By default, running instances are left alone.
    #[arg(long)]
    pub recreate: bool,

    /// Build images before starting instances.
    #[arg(long, conflicts_with = "no_build")]
    pub build: bool,

    /// Don't build images, even when they are missing.
    #[arg(long)]
    pub no_build: bool,

    /// Stay attached until every started instance has exited.
    #[arg(long)]
    pub attach: bool,
}

impl UpConfig {
    /// Applies the flags on top of `base`.
    pub fn options(&self, base: OptionSet) -> Result<OptionSet, OptionError> {
        let mut options = apply_flags(
            base,
            &[
                (OptionName::NoDeps, self.no_deps),
                (OptionName::AbortOnContainerExit, self.abort_on_container_exit),
                (OptionName::AlwaysRecreateDeps, self.always_recreate_deps),
                (OptionName::ForceRecreate, self.force_recreate),
                (OptionName::Build, self.build),
                (OptionName::NoBuild, self.no_build),
            ],
        )?;

        if self.recreate {
            options = options.with_override(OptionName::NoRecreate.as_str(), false)?;
        }
        if self.attach {
            options = options.with_override(OptionName::Detach.as_str(), false)?;
        }
        if !self.scale_overrides.is_empty() {
            options = options.with_override(OptionName::Scale.as_str(), self.scale_overrides.clone())?;
        }
        Ok(options)
    }
}

/// `down` configuration.
#[derive(Args, Clone)]
pub struct DownConfig {
    /// Service to stop. Stops every service when omitted.
    pub service: Option<String>,

    /// Don't stop dependent services.
    #[arg(long)]
    pub no_deps: bool,

    /// Remove instances of services that are no longer part of the topology.
    #[arg(long)]
    pub remove_orphans: bool,

    /// Remove the volumes attached to removed instances.
    #[arg(long)]
    pub volumes: bool,

    /// Images to remove once the instances are gone.
    #[arg(long, value_enum, default_value_t = RmiMode::None)]
    pub rmi: RmiMode,
}

impl DownConfig {
    /// Applies the flags on top of `base`.
    pub fn options(&self, base: OptionSet) -> Result<OptionSet, OptionError> {
        let options = apply_flags(
            base,
            &[
                (OptionName::NoDeps, self.no_deps),
                (OptionName::RemoveOrphans, self.remove_orphans),
                (OptionName::Volumes, self.volumes),
            ],
        )?;
        options.with_override(OptionName::Rmi.as_str(), self.rmi.as_str())
    }
}

/// Image removal mode.
#[derive(Clone, Copy, ValueEnum)]
pub enum RmiMode {
    /// Keep every image.
    None,

    /// Remove every image used by the services.
    All,

    /// Remove images without a custom tag.
    Local,
}

impl RmiMode {
    fn as_str(&self) -> &'static str {
        match self {
            RmiMode::None => "none",
            RmiMode::All => "all",
            RmiMode::Local => "local",
        }
    }
}

/// `exec` configuration.
#[derive(Args, Clone)]
pub struct ExecConfig {
    /// Service to run the command in.
    pub service: String,

    /// Instance of the service to run the command in.
    #[arg(long, default_value_t = 1)]
    pub index: usize,

    /// Give extended privileges to the command.
    #[arg(long)]
    pub privileged: bool,

    /// Working directory of the command inside the instance.
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Command to run, and its arguments.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// `plan` configuration.
#[derive(Args, Clone)]
pub struct PlanConfig {
    /// Service to plan for. Plans for every service when omitted.
    pub service: Option<String>,

    /// Print the stop order instead of the start order.
    #[arg(long)]
    pub stop: bool,

    /// Don't follow dependencies.
    #[arg(long)]
    pub no_deps: bool,
}

impl PlanConfig {
    /// Applies the flags on top of `base`.
    pub fn options(&self, base: OptionSet) -> Result<OptionSet, OptionError> {
        apply_flags(base, &[(OptionName::NoDeps, self.no_deps)])
    }
}

fn apply_flags(options: OptionSet, flags: &[(OptionName, bool)]) -> Result<OptionSet, OptionError> {
    flags
        .iter()
        .filter(|(_, enabled)| *enabled)
        .try_fold(options, |options, (name, _)| options.with_override(name.as_str(), true))
}

#[cfg(test)]
mod tests {
    use stevedore_core::options::ImageRemoval;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("stevedore").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn up_flags_map_onto_options() {
        let cli = parse(&[
            "up",
            "api",
            "--scale",
            "3",
            "--no-deps",
            "--recreate",
            "--attach",
            "--scale-service",
            "worker=2",
        ]);
        let Action::Up(config) = &cli.action else {
            panic!("expected up");
        };
        assert_eq!(config.scale, Some(3));

        let options = config.options(cli.base_options().unwrap()).unwrap();
        assert!(options.no_deps());
        assert!(!options.no_recreate());
        assert!(!options.detach());
        assert!(!options.force_recreate());
        assert_eq!(options.scale().len(), 1);
    }

    #[test]
    fn down_flags_map_onto_options() {
        let cli = parse(&["-f", "other.yaml", "down", "--volumes", "--rmi", "all"]);
        let Action::Down(config) = &cli.action else {
            panic!("expected down");
        };

        let options = config.options(cli.base_options().unwrap()).unwrap();
        assert!(options.volumes());
        assert!(!options.remove_orphans());
        assert_eq!(options.rmi(), ImageRemoval::All);
        assert_eq!(options.file(), Some(std::path::Path::new("other.yaml")));
    }

    #[test]
    fn exec_takes_trailing_command() {
        let cli = parse(&["exec", "db", "--index", "2", "--", "psql", "-c", "select 1"]);
        let Action::Exec(config) = cli.action else {
            panic!("expected exec");
        };
        assert_eq!(config.service, "db");
        assert_eq!(config.index, 2);
        assert_eq!(config.command, vec!["psql", "-c", "select 1"]);
    }

    #[test]
    fn verbosity() {
        assert_eq!(parse(&["plan"]).log_level(), LevelFilter::INFO);
        assert_eq!(parse(&["-vv", "plan"]).log_level(), LevelFilter::TRACE);
    }

    #[test]
    fn conflicting_build_flags_are_rejected() {
        let result = Cli::try_parse_from(["stevedore", "up", "--build", "--no-build"]);
        assert!(result.is_err());
    }

    #[test]
    fn scale_requires_a_service() {
        let result = Cli::try_parse_from(["stevedore", "up", "--scale", "3"]);
        assert_eq!(result.err().map(|e| e.kind()), Some(clap::error::ErrorKind::MissingRequiredArgument));
    }
}
