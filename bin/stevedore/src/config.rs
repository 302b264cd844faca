use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use stevedore_config::ConfigurationLoader;
use stevedore_core::orchestrator::OrchestratorConfig;
use stevedore_error::{ErrorContext as _, GenericError};

const DEFAULT_PROJECT_NAME: &str = "stevedore";

/// Runner configuration.
///
/// Loaded from an optional YAML file, then from `STEVEDORE_`-prefixed environment variables.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RunnerConfiguration {
    /// Project name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project_name: Option<String>,

    /// Timeout applied to every runtime call, in seconds.
    call_timeout_secs: u64,

    /// Interval between inspections of an instance in a transitional state, in milliseconds.
    settle_interval_ms: u64,

    /// Maximum number of services acted on concurrently.
    max_parallelism: usize,

    /// Interval between inspections while waiting for started instances to exit, in milliseconds.
    exit_poll_interval_ms: u64,
}

impl Default for RunnerConfiguration {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            project_name: None,
            call_timeout_secs: defaults.call_timeout().as_secs(),
            settle_interval_ms: defaults.settle_interval().as_millis() as u64,
            max_parallelism: defaults.max_parallelism(),
            exit_poll_interval_ms: defaults.exit_poll_interval().as_millis() as u64,
        }
    }
}

impl RunnerConfiguration {
    /// Loads the runner configuration.
    ///
    /// # Errors
    ///
    /// If the configuration file cannot be read, or the merged configuration is invalid, an error will be returned.
    pub fn load(path: Option<&Path>) -> Result<Self, GenericError> {
        let mut loader = ConfigurationLoader::default().with_defaults(RunnerConfiguration::default());
        if let Some(path) = path {
            loader = loader.from_yaml(path)?;
        }

        loader
            .from_environment("stevedore")?
            .into_typed()
            .error_context("Failed to load runner configuration.")
    }

    /// Resolves the project name.
    ///
    /// An explicit name wins over the configured one, which wins over the name of `base_dir`. The result is lowercased
    /// and stripped of anything a container name cannot hold.
    pub fn project_name(&self, explicit: Option<&str>, base_dir: &Path) -> String {
        let raw = explicit
            .map(str::to_string)
            .or_else(|| self.project_name.clone())
            .or_else(|| base_dir.file_name().map(|name| name.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let sanitized = raw
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect::<String>();

        if sanitized.is_empty() {
            DEFAULT_PROJECT_NAME.to_string()
        } else {
            sanitized
        }
    }

    /// Returns the orchestrator configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
            .with_settle_interval(Duration::from_millis(self.settle_interval_ms))
            .with_max_parallelism(self.max_parallelism)
            .with_exit_poll_interval(Duration::from_millis(self.exit_poll_interval_ms))
    }
}
