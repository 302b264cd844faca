use std::{fmt, time::Duration};

use snafu::Snafu;

use crate::{
    options::OptionError,
    resolver::PlanError,
    runtime::{InstanceState, RuntimeError, RuntimeOperation},
    topology::{InstanceId, ServiceId},
};

/// How far a batch of lifecycle steps got.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Progress {
    /// Services whose step completed, in completion order.
    pub completed: Vec<ServiceId>,

    /// Services whose step failed. The first entry is the failure that was reported.
    pub failed: Vec<ServiceId>,

    /// Services whose step never ran, in plan order.
    pub not_attempted: Vec<ServiceId>,
}

impl Progress {
    /// Returns `true` if every step completed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.not_attempted.is_empty()
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} not attempted",
            self.completed.len(),
            self.failed.len(),
            self.not_attempted.len()
        )
    }
}

/// Failure of a single runtime call.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RuntimeCallError {
    /// The runtime reported an error.
    #[snafu(display("{} of '{}' failed: {}", operation, target, source))]
    Failed {
        /// The operation.
        operation: RuntimeOperation,

        /// The instance or service the call targeted.
        target: String,

        /// Error reported by the runtime.
        source: RuntimeError,
    },

    /// The runtime did not answer within the call timeout.
    #[snafu(display("{} of '{}' timed out after {:?}", operation, target, timeout))]
    TimedOut {
        /// The operation.
        operation: RuntimeOperation,

        /// The instance or service the call targeted.
        target: String,

        /// The call timeout that elapsed.
        timeout: Duration,
    },
}

impl RuntimeCallError {
    /// Returns the operation that failed.
    pub fn operation(&self) -> RuntimeOperation {
        match self {
            RuntimeCallError::Failed { operation, .. } | RuntimeCallError::TimedOut { operation, .. } => *operation,
        }
    }

    /// Returns `true` if the call timed out rather than failed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeCallError::TimedOut { .. })
    }
}

/// Failure of a single plan entry.
#[derive(Debug)]
pub(super) enum StepError {
    RuntimeCall(RuntimeCallError),
    DependencyUnavailable {
        dependency: ServiceId,
        instance: InstanceId,
        state: InstanceState,
    },
}

impl From<RuntimeCallError> for StepError {
    fn from(e: RuntimeCallError) -> Self {
        StepError::RuntimeCall(e)
    }
}

impl StepError {
    pub(super) fn into_orchestrator_error(self, service: ServiceId, progress: Progress) -> OrchestratorError {
        match self {
            StepError::RuntimeCall(source) => OrchestratorError::RuntimeCall { source, progress },
            StepError::DependencyUnavailable {
                dependency,
                instance,
                state,
            } => OrchestratorError::DependencyUnavailable {
                service,
                dependency,
                instance,
                state,
                progress,
            },
        }
    }
}

/// Orchestrator errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum OrchestratorError {
    /// The options are not valid for the operation.
    #[snafu(display("invalid options: {}", source))]
    Options {
        /// Error source.
        source: OptionError,
    },

    /// No valid plan exists for the operation.
    #[snafu(display("failed to plan operation: {}", source))]
    Plan {
        /// Error source.
        source: PlanError,
    },

    /// A dependency was not running when a service was about to start.
    #[snafu(display(
        "cannot start '{}': dependency '{}' is not running (instance '{}' is {}); {}",
        service,
        dependency,
        instance,
        state,
        progress
    ))]
    DependencyUnavailable {
        /// The service that was about to start.
        service: ServiceId,

        /// The unavailable dependency.
        dependency: ServiceId,

        /// The first dependency instance found not running.
        instance: InstanceId,

        /// State of that instance.
        state: InstanceState,

        /// How far the operation got.
        progress: Progress,
    },

    /// A runtime call failed or timed out.
    #[snafu(display("{}; {}", source, progress))]
    RuntimeCall {
        /// Error source.
        source: RuntimeCallError,

        /// How far the operation got.
        progress: Progress,
    },

    /// An instance exited after being started, and the batch was stopped.
    #[snafu(display("instance '{}' exited after start (now {}); stopped the batch; {}", instance, state, progress))]
    AbortedByExit {
        /// The instance that exited.
        instance: InstanceId,

        /// State the instance was found in.
        state: InstanceState,

        /// How far the operation got before the batch was stopped.
        progress: Progress,
    },

    /// A command was aimed at an instance that is not running.
    #[snafu(display("instance '{}' is not running (state: {})", instance, state))]
    ServiceNotRunning {
        /// The targeted instance.
        instance: InstanceId,

        /// State of the instance.
        state: InstanceState,
    },
}

impl OrchestratorError {
    /// Returns how far the operation got, for errors raised while executing a plan.
    pub fn progress(&self) -> Option<&Progress> {
        match self {
            OrchestratorError::DependencyUnavailable { progress, .. }
            | OrchestratorError::RuntimeCall { progress, .. }
            | OrchestratorError::AbortedByExit { progress, .. } => Some(progress),
            OrchestratorError::Options { .. }
            | OrchestratorError::Plan { .. }
            | OrchestratorError::ServiceNotRunning { .. } => None,
        }
    }
}
