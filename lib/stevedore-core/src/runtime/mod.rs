//! Runtime adapters.
//!
//! The orchestrator never manages instances itself. It drives a [`RuntimeAdapter`], which owns the instances and their
//! state, and observes that state through [`RuntimeAdapter::inspect`].

use std::fmt;

use async_trait::async_trait;
use stevedore_error::GenericError;

use crate::{
    options::{ImageRemoval, OptionSet},
    topology::{InstanceId, Service, ServiceId},
};

mod memory;
pub use self::memory::{InMemoryRuntime, RuntimeCall};

/// Error returned by runtime adapters.
pub type RuntimeError = GenericError;

/// Lifecycle state of an instance.
///
/// Instances move through `Absent -> Creating -> Starting -> Running -> Stopping -> Stopped`, and from `Stopped` either
/// back to `Starting` or through `Removing` to `Absent`. An instance that was created but never started is `Stopped`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InstanceState {
    /// The instance does not exist.
    Absent,

    /// The instance is being created.
    Creating,

    /// The instance is starting.
    Starting,

    /// The instance is running.
    Running,

    /// The instance is stopping.
    Stopping,

    /// The instance exists but is not running.
    Stopped,

    /// The instance is being removed.
    Removing,
}

impl InstanceState {
    /// Returns `true` if the instance is between two stable states.
    pub const fn is_transitional(&self) -> bool {
        matches!(
            self,
            InstanceState::Creating | InstanceState::Starting | InstanceState::Stopping | InstanceState::Removing
        )
    }

    /// Returns the state name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Absent => "absent",
            InstanceState::Creating => "creating",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Removing => "removing",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed status of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus {
    /// Current lifecycle state.
    pub state: InstanceState,

    /// Fingerprint of the service definition the instance was created from, if the instance exists.
    pub fingerprint: Option<String>,
}

impl InstanceStatus {
    /// Status of an instance that does not exist.
    pub const fn absent() -> Self {
        Self {
            state: InstanceState::Absent,
            fingerprint: None,
        }
    }
}

/// A command to run inside an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecRequest {
    /// Command and arguments.
    pub command: Vec<String>,

    /// Whether to run the command with extended privileges.
    pub privileged: bool,

    /// Working directory for the command.
    pub workdir: Option<String>,
}

/// Runtime operations, as named in logs and errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RuntimeOperation {
    /// [`RuntimeAdapter::create`]
    Create,
    /// [`RuntimeAdapter::start`]
    Start,
    /// [`RuntimeAdapter::stop`]
    Stop,
    /// [`RuntimeAdapter::remove`]
    Remove,
    /// [`RuntimeAdapter::inspect`]
    Inspect,
    /// [`RuntimeAdapter::instances`]
    Instances,
    /// [`RuntimeAdapter::remove_images`]
    RemoveImages,
    /// [`RuntimeAdapter::exec`]
    Exec,
}

impl RuntimeOperation {
    /// Returns the operation name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            RuntimeOperation::Create => "create",
            RuntimeOperation::Start => "start",
            RuntimeOperation::Stop => "stop",
            RuntimeOperation::Remove => "remove",
            RuntimeOperation::Inspect => "inspect",
            RuntimeOperation::Instances => "list instances",
            RuntimeOperation::RemoveImages => "remove images",
            RuntimeOperation::Exec => "exec",
        }
    }
}

impl fmt::Display for RuntimeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container runtime.
///
/// Implementations own instance records and their lifecycle state. Calls may be slow; the orchestrator bounds each of
/// them with a timeout and does not hold any lock across them.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Creates every missing instance of `service` with an index in `1..=scale`.
    ///
    /// Instances are created stopped. Returns the identifiers of the created instances, in index order.
    async fn create(
        &self, service: &Service, scale: usize, options: &OptionSet,
    ) -> Result<Vec<InstanceId>, RuntimeError>;

    /// Starts a created instance.
    async fn start(&self, instance: &InstanceId) -> Result<(), RuntimeError>;

    /// Stops a running instance.
    async fn stop(&self, instance: &InstanceId) -> Result<(), RuntimeError>;

    /// Removes a stopped instance, along with its volumes when `remove_volumes` is set.
    async fn remove(&self, instance: &InstanceId, remove_volumes: bool) -> Result<(), RuntimeError>;

    /// Returns the current status of an instance.
    ///
    /// Instances that do not exist are reported as [`InstanceState::Absent`] rather than as an error.
    async fn inspect(&self, instance: &InstanceId) -> Result<InstanceStatus, RuntimeError>;

    /// Returns every instance known to the runtime, including those of services missing from the topology.
    async fn instances(&self) -> Result<Vec<InstanceId>, RuntimeError>;

    /// Removes the images of `service` according to `policy`.
    async fn remove_images(&self, service: &ServiceId, policy: ImageRemoval) -> Result<(), RuntimeError>;

    /// Runs a command inside a running instance and returns its exit code.
    async fn exec(&self, instance: &InstanceId, request: &ExecRequest) -> Result<i64, RuntimeError>;
}
