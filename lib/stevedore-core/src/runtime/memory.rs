use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use stevedore_error::generic_error;
use tracing::trace;

use super::{ExecRequest, InstanceState, InstanceStatus, RuntimeAdapter, RuntimeError, RuntimeOperation};
use crate::{
    options::{ImageRemoval, OptionSet},
    topology::{InstanceId, Service, ServiceId},
};

/// A call received by an [`InMemoryRuntime`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuntimeCall {
    /// Instances of a service were created.
    Create {
        /// The service.
        service: ServiceId,

        /// Indexes of the instances that did not exist before the call.
        created: Vec<usize>,
    },

    /// An instance was started.
    Start(InstanceId),

    /// An instance was stopped.
    Stop(InstanceId),

    /// An instance was removed.
    Remove {
        /// The instance.
        instance: InstanceId,

        /// Whether volumes were removed too.
        volumes: bool,
    },

    /// An instance was inspected.
    Inspect(InstanceId),

    /// All instances were listed.
    Instances,

    /// Images of a service were removed.
    RemoveImages {
        /// The service.
        service: ServiceId,

        /// The removal policy.
        policy: ImageRemoval,
    },

    /// A command was run inside an instance.
    Exec {
        /// The instance.
        instance: InstanceId,

        /// The command and its arguments.
        command: Vec<String>,
    },
}

impl RuntimeCall {
    /// Returns the operation this call corresponds to.
    pub fn operation(&self) -> RuntimeOperation {
        match self {
            RuntimeCall::Create { .. } => RuntimeOperation::Create,
            RuntimeCall::Start(_) => RuntimeOperation::Start,
            RuntimeCall::Stop(_) => RuntimeOperation::Stop,
            RuntimeCall::Remove { .. } => RuntimeOperation::Remove,
            RuntimeCall::Inspect(_) => RuntimeOperation::Inspect,
            RuntimeCall::Instances => RuntimeOperation::Instances,
            RuntimeCall::RemoveImages { .. } => RuntimeOperation::RemoveImages,
            RuntimeCall::Exec { .. } => RuntimeOperation::Exec,
        }
    }

    /// Returns `true` if the call can change runtime state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, RuntimeCall::Inspect(_) | RuntimeCall::Instances)
    }
}

struct MemoryInstance {
    state: InstanceState,
    fingerprint: String,
    options: OptionSet,
    exit_pending: bool,
}

#[derive(Default)]
struct MemoryState {
    instances: BTreeMap<InstanceId, MemoryInstance>,
    journal: Vec<RuntimeCall>,
    failures: HashSet<(RuntimeOperation, String)>,
    delays: HashMap<RuntimeOperation, Duration>,
    exit_on_start: HashSet<String>,
    held_states: HashMap<InstanceId, (InstanceState, usize)>,
    exec_exit_code: i64,
}

impl MemoryState {
    fn check_failure(&self, operation: RuntimeOperation, service: &ServiceId) -> Result<(), RuntimeError> {
        if self.failures.contains(&(operation, service.to_string())) {
            Err(generic_error!("Injected {} failure for service '{}'.", operation, service))
        } else {
            Ok(())
        }
    }

    fn instance_mut(&mut self, instance: &InstanceId) -> Result<&mut MemoryInstance, RuntimeError> {
        self.instances
            .get_mut(instance)
            .ok_or_else(|| generic_error!("No such instance '{}'.", instance))
    }
}

/// A simulated runtime that keeps instances in memory.
///
/// Every call is recorded in a journal. Failures, delays, instance exits and transitional states can be injected to
/// exercise orchestration edge cases without a real container runtime. It also backs dry runs.
#[derive(Default)]
pub struct InMemoryRuntime {
    state: Mutex<MemoryState>,
}

impl InMemoryRuntime {
    /// Creates a new, empty `InMemoryRuntime`.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self, operation: RuntimeOperation) {
        let delay = self.state().delays.get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Makes every `operation` call targeting `service` fail.
    pub fn inject_failure(&self, operation: RuntimeOperation, service: &str) {
        self.state().failures.insert((operation, service.to_string()));
    }

    /// Delays every `operation` call by `delay` before it takes effect.
    pub fn inject_delay(&self, operation: RuntimeOperation, delay: Duration) {
        self.state().delays.insert(operation, delay);
    }

    /// Makes instances of `service` exit right after they start.
    ///
    /// The exit is observed by the first inspection following the start.
    pub fn exit_on_start(&self, service: &str) {
        self.state().exit_on_start.insert(service.to_string());
    }

    /// Makes the next `inspections` inspections of `instance` report `state`, regardless of its actual state.
    pub fn hold_state(&self, instance: &InstanceId, state: InstanceState, inspections: usize) {
        self.state().held_states.insert(instance.clone(), (state, inspections));
    }

    /// Sets the exit code returned by [`exec`][RuntimeAdapter::exec].
    pub fn set_exec_exit_code(&self, code: i64) {
        self.state().exec_exit_code = code;
    }

    /// Adds an instance directly, bypassing the journal.
    pub fn insert_instance(&self, instance: InstanceId, state: InstanceState, fingerprint: &str) {
        self.state().instances.insert(
            instance,
            MemoryInstance {
                state,
                fingerprint: fingerprint.to_string(),
                options: OptionSet::default(),
                exit_pending: false,
            },
        );
    }

    /// Marks a running instance as exited.
    pub fn exit_instance(&self, instance: &InstanceId) {
        if let Some(record) = self.state().instances.get_mut(instance) {
            if record.state == InstanceState::Running {
                record.state = InstanceState::Stopped;
            }
        }
    }

    /// Returns the actual state of an instance, without recording an inspection.
    pub fn state_of(&self, instance: &InstanceId) -> InstanceState {
        self.state()
            .instances
            .get(instance)
            .map_or(InstanceState::Absent, |record| record.state)
    }

    /// Returns the options an instance was created with.
    pub fn applied_options(&self, instance: &InstanceId) -> Option<OptionSet> {
        self.state().instances.get(instance).map(|record| record.options.clone())
    }

    /// Returns every recorded call, in order.
    pub fn journal(&self) -> Vec<RuntimeCall> {
        self.state().journal.clone()
    }

    /// Returns every recorded call that can change runtime state, in order.
    pub fn mutations(&self) -> Vec<RuntimeCall> {
        self.state()
            .journal
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    /// Clears the journal.
    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }
}

#[async_trait]
impl RuntimeAdapter for InMemoryRuntime {
    async fn create(
        &self, service: &Service, scale: usize, options: &OptionSet,
    ) -> Result<Vec<InstanceId>, RuntimeError> {
        self.simulate_latency(RuntimeOperation::Create).await;

        let mut guard = self.state();
        let state = &mut *guard;

        if let Err(e) = state.check_failure(RuntimeOperation::Create, service.id()) {
            state.journal.push(RuntimeCall::Create {
                service: service.id().clone(),
                created: Vec::new(),
            });
            return Err(e);
        }

        let mut created = Vec::new();
        for index in 1..=scale {
            let instance = InstanceId::new(service.id().clone(), index);
            if state.instances.contains_key(&instance) {
                continue;
            }

            trace!(%instance, "Creating simulated instance.");
            state.instances.insert(
                instance.clone(),
                MemoryInstance {
                    state: InstanceState::Stopped,
                    fingerprint: service.fingerprint().to_string(),
                    options: options.clone(),
                    exit_pending: false,
                },
            );
            created.push(instance);
        }

        state.journal.push(RuntimeCall::Create {
            service: service.id().clone(),
            created: created.iter().map(InstanceId::index).collect(),
        });
        Ok(created)
    }

    async fn start(&self, instance: &InstanceId) -> Result<(), RuntimeError> {
        self.simulate_latency(RuntimeOperation::Start).await;

        let mut guard = self.state();
        let state = &mut *guard;
        state.journal.push(RuntimeCall::Start(instance.clone()));
        state.check_failure(RuntimeOperation::Start, instance.service())?;

        let exits = state.exit_on_start.contains(instance.service().as_str());
        let record = state.instance_mut(instance)?;
        match record.state {
            InstanceState::Running => {}
            InstanceState::Stopped => {
                record.state = InstanceState::Running;
                record.exit_pending = exits;
            }
            other => return Err(generic_error!("Cannot start instance '{}' while {}.", instance, other)),
        }
        Ok(())
    }

    async fn stop(&self, instance: &InstanceId) -> Result<(), RuntimeError> {
        self.simulate_latency(RuntimeOperation::Stop).await;

        let mut guard = self.state();
        let state = &mut *guard;
        state.journal.push(RuntimeCall::Stop(instance.clone()));
        state.check_failure(RuntimeOperation::Stop, instance.service())?;

        let record = state.instance_mut(instance)?;
        match record.state {
            InstanceState::Running | InstanceState::Stopped => {
                record.state = InstanceState::Stopped;
                record.exit_pending = false;
            }
            other => return Err(generic_error!("Cannot stop instance '{}' while {}.", instance, other)),
        }
        Ok(())
    }

    async fn remove(&self, instance: &InstanceId, remove_volumes: bool) -> Result<(), RuntimeError> {
        self.simulate_latency(RuntimeOperation::Remove).await;

        let mut guard = self.state();
        let state = &mut *guard;
        state.journal.push(RuntimeCall::Remove {
            instance: instance.clone(),
            volumes: remove_volumes,
        });
        state.check_failure(RuntimeOperation::Remove, instance.service())?;

        let record = state.instance_mut(instance)?;
        if record.state != InstanceState::Stopped {
            return Err(generic_error!(
                "Cannot remove instance '{}' while {}.",
                instance,
                record.state
            ));
        }
        state.instances.remove(instance);
        Ok(())
    }

    async fn inspect(&self, instance: &InstanceId) -> Result<InstanceStatus, RuntimeError> {
        self.simulate_latency(RuntimeOperation::Inspect).await;

        let mut guard = self.state();
        let state = &mut *guard;
        state.journal.push(RuntimeCall::Inspect(instance.clone()));
        state.check_failure(RuntimeOperation::Inspect, instance.service())?;

        let held = state
            .held_states
            .get_mut(instance)
            .and_then(|(held, remaining)| match *remaining {
                0 => None,
                _ => {
                    *remaining -= 1;
                    Some(*held)
                }
            });

        let Some(record) = state.instances.get_mut(instance) else {
            return Ok(InstanceStatus {
                state: held.unwrap_or(InstanceState::Absent),
                fingerprint: None,
            });
        };

        if let Some(held) = held {
            return Ok(InstanceStatus {
                state: held,
                fingerprint: Some(record.fingerprint.clone()),
            });
        }

        if record.state == InstanceState::Running && record.exit_pending {
            trace!(%instance, "Simulated instance exited.");
            record.state = InstanceState::Stopped;
            record.exit_pending = false;
        }

        Ok(InstanceStatus {
            state: record.state,
            fingerprint: Some(record.fingerprint.clone()),
        })
    }

    async fn instances(&self) -> Result<Vec<InstanceId>, RuntimeError> {
        self.simulate_latency(RuntimeOperation::Instances).await;

        let mut state = self.state();
        state.journal.push(RuntimeCall::Instances);
        Ok(state.instances.keys().cloned().collect())
    }

    async fn remove_images(&self, service: &ServiceId, policy: ImageRemoval) -> Result<(), RuntimeError> {
        self.simulate_latency(RuntimeOperation::RemoveImages).await;

        let mut state = self.state();
        state.journal.push(RuntimeCall::RemoveImages {
            service: service.clone(),
            policy,
        });
        state.check_failure(RuntimeOperation::RemoveImages, service)
    }

    async fn exec(&self, instance: &InstanceId, request: &ExecRequest) -> Result<i64, RuntimeError> {
        self.simulate_latency(RuntimeOperation::Exec).await;

        let mut guard = self.state();
        let state = &mut *guard;
        state.journal.push(RuntimeCall::Exec {
            instance: instance.clone(),
            command: request.command.clone(),
        });
        state.check_failure(RuntimeOperation::Exec, instance.service())?;

        let exit_code = state.exec_exit_code;
        let record = state.instance_mut(instance)?;
        if record.state != InstanceState::Running {
            return Err(generic_error!("Instance '{}' is not running.", instance));
        }
        Ok(exit_code)
    }
}
