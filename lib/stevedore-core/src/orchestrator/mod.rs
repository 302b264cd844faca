//! Lifecycle orchestration.
//!
//! The [`Orchestrator`] turns lifecycle operations (start one or all services, stop one or all services, run a command
//! in an instance) into an ordered plan and drives a [`RuntimeAdapter`] through it, one plan entry at a time or one
//! topological rank at a time.

use std::{future::Future, sync::Arc, time::Duration};

use futures::stream::{self, StreamExt as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument as _};

use crate::{
    options::OptionSet,
    resolver::{self, Direction, Plan, PlanError},
    runtime::{ExecRequest, InstanceState, RuntimeAdapter, RuntimeOperation},
    topology::{InstanceId, Service, ServiceId, Topology},
};

mod error;
use self::error::StepError;
pub use self::error::{OrchestratorError, Progress, RuntimeCallError};

mod step;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Orchestrator configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrchestratorConfig {
    call_timeout: Duration,
    settle_interval: Duration,
    max_parallelism: usize,
    exit_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            settle_interval: DEFAULT_SETTLE_INTERVAL,
            max_parallelism: 1,
            exit_poll_interval: DEFAULT_EXIT_POLL_INTERVAL,
        }
    }
}

impl OrchestratorConfig {
    /// Sets the time limit for a single runtime call.
    ///
    /// Waiting for an instance in a transitional state to settle is bounded by the same limit.
    ///
    /// Defaults to 60 seconds.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Sets how long to wait between two inspections of an instance in a transitional state.
    ///
    /// Defaults to 250 milliseconds.
    pub fn with_settle_interval(mut self, settle_interval: Duration) -> Self {
        self.settle_interval = settle_interval;
        self
    }

    /// Sets how many services of the same topological rank may be acted on concurrently.
    ///
    /// A value of 1 (the default) acts on one service at a time, in plan order. Zero is treated as 1.
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    /// Sets how often started instances are inspected while waiting for them to exit.
    ///
    /// Defaults to 1 second.
    pub fn with_exit_poll_interval(mut self, exit_poll_interval: Duration) -> Self {
        self.exit_poll_interval = exit_poll_interval;
        self
    }

    /// Returns the runtime call timeout.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Returns the settle interval.
    pub fn settle_interval(&self) -> Duration {
        self.settle_interval
    }

    /// Returns the maximum number of concurrent steps.
    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Returns the exit poll interval.
    pub fn exit_poll_interval(&self) -> Duration {
        self.exit_poll_interval
    }
}

/// Drives a runtime through lifecycle operations over a topology.
///
/// The orchestrator keeps no instance state of its own: every decision is made from a fresh inspection. Failures are
/// fail-fast and never rolled back.
pub struct Orchestrator {
    topology: Arc<Topology>,
    runtime: Arc<dyn RuntimeAdapter>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates a new `Orchestrator`.
    pub fn new(topology: Arc<Topology>, runtime: Arc<dyn RuntimeAdapter>, config: OrchestratorConfig) -> Self {
        Self {
            topology,
            runtime,
            config,
        }
    }

    /// Returns the topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Computes the start plan for a service, or for the whole topology when `service` is `None`.
    ///
    /// # Errors
    ///
    /// If the service does not exist, an error is returned.
    pub fn plan_start(&self, service: Option<&str>, options: &OptionSet) -> Result<Plan, OrchestratorError> {
        self.plan_for(service, options, Direction::Forward)
    }

    /// Computes the stop plan for a service, or for the whole topology when `service` is `None`.
    ///
    /// # Errors
    ///
    /// If the service does not exist, an error is returned.
    pub fn plan_stop(&self, service: Option<&str>, options: &OptionSet) -> Result<Plan, OrchestratorError> {
        self.plan_for(service, options, Direction::Reverse)
    }

    fn plan_for(
        &self, service: Option<&str>, options: &OptionSet, direction: Direction,
    ) -> Result<Plan, OrchestratorError> {
        let result = match service {
            Some(service) => {
                let id = self.resolve_service(service)?;
                if options.no_deps() {
                    Ok(Plan::isolated(direction, id))
                } else {
                    resolver::plan(self.topology.as_ref(), &[id], direction)
                }
            }
            None => {
                let all = self.topology.service_ids().cloned().collect::<Vec<_>>();
                resolver::plan(self.topology.as_ref(), &all, direction)
            }
        };

        result.map_err(|source| OrchestratorError::Plan { source })
    }

    fn resolve_service(&self, service: &str) -> Result<ServiceId, OrchestratorError> {
        self.topology
            .get(service)
            .map(|s| s.id().clone())
            .ok_or_else(|| OrchestratorError::Plan {
                source: PlanError::UnknownService {
                    service: service.to_string(),
                },
            })
    }

    fn desired_scale(&self, service: &Service, options: &OptionSet) -> usize {
        options.scale_for(service.id()).unwrap_or(service.default_scale())
    }

    /// Starts a service at the given scale, along with its dependencies.
    ///
    /// Any scale overrides in `options` are discarded: dependencies run at their default scale. With `no-deps`, only
    /// the service itself is acted on.
    ///
    /// # Errors
    ///
    /// If the options or plan are invalid, nothing is done and an error is returned. If a step fails, the remaining
    /// steps are abandoned and an error carrying the [`Progress`] so far is returned.
    pub async fn start_service(
        &self, service: &str, scale: usize, options: &OptionSet,
    ) -> Result<Progress, OrchestratorError> {
        let id = self.resolve_service(service)?;
        let options = options
            .for_service(&id, scale)
            .map_err(|source| OrchestratorError::Options { source })?;
        let plan = self.plan_start(Some(id.as_str()), &options)?;

        let span = info_span!("start_service", service = %id, scale);
        self.start_plan(&plan, &options, Some(&id)).instrument(span).await
    }

    /// Starts every service in the topology.
    ///
    /// # Errors
    ///
    /// If a step fails, the remaining steps are abandoned and an error carrying the [`Progress`] so far is returned.
    pub async fn start_all(&self, options: &OptionSet) -> Result<Progress, OrchestratorError> {
        let plan = self.plan_start(None, options)?;

        let span = info_span!("start_all");
        self.start_plan(&plan, options, None).instrument(span).await
    }

    /// Stops a service, along with every service depending on it.
    ///
    /// # Errors
    ///
    /// If the plan is invalid, nothing is done and an error is returned. If a step fails, the remaining steps are
    /// abandoned and an error carrying the [`Progress`] so far is returned.
    pub async fn stop_service(&self, service: &str, options: &OptionSet) -> Result<Progress, OrchestratorError> {
        let plan = self.plan_stop(Some(service), options)?;

        let span = info_span!("stop_service", service);
        async {
            info!(plan = %plan, "Stopping services.");
            self.run_plan(&plan, |id| self.stop_entry(id, options)).await
        }
        .instrument(span)
        .await
    }

    /// Stops every service in the topology.
    ///
    /// With `remove-orphans`, instances of services missing from the topology are then stopped and removed too.
    ///
    /// # Errors
    ///
    /// If a step fails, the remaining steps are abandoned and an error carrying the [`Progress`] so far is returned.
    pub async fn stop_all(&self, options: &OptionSet) -> Result<Progress, OrchestratorError> {
        let plan = self.plan_stop(None, options)?;

        let span = info_span!("stop_all");
        async {
            info!(plan = %plan, "Stopping services.");
            let progress = self.run_plan(&plan, |id| self.stop_entry(id, options)).await?;

            if options.remove_orphans() {
                self.remove_orphans(options)
                    .await
                    .map_err(|source| OrchestratorError::RuntimeCall {
                        source,
                        progress: progress.clone(),
                    })?;
            }

            Ok::<_, OrchestratorError>(progress)
        }
        .instrument(span)
        .await
    }

    /// Runs a command inside a running service instance and returns its exit code.
    ///
    /// `index` is the 1-based replica index.
    ///
    /// # Errors
    ///
    /// If the service does not exist, the instance is not running, or the runtime call fails, an error is returned.
    pub async fn exec(&self, service: &str, index: usize, request: &ExecRequest) -> Result<i64, OrchestratorError> {
        let instance = InstanceId::new(self.resolve_service(service)?, index);

        let span = info_span!("exec", %instance);
        async {
            let status = self
                .inspect(&instance)
                .await
                .map_err(|source| OrchestratorError::RuntimeCall {
                    source,
                    progress: Progress::default(),
                })?;
            if status.state != InstanceState::Running {
                return Err(OrchestratorError::ServiceNotRunning {
                    instance: instance.clone(),
                    state: status.state,
                });
            }

            let exit_code = self
                .call(RuntimeOperation::Exec, &instance, self.runtime.exec(&instance, request))
                .await
                .map_err(|source| OrchestratorError::RuntimeCall {
                    source,
                    progress: Progress::default(),
                })?;

            info!(exit_code, "Command finished.");
            Ok(exit_code)
        }
        .instrument(span)
        .await
    }

    async fn start_plan(
        &self, plan: &Plan, options: &OptionSet, target: Option<&ServiceId>,
    ) -> Result<Progress, OrchestratorError> {
        info!(plan = %plan, "Starting services.");
        let progress = self
            .run_plan(plan, |id| self.start_entry(id, plan, options, target))
            .await?;

        if options.abort_on_container_exit() || !options.detach() {
            self.watch_started(&progress, options).await?;
        }

        Ok(progress)
    }

    /// Runs `step` for every plan entry.
    ///
    /// Entries run one at a time in plan order, or rank by rank with up to `max_parallelism` concurrent steps per rank.
    /// After the first failure, steps that have not started yet are skipped; steps already running are awaited.
    async fn run_plan<F, Fut>(&self, plan: &Plan, step: F) -> Result<Progress, OrchestratorError>
    where
        F: Fn(ServiceId) -> Fut,
        Fut: Future<Output = Result<(), StepError>>,
    {
        let parallelism = self.config.max_parallelism.max(1);
        let groups = if parallelism > 1 {
            plan.ranks()
        } else {
            plan.entries().iter().map(|id| vec![id.clone()]).collect()
        };

        let cancel_token = CancellationToken::new();
        let mut progress = Progress::default();
        let mut first_error = None;

        for group in groups {
            if cancel_token.is_cancelled() {
                progress.not_attempted.extend(group);
                continue;
            }

            let outcomes = stream::iter(group)
                .map(|id| {
                    let cancel_token = cancel_token.clone();
                    let step = &step;
                    async move {
                        if cancel_token.is_cancelled() {
                            return (id, None);
                        }

                        let result = step(id.clone()).await;
                        if result.is_err() {
                            cancel_token.cancel();
                        }
                        (id, Some(result))
                    }
                })
                .buffer_unordered(parallelism)
                .collect::<Vec<_>>()
                .await;

            for (id, outcome) in outcomes {
                match outcome {
                    None => progress.not_attempted.push(id),
                    Some(Ok(())) => progress.completed.push(id),
                    Some(Err(e)) => {
                        progress.failed.push(id.clone());
                        if first_error.is_none() {
                            first_error = Some((id, e));
                        } else {
                            warn!(service = %id, error = ?e, "Concurrent step failed as well.");
                        }
                    }
                }
            }
        }

        match first_error {
            None => {
                debug!(completed = progress.completed.len(), "Plan completed.");
                Ok(progress)
            }
            Some((id, e)) => {
                progress
                    .not_attempted
                    .sort_by_key(|skipped| plan.entries().iter().position(|entry| entry == skipped));
                Err(e.into_orchestrator_error(id, progress))
            }
        }
    }

    /// Inspects every instance started by a batch, either once (`abort-on-container-exit`) or until they have all
    /// exited (`detach=false`).
    ///
    /// With `abort-on-container-exit`, the first instance found not running stops the batch in reverse order.
    async fn watch_started(&self, progress: &Progress, options: &OptionSet) -> Result<(), OrchestratorError> {
        let instances = progress
            .completed
            .iter()
            .filter_map(|id| self.topology.get(id))
            .flat_map(|service| {
                let scale = self.desired_scale(service, options);
                (1..=scale).map(move |index| InstanceId::new(service.id().clone(), index))
            })
            .collect::<Vec<_>>();

        let abort_on_exit = options.abort_on_container_exit();
        loop {
            let mut running = 0usize;
            for instance in &instances {
                let status = self
                    .inspect(instance)
                    .await
                    .map_err(|source| OrchestratorError::RuntimeCall {
                        source,
                        progress: progress.clone(),
                    })?;

                if status.state == InstanceState::Running {
                    running += 1;
                } else if abort_on_exit {
                    warn!(%instance, state = %status.state, "Instance exited after start. Stopping started services.");
                    self.stop_started(progress, options).await;
                    return Err(OrchestratorError::AbortedByExit {
                        instance: instance.clone(),
                        state: status.state,
                        progress: progress.clone(),
                    });
                }
            }

            if options.detach() || running == 0 {
                return Ok(());
            }

            debug!(running, "Waiting for started instances to exit.");
            tokio::time::sleep(self.config.exit_poll_interval).await;
        }
    }

    /// Stops the running instances of every completed service, in reverse completion order.
    ///
    /// Failures are logged and do not interrupt the remaining stops.
    async fn stop_started(&self, progress: &Progress, options: &OptionSet) {
        for service in progress.completed.iter().rev().filter_map(|id| self.topology.get(id)) {
            for index in 1..=self.desired_scale(service, options) {
                let instance = InstanceId::new(service.id().clone(), index);
                if let Err(e) = self.stop_if_running(&instance).await {
                    warn!(%instance, error = %e, "Failed to stop instance.");
                }
            }
        }
    }
}
