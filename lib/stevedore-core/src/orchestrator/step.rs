use std::{fmt, future::Future};

use tokio::time::Instant;
use tracing::{debug, debug_span, info, Instrument as _};

use super::{error::StepError, Orchestrator, RuntimeCallError};
use crate::{
    options::{ImageRemoval, OptionSet},
    resolver::Plan,
    runtime::{InstanceState, InstanceStatus, RuntimeError, RuntimeOperation},
    topology::{InstanceId, RecreatePolicy, Service, ServiceId},
};

impl Orchestrator {
    /// Runs a single runtime call under the call timeout.
    pub(super) async fn call<T, D, Fut>(
        &self, operation: RuntimeOperation, target: D, call: Fut,
    ) -> Result<T, RuntimeCallError>
    where
        D: fmt::Display,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let timeout = self.config.call_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(RuntimeCallError::Failed {
                operation,
                target: target.to_string(),
                source,
            }),
            Err(_) => Err(RuntimeCallError::TimedOut {
                operation,
                target: target.to_string(),
                timeout,
            }),
        }
    }

    pub(super) async fn inspect(&self, instance: &InstanceId) -> Result<InstanceStatus, RuntimeCallError> {
        self.call(RuntimeOperation::Inspect, instance, self.runtime.inspect(instance))
            .await
    }

    /// Inspects an instance until it is in a stable state.
    ///
    /// Gives up with a timeout once waiting any longer would exceed the call timeout.
    async fn inspect_settled(&self, instance: &InstanceId) -> Result<InstanceStatus, RuntimeCallError> {
        let deadline = Instant::now() + self.config.call_timeout;
        loop {
            let status = self.inspect(instance).await?;
            if !status.state.is_transitional() {
                return Ok(status);
            }

            if Instant::now() + self.config.settle_interval > deadline {
                return Err(RuntimeCallError::TimedOut {
                    operation: RuntimeOperation::Inspect,
                    target: instance.to_string(),
                    timeout: self.config.call_timeout,
                });
            }

            debug!(%instance, state = %status.state, "Waiting for instance to settle.");
            tokio::time::sleep(self.config.settle_interval).await;
        }
    }

    async fn instances_of(&self, service: &ServiceId) -> Result<Vec<InstanceId>, RuntimeCallError> {
        let instances = self
            .call(RuntimeOperation::Instances, service, self.runtime.instances())
            .await?;
        Ok(instances.into_iter().filter(|i| i.service() == service).collect())
    }

    pub(super) async fn stop_if_running(&self, instance: &InstanceId) -> Result<(), RuntimeCallError> {
        let status = self.inspect_settled(instance).await?;
        if status.state == InstanceState::Running {
            self.call(RuntimeOperation::Stop, instance, self.runtime.stop(instance))
                .await?;
            info!(%instance, "Stopped instance.");
        }
        Ok(())
    }

    /// Stops an instance if it is running, then removes it.
    async fn retire(
        &self, instance: &InstanceId, state: InstanceState, remove_volumes: bool,
    ) -> Result<(), RuntimeCallError> {
        if state == InstanceState::Absent {
            return Ok(());
        }
        if state == InstanceState::Running {
            self.call(RuntimeOperation::Stop, instance, self.runtime.stop(instance))
                .await?;
        }
        self.call(
            RuntimeOperation::Remove,
            instance,
            self.runtime.remove(instance, remove_volumes),
        )
        .await?;
        debug!(%instance, "Removed instance.");
        Ok(())
    }

    /// Brings one plan entry up.
    pub(super) async fn start_entry(
        &self, id: ServiceId, plan: &Plan, options: &OptionSet, target: Option<&ServiceId>,
    ) -> Result<(), StepError> {
        let Some(service) = self.topology.get(&id) else {
            debug!(service = %id, "Service is not part of the topology. Skipping.");
            return Ok(());
        };

        // Every service is a target when starting the whole topology.
        let is_target = match target {
            Some(target) => *target == id,
            None => true,
        };
        let forced = if is_target {
            options.force_recreate()
        } else {
            options.always_recreate_deps()
        };
        let scale = self.desired_scale(service, options);

        let span = debug_span!("start", service = %id, scale);
        async {
            if !options.no_deps() {
                for dependency in service.dependencies().iter().filter(|dep| plan.contains(dep)) {
                    self.ensure_running(dependency, options).await?;
                }
            }

            self.converge(service, scale, forced, options).await
        }
        .instrument(span)
        .await
    }

    async fn ensure_running(&self, dependency: &ServiceId, options: &OptionSet) -> Result<(), StepError> {
        let Some(service) = self.topology.get(dependency) else {
            return Ok(());
        };

        for index in 1..=self.desired_scale(service, options) {
            let instance = InstanceId::new(dependency.clone(), index);
            let status = self.inspect(&instance).await?;
            if status.state != InstanceState::Running {
                return Err(StepError::DependencyUnavailable {
                    dependency: dependency.clone(),
                    instance,
                    state: status.state,
                });
            }
        }
        Ok(())
    }

    /// Ensures exactly `scale` instances of `service` exist and are running.
    async fn converge(
        &self, service: &Service, scale: usize, forced: bool, options: &OptionSet,
    ) -> Result<(), StepError> {
        for surplus in self
            .instances_of(service.id())
            .await?
            .into_iter()
            .filter(|i| i.index() > scale)
        {
            debug!(instance = %surplus, "Scaling down.");
            let status = self.inspect_settled(&surplus).await?;
            self.retire(&surplus, status.state, false).await?;
        }

        let mut needs_create = false;
        let mut to_start = Vec::new();
        for index in 1..=scale {
            let instance = InstanceId::new(service.id().clone(), index);
            let status = self.inspect_settled(&instance).await?;

            if status.state == InstanceState::Absent {
                needs_create = true;
                to_start.push(instance);
            } else if should_recreate(service, &status, forced, options) {
                debug!(%instance, state = %status.state, "Recreating instance.");
                self.retire(&instance, status.state, false).await?;
                needs_create = true;
                to_start.push(instance);
            } else if status.state != InstanceState::Running {
                to_start.push(instance);
            }
        }

        if needs_create {
            let created = self
                .call(
                    RuntimeOperation::Create,
                    service.id(),
                    self.runtime.create(service, scale, options),
                )
                .await?;
            debug!(created = created.len(), "Created instances.");
        }

        for instance in &to_start {
            self.call(RuntimeOperation::Start, instance, self.runtime.start(instance))
                .await?;
            info!(%instance, "Started instance.");
        }

        Ok(())
    }

    /// Brings one plan entry down.
    pub(super) async fn stop_entry(&self, id: ServiceId, options: &OptionSet) -> Result<(), StepError> {
        let Some(service) = self.topology.get(&id) else {
            debug!(service = %id, "Service is not part of the topology. Skipping.");
            return Ok(());
        };

        let remove = options.volumes()
            || options.rmi() != ImageRemoval::None
            || service.recreate_policy() != RecreatePolicy::Never;

        let span = debug_span!("stop", service = %id, remove);
        async {
            for instance in self.instances_of(service.id()).await? {
                let status = self.inspect_settled(&instance).await?;
                if status.state == InstanceState::Absent {
                    continue;
                }

                if status.state == InstanceState::Running {
                    self.call(RuntimeOperation::Stop, &instance, self.runtime.stop(&instance))
                        .await?;
                    info!(%instance, "Stopped instance.");
                }

                if remove {
                    self.call(
                        RuntimeOperation::Remove,
                        &instance,
                        self.runtime.remove(&instance, options.volumes()),
                    )
                    .await?;
                    info!(%instance, volumes = options.volumes(), "Removed instance.");
                }
            }

            if options.rmi() != ImageRemoval::None {
                self.call(
                    RuntimeOperation::RemoveImages,
                    service.id(),
                    self.runtime.remove_images(service.id(), options.rmi()),
                )
                .await?;
                info!(policy = %options.rmi(), "Removed images.");
            }

            Ok::<_, StepError>(())
        }
        .instrument(span)
        .await
    }

    /// Stops and removes every instance whose service is not part of the topology.
    pub(super) async fn remove_orphans(&self, options: &OptionSet) -> Result<(), RuntimeCallError> {
        let instances = self
            .call(RuntimeOperation::Instances, "runtime", self.runtime.instances())
            .await?;

        for orphan in instances.iter().filter(|i| !self.topology.contains(i.service())) {
            let status = self.inspect_settled(orphan).await?;
            self.retire(orphan, status.state, options.volumes()).await?;
            info!(instance = %orphan, "Removed orphan instance.");
        }
        Ok(())
    }
}

/// Decides whether an existing instance is recreated when its service is started.
fn should_recreate(service: &Service, status: &InstanceStatus, forced: bool, options: &OptionSet) -> bool {
    if forced {
        return true;
    }
    if options.no_recreate() {
        return false;
    }

    match service.recreate_policy() {
        RecreatePolicy::Always => true,
        RecreatePolicy::IfChanged => status.fingerprint.as_deref() != Some(service.fingerprint()),
        RecreatePolicy::Never => false,
    }
}
