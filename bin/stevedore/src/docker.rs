use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    container::{Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions},
    errors::Error,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{ContainerStateStatusEnum, HostConfig, Ipam},
    network::CreateNetworkOptions,
    Docker,
};
use futures::StreamExt as _;
use stevedore_core::{
    options::{ImageRemoval, OptionSet},
    runtime::{ExecRequest, InstanceState, InstanceStatus, RuntimeAdapter, RuntimeError},
    topology::{InstanceId, Service, ServiceId, Topology},
};
use stevedore_error::{generic_error, ErrorContext as _, GenericError};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, trace};

const LABEL_CREATED_BY: &str = "created_by";
const LABEL_PROJECT: &str = "stevedore.project";
const LABEL_SERVICE: &str = "stevedore.service";
const LABEL_INDEX: &str = "stevedore.index";
const LABEL_FINGERPRINT: &str = "stevedore.fingerprint";

/// A runtime backed by the Docker Engine API.
///
/// Every container belongs to a project: it is named `<project>-<service>-<index>`, labeled with its project, service,
/// index and definition fingerprint, and attached to a bridge network named after the project. Only containers carrying
/// the project label are ever listed.
pub struct DockerRuntime {
    docker: Docker,
    project: String,
    images: HashMap<ServiceId, String>,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// The image of every service in `topology` is remembered so it can be removed on request, even by a process that
    /// never created its containers.
    ///
    /// # Errors
    ///
    /// If the Docker client cannot be created/configured, an error will be returned.
    pub fn connect(project: String, topology: &Topology) -> Result<Self, GenericError> {
        let docker = Docker::connect_with_defaults().error_context("Failed to connect to the Docker daemon.")?;
        let images = topology
            .services()
            .filter_map(|service| {
                let image = service.definition().image.clone()?;
                Some((service.id().clone(), image))
            })
            .collect();

        Ok(Self {
            docker,
            project,
            images,
        })
    }

    fn container_name(&self, instance: &InstanceId) -> String {
        container_name(&self.project, instance)
    }

    fn labels(&self, instance: &InstanceId, fingerprint: &str) -> HashMap<String, String> {
        let mut labels = self.project_labels();
        labels.insert(LABEL_SERVICE.to_string(), instance.service().to_string());
        labels.insert(LABEL_INDEX.to_string(), instance.index().to_string());
        labels.insert(LABEL_FINGERPRINT.to_string(), fingerprint.to_string());
        labels
    }

    fn project_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_CREATED_BY.to_string(), "stevedore".to_string());
        labels.insert(LABEL_PROJECT.to_string(), self.project.clone());
        labels
    }

    async fn create_network_if_missing(&self) -> Result<(), GenericError> {
        let networks = self.docker.list_networks::<String>(None).await?;
        if networks
            .iter()
            .any(|network| network.name.as_deref() == Some(self.project.as_str()))
        {
            trace!("Network '{}' already exists.", self.project);
            return Ok(());
        }

        let network_options = CreateNetworkOptions {
            name: self.project.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            ipam: Ipam::default(),
            enable_ipv6: false,
            labels: self.project_labels(),
            ..Default::default()
        };
        let response = self.docker.create_network(network_options).await?;
        debug!("Created network '{}' (ID: {:?}).", self.project, response.id);

        Ok(())
    }

    async fn create_image_if_missing(&self, image: &str) -> Result<(), GenericError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        debug!("Pulling image '{}'...", image);
        let image_options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut create_stream = self.docker.create_image(Some(image_options), None, None);
        while let Some(info) = create_stream.next().await {
            let info = info.with_error_context(|| format!("Failed to pull image '{}'.", image))?;
            trace!(image, "Received image pull update: {:?}", info);
        }

        Ok(())
    }

    async fn create_container(&self, service: &Service, instance: &InstanceId, image: &str) -> Result<(), GenericError> {
        let definition = service.definition();
        let non_empty = |values: &Vec<String>| (!values.is_empty()).then(|| values.clone());

        let container_config = Config {
            hostname: Some(format!("{}-{}", instance.service(), instance.index())),
            env: non_empty(&definition.environment),
            image: Some(image.to_string()),
            entrypoint: non_empty(&definition.entrypoint),
            cmd: non_empty(&definition.command),
            host_config: Some(HostConfig {
                binds: non_empty(&definition.volumes),
                network_mode: Some(self.project.clone()),
                ..Default::default()
            }),
            labels: Some(self.labels(instance, service.fingerprint())),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: self.container_name(instance),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(create_options), container_config)
            .await?;
        debug!("Created container '{}' (ID: {}).", self.container_name(instance), response.id);

        Ok(())
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    async fn create(
        &self, service: &Service, scale: usize, options: &OptionSet,
    ) -> Result<Vec<InstanceId>, RuntimeError> {
        let image = service
            .definition()
            .image
            .as_deref()
            .ok_or_else(|| generic_error!("Service '{}' does not declare an image.", service.id()))?;

        if options.build() {
            debug!(service = %service.id(), "Images are never built locally. Pulling instead.");
        }

        self.create_network_if_missing().await?;
        self.create_image_if_missing(image).await?;

        let existing = self.instances().await?;
        let mut created = Vec::new();
        for index in 1..=scale {
            let instance = InstanceId::new(service.id().clone(), index);
            if existing.contains(&instance) {
                continue;
            }

            self.create_container(service, &instance, image)
                .await
                .with_error_context(|| format!("Failed to create container for instance '{}'.", instance))?;
            created.push(instance);
        }

        Ok(created)
    }

    async fn start(&self, instance: &InstanceId) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(&self.container_name(instance), None)
            .await?;
        Ok(())
    }

    async fn stop(&self, instance: &InstanceId) -> Result<(), RuntimeError> {
        self.docker.stop_container(&self.container_name(instance), None).await?;
        Ok(())
    }

    async fn remove(&self, instance: &InstanceId, remove_volumes: bool) -> Result<(), RuntimeError> {
        let remove_options = RemoveContainerOptions {
            v: remove_volumes,
            ..Default::default()
        };
        self.docker
            .remove_container(&self.container_name(instance), Some(remove_options))
            .await?;
        Ok(())
    }

    async fn inspect(&self, instance: &InstanceId) -> Result<InstanceStatus, RuntimeError> {
        let response = match self.docker.inspect_container(&self.container_name(instance), None).await {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => return Ok(InstanceStatus::absent()),
            Err(e) => return Err(e.into()),
        };

        let status = response.state.and_then(|state| state.status);
        let fingerprint = response
            .config
            .and_then(|config| config.labels)
            .and_then(|mut labels| labels.remove(LABEL_FINGERPRINT));

        Ok(InstanceStatus {
            state: map_container_state(status),
            fingerprint,
        })
    }

    async fn instances(&self) -> Result<Vec<InstanceId>, RuntimeError> {
        let project_label = format!("{}={}", LABEL_PROJECT, self.project);
        let list_options = ListContainersOptions {
            all: true,
            filters: vec![("label".to_string(), vec![project_label])].into_iter().collect(),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(list_options))
            .await
            .with_error_context(|| format!("Failed to list containers of project '{}'.", self.project))?;

        let mut instances = containers
            .into_iter()
            .filter_map(|container| {
                let instance = container.labels.as_ref().and_then(instance_from_labels);
                if instance.is_none() {
                    debug!(id = ?container.id, "Listed container has no valid instance labels. Skipping.");
                }
                instance
            })
            .collect::<Vec<_>>();
        instances.sort();

        Ok(instances)
    }

    async fn remove_images(&self, service: &ServiceId, policy: ImageRemoval) -> Result<(), RuntimeError> {
        if policy != ImageRemoval::All {
            debug!(%service, %policy, "No locally built images to remove.");
            return Ok(());
        }

        let Some(image) = self.images.get(service) else {
            debug!(%service, "Service does not declare an image. Nothing to remove.");
            return Ok(());
        };

        match self.docker.remove_image(image, None, None).await {
            Ok(_) => debug!(%service, image, "Removed image."),
            Err(e) if is_not_found(&e) => trace!(%service, image, "Image already removed."),
            Err(e) => return Err(e).with_error_context(|| format!("Failed to remove image '{}'.", image)),
        }

        Ok(())
    }

    async fn exec(&self, instance: &InstanceId, request: &ExecRequest) -> Result<i64, RuntimeError> {
        let exec_options = CreateExecOptions {
            cmd: Some(request.command.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            privileged: Some(request.privileged),
            working_dir: request.workdir.clone(),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&self.container_name(instance), exec_options)
            .await?;

        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdErr { message } => stderr.write_all(&message).await?,
                    other => stdout.write_all(&other.into_bytes()).await?,
                }
            }
            stdout.flush().await?;
            stderr.flush().await?;
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        inspected
            .exit_code
            .ok_or_else(|| generic_error!("Command in instance '{}' did not report an exit code.", instance))
    }
}

fn container_name(project: &str, instance: &InstanceId) -> String {
    format!("{}-{}-{}", project, instance.service(), instance.index())
}

fn is_not_found(e: &Error) -> bool {
    matches!(e, Error::DockerResponseServerError { status_code: 404, .. })
}

/// Maps a Docker container status onto an instance state.
///
/// A container that was created but never started reports `Stopped`, as does a dead one.
fn map_container_state(status: Option<ContainerStateStatusEnum>) -> InstanceState {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::PAUSED) => InstanceState::Running,
        Some(ContainerStateStatusEnum::RESTARTING) => InstanceState::Starting,
        Some(ContainerStateStatusEnum::REMOVING) => InstanceState::Removing,
        Some(ContainerStateStatusEnum::CREATED)
        | Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD)
        | Some(ContainerStateStatusEnum::EMPTY)
        | None => InstanceState::Stopped,
    }
}

fn instance_from_labels(labels: &HashMap<String, String>) -> Option<InstanceId> {
    let service = ServiceId::try_from(labels.get(LABEL_SERVICE)?.as_str()).ok()?;
    let index = labels.get(LABEL_INDEX)?.parse::<usize>().ok()?;
    (index > 0).then(|| InstanceId::new(service, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn container_names() {
        let instance = InstanceId::new(ServiceId::try_from("api").unwrap(), 2);
        assert_eq!(container_name("shop", &instance), "shop-api-2");
    }

    #[test]
    fn container_states() {
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::RUNNING)),
            InstanceState::Running
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::CREATED)),
            InstanceState::Stopped
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::EXITED)),
            InstanceState::Stopped
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::RESTARTING)),
            InstanceState::Starting
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::REMOVING)),
            InstanceState::Removing
        );
        assert_eq!(map_container_state(None), InstanceState::Stopped);
    }

    #[test]
    fn instances_from_labels() {
        let valid = labels(&[(LABEL_SERVICE, "db"), (LABEL_INDEX, "3")]);
        assert_eq!(
            instance_from_labels(&valid),
            Some(InstanceId::new(ServiceId::try_from("db").unwrap(), 3))
        );

        assert_eq!(instance_from_labels(&labels(&[(LABEL_SERVICE, "db")])), None);
        assert_eq!(
            instance_from_labels(&labels(&[(LABEL_SERVICE, "db"), (LABEL_INDEX, "0")])),
            None
        );
        assert_eq!(
            instance_from_labels(&labels(&[(LABEL_SERVICE, "-db"), (LABEL_INDEX, "1")])),
            None
        );
    }
}
