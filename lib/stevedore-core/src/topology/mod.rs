//! Service topology.
//!
//! A [`Topology`] is the validated, immutable set of services an orchestrator acts on. It is built from a list of
//! [`ServiceDefinition`]s, either directly or by reading a YAML topology file, and rejects invalid identifiers,
//! duplicate services, dangling dependencies and dependency cycles up front.

use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Sha3_256};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

use crate::{
    options::OptionSet,
    resolver::{self, CycleError, Direction, PlanError},
};

mod file;
use self::file::TopologyFile;

mod ids;
pub use self::ids::{InstanceId, ServiceId};

/// Topology errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TopologyError {
    /// A service or dependency identifier is not valid.
    #[snafu(display("invalid service ID '{}': {}", input, reason))]
    InvalidServiceId {
        /// The identifier as given.
        input: String,

        /// Why the identifier was rejected.
        reason: &'static str,
    },

    /// Two definitions share an identifier.
    #[snafu(display("duplicate service ID '{}'", service))]
    DuplicateServiceId {
        /// The repeated identifier.
        service: ServiceId,
    },

    /// A definition depends on a service that does not exist.
    #[snafu(display("service '{}' depends on nonexistent service '{}'", service, dependency))]
    UnknownDependency {
        /// The dependent service.
        service: ServiceId,

        /// The missing dependency.
        dependency: ServiceId,
    },

    /// A definition asks for zero instances.
    #[snafu(display("service '{}' must have a scale of at least 1", service))]
    InvalidScale {
        /// The offending service.
        service: ServiceId,
    },

    /// The dependency relation is not acyclic.
    #[snafu(display("invalid topology: {}", source))]
    Cycle {
        /// The detected cycle.
        source: CycleError,
    },

    /// A definition could not be encoded for fingerprinting.
    #[snafu(display("failed to encode definition of service '{}': {}", service, source))]
    Encode {
        /// The service being fingerprinted.
        service: ServiceId,

        /// Error source.
        source: serde_json::Error,
    },

    /// The topology file could not be read.
    #[snafu(display("failed to read topology file '{}': {}", path.display(), source))]
    Read {
        /// Path to the topology file.
        path: PathBuf,

        /// Error source.
        source: std::io::Error,
    },

    /// The topology file is not a valid topology document.
    #[snafu(display("failed to parse topology file '{}': {}", path.display(), source))]
    Parse {
        /// Path to the topology file.
        path: PathBuf,

        /// Error source.
        source: serde_yaml::Error,
    },
}

/// Whether existing instances of a service are recreated when it is started again.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecreatePolicy {
    /// Always recreate existing instances.
    Always,

    /// Recreate existing instances when the definition changed since they were created.
    #[default]
    IfChanged,

    /// Never recreate existing instances, and keep stopped instances around for reuse.
    Never,
}

/// A service, as declared.
///
/// Definitions are unvalidated: identifiers and dependencies are plain strings until the definition is loaded into a
/// [`Topology`].
///
/// `image`, `entrypoint`, `command`, `environment` and `volumes` are only meaningful to runtime adapters. The orchestrator
/// only looks at them through the definition fingerprint.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    /// Service identifier.
    #[serde(skip)]
    pub id: String,

    /// Services this service depends on, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Number of instances to run when no scale override is given.
    #[serde(default = "default_scale")]
    pub scale: usize,

    /// Recreate policy.
    #[serde(default)]
    pub recreate: RecreatePolicy,

    /// Container image reference.
    #[serde(default)]
    pub image: Option<String>,

    /// Entrypoint override.
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Command override.
    #[serde(default)]
    pub command: Vec<String>,

    /// Environment variables, as `KEY=VALUE`.
    #[serde(default)]
    pub environment: Vec<String>,

    /// Bind mounts, as `host:container`.
    #[serde(default)]
    pub volumes: Vec<String>,
}

const fn default_scale() -> usize {
    1
}

impl ServiceDefinition {
    /// Creates a new `ServiceDefinition` with no dependencies, a scale of 1 and the default recreate policy.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            scale: default_scale(),
            recreate: RecreatePolicy::default(),
            image: None,
            entrypoint: Vec::new(),
            command: Vec::new(),
            environment: Vec::new(),
            volumes: Vec::new(),
        }
    }

    /// Adds dependencies.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Sets the default scale.
    pub fn with_scale(mut self, scale: usize) -> Self {
        self.scale = scale;
        self
    }

    /// Sets the recreate policy.
    pub fn with_recreate_policy(mut self, recreate: RecreatePolicy) -> Self {
        self.recreate = recreate;
        self
    }

    /// Sets the container image.
    pub fn with_image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Sets the command.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    fn fingerprint(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct RuntimeHints<'a> {
            image: &'a Option<String>,
            entrypoint: &'a [String],
            command: &'a [String],
            environment: &'a [String],
            volumes: &'a [String],
        }

        let encoded = serde_json::to_vec(&RuntimeHints {
            image: &self.image,
            entrypoint: &self.entrypoint,
            command: &self.command,
            environment: &self.environment,
            volumes: &self.volumes,
        })?;

        let digest = Sha3_256::digest(&encoded);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

/// A validated service.
#[derive(Clone, Debug)]
pub struct Service {
    id: ServiceId,
    depends_on: Vec<ServiceId>,
    fingerprint: String,
    definition: ServiceDefinition,
}

impl Service {
    /// Returns the service identifier.
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// Returns the direct dependencies of this service, in declaration order and without duplicates.
    pub fn dependencies(&self) -> &[ServiceId] {
        &self.depends_on
    }

    /// Returns the number of instances run when no scale override applies.
    pub fn default_scale(&self) -> usize {
        self.definition.scale
    }

    /// Returns the recreate policy.
    pub fn recreate_policy(&self) -> RecreatePolicy {
        self.definition.recreate
    }

    /// Returns the definition fingerprint.
    ///
    /// This is the lowercase hex SHA3-256 digest of the canonical JSON encoding of the runtime hints (image,
    /// entrypoint, command, environment and volumes). Runtime adapters store it on every instance they create so that
    /// changed definitions can be detected.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Returns the definition this service was loaded from.
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }
}

/// A validated service topology.
///
/// Services keep their declaration order, which in turn fixes the order of whole-topology operations.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    services: IndexMap<ServiceId, Service>,
}

impl Topology {
    /// Loads a topology from the given definitions.
    ///
    /// # Errors
    ///
    /// If any identifier is invalid, an identifier is declared twice, a dependency does not exist, a scale is zero, or
    /// the dependencies form a cycle, an error is returned.
    pub fn load<I>(definitions: I) -> Result<Self, TopologyError>
    where
        I: IntoIterator<Item = ServiceDefinition>,
    {
        let mut services = IndexMap::new();

        for definition in definitions {
            let id = try_into_service_id(&definition.id)?;
            if services.contains_key(&id) {
                return Err(TopologyError::DuplicateServiceId { service: id });
            }
            if definition.scale == 0 {
                return Err(TopologyError::InvalidScale { service: id });
            }

            let mut depends_on = IndexSet::new();
            for dependency in &definition.depends_on {
                depends_on.insert(try_into_service_id(dependency)?);
            }

            let fingerprint = definition.fingerprint().context(Encode { service: id.clone() })?;

            services.insert(
                id.clone(),
                Service {
                    id,
                    depends_on: depends_on.into_iter().collect(),
                    fingerprint,
                    definition,
                },
            );
        }

        for service in services.values() {
            if let Some(dependency) = service.depends_on.iter().find(|dep| !services.contains_key(*dep)) {
                return Err(TopologyError::UnknownDependency {
                    service: service.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let topology = Self { services };

        let all = topology.services.keys().cloned().collect::<Vec<_>>();
        match resolver::plan(&topology, &all, Direction::Forward) {
            Ok(_) => Ok(topology),
            Err(PlanError::Cycle { source }) => Err(TopologyError::Cycle { source }),
            Err(PlanError::UnknownDependency { service, dependent }) => Err(TopologyError::UnknownDependency {
                service: dependent,
                dependency: service,
            }),
            Err(PlanError::UnknownService { service }) => Err(TopologyError::InvalidServiceId {
                input: service,
                reason: "service is not part of the topology",
            }),
        }
    }

    /// Parses and loads a topology from a YAML document.
    ///
    /// `origin` is only used for error reporting.
    ///
    /// # Errors
    ///
    /// If the document is not a valid topology document, or the topology it describes is invalid, an error is returned.
    pub fn from_yaml_str<P: AsRef<Path>>(raw: &str, origin: P) -> Result<Self, TopologyError> {
        let file: TopologyFile = serde_yaml::from_str(raw).context(Parse {
            path: origin.as_ref().to_path_buf(),
        })?;
        Self::load(file.into_definitions())
    }

    /// Reads and loads a topology from a YAML file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or parsed, or the topology it describes is invalid, an error is returned.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        debug!(file_path = %path.display(), "Loading topology file.");

        let raw = std::fs::read_to_string(path).context(Read { path: path.to_path_buf() })?;
        Self::from_yaml_str(&raw, path)
    }

    /// Returns the service with the given identifier, if it exists.
    pub fn get(&self, id: &str) -> Option<&Service> {
        self.services.get(id)
    }

    /// Returns `true` if a service with the given identifier exists.
    pub fn contains(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    /// Returns an iterator over all services, in declaration order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Returns an iterator over all service identifiers, in declaration order.
    pub fn service_ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.services.keys()
    }

    /// Returns the number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns `true` if the topology has no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl resolver::DependencyGraph for Topology {
    fn service_ids(&self) -> Vec<&ServiceId> {
        self.services.keys().collect()
    }

    fn dependencies(&self, id: &ServiceId) -> Option<&[ServiceId]> {
        self.services.get(id).map(|service| service.depends_on.as_slice())
    }
}

fn try_into_service_id(input: &str) -> Result<ServiceId, TopologyError> {
    ServiceId::try_from(input).map_err(|reason| TopologyError::InvalidServiceId {
        input: input.to_string(),
        reason,
    })
}

/// Location of the active topology file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TopologySource {
    path: PathBuf,
}

impl TopologySource {
    /// File name used when no `file` option is set.
    pub const DEFAULT_FILE_NAME: &'static str = "stevedore.yaml";

    /// Resolves the active topology file from the given options.
    ///
    /// The `file` option wins when set. Relative paths are resolved against `base_dir`.
    pub fn from_options(options: &OptionSet, base_dir: &Path) -> Self {
        let path = options
            .file()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_FILE_NAME));

        let path = if path.is_relative() { base_dir.join(path) } else { path };
        Self { path }
    }

    /// Returns the path of the topology file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the topology from this source.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or parsed, or the topology it describes is invalid, an error is returned.
    pub fn load(&self) -> Result<Topology, TopologyError> {
        Topology::from_yaml_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn ids(topology: &Topology) -> Vec<&str> {
        topology.service_ids().map(|id| id.as_str()).collect()
    }

    #[test]
    fn load_preserves_declaration_order() {
        let topology = Topology::load([
            ServiceDefinition::new("db"),
            ServiceDefinition::new("cache"),
            ServiceDefinition::new("api").with_dependencies(["db", "cache"]),
        ])
        .unwrap();

        assert_eq!(ids(&topology), vec!["db", "cache", "api"]);
        assert_eq!(topology.get("api").unwrap().dependencies(), &["db", "cache"]);
    }

    #[test]
    fn duplicate_dependencies_collapse() {
        let topology = Topology::load([
            ServiceDefinition::new("db"),
            ServiceDefinition::new("cache"),
            ServiceDefinition::new("api").with_dependencies(["cache", "db", "cache"]),
        ])
        .unwrap();

        assert_eq!(topology.get("api").unwrap().dependencies(), &["cache", "db"]);
    }

    #[test]
    fn invalid_service_id() {
        let result = Topology::load([ServiceDefinition::new("bad id")]);
        assert!(matches!(result, Err(TopologyError::InvalidServiceId { ref input, .. }) if input == "bad id"));

        let result = Topology::load([ServiceDefinition::new("api").with_dependencies(["-db"])]);
        assert!(matches!(result, Err(TopologyError::InvalidServiceId { ref input, .. }) if input == "-db"));
    }

    #[test]
    fn duplicate_service_id() {
        let result = Topology::load([ServiceDefinition::new("db"), ServiceDefinition::new("db")]);
        assert!(matches!(result, Err(TopologyError::DuplicateServiceId { ref service }) if service == "db"));
    }

    #[test]
    fn unknown_dependency() {
        let result = Topology::load([ServiceDefinition::new("api").with_dependencies(["db"])]);
        match result {
            Err(TopologyError::UnknownDependency { service, dependency }) => {
                assert_eq!(service, "api");
                assert_eq!(dependency, "db");
            }
            other => panic!("expected unknown dependency, got {:?}", other),
        }
    }

    #[test]
    fn zero_scale() {
        let result = Topology::load([ServiceDefinition::new("db").with_scale(0)]);
        assert!(matches!(result, Err(TopologyError::InvalidScale { .. })));
    }

    #[test]
    fn cycles_are_rejected() {
        let result = Topology::load([
            ServiceDefinition::new("one").with_dependencies(["three"]),
            ServiceDefinition::new("two").with_dependencies(["one"]),
            ServiceDefinition::new("three").with_dependencies(["two"]),
        ]);

        match result {
            Err(TopologyError::Cycle { source }) => {
                assert_eq!(source.path(), &["one", "three", "two", "one"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let result = Topology::load([ServiceDefinition::new("loop").with_dependencies(["loop"])]);

        match result {
            Err(TopologyError::Cycle { source }) => assert_eq!(source.path(), &["loop", "loop"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn fingerprint_tracks_runtime_hints_only() {
        let base = ServiceDefinition::new("web").with_image("nginx:1.25");
        let topology = Topology::load([
            base.clone(),
            ServiceDefinition {
                id: "scaled".to_string(),
                ..base.clone().with_scale(4).with_recreate_policy(RecreatePolicy::Always)
            },
            ServiceDefinition {
                id: "changed".to_string(),
                ..base.clone().with_image("nginx:1.26")
            },
        ])
        .unwrap();

        let web = topology.get("web").unwrap().fingerprint();
        assert_eq!(web.len(), 64);
        assert!(web.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(web, topology.get("scaled").unwrap().fingerprint());
        assert_ne!(web, topology.get("changed").unwrap().fingerprint());
    }

    #[test]
    fn from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"services:\n  db: {}\n  api:\n    depends_on: [db]\n    scale: 3\n")
            .unwrap();

        let topology = Topology::from_yaml_file(file.path()).unwrap();
        assert_eq!(ids(&topology), vec!["db", "api"]);
        assert_eq!(topology.get("api").unwrap().default_scale(), 3);
    }

    #[test]
    fn from_yaml_file_errors() {
        let result = Topology::from_yaml_file("/definitely/not/a/topology.yaml");
        assert!(matches!(result, Err(TopologyError::Read { .. })));

        let result = Topology::from_yaml_str("services: [", "inline.yaml");
        assert!(matches!(result, Err(TopologyError::Parse { ref path, .. }) if path == Path::new("inline.yaml")));
    }

    #[test]
    fn topology_source_resolution() {
        let base = Path::new("/srv/project");

        let source = TopologySource::from_options(&OptionSet::default(), base);
        assert_eq!(source.path(), Path::new("/srv/project/stevedore.yaml"));

        let options = OptionSet::default().with_override("file", "deploy/ci.yaml").unwrap();
        let source = TopologySource::from_options(&options, base);
        assert_eq!(source.path(), Path::new("/srv/project/deploy/ci.yaml"));

        let options = OptionSet::default().with_override("--file", "/etc/stack.yaml").unwrap();
        let source = TopologySource::from_options(&options, base);
        assert_eq!(source.path(), Path::new("/etc/stack.yaml"));
    }
}
