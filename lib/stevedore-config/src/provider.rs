use std::path::{Path, PathBuf};

use figment::{
    providers::{Data, Yaml},
    value::{Dict, Map},
    Metadata, Profile, Provider,
};
use stevedore_error::{generic_error, ErrorContext as _, GenericError};

/// YAML configuration, read and parsed as soon as it is added to a loader.
///
/// A missing or malformed file fails at the call that names it, rather than during extraction.
pub struct EagerYaml {
    path: PathBuf,
    data: Map<Profile, Dict>,
}

impl EagerYaml {
    /// Reads and parses the YAML file at `path`.
    pub fn read<P>(path: P) -> Result<Self, GenericError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path).error_context("Failed to read file.")?;
        let data = Data::<Yaml>::string(&raw)
            .data()
            .map_err(|e| generic_error!("Invalid YAML: {}", e))?;

        Ok(Self { path, data })
    }
}

impl Provider for EagerYaml {
    fn metadata(&self) -> Metadata {
        Metadata::from("YAML file", self.path.as_path())
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Ok(self.data.clone())
    }
}
