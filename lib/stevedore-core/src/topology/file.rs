use indexmap::IndexMap;
use serde::Deserialize;

use super::ServiceDefinition;

/// On-disk topology document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct TopologyFile {
    #[serde(default)]
    services: IndexMap<String, ServiceDefinition>,
}

impl TopologyFile {
    /// Consumes the document, returning the service definitions in declaration order.
    pub(super) fn into_definitions(self) -> Vec<ServiceDefinition> {
        self.services
            .into_iter()
            .map(|(id, mut definition)| {
                definition.id = id;
                definition
            })
            .collect()
    }
}
