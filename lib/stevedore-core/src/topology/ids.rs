use std::{borrow::Borrow, borrow::Cow, fmt, ops::Deref};

use serde::{Deserialize, Serialize};

const INVALID_SERVICE_ID: &str =
    "service IDs must start with an alphanumeric (a-z, A-Z, or 0-9) and may only contain alphanumerics, underscores, hyphens, and periods";

/// A service identifier.
#[derive(Clone, Debug, Hash, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(Cow<'static, str>);

impl ServiceId {
    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl TryFrom<&str> for ServiceId {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if validate_service_id(value) {
            Ok(Self(value.to_string().into()))
        } else {
            Err(INVALID_SERVICE_ID)
        }
    }
}

impl TryFrom<String> for ServiceId {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if validate_service_id(&value) {
            Ok(Self(value.into()))
        } else {
            Err(INVALID_SERVICE_ID)
        }
    }
}

impl From<ServiceId> for String {
    fn from(value: ServiceId) -> Self {
        value.0.into_owned()
    }
}

impl Deref for ServiceId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Borrow<str> for ServiceId {
    fn borrow(&self) -> &str {
        self.0.as_ref()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq<str> for ServiceId {
    fn eq(&self, other: &str) -> bool {
        self.0.as_ref() == other
    }
}

impl PartialEq<&str> for ServiceId {
    fn eq(&self, other: &&str) -> bool {
        self.0.as_ref() == *other
    }
}

const fn validate_service_id(id: &str) -> bool {
    let id_bytes = id.as_bytes();
    if id_bytes.is_empty() || !id_bytes[0].is_ascii_alphanumeric() {
        return false;
    }

    let mut idx = 1;
    while idx < id_bytes.len() {
        let b = id_bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.') {
            return false;
        }
        idx += 1;
    }

    true
}

/// A service instance (replica) identifier.
///
/// Replica indexes are 1-based: a service at scale 3 has instances 1, 2, and 3.
#[derive(Clone, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub struct InstanceId {
    service: ServiceId,
    index: usize,
}

impl InstanceId {
    /// Creates a new `InstanceId`.
    pub fn new(service: ServiceId, index: usize) -> Self {
        Self { service, index }
    }

    /// Returns the service this instance belongs to.
    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    /// Returns the replica index of this instance.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.service, self.index)
    }
}
