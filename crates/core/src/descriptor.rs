//! Job descriptors: the reference a caller hands in when submitting a batch job.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DomainError, DomainResult};

/// A validated reference to the input of a remote batch job.
///
/// The remote service pulls its input from a URL, so a descriptor must be an
/// absolute `http`/`https` URL with a host. Descriptors are immutable values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobDescriptor(Url);

impl JobDescriptor {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DomainError::validation("job descriptor must not be empty"));
        }

        let url = Url::parse(raw)
            .map_err(|e| DomainError::validation(format!("job descriptor is not a URL: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(DomainError::validation(format!(
                "job descriptor must use http or https, got {:?}",
                url.scheme()
            )));
        }

        match url.host_str() {
            Some(host) if !host.is_empty() => Ok(Self(url)),
            _ => Err(DomainError::validation("job descriptor must name a host")),
        }
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl core::fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for JobDescriptor {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobDescriptor {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JobDescriptor> for String {
    fn from(value: JobDescriptor) -> Self {
        value.0.into()
    }
}
