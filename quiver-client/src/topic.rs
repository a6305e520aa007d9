//! Topic addressing

use crate::error::ClientError;
use crate::protocol::MAX_STRING_LEN;
use std::fmt;
use std::str::FromStr;

const DEFAULT_TENANT: &str = "public";
const DEFAULT_NAMESPACE: &str = "default";

/// Storage domain of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicDomain {
    Persistent,
    NonPersistent,
}

impl TopicDomain {
    fn as_str(self) -> &'static str {
        match self {
            TopicDomain::Persistent => "persistent",
            TopicDomain::NonPersistent => "non-persistent",
        }
    }
}

/// Fully qualified `<domain>://<tenant>/<namespace>/<topic>` name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    domain: TopicDomain,
    tenant: String,
    namespace: String,
    local_name: String,
}

impl TopicName {
    /// Parse a topic address. A bare name expands to `persistent://public/default/<name>`.
    pub fn parse(topic: &str) -> Result<Self, ClientError> {
        let name = Self::parse_parts(topic)?;
        let len = name.to_string().len();
        if len > MAX_STRING_LEN {
            return Err(ClientError::InvalidTopic {
                topic: format!("{}...", name.local_name.chars().take(32).collect::<String>()),
                reason: format!("{} bytes exceeds the limit of {}", len, MAX_STRING_LEN),
            });
        }
        Ok(name)
    }

    fn parse_parts(topic: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidTopic {
            topic: topic.to_string(),
            reason: reason.to_string(),
        };

        let (domain, path) = match topic.split_once("://") {
            Some(("persistent", path)) => (TopicDomain::Persistent, path),
            Some(("non-persistent", path)) => (TopicDomain::NonPersistent, path),
            Some((other, _)) => return Err(invalid(&format!("unknown domain '{}'", other))),
            None if topic.contains('/') => {
                return Err(invalid("short names may not contain '/'"));
            }
            None => {
                if topic.trim().is_empty() {
                    return Err(invalid("empty topic name"));
                }
                return Ok(Self {
                    domain: TopicDomain::Persistent,
                    tenant: DEFAULT_TENANT.to_string(),
                    namespace: DEFAULT_NAMESPACE.to_string(),
                    local_name: topic.to_string(),
                });
            }
        };

        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() != 3 {
            return Err(invalid("expected <tenant>/<namespace>/<topic>"));
        }
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("empty path segment"));
        }

        Ok(Self {
            domain,
            tenant: segments[0].to_string(),
            namespace: segments[1].to_string(),
            local_name: segments[2].to_string(),
        })
    }

    pub fn domain(&self) -> TopicDomain {
        self.domain
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}",
            self.domain.as_str(),
            self.tenant,
            self.namespace,
            self.local_name
        )
    }
}

impl FromStr for TopicName {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
