use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FormatError;

/// A peer address of the form `[node@]domain[/resource]`.
///
/// "Bare" means node + domain without a resource; "full" carries all
/// three parts. Values are immutable after construction; derive new
/// ones via [`Address::without_resource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    domain: String,
    node: Option<String>,
    resource: Option<String>,
}

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:([^@/]+)@)?([^@/]+)(?:/(.+))?$").expect("address pattern must compile")
    })
}

impl Address {
    pub fn new(
        domain: impl Into<String>,
        node: Option<String>,
        resource: Option<String>,
    ) -> Result<Self, FormatError> {
        let domain = domain.into();
        if domain.is_empty() {
            return Err(FormatError::EmptyDomain);
        }
        Ok(Self {
            domain,
            node: node.filter(|n| !n.is_empty()),
            resource: resource.filter(|r| !r.is_empty()),
        })
    }

    /// Parse from wire form. Empty captured groups become absent parts.
    pub fn parse(raw: &str) -> Result<Self, FormatError> {
        let captures = address_pattern()
            .captures(raw)
            .ok_or_else(|| FormatError::BadAddress(raw.to_string()))?;

        let node = captures.get(1).map(|m| m.as_str().to_string());
        let domain = captures
            .get(2)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| FormatError::BadAddress(raw.to_string()))?;
        let resource = captures.get(3).map(|m| m.as_str().to_string());

        Self::new(domain, node, resource)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Node + domain, no resource.
    pub fn is_bare(&self) -> bool {
        self.node.is_some() && self.resource.is_none()
    }

    /// All three parts present.
    pub fn is_full(&self) -> bool {
        self.node.is_some() && self.resource.is_some()
    }

    /// A new address with the resource stripped.
    pub fn without_resource(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            node: self.node.clone(),
            resource: None,
        }
    }

    /// A new address carrying `resource`.
    pub fn with_resource(&self, resource: impl Into<String>) -> Self {
        Self {
            domain: self.domain.clone(),
            node: self.node.clone(),
            resource: Some(resource.into()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}
