//! Resource identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

const ROOT_KIND: &str = "stackform:index:Stack";

/// Identifies one declaration within a run.
///
/// Built from the resource kind and its namespaced name, so the same logical
/// name may be reused under different parents or for different kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates the id for a resource of `kind` at `qualified_name`.
    #[must_use]
    pub fn new(kind: &str, qualified_name: &str) -> Self {
        Self(format!("{kind}::{qualified_name}"))
    }

    /// Creates the id of the synthetic root for `stack`.
    #[must_use]
    pub fn root(stack: &str) -> Self {
        Self::new(ROOT_KIND, stack)
    }

    /// Returns the kind used for stack roots.
    #[must_use]
    pub fn root_kind() -> &'static str {
        ROOT_KIND
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl AsRef<ResourceId> for ResourceId {
    fn as_ref(&self) -> &ResourceId {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_includes_kind_and_name() {
        let id = ResourceId::new("aws:ec2:SecurityGroup", "service/web-sg");
        assert_eq!(id.as_str(), "aws:ec2:SecurityGroup::service/web-sg");
        assert_eq!(id.to_string(), id.as_str());
    }

    #[test]
    fn test_root_id() {
        let root = ResourceId::root("dev");
        assert!(root.as_str().starts_with(ResourceId::root_kind()));
        assert!(root.as_str().ends_with("::dev"));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = ResourceId::from("a");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""a""#);
    }
}
