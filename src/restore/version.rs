//! Manager versions that produce snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RestoreError, Result};

/// A `major.minor.patch` manager version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ManagerVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

impl ManagerVersion {
    /// Oldest version whose snapshots can be restored.
    pub const OLDEST: Self = Self::new(4, 0, 0);
    /// Version of this manager.
    pub const CURRENT: Self = Self::new(5, 1, 0);

    /// Secret values are encrypted and may be hidden from this version on.
    pub const HIDDEN_SECRETS: Self = Self::new(4, 4, 0);
    /// Agents carry broker settings from this version on.
    pub const AGENT_BROKERS: Self = Self::new(4, 5, 0);
    /// Blueprint import links exist after this version.
    pub const LAST_WITHOUT_BLUEPRINT_IMPORTS: Self = Self::new(4, 5, 0);
    /// Deployments carry `runtime_only_evaluation` from this version on.
    pub const RUNTIME_ONLY_EVALUATION: Self = Self::new(5, 0, 0);
    /// Executions carry tokens, node instances indexes, and dependencies are
    /// tracked from this version on.
    pub const EXECUTION_TOKENS: Self = Self::new(5, 0, 5);

    /// Creates a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Returns true if snapshots of this version can be restored here.
    #[must_use]
    pub fn is_supported(self) -> bool {
        (Self::OLDEST..=Self::CURRENT).contains(&self)
    }

    /// Fails unless snapshots of this version can be restored here.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedVersion` outside the supported range.
    pub fn ensure_supported(self) -> Result<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(RestoreError::UnsupportedVersion {
                version: self.to_string(),
                oldest: Self::OLDEST.to_string(),
                current: Self::CURRENT.to_string(),
            }
            .into())
        }
    }
}

impl FromStr for ManagerVersion {
    type Err = String;

    /// Parses `4.5`, `5.0.5` or `5.1.0-rc1`; a missing patch is zero and
    /// a pre-release suffix is ignored.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let core = s.trim().split(['-', '+']).next().unwrap_or_default();
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(format!("invalid version '{s}'"));
        }
        let number = |part: &str| {
            part.parse::<u32>()
                .map_err(|_| format!("invalid version '{s}'"))
        };
        Ok(Self::new(
            number(parts[0])?,
            number(parts[1])?,
            parts.get(2).map_or(Ok(0), |p| number(p))?,
        ))
    }
}

impl TryFrom<String> for ManagerVersion {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ManagerVersion> for String {
    fn from(version: ManagerVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for ManagerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("4.5".parse::<ManagerVersion>().unwrap(), ManagerVersion::new(4, 5, 0));
        assert_eq!(
            "5.0.5".parse::<ManagerVersion>().unwrap(),
            ManagerVersion::EXECUTION_TOKENS
        );
        assert_eq!(
            "5.1.0-rc1".parse::<ManagerVersion>().unwrap(),
            ManagerVersion::CURRENT
        );
        assert!("5".parse::<ManagerVersion>().is_err());
        assert!("5.x".parse::<ManagerVersion>().is_err());
    }

    #[test]
    fn test_ordering_and_support() {
        assert!(ManagerVersion::new(4, 3, 9) < ManagerVersion::HIDDEN_SECRETS);
        assert!(ManagerVersion::new(4, 10, 0) > ManagerVersion::new(4, 9, 0));
        assert!(ManagerVersion::OLDEST.is_supported());
        assert!(ManagerVersion::CURRENT.is_supported());
        assert!(!ManagerVersion::new(3, 4, 2).is_supported());

        let err = ManagerVersion::new(6, 0, 0).ensure_supported().unwrap_err();
        assert!(err.to_string().contains("6.0.0"));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&ManagerVersion::new(4, 4, 0)).unwrap();
        assert_eq!(json, "\"4.4.0\"");
        let back: ManagerVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ManagerVersion::HIDDEN_SECRETS);
    }
}
