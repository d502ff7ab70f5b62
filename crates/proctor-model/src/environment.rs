//! Promotion stages

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered promotion stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Trunk, the only editable stage
    #[serde(alias = "trunk")]
    Working,
    /// QA
    Qa,
    /// Production
    Production,
}

impl Environment {
    /// All environments in promotion order
    pub const ALL: [Self; 3] = [Self::Working, Self::Qa, Self::Production];

    /// Branch name used in URLs and commit messages
    #[inline]
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Working => "trunk",
            Self::Qa => "qa",
            Self::Production => "production",
        }
    }

    /// Whether `self -> destination` is one of the legal promotion edges
    #[inline]
    #[must_use]
    pub fn can_promote_to(self, destination: Self) -> bool {
        matches!(
            (self, destination),
            (Self::Working, Self::Qa)
                | (Self::Working, Self::Production)
                | (Self::Qa, Self::Production)
        )
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Environment {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trunk" | "working" => Ok(Self::Working),
            "qa" => Ok(Self::Qa),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ModelError::UnknownEnvironment(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_edges_only() {
        assert!(Environment::Working.can_promote_to(Environment::Qa));
        assert!(Environment::Working.can_promote_to(Environment::Production));
        assert!(Environment::Qa.can_promote_to(Environment::Production));

        assert!(!Environment::Qa.can_promote_to(Environment::Working));
        assert!(!Environment::Production.can_promote_to(Environment::Qa));
        assert!(!Environment::Qa.can_promote_to(Environment::Qa));
    }

    #[test]
    fn parse_names() {
        assert_eq!("trunk".parse::<Environment>().unwrap(), Environment::Working);
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Production);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn ordered_by_stage() {
        assert!(Environment::Working < Environment::Qa);
        assert!(Environment::Qa < Environment::Production);
    }
}
