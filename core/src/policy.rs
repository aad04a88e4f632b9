//! Pull policy.

use serde::{Deserialize, Serialize};

use crate::error::ImageError;

/// Decides whether a pull has to contact a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Always pull. Fails when the image is referred to by ID.
    Always,
    /// Pull only if no local image matches.
    Missing,
    /// Never pull. Fails with `ImageUnknown` if no local image matches.
    Never,
    /// Pull if the remote image differs from the local one.
    Newer,
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self::Missing
    }
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::Missing => write!(f, "missing"),
            Self::Never => write!(f, "never"),
            Self::Newer => write!(f, "newer"),
        }
    }
}

impl std::str::FromStr for PullPolicy {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" | "Always" => Ok(Self::Always),
            "missing" | "Missing" | "ifmissing" | "IfMissing" | "ifnotpresent"
            | "IfNotPresent" | "" => Ok(Self::Missing),
            "never" | "Never" => Ok(Self::Never),
            "newer" | "Newer" | "ifnewer" | "IfNewer" => Ok(Self::Newer),
            _ => Err(ImageError::InvalidInput(format!(
                "unsupported pull policy {:?} (supported: always, missing, never, newer)",
                s
            ))),
        }
    }
}
