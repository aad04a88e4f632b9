//! Image platform description.

use serde::{Deserialize, Serialize};

use crate::error::{ImageError, Result};

/// OS/architecture/variant triple. Empty fields are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSpec {
    pub architecture: String,
    pub os: String,
    pub variant: String,
}

impl PlatformSpec {
    pub fn new(
        os: impl Into<String>,
        architecture: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            variant: variant.into(),
        }
    }

    /// Platform of the running host, in container nomenclature.
    pub fn host() -> Self {
        Self {
            architecture: normalize_arch(std::env::consts::ARCH).to_string(),
            os: std::env::consts::OS.to_string(),
            variant: String::new(),
        }
    }

    /// Parse `os/arch[/variant]`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch, "")),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => {
                Ok(Self::new(*os, *arch, *variant))
            }
            _ => Err(ImageError::InvalidInput(format!(
                "invalid platform {:?}: expected os/arch[/variant]",
                s
            ))),
        }
    }

    /// True if no field constrains the platform.
    pub fn is_empty(&self) -> bool {
        self.architecture.is_empty() && self.os.is_empty() && self.variant.is_empty()
    }

    /// Fill empty fields from `other`.
    pub fn or(mut self, other: &PlatformSpec) -> Self {
        if self.architecture.is_empty() {
            self.architecture = other.architecture.clone();
        }
        if self.os.is_empty() {
            self.os = other.os.clone();
        }
        if self.variant.is_empty() {
            self.variant = other.variant.clone();
        }
        self
    }

    /// Normalized copy, so that equivalent spellings compare equal.
    pub fn normalized(&self) -> Self {
        let os = match self.os.as_str() {
            "macos" => "darwin".to_string(),
            other => other.to_lowercase(),
        };
        let architecture = normalize_arch(&self.architecture.to_lowercase()).to_string();
        let variant = normalize_variant(&architecture, &self.variant.to_lowercase());
        Self {
            architecture,
            os,
            variant,
        }
    }
}

impl std::fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x86-64" => "amd64",
        "aarch64" => "arm64",
        "i386" | "i686" | "x86" => "386",
        "armhf" | "armel" => "arm",
        "powerpc64le" => "ppc64le",
        other => other,
    }
}

fn normalize_variant(arch: &str, variant: &str) -> String {
    match (arch, variant) {
        ("arm64", "8" | "v8") => String::new(),
        ("arm", "") => "v7".to_string(),
        ("arm", "5" | "6" | "7" | "8") => format!("v{}", variant),
        _ => variant.to_string(),
    }
}
