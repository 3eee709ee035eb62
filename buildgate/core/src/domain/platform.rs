// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Target platforms.
//!
//! A build names OCI platforms (`linux/amd64`, `linux/arm/v7`, ...) but builders
//! are provisioned per CPU family: every amd64-compatible platform runs on an
//! amd64 builder and every arm platform on an arm64 builder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Unsupported platform '{0}'. Supported architectures: amd64, arm64 (and their variants)")]
    Unsupported(String),
    #[error("Unsupported operating system '{os}' in platform '{platform}'. Only linux builders are available")]
    UnsupportedOs { os: String, platform: String },
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Architecture of the machine running this process, if a builder exists for it.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" | "x86" => Some(Architecture::Amd64),
            "aarch64" | "arm" => Some(Architecture::Arm64),
            _ => None,
        }
    }

    /// Map an OCI platform string to the builder family that can execute it.
    ///
    /// Accepts `os/arch[/variant]` as well as a bare architecture.
    pub fn from_platform(platform: &str) -> Result<Self, PlatformError> {
        let trimmed = platform.trim();
        let mut parts = trimmed.split('/');
        let first = parts.next().unwrap_or_default();
        let arch = match parts.next() {
            Some(arch) => {
                if first != "linux" {
                    return Err(PlatformError::UnsupportedOs {
                        os: first.to_string(),
                        platform: trimmed.to_string(),
                    });
                }
                arch
            }
            None => first,
        };

        match arch {
            "amd64" | "x86_64" | "386" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" | "arm" => Ok(Architecture::Arm64),
            _ => Err(PlatformError::Unsupported(trimmed.to_string())),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_platform(s)
    }
}

/// One platform a worker advertises to the build client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPlatform {
    pub architecture: &'static str,
    pub os: &'static str,
    pub variant: Option<&'static str>,
}

impl WorkerPlatform {
    const fn linux(architecture: &'static str, variant: Option<&'static str>) -> Self {
        Self { architecture, os: "linux", variant }
    }
}

const AMD64_WORKER_PLATFORMS: [WorkerPlatform; 5] = [
    WorkerPlatform::linux("amd64", None),
    WorkerPlatform::linux("amd64", Some("v2")),
    WorkerPlatform::linux("amd64", Some("v3")),
    WorkerPlatform::linux("amd64", Some("v4")),
    WorkerPlatform::linux("386", None),
];

const ARM64_WORKER_PLATFORMS: [WorkerPlatform; 3] = [
    WorkerPlatform::linux("arm64", None),
    WorkerPlatform::linux("arm", Some("v7")),
    WorkerPlatform::linux("arm", Some("v6")),
];

/// Platforms advertised for a builder of the given architecture.
///
/// Unknown architectures yield an empty list rather than an error.
pub fn worker_platforms(architecture: &str) -> Vec<WorkerPlatform> {
    match architecture {
        "amd64" => AMD64_WORKER_PLATFORMS.to_vec(),
        "arm64" => ARM64_WORKER_PLATFORMS.to_vec(),
        _ => Vec::new(),
    }
}

/// Resolve requested platforms into the ordered list of builders to bootstrap.
///
/// Duplicates collapse onto one builder. With no request at all the host
/// architecture is used. When the platforms were not explicitly requested by
/// the user, the host architecture is moved to the front so that its builder
/// becomes the primary node.
pub fn resolve_platforms(
    requested: &[String],
    explicit: bool,
    host: Architecture,
) -> Result<Vec<Architecture>, PlatformError> {
    let mut resolved: Vec<Architecture> = Vec::new();
    for platform in requested {
        for part in platform.split(',').filter(|p| !p.trim().is_empty()) {
            let arch = Architecture::from_platform(part)?;
            if !resolved.contains(&arch) {
                resolved.push(arch);
            }
        }
    }

    if resolved.is_empty() {
        return Ok(vec![host]);
    }

    if !explicit {
        if let Some(pos) = resolved.iter().position(|a| *a == host) {
            let native = resolved.remove(pos);
            resolved.insert(0, native);
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_platform_variants() {
        assert_eq!(Architecture::from_platform("linux/amd64").unwrap(), Architecture::Amd64);
        assert_eq!(Architecture::from_platform("linux/amd64/v3").unwrap(), Architecture::Amd64);
        assert_eq!(Architecture::from_platform("linux/386").unwrap(), Architecture::Amd64);
        assert_eq!(Architecture::from_platform("arm64").unwrap(), Architecture::Arm64);
        assert_eq!(Architecture::from_platform("linux/arm/v7").unwrap(), Architecture::Arm64);
        assert!(matches!(
            Architecture::from_platform("windows/amd64"),
            Err(PlatformError::UnsupportedOs { .. })
        ));
        assert!(Architecture::from_platform("linux/riscv64").is_err());
    }

    #[test]
    fn test_worker_platform_table() {
        let amd = worker_platforms("amd64");
        assert_eq!(amd.len(), 5);
        assert_eq!(amd[0], WorkerPlatform { architecture: "amd64", os: "linux", variant: None });
        assert_eq!(amd[4].architecture, "386");

        let arm = worker_platforms("arm64");
        assert_eq!(arm.len(), 3);
        assert_eq!(arm[1].variant, Some("v7"));

        assert!(worker_platforms("riscv64").is_empty());
        assert!(worker_platforms("").is_empty());
    }

    #[test]
    fn test_resolve_defaults_to_host() {
        let resolved = resolve_platforms(&[], false, Architecture::Arm64).unwrap();
        assert_eq!(resolved, vec![Architecture::Arm64]);
    }

    #[test]
    fn test_resolve_orders_native_first_when_implicit() {
        let requested = vec!["linux/amd64,linux/arm64".to_string()];

        let implicit = resolve_platforms(&requested, false, Architecture::Arm64).unwrap();
        assert_eq!(implicit, vec![Architecture::Arm64, Architecture::Amd64]);

        let explicit = resolve_platforms(&requested, true, Architecture::Arm64).unwrap();
        assert_eq!(explicit, vec![Architecture::Amd64, Architecture::Arm64]);
    }

    #[test]
    fn test_resolve_collapses_variants() {
        let requested = vec![
            "linux/amd64".to_string(),
            "linux/amd64/v2".to_string(),
            "linux/386".to_string(),
        ];
        let resolved = resolve_platforms(&requested, true, Architecture::Amd64).unwrap();
        assert_eq!(resolved, vec![Architecture::Amd64]);
    }
}
