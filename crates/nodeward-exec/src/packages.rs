//! Distribution detection and package installation.
//!
//! Installation is a policy layer over [`ExecutionEngine::execute_command`]:
//! it only picks the right non-interactive command lines for the host's
//! package manager family.

use log::{info, warn};
use nodeward_protocol::ExecutionResult;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::engine::{ExecutionEngine, ExecutionRequest};

pub const OS_RELEASE: &str = "/etc/os-release";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("unsupported distribution '{0}'")]
    UnsupportedDistribution(String),

    #[error("reading {path}: {source}")]
    OsRelease {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no packages given")]
    NoPackages,
}

/// Package manager families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// apt-get
    Debian,
    /// yum
    RedHat,
    /// pacman
    Arch,
}

impl Distribution {
    /// Match a distribution identifier such as `ubuntu` or `centos`.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "debian" | "ubuntu" => Some(Self::Debian),
            "centos" | "redhat" | "rhel" | "fedora" => Some(Self::RedHat),
            "arch" => Some(Self::Arch),
            _ => None,
        }
    }

    /// Detect from `os-release` contents, trying `ID` and then `ID_LIKE`.
    pub fn from_os_release(contents: &str) -> Result<Self, PackageError> {
        let fields = parse_os_release(contents);
        let id = fields.get("ID").cloned().unwrap_or_default();
        if let Some(distro) = Self::from_id(&id) {
            return Ok(distro);
        }
        fields
            .get("ID_LIKE")
            .into_iter()
            .flat_map(|like| like.split_whitespace())
            .find_map(Self::from_id)
            .ok_or(PackageError::UnsupportedDistribution(id))
    }

    /// Detect the host's family from `/etc/os-release`.
    pub fn detect() -> Result<Self, PackageError> {
        Self::detect_from(Path::new(OS_RELEASE))
    }

    pub fn detect_from(path: &Path) -> Result<Self, PackageError> {
        let contents = std::fs::read_to_string(path).map_err(|source| PackageError::OsRelease {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_os_release(&contents)
    }

    /// Command lines to run, in order, to install `packages`.
    pub fn install_plan(self, packages: &[String], update: bool) -> Vec<String> {
        let names = packages.join(" ");
        let mut plan = Vec::new();
        match self {
            Self::Debian => {
                if update {
                    plan.push("apt-get -y -qq update".to_string());
                }
                plan.push(format!(
                    "apt-get -o Dpkg::Options::=--force-confold --allow-unauthenticated --force-yes -y -qq install {}",
                    names
                ));
            }
            Self::RedHat => {
                if update {
                    plan.push("yum -y clean all".to_string());
                }
                plan.push(format!("yum -y --nogpgcheck install {}", names));
            }
            Self::Arch => {
                if update {
                    plan.push("pacman -Sy".to_string());
                    plan.push("pacman -S --noconfirm pacman".to_string());
                }
                plan.push(format!("pacman -S --noconfirm {}", names));
            }
        }
        plan
    }

    /// Extra environment for the package manager.
    pub fn install_env(self) -> Option<HashMap<String, String>> {
        match self {
            Self::Debian => Some(HashMap::from([(
                "DEBIAN_FRONTEND".to_string(),
                "noninteractive".to_string(),
            )])),
            Self::RedHat | Self::Arch => None,
        }
    }
}

fn parse_os_release(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

/// Install `packages` with the package manager of `distro`.
///
/// An unrecognized distribution identifier fails before anything is executed.
/// A failing cache refresh is logged and installation proceeds; the result of
/// the install command is returned.
pub async fn install_packages(
    engine: &ExecutionEngine,
    distro_id: &str,
    packages: &[String],
    update: bool,
) -> Result<ExecutionResult, PackageError> {
    let distro = Distribution::from_id(distro_id)
        .ok_or_else(|| PackageError::UnsupportedDistribution(distro_id.to_string()))?;
    install_with(engine, distro, packages, update).await
}

/// Same as [`install_packages`] with an already detected family.
pub async fn install_with(
    engine: &ExecutionEngine,
    distro: Distribution,
    packages: &[String],
    update: bool,
) -> Result<ExecutionResult, PackageError> {
    if packages.iter().all(|p| p.trim().is_empty()) {
        return Err(PackageError::NoPackages);
    }

    let request = ExecutionRequest::new().env(distro.install_env());
    let mut plan = distro.install_plan(packages, update);
    let install = plan.pop().unwrap_or_default();

    for step in plan {
        let result = engine.execute_command(step.as_str(), &request).await;
        if !result.is_success() {
            warn!("'{}' exited with {}: {}", step, result.code, result.stderr.trim());
        }
    }

    info!("Installing {} via {:?}", packages.join(" "), distro);
    Ok(engine.execute_command(install, &request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkgs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_from_id() {
        assert_eq!(Distribution::from_id("ubuntu"), Some(Distribution::Debian));
        assert_eq!(Distribution::from_id("Debian"), Some(Distribution::Debian));
        assert_eq!(Distribution::from_id("centos"), Some(Distribution::RedHat));
        assert_eq!(Distribution::from_id("fedora"), Some(Distribution::RedHat));
        assert_eq!(Distribution::from_id("arch"), Some(Distribution::Arch));
        assert_eq!(Distribution::from_id("gentoo"), None);
    }

    #[test]
    fn test_from_os_release_uses_id_like() {
        let contents = "NAME=\"Linux Mint\"\nID=linuxmint\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(
            Distribution::from_os_release(contents).unwrap(),
            Distribution::Debian
        );
        let rocky = "ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(
            Distribution::from_os_release(rocky).unwrap(),
            Distribution::RedHat
        );
        assert!(matches!(
            Distribution::from_os_release("ID=alpine\n"),
            Err(PackageError::UnsupportedDistribution(id)) if id == "alpine"
        ));
    }

    #[test]
    fn test_install_plans() {
        let names = pkgs(&["curl", "git"]);
        assert_eq!(
            Distribution::Debian.install_plan(&names, true),
            vec![
                "apt-get -y -qq update",
                "apt-get -o Dpkg::Options::=--force-confold --allow-unauthenticated --force-yes -y -qq install curl git",
            ]
        );
        assert_eq!(
            Distribution::RedHat.install_plan(&names, false),
            vec!["yum -y --nogpgcheck install curl git"]
        );
        assert_eq!(
            Distribution::Arch.install_plan(&names, true),
            vec![
                "pacman -Sy",
                "pacman -S --noconfirm pacman",
                "pacman -S --noconfirm curl git",
            ]
        );
    }

    #[test]
    fn test_debian_is_noninteractive() {
        let env = Distribution::Debian.install_env().unwrap();
        assert_eq!(env["DEBIAN_FRONTEND"], "noninteractive");
        assert!(Distribution::Arch.install_env().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_distribution_fails_before_running() {
        let err = install_packages(&ExecutionEngine::default(), "plan9", &pkgs(&["vim"]), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PackageError::UnsupportedDistribution(ref id) if id == "plan9"));
        assert_eq!(err.to_string(), "unsupported distribution 'plan9'");
    }

    #[tokio::test]
    async fn test_no_packages() {
        let err = install_packages(&ExecutionEngine::default(), "debian", &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, PackageError::NoPackages));
    }
}
