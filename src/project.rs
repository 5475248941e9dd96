// src/project.rs

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::MoleConfig;
use crate::error::{MoleError, Result};

static PROJECT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("static regex"));

/// Key in the project `.env` that records how the project is run.
pub const PROJECT_TYPE_KEY: &str = "MOLE_PROJECT_TYPE";

/// A deployable unit tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(rename = "projectId")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub repository_url: String,
    pub branch: String,
}

impl Project {
    /// Prefix shared by every unit link created for this project.
    pub fn link_prefix(&self) -> String {
        format!("mole-{}-", self.name)
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " |ID     : {}", self.id)?;
        writeln!(f, " |Name   : {}", self.name)?;
        writeln!(f, " |Desc.  : {}", self.description)?;
        writeln!(f, " |Git    : {}", self.repository_url)?;
        write!(f, " |Branch : {}", self.branch)
    }
}

/// Operator input for a project that has no ID yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    pub name: String,
    pub description: String,
    pub repository_url: String,
    pub branch: String,
}

impl NewProject {
    pub fn with_id(self, id: String) -> Project {
        Project {
            id,
            name: self.name,
            description: self.description,
            repository_url: self.repository_url,
            branch: self.branch,
        }
    }
}

/// Mutable fields. `None` and empty strings leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectEdit {
    pub description: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectType {
    Static,
    /// Container-orchestrated (podman quadlets + compose)
    Podman,
    /// Native service-manager units
    Systemd,
}

impl ProjectType {
    pub const ALL: [ProjectType; 3] = [ProjectType::Static, ProjectType::Podman, ProjectType::Systemd];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Static => "static",
            ProjectType::Podman => "podman",
            ProjectType::Systemd => "systemd",
        }
    }

    /// Static projects are served from whatever is already on disk.
    pub fn requires_sync(&self) -> bool {
        match self {
            ProjectType::Static => false,
            ProjectType::Podman | ProjectType::Systemd => true,
        }
    }

    /// Unit directory this type links into, if it links at all.
    pub fn link_destination(&self, config: &MoleConfig) -> Option<PathBuf> {
        match self {
            ProjectType::Static => None,
            ProjectType::Podman => Some(config.quadlet_dir.clone()),
            ProjectType::Systemd => Some(config.systemd_dir.clone()),
        }
    }

    /// Reads `MOLE_PROJECT_TYPE` from a project's `.env` file.
    pub fn from_env_file(path: &Path) -> Result<Self> {
        let entries = dotenvy::from_path_iter(path).map_err(|e| match e {
            dotenvy::Error::Io(source) => MoleError::io(path, source),
            other => MoleError::validation(format!("unreadable {}: {}", path.display(), other)),
        })?;

        for entry in entries {
            let (key, value) = entry.map_err(|e| {
                MoleError::validation(format!("malformed {}: {}", path.display(), e))
            })?;
            if key == PROJECT_TYPE_KEY {
                return value.parse();
            }
        }

        Err(MoleError::validation(format!(
            "{} does not define {}",
            path.display(),
            PROJECT_TYPE_KEY
        )))
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectType {
    type Err = MoleError;

    fn from_str(s: &str) -> Result<Self> {
        ProjectType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                MoleError::validation(format!(
                    "invalid project type '{}' (available: static, podman, systemd)",
                    s
                ))
            })
    }
}

pub fn validate_project_name(name: &str) -> Result<()> {
    if PROJECT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(MoleError::validation(format!(
            "project name '{}' may only contain lowercase letters, digits, underscores and hyphens",
            name
        )))
    }
}

/// Name of a project-owned unit, e.g. `mole-shop-app.service`.
pub fn unit_name(project_name: &str, service: &str) -> String {
    format!("mole-{}-{}", project_name, service)
}
