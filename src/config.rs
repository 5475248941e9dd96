// src/config.rs

use std::env;
use std::path::PathBuf;

use crate::error::{MoleError, Result};

pub const DEFAULT_BASE_PATH: &str = "/home/mole";
pub const DEFAULT_PORT_BASE: u16 = 8000;

/// Host-wide settings, built once and handed to every component by reference.
#[derive(Clone, Debug)]
pub struct MoleConfig {
    // 📂 Store root: registry, secrets, projects and logs all live below it
    pub base_path: PathBuf,
    pub port_base: u16,

    // Service manager destinations
    pub systemd_dir: PathBuf,
    pub quadlet_dir: PathBuf,

    pub compose_bin: String,

    // 🛡️ Identity guard: when set, only this (non-root) user may operate the host
    pub required_user: Option<String>,
}

impl MoleConfig {
    /// Reads `MOLE_*` overrides from the environment.
    pub fn load() -> Result<Self> {
        Self::load_rooted(None)
    }

    /// Like [`MoleConfig::load`], but an explicit `base_path` wins over
    /// `MOLE_BASE_PATH`. Unit directories still honour their own variables.
    pub fn load_rooted(base_path: Option<PathBuf>) -> Result<Self> {
        let base_path = base_path
            .or_else(|| env::var("MOLE_BASE_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_PATH));

        let mut config = Self::with_base_path(base_path);

        if let Ok(raw) = env::var("MOLE_PORT_BASE") {
            config.port_base = raw.parse::<u16>().map_err(|_| {
                MoleError::validation(format!("MOLE_PORT_BASE must be a TCP port, got '{}'", raw))
            })?;
        }
        if let Ok(dir) = env::var("MOLE_SYSTEMD_DIR") {
            config.systemd_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("MOLE_QUADLET_DIR") {
            config.quadlet_dir = PathBuf::from(dir);
        }
        if let Ok(bin) = env::var("MOLE_COMPOSE_BIN") {
            config.compose_bin = bin;
        }
        config.required_user = env::var("MOLE_REQUIRE_USER").ok().filter(|u| !u.is_empty());

        Ok(config)
    }

    /// A self-contained configuration rooted at `base_path`, with every
    /// other setting at its default.
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            systemd_dir: base_path.join(".config").join("systemd").join("user"),
            quadlet_dir: base_path.join(".config").join("containers").join("systemd"),
            base_path,
            port_base: DEFAULT_PORT_BASE,
            compose_bin: "podman-compose".to_string(),
            required_user: None,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.base_path.join("mole.json")
    }

    pub fn registry_lock_path(&self) -> PathBuf {
        self.base_path.join("mole.lock")
    }

    pub fn reserved_ports_path(&self) -> PathBuf {
        self.base_path.join("reservedPorts.json")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.base_path.join("secrets")
    }

    pub fn secrets_path(&self, project_name: &str) -> PathBuf {
        self.secrets_dir().join(format!("{}.json", project_name))
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.base_path.join("projects")
    }

    pub fn project_root(&self, project_name: &str) -> PathBuf {
        self.projects_dir().join(project_name)
    }

    pub fn project_env_path(&self, project_name: &str) -> PathBuf {
        self.project_root(project_name).join(".env")
    }

    pub fn project_services_dir(&self, project_name: &str) -> PathBuf {
        self.project_root(project_name).join("mole").join("services")
    }

    pub fn project_log_dir(&self, project_name: &str) -> PathBuf {
        self.base_path.join("logs").join(project_name)
    }

    pub fn deployment_log_dir(&self) -> PathBuf {
        self.base_path.join("logs").join("deployments")
    }
}
