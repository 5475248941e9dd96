// src/provision.rs

//! First-time project setup: clone, secrets, base `.env`, registry entry.

use std::io::ErrorKind;
use std::path::Path;

use tokio::fs;
use tracing::{info, warn};

use crate::config::MoleConfig;
use crate::error::{MoleError, Result};
use crate::project::{validate_project_name, NewProject, Project, ProjectType};
use crate::registry::Registry;
use crate::secrets::{remove_bundle, SecretsGenerator};
use crate::sys::atomic::write_atomic;
use crate::sys::traits::GitManager;
use crate::template::{lift, Template};

const BASE_ENV: &str = r#"# Auto-generated environment configuration for {{.PName}}.
# DO NOT DELETE OR MODIFY THIS SECTION.
# Static path to this file on mole managed servers:
# {{.EnvPath}}

# Available types: static, podman, systemd
MOLE_PROJECT_TYPE={{.PType}}

MOLE_ROOT_PATH={{.RootPath}}
MOLE_LOG_PATH={{.LogPath}}

# Three reserved ports for this deployment.
MOLE_PORT_APP={{.PortApp}}
MOLE_PORT_TWO={{.PortTwo}}
MOLE_PORT_THREE={{.PortThree}}

MOLE_APP_KEY={{.AppKey}}

MOLE_DB_NAME={{.DbName}}
MOLE_DB_USER={{.DbUser}}
MOLE_DB_PASS={{.DbPassword}}

# User-defined environment variables can be added below.
"#;

pub struct Provisioner<'a> {
    config: &'a MoleConfig,
    registry: &'a Registry,
    secrets: &'a SecretsGenerator<'a>,
    git: &'a dyn GitManager,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        config: &'a MoleConfig,
        registry: &'a Registry,
        secrets: &'a SecretsGenerator<'a>,
        git: &'a dyn GitManager,
    ) -> Self {
        Self {
            config,
            registry,
            secrets,
            git,
        }
    }

    /// Clones the repository and registers the project. Anything created on
    /// disk before a failure is removed again; reserved ports stay reserved.
    pub async fn create(&self, new_project: NewProject, project_type: ProjectType) -> Result<Project> {
        validate_project_name(&new_project.name)?;
        let existing = self.registry.list().await?;
        if existing.iter().any(|p| p.name.eq_ignore_ascii_case(&new_project.name)) {
            return Err(MoleError::validation(format!(
                "a project named '{}' already exists",
                new_project.name
            )));
        }

        let root = self.config.project_root(&new_project.name);
        if fs::symlink_metadata(&root).await.is_ok() {
            return Err(MoleError::validation(format!(
                "{} already exists, refusing to clone over it",
                root.display()
            )));
        }

        self.git
            .clone_repo(&new_project.repository_url, &new_project.branch, &root)
            .await?;
        info!(project = %new_project.name, path = %root.display(), "repository cloned");

        match self.prepare(new_project, project_type, &root).await {
            Ok(project) => Ok(project),
            Err(e) => {
                self.clean_up(&root).await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, new_project: NewProject, project_type: ProjectType, root: &Path) -> Result<Project> {
        require_env_ignored(root).await?;

        // not yet registered; the bundle only needs the name
        let pending = new_project.clone().with_id(String::new());
        let bundle = self.secrets.generate_for(&pending).await?;

        let mut binding = bundle.binding();
        binding.insert("PType".to_string(), project_type.to_string());

        let env_path = self.config.project_env_path(&new_project.name);
        let rendered = Template::parse(BASE_ENV)
            .and_then(|t| t.render(&binding))
            .map_err(|e| lift(e, &env_path))?;
        write_atomic(&env_path, rendered.as_bytes().to_vec()).await?;

        let project = self.registry.add(new_project).await?;
        info!(project = %project.name, %project_type, "project provisioned");
        Ok(project)
    }

    async fn clean_up(&self, root: &Path) {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Err(e) = fs::remove_dir_all(root).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %root.display(), error = %e, "failed to remove clone after error");
            }
        }
        if let Err(e) = remove_bundle(self.config, &name).await {
            warn!(project = %name, error = %e, "failed to remove secrets after error");
        }
    }
}

/// The project `.env` holds credentials and must never be committed.
async fn require_env_ignored(root: &Path) -> Result<()> {
    let path = root.join(".gitignore");
    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(MoleError::io(&path, e)),
    };

    if content.lines().any(|l| l.trim() == ".env") {
        Ok(())
    } else {
        Err(MoleError::validation(
            ".gitignore does not include an entry for '.env', which is mandatory for mole to work properly",
        ))
    }
}
