// src/secrets.rs

//! Per-project credential bundles.
//!
//! A bundle is a snapshot: ports come from the allocator at generation time
//! and the document is rewritten wholesale on every regeneration.

use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::config::MoleConfig;
use crate::error::{MoleError, Result};
use crate::ports::PortAllocator;
use crate::project::Project;
use crate::registry::Registry;
use crate::sys::atomic::write_atomic;
use crate::sys::secrets::{random_alphanumeric, GeneratedSecret};
use crate::template::Binding;

const APP_KEY_LEN: usize = 32;
const DB_NAME_SUFFIX_LEN: usize = 8;
const DB_USER_SUFFIX_LEN: usize = 6;
const DB_PASSWORD_LEN: usize = 24;

/// Field names double as template binding keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretBundle {
    #[serde(rename = "EnvPath")]
    pub env_path: PathBuf,
    #[serde(rename = "RootPath")]
    pub root_path: PathBuf,
    #[serde(rename = "LogPath")]
    pub log_path: PathBuf,
    #[serde(rename = "PName")]
    pub project_name: String,
    #[serde(rename = "AppKey")]
    pub app_key: GeneratedSecret,
    #[serde(rename = "PortApp")]
    pub port_app: u16,
    #[serde(rename = "PortTwo")]
    pub port_two: u16,
    #[serde(rename = "PortThree")]
    pub port_three: u16,
    #[serde(rename = "DbName")]
    pub db_name: String,
    #[serde(rename = "DbUser")]
    pub db_user: String,
    #[serde(rename = "DbPassword")]
    pub db_password: GeneratedSecret,
}

impl SecretBundle {
    pub fn binding(&self) -> Binding {
        let path = |p: &PathBuf| p.to_string_lossy().into_owned();
        Binding::from([
            ("EnvPath".to_string(), path(&self.env_path)),
            ("RootPath".to_string(), path(&self.root_path)),
            ("LogPath".to_string(), path(&self.log_path)),
            ("PName".to_string(), self.project_name.clone()),
            ("AppKey".to_string(), self.app_key.use_secret(str::to_string)),
            ("PortApp".to_string(), self.port_app.to_string()),
            ("PortTwo".to_string(), self.port_two.to_string()),
            ("PortThree".to_string(), self.port_three.to_string()),
            ("DbName".to_string(), self.db_name.clone()),
            ("DbUser".to_string(), self.db_user.clone()),
            ("DbPassword".to_string(), self.db_password.use_secret(str::to_string)),
        ])
    }
}

pub struct SecretsGenerator<'a> {
    config: &'a MoleConfig,
    registry: &'a Registry,
    ports: &'a PortAllocator<'a>,
}

impl<'a> SecretsGenerator<'a> {
    pub fn new(config: &'a MoleConfig, registry: &'a Registry, ports: &'a PortAllocator<'a>) -> Self {
        Self {
            config,
            registry,
            ports,
        }
    }

    /// Resolves the project and (re)generates its bundle.
    pub async fn generate(&self, term: &str) -> Result<SecretBundle> {
        let project = self.registry.find(term).await?;
        self.generate_for(&project).await
    }

    /// Generates and persists a fresh bundle, overwriting any previous one.
    pub async fn generate_for(&self, project: &Project) -> Result<SecretBundle> {
        let name = &project.name;
        let [port_app, port_two, port_three] = self.ports.reserve_three().await?;

        let bundle = SecretBundle {
            env_path: self.config.project_env_path(name),
            root_path: self.config.project_root(name),
            log_path: self.config.project_log_dir(name),
            project_name: name.clone(),
            app_key: GeneratedSecret::generate(APP_KEY_LEN),
            port_app,
            port_two,
            port_three,
            db_name: format!("{}db{}", name, random_alphanumeric(DB_NAME_SUFFIX_LEN)),
            db_user: format!("{}user{}", name, random_alphanumeric(DB_USER_SUFFIX_LEN)),
            db_password: GeneratedSecret::generate(DB_PASSWORD_LEN),
        };

        let path = self.config.secrets_path(name);
        let body = serde_json::to_vec_pretty(&bundle).map_err(|source| MoleError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, body).await?;

        info!(project = %name, path = %path.display(), "secrets generated");
        Ok(bundle)
    }

    /// Reads the stored bundle without altering it.
    pub async fn load(&self, project_name: &str) -> Result<SecretBundle> {
        load_bundle(self.config, project_name).await
    }
}

pub async fn load_bundle(config: &MoleConfig, project_name: &str) -> Result<SecretBundle> {
    let path = config.secrets_path(project_name);
    let raw = fs::read(&path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => MoleError::NotFound {
            term: format!("secrets for {}", project_name),
        },
        _ => MoleError::io(&path, e),
    })?;
    serde_json::from_slice(&raw).map_err(|source| MoleError::Corrupt { path, source })
}

/// Drops a bundle document; absent documents are fine.
pub async fn remove_bundle(config: &MoleConfig, project_name: &str) -> Result<()> {
    let path = config.secrets_path(project_name);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MoleError::io(&path, e)),
    }
}
