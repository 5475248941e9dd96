// src/registry.rs

//! Durable project store.
//!
//! The registry is one JSON array on disk. Every operation takes the sidecar
//! lock without waiting, re-reads the document, and (for mutations) writes it
//! back before the lock guard drops. Nothing is cached between calls.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MoleConfig;
use crate::error::{MoleError, Result};
use crate::project::{validate_project_name, NewProject, Project, ProjectEdit};
use crate::sys::atomic::write_atomic;

/// Exclusive advisory lock on the registry sidecar file. Released on drop,
/// which covers every early return and error path.
pub struct StoreLock {
    _guard: Flock<File>,
}

impl StoreLock {
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MoleError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| MoleError::io(path, e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Self { _guard: guard }),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(MoleError::Busy {
                path: path.to_path_buf(),
            }),
            Err((_, errno)) => Err(MoleError::io(path, std::io::Error::from(errno))),
        }
    }
}

pub struct Registry {
    document: PathBuf,
    lock: PathBuf,
}

impl Registry {
    pub fn new(config: &MoleConfig) -> Self {
        Self {
            document: config.registry_path(),
            lock: config.registry_lock_path(),
        }
    }

    /// All projects in storage order.
    pub async fn list(&self) -> Result<Vec<Project>> {
        let _lock = StoreLock::try_acquire(&self.lock)?;
        self.read().await
    }

    /// Case-insensitive name match or exact ID match.
    pub async fn find(&self, term: &str) -> Result<Project> {
        let _lock = StoreLock::try_acquire(&self.lock)?;
        let projects = self.read().await?;
        position(&projects, term)
            .map(|i| projects[i].clone())
            .ok_or_else(|| MoleError::NotFound { term: term.to_string() })
    }

    pub async fn add(&self, new_project: NewProject) -> Result<Project> {
        validate_project_name(&new_project.name)?;

        let _lock = StoreLock::try_acquire(&self.lock)?;
        let mut projects = self.read().await?;

        if projects.iter().any(|p| p.name.eq_ignore_ascii_case(&new_project.name)) {
            return Err(MoleError::validation(format!(
                "a project named '{}' already exists",
                new_project.name
            )));
        }

        let id = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            if !projects.iter().any(|p| p.id == candidate) {
                break candidate;
            }
        };

        let project = new_project.with_id(id);
        projects.push(project.clone());
        self.write(&projects).await?;

        info!(id = %project.id, name = %project.name, "project added");
        Ok(project)
    }

    /// Applies only the non-empty fields of `changes`. Name and repository
    /// URL are never touched.
    pub async fn edit(&self, term: &str, changes: ProjectEdit) -> Result<Project> {
        let _lock = StoreLock::try_acquire(&self.lock)?;
        let mut projects = self.read().await?;

        let index = position(&projects, term)
            .ok_or_else(|| MoleError::NotFound { term: term.to_string() })?;
        let project = &mut projects[index];

        if let Some(description) = changes.description.filter(|d| !d.is_empty()) {
            project.description = description;
        }
        if let Some(branch) = changes.branch.filter(|b| !b.is_empty()) {
            project.branch = branch;
        }

        let updated = project.clone();
        self.write(&projects).await?;

        info!(id = %updated.id, "project updated");
        Ok(updated)
    }

    /// Physically removes the project with exactly this ID.
    pub async fn delete(&self, id: &str) -> Result<Project> {
        let _lock = StoreLock::try_acquire(&self.lock)?;
        let mut projects = self.read().await?;

        let index = projects
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| MoleError::NotFound { term: id.to_string() })?;
        let removed = projects.remove(index);
        self.write(&projects).await?;

        info!(id = %removed.id, name = %removed.name, "project deleted");
        Ok(removed)
    }

    // Callers must hold the store lock.
    async fn read(&self) -> Result<Vec<Project>> {
        let raw = match fs::read(&self.document).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.document.display(), "creating empty project store");
                self.write(&[]).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(MoleError::io(&self.document, e)),
        };

        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&raw).map_err(|source| MoleError::Corrupt {
            path: self.document.clone(),
            source,
        })
    }

    async fn write(&self, projects: &[Project]) -> Result<()> {
        let body = serde_json::to_vec_pretty(projects).map_err(|source| MoleError::Corrupt {
            path: self.document.clone(),
            source,
        })?;
        write_atomic(&self.document, body).await
    }
}

fn position(projects: &[Project], term: &str) -> Option<usize> {
    projects
        .iter()
        .position(|p| p.id == term || p.name.eq_ignore_ascii_case(term))
}
