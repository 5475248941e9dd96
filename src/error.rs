// src/error.rs

//! Error types shared by every mole component.
//!
//! Callers branch on the variant, never on message text. Nothing in the core
//! retries: a lock conflict or a refused bus connection is returned as-is.

use std::path::PathBuf;

use thiserror::Error;

use crate::project::ProjectType;

/// Result type alias for mole operations
pub type Result<T> = std::result::Result<T, MoleError>;

#[derive(Error, Debug)]
pub enum MoleError {
    /// No project matches the given name or ID
    #[error("no project matches '{term}' (use `mole projects list` to see all projects)")]
    NotFound { term: String },

    /// Another process holds the registry lock
    #[error("someone else is working with the project store ({}), please try again", path.display())]
    Busy { path: PathBuf },

    /// Input rejected before any side effect happened
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The project type does not link into the service manager
    #[error("invalid service type {project_type}: linking is not necessary for {project_type} projects")]
    InvalidServiceType { project_type: ProjectType },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A subprocess exited non-zero; stderr is embedded verbatim
    #[error("{program} exited with code {code}: {stderr}")]
    ExternalProcess {
        program: String,
        code: i32,
        stderr: String,
    },

    /// The service manager could not be reached
    #[error("could not reach the service manager: {message}")]
    Connection { message: String },

    /// A persisted document exists but cannot be parsed
    #[error("corrupt document at {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("template source {} does not exist", path.display())]
    MissingSourceFile { path: PathBuf },

    #[error("failed to parse template {} (line {line}): {message}", path.display())]
    TemplateParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("failed to render template {}: no value for field '{field}'", path.display())]
    Render { path: PathBuf, field: String },

    #[error("failed to write rendered output {}: {source}", path.display())]
    TemplateWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "failed to walk {}: {source}. The services directory must exist for linking to work",
        path.display()
    )]
    ServicesDirMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The service manager rejected a request; its message is kept verbatim
    #[error("failed to {verb} {unit}: {message}")]
    Service {
        verb: &'static str,
        unit: String,
        message: String,
    },

    #[error("no three free ports left at or above {base}")]
    PortsExhausted { base: u16 },

    /// A deployment stage failed. The failure log is already on disk.
    #[error("deployment of {project} failed (log: {}): {source}", log_path.display())]
    Deployment {
        project: String,
        log_path: PathBuf,
        output: String,
        #[source]
        source: Box<MoleError>,
    },
}

impl MoleError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}
