// src/lib.rs

//! mole: a single-host micro-PaaS operator tool.
//!
//! Tracks deployable projects, provisions their secrets and ports, renders
//! deployment artifacts, links their units into the user service manager
//! and runs deployments with a log per attempt.

pub mod config;
pub mod deploy;
pub mod error;
pub mod ports;
pub mod project;
pub mod provision;
pub mod registry;
pub mod secrets;
pub mod services;
pub mod sys;
pub mod template;

pub use config::MoleConfig;
pub use deploy::{Deployer, DeploymentReport, Outcome};
pub use error::{MoleError, Result};
pub use project::{NewProject, Project, ProjectEdit, ProjectType};
pub use registry::Registry;
