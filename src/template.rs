// src/template.rs

//! Field-reference templates.
//!
//! Supported actions:
//! - `{{.Field}}` / `{{ .Field }}` substitutes a value from the binding
//! - `{{- .Field -}}` additionally trims whitespace on the marked side
//! - `{{/* ... */}}` is a comment and renders to nothing
//!
//! Any other action is a parse error, and a field missing from the binding
//! is a render error. Text outside actions is copied unchanged.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::MoleConfig;
use crate::error::{MoleError, Result};
use crate::secrets::SecretBundle;

/// Flat field → value data a template renders against.
pub type Binding = BTreeMap<String, String>;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("no value for field '{field}'")]
    MissingField { field: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> std::result::Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut consumed = 0;
        let mut trim_next_text = false;

        while let Some(open) = rest.find(OPEN) {
            let mut text = &rest[..open];
            if trim_next_text {
                text = text.trim_start();
            }

            let line = source[..consumed + open].matches('\n').count() + 1;
            let after_open = &rest[open + OPEN.len()..];
            let close = find_close(after_open).ok_or_else(|| TemplateError::Parse {
                line,
                message: "unclosed action".to_string(),
            })?;

            let mut inner = &after_open[..close];
            let trim_left = inner.starts_with("- ") || inner == "-";
            if trim_left {
                inner = &inner[1..];
                text = text.trim_end();
            }
            trim_next_text = inner.ends_with(" -");
            if trim_next_text {
                inner = &inner[..inner.len() - 1];
            }

            if !text.is_empty() {
                segments.push(Segment::Text(text.to_string()));
            }
            if let Some(field) = parse_action(inner.trim(), line)? {
                segments.push(Segment::Field(field));
            }

            let advanced = open + OPEN.len() + close + CLOSE.len();
            consumed += advanced;
            rest = &rest[advanced..];
        }

        let tail = if trim_next_text { rest.trim_start() } else { rest };
        if !tail.is_empty() {
            segments.push(Segment::Text(tail.to_string()));
        }

        Ok(Self { segments })
    }

    /// Field names referenced by this template, in order of appearance.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(f) => Some(f.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Fails on the first field absent from `binding`; no partial output is
    /// produced.
    pub fn render(&self, binding: &Binding) -> std::result::Result<Zeroizing<String>, TemplateError> {
        let mut out = Zeroizing::new(String::new());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(field) => {
                    let value = binding.get(field).ok_or_else(|| TemplateError::MissingField {
                        field: field.clone(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Offset of the `}}` closing the action that starts `after_open`. A comment
/// may itself contain `}}`, so its close is searched for after `*/`.
fn find_close(after_open: &str) -> Option<usize> {
    let body = after_open.strip_prefix("- ").unwrap_or(after_open);
    let skip = after_open.len() - body.len();
    if body.starts_with("/*") {
        let end = skip + 2 + body[2..].find("*/")? + 2;
        return after_open[end..].find(CLOSE).map(|close| end + close);
    }
    after_open.find(CLOSE)
}

fn parse_action(action: &str, line: usize) -> std::result::Result<Option<String>, TemplateError> {
    if action.starts_with("/*") && action.ends_with("*/") && action.len() >= 4 {
        return Ok(None);
    }

    let field = action.strip_prefix('.').unwrap_or("");
    let mut chars = field.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(Some(field.to_string()))
    } else {
        Err(TemplateError::Parse {
            line,
            message: format!("unsupported action '{{{{{}}}}}', expected a field reference like {{{{.Name}}}}", action),
        })
    }
}

/// Renders `source` into `dest`. The destination inherits the source's
/// permission bits so a rendered script stays executable.
pub async fn render(source: &Path, dest: &Path, binding: &Binding) -> Result<()> {
    let raw = fs::read(source).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => MoleError::MissingSourceFile {
            path: source.to_path_buf(),
        },
        _ => MoleError::io(source, e),
    })?;
    let mode = fs::metadata(source)
        .await
        .map_err(|e| MoleError::io(source, e))?
        .permissions()
        .mode();

    let text = std::str::from_utf8(&raw).map_err(|e| MoleError::TemplateParse {
        path: source.to_path_buf(),
        line: 1,
        message: format!("template is not valid UTF-8: {}", e),
    })?;

    let template = Template::parse(text).map_err(|e| lift(e, source))?;
    let rendered = template.render(binding).map_err(|e| lift(e, source))?;

    fs::write(dest, rendered.as_bytes())
        .await
        .map_err(|e| MoleError::TemplateWrite {
            path: dest.to_path_buf(),
            source: e,
        })?;
    fs::set_permissions(dest, std::fs::Permissions::from_mode(mode & 0o7777))
        .await
        .map_err(|e| MoleError::TemplateWrite {
            path: dest.to_path_buf(),
            source: e,
        })?;

    debug!(source = %source.display(), dest = %dest.display(), "template rendered");
    Ok(())
}

pub(crate) fn lift(err: TemplateError, source: &Path) -> MoleError {
    match err {
        TemplateError::Parse { line, message } => MoleError::TemplateParse {
            path: source.to_path_buf(),
            line,
            message,
        },
        TemplateError::MissingField { field } => MoleError::Render {
            path: source.to_path_buf(),
            field,
        },
    }
}

// ==============================================================================
// Project Artifacts
// ==============================================================================

/// The two per-project files rendered against the secret bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    ComposeDescriptor,
    DeployScript,
}

impl Artifact {
    pub const ALL: [Artifact; 2] = [Artifact::ComposeDescriptor, Artifact::DeployScript];

    pub fn source_name(&self) -> &'static str {
        match self {
            Artifact::ComposeDescriptor => "mole-compose.yaml",
            Artifact::DeployScript => "mole-deploy.sh",
        }
    }

    pub fn ready_name(&self) -> &'static str {
        match self {
            Artifact::ComposeDescriptor => "mole-compose-ready.yaml",
            Artifact::DeployScript => "mole-deploy-ready.sh",
        }
    }

    pub fn source_path(&self, config: &MoleConfig, project_name: &str) -> PathBuf {
        config.project_root(project_name).join(self.source_name())
    }

    pub fn ready_path(&self, config: &MoleConfig, project_name: &str) -> PathBuf {
        config.project_root(project_name).join(self.ready_name())
    }
}

/// Renders every artifact, compose descriptor first. Stops at the first
/// failure; anything already rendered stays on disk.
pub async fn render_artifacts(config: &MoleConfig, bundle: &SecretBundle) -> Result<()> {
    let binding = bundle.binding();
    for artifact in Artifact::ALL {
        render(
            &artifact.source_path(config, &bundle.project_name),
            &artifact.ready_path(config, &bundle.project_name),
            &binding,
        )
        .await?;
    }
    info!(project = %bundle.project_name, "artifacts rendered");
    Ok(())
}
