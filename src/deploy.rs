// src/deploy.rs

//! Deployment pipeline: locate → sync → render → execute → log.
//!
//! Stages run strictly in order and the first failure ends the run. Nothing
//! already rendered is rolled back. Every call to [`Deployer::deploy`]
//! leaves exactly one log file behind, whatever the outcome.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::config::MoleConfig;
use crate::error::{MoleError, Result};
use crate::project::{Project, ProjectType, PROJECT_TYPE_KEY};
use crate::registry::Registry;
use crate::secrets::load_bundle;
use crate::sys::traits::{CapturedRun, ComposeManager, GitManager, ScriptRunner};
use crate::template::{render_artifacts, Artifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub project: String,
    pub outcome: Outcome,
    pub output: String,
    pub log_path: PathBuf,
}

pub struct Deployer {
    config: MoleConfig,
    registry: Registry,
    git: Box<dyn GitManager>,
    runner: Box<dyn ScriptRunner>,
    compose: Box<dyn ComposeManager>,
}

/// How far a run got before it stopped.
enum StageResult {
    Executed { project: Project, run: CapturedRun },
    Aborted { name: String, error: MoleError },
}

impl Deployer {
    pub fn new(
        config: MoleConfig,
        git: Box<dyn GitManager>,
        runner: Box<dyn ScriptRunner>,
        compose: Box<dyn ComposeManager>,
    ) -> Self {
        Self {
            registry: Registry::new(&config),
            config,
            git,
            runner,
            compose,
        }
    }

    pub async fn deploy(&self, term: &str) -> Result<DeploymentReport> {
        let timestamp = Utc::now().timestamp();

        match self.run_stages(term).await {
            StageResult::Executed { project, run } => {
                let outcome = if run.success() { Outcome::Success } else { Outcome::Failure };
                let log_path = self
                    .write_log(timestamp, &project.name, outcome, &run.output)
                    .await?;
                let output = run.output_lossy();

                if outcome == Outcome::Success {
                    info!(project = %project.name, log = %log_path.display(), "deployment succeeded");
                    return Ok(DeploymentReport {
                        project: project.name,
                        outcome,
                        output,
                        log_path,
                    });
                }

                error!(project = %project.name, code = ?run.code, log = %log_path.display(), "deployment script failed");
                let source = MoleError::ExternalProcess {
                    program: Artifact::DeployScript.ready_name().to_string(),
                    code: run.code.unwrap_or(-1),
                    stderr: last_line(&output).to_string(),
                };
                Err(MoleError::Deployment {
                    project: project.name,
                    log_path,
                    output,
                    source: Box::new(source),
                })
            }
            StageResult::Aborted { name, error } => {
                let text = error.to_string();
                let log_path = self
                    .write_log(timestamp, &name, Outcome::Failure, text.as_bytes())
                    .await?;

                error!(project = %name, error = %text, log = %log_path.display(), "deployment aborted");
                Err(MoleError::Deployment {
                    project: name,
                    log_path,
                    output: String::new(),
                    source: Box::new(error),
                })
            }
        }
    }

    async fn run_stages(&self, term: &str) -> StageResult {
        let project = match self.registry.find(term).await {
            Ok(project) => project,
            Err(error) => {
                return StageResult::Aborted {
                    name: sanitize_log_name(term),
                    error,
                }
            }
        };

        match self.prepare(&project).await {
            Ok((root, env_vars)) => {
                let script = Artifact::DeployScript.ready_path(&self.config, &project.name);
                debug!(script = %script.display(), "executing deployment script");
                match self.runner.run_script(&script, &root, &env_vars).await {
                    Ok(run) => StageResult::Executed { project, run },
                    Err(error) => StageResult::Aborted {
                        name: project.name,
                        error,
                    },
                }
            }
            Err(error) => StageResult::Aborted {
                name: project.name,
                error,
            },
        }
    }

    /// Sync and render. Returns the working directory and script environment.
    async fn prepare(&self, project: &Project) -> Result<(PathBuf, HashMap<String, String>)> {
        let root = self.config.project_root(&project.name);
        let project_type = ProjectType::from_env_file(&self.config.project_env_path(&project.name))?;

        if project_type.requires_sync() {
            info!(project = %project.name, branch = %project.branch, "syncing repository");
            self.git.pull(&project.branch, &root).await?;
        } else {
            debug!(project = %project.name, "static project, skipping sync");
        }

        let bundle = load_bundle(&self.config, &project.name).await?;
        render_artifacts(&self.config, &bundle).await?;

        let env_vars = HashMap::from([
            ("MOLE_PROJECT_NAME".to_string(), project.name.clone()),
            (PROJECT_TYPE_KEY.to_string(), project_type.to_string()),
        ]);
        Ok((root, env_vars))
    }

    /// Stops a container project's compose stack and returns what the
    /// orchestrator printed. Writes no log.
    pub async fn teardown(&self, term: &str) -> Result<String> {
        let project = self.registry.find(term).await?;
        let project_type = ProjectType::from_env_file(&self.config.project_env_path(&project.name))?;
        if project_type != ProjectType::Podman {
            return Err(MoleError::InvalidServiceType { project_type });
        }

        let root = self.config.project_root(&project.name);
        let descriptor = Artifact::ComposeDescriptor.ready_path(&self.config, &project.name);
        let run = self.compose.down(&descriptor, &root).await?;
        let output = run.output_lossy();

        if !run.success() {
            return Err(MoleError::ExternalProcess {
                program: self.config.compose_bin.clone(),
                code: run.code.unwrap_or(-1),
                stderr: output.trim_end().to_string(),
            });
        }

        info!(project = %project.name, "compose stack stopped");
        Ok(output)
    }

    async fn write_log(
        &self,
        timestamp: i64,
        name: &str,
        outcome: Outcome,
        contents: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.config.deployment_log_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| MoleError::io(&dir, e))?;

        // a taken name means another attempt landed in the same second
        let mut stamp = timestamp;
        loop {
            let path = dir.join(log_file_name(stamp, name, outcome));
            match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(mut file) => {
                    file.write_all(contents)
                        .await
                        .map_err(|e| MoleError::io(&path, e))?;
                    file.flush().await.map_err(|e| MoleError::io(&path, e))?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => stamp += 1,
                Err(e) => return Err(MoleError::io(&path, e)),
            }
        }
    }
}

pub fn log_file_name(timestamp: i64, name: &str, outcome: Outcome) -> String {
    format!("{}-{}-{}.log", timestamp, name, outcome)
}

/// Search terms are operator input; keep them to name-safe characters
/// before they become part of a file name.
fn sanitize_log_name(term: &str) -> String {
    let cleaned: String = term
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::ports::tests::FixedProbe;
    use crate::ports::PortAllocator;
    use crate::project::NewProject;
    use crate::secrets::SecretsGenerator;

    #[derive(Clone, Default)]
    struct FakeGit {
        pulls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl GitManager for FakeGit {
        async fn clone_repo(&self, _url: &str, _branch: &str, target: &Path) -> Result<()> {
            std::fs::create_dir_all(target).map_err(|e| MoleError::io(target, e))
        }

        async fn pull(&self, branch: &str, _working_dir: &Path) -> Result<()> {
            self.pulls.lock().unwrap().push(branch.to_string());
            if self.fail {
                return Err(MoleError::ExternalProcess {
                    program: "git pull".into(),
                    code: 1,
                    stderr: "fatal: couldn't find remote ref main".into(),
                });
            }
            Ok(())
        }
    }

    #[derive(Clone)]
    struct FakeRunner {
        code: i32,
        output: &'static str,
        scripts: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl FakeRunner {
        fn exiting(code: i32, output: &'static str) -> Self {
            Self {
                code,
                output,
                scripts: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl ScriptRunner for FakeRunner {
        async fn run_script(
            &self,
            script: &Path,
            _working_dir: &Path,
            env_vars: &HashMap<String, String>,
        ) -> Result<CapturedRun> {
            assert!(env_vars.contains_key("MOLE_PROJECT_NAME"));
            self.scripts.lock().unwrap().push(script.to_path_buf());
            Ok(CapturedRun {
                code: Some(self.code),
                output: self.output.as_bytes().to_vec(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct FakeCompose {
        downs: Arc<Mutex<Vec<PathBuf>>>,
    }

    #[async_trait]
    impl ComposeManager for FakeCompose {
        async fn down(&self, descriptor: &Path, _working_dir: &Path) -> Result<CapturedRun> {
            self.downs.lock().unwrap().push(descriptor.to_path_buf());
            Ok(CapturedRun {
                code: Some(0),
                output: b"stopped demo_web_1\n".to_vec(),
            })
        }
    }

    async fn provisioned(dir: &Path, project_type: ProjectType) -> MoleConfig {
        let config = MoleConfig::with_base_path(dir);
        let registry = Registry::new(&config);
        let project = registry
            .add(NewProject {
                name: "demo".into(),
                description: String::new(),
                repository_url: "https://git.example.com/demo.git".into(),
                branch: "main".into(),
            })
            .await
            .unwrap();

        let root = config.project_root("demo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            config.project_env_path("demo"),
            format!("{}={}\n", PROJECT_TYPE_KEY, project_type),
        )
        .unwrap();
        std::fs::write(root.join("mole-compose.yaml"), "name: {{.PName}}\n").unwrap();
        std::fs::write(root.join("mole-deploy.sh"), "echo {{.PName}} {{.PortApp}}\n").unwrap();

        let probe = FixedProbe(BTreeSet::new());
        let ports = PortAllocator::new(&config, &probe);
        SecretsGenerator::new(&config, &registry, &ports)
            .generate_for(&project)
            .await
            .unwrap();
        config
    }

    fn logs(config: &MoleConfig) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(config.deployment_log_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_successful_deployment_logs_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = provisioned(dir.path(), ProjectType::Podman).await;
        let git = FakeGit::default();
        let runner = FakeRunner::exiting(0, "demo 8000\n");
        let deployer = Deployer::new(
            config.clone(),
            Box::new(git.clone()),
            Box::new(runner.clone()),
            Box::new(FakeCompose::default()),
        );

        let report = deployer.deploy("demo").await.unwrap();

        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.output, "demo 8000\n");
        assert_eq!(*git.pulls.lock().unwrap(), vec!["main"]);
        assert_eq!(
            *runner.scripts.lock().unwrap(),
            vec![config.project_root("demo").join("mole-deploy-ready.sh")]
        );
        assert_eq!(
            std::fs::read_to_string(config.project_root("demo").join("mole-compose-ready.yaml")).unwrap(),
            "name: demo\n"
        );

        let names = logs(&config);
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("-demo-success.log"));
        assert_eq!(std::fs::read_to_string(&report.log_path).unwrap(), "demo 8000\n");
    }

    #[tokio::test]
    async fn test_failing_script_is_wrapped_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let config = provisioned(dir.path(), ProjectType::Systemd).await;
        let deployer = Deployer::new(
            config.clone(),
            Box::new(FakeGit::default()),
            Box::new(FakeRunner::exiting(3, "building\nerror: disk full\n")),
            Box::new(FakeCompose::default()),
        );

        let err = deployer.deploy("DEMO").await.unwrap_err();
        let MoleError::Deployment { project, log_path, output, source } = err else {
            panic!("expected a deployment error");
        };
        assert_eq!(project, "demo");
        assert_eq!(output, "building\nerror: disk full\n");
        assert!(matches!(
            *source,
            MoleError::ExternalProcess { code: 3, ref stderr, .. } if stderr == "error: disk full"
        ));
        assert!(log_path.to_string_lossy().ends_with("-demo-failure.log"));
        assert_eq!(std::fs::read_to_string(log_path).unwrap(), output);
        assert_eq!(logs(&config).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_project_still_leaves_a_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = provisioned(dir.path(), ProjectType::Podman).await;
        let runner = FakeRunner::exiting(0, "");
        let deployer = Deployer::new(
            config.clone(),
            Box::new(FakeGit::default()),
            Box::new(runner.clone()),
            Box::new(FakeCompose::default()),
        );

        let err = deployer.deploy("../Ghost").await.unwrap_err();
        let MoleError::Deployment { source, log_path, .. } = err else {
            panic!("expected a deployment error");
        };
        assert!(matches!(*source, MoleError::NotFound { .. }));
        assert!(log_path.to_string_lossy().ends_with("-___ghost-failure.log"));
        assert!(std::fs::read_to_string(log_path).unwrap().contains("../Ghost"));
        assert!(runner.scripts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_failure_stops_before_render() {
        let dir = tempfile::tempdir().unwrap();
        let config = provisioned(dir.path(), ProjectType::Podman).await;
        let runner = FakeRunner::exiting(0, "");
        let deployer = Deployer::new(
            config.clone(),
            Box::new(FakeGit {
                fail: true,
                ..FakeGit::default()
            }),
            Box::new(runner.clone()),
            Box::new(FakeCompose::default()),
        );

        let err = deployer.deploy("demo").await.unwrap_err();
        let MoleError::Deployment { source, log_path, .. } = err else {
            panic!("expected a deployment error");
        };
        assert!(matches!(*source, MoleError::ExternalProcess { .. }));
        assert!(std::fs::read_to_string(log_path).unwrap().contains("couldn't find remote ref"));
        assert!(!config.project_root("demo").join("mole-deploy-ready.sh").exists());
        assert!(runner.scripts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_projects_skip_sync() {
        let dir = tempfile::tempdir().unwrap();
        let config = provisioned(dir.path(), ProjectType::Static).await;
        let git = FakeGit::default();
        let deployer = Deployer::new(
            config,
            Box::new(git.clone()),
            Box::new(FakeRunner::exiting(0, "ok\n")),
            Box::new(FakeCompose::default()),
        );

        deployer.deploy("demo").await.unwrap();
        assert!(git.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_requires_container_project() {
        let dir = tempfile::tempdir().unwrap();
        let config = provisioned(dir.path(), ProjectType::Podman).await;
        let compose = FakeCompose::default();
        let deployer = Deployer::new(
            config.clone(),
            Box::new(FakeGit::default()),
            Box::new(FakeRunner::exiting(0, "")),
            Box::new(compose.clone()),
        );

        assert_eq!(deployer.teardown("demo").await.unwrap(), "stopped demo_web_1\n");
        assert_eq!(
            *compose.downs.lock().unwrap(),
            vec![config.project_root("demo").join("mole-compose-ready.yaml")]
        );
        assert!(logs(&config).is_empty());

        std::fs::write(config.project_env_path("demo"), "MOLE_PROJECT_TYPE=systemd\n").unwrap();
        assert!(matches!(
            deployer.teardown("demo").await,
            Err(MoleError::InvalidServiceType { project_type: ProjectType::Systemd })
        ));
    }

    #[tokio::test]
    async fn test_attempts_in_the_same_second_each_get_a_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = provisioned(dir.path(), ProjectType::Static).await;
        let deployer = Deployer::new(
            config.clone(),
            Box::new(FakeGit::default()),
            Box::new(FakeRunner::exiting(0, "ok\n")),
            Box::new(FakeCompose::default()),
        );

        for _ in 0..3 {
            let err = deployer.deploy("ghost").await.unwrap_err();
            assert!(matches!(err, MoleError::Deployment { .. }));
        }
        let mut reports = Vec::new();
        for _ in 0..3 {
            reports.push(deployer.deploy("demo").await.unwrap());
        }

        let names = logs(&config);
        assert_eq!(names.len(), 6);
        assert_eq!(names.iter().filter(|n| n.ends_with("-ghost-failure.log")).count(), 3);
        assert_eq!(names.iter().filter(|n| n.ends_with("-demo-success.log")).count(), 3);
        for report in reports {
            assert_eq!(std::fs::read_to_string(report.log_path).unwrap(), "ok\n");
        }
    }

    #[test]
    fn test_log_names() {
        assert_eq!(log_file_name(1700000000, "demo", Outcome::Success), "1700000000-demo-success.log");
        assert_eq!(sanitize_log_name("My App!"), "my_app_");
        assert_eq!(sanitize_log_name(""), "unknown");
    }
}
