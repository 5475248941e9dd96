// src/services.rs

//! Links a project's declared unit files into the service manager's user
//! unit directories, and removes them again.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_stream::try_stream;
use tokio::fs;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::config::MoleConfig;
use crate::error::{MoleError, Result};
use crate::project::{Project, ProjectType};
use crate::sys::systemd::ServiceManager;

pub const DROP_IN_FILE: &str = "override.conf";

/// What a `link` call changed on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkReport {
    pub linked: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

pub struct ServiceLinker<'a> {
    config: &'a MoleConfig,
}

impl<'a> ServiceLinker<'a> {
    pub fn new(config: &'a MoleConfig) -> Self {
        Self { config }
    }

    pub async fn link(&self, project: &Project, project_type: ProjectType) -> Result<LinkReport> {
        let dest_dir = project_type
            .link_destination(self.config)
            .ok_or(MoleError::InvalidServiceType { project_type })?;

        let source_dir = self.config.project_services_dir(&project.name);
        fs::metadata(&source_dir)
            .await
            .map_err(|source| MoleError::ServicesDirMissing {
                path: source_dir.clone(),
                source,
            })?;

        fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| MoleError::io(&dest_dir, e))?;

        let files = unit_files(source_dir);
        tokio::pin!(files);
        let mut units = Vec::new();
        while let Some(unit) = files.next().await {
            units.push(unit?);
        }

        // link names are flat, so two nested files with one basename would share a link
        let mut by_name: BTreeMap<&str, &Path> = BTreeMap::new();
        for unit in &units {
            let Some(file_name) = unit.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(first) = by_name.insert(file_name, unit) {
                return Err(MoleError::validation(format!(
                    "unit files {} and {} would both link as {}{}",
                    first.display(),
                    unit.display(),
                    project.link_prefix(),
                    file_name
                )));
            }
        }

        let mut report = LinkReport::default();
        for unit in &units {
            let Some(file_name) = unit.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let link_name = format!("{}{}", project.link_prefix(), file_name);
            let link_path = dest_dir.join(&link_name);

            if fs::symlink_metadata(&link_path).await.is_ok() {
                warn!(link = %link_path.display(), "link already exists, skipping");
                report.skipped.push(link_path);
                continue;
            }

            fs::symlink(unit, &link_path)
                .await
                .map_err(|e| MoleError::io(&link_path, e))?;
            info!(unit = %unit.display(), link = %link_path.display(), "linked unit");

            let drop_in_dir = dest_dir.join(format!("{}.d", link_name));
            fs::create_dir_all(&drop_in_dir)
                .await
                .map_err(|e| MoleError::io(&drop_in_dir, e))?;
            let drop_in = drop_in_dir.join(DROP_IN_FILE);
            fs::write(&drop_in, drop_in_contents(&project.name))
                .await
                .map_err(|e| MoleError::io(&drop_in, e))?;

            report.linked.push(link_path);
        }

        Ok(report)
    }

    /// Removes every link and drop-in directory owned by `project` from both
    /// unit directories. Entries of other projects are left alone, even when
    /// their names share a prefix.
    pub async fn unlink(&self, project: &Project) -> Result<Vec<PathBuf>> {
        let prefix = project.link_prefix();
        let project_root = self.config.project_root(&project.name);
        let dest_dirs = [&self.config.systemd_dir, &self.config.quadlet_dir];
        let mut removed = Vec::new();

        // enable-style links (`*.wants/...`) point at our links, not into the project
        let mut own_links = BTreeSet::new();
        for dest_dir in dest_dirs {
            own_links.extend(top_level_links(dest_dir, &prefix, &project_root).await?);
        }

        for dest_dir in dest_dirs {
            let mut pending = vec![dest_dir.clone()];

            while let Some(dir) = pending.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(MoleError::io(&dir, e)),
                };

                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| MoleError::io(&dir, e))?
                {
                    let path = entry.path();
                    let file_type = entry.file_type().await.map_err(|e| MoleError::io(&path, e))?;
                    let named = entry
                        .file_name()
                        .to_str()
                        .is_some_and(|n| n.contains(&prefix));

                    let owned_link = named
                        && file_type.is_symlink()
                        && (links_into(&path, &project_root).await
                            || resolved_target(&path).await.is_some_and(|t| own_links.contains(&t)));

                    if owned_link {
                        fs::remove_file(&path).await.map_err(|e| MoleError::io(&path, e))?;
                    } else if named && file_type.is_dir() && is_drop_in_for(&path, &project.name).await {
                        // removed in one step; its children are never visited
                        fs::remove_dir_all(&path).await.map_err(|e| MoleError::io(&path, e))?;
                    } else {
                        if file_type.is_dir() {
                            pending.push(path);
                        }
                        continue;
                    }

                    info!(path = %path.display(), "removed service link");
                    removed.push(path);
                }
            }
        }

        Ok(removed)
    }
}

/// Every regular file under `root`, recursively. Symlinks are not followed.
fn unit_files(root: PathBuf) -> impl Stream<Item = Result<PathBuf>> {
    try_stream! {
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let read = fs::read_dir(&dir).await.map_err(|e| MoleError::io(&dir, e))?;
            let mut entries = ReadDirStream::new(read);
            let mut files = Vec::new();

            while let Some(entry) = entries.next().await {
                let entry = entry.map_err(|e| MoleError::io(&dir, e))?;
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| MoleError::io(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    files.push(path);
                }
            }

            files.sort();
            for file in files {
                yield file;
            }
        }
    }
}

fn drop_in_contents(project_name: &str) -> String {
    ["Service", "Container", "Build"]
        .iter()
        .map(|section| format!("[{}]\nEnvironment=\"MOLE_PROJECT_NAME={}\"\n", section, project_name))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn links_into(link: &Path, project_root: &Path) -> bool {
    resolved_target(link)
        .await
        .is_some_and(|target| target.starts_with(project_root))
}

/// A symlink's target, made absolute against the link's directory and
/// lexically normalized. The target itself need not exist.
async fn resolved_target(link: &Path) -> Option<PathBuf> {
    let target = fs::read_link(link).await.ok()?;
    let joined = match link.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target,
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Some(normalized)
}

/// Links `link` created for this project directly inside `dir`.
async fn top_level_links(dir: &Path, prefix: &str, project_root: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MoleError::io(dir, e)),
    };

    let mut links = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| MoleError::io(dir, e))? {
        let path = entry.path();
        let is_symlink = entry
            .file_type()
            .await
            .map_err(|e| MoleError::io(&path, e))?
            .is_symlink();
        let named = entry.file_name().to_str().is_some_and(|n| n.starts_with(prefix));
        if named && is_symlink && links_into(&path, project_root).await {
            links.push(path);
        }
    }
    Ok(links)
}

async fn is_drop_in_for(dir: &Path, project_name: &str) -> bool {
    if dir.extension().and_then(|e| e.to_str()) != Some("d") {
        return false;
    }
    let marker = format!("Environment=\"MOLE_PROJECT_NAME={}\"", project_name);
    fs::read_to_string(dir.join(DROP_IN_FILE))
        .await
        .is_ok_and(|conf| conf.lines().any(|l| l.trim() == marker))
}

// ==============================================================================
// Lifecycle helpers
// ==============================================================================

/// `services restart`: a plain restart asks the unit to reload in place,
/// `full` goes through [`restart_hard`].
pub async fn restart(manager: &dyn ServiceManager, unit: &str, full: bool) -> Result<()> {
    if full {
        restart_hard(manager, unit).await
    } else {
        manager.reload(unit).await
    }
}

/// Stop, reread unit files, start. Three separate requests.
pub async fn restart_hard(manager: &dyn ServiceManager, unit: &str) -> Result<()> {
    manager.stop(unit).await?;
    manager.daemon_reload().await?;
    manager.start(unit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::sys::systemd::UnitStatus;

    fn project(name: &str) -> Project {
        Project {
            id: format!("id-{}", name),
            name: name.to_string(),
            description: String::new(),
            repository_url: String::new(),
            branch: "main".to_string(),
        }
    }

    fn declare_units(config: &MoleConfig, name: &str, units: &[&str]) {
        let dir = config.project_services_dir(name);
        std::fs::create_dir_all(&dir).unwrap();
        for unit in units {
            std::fs::write(dir.join(unit), "[Unit]\nDescription=test\n").unwrap();
        }
    }

    fn snapshot(dir: &Path) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(d) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&d) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                out.insert(path.strip_prefix(dir).unwrap().display().to_string());
                if entry.file_type().unwrap().is_dir() {
                    pending.push(path);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn test_link_creates_links_and_drop_ins() {
        let dir = tempfile::tempdir().unwrap();
        let config = MoleConfig::with_base_path(dir.path());
        declare_units(&config, "test-project", &["asdf.service", "aaa.container"]);
        let linker = ServiceLinker::new(&config);
        let p = project("test-project");

        let report = linker.link(&p, ProjectType::Podman).await.unwrap();
        assert_eq!(report.linked.len(), 2);

        let link = config.quadlet_dir.join("mole-test-project-asdf.service");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            config.project_services_dir("test-project").join("asdf.service")
        );
        assert!(config.quadlet_dir.join("mole-test-project-aaa.container").exists());

        let conf = std::fs::read_to_string(
            config
                .quadlet_dir
                .join("mole-test-project-asdf.service.d")
                .join(DROP_IN_FILE),
        )
        .unwrap();
        assert_eq!(
            conf,
            "[Service]\nEnvironment=\"MOLE_PROJECT_NAME=test-project\"\n\n\
             [Container]\nEnvironment=\"MOLE_PROJECT_NAME=test-project\"\n\n\
             [Build]\nEnvironment=\"MOLE_PROJECT_NAME=test-project\"\n"
        );

        linker.link(&p, ProjectType::Systemd).await.unwrap();
        assert!(config.systemd_dir.join("mole-test-project-asdf.service").exists());
    }

    #[tokio::test]
    async fn test_link_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = MoleConfig::with_base_path(dir.path());
        declare_units(&config, "demo", &["web.service"]);
        let linker = ServiceLinker::new(&config);
        let p = project("demo");

        linker.link(&p, ProjectType::Systemd).await.unwrap();
        let after_first = snapshot(&config.systemd_dir);

        let report = linker.link(&p, ProjectType::Systemd).await.unwrap();
        assert!(report.linked.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(snapshot(&config.systemd_dir), after_first);
    }

    #[tokio::test]
    async fn test_link_rejects_static_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = MoleConfig::with_base_path(dir.path());
        let linker = ServiceLinker::new(&config);
        let p = project("demo");

        assert!(matches!(
            linker.link(&p, ProjectType::Static).await,
            Err(MoleError::InvalidServiceType { project_type: ProjectType::Static })
        ));
        let err = linker.link(&p, ProjectType::Systemd).await.unwrap_err();
        assert!(matches!(err, MoleError::ServicesDirMissing { .. }));
        assert!(err.to_string().contains("services directory must exist"));
    }

    #[tokio::test]
    async fn test_link_walks_nested_dirs_and_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let config = MoleConfig::with_base_path(dir.path());
        declare_units(&config, "demo", &["web.service"]);
        let services = config.project_services_dir("demo");
        std::fs::create_dir_all(services.join("extra")).unwrap();
        std::fs::write(services.join("extra").join("worker.service"), "").unwrap();
        std::os::unix::fs::symlink("/etc/passwd", services.join("sneaky.service")).unwrap();

        let report = ServiceLinker::new(&config)
            .link(&project("demo"), ProjectType::Systemd)
            .await
            .unwrap();

        let names: BTreeSet<_> = report
            .linked
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            BTreeSet::from([
                "mole-demo-web.service".to_string(),
                "mole-demo-worker.service".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_unlink_removes_only_own_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = MoleConfig::with_base_path(dir.path());
        declare_units(&config, "demo", &["web.service"]);
        declare_units(&config, "demo-app", &["web.service"]);
        declare_units(&config, "other", &["db.container"]);
        let linker = ServiceLinker::new(&config);

        let before = snapshot(&config.systemd_dir);
        linker.link(&project("demo"), ProjectType::Systemd).await.unwrap();
        linker.link(&project("demo"), ProjectType::Podman).await.unwrap();
        linker.link(&project("demo-app"), ProjectType::Systemd).await.unwrap();
        linker.link(&project("other"), ProjectType::Podman).await.unwrap();

        let removed = linker.unlink(&project("demo")).await.unwrap();
        assert_eq!(removed.len(), 4);

        let systemd = snapshot(&config.systemd_dir);
        assert!(!systemd.contains("mole-demo-web.service"));
        assert!(!systemd.contains("mole-demo-web.service.d"));
        assert!(systemd.contains("mole-demo-app-web.service"));
        assert!(systemd.contains("mole-demo-app-web.service.d/override.conf"));

        let quadlets = snapshot(&config.quadlet_dir);
        assert!(!quadlets.contains("mole-demo-web.service"));
        assert!(quadlets.contains("mole-other-db.container"));
        assert!(quadlets.contains("mole-other-db.container.d"));

        linker.unlink(&project("demo-app")).await.unwrap();
        assert_eq!(snapshot(&config.systemd_dir), before);
    }

    #[tokio::test]
    async fn test_link_rejects_nested_files_sharing_a_basename() {
        let dir = tempfile::tempdir().unwrap();
        let config = MoleConfig::with_base_path(dir.path());
        let services = config.project_services_dir("demo");
        for sub in ["a", "b"] {
            std::fs::create_dir_all(services.join(sub)).unwrap();
            std::fs::write(services.join(sub).join("web.service"), "").unwrap();
        }

        let err = ServiceLinker::new(&config)
            .link(&project("demo"), ProjectType::Systemd)
            .await
            .unwrap_err();
        let MoleError::Validation { message } = err else {
            panic!("expected a validation error");
        };
        assert!(message.contains("mole-demo-web.service"));
        assert!(message.contains(&services.join("a").join("web.service").display().to_string()));
        assert!(message.contains(&services.join("b").join("web.service").display().to_string()));
        assert!(snapshot(&config.systemd_dir).is_empty());
    }

    #[tokio::test]
    async fn test_unlink_removes_enable_links_to_own_units() {
        let dir = tempfile::tempdir().unwrap();
        let config = MoleConfig::with_base_path(dir.path());
        declare_units(&config, "demo", &["web.service"]);
        declare_units(&config, "demo-app", &["web.service"]);
        let linker = ServiceLinker::new(&config);
        linker.link(&project("demo"), ProjectType::Systemd).await.unwrap();
        linker.link(&project("demo-app"), ProjectType::Systemd).await.unwrap();

        // what `systemctl --user enable` leaves behind, one absolute and one relative
        let wants = config.systemd_dir.join("default.target.wants");
        std::fs::create_dir_all(&wants).unwrap();
        std::os::unix::fs::symlink(
            config.systemd_dir.join("mole-demo-web.service"),
            wants.join("mole-demo-web.service"),
        )
        .unwrap();
        std::os::unix::fs::symlink("../mole-demo-app-web.service", wants.join("mole-demo-app-web.service"))
            .unwrap();

        let removed = linker.unlink(&project("demo")).await.unwrap();
        assert!(removed.contains(&wants.join("mole-demo-web.service")));
        assert_eq!(removed.len(), 3);

        let systemd = snapshot(&config.systemd_dir);
        assert!(!systemd.contains("default.target.wants/mole-demo-web.service"));
        assert!(systemd.contains("default.target.wants/mole-demo-app-web.service"));
        assert!(systemd.contains("mole-demo-app-web.service"));

        linker.unlink(&project("demo-app")).await.unwrap();
        assert!(!snapshot(&config.systemd_dir).contains("default.target.wants/mole-demo-app-web.service"));
    }

    #[tokio::test]
    async fn test_unlink_without_destination_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = MoleConfig::with_base_path(dir.path());
        let removed = ServiceLinker::new(&config).unlink(&project("demo")).await.unwrap();
        assert!(removed.is_empty());
    }

    #[derive(Default)]
    struct RecordingManager {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingManager {
        fn record(&self, call: String) -> Result<()> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl ServiceManager for RecordingManager {
        async fn enable(&self, unit: &str) -> Result<()> { self.record(format!("enable {}", unit)) }
        async fn disable(&self, unit: &str) -> Result<()> { self.record(format!("disable {}", unit)) }
        async fn start(&self, unit: &str) -> Result<()> { self.record(format!("start {}", unit)) }
        async fn stop(&self, unit: &str) -> Result<()> { self.record(format!("stop {}", unit)) }
        async fn reload(&self, unit: &str) -> Result<()> { self.record(format!("reload {}", unit)) }
        async fn restart(&self, unit: &str) -> Result<()> { self.record(format!("restart {}", unit)) }
        async fn daemon_reload(&self) -> Result<()> { self.record("daemon-reload".to_string()) }
        async fn list_units(&self, _filter: &str) -> Result<Vec<UnitStatus>> { Ok(Vec::new()) }
    }

    #[tokio::test]
    async fn test_restart_hard_sequence() {
        let manager = RecordingManager::default();
        restart_hard(&manager, "mole-demo-web.service").await.unwrap();
        assert_eq!(
            *manager.calls.lock().unwrap(),
            vec![
                "stop mole-demo-web.service",
                "daemon-reload",
                "start mole-demo-web.service"
            ]
        );
    }

    #[tokio::test]
    async fn test_plain_restart_reloads_in_place() {
        let manager = RecordingManager::default();
        restart(&manager, "mole-demo-web.service", false).await.unwrap();
        assert_eq!(*manager.calls.lock().unwrap(), vec!["reload mole-demo-web.service"]);

        let manager = RecordingManager::default();
        restart(&manager, "mole-demo-web.service", true).await.unwrap();
        assert_eq!(manager.calls.lock().unwrap().len(), 3);
    }
}
