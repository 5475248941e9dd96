// src/main.rs

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use nix::unistd::{geteuid, User};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use mole::ports::PortAllocator;
use mole::project::unit_name;
use mole::provision::Provisioner;
use mole::secrets::{load_bundle, SecretsGenerator};
use mole::services::ServiceLinker;
use mole::sys::build::BashScriptRunner;
use mole::sys::compose::PodmanComposeManager;
use mole::sys::git::SystemGitManager;
use mole::sys::net::ProcNetProbe;
use mole::sys::systemd::{ServiceManager, SystemctlManager, OWNED_UNIT_MARKER};
use mole::template::render_artifacts;
use mole::{Deployer, MoleConfig, MoleError, NewProject, ProjectEdit, ProjectType, Registry};

/// mole: deploy and operate projects on a single host
#[derive(Parser, Debug)]
#[command(name = "mole")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store root (overrides MOLE_BASE_PATH)
    #[arg(long, global = true)]
    base_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage registered projects
    #[command(subcommand)]
    Projects(ProjectCommands),

    /// Deploy a project, or stop its compose stack
    Deploy {
        project: String,
        /// Run compose down instead of deploying (podman projects only)
        #[arg(long)]
        teardown: bool,
    },

    /// Render project templates
    #[command(subcommand)]
    Templates(TemplateCommands),

    /// Manage project secrets
    #[command(subcommand)]
    Secrets(SecretCommands),

    /// Link and control service units
    #[command(subcommand)]
    Services(ServiceCommands),

    /// Show ports in use on the host and ports reserved by mole
    Ports,

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// List all projects
    #[command(alias = "ls")]
    List,

    /// Show one project by name or ID
    Find { term: String },

    /// Clone and register a new project
    Add {
        name: String,
        #[arg(short, long)]
        repository: String,
        #[arg(short, long, default_value = "main")]
        branch: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// static, podman or systemd
        #[arg(short = 't', long = "type")]
        project_type: String,
        /// Deploy right after registering
        #[arg(long)]
        deploy: bool,
    },

    /// Change a project's description or branch
    Edit {
        term: String,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Remove a project from the registry (by ID)
    Delete {
        id: String,
        /// Confirm the deletion
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TemplateCommands {
    /// Render the compose descriptor and deploy script from the stored secrets
    Transform { project: String },
}

#[derive(Subcommand, Debug)]
enum SecretCommands {
    /// Generate (or rotate) a project's secrets
    Generate { project: String },
}

#[derive(Subcommand, Debug)]
enum ServiceCommands {
    /// List units managed by mole
    List,

    /// Reread unit files
    Reload,

    /// Link a project's units into the service manager
    Link {
        project: String,
        #[arg(short = 't', long = "type")]
        project_type: String,
    },

    /// Remove a project's links and drop-ins
    Unlink { project: String },

    /// Apply lifecycle actions to a unit (enable, start, stop, disable, in that order)
    Action {
        unit: String,
        /// Treat UNIT as a service of this project (mole-<project>-<unit>)
        #[arg(short, long)]
        project: Option<String>,
        #[arg(long)]
        start: bool,
        #[arg(long)]
        stop: bool,
        #[arg(long)]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },

    /// Reload a unit in place, or fully restart it with --full
    Restart {
        unit: String,
        #[arg(short, long)]
        project: Option<String>,
        /// Stop, reload unit files, then start
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ==============================================================================
    // 1. Logging & Configuration
    // ==============================================================================

    let filter = if cli.verbose {
        EnvFilter::new("mole=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mole=info"))
    };
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    if let Commands::Version = cli.command {
        println!("mole v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = MoleConfig::load_rooted(cli.base_path).context("invalid configuration")?;
    ensure_operator(&config)?;
    debug!(base = %config.base_path.display(), "configuration loaded");

    // ==============================================================================
    // 2. Dispatch
    // ==============================================================================

    match cli.command {
        Commands::Projects(cmd) => projects(&config, cmd).await,
        Commands::Deploy { project, teardown } => deploy(&config, &project, teardown).await,
        Commands::Templates(TemplateCommands::Transform { project }) => {
            let project = Registry::new(&config).find(&project).await?;
            let bundle = load_bundle(&config, &project.name).await?;
            render_artifacts(&config, &bundle).await?;
            println!("Templates rendered for {}", project.name);
            Ok(())
        }
        Commands::Secrets(SecretCommands::Generate { project }) => {
            let registry = Registry::new(&config);
            let probe = ProcNetProbe::new();
            let ports = PortAllocator::new(&config, &probe);
            let bundle = SecretsGenerator::new(&config, &registry, &ports)
                .generate(&project)
                .await?;
            println!(
                "Secrets generated for {} (ports {}, {}, {})",
                bundle.project_name, bundle.port_app, bundle.port_two, bundle.port_three
            );
            Ok(())
        }
        Commands::Services(cmd) => services(&config, cmd).await,
        Commands::Ports => {
            let probe = ProcNetProbe::new();
            let ports = PortAllocator::new(&config, &probe);
            println!("In use:   {}", join_ports(ports.report().await?));
            println!("Reserved: {}", join_ports(ports.reserved().await?));
            Ok(())
        }
        Commands::Version => Ok(()),
    }
}

/// 🛡️ Refuses root, and any user other than the configured operator.
fn ensure_operator(config: &MoleConfig) -> anyhow::Result<()> {
    let Some(required) = &config.required_user else {
        return Ok(());
    };

    let uid = geteuid();
    if uid.is_root() {
        bail!("mole must not be run as root");
    }
    let user = User::from_uid(uid)
        .context("failed to look up the current user")?
        .map(|u| u.name)
        .unwrap_or_default();
    if &user != required {
        bail!("mole must be run as '{}' (current user: '{}')", required, user);
    }
    Ok(())
}

fn deployer(config: &MoleConfig) -> Deployer {
    Deployer::new(
        config.clone(),
        Box::new(SystemGitManager),
        Box::new(BashScriptRunner),
        Box::new(PodmanComposeManager::new(config.compose_bin.clone())),
    )
}

async fn projects(config: &MoleConfig, cmd: ProjectCommands) -> anyhow::Result<()> {
    let registry = Registry::new(config);

    match cmd {
        ProjectCommands::List => {
            let projects = registry.list().await?;
            if projects.is_empty() {
                println!("No projects yet. Add one with `mole projects add`.");
            }
            for project in projects {
                println!("{}\n", project);
            }
        }
        ProjectCommands::Find { term } => {
            println!("{}", registry.find(&term).await?);
        }
        ProjectCommands::Add {
            name,
            repository,
            branch,
            description,
            project_type,
            deploy: deploy_now,
        } => {
            let project_type: ProjectType = project_type.parse()?;
            let probe = ProcNetProbe::new();
            let ports = PortAllocator::new(config, &probe);
            let secrets = SecretsGenerator::new(config, &registry, &ports);
            let git = SystemGitManager;

            let project = Provisioner::new(config, &registry, &secrets, &git)
                .create(
                    NewProject {
                        name,
                        description,
                        repository_url: repository,
                        branch,
                    },
                    project_type,
                )
                .await?;
            println!("Project created:\n{}", project);

            if deploy_now {
                deploy(config, &project.name, false).await?;
            }
        }
        ProjectCommands::Edit {
            term,
            description,
            branch,
        } => {
            let project = registry.edit(&term, ProjectEdit { description, branch }).await?;
            println!("Project updated:\n{}", project);
        }
        ProjectCommands::Delete { id, yes } => {
            if !yes {
                bail!("refusing to delete {} without --yes", id);
            }
            let project = registry.delete(&id).await?;
            println!("Project {} deleted", project.name);
        }
    }
    Ok(())
}

async fn deploy(config: &MoleConfig, project: &str, teardown: bool) -> anyhow::Result<()> {
    let deployer = deployer(config);

    if teardown {
        print!("{}", deployer.teardown(project).await?);
        println!("Teardown finished for {}", project);
        return Ok(());
    }

    match deployer.deploy(project).await {
        Ok(report) => {
            print!("{}", report.output);
            println!("Deployment of {} succeeded (log: {})", report.project, report.log_path.display());
            Ok(())
        }
        Err(e) => {
            if let MoleError::Deployment { output, .. } = &e {
                print!("{}", output);
            }
            Err(e.into())
        }
    }
}

async fn services(config: &MoleConfig, cmd: ServiceCommands) -> anyhow::Result<()> {
    let manager = SystemctlManager::new();

    match cmd {
        ServiceCommands::List => {
            for unit in manager.list_units(OWNED_UNIT_MARKER).await? {
                println!(
                    "{:<48} {:<8} {:<10} {}",
                    unit.name, unit.active_state, unit.sub_state, unit.description
                );
            }
        }
        ServiceCommands::Reload => {
            manager.daemon_reload().await?;
            println!("Unit files reloaded");
        }
        ServiceCommands::Link { project, project_type } => {
            let project_type: ProjectType = project_type.parse()?;
            let project = Registry::new(config).find(&project).await?;
            let report = ServiceLinker::new(config).link(&project, project_type).await?;
            for link in &report.linked {
                println!("linked {}", link.display());
            }
            if !report.skipped.is_empty() {
                println!("{} link(s) already present", report.skipped.len());
            }
        }
        ServiceCommands::Unlink { project } => {
            let project = Registry::new(config).find(&project).await?;
            for path in ServiceLinker::new(config).unlink(&project).await? {
                println!("removed {}", path.display());
            }
        }
        ServiceCommands::Action {
            unit,
            project,
            start,
            stop,
            enable,
            disable,
        } => {
            if !(start || stop || enable || disable) {
                bail!("nothing to do: pass at least one of --start, --stop, --enable, --disable");
            }
            let unit = qualified_unit(project.as_deref(), unit);
            if enable {
                manager.enable(&unit).await?;
            }
            if start {
                manager.start(&unit).await?;
            }
            if stop {
                manager.stop(&unit).await?;
            }
            if disable {
                manager.disable(&unit).await?;
            }
            println!("Done: {}", unit);
        }
        ServiceCommands::Restart { unit, project, full } => {
            let unit = qualified_unit(project.as_deref(), unit);
            mole::services::restart(&manager, &unit, full).await?;
            println!("Restarted {}", unit);
        }
    }
    Ok(())
}

fn qualified_unit(project: Option<&str>, unit: String) -> String {
    match project {
        Some(project) => unit_name(project, &unit),
        None => unit,
    }
}

fn join_ports(ports: impl IntoIterator<Item = u16>) -> String {
    let ports: BTreeSet<u16> = ports.into_iter().collect();
    if ports.is_empty() {
        return "-".to_string();
    }
    ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
}
