//! kubelinkr
//!
//! A CLI for forwarding local ports to pods through the cluster API server.
//!
//! Forwards are grouped into projects declared in the config file:
//! - `start` runs one or more projects until Ctrl-C
//! - `forward` runs ad-hoc forwards to a single pod
//! - `projects` lists what the config file declares

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kubelinkr::config::{Config, EngineSettings};
use kubelinkr::kube::{CredentialResolver, KubeConfig};
use kubelinkr::tunnel::{
    ActiveForward, ForwardOptions, ForwardSpec, Project, TrafficSnapshot, TunnelEngine,
    WebSocketConnector,
};

#[derive(Parser, Debug)]
#[command(name = "kubelinkr")]
#[command(author, version, about = "Forward local ports to pods in your clusters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Kubeconfig file (defaults to $KUBECONFIG, then ~/.kube/config)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print forward and traffic updates as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start projects from the config file
    Start {
        /// Project names
        #[arg(required = true)]
        projects: Vec<String>,
    },

    /// Forward local ports to one pod
    Forward(ForwardArgs),

    /// List configured projects
    Projects,
}

#[derive(Parser, Debug)]
struct ForwardArgs {
    /// Kubeconfig context
    #[arg(long)]
    context: String,

    /// Namespace of the pod
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Close a connection when the pod doesn't answer within this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Pod name
    target: String,

    /// Port mappings as LOCAL:REMOTE
    #[arg(required = true)]
    ports: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Start { ref projects } => run_start(&cli, projects, config).await,
        Commands::Forward(ref args) => run_forward(&cli, args, config).await,
        Commands::Projects => {
            print_projects(&config);
            Ok(())
        }
    }
}

async fn run_start(cli: &Cli, names: &[String], config: Config) -> Result<()> {
    let projects = names
        .iter()
        .map(|name| {
            config.project(name).cloned().with_context(|| {
                format!(
                    "Unknown project '{}'. Run 'kubelinkr projects' to list them",
                    name
                )
            })
        })
        .collect::<Result<Vec<Project>>>()?;

    let engine = build_engine(cli, &config)?;

    for project in &projects {
        let started = engine
            .start_project(project, |spec, e| {
                error!("{}: {} failed to start: {}", project.name, spec.display_name(), e);
            })
            .await;

        if started.is_empty() && !project.forwards.is_empty() {
            error!("{}: no forward could be started", project.name);
        }
    }

    watch_until_interrupted(&engine, cli.json).await?;
    engine.shutdown().await;
    Ok(())
}

async fn run_forward(cli: &Cli, args: &ForwardArgs, config: Config) -> Result<()> {
    let mut project = Project::new(&args.target, &args.context);
    for mapping in &args.ports {
        let (local, remote) = parse_port_mapping(mapping)?;
        project = project.with_forward(
            ForwardSpec::new(&args.target, remote, local).with_namespace(&args.namespace),
        );
    }

    let engine = build_engine(cli, &config)?;
    let options = ForwardOptions {
        response_timeout: args.timeout_ms.map(Duration::from_millis),
    };

    let mut started = 0;
    for spec in &project.forwards {
        match engine.start_forward(&project, spec, options.clone()).await {
            Ok(_) => started += 1,
            Err(e) => error!("{} -> {}: {}", spec.local_port, spec.remote_port, e),
        }
    }

    if started == 0 {
        engine.shutdown().await;
        bail!("No forward could be started");
    }

    watch_until_interrupted(&engine, cli.json).await?;
    engine.shutdown().await;
    Ok(())
}

fn build_engine(cli: &Cli, config: &Config) -> Result<TunnelEngine> {
    let path = match cli.kubeconfig.clone().or_else(|| config.kubeconfig.clone()) {
        Some(path) => path,
        None => KubeConfig::default_path()?,
    };
    let kubeconfig = KubeConfig::load(&path)?;

    Ok(TunnelEngine::new(
        Arc::new(CredentialResolver::new(kubeconfig)),
        Arc::new(WebSocketConnector::new()),
        config.engine.clone(),
    ))
}

/// Print registry and traffic updates until Ctrl-C
async fn watch_until_interrupted(engine: &TunnelEngine, json: bool) -> Result<()> {
    let mut forwards = engine.subscribe_forwards();
    let mut traffic = engine.subscribe_traffic();

    let current = forwards.borrow_and_update().clone();
    print_forwards(&current, json)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Ok(()) = forwards.changed() => {
                let current = forwards.borrow_and_update().clone();
                print_forwards(&current, json)?;
            }
            Ok(()) = traffic.changed() => {
                let snapshot = traffic.borrow_and_update().clone();
                print_traffic(&snapshot, json)?;
            }
        }
    }

    println!();
    println!("Shutting down...");
    Ok(())
}

fn print_forwards(forwards: &[ActiveForward], json: bool) -> Result<()> {
    if json {
        let line = serde_json::json!({ "event": "forwards", "forwards": forwards });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    println!();
    if forwards.is_empty() {
        println!("  No active forwards");
        return Ok(());
    }

    println!("  Active forwards:");
    for forward in forwards {
        println!(
            "    {:<22} -> {}/{}:{}  [{} / {}]",
            forward.local_addr.to_string(),
            forward.namespace,
            forward.target,
            forward.remote_port,
            forward.project,
            forward.context
        );
    }
    Ok(())
}

fn print_traffic(snapshot: &TrafficSnapshot, json: bool) -> Result<()> {
    if json {
        let line = serde_json::json!({ "event": "traffic", "traffic": snapshot });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    for (project, entries) in snapshot {
        let latest = entries.last().map(|e| e.bytes).unwrap_or(0);
        if latest > 0 {
            let total: u64 = entries.iter().map(|e| e.bytes).sum();
            println!(
                "  {}: {} in the last second, {} in the last {}s",
                project,
                format_bytes(latest),
                format_bytes(total),
                entries.len()
            );
        }
    }
    Ok(())
}

fn print_projects(config: &Config) {
    if config.projects.is_empty() {
        println!("No projects configured.");
        if let Ok(path) = Config::config_path() {
            println!("Add projects to {}", path.display());
        }
        return;
    }

    for project in &config.projects {
        match &project.staging_group {
            Some(group) => println!("{} (context {}, group {})", project.name, project.context, group),
            None => println!("{} (context {})", project.name, project.context),
        }
        for spec in &project.forwards {
            println!(
                "  {:<20} {:>5} -> {}/{}:{}",
                spec.display_name(),
                spec.local_port,
                spec.namespace(),
                spec.target,
                spec.remote_port
            );
        }
    }
}

/// Parse `LOCAL:REMOTE`; a single port maps to itself
fn parse_port_mapping(mapping: &str) -> Result<(u16, u16)> {
    let parse = |port: &str| {
        port.parse::<u16>()
            .with_context(|| format!("Invalid port '{}' in '{}'", port, mapping))
    };

    match mapping.split_once(':') {
        Some((local, remote)) => Ok((parse(local)?, parse(remote)?)),
        None => {
            let port = parse(mapping)?;
            Ok((port, port))
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    match bytes {
        b if b >= 1024 * 1024 => format!("{:.1} MiB", b as f64 / (1024.0 * 1024.0)),
        b if b >= 1024 => format!("{:.1} KiB", b as f64 / 1024.0),
        b => format!("{} B", b),
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    // Logs go to stderr so JSON lines on stdout stay parseable
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
