// Quotagate - Main Entry Point
//
// Operator CLI for the quota engine:
// - validate a configuration and report skipped rule entries
// - show which rule applies to a project or a set of groups
// - print the engine status snapshot

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quotagate::config::Config;
use quotagate::rules::Identity;
use quotagate::{metrics, QuotaEngine};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Quotagate: quota and admission control engine
#[derive(Parser, Debug)]
#[command(name = "quotagate")]
#[command(author = "Quotagate Contributors")]
#[command(version)]
#[command(about = "Quota and admission control for shared multi-tenant servers", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/quotagate/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the configuration and list rule entries that would be skipped
    Validate,
    /// Show the rule that applies to a project or to members of groups
    Resolve {
        /// Project name, e.g. team/app
        #[arg(long, conflicts_with = "groups", required_unless_present = "groups")]
        project: Option<String>,

        /// Comma-separated group names
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
    },
    /// Print the status of an engine built from the configuration as JSON.
    ///
    /// The engine is fresh, so this shows static configuration only: no
    /// running tasks, cached buckets or tracked sizes of a live host.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config, args.verbose)?;

    if config.metrics.enabled {
        metrics::init().context("Failed to register metrics")?;
    }

    match args.command {
        Some(Commands::Validate) => validate(&config),
        Some(Commands::Resolve { project, groups }) => resolve(&config, project, groups).await,
        Some(Commands::Status) => status(&config),
        None => {
            info!("No command specified. Use \"quotagate --help\" for usage.");
            Ok(())
        }
    }
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    let (rules, skipped) = config.rule_set();

    println!(
        "Rules: {} group scope(s), {} namespace scope(s), global {}",
        rules.groups().len(),
        rules.namespaces().len(),
        if rules.global().is_some() { "set" } else { "not set" }
    );
    for queue in config.queues.sizes() {
        println!("Queue {}: {} thread(s)", queue.0, queue.1);
    }

    if skipped.is_empty() {
        println!("Configuration OK");
        return Ok(());
    }

    for entry in &skipped {
        println!("Skipped: {}", entry);
    }
    anyhow::bail!("{} rule entries would be skipped", skipped.len())
}

async fn resolve(config: &Config, project: Option<String>, groups: Vec<String>) -> Result<()> {
    let (engine, _) = QuotaEngine::from_config(config);
    let resolver = engine.rules().resolver();

    if let Some(project) = project {
        let Some(resolved) = resolver.resolve_project(&project) else {
            println!("No rule applies to project {}", project);
            return Ok(());
        };
        println!("Project {} -> {}", project, resolved.rule.scope);
        println!("Resolved namespace: {}", resolved.namespace);
        if let Some(max) = resolved.rule.max_projects() {
            println!("maxProjects: {}", max);
        }
        if let Some(max) = resolved.rule.max_repo_size() {
            println!("maxRepoSize: {}", max);
        }
        if let Some(max) = resolved.rule.max_total_size() {
            println!("maxTotalSize: {}", max);
        }
        match engine.available_headroom(&project).await {
            Ok(Some(headroom)) => println!("Headroom: {} bytes", headroom),
            Ok(None) => println!("Headroom: unlimited"),
            Err(e) => println!("Headroom: unavailable ({})", e),
        }
        return Ok(());
    }

    let identity = Identity::account(0, groups.iter().cloned());
    match resolver.resolve_identity(&identity) {
        Some(rule) => {
            println!("Groups [{}] -> {}", groups.join(", "), rule.scope);
            for limit in &rule.limits {
                println!("  {:?}", limit);
            }
        }
        None => println!("No group rule applies to [{}]", groups.join(", ")),
    }
    if let Some(global) = resolver.global() {
        println!("Global rule: {} limit(s)", global.limits.len());
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let (engine, _) = QuotaEngine::from_config(config);
    println!("{}", engine.status().to_json()?);
    Ok(())
}
