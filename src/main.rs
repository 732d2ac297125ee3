use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edgeflow_core::clock::SystemClock;
use edgeflow_core::config::FlowConfig;
use edgeflow_core::types::{EventId, RecordId};
use edgeflow_provenance::{ProvenanceEvent, ProvenanceLog, RetentionPolicy};

#[derive(Parser)]
#[command(name = "edgeflow", version, about = "Edge dataflow engine operator tools")]
struct Cli {
    /// Path to the flow file
    #[arg(short, long, default_value = "flow.toml", env = "EDGEFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the flow file and print the graph
    Check,
    /// Inspect or purge the provenance log
    Provenance {
        #[command(subcommand)]
        action: ProvenanceAction,
    },
}

#[derive(Subcommand)]
enum ProvenanceAction {
    /// Print one event as JSON
    Show {
        /// Event ID
        id: String,
    },
    /// Print every event recorded for a record
    Lineage {
        /// Record ID
        id: String,
    },
    /// Print the newest events
    Recent {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Run one purge pass with the configured limits
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("edgeflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => check(&cli.config),
        Commands::Provenance { action } => {
            let config = load_or_default(&cli.config)?;
            let log = ProvenanceLog::open(
                &config.provenance.db_path(),
                RetentionPolicy::from(&config.provenance),
                Arc::new(SystemClock),
            )?;
            let outcome = provenance(&log, action);
            log.shutdown().await;
            outcome
        }
    }
}

fn load_or_default(path: &Path) -> anyhow::Result<FlowConfig> {
    if path.exists() {
        Ok(FlowConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "Flow file not found, using defaults");
        Ok(FlowConfig::default())
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = FlowConfig::load(path)?;
    info!(path = %path.display(), "Flow file is valid");

    println!("Engine:");
    println!("  content_dir:           {}", config.engine.content_dir);
    println!("  timer_driven_threads:  {}", config.engine.timer_driven_threads);
    println!("  event_driven_threads:  {}", config.engine.event_driven_threads);
    println!("Provenance:");
    println!("  db_path:               {}", config.provenance.db_path);
    println!("  max_age_ms:            {}", config.provenance.max_age_ms);
    println!("  max_storage_bytes:     {}", config.provenance.max_storage_bytes);

    println!("Processors ({}):", config.processors.len());
    for p in &config.processors {
        let mut line = format!(
            "  {:<20} {:<20} {} every {}ms, {} task(s)",
            p.name,
            p.kind,
            p.scheduling.strategy,
            p.scheduling.period_ms,
            p.scheduling.max_concurrent_tasks
        );
        if !p.auto_terminate.is_empty() {
            line.push_str(&format!(", auto-terminates {}", p.auto_terminate.join(",")));
        }
        println!("{}", line);
    }

    println!("Connections ({}):", config.connections.len());
    for c in &config.connections {
        let bound = match (c.max_queue_count, c.max_queue_bytes) {
            (0, 0) => "unbounded".to_string(),
            (count, 0) => format!("max {} records", count),
            (0, bytes) => format!("max {} bytes", bytes),
            (count, bytes) => format!("max {} records / {} bytes", count, bytes),
        };
        println!(
            "  {:<20} {} --{}--> {} ({})",
            c.name, c.source, c.relationship, c.destination, bound
        );
    }
    Ok(())
}

fn provenance(log: &ProvenanceLog, action: ProvenanceAction) -> anyhow::Result<()> {
    match action {
        ProvenanceAction::Show { id } => {
            let id: EventId = id.parse()?;
            match log.get(&id)? {
                Some(event) => println!("{}", serde_json::to_string_pretty(&event)?),
                None => anyhow::bail!("no provenance event {}", id),
            }
        }
        ProvenanceAction::Lineage { id } => {
            let id: RecordId = id.parse()?;
            let events = log.events_for_record(&id)?;
            if events.is_empty() {
                println!("No events for record {}.", id);
            }
            for event in &events {
                print_event(event);
            }
        }
        ProvenanceAction::Recent { limit } => {
            let stats = log.stats()?;
            println!("{} event(s), {} bytes stored", stats.events, stats.bytes);
            for event in log.recent(limit)? {
                print_event(&event);
            }
        }
        ProvenanceAction::Purge => {
            let before = log.stats()?;
            let removed = log.purge()?;
            let after = log.stats()?;
            println!(
                "Purged {} event(s): {} -> {} bytes",
                removed, before.bytes, after.bytes
            );
        }
    }
    Ok(())
}

fn print_event(event: &ProvenanceEvent) {
    let when = chrono::DateTime::from_timestamp_millis(event.timestamp() as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| event.timestamp().to_string());
    let mut line = format!(
        "{}  {:<19} {:<16} {}",
        when,
        event.event_type().as_str(),
        event.component_id(),
        event.record_id()
    );
    if let Some(relationship) = event.relationship() {
        line.push_str(&format!(" [{}]", relationship));
    }
    if let Some(details) = event.details() {
        line.push_str(&format!(" {}", details));
    }
    println!("{}", line);
}
