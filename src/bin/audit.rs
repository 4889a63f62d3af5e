//! Asset audit - read-only queries against the audit database
//!
//! Usage:
//!   asset-audit history OBJ001 --since 2026-03-01T00:00:00Z
//!   asset-audit position OBJ001
//!   asset-audit location LOC003
//!   asset-audit report 2026-03-09
//!   asset-audit abandoned --hours 24
//!   asset-audit query --scanner pi-dock --limit 50
//!
//! Every command prints JSON to stdout.

use anyhow::Context;
use asset_router::infra::logging::init_tracing;
use asset_router::infra::Config;
use asset_router::io::{AuditQuery, AuditStore};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "asset-audit", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Audit database path, overriding `[audit] database`
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Every recorded scan of one object, oldest first
    History {
        object_id: String,
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Where an object was last seen
    Position { object_id: String },
    /// Objects whose last known location is this one
    Location { location_id: String },
    /// Summary of one UTC day (default: yesterday)
    Report { date: Option<NaiveDate> },
    /// Dispatches that ended abandoned in the last N hours
    Abandoned {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Filtered event listing
    Query {
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long)]
        object: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        scanner: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("warn", false);

    let database = match args.database {
        Some(path) => path,
        None => {
            let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
            Config::load_from_path(&config_path).audit_database().to_string()
        }
    };
    let audit = AuditStore::open(&database)
        .await
        .with_context(|| format!("Failed to open audit store {database}"))?;

    match args.command {
        Command::History { object_id, since } => {
            print_json(&audit.asset_history(&object_id, since).await?)?;
        }
        Command::Position { object_id } => match audit.current_position(&object_id).await? {
            Some(position) => print_json(&position)?,
            None => anyhow::bail!("no recorded position for {object_id}"),
        },
        Command::Location { location_id } => {
            print_json(&audit.location_contents(&location_id).await?)?;
        }
        Command::Report { date } => {
            let date = match date {
                Some(date) => date,
                None => Utc::now()
                    .date_naive()
                    .pred_opt()
                    .context("date out of range")?,
            };
            print_json(&audit.daily_report(date).await?)?;
        }
        Command::Abandoned { hours } => {
            let since = Utc::now() - Duration::hours(hours);
            print_json(&audit.abandoned_dispatches(since).await?)?;
        }
        Command::Query { from, to, object, location, scanner, limit } => {
            let filter = AuditQuery {
                from,
                to,
                object_id: object,
                location_id: location,
                scanner_id: scanner,
                limit: Some(limit),
            };
            print_json(&audit.query(&filter).await?)?;
        }
    }
    Ok(())
}
