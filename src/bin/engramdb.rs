//! Binary entry point for the EngramDB server and administrative CLI.
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use engramdb::{
    db::{Config, Database, DbStats, Scheduler, SyncMode, VerifyReport},
    logging::install_tracing_subscriber,
    query::{Params, QueryErrorWithCode, QueryResult, Value},
    server,
};

#[derive(Parser, Debug)]
#[command(
    name = "engramdb",
    version,
    about = "Embeddable graph database for agent memory",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        env = "ENGRAMDB_CONFIG",
        value_name = "FILE",
        help = "Configuration file (defaults to the user config dir)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "ENGRAMDB_DATA_DIR",
        value_name = "DIR",
        help = "Override the data directory"
    )]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, help = "Override the WAL sync mode")]
    sync_mode: Option<SyncModeArg>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Serve the Bolt and HTTP endpoints")]
    Serve {
        #[arg(long, env = "ENGRAMDB_BOLT_ADDR", help = "Bolt listen address")]
        bolt_addr: Option<String>,

        #[arg(long, env = "ENGRAMDB_HTTP_ADDR", help = "HTTP listen address")]
        http_addr: Option<String>,

        #[arg(
            long,
            value_name = "SECS",
            default_value_t = 300,
            help = "Interval for background checkpoint and vacuum (0 disables)"
        )]
        maintenance_secs: u64,
    },
    #[command(about = "Run one statement in its own transaction")]
    Query {
        #[arg(value_name = "CYPHER")]
        statement: String,

        #[arg(
            long = "param",
            value_name = "NAME=JSON",
            help = "Statement parameter; the value is parsed as JSON, falling back to a string"
        )]
        params: Vec<String>,
    },
    #[command(about = "Write a checkpoint and truncate the WAL")]
    Checkpoint,
    #[command(about = "Check graph and index consistency")]
    Verify,
    #[command(about = "Print engine statistics")]
    Stats,
    #[command(about = "Print the effective configuration")]
    Config,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SyncModeArg {
    None,
    Batch,
    Immediate,
}

impl From<SyncModeArg> for SyncMode {
    fn from(mode: SyncModeArg) -> Self {
        match mode {
            SyncModeArg::None => SyncMode::None,
            SyncModeArg::Batch => SyncMode::Batch,
            SyncModeArg::Immediate => SyncMode::Immediate,
        }
    }
}

#[tokio::main]
async fn main() {
    install_tracing_subscriber();
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = build_config(&cli.open)?;

    match cli.command {
        Command::Serve {
            bolt_addr,
            http_addr,
            maintenance_secs,
        } => {
            if let Some(addr) = bolt_addr {
                config.server.bolt_addr = addr;
            }
            if let Some(addr) = http_addr {
                config.server.http_addr = addr;
            }
            config.validate()?;
            let db = Database::open(config)?;
            let mut scheduler = if maintenance_secs > 0 {
                Scheduler::with_maintenance(db.clone(), Duration::from_secs(maintenance_secs))?
            } else {
                Scheduler::new(db.clone())
            };
            let served = server::serve(db.clone()).await;
            scheduler.shutdown();
            db.checkpoint()?;
            db.close()?;
            served?;
        }
        Command::Query { statement, params } => {
            let params = parse_params(&params)?;
            let db = Database::open(config)?;
            let result = db.execute(&statement, params);
            db.close()?;
            match result {
                Ok(result) => emit(cli.format, &result_json(&result), || print_result_text(&result))?,
                Err(err) => return Err(QueryErrorWithCode(&err).to_string().into()),
            }
        }
        Command::Checkpoint => {
            let db = Database::open(config)?;
            let lsn = db.checkpoint()?;
            db.close()?;
            let report = serde_json::json!({ "checkpoint_lsn": lsn.0 });
            emit(cli.format, &report, || println!("Checkpoint written through LSN {}", lsn.0))?;
        }
        Command::Verify => {
            let db = Database::open(config)?;
            let report = db.verify()?;
            db.close()?;
            emit(cli.format, &report, || print_verify_text(&report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::Stats => {
            let db = Database::open(config)?;
            let stats = db.stats();
            db.close()?;
            emit(cli.format, &stats, || print_stats_text(&stats))?;
        }
        Command::Config => match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            OutputFormat::Text => print!("{}", config.to_toml()?),
        },
    }
    Ok(())
}

fn build_config(args: &OpenArgs) -> Result<Config, Box<dyn Error>> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(mode) = args.sync_mode {
        config.sync_mode = mode.into();
    }
    config.validate()?;
    Ok(config)
}

fn parse_params(raw: &[String]) -> Result<Params, Box<dyn Error>> {
    let mut params = Params::new();
    for entry in raw {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid parameter '{entry}', expected NAME=VALUE"))?;
        let value = match serde_json::from_str::<serde_json::Value>(value) {
            Ok(json) => Value::from_json(&json),
            Err(_) => Value::String(value.to_owned()),
        };
        params.insert(name.trim().to_owned(), value);
    }
    Ok(params)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn result_json(result: &QueryResult) -> serde_json::Value {
    serde_json::json!({
        "columns": result.columns,
        "rows": result
            .rows
            .iter()
            .map(|row| row.iter().map(Value::to_json).collect::<Vec<_>>())
            .collect::<Vec<_>>(),
        "stats": result.stats,
        "plan": result.plan,
    })
}

fn print_result_text(result: &QueryResult) {
    if let Some(plan) = &result.plan {
        println!("{plan}");
        return;
    }
    if !result.columns.is_empty() {
        println!("{}", result.columns.join(" | "));
        for row in &result.rows {
            let cells: Vec<String> = row.iter().map(Value::to_string).collect();
            println!("{}", cells.join(" | "));
        }
        println!("({} rows)", result.rows.len());
    }
    let stats = &result.stats;
    if stats.contains_updates() {
        println!(
            "nodes_created={} nodes_deleted={} relationships_created={} relationships_deleted={} properties_set={} labels_added={} labels_removed={}",
            stats.nodes_created,
            stats.nodes_deleted,
            stats.relationships_created,
            stats.relationships_deleted,
            stats.properties_set,
            stats.labels_added,
            stats.labels_removed,
        );
    }
}

fn print_stats_text(stats: &DbStats) {
    stats.print_report();
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify => success={} nodes_found={} edges_found={} embeddings_found={} vectors_indexed={}",
        report.success,
        report.counts.nodes_found,
        report.counts.edges_found,
        report.counts.embeddings_found,
        report.counts.vectors_indexed,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}
