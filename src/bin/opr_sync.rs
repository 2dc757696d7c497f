use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use opr_place_sync::app::{App, ProgressSink, open_ledger};
use opr_place_sync::config::ConfigLoader;
use opr_place_sync::error::OprError;
use opr_place_sync::output::{JsonOutput, LogProgress, OutputMode};
use opr_place_sync::overpass::OverpassHttpClient;
use opr_place_sync::store::{JsonSyncStateStore, Store};

#[derive(Parser)]
#[command(name = "opr-sync")]
#[command(about = "Keeps a place ledger in sync with OpenStreetMap and merges duplicate places")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Config file (defaults to ./opr-sync.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run one sync cycle for every tag group")]
    Sync,
    #[command(about = "Show what the next sync cycle would do")]
    Status,
    #[command(about = "Merge places re-created upstream under a new id")]
    Merge(MergeArgs),
    #[command(about = "Export recently created and deleted places as features")]
    Export,
}

#[derive(Args)]
struct MergeArgs {
    /// JSON feature array to merge instead of a fresh export
    #[arg(long)]
    input: Option<String>,

    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<OprError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &OprError) -> u8 {
    match error {
        OprError::MissingConfig
        | OprError::ConfigRead(_)
        | OprError::ConfigParse(_)
        | OprError::Config(_) => 2,
        OprError::TransientNetwork(_)
        | OprError::UpstreamStatus { .. }
        | OprError::UpstreamTooLarge(_)
        | OprError::SplitTooDeep { .. } => 3,
        OprError::Cancelled => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = match cli.store {
        Some(root) => Store::new_with_root(Utf8PathBuf::from(root)),
        None => Store::new()?,
    };
    store.ensure_root()?;
    let ledger = open_ledger(&store, &resolved.bot)?;
    let client = OverpassHttpClient::new(resolved.overpass.clone())?;
    let durable = JsonSyncStateStore::new(store.clone());
    let app = App::new(store, resolved, client, durable, ledger);

    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &LogProgress,
        OutputMode::NonInteractive => &JsonOutput,
    };
    let cancel = AtomicBool::new(false);

    match cli.command {
        Commands::Sync => {
            let result = app.sync(&cancel, sink)?;
            JsonOutput::print_sync(&result).into_diagnostic()
        }
        Commands::Status => {
            let result = app.status(sink)?;
            JsonOutput::print_status(&result).into_diagnostic()
        }
        Commands::Merge(args) => {
            let input = args.input.map(Utf8PathBuf::from);
            let result = app.merge(input.as_deref(), args.dry_run, sink)?;
            JsonOutput::print_merge(&result).into_diagnostic()
        }
        Commands::Export => {
            let result = app.export(sink)?;
            JsonOutput::print_export(&result).into_diagnostic()
        }
    }
}
