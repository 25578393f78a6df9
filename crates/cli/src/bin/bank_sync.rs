use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use models::SyncSettings;
use std::{path::PathBuf, sync::Arc};
use sync_pipeline::{EnrichmentPipeline, FileSnapshotStore, JsonConverters, NoopCurrencyTracker, RecordedChannels};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bank-sync", about = "Reconcile recorded bank channels into one transaction list.")]
struct Args {
    /// Settings file (falls back to ./settings.json)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Directory holding accounts.json and the per-channel recordings
    #[arg(short, long)]
    recordings: PathBuf,

    /// Directory for per-account snapshots; overrides settings
    #[arg(long)]
    state: Option<PathBuf>,

    /// Output JSON path; overrides settings
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// First day of the window (YYYY-MM-DD); overrides settings
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Last day of the window (YYYY-MM-DD); defaults to now
    #[arg(long)]
    to: Option<NaiveDate>,

    /// Pretty-print the output JSON
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

fn resolve_settings(args: &Args) -> Result<SyncSettings> {
    let loaded = settings_loader::load_settings_with_fallback(args.settings.as_ref())?;
    let mut settings = match (loaded, args.from) {
        (Some(settings), _) => settings,
        (None, Some(from_date)) => SyncSettings {
            from_date,
            to_date: None,
            skipped_accounts: Vec::new(),
            state_dir: PathBuf::from("state"),
            output_file: None,
            log_filter: None,
        },
        (None, None) => return Err(anyhow!("no settings file found, pass --settings or --from")),
    };

    if let Some(from_date) = args.from {
        settings.from_date = from_date;
    }
    if args.to.is_some() {
        settings.to_date = args.to;
    }
    if let Some(state) = &args.state {
        settings.state_dir = state.clone();
    }
    if let Some(output) = &args.output {
        settings.output_file = Some(output.clone());
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let settings = resolve_settings(&args)?;
    logger::init(settings.log_filter.as_deref());

    let window = settings.window(Utc::now());
    let channels = Arc::new(RecordedChannels::new(&args.recordings));
    let pipeline = EnrichmentPipeline::new(
        channels.clone(),
        channels.clone(),
        channels,
        Arc::new(JsonConverters),
        Arc::new(NoopCurrencyTracker),
        Arc::new(FileSnapshotStore::new(&settings.state_dir)),
    )
    .with_skipped_accounts(settings.skipped_accounts.iter().cloned());

    let run = pipeline
        .run(&window)
        .await
        .with_context(|| format!("sync from {}", args.recordings.display()))?;

    info!(
        report = %serde_json::to_string(&run.report)?,
        "run complete"
    );

    match &settings.output_file {
        Some(path) => {
            let written = utils::write_json_file(path, &run.output, args.pretty)?;
            println!("Wrote {} transactions to {}", run.output.transactions.len(), written.display());
        }
        None => {
            let rendered = if args.pretty {
                serde_json::to_string_pretty(&run.output)?
            } else {
                serde_json::to_string(&run.output)?
            };
            println!("{rendered}");
        }
    }
    Ok(())
}
