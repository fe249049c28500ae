use anyhow::{Context, Result};
use csvstream::{
    process::{process_into_channel, Hooks, ProcessingOptions, Record},
    source,
};
use reqwest::Client;
use std::{env, io::Write};
use tokio::{sync::mpsc, time::Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_BATCH_SIZE: usize = 10;
const CHANNEL_DEPTH: usize = 4;

fn usage() -> ! {
    eprintln!("usage: csvstream <path-or-url> [config.yaml|config.json]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(log_level.parse().unwrap_or(Level::INFO.into())),
        )
        .with_writer(std::io::stderr)
        .init();

    // ─── 2) args & options ───────────────────────────────────────────
    let mut args = env::args().skip(1);
    let location = args.next().unwrap_or_else(|| usage());
    let options = match args.next() {
        Some(path) => ProcessingOptions::from_path(&path)
            .with_context(|| format!("loading options from {}", path))?,
        None => ProcessingOptions::with_batch_size(DEFAULT_BATCH_SIZE)?,
    };
    info!(%location, ?options, "startup");

    let hooks = Hooks::new()
        .on_headers(|header| info!(columns = ?header.columns(), "headers"))
        .on_data_invalid(|row| {
            warn!(row_number = row.row_number, reason = %row.reason, "invalid row")
        });

    // ─── 3) open source ──────────────────────────────────────────────
    let client = Client::new();
    let reader = source::open(&client, &location).await?;

    // ─── 4) print batches as JSON lines ──────────────────────────────
    let (tx, mut rx) = mpsc::channel::<Vec<Record>>(CHANNEL_DEPTH);
    let printer = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            let mut out = std::io::stdout().lock();
            for record in &batch {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        anyhow::Ok(())
    });

    let start = Instant::now();
    let result = process_into_channel(reader, options, hooks, tx).await;
    printer.await.context("printer task panicked")??;
    let summary = result?;

    info!(
        rows = summary.rows,
        accepted = summary.accepted,
        rejected = summary.rejected,
        skipped_invalid = summary.skipped_invalid,
        batches = summary.batches,
        elapsed = ?start.elapsed(),
        "done"
    );
    Ok(())
}
