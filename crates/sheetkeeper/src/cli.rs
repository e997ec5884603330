//! Exposes the command line application.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sheetkeeper_service::config::Config;
use sheetkeeper_service::metrics;
use sheetkeeper_service::{CellValue, NewRow, Sheet, SheetOptions, SheetsClient};
use tokio::time::{self, MissedTickBehavior};

use crate::logging;

/// Sheetkeeper commands.
#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Print the data rows below the header as JSON arrays.
    Rows,

    /// Print the data rows as JSON objects keyed by column name.
    Data,

    /// Print the column names from the header row.
    Columns,

    /// Append a row after the configured range.
    Append {
        /// The row as JSON.
        ///
        /// An array is appended as is, an object is ordered like the sheet's columns by
        /// matching its keys case-insensitively against the column names.
        #[arg(long, value_name = "JSON")]
        json: String,
    },

    /// Keep the rows fresh in the background and print them whenever they change.
    Watch {
        /// How often to refresh the rows, like `30s` or `5m`.
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        interval: Duration,

        /// Stop after this many refreshes.
        #[arg(long)]
        count: Option<u64>,
    },
}

/// Reads from and appends to a spreadsheet range.
///
/// The spreadsheet and range default to the `sheet` section of the configuration file.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The identifier of the spreadsheet document.
    #[arg(long, global = true)]
    spreadsheet: Option<String>,

    /// The range holding the header and data rows, in A1 notation.
    #[arg(long, global = true)]
    range: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Turns the `--json` argument of `append` into a row.
fn parse_row(json: &str) -> Result<NewRow> {
    let value: serde_json::Value = serde_json::from_str(json).context("row is not valid JSON")?;
    Ok(match value {
        serde_json::Value::Array(cells) => {
            NewRow::Positional(cells.into_iter().map(CellValue::from).collect())
        }
        serde_json::Value::Object(fields) => NewRow::Keyed(
            fields
                .into_iter()
                .map(|(key, value)| (key, CellValue::from(value)))
                .collect(),
        ),
        _ => bail!("row must be a JSON array or object"),
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(spreadsheet) = cli.spreadsheet {
        config.sheet.spreadsheet_id = spreadsheet;
    }
    if let Some(range) = cli.range {
        config.sheet.range = range;
    }

    let dsn = config
        .sentry_dsn
        .as_deref()
        .map(str::parse::<sentry::types::Dsn>)
        .transpose()
        .context("invalid sentry DSN")?;
    let _sentry = sentry::init(sentry::ClientOptions {
        dsn,
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is not started yet, this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    if config.sheet.spreadsheet_id.is_empty() {
        bail!("no spreadsheet configured, pass --spreadsheet or set sheet.spreadsheet_id");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(run(config, cli.command))
}

async fn run(config: Config, command: Command) -> Result<()> {
    let client = SheetsClient::new(&config.api, config.sheet.spreadsheet_id.clone())
        .context("failed to create the sheets client")?;
    let sheet = Sheet::new(Arc::new(client), SheetOptions::from_config(&config.sheet));
    tracing::debug!(options = ?sheet.options(), "sheet ready");

    match command {
        Command::Rows => print_json(&sheet.rows().await.context("failed to read rows")?),
        Command::Data => print_json(&sheet.data().await.context("failed to read rows")?),
        Command::Columns => print_json(&sheet.columns().await.context("failed to read header")?),
        Command::Append { json } => {
            let row = parse_row(&json)?;
            let confirmation = sheet.append(row).await.context("failed to append row")?;
            match confirmation.updated_range {
                Some(range) => println!("appended {} row(s) at {range}", confirmation.updated_rows),
                None => println!("appended {} row(s)", confirmation.updated_rows),
            }
            Ok(())
        }
        Command::Watch { interval, count } => watch(&sheet, interval, count).await,
    }
}

/// Prints the rows of `sheet` every time a background refresh changed them.
async fn watch(sheet: &Sheet, interval: Duration, count: Option<u64>) -> Result<()> {
    if interval.is_zero() {
        bail!("watch interval must not be zero");
    }

    let mut previous = sheet.rows().await.context("failed to read rows")?;
    print_json(&previous)?;

    sheet.keep_fresh(interval);
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut refreshes = 0;
    while count.is_none_or(|count| refreshes < count) {
        ticker.tick().await;
        refreshes += 1;

        // The background refresh keeps the previous rows on failure, so this only fails if
        // the rows were invalidated and refetching them failed.
        let rows = match sheet.rows().await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read rows");
                continue;
            }
        };
        if rows != previous {
            print_json(&rows)?;
            previous = rows;
        } else {
            tracing::debug!(age = ?sheet.grid_age(), "rows unchanged");
        }
    }

    sheet.stop_refreshing();
    Ok(())
}
