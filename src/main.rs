//! Quarry - run templated SQL on Athena and load the results.

use anyhow::Context;
use futures::TryStreamExt;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use quarry::cli::{Cli, Command, OutputFormat};
use quarry::execution::cancel_on_ctrl_c;
use quarry::logging::init_stderr_logging;
use quarry::progress::{SharedObserver, TerminalProgress};
use quarry::result::{json_row, Column, Row};
use quarry::{
    CreateTableOptions, Engine, EngineConfig, QuarryError, QueryOptions, QuerySource,
    StatementOptions,
};

/// Exit status after an interrupt.
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse_args();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<QuarryError>() {
            Some(q) if q.is_cancelled() => {
                error!("{}: {}", q.category(), q);
                std::process::exit(EXIT_CANCELLED);
            }
            Some(q) => error!("{}: {:#}", q.category(), e),
            None => error!("{:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();
    let mut config = EngineConfig::load(Some(config_path.as_path()))?;
    config.debug |= cli.debug;

    init_stderr_logging(config.debug);
    info!("Loaded config from: {}", config_path.display());

    let format = cli.command.output_format();

    let engine = Engine::from_config(config)?;
    let cancel = CancellationToken::new();
    let listener = cancel_on_ctrl_c(cancel.clone());

    let progress = TerminalProgress::stderr();
    let observer: SharedObserver = Arc::new(progress.clone());

    let outcome = dispatch(&engine, cli.command, format, cancel, observer).await;
    progress.finish();
    listener.abort();
    outcome
}

async fn dispatch(
    engine: &Engine,
    command: Command,
    format: OutputFormat,
    cancel: CancellationToken,
    progress: SharedObserver,
) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match command {
        Command::Query {
            sql,
            params,
            date_fields,
            ..
        } => {
            let mut options = QueryOptions::new()
                .cancel_token(cancel)
                .progress(progress);
            options.params = params.to_template_params();
            if !date_fields.is_empty() {
                options = options.date_fields(date_fields);
            }

            let table = engine.query(QuerySource::detect(&sql), options).await?;
            print_rows(&mut out, format, &table.columns, &table.rows, true)?;
        }
        Command::CreateTable {
            sql,
            params,
            name,
            prefix,
            overwrite,
        } => {
            let mut options = CreateTableOptions::new()
                .prefix(prefix)
                .overwrite(overwrite)
                .cancel_token(cancel)
                .progress(progress);
            options.params = params.to_template_params();
            if let Some(name) = name {
                options = options.name(name);
            }

            let handle = engine
                .create_table(QuerySource::detect(&sql), options)
                .await?;
            writeln!(out, "{}\t{}", handle.qualified_name(), handle.location)?;
        }
        Command::Exec {
            sql,
            params,
            database,
            batch_size,
            ..
        } => {
            let mut options = StatementOptions::new()
                .batch_size(batch_size)
                .cancel_token(cancel)
                .progress(progress);
            options.params = params.to_template_params();
            if let Some(database) = database {
                options = options.database(database);
            }

            let mut batches = engine
                .execute_statement(QuerySource::detect(&sql), options)
                .await?;
            let mut first = true;
            while let Some(batch) = batches.try_next().await? {
                print_rows(&mut out, format, &batch.columns, &batch.rows, first)?;
                first = false;
            }
        }
        Command::Cancel { execution_id } => {
            engine.cancel_query(&execution_id).await?;
            info!("Cancel requested for `{}`", execution_id);
        }
    }

    out.flush().context("Failed to flush stdout")?;
    Ok(())
}

fn print_rows(
    out: &mut impl Write,
    format: OutputFormat,
    columns: &[Column],
    rows: &[Row],
    header: bool,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Tsv => {
            if header {
                let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
                writeln!(out, "{}", names.join("\t"))?;
            }
            for row in rows {
                let cells: Vec<String> = row.iter().map(|v| v.to_display_string()).collect();
                writeln!(out, "{}", cells.join("\t"))?;
            }
        }
        OutputFormat::Json => {
            for row in rows {
                writeln!(out, "{}", serde_json::Value::Object(json_row(columns, row)))?;
            }
        }
    }
    Ok(())
}
