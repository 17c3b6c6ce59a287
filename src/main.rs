//! kv-workload：对复合键存储施加偏斜负载

use clap::Parser;
use kv_workload::clock::SystemClock;
use kv_workload::config::{Options, messages};
use kv_workload::error::{AppError, ErrorContext, Result};
use kv_workload::metrics::StatsSink;
use kv_workload::runner::Runner;
use kv_workload::smoke;
use kv_workload::store::{MemoryStore, Store, TableSchema};
use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match run(Options::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "kv-workload failed");
            ExitCode::FAILURE
        }
    }
}

fn run(options: Options) -> Result<()> {
    let workload = options
        .workload_config()
        .with_context(messages::CONFIG_INVALID)?;
    let run = options.run_config().with_context(messages::CONFIG_INVALID)?;
    let store_options = options
        .memory_store_options()
        .with_context(messages::CONFIG_INVALID)?;

    tracing::info!(?workload, ?run, "parameters for test run");
    tracing::info!(
        target_store = %workload.target,
        number_of_keys = workload.number_of_keys,
        page_size = store_options.page_size,
        "driving the in-memory store"
    );

    let store = MemoryStore::new(&workload.table_name, store_options);
    let clock = SystemClock::new();
    let sink = StatsSink::new();

    let runtime = compio::runtime::Runtime::new()
        .map_err(|e| AppError::RuntimeCreate(e.to_string()))
        .with_context(messages::RUNTIME_CREATE_FAILED)?;
    runtime.block_on(async {
        let status = store
            .ensure_table(&TableSchema::composite(&workload.table_name))
            .await
            .with_context(messages::ENSURE_TABLE_FAILED)?;
        tracing::info!(table = %workload.table_name, ?status, "table ready");
        if options.smoke {
            smoke::check(&store, &workload.table_name, &clock)
                .await
                .with_context(messages::SMOKE_FAILED)?;
        }
        Ok::<_, AppError>(())
    })?;

    if run.duration.is_none() && run.iterations.is_none() {
        tracing::warn!("no duration or iteration limit; running until stopped");
    }
    let report = Runner::new(&workload, &run, &store, &sink, &clock)
        .run()
        .with_context(messages::RUN_FAILED)?;
    tracing::info!(
        operations = report.counts.total(),
        elapsed = ?report.elapsed,
        items_left = store.len(),
        "run complete"
    );

    sink.log_summary();
    if options.json {
        for summary in sink.summary() {
            println!("{}", summary.to_json());
        }
    }
    Ok(())
}
