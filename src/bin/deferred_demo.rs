//! Loads the module, lets it run, unloads it and prints the journal.
//!
//! Tunables come from `DEFERRED_RESTART`, `DEFERRED_DELAY_MS` and
//! `DEFERRED_MAX_ACTIVE` (a `.env` file is honoured). Use `RUST_LOG=debug`
//! for the verbose lines.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::info;

use deferred_work::config::ModuleConfig;
use deferred_work::core::{AppResult, InMemoryEventSink};
use deferred_work::module::ModuleContext;
use deferred_work::util::init_tracing;

fn main() -> AppResult<()> {
    init_tracing();

    let config = ModuleConfig::from_env().map_err(|e| anyhow!(e))?;
    // Long enough for every firing, unit run and work item to finish.
    let run_for = config.run_time();

    let journal = Arc::new(InMemoryEventSink::default());
    let module = ModuleContext::load_with_sink(config, journal.clone())
        .context("module load failed")?;
    info!(module = %module.id(), run_for_ms = run_for.as_millis(), "module running");

    std::thread::sleep(run_for);
    let report = module.unload();

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", serde_json::to_string_pretty(&journal.events())?);
    Ok(())
}
