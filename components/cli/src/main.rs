/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

mod app;
mod oauth;
mod scheduler;
mod webhook;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use error_support::convert_log_report_error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use app::App;
use interrupt_support::Interruptee;
use scheduler::{BulkDriver, PollDriver};
use sync_core::error::Error as CoreError;
use sync_core::model::Module;
use sync_core::planner::{plan, Inventory};
use sync_core::remote_client::RemoteClient;

/// Every `sync_core::Error` that reaches the CLI boundary passes through
/// here rather than a bare `anyhow::Error::new`, so the taxonomy's own
/// `GetErrorHandling` impl decides the log level and whether it's reported
/// to the application error reporter (§7) instead of the CLI re-deciding
/// that on its own.
fn core_err(e: CoreError) -> anyhow::Error {
    anyhow::Error::new(convert_log_report_error(e))
}

const DEFAULT_LOG_FILTER: &str = "reconcile=info,sync_core=info";
const DEFAULT_LOG_FILTER_VERBOSE: &str = "reconcile=debug,sync_core=debug";

#[derive(Debug, Parser)]
#[command(about, long_about = None)]
struct Cli {
    /// Path to the JSON config document (source + datastore credentials and endpoints).
    #[arg(long, short = 'c', default_value = "reconcile.config.json")]
    config: PathBuf,
    /// Directory for on-disk refresh-token storage and registry snapshots.
    #[arg(long, default_value = ".reconcile-state")]
    state_dir: PathBuf,
    #[arg(long, short, action)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full-inventory plan and execute for a module, then exit.
    BulkSync {
        #[arg(long)]
        module: String,
        /// Restrict the run to a single record id (still fetches both full
        /// inventories; filters the plan down to just this pair).
        #[arg(long)]
        record: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Long-running: bulk driver on a fixed interval, poll driver at a
    /// tighter interval, and the webhook receiver, all for the given modules.
    Daemon {
        #[arg(long, value_delimiter = ',')]
        modules: Vec<String>,
        /// Bulk driver tick, in seconds (default 1 hour).
        #[arg(long, default_value_t = 3600)]
        bulk_interval_secs: u64,
        /// Poll driver tick, in seconds (default 60s).
        #[arg(long, default_value_t = 60)]
        poll_interval_secs: u64,
        /// Webhook listen address.
        #[arg(long, default_value = "0.0.0.0:8787")]
        listen: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Snapshot the field-mapping registry for a module to a file.
    ExportMappings {
        #[arg(long)]
        module: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Smoke-test registry load, remote auth, and one dry-run plan for a module.
    TestModule { module: String },
}

/// Forwards app-services-style error reports and breadcrumbs onto `tracing`,
/// since this CLI has no embedding host app to register its own reporter.
struct TracingErrorReporter;

impl error_support::ApplicationErrorReporter for TracingErrorReporter {
    fn report_error(&self, type_name: String, message: String) {
        tracing::error!(type_name, message, "reported error");
    }

    fn report_breadcrumb(&self, message: String, module: String, line: u32, column: u32) {
        tracing::debug!(module, line, column, "{message}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            if cli.verbose {
                DEFAULT_LOG_FILTER_VERBOSE.to_string()
            } else {
                DEFAULT_LOG_FILTER.to_string()
            }
        })))
        .init();
    error_support::set_application_error_reporter(Box::new(TracingErrorReporter));

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    if let Some(core) = err.chain().find_map(|e| e.downcast_ref::<CoreError>()) {
        if core.is_process_fatal() {
            return ExitCode::from(2);
        }
        if matches!(core, CoreError::RegistryEmpty(_)) {
            return ExitCode::from(3);
        }
    }
    ExitCode::from(1)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = sync_core::config::AppConfig::load(&cli.config)
        .map_err(core_err)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let app = App::build(config, cli.state_dir.clone()).map_err(core_err)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the async runtime")?;

    match cli.command {
        Commands::BulkSync { module, record, dry_run } => runtime.block_on(bulk_sync(&app, module, record, dry_run)),
        Commands::Daemon {
            modules,
            bulk_interval_secs,
            poll_interval_secs,
            listen,
            dry_run,
        } => runtime.block_on(daemon(&app, modules, bulk_interval_secs, poll_interval_secs, listen, dry_run)),
        Commands::ExportMappings { module, out } => runtime.block_on(export_mappings(&app, module, out)),
        Commands::TestModule { module } => runtime.block_on(test_module(&app, module)),
    }
}

fn module_config<'a>(app: &'a App, name: &str) -> Result<&'a sync_core::config::ModuleConfig> {
    app.config
        .modules
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("module {name} is not configured"))
}

async fn bulk_sync(app: &App, module_name: String, record: Option<String>, dry_run: bool) -> Result<ExitCode> {
    let module_cfg = module_config(app, &module_name)?;
    let module = Module::from(module_name.as_str());
    let mapping = app
        .registry
        .ensure_initialized(&module, app.source.as_ref(), Duration::from_secs(30))
        .await
        .map_err(core_err)?;

    let mut source_inventory = fetch_all(app.source.as_ref(), &module)?;
    let mut datastore_inventory = fetch_all(app.datastore.as_ref(), &module)?;
    if let Some(id) = &record {
        source_inventory.retain(|r| &r.id.0 == id || r.counterpart.as_ref().map(|c| &c.0) == Some(id));
        datastore_inventory.retain(|r| &r.id.0 == id || r.counterpart.as_ref().map(|c| &c.0) == Some(id));
    }

    let planner_config = app.planner_config();
    let plan_result = plan(
        &Inventory { side: sync_core::model::Side::Source, entries: source_inventory },
        &Inventory { side: sync_core::model::Side::Datastore, entries: datastore_inventory },
        &mapping,
        &planner_config,
    );

    let executor = app.executor_for(module_cfg, dry_run, true);
    let stats = executor.execute(&module, &plan_result, &mapping);
    print_summary(&module_name, &stats);
    Ok(ExitCode::SUCCESS)
}

async fn daemon(
    app: &App,
    module_names: Vec<String>,
    bulk_interval_secs: u64,
    poll_interval_secs: u64,
    listen: String,
    dry_run: bool,
) -> Result<ExitCode> {
    if module_names.is_empty() {
        anyhow::bail!("daemon requires at least one --modules entry");
    }
    let modules: Vec<Module> = module_names.iter().map(|m| Module::from(m.as_str())).collect();

    // Bulk and poll each get their own executor per module (full-inventory
    // differs — bulk runs a deletion pass, poll never does — and each
    // module keeps its own `required_source_fields`/marker config).
    let mut bulk_executors = std::collections::HashMap::new();
    let mut poll_executors = std::collections::HashMap::new();
    for (name, module) in module_names.iter().zip(&modules) {
        let module_cfg = module_config(app, name)?;
        app.registry
            .ensure_initialized(module, app.source.as_ref(), Duration::from_secs(30))
            .await
            .map_err(core_err)?;
        app.registry.spawn_refresher(module.clone(), app.source.clone());
        bulk_executors.insert(name.clone(), app.executor_for(module_cfg, dry_run, true));
        poll_executors.insert(name.clone(), app.executor_for(module_cfg, dry_run, false));
    }
    let bulk_executors = Arc::new(bulk_executors);
    let poll_executors = Arc::new(poll_executors);
    let planner_config = app.planner_config();

    let scope = interrupt_support::InterruptScope::default();
    let bulk = Arc::new(BulkDriver::new(modules.clone(), Duration::from_secs(bulk_interval_secs)));
    let poll = Arc::new(PollDriver::new(modules.clone(), Duration::from_secs(poll_interval_secs)));

    let webhook_state = Arc::new(webhook::WebhookState {
        registry: app.registry.clone(),
        source: app.source.clone(),
        datastore: app.datastore.clone(),
        executors: bulk_executors.clone(),
        planner_config: planner_config.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&listen).await.with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "webhook receiver listening");
    let webhook_app = webhook::router(webhook_state).layer(tower_http::trace::TraceLayer::new_for_http());
    let webhook_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, webhook_app).await {
            tracing::error!(error = %e, "webhook server stopped");
        }
    });

    let bulk_task = tokio::spawn(bulk.run(
        scope.clone(),
        app.registry.clone(),
        app.source.clone(),
        app.datastore.clone(),
        bulk_executors,
        planner_config.clone(),
    ));

    let poll_registry = app.registry.clone();
    let poll_source = app.source.clone();
    let poll_datastore = app.datastore.clone();
    let poll_config = planner_config.clone();
    let poll_scope = scope.clone();
    let poll_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(poll_interval_secs));
        loop {
            ticker.tick().await;
            if poll_scope.was_interrupted() {
                break;
            }
            let poll = poll.clone();
            let registry = poll_registry.clone();
            let source = poll_source.clone();
            let datastore = poll_datastore.clone();
            let executors = poll_executors.clone();
            let planner_config = poll_config.clone();
            let _ = tokio::task::spawn_blocking(move || {
                poll.run_once(&registry, source.as_ref(), datastore.as_ref(), &executors, &planner_config)
            })
            .await;
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    interrupt_support::InterruptScope::interrupt();
    webhook_task.abort();
    bulk_task.abort();
    poll_task.abort();
    Ok(ExitCode::SUCCESS)
}

async fn export_mappings(app: &App, module_name: String, out: Option<PathBuf>) -> Result<ExitCode> {
    let module = Module::from(module_name.as_str());
    let mapping = app
        .registry
        .ensure_initialized(&module, app.source.as_ref(), Duration::from_secs(30))
        .await
        .map_err(core_err)?;
    let text = serde_json::to_string_pretty(&*mapping).context("serializing mapping")?;
    match out {
        Some(path) => {
            std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
            println!("wrote mapping for {module_name} to {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn test_module(app: &App, module_name: String) -> Result<ExitCode> {
    let module_cfg = module_config(app, &module_name)?;
    let module = Module::from(module_name.as_str());

    println!("[1/3] loading field-mapping registry...");
    let mapping = app
        .registry
        .ensure_initialized(&module, app.source.as_ref(), Duration::from_secs(30))
        .await
        .map_err(core_err)?;
    println!("      {} fields mapped", mapping.fields.len());

    println!("[2/3] checking remote auth on both sides...");
    app.source.list_metadata(&module).map_err(core_err)?;
    app.datastore.list_metadata(&module).map_err(core_err)?;
    println!("      ok");

    println!("[3/3] dry-run plan over current inventories...");
    let source_inventory = fetch_all(app.source.as_ref(), &module)?;
    let datastore_inventory = fetch_all(app.datastore.as_ref(), &module)?;
    let planner_config = app.planner_config();
    let plan_result = plan(
        &Inventory { side: sync_core::model::Side::Source, entries: source_inventory },
        &Inventory { side: sync_core::model::Side::Datastore, entries: datastore_inventory },
        &mapping,
        &planner_config,
    );
    let executor = app.executor_for(module_cfg, true, true);
    let stats = executor.execute(&module, &plan_result, &mapping);
    print_summary(&module_name, &stats);
    Ok(ExitCode::SUCCESS)
}

fn fetch_all(client: &dyn RemoteClient, module: &Module) -> Result<Vec<sync_core::model::Record>> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = client.list_all(module, cursor).map_err(core_err)?;
        out.extend(page.items);
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(out)
}

fn print_summary(module: &str, stats: &sync_core::executor::Statistics) {
    println!("--- {module} ---");
    println!("new_in_datastore:        {}", stats.new_in_datastore);
    println!("new_in_source:           {}", stats.new_in_source);
    println!("source_newer:            {}", stats.source_newer);
    println!("datastore_newer:         {}", stats.datastore_newer);
    println!("no_sync:                 {}", stats.no_sync);
    println!("marked_deleted:          {}", stats.marked_deleted);
    println!("deleted_source_orphans:  {}", stats.deleted_source_orphans);
    println!("missing_required_fields: {}", stats.missing_required_fields);
    println!("failed:                  {}", stats.failed);
}
