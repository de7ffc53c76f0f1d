use std::path::Path;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use couch::Couch;
use log::{info, warn};
use miette::IntoDiagnostic;
use serde_json::Value;
use yggdrasil_db::{
    CouchBackend, DocBackend, ProjectDbManager, SeqTracker, YggdrasilDbManager,
};

use yggdrasil::config::{ConfigLoader, CouchSettings};
use yggdrasil::core::YggdrasilCore;
use yggdrasil::hpc;
use yggdrasil::logging::configure_logging;
use yggdrasil::module_resolver::ModuleResolver;
use yggdrasil::session::YggSession;

#[derive(Parser)]
#[command(name = "ygg", version, about = "Yggdrasil bioinformatics pipeline orchestrator")]
struct Cli {
    /// Enable development mode (debug logging, dev config overlay, mock HPC)
    #[arg(long)]
    dev: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Start the long-running service
    Daemon,

    /// Run exactly one project document and exit
    #[command(name = "run-doc")]
    RunDoc {
        /// Project document ID to process
        doc_id: String,

        /// Force manual HPC submission for this invocation
        #[arg(short = 'm', long)]
        manual_submit: bool,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let Some(mode) = cli.mode else {
        Cli::command().print_help().into_diagnostic()?;
        return Ok(());
    };

    YggSession::init_dev_mode(cli.dev).into_diagnostic()?;

    let config = ConfigLoader::load_config("config.json").into_diagnostic()?;

    let log_dir = config.str_or("yggdrasil_log_dir", "yggdrasil_workspace/logs");
    let log_path = configure_logging(cli.dev, Path::new(&log_dir)).into_diagnostic()?;
    eprintln!("Logging to {}", log_path.display());

    let settings = CouchSettings::load().into_diagnostic()?;
    let couch = Couch::new(&settings.url, settings.user.clone(), settings.password.clone());
    match couch.server_info().await {
        Ok(banner) => info!(
            "Connected to CouchDB server. Version: {}",
            banner.get("version").and_then(Value::as_str).unwrap_or("unknown")
        ),
        Err(err) => warn!("Could not reach CouchDB at startup: {err}"),
    }

    let pdm = Arc::new(ProjectDbManager::new(couch.clone(), &settings.projects_db));
    let backend: Arc<dyn DocBackend> =
        Arc::new(CouchBackend::new(couch.clone(), &settings.yggdrasil_db));
    let ydm = Arc::new(YggdrasilDbManager::new(backend));

    let hpc = hpc::manager_for(cli.dev, &config);
    let resolver = Arc::new(ModuleResolver::new(ConfigLoader::load_config_optional(
        "module_registry.json",
    )));

    let seq_file = config.str_or(
        "last_processed_seq_file",
        &ConfigLoader::config_dir()
            .join(".last_processed_seq")
            .to_string_lossy(),
    );
    let tracker = SeqTracker::new(seq_file);

    let mut core = YggdrasilCore::new(config, pdm, ydm, hpc, resolver, tracker);
    core.setup_handlers();

    match mode {
        Mode::Daemon => {
            core.setup_watchers();
            let core = Arc::new(core);

            let signal_core = core.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received; shutting down.");
                    signal_core.stop();
                }
            });

            core.start().await;
        }
        Mode::RunDoc {
            doc_id,
            manual_submit,
        } => {
            YggSession::init_manual_submit(manual_submit).into_diagnostic()?;
            core.run_once(&doc_id).await;
        }
    }

    Ok(())
}
