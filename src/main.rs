use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use case_catalog::Catalog;
use case_file::config::Configuration;
use case_file::events::UserCommand;
use case_file::history::HistoryStore;
use case_file::presentation::{RelatedCards, category_style};
use case_file::storage::JsonFileStorage;
use case_file::tasks::console;
use case_file::tasks::controller::{ControllerParts, SystemClock, ViewController};
use case_file::tasks::reveal::{
    CuePlayer, ImageAssetProbe, RevealSequencer, SilentCues, TerminalBell,
};
use case_file::tasks::scanner::WedgeScanner;
use clap::Parser;
use humantime::format_duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "case-file",
    version,
    about = "Scan clue cards and read the case file"
)]
struct Args {
    /// Path to YAML config; built-in defaults when omitted
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,
    /// Print the card catalog and exit
    #[arg(long = "list-catalog")]
    list_catalog: bool,
    /// Keep scan history in this file (overrides history-path from the config)
    #[arg(long = "history-path", value_name = "FILE")]
    history_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // init tracing (RUST_LOG controls level, default = info); stdout belongs to the screen
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();

    let Args {
        config,
        list_catalog,
        history_path,
    } = Args::parse();

    let mut cfg = match &config {
        Some(path) => Configuration::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Configuration::default(),
    };
    if history_path.is_some() {
        cfg.history_path = history_path;
    }
    let cfg = cfg.validated().context("invalid configuration values")?;
    tracing::debug!("configuration:\n{:#?}", cfg);

    let catalog = match &cfg.catalog_path {
        Some(path) => Catalog::from_yaml_file(path)
            .with_context(|| format!("failed to load catalog from {}", path.display()))?,
        None => Catalog::builtin().context("built-in catalog is invalid")?,
    };
    tracing::info!(cards = catalog.len(), "catalog loaded");

    if list_catalog {
        print_catalog(&catalog);
        return Ok(());
    }

    let history = match &cfg.history_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "history persisted to disk");
            HistoryStore::with_storage(Box::new(JsonFileStorage::new(path)))
        }
        None => HistoryStore::in_memory(),
    };

    let cues: Arc<dyn CuePlayer> = if cfg.reveal.cue {
        Arc::new(TerminalBell)
    } else {
        Arc::new(SilentCues)
    };
    let sequencer = RevealSequencer::new(
        cfg.reveal.clone(),
        Arc::new(ImageAssetProbe::new(&cfg.asset_root)),
        Arc::clone(&cues),
    );
    tracing::info!(
        reveal = %format_duration(cfg.reveal.total()),
        error_display = %format_duration(cfg.error_display),
        "timings"
    );

    let scanner = WedgeScanner::new(cfg.scanner.devices.clone());
    let controller = ViewController::new(ControllerParts {
        catalog: Arc::new(catalog),
        history,
        sequencer,
        scanner: Box::new(scanner.clone()),
        cues,
        clock: Arc::new(SystemClock),
        extension: Some(Box::new(RelatedCards::default())),
        facing: cfg.scanner.preferred_facing,
        error_display: cfg.error_display,
    });
    let snapshots = controller.subscribe();
    let reveal_phases = controller.reveal_phases();

    // Console -> Controller
    let (command_tx, command_rx) = mpsc::channel::<UserCommand>(16);
    let lines = console::spawn_stdin_reader()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let mut tasks = JoinSet::new();

    // ViewController
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            controller
                .run(command_rx, cancel)
                .await
                .context("controller task failed")
        }
    });

    // Console input
    tasks.spawn({
        let snapshots = snapshots.clone();
        let cancel = cancel.clone();
        async move {
            console::run_input(lines, command_tx, scanner, snapshots, cancel)
                .await
                .context("console input task failed")
        }
    });

    // Console output
    tasks.spawn({
        let color = io::stdout().is_terminal();
        let cancel = cancel.clone();
        async move {
            console::run_output(tokio::io::stdout(), snapshots, reveal_phases, color, cancel)
                .await
                .context("console output task failed")
        }
    });

    while let Some(res) = tasks.join_next().await {
        // any task ending takes the rest down with it
        cancel.cancel();
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e:?}"),
        }
    }
    tracing::info!("case file closed");
    Ok(())
}

fn print_catalog(catalog: &Catalog) {
    println!(
        "{:<20} {:<10} {:<28} {}",
        "CODE", "CATEGORY", "TITLE", "IMAGE"
    );
    for card in catalog.iter() {
        let style = category_style(card.category);
        println!(
            "{:<20} {:<10} {:<28} {}",
            card.id,
            format!("{} {}", style.icon, card.category),
            card.title,
            card.image
        );
    }
}
