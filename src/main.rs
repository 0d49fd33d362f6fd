//! heapscope - Parse heap allocation dumps and resolve their call stacks

use clap::Parser;
use colored::Colorize;
use heapscope::{
    cli::{Cli, Command, InstrumentAction, collect_snapshot_files},
    config::SessionConfig,
    output::get_formatter,
    session::{Session, SessionParts},
};
use heapscope_core::error::Result;
use heapscope_core::progress::{Progress, SessionEvent};
use heapscope_core::tool::HeapTool;
use heapscope_symbols::ModuleOffsetResolver;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// Create the session, swapping in offset-only symbols when requested
fn create_session(cli: &Cli, config: SessionConfig) -> Result<Session> {
    if cli.no_symbols {
        info!("Symbol resolution disabled, frames are named by module offset");
        let parts = SessionParts {
            resolver: Arc::new(ModuleOffsetResolver::new()),
            diff_generator: Arc::new(HeapTool::new(config.tool.clone())),
            store: None,
        };
        Session::with_parts(config, parts)
    } else {
        Session::new(config)
    }
}

fn progress_bar(message: &'static str, unit: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!("{{msg}} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {unit}"))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message);
    pb
}

/// Drive `work` to completion while mirroring `progress` into a bar
async fn with_progress<F: Future>(bar: Option<ProgressBar>, progress: &Progress, work: F) -> F::Output {
    let Some(pb) = bar else {
        return work.await;
    };
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    loop {
        tokio::select! {
            output = &mut work => {
                pb.finish_and_clear();
                return output;
            }
            _ = ticker.tick() => {
                let (current, maximum) = progress.get();
                pb.set_length(maximum);
                pb.set_position(current);
            }
        }
    }
}

/// Report snapshot files that could not be loaded
fn report_failed_loads(events: &mut broadcast::Receiver<SessionEvent>) -> usize {
    let mut failed = 0;
    loop {
        match events.try_recv() {
            Ok(SessionEvent::SnapshotLoadFailed { path, error }) => {
                failed += 1;
                eprintln!("{} {}: {}", "failed".red().bold(), path.display(), error);
            }
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return failed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first to check for quiet flag
    let cli = Cli::parse();

    // The --quiet flag overrides RUST_LOG
    let filter = if cli.quiet {
        tracing_subscriber::EnvFilter::new("warn")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("heapscope=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let show_progress = !cli.json && is_terminal::is_terminal(std::io::stdout());
    let formatter = get_formatter(cli.json);

    match cli.command.clone() {
        Command::Load { paths, top } => {
            let files = collect_snapshot_files(&paths)?;
            info!("Loading {} snapshot files", files.len());

            let session = create_session(&cli, cli.session_config()?)?;
            let mut events = session.subscribe();
            session.load_all(files);

            let bar = show_progress.then(|| progress_bar("Parsing snapshots", "files"));
            with_progress(bar, session.load_progress(), session.wait_for_loads()).await;
            let failed = report_failed_loads(&mut events);

            let snapshots = session.snapshots();
            println!("{}", formatter.format_snapshots(&snapshots));

            if top > 0 {
                let symbol_progress = session.symbol_progress();
                for snapshot in &snapshots {
                    let bar = show_progress.then(|| progress_bar("Resolving symbols", "frames"));
                    let reports = with_progress(
                        bar,
                        &symbol_progress,
                        session.top_tracebacks(snapshot.index(), top),
                    )
                    .await?;
                    println!("{}", formatter.format_tracebacks(snapshot, &reports));
                }
            }

            if failed > 0 {
                info!("{} snapshot files failed to load", failed);
            }
            session.shutdown().await?;
        }
        Command::Diff { first, second, top } => {
            info!("Diffing {} and {}", first.display(), second.display());
            let session = create_session(&cli, cli.session_config()?)?;
            let diff = session.diff_files(&first, &second).await?;
            println!("{}", formatter.format_diff(&diff, top));
            session.shutdown().await?;
        }
        Command::ParseDiff { file, top } => {
            let mut diff = heapscope_parser::load_diff(&file).await?;
            diff.sort_by_magnitude();
            println!("{}", formatter.format_diff(&diff, top));
        }
        Command::Capture { pid, output } => {
            let session = create_session(&cli, cli.session_config()?)?;
            let mut events = session.subscribe();
            let path = session.capture(pid, &output).await?;
            session.wait_for_loads().await;
            report_failed_loads(&mut events);

            println!("{}", path.display());
            let snapshots = session.snapshots();
            println!("{}", formatter.format_snapshots(&snapshots));
            session.shutdown().await?;
        }
        Command::Instrument { action, executable } => {
            let config = cli.session_config()?;
            let enabled = action == InstrumentAction::Enable;
            HeapTool::new(config.tool)
                .set_instrumentation(&executable, enabled)
                .await?;
            let state = if enabled { "enabled" } else { "disabled" };
            println!("Stack collection {} for {}", state.green(), executable);
        }
    }

    Ok(())
}
