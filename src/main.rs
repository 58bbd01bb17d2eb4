mod cli;
mod error;
mod logging;

use crate::cli::{Cli, Command, ListArgs, ServeArgs};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use exn::ResultExt;
use shelf_config::Config;
use shelf_server::AppState;
use shelf_stats::DownloadCounter;
use shelf_storage::{Artifact, ArtifactStore};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(config, args).await,
        Command::List(args) => list(config, args).await,
        Command::Check => {
            check(&config);
            Ok(())
        },
    }
}

fn counter(config: &Config) -> DownloadCounter {
    DownloadCounter::open(config.stats_path()).with_flush_interval(config.stats_flush_interval())
}

async fn serve(mut config: Config, args: ServeArgs) -> Result<()> {
    if let Some(port) = args.port {
        config.server.port = port.to_string();
    }
    logging::init(&config.logging)?;
    if config.uses_default_api_key() {
        tracing::warn!(
            env = %config.security.api_key_env,
            "Running with the default API key; set a real key before exposing this server"
        );
    }

    let config = Arc::new(config);
    let store = ArtifactStore::new(config.store_settings(), counter(&config));
    store.initialize().await.or_raise(|| ErrorKind::Storage)?;
    let state = AppState::new(Arc::clone(&config), store.clone());

    let background = CancellationToken::new();
    let flusher = store.downloads().spawn_flusher(background.clone());
    let sweeper = state.limiter.as_ref().map(|limiter| limiter.spawn_sweeper(background.clone()));

    let port = config.port();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.or_raise(|| ErrorKind::Bind(port))?;
    tracing::info!(
        %addr,
        root = %config.storage.upload_dir.display(),
        categories = store.settings().categories.len(),
        "Listening"
    );

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(shelf_server::serve(listener, state.clone(), shutdown.clone().cancelled_owned()));
    let outcome = tokio::select! {
        result = &mut server => Some(result),
        () = wait_for_signal() => None,
    };
    let served = match outcome {
        Some(result) => result,
        None => {
            tracing::info!(grace = ?config.shutdown_timeout(), "Shutting down");
            shutdown.cancel();
            match tokio::time::timeout(config.shutdown_timeout(), &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("In-flight requests did not finish in time, aborting them");
                    server.abort();
                    Ok(Ok(()))
                },
            }
        },
    };

    state.gate.close();
    background.cancel();
    if flusher.await.is_err() {
        tracing::error!("Download counter flusher panicked");
    }
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    match served {
        Ok(Ok(())) => {
            tracing::info!("Stopped");
            Ok(())
        },
        Ok(Err(err)) => Err(err).or_raise(|| ErrorKind::Serve),
        Err(err) => Err(err).or_raise(|| ErrorKind::Serve),
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn list(config: Config, args: ListArgs) -> Result<()> {
    logging::init(&config.logging)?;
    let store = ArtifactStore::new(config.store_settings(), counter(&config));
    let artifacts = match args.category.as_deref() {
        Some(category) => store.list_files_by_category(category).await.or_raise(|| ErrorKind::Storage)?,
        None => store.list_files().await,
    };
    if artifacts.is_empty() {
        println!("{}", config.text.no_files_found);
        return Ok(());
    }
    for line in render_listing(&artifacts) {
        println!("{line}");
    }
    Ok(())
}

fn render_listing(artifacts: &[Artifact]) -> Vec<String> {
    let width = artifacts.iter().map(|artifact| artifact.relative_path().display().to_string().len()).max();
    let width = width.unwrap_or(0).max("ARTIFACT".len());
    std::iter::once(format!("{:<width$}  {:>10}  {:<16}  {:>9}", "ARTIFACT", "SIZE", "UPDATED (UTC)", "DOWNLOADS"))
        .chain(artifacts.iter().map(|artifact| {
            format!(
                "{:<width$}  {:>10}  {:<16}  {:>9}",
                artifact.relative_path().display().to_string(),
                artifact.human_size(),
                artifact.updated_at(),
                artifact.downloads,
            )
        }))
        .collect()
}

fn check(config: &Config) {
    let categories: Vec<&str> = config.enabled_categories().map(|(name, _)| name.as_str()).collect();
    println!("Configuration OK");
    println!("  port:        {}", config.port());
    println!("  upload dir:  {}", config.storage.upload_dir.display());
    println!("  categories:  {}", categories.join(", "));
    println!("  extensions:  {}", config.allowed_extensions.join(", "));
    if config.uses_default_api_key() {
        println!("  warning:     the default API key is in use");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn listing_is_aligned() {
        let artifacts = [
            Artifact::new("vanilla", "build-42.zip", 1536, datetime!(2024-05-01 12:30 UTC)).with_downloads(7),
            Artifact::new("gapps", "a.zip", 10, datetime!(2024-04-30 08:00 UTC)),
        ];
        let lines = render_listing(&artifacts);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ARTIFACT"));
        assert!(lines[1].starts_with("vanilla/build-42.zip"));
        assert!(lines[1].contains("1.5 KB"));
        assert!(lines[1].contains("2024-05-01 12:30"));
        assert!(lines[1].ends_with('7'));
        assert!(lines.iter().all(|line| line.len() == lines[0].len()));
    }
}
