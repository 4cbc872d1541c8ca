mod cli;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use cli::{Cli, Commands, apply_overrides, init_config};
use rtfmri::config::Config;
use rtfmri::ipc::{CommandDispatcher, MessageClient, MessageServer};
use rtfmri::model::ModelRegistry;
use rtfmri::relay::{AllowList, RelayHandler, RelayService};
use rtfmri::run::{
    DicomNaming, ReplaySource, RunDriver, RunOutputDir, SessionSchedule, TrialSource,
    WatchedFileSource,
};
use rtfmri::watch::{FileWatch, FileWatcher, WaitOutcome};
use rtfmri::worker::{CancelFlag, WorkerSlot};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RTFMRI_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        return init_config(&cli.config);
    }

    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config '{}'", cli.config))?;
    apply_overrides(&cli.command, &mut config);
    config.validate()?;

    match cli.command {
        Commands::Serve { .. } => serve(&config).await,
        Commands::Run { local, .. } => run(&config, local).await,
        Commands::Relay { .. } => relay(&config).await,
        Commands::Wait {
            path, timeout_secs, ..
        } => wait(&config, &path, timeout_secs).await,
        Commands::Init => Ok(()),
    }
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let mut server = MessageServer::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to listen on {}", config.server.addr))?;
    let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
    dispatcher.serve(&mut server).await?;
    Ok(())
}

async fn run(config: &Config, local: bool) -> anyhow::Result<()> {
    let schedule_path = config
        .session
        .schedule
        .as_deref()
        .context("No schedule given: pass one to 'rtf run' or set session.schedule")?;
    let schedule = SessionSchedule::from_file(schedule_path)?;

    // With --local the dispatcher runs in this process on an ephemeral port
    let (server_addr, local_server) = if local {
        let mut server = MessageServer::bind("127.0.0.1:0").await?;
        let addr = server.local_addr()?.to_string();
        let handle = tokio::spawn(async move {
            let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
            dispatcher.serve(&mut server).await
        });
        (addr, Some(handle))
    } else {
        (config.client.server_addr.clone(), None)
    };

    let mut client = MessageClient::connect_with_retry(
        &server_addr,
        config.client.connect_attempts,
        config.client.connect_retry(),
    )
    .await
    .with_context(|| format!("Failed to connect to model server at {}", server_addr))?;
    client.init_model(&config.client.model).await?;
    info!(model = %config.client.model, addr = %server_addr, "model loaded");

    let (mut client, result) = match &config.session.image_dir {
        Some(image_dir) => {
            let naming = DicomNaming::new(image_dir, &config.session.dicom_name_pattern)?;
            let mut watcher = FileWatcher::new(config.watch.strategy());
            watcher.init_watch(
                image_dir,
                &config.watch.file_pattern,
                config.watch.min_file_size,
            )?;
            let timeout = config.watch.wait_timeout();
            drive_session(client, schedule, config, move |cancel| {
                WatchedFileSource::new(watcher, naming, timeout).with_cancel(cancel)
            })
            .await?
        }
        None => drive_session(client, schedule, config, |_| ReplaySource).await?,
    };

    if let Some(handle) = local_server {
        client.shutdown_server().await?;
        handle.await??;
    }
    result?;
    Ok(())
}

/// Run the session in a worker slot so Ctrl-C can stop it between commands.
/// Returns the client so the caller can still talk to the server.
async fn drive_session<S, F>(
    client: MessageClient,
    schedule: SessionSchedule,
    config: &Config,
    make_source: F,
) -> anyhow::Result<(MessageClient, rtfmri::error::Result<()>)>
where
    S: TrialSource + 'static,
    F: FnOnce(CancelFlag) -> S,
{
    let output = RunOutputDir::new(&config.session.output_dir);
    let mut slot = WorkerSlot::new("session");
    let cancel = slot.start(move |cancel| {
        let source = make_source(cancel.clone());
        async move {
            let mut driver = RunDriver::new(client, source, output).with_cancel(cancel);
            let result = driver.run_session(&schedule).await;
            let (client, _, _) = driver.into_parts();
            (client, result)
        }
    })?;

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });
    let outcome = slot.join().await?;
    interrupt.abort();
    outcome.context("session worker produced no result")
}

async fn relay(config: &Config) -> anyhow::Result<()> {
    if config.relay.allowed_dirs.is_empty() {
        anyhow::bail!("No allowed directories: pass --allow-dir or set relay.allowed_dirs");
    }
    let allow = AllowList::new(&config.relay.allowed_dirs, &config.relay.allowed_types);
    let handler = RelayHandler::new(FileWatcher::new(config.watch.strategy()), allow);
    let mut service = RelayService::new(
        handler,
        config.relay.peer_addr.clone(),
        config.relay.retry_interval(),
    );

    info!(peer = %config.relay.peer_addr, "relay starting");
    tokio::select! {
        _ = service.run_forever() => {}
        _ = tokio::signal::ctrl_c() => info!("relay stopped"),
    }
    Ok(())
}

async fn wait(config: &Config, path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Path has no file name")?;

    let mut watcher = FileWatcher::new(config.watch.strategy());
    watcher.init_watch(
        &dir,
        &glob::Pattern::escape(name),
        config.watch.min_file_size,
    )?;

    match watcher
        .wait_for_file(&path, Duration::from_secs(timeout_secs))
        .await?
    {
        WaitOutcome::Found(found) => {
            println!("{}", found.display());
            Ok(())
        }
        WaitOutcome::TimedOut => {
            anyhow::bail!("Timed out after {}s waiting for {}", timeout_secs, path.display())
        }
    }
}
