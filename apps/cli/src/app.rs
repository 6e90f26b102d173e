//! Application orchestrator: wires transport, notifier and scheduler
//! together and runs one command.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use vidvault_protocol::{TransferRecord, TransferState};
use vidvault_scheduler::{
    ChannelNotifier, Scheduler, SchedulerError, StartOutcome, TransferEvent,
};
use vidvault_storage::{ArtifactDir, DiskProbe};
use vidvault_transport::HttpTransport;

use crate::Command;
use crate::config::Config;

/// Runs `command` to completion.
pub async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    // -- Transport --
    let partial_dir = ArtifactDir::new(&config.scheduler.artifact_dir).partial_dir();
    let transport = Arc::new(
        HttpTransport::new(config.http.transport_config(partial_dir))
            .context("failed to build HTTP transport")?,
    );

    // -- Scheduler --
    let notifier = Arc::new(ChannelNotifier::new());
    let mut events = notifier
        .take_events()
        .context("notification receiver already taken")?;
    let sweep_interval = config.scheduler.sweep_interval();
    let scheduler = Scheduler::launch(
        config.scheduler,
        transport.clone(),
        notifier.clone(),
        Arc::new(DiskProbe::new()),
    )
    .await?;

    let swept = scheduler.sweep_expired().await;
    if !swept.removed.is_empty() {
        tracing::info!(removed = swept.removed.len(), "expired downloads removed");
    }

    let result = match command {
        Command::Get { urls, retry } => {
            let sweeper = scheduler.spawn_periodic_sweep(sweep_interval);
            let result = get(&scheduler, &urls, retry, &mut events).await;
            sweeper.abort();
            result
        }
        Command::List => {
            list(&scheduler.records());
            Ok(())
        }
        Command::Sweep => {
            let report = scheduler.sweep_expired().await;
            for key in swept.removed.iter().chain(&report.removed) {
                println!("removed  {key}");
            }
            for (key, reason) in &report.failures {
                println!("failed   {key}: {reason}");
            }
            Ok(())
        }
        Command::Delete { url } => match scheduler.delete(&url).await {
            Ok(true) => {
                println!("deleted  {url}");
                Ok(())
            }
            Ok(false) => {
                println!("unknown  {url}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Command::Cancel { url } => scheduler
            .cancel(&url)
            .await
            .map(|()| println!("cancelled {url}"))
            .map_err(Into::into),
    };

    // -- Graceful shutdown --
    if let Err(e) = scheduler.flush().await {
        tracing::error!("failed to flush transfer state: {e}");
    }
    scheduler.shutdown();
    transport.shutdown();

    result
}

/// Starts every URL and reports events until each one has settled.
///
/// Ctrl-C pauses everything still running so the next `get` resumes it.
async fn get(
    scheduler: &Scheduler,
    urls: &[String],
    retry: bool,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<TransferEvent>,
) -> anyhow::Result<()> {
    let mut pending = HashSet::new();
    let mut failed = 0usize;

    for url in urls {
        let outcome = if retry {
            scheduler.retry(url).await
        } else {
            scheduler.start(url).await
        };

        match outcome {
            Ok(StartOutcome::AlreadyCompleted) => {
                let location = scheduler
                    .record(url)
                    .and_then(|r| r.local_artifact_name)
                    .map(|name| scheduler.artifacts().path_for(&name));
                match location {
                    Some(path) => println!("ready    {url} -> {}", path.display()),
                    None => println!("ready    {url}"),
                }
            }
            Ok(StartOutcome::Failed) => {
                println!("failed   {url}");
                failed += 1;
            }
            Ok(outcome) => {
                tracing::debug!(url = %url, ?outcome, "transfer requested");
                pending.insert(url.clone());
            }
            Err(SchedulerError::InsufficientSpace) => {
                println!("no space {url}");
                failed += 1;
            }
            Err(e) => {
                println!("error    {url}: {e}");
                failed += 1;
            }
        }
    }

    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                report(&event);
                if event.is_terminal()
                    && pending.remove(event.key())
                    && !matches!(event, TransferEvent::Completed { .. })
                {
                    failed += 1;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, pausing transfers");
                let paused = scheduler.pause_all().await;
                scheduler.wait_for_pauses().await;
                println!("paused {paused} transfer(s); run `get` again to resume");
                break;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} transfer(s) did not complete");
    }
    Ok(())
}

fn report(event: &TransferEvent) {
    match event {
        TransferEvent::Progress { key, fraction } => {
            println!("{:>5.1}%   {key}", fraction * 100.0);
        }
        TransferEvent::Completed { key, location } => {
            println!("done     {key} -> {}", location.display());
        }
        TransferEvent::Failed { key, error } => {
            if error.offers_retry() {
                println!("failed   {key}: {error} (use --retry to start over)");
            } else {
                println!("failed   {key}: {error}");
            }
        }
        TransferEvent::InsufficientSpace { key } => println!("no space {key}"),
    }
}

fn list(records: &[TransferRecord]) {
    if records.is_empty() {
        println!("no transfers");
        return;
    }
    for record in records {
        let detail = match (record.state, record.expires_at) {
            (TransferState::Completed, Some(expires)) => {
                format!("expires {}", expires.format("%Y-%m-%d"))
            }
            _ => format!("{:.1}%", record.progress * 100.0),
        };
        println!(
            "{:<12} {:<18} {}",
            record.state.to_string(),
            detail,
            record.resource_key
        );
    }
}
