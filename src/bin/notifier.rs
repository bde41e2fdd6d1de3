use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use watchpost::{EngineHandle, Event, config::read_config_file};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("watchpost", LevelFilter::TRACE),
        ("notifier", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let engine = EngineHandle::spawn(config);
    let mut events = engine.subscribe();

    if let Err(e) = engine.wait_ready(Duration::from_secs(30)).await {
        warn!("continuing without a complete snapshot: {e}");
    } else {
        let counters = engine.store().counters().await;
        info!(
            "snapshot ready: {} hosts up, {} down, {} problems",
            counters.hosts.up, counters.hosts.down, counters.problems
        );
    }

    loop {
        match events.recv().await {
            Ok(event) => report(&engine, event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event consumer lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    Ok(())
}

async fn report(engine: &EngineHandle, event: Event) {
    match event {
        Event::SnapshotChanged {
            resource,
            diff,
            counters,
        } => {
            for entity in &diff.changed {
                info!(
                    "{} {} is now {:?}{}",
                    entity.kind,
                    entity.display_name(),
                    entity.state,
                    if entity.acknowledged {
                        " (acknowledged)"
                    } else {
                        ""
                    }
                );
            }
            trace!(
                "{resource} merged: +{} -{} ~{}, {} problems",
                diff.added.len(),
                diff.removed.len(),
                diff.changed.len(),
                counters.problems
            );

            let problems = engine.store().problems().await;
            if !problems.is_empty() {
                info!("{} open problems", problems.len());
            }
        }

        Event::Disconnected { reason } => error!("backend connection lost: {reason}"),
        Event::Reconnected => info!("backend connection restored"),
        Event::ActionCompleted(action) => {
            info!(
                "{:?} for host {} confirmed by backend",
                action.kind, action.host_id
            );
        }
        Event::ActionTimedOut(action) => {
            warn!(
                "{:?} for host {} was never confirmed, giving up",
                action.kind, action.host_id
            );
        }
    }
}
