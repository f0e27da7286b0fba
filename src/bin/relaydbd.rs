use std::sync::Arc;

use clap::Parser;
use relaydb::{
    BroadcastPublisher, ConnectionPool, Event, StreamKind, WriteCoordinator,
    config::read_config_file,
};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Feeds newline-delimited JSON events from stdin into the write
/// coordinator, one `{"stream": ..., "event": ...}` object per line.
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

#[derive(Debug, Deserialize)]
struct EventLine {
    stream: StreamKind,
    event: Event,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("relaydb", LevelFilter::TRACE),
        ("relaydbd", LevelFilter::TRACE),
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

    let (db_config, coordinator_config) = read_config_file(&args.file)?;
    info!("writing to {}", db_config.path.display());

    let pool = ConnectionPool::new();
    let publisher = Arc::new(BroadcastPublisher::new(1024));
    let handle =
        WriteCoordinator::spawn(db_config.clone(), coordinator_config, publisher, &pool).await?;
    handle.attach_storage(&db_config)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<EventLine>(&line) {
                    Ok(EventLine { stream, event }) => {
                        let acks = handle.send_event(stream, event)?;
                        sent += 1;
                        if acks > 0 {
                            debug!("{} events acknowledged, {} sent", acks, sent);
                        }
                    }
                    Err(err) => warn!("unreadable event line skipped: {}", err),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    if handle.stop().await {
        info!("coordinator stopped cleanly after {} events", sent);
    } else {
        error!("coordinator did not stop cleanly");
    }
    println!("{}", serde_json::to_string_pretty(&handle.statistics())?);
    Ok(())
}
