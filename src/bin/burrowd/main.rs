mod args;
mod conn;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use burrow::broker::{Broker, BrokerConfig};
use burrow::journal::{self, Journal};
use burrow::sweeper;
use burrow::tube::TubeConfig;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = if let Err(error) = begin(args, cancel, shutdown_hold).await
    {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    shutdown_wait.recv().await;

    exit_code
}

async fn begin(
    args: Args,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let config = BrokerConfig {
        tube: TubeConfig {
            max_jobs: args.max_jobs_per_tube,
        },
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
    };

    // With a WAL directory configured, committed state transitions are
    // drained to an append-only journal file; the core never blocks on it.
    let broker = Arc::new(match args.wal_dir {
        Some(dir) => {
            let (journal, rx) = Journal::new();
            tokio::spawn(async move {
                if let Err(error) = journal::write_to_dir(dir, rx).await {
                    error!(%error, "journal writer failed");
                }
            });
            Broker::with_journal(config, journal)
        },
        None => Broker::new(config),
    });

    tokio::spawn(sweeper::run(Arc::clone(&broker), cancel.clone()));

    let listener = TcpListener::bind((args.listen, args.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle
    // each connection as its own task.
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        tokio::spawn(conn::begin_handle(
            Arc::clone(&broker),
            args.max_job_size,
            cancel.clone(),
            shutdown_hold.clone(),
            conn,
        ));
    }

    Ok(())
}
