use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use tablejob_core::{NewJob, WorkerId, payload};
use tablejob_infra::Settings;
use tablejob_infra::jobs::{PostgresJobStore, Worker, WorkerHandle};
use tablejob_worker::{Command, Hello, demo_registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tablejob_observability::init();

    let command = Command::from_args(std::env::args().skip(1))?;
    let settings = Settings::from_env().context("failed to load settings")?;

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool, settings.table.clone())?;
    store.create_table().await?;

    let worker_id = WorkerId::for_local_host(&settings.worker_prefix);
    let queue = settings.worker.queue.clone();

    match command {
        Command::Status => {
            let status = store.status(&queue).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::EnqueueDemo(n) => {
            let jobs = (0..n)
                .map(|i| {
                    payload::encode(&Hello {
                        name: format!("job {i}"),
                    })
                    .map(|p| NewJob::new(p).on_queue(queue.as_str()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let inserted = store.insert_many(jobs).await?;
            tracing::info!(inserted, queue = %queue, "enqueued demo jobs");
        }
        Command::ReleaseLeases => {
            let released = store.unlock_all(&worker_id).await?;
            tracing::info!(released, worker = %worker_id, "released leases");
        }
        Command::Run => {
            let registry = Arc::new(demo_registry()?);
            let handle = Worker::new(store, registry, settings.worker, worker_id).spawn()?;

            tokio::select! {
                () = shutdown_signal() => {}
                () = finished(&handle) => {}
            }

            let report = tokio::task::spawn_blocking(move || handle.shutdown()).await??;
            tracing::info!(
                iterations = report.iterations,
                jobs_run = report.jobs_run,
                "worker stopped"
            );
        }
    }

    Ok(())
}

/// Resolves once the worker thread has exited on its own.
async fn finished(handle: &WorkerHandle) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Wait for SIGINT or (on Unix) SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, stopping worker"),
        () = terminate => tracing::info!("received SIGTERM, stopping worker"),
    }
}
