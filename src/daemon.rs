use crate::clock::Clock;
use crate::compact::{compact_store, join_measurements};
use crate::engine::{record, MeasurementEngine};
use crate::model::MeasurementResult;
use crate::server::{self, SharedStore};
use crate::storage::HistoryStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Measure, record, then compact, holding the store lock only for the
/// store operations so the API stays responsive during probes.
pub async fn run_once<S, C>(
    engine: &MeasurementEngine,
    store: &SharedStore<S>,
    clock: &C,
) -> Result<()>
where
    S: HistoryStore<MeasurementResult> + Send,
    C: Clock,
{
    let measurement = engine.run().await;
    let mut guard = store.lock().await;
    let report = record(&mut *guard, clock, measurement)?;
    if let Some(failures) = &report.failures {
        tracing::warn!(
            probes = ?failures.kinds(),
            "measurement recorded with failures:\n{failures}"
        );
    }
    compact_store(&mut *guard, clock, join_measurements)?;
    Ok(())
}

/// Foreground scheduler: one cycle immediately, then one per `interval`,
/// until ctrl-c. Cycle errors are logged and the loop carries on.
pub async fn run<S, C>(
    engine: MeasurementEngine,
    store: S,
    clock: Arc<C>,
    interval: Duration,
    addr: Option<String>,
) -> Result<()>
where
    S: HistoryStore<MeasurementResult> + Send + 'static,
    C: Clock + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    // Listens for the whole lifetime of the daemon, including while a cycle runs.
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                tracing::error!("cannot listen for ctrl-c: {e}");
                // Keep the sender alive so the loop does not read this as a stop.
                std::future::pending::<()>().await;
            }
        }
    });
    run_until(engine, store, clock, interval, addr, stop_rx).await
}

/// Scheduler loop that ends once `stop` turns true. A cycle still in flight
/// at that point is dropped; store writes never yield, so none is left half done.
pub async fn run_until<S, C>(
    engine: MeasurementEngine,
    store: S,
    clock: Arc<C>,
    interval: Duration,
    addr: Option<String>,
    stop: watch::Receiver<bool>,
) -> Result<()>
where
    S: HistoryStore<MeasurementResult> + Send + 'static,
    C: Clock + 'static,
{
    let store: SharedStore<S> = Arc::new(tokio::sync::Mutex::new(store));

    let server = addr.map(|addr| {
        let store = store.clone();
        let mut stop = stop.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop.wait_for(|stop| *stop).await;
            };
            if let Err(e) = server::serve(&addr, store, shutdown).await {
                tracing::error!("HTTP API stopped: {e:#}");
            }
        })
    });

    let mut stop = stop;
    let stopped = async move {
        let _ = stop.wait_for(|stop| *stop).await;
    };
    tokio::pin!(stopped);

    tracing::info!(
        "daemon started, measuring every {}",
        humantime::format_duration(interval)
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    _ = &mut stopped => {
                        tracing::info!("abandoning measurement cycle");
                        break;
                    }
                    res = run_once(&engine, &store, clock.as_ref()) => {
                        if let Err(e) = res {
                            tracing::error!("cycle failed: {e:#}");
                        }
                    }
                }
            }
        }
    }
    tracing::info!("daemon stopping");

    if let Some(handle) = server {
        let _ = handle.await;
    }
    Ok(())
}
