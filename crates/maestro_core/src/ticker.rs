//! Frequency tickers: one producer task per active frequency, one
//! receiver that launches runs.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info};

use maestro_catalog::model::{Freq, Run};
use maestro_scheduler::next_firing;

use crate::model::Model;
use crate::run::{assemble_run, start_run};

/// Depth of the shared tick channel.
const TICK_CHANNEL_DEPTH: usize = 8;

/// One firing of a frequency. A tick not consumed by `not_later_than`
/// is stale and gets dropped: catch-up under heavy load is not
/// attempted, the next period fires soon enough.
#[derive(Debug, Clone)]
pub struct RunTick {
    pub freq: Freq,
    pub not_later_than: DateTime<Utc>,
}

async fn run_ticker(freq: Freq, tx: mpsc::Sender<RunTick>) {
    let mut last_next: Option<DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        let next = next_firing(now, freq.period, freq.offset);

        if last_next != Some(next) {
            info!("Next run for period {:?} is at: {}", freq.name, next);
            last_next = Some(next);
        }

        if next < now {
            // Possible with a negative offset; the grid catches up
            // within a second.
            tokio::time::sleep(StdDuration::from_secs(1)).await;
            continue;
        }

        let sleep = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(sleep).await;

        let tick = RunTick {
            freq: freq.clone(),
            not_later_than: next + freq.period,
        };
        if tx.send(tick).await.is_err() {
            return; // receiver gone, shutting down
        }
    }
}

/// Launch a ticker per active frequency and the single receiver that
/// assembles and starts runs.
pub(crate) async fn trigger_runs(model: Arc<Model>) -> Result<()> {
    let freqs = model.catalog.select_freqs().await?;

    let (tx, mut rx) = mpsc::channel(TICK_CHANNEL_DEPTH);
    for freq in freqs {
        if !freq.active {
            continue;
        }
        info!(
            "Starting run ticker for period {:?}: {:?} +{:?}",
            freq.name, freq.period, freq.offset
        );
        tokio::spawn(run_ticker(freq, tx.clone()));
    }
    drop(tx);

    tokio::spawn(async move {
        while let Some(tick) = rx.recv().await {
            let now = Utc::now();
            if tick.not_later_than <= now {
                info!("trigger_runs(): dropping stale run tick {:?}", tick);
                continue;
            }
            info!("trigger_runs(): starting run {:?}", tick);

            if let Err(err) = launch_run(&model, &tick, now).await {
                error!("trigger_runs(): {}", err);
                model.alert(format!("Maestro run error: {}", err)).await;
            }
        }
    });

    Ok(())
}

async fn launch_run(model: &Arc<Model>, tick: &RunTick, now: DateTime<Utc>) -> Result<()> {
    let mut run = Run {
        freq_id: tick.freq.id,
        ..Default::default()
    };
    assemble_run(model, &mut run, now)
        .await
        .map_err(|err| anyhow::anyhow!("error assembling: {}", err))?;
    start_run(model.clone(), run)
        .await
        .map_err(|err| anyhow::anyhow!("error starting: {}", err))
}
