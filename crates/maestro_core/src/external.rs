//! External tables: waits for outside uploads, and the load that runs
//! when the upload arrives.
//!
//! An external table "runs" by registering a wait. The outside process
//! uploads to a signed URL and then calls the external load, which
//! cancels the wait, points the pre-inserted load job at the uploaded
//! file and submits it. If nothing arrives within the table's timeout,
//! the wait is removed and the timeout becomes the table's error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::oneshot;
use tracing::{error, info};

use maestro_catalog::model::{Job, Table};

use crate::model::{set_table_error, set_table_running, ExternalWait, Model};
use crate::monitor::{spawn_monitor, submit_job};

/// Format seconds the way the timeout error reports them: `1h0m0s`,
/// `1m30s`, `45s`.
pub fn format_duration_go(secs: i64) -> String {
    let (h, rem) = (secs / 3600, secs % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}

impl Model {
    pub fn has_external_wait(&self, table_id: i64) -> bool {
        self.state
            .lock()
            .unwrap()
            .external_waits
            .contains_key(&table_id)
    }

    /// Register a wait for an outside upload. The job, when given, is
    /// the run's pre-inserted load job; it is returned to whoever
    /// cancels the wait.
    pub async fn start_external_wait(
        self: &Arc<Self>,
        table: &Table,
        job: Option<Job>,
    ) -> Result<()> {
        let timeout_secs = match table.external_tmout_secs {
            Some(secs) => secs,
            None => bail!("Not an external table"),
        };

        if self.has_external_wait(table.id) {
            bail!("External wait for table id {} already exists.", table.id);
        }

        let mut table = table.clone();
        set_table_running(self, &mut table, true).await?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .external_waits
            .insert(table.id, ExternalWait {
                cancel: cancel_tx,
                job,
            });

        let model = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_rx => {
                    // Cancelled: the upload arrived and the external
                    // load takes it from here.
                }
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs.max(0) as u64)) => {
                    model.state.lock().unwrap().external_waits.remove(&table.id);
                    let msg = format!(
                        "External wait timed out after {}",
                        format_duration_go(timeout_secs)
                    );
                    info!("table {}: {}", table.id, msg);
                    // The wait is gone, so nothing is running anymore.
                    table.running = false;
                    if let Err(err) = set_table_error(&model, &mut table, &msg).await {
                        error!("external wait timeout: {}", err);
                    }
                    model
                        .alert(format!("External wait timed out for table {}.", table.name))
                        .await;
                }
            }
        });

        Ok(())
    }

    /// Cancel a pending wait, returning its registered job (when the
    /// wait came from a run).
    pub fn cancel_external_wait(&self, table_id: i64) -> Option<Option<Job>> {
        let wait = self
            .state
            .lock()
            .unwrap()
            .external_waits
            .remove(&table_id)?;
        let _ = wait.cancel.send(());
        Some(wait.job)
    }

    /// The outside uploader has delivered `fname` to object storage:
    /// cancel the wait, rewrite the load job's sources and submit it.
    pub async fn external_load(
        self: &Arc<Self>,
        table: &mut Table,
        fname: &str,
        user_id: Option<i64>,
    ) -> Result<()> {
        let job = self.cancel_external_wait(table.id).flatten();

        let mut job = match job {
            Some(job) => job,
            None => {
                // Interactive load with no pending run job: mint one.
                let job =
                    self.new_load_job(table, user_id, None, None, &table.dataset)?;
                self.catalog.insert_job(&job).await?
            }
        };

        let url = self.store.url_for_name(fname);
        job.set_load_sources(vec![url.clone()])
            .map_err(|err| anyhow!("{}", err))?;

        info!("External load for table {} from {}", table.name, url);
        submit_job(self, &mut job).await?;

        let id = job.warehouse_job_id.clone();
        spawn_monitor(self.clone(), job);
        info!("external_load: started monitor for load job {:?}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration_go(3600), "1h0m0s");
        assert_eq!(format_duration_go(90), "1m30s");
        assert_eq!(format_duration_go(45), "45s");
        assert_eq!(format_duration_go(7425), "2h3m45s");
        assert_eq!(format_duration_go(0), "0s");
    }
}
