//! Per-job monitoring: poll the warehouse until the job is terminal,
//! classify the outcome, and run the kind-specific post-completion
//! steps.
//!
//! Backoff state is local to one monitor; monitors never share
//! counters. An API error while polling is always transient - the job
//! exists server-side and will eventually report - so polling never
//! fails a run by itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::Rng;
use tracing::{error, info, warn};

use maestro_catalog::model::{Job, JobKind, Table, WriteDisposition};
use maestro_warehouse::{RETRYING_MARKER, SCHEMA_MISMATCH_MARKER, TEMPORARY_ERROR_MARKER};

use crate::export;
use crate::model::{set_table_error, set_table_running, Model};
use crate::notify;
use crate::sheets::check_sheet_size;

/// Poll backoff: base 250 ms growing by 1.8x, up to 25% random jitter
/// subtracted, capped at 15 s.
const BACKOFF_BASE_MS: f64 = 250.0;
const BACKOFF_MAX_MS: f64 = 15_000.0;
const BACKOFF_GROWTH_FACTOR: f64 = 1.8;
const BACKOFF_GROWTH_DAMPER: f64 = 0.25;

/// Delay before resubmitting after the transient-retry marker.
const RETRY_RESUBMIT_DELAY: Duration = Duration::from_secs(15);

/// Delay before the single retry of a submit that hit the temporary
/// server error.
const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Grow the backoff, subtract jitter, clamp, sleep. Returns the next
/// backoff value.
async fn pause(backoff: Duration) -> Duration {
    let mut bo = backoff.as_millis() as f64;
    bo *= BACKOFF_GROWTH_FACTOR;
    bo -= bo * rand::thread_rng().gen::<f64>() * BACKOFF_GROWTH_DAMPER;
    bo = bo.min(BACKOFF_MAX_MS);

    let delay = Duration::from_millis(bo as u64);
    tokio::time::sleep(delay).await;
    delay
}

/// Submit the job's stored configuration. A temporary server error gets
/// one delayed retry; success persists the new warehouse-side id.
pub(crate) async fn submit_job(model: &Model, job: &mut Job) -> Result<()> {
    let conf = job.parsed_configuration()?;

    let started = match model.warehouse.start_job(&conf).await {
        Ok(started) => started,
        Err(err) if err.to_string().contains(TEMPORARY_ERROR_MARKER) => {
            info!(
                "submit_job(): {:?}, retrying in {:?}",
                TEMPORARY_ERROR_MARKER, SUBMIT_RETRY_DELAY
            );
            tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
            model
                .warehouse
                .start_job(&conf)
                .await
                .map_err(|err| anyhow!("{}", err))?
        }
        Err(err) => return Err(anyhow!("{}", err)),
    };

    // Most importantly this records the warehouse-side job id.
    job.apply_warehouse_data(&started)?;
    model.catalog.update_job(job).await?;
    info!("Submitted job {} (table {}).", job.warehouse_job_id, job.table_id);
    Ok(())
}

/// Poll until the warehouse reports an end time. Fetch errors are
/// transient: log and keep going.
async fn wait_for_job(model: &Model, job: &mut Job) {
    let mut backoff = Duration::from_millis(BACKOFF_BASE_MS as u64);
    let mut err_cnt = 0u64;
    loop {
        backoff = pause(backoff).await;
        let fetched = match model.warehouse.get_job(&job.warehouse_job_id).await {
            Err(err) => {
                err_cnt += 1;
                warn!(
                    "wait_for_job() API error (try {}, will retry in ~{:?}): {}",
                    err_cnt, backoff, err
                );
                continue;
            }
            Ok(fetched) => fetched,
        };
        if let Err(err) = job.apply_warehouse_data(&fetched) {
            warn!("wait_for_job() bad job data (will retry): {}", err);
            continue;
        }
        if job.end_time.is_some() {
            // Terminal, possibly with errors.
            return;
        }
    }
}

/// Clear the stored status and resubmit with a fresh warehouse id. The
/// failing status is deliberately never persisted: a run observing it
/// would fail on an error that is about to heal itself.
async fn resubmit(model: &Model, job: &mut Job) -> Result<()> {
    job.status = None;
    job.end_time = None;
    model.catalog.update_job(job).await?;

    tokio::time::sleep(RETRY_RESUBMIT_DELAY).await;

    job.status = None;
    job.end_time = None;
    submit_job(model, job).await?;
    info!(
        "resubmit() on re-submit, new job id: {} ({}).",
        job.warehouse_job_id, job.id
    );
    Ok(())
}

pub(crate) fn spawn_monitor(model: Arc<Model>, job: Job) {
    tokio::spawn(monitor_job(model, job));
}

/// Monitor one submitted job to completion.
pub async fn monitor_job(model: Arc<Model>, mut job: Job) {
    wait_for_job(&model, &mut job).await;

    // The job is not saved yet: a transient "retry me" terminal status
    // must never be recorded where a run could see it.
    if let Some(status) = job.status.as_deref() {
        if status.contains(RETRYING_MARKER) {
            info!(
                "monitor_job: job {} ({}) backend error, retrying in {:?}.",
                job.warehouse_job_id, job.id, RETRY_RESUBMIT_DELAY
            );
            match resubmit(&model, &mut job).await {
                Ok(()) => {
                    // A new monitor picks the job up under its new id.
                    spawn_monitor(model.clone(), job);
                }
                Err(err) => error!("monitor_job() resubmit error, bailing: {}", err),
            }
            return;
        }
    }

    process_job_done(&model, &mut job).await;
}

async fn process_job_done(model: &Arc<Model>, job: &mut Job) {
    // The job is terminal without API-level trouble, though possibly
    // with warehouse errors. Record it.
    if let Err(err) = model.catalog.update_job(job).await {
        error!("process_job_done() catalog error, bailing: {}", err);
        return;
    }
    info!(
        "Job {} ({}) complete (table: {}) at {:?}.",
        job.warehouse_job_id, job.id, job.table_id, job.end_time
    );

    let mut table = match model.catalog.select_table(job.table_id).await {
        Err(err) => {
            error!("process_job_done() catalog error, bailing: {}", err);
            return;
        }
        Ok(None) => {
            warn!(
                "process_job_done() table_id {} not found, bailing.",
                job.table_id
            );
            return;
        }
        Ok(Some(table)) => table,
    };

    // Whatever import this was, it is finished now.
    model.delete_import_status(table.id);

    let error = job.error_text().unwrap_or_default();

    if !error.is_empty() {
        // A load failing on a schema change gets one shot at a full
        // reimport - but only inside a run, and only if the table has
        // no prior error (which is what stops this from re-spawning
        // itself forever).
        if job.kind == JobKind::Load
            && error.contains(SCHEMA_MISMATCH_MARKER)
            && table.error.is_empty()
            && job.run_id.unwrap_or(0) != 0
        {
            info!(
                "Schema change error in table {} ({}), reimporting.",
                table.name, table.id
            );
            if let Err(err) = reimport_on_schema_change(model, &mut table, job, &error).await {
                error!("process_job_done() reimport error: {}", err);
            }
            return;
        }

        if let Err(err) = set_table_error(model, &mut table, &error).await {
            error!("process_job_done() catalog error, bailing: {}", err);
            return;
        }
        model
            .alert(format!(
                "Warehouse error in {}: {}",
                table_link(&table),
                error
            ))
            .await;
        error!(
            "Job {} ({} table: {}) warehouse error {}.",
            job.warehouse_job_id, job.id, job.table_id, error
        );
        return; // no post-completion on errors
    }

    // No errors. A schema-mismatch error left on the table by the
    // failed load has been healed by this successful reimport.
    if table.error.contains(SCHEMA_MISMATCH_MARKER) {
        table.error = String::new();
    }

    if let Err(err) = set_table_running(model, &mut table, false).await {
        error!("process_job_done() catalog error, bailing: {}", err);
        return;
    }

    // Loads, extracts, and queries without a pending extract step mark
    // the table's last good run end. A query with an extract defers to
    // the extract job's completion.
    if table.error.is_empty() && (job.kind != JobKind::Query || !table.extract) {
        table.last_ok_run_end_at = Some(Utc::now());
        if let Err(err) = model.catalog.save_table(&table).await {
            error!("process_job_done() catalog error, bailing: {}", err);
            return;
        }
    }

    match job.kind {
        JobKind::Query => post_completion_query(model, &mut table, job).await,
        JobKind::Extract => post_completion_extract(model, &mut table, job).await,
        JobKind::Load => post_completion_load(model, job, &mut table).await,
    }
}

async fn reimport_on_schema_change(
    model: &Arc<Model>,
    table: &mut Table,
    job: &Job,
    error: &str,
) -> Result<()> {
    model
        .alert(format!(
            "Re-importing due to schema change in {}: {}",
            table_link(table),
            error
        ))
        .await;
    model.delete_import_status(table.id);
    model.reimport_table(table, job.user_id, job.run_id).await?;
    // Record the error anyway, as the deterrent against this spawning
    // itself ad infinitum; it is cleared when the reimport succeeds.
    set_table_error(model, table, error).await?;
    Ok(())
}

async fn post_completion_query(model: &Arc<Model>, table: &mut Table, job: &Job) {
    if table.extract || table.export_db_id.is_some() {
        match model.extract_table_to_store(table, job.user_id, job.run_id).await {
            Ok(extract_id) => {
                info!(
                    "Submitted extract {} for table id: {} OK.",
                    extract_id, table.id
                );
            }
            Err(err) => {
                let _ = set_table_error(model, table, &err.to_string()).await;
                model
                    .alert(format!(
                        "Extract error in {}: {}.",
                        table_link(table),
                        err
                    ))
                    .await;
                error!("post_completion_query() extract error, bailing: {}.", err);
                return;
            }
        }
    }
    if table.sheets_extract {
        if let Err(err) = extract_to_sheet(model, table).await {
            let _ = set_table_error(model, table, &err.to_string()).await;
            model
                .alert(format!(
                    "Sheets extract error in {}: {}.",
                    table_link(table),
                    err
                ))
                .await;
            error!(
                "post_completion_query() sheet extract error for table {}, bailing: {}.",
                table.id, err
            );
            return;
        }
        info!("Submitted a sheet extract for table id: {} OK.", table.id);
    }
}

async fn post_completion_extract(model: &Arc<Model>, table: &mut Table, job: &Job) {
    if let Err(err) = notify::notify_completion(model, table, job).await {
        // A failed webhook is logged, never fatal.
        warn!("post_completion_extract() notify error (ignoring): {}.", err);
    }
    if table.export_db_id.is_some() {
        if let Err(err) = export::export_table(model, table).await {
            let _ = set_table_error(model, table, &err.to_string()).await;
            model
                .alert(format!(
                    "Export to db error in {}: {}",
                    table_link(table),
                    err
                ))
                .await;
            error!(
                "post_completion_extract() export error for table {}, bailing: {}.",
                table.id, err
            );
            return;
        }
        info!("Submitted export to db for table id: {} OK.", table.id);
    }
}

async fn post_completion_load(model: &Arc<Model>, job: &Job, table: &mut Table) {
    // Delete the source files as a clean-up gesture; failure to do so
    // is logged and otherwise ignored.
    if let Ok(conf) = job.parsed_configuration() {
        if let Some(uris) = conf.load.and_then(|l| l.source_uris) {
            info!("load cleanup: deleting {:?}", uris);
            if let Err(err) = model.store.delete_files(&uris).await {
                warn!("load cleanup: error deleting: {}", err);
            }
        }
    }

    // An incremental import that just ran with a truncating disposition
    // was a reimport; later incremental loads must append again.
    if !table.id_column.is_empty() && table.disposition == WriteDisposition::Replace {
        table.disposition = WriteDisposition::Append;
    }
    table.imported_at = Some(Utc::now());
    if let Err(err) = model.catalog.save_table(table).await {
        error!("post_completion_load() catalog error: {}", err);
    }
}

/// Start the sheet pipeline for a small table: size check, mark
/// running, hand the rows to the sheet sink on a detached task.
async fn extract_to_sheet(model: &Arc<Model>, table: &mut Table) -> Result<()> {
    let info = model
        .warehouse
        .get_table(&table.dataset, &table.name)
        .await
        .map_err(|err| anyhow!("{}", err))?;
    check_sheet_size(&info)?;

    set_table_running(model, table, true).await?;

    let headers: Vec<String> = info.schema.fields.iter().map(|f| f.name.clone()).collect();
    let model = model.clone();
    let mut table = table.clone();
    tokio::spawn(async move {
        if let Err(err) = model.sheets.export(&table, headers).await {
            error!("sheet export error in export(): {}", err);
            table.running = false;
            let _ = set_table_error(&model, &mut table, &err.to_string()).await;
            return;
        }
        let _ = set_table_running(&model, &mut table, false).await;
    });
    Ok(())
}

fn table_link(table: &Table) -> String {
    format!("<{{URL_PREFIX}}/#/table/{}|{}>", table.id, table.name)
}

/// Startup recovery: re-attach a monitor to every job that was
/// submitted but never observed terminal.
pub(crate) async fn monitor_unfinished_jobs(model: Arc<Model>) {
    info!("Checking for unfinished jobs...");

    let jobs = match model.catalog.running_jobs().await {
        Ok(jobs) => jobs,
        Err(err) => {
            error!("monitor_unfinished_jobs(): error {}", err);
            return;
        }
    };

    if jobs.is_empty() {
        info!("No unfinished jobs.");
        return;
    }

    for job in jobs {
        info!(
            "Started monitor for job {:?} (table: {})",
            job.warehouse_job_id, job.table_id
        );
        spawn_monitor(model.clone(), job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        tokio::time::pause();

        let mut backoff = Duration::from_millis(250);
        let handle = tokio::spawn(async move {
            let mut values = Vec::new();
            for _ in 0..12 {
                backoff = pause(backoff).await;
                values.push(backoff);
            }
            values
        });
        // Advance virtual time until the task finishes.
        for _ in 0..200 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            if handle.is_finished() {
                break;
            }
        }
        let values = handle.await.unwrap();

        // First step: 250 * 1.8 = 450ms minus up to 25% jitter.
        assert!(values[0] <= Duration::from_millis(450));
        assert!(values[0] >= Duration::from_millis(337));
        // Monotonic-ish growth up to the cap.
        let last = *values.last().unwrap();
        assert!(last <= Duration::from_millis(15_000));
        assert!(last > Duration::from_millis(5_000));
    }
}
