//! Run assembly and the cycle loop that drives a run to completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info};

use maestro_catalog::model::{Job, JobKind, Run};
use maestro_scheduler::Graph;
use maestro_warehouse::SCHEMA_MISMATCH_MARKER;

use crate::imports::ImportStatus;
use crate::model::{set_table_error, set_table_running, Model};
use crate::monitor::{spawn_monitor, submit_job};

/// Pause between process cycles.
const CYCLE_PAUSE: Duration = Duration::from_secs(5);

/// Write the run to the catalog and create all the jobs that belong to
/// it, parents resolved in the process. The resulting set of jobs is
/// the run's execution plan and is self-sufficient: tables can change
/// afterwards without affecting an assembled run.
pub async fn assemble_run(
    model: &Model,
    run: &mut Run,
    now: DateTime<Utc>,
) -> Result<()> {
    if run.id != 0 {
        bail!("Run already has an id, cannot assemble twice.");
    }

    // The catalog's partial unique index turns a concurrent second
    // assembly for this frequency into a distinct error here.
    let inserted = model.catalog.insert_run(run.user_id, run.freq_id).await?;
    run.id = inserted.id;
    run.created_at = inserted.created_at;

    let by_freq = model.catalog.tables_by_frequency(run.freq_id).await?;

    let tables: Vec<_> = by_freq
        .into_iter()
        .filter(|t| t.conditions_satisfied(now))
        .collect();

    let parents = model.tables_parents(&tables).await?;

    for table in &tables {
        let parent_ids: Vec<i64> = parents
            .get(&table.name)
            .map(|ps| ps.iter().map(|p| p.id).collect())
            .unwrap_or_default();

        let job = if table.is_import() {
            let dataset = model.import_dataset(table).await?;
            let name = table.import_file_name(Some(run.id), now);
            let url = model.store.url_for_name(&name);
            model.new_load_job(table, run.user_id, Some(run.id), Some(vec![url]), &dataset)?
        } else if table.is_external() {
            // The store URL is unknown until the outside upload
            // happens; it is filled in by the external load.
            model.new_load_job(table, run.user_id, Some(run.id), None, &table.dataset)?
        } else {
            model.new_query_job(table, run.user_id, Some(run.id), &parent_ids)?
        };

        model.catalog.insert_job(&job).await?;
    }

    Ok(())
}

/// Stamp the start time and begin cycling on a background task.
pub async fn start_run(model: Arc<Model>, mut run: Run) -> Result<()> {
    info!("Starting run.");
    run.start_time = Some(Utc::now());
    model.catalog.update_run(&run).await?;
    tokio::spawn(monitor_run(model, run, false));
    Ok(())
}

/// Resume a failed run: clear the end state and keep cycling, this
/// time with an error budget equal to the errors already present. The
/// run continues *after* the failed table, which is presumably fixed
/// and re-run manually.
pub async fn resume_run(model: Arc<Model>, mut run: Run) -> Result<()> {
    info!("Resuming run ({}) freq_id: {}.", run.id, run.freq_id);
    run.end_time = None;
    run.error = None;
    model.catalog.update_run(&run).await?;
    tokio::spawn(monitor_run(model, run, true));
    Ok(())
}

async fn monitor_run(model: Arc<Model>, mut run: Run, ignore_errors: bool) {
    // When resuming, pre-existing errors become the budget; one more
    // fails the run again.
    let max_err_cnt = if ignore_errors {
        match count_errors(&model, run.id).await {
            Ok(cnt) => cnt,
            Err(err) => {
                error!("monitor_run error: {}", err);
                0
            }
        }
    } else {
        0
    };

    loop {
        if let Err(err) = process_cycle(&model, &mut run, max_err_cnt).await {
            model
                .alert(format!(
                    "Run ({}) failed (freq_id: {}): {}",
                    run.id, run.freq_id, err
                ))
                .await;
            error!("Run ({}) failed: {}", run.id, err);
            run.end_time = Some(Utc::now());
            run.error = Some(err.to_string());
            if let Err(err) = model.catalog.update_run(&run).await {
                error!("monitor_run error: {}", err);
            }
        }

        if run.end_time.is_some() {
            info!(
                "Run ({}) completed (freq_id: {}), exiting monitor_run().",
                run.id, run.freq_id
            );
            return;
        }

        tokio::time::sleep(CYCLE_PAUSE).await;
    }
}

/// Count terminal errors in the run's jobs, ignoring schema-mismatch
/// markers (those are pending retries, not failures).
async fn count_errors(model: &Model, run_id: i64) -> Result<i64> {
    let jobs = model.catalog.jobs_by_run(run_id).await?;
    let mut cnt = 0;
    for job in &jobs {
        let error = job.error_text()?;
        if error.is_empty() || error.contains(SCHEMA_MISMATCH_MARKER) {
            continue;
        }
        cnt += 1;
    }
    Ok(cnt)
}

/// The unfinished portion of the run as a dependency graph. Jobs whose
/// status matches the schema-mismatch marker are pending retries and
/// stay out entirely; edges to parents not in the set are dropped,
/// which naturally prunes completed parents.
async fn load_unfinished_job_graph(
    model: &Model,
    run_id: i64,
    max_err_cnt: i64,
) -> Result<Graph<Job>> {
    let jobs = model.catalog.jobs_by_run(run_id).await?;

    let mut by_table: HashMap<i64, Job> = HashMap::new();
    let mut err_cnt = 0i64;
    for job in jobs {
        let status = job.parsed_status()?;
        let error = status
            .as_ref()
            .map(|s| s.error_message().to_string())
            .unwrap_or_default();
        if error.contains(SCHEMA_MISMATCH_MARKER) {
            continue;
        }
        if !error.is_empty() {
            err_cnt += 1;
        }

        // Terminal means the warehouse said so and stamped an end time,
        // errored or not. A terminal errored job within a resumed run's
        // budget drops out of the graph, which is what lets the run
        // continue past it.
        let done =
            status.as_ref().map(|s| s.done()).unwrap_or(false) && job.end_time.is_some();

        let over_budget = !error.is_empty() && (max_err_cnt == 0 || err_cnt > max_err_cnt);
        if !done || over_budget {
            if over_budget && max_err_cnt > 0 {
                info!(
                    "Maximum allowed errors for resumed run ({}) of {} is exceeded (err_cnt: {}).",
                    run_id, max_err_cnt, err_cnt
                );
            }
            by_table.insert(job.table_id, job);
        }
    }

    Ok(graph_from_jobs(by_table))
}

fn graph_from_jobs(by_table: HashMap<i64, Job>) -> Graph<Job> {
    let mut graph = Graph::new();
    for job in by_table.values() {
        let mut related = 0;
        for pid in &job.parents {
            if let Some(parent) = by_table.get(pid) {
                graph.relate(Some(parent), job);
                related += 1;
            }
        }
        if related == 0 {
            // If there were parents, they are all done.
            graph.relate(None, job);
        }
    }
    graph
}

/// One advance of the run: rebuild the graph of unfinished jobs,
/// compute the ready set, submit what can be submitted. Idempotent
/// against an unchanged catalog - submitted jobs carry a warehouse id
/// and are skipped.
pub async fn process_cycle(model: &Arc<Model>, run: &mut Run, max_err_cnt: i64) -> Result<()> {
    let graph = load_unfinished_job_graph(model, run.id, max_err_cnt).await?;

    if graph.is_empty() {
        // Nothing left: the run is complete.
        run.end_time = Some(Utc::now());
        model.catalog.update_run(run).await?;
        return Ok(());
    }

    let ready = graph.ready_items().map_err(|err| anyhow!("{}", err))?;

    for job in ready {
        let error = job.error_text()?;
        if !error.is_empty() {
            bail!("Error in table {}: {}", job.table_id, error);
        }

        if !job.warehouse_job_id.is_empty() {
            continue; // submitted, a monitor is on it
        }

        match job.kind {
            JobKind::Load => {
                match model.get_import_status(job.table_id) {
                    Some(ImportStatus::Error) => {
                        bail!(
                            "Errors encountered during import of table {}.",
                            job.table_id
                        );
                    }
                    None => {
                        let mut table = model
                            .catalog
                            .select_table(job.table_id)
                            .await?
                            .ok_or_else(|| anyhow!("No table {}", job.table_id))?;

                        if table.is_import() {
                            info!("Running {:?} (import)", table.name);
                            set_table_running(model, &mut table, true).await?;
                            // The job already exists, so the user id is
                            // irrelevant here.
                            model.queue_import(&table, None, Some(job.clone())).await?;
                        } else if table.is_external() && !model.has_external_wait(table.id) {
                            info!("Running {:?} (external wait start)", table.name);
                            model.start_external_wait(&table, Some(job.clone())).await?;
                        }
                    }
                    Some(_) => {} // queued, running or done: in progress
                }
            }
            JobKind::Query | JobKind::Extract => {
                info!("Running table {} (summary)", job.table_id);

                let mut table = model
                    .catalog
                    .select_table(job.table_id)
                    .await?
                    .ok_or_else(|| anyhow!("No table {}", job.table_id))?;

                // A stale error would block post-completion stamping.
                table.error = String::new();
                set_table_running(model, &mut table, true).await?;

                let mut job = job.clone();
                if let Err(err) = submit_job(model, &mut job).await {
                    // Nothing was submitted, so the table is not running.
                    table.running = false;
                    set_table_error(model, &mut table, &err.to_string()).await?;
                    return Err(err);
                }
                spawn_monitor(model.clone(), job);
            }
        }
    }

    Ok(())
}

/// Startup recovery: pick the cycle loop back up for every run that
/// never finished.
pub(crate) async fn monitor_unfinished_runs(model: Arc<Model>) {
    info!("Checking for unfinished runs...");

    let runs = match model.catalog.unfinished_runs().await {
        Ok(runs) => runs,
        Err(err) => {
            error!("monitor_unfinished_runs(): error {}", err);
            return;
        }
    };

    if runs.is_empty() {
        info!("No unfinished runs.");
        return;
    }

    for run in runs {
        info!(
            "Started monitor for run id {} (freq_id: {})",
            run.id, run.freq_id
        );
        tokio::spawn(monitor_run(model.clone(), run, false));
    }
}
