//! The import worker pool and the two-phase import itself.
//!
//! Phase A streams rows from the external database into object
//! storage; phase B loads the uploaded file into the warehouse. The
//! phases meet at the process-local import-status map: a load may only
//! follow a successful extract.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use maestro_catalog::model::{Job, Table};
use maestro_dbsync::{ExternalPool, TableReader};
use maestro_sql::{tables_in_query, PrimitiveSelect};
use maestro_warehouse::{TableSchema, TEMPORARY_ERROR_MARKER};

use crate::model::{set_table_error, set_table_running, Model};
use crate::monitor::{spawn_monitor, submit_job};

/// Emit an import progress report every this many rows.
const REPORT_EVERY_ROWS: i64 = 1_000_000;

/// Delay before the single retry of an upload that hit the temporary
/// store error.
const UPLOAD_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// Phases of a two-phase import. Absence from the map means no import
/// is in flight (or the last one was fully processed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    Queued,
    Running,
    /// Phase A (extract to object storage) finished; the load may
    /// proceed.
    Done,
    Error,
}

/// One queued import. The job, when present, is a run's pre-inserted
/// load job; interactive imports mint their own in phase B. The
/// transfer stats are filled in by phase A for phase B to persist.
#[derive(Default)]
pub(crate) struct ImportTask {
    pub(crate) table: Table,
    pub(crate) user_id: Option<i64>,
    pub(crate) job: Option<Job>,
    pub(crate) fname: String,
    pub(crate) import_span: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>,
    pub(crate) import_bytes: i64,
    pub(crate) import_rows: i64,
}

/// Worker loop: pull tasks until the queue closes. Tasks arriving
/// after cancellation are discarded - that is the drain on shutdown.
pub(crate) async fn import_worker(
    model: Arc<Model>,
    rx: Arc<Mutex<mpsc::Receiver<ImportTask>>>,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let task = match task {
            None => return, // queue closed and empty
            Some(task) => task,
        };

        if model.is_shutting_down() {
            model.delete_import_status(task.table.id);
            continue;
        }

        run_import_task(&model, task).await;
    }
}

async fn run_import_task(model: &Arc<Model>, mut task: ImportTask) {
    let schema = match run_extract_phase(model, &mut task).await {
        Ok(schema) => schema,
        Err(err) => {
            warn!("import extract phase failed: {}", err);
            return;
        }
    };
    if let Err(err) = run_load_phase(model, task, schema).await {
        warn!("import load phase failed: {}", err);
    }
}

/// Record an import failure everywhere it needs to be seen: status
/// map, table error, alert channel.
async fn mark_error(model: &Arc<Model>, table: &mut Table, note: &str, err: &anyhow::Error) {
    error!("import task error: {}", err);
    model.set_import_status(table.id, ImportStatus::Error);
    model
        .alert(format!(
            "Import error in <{{URL_PREFIX}}/#/table/{}|{}>: [{}] {}",
            table.id, table.name, note, err
        ))
        .await;
    // The import task is over; the table is no longer running.
    table.running = false;
    if let Err(save_err) = set_table_error(model, table, &err.to_string()).await {
        error!("import task error: {}", save_err);
    }
}

/// Phase A: open the external database, stream the (possibly
/// incremental) select into object storage, remember the high-water id.
async fn run_extract_phase(model: &Arc<Model>, task: &mut ImportTask) -> Result<TableSchema> {
    let table = &mut task.table;

    model.set_import_status(table.id, ImportStatus::Running);
    info!("Importing table {}", table.name);

    set_table_running(model, table, true).await?;

    let db = match table
        .import_db_id
        .ok_or_else(|| anyhow!("Not an import table."))
    {
        Ok(id) => match model.catalog.select_db_conf(id).await {
            Ok(Some(db)) => db,
            Ok(None) => {
                let err = anyhow!("No import database {}", id);
                mark_error(model, table, "select_db_conf", &err).await;
                return Err(err);
            }
            Err(err) => {
                let err = anyhow!("{}", err);
                mark_error(model, table, "select_db_conf", &err).await;
                return Err(err);
            }
        },
        Err(err) => {
            mark_error(model, table, "import_db_id", &err).await;
            return Err(err);
        }
    };

    let pool = match ExternalPool::connect(db.driver.as_str(), &db.connect_str).await {
        Ok(pool) => pool,
        Err(err) => {
            let err = anyhow!("{}", err);
            mark_error(model, table, "connect", &err).await;
            return Err(err);
        }
    };

    let stmt = match import_statement(table) {
        Ok(stmt) => stmt,
        Err(err) => {
            mark_error(model, table, "import_statement", &err).await;
            return Err(err);
        }
    };

    let now = Utc::now();
    if table.reimport_cond_satisfied(now) {
        info!(
            "Reimporting {} because the reimport condition is satisfied.",
            table.name
        );
        table.last_id = String::new(); // forces a full read
    }

    let import_begin = now;

    info!("Getting warehouse schema...");
    let schema = match TableReader::warehouse_schema(&pool, &stmt).await {
        Ok(schema) => schema,
        Err(err) => {
            let err = anyhow!("{}", err);
            mark_error(model, table, "warehouse_schema", &err).await;
            return Err(err);
        }
    };
    info!("Getting warehouse schema DONE.");

    let progress_name = table.name.clone();
    let progress = move |rows: i64, bytes: i64| {
        let dur = (Utc::now() - import_begin).num_seconds().max(1);
        info!(
            "Importing {}: {} rows ({}/s) {} bytes ({}/s)",
            progress_name,
            rows,
            rows / dur,
            bytes,
            bytes / dur
        );
    };

    let start_reader = |last_id: &str| {
        TableReader::start(
            &pool,
            &stmt,
            &table.id_column,
            last_id,
            Some(Box::new(progress.clone())),
            REPORT_EVERY_ROWS,
        )
    };

    let mut reader = match start_reader(&table.last_id) {
        Ok(reader) => reader,
        Err(err) => {
            let err = anyhow!("{}", err);
            mark_error(model, table, "table_reader", &err).await;
            return Err(err);
        }
    };
    info!("Table reader with: {}", reader.statement());

    // This blocks for as long as the transfer takes.
    let stream = reader.take_stream();
    let uploaded = match model.store.insert(&task.fname, stream).await {
        Ok(obj) => Ok((obj, reader.stats())),
        Err(err) if err.to_string().contains(TEMPORARY_ERROR_MARKER) => {
            info!(
                "import: {:?} (table {}), retrying in {:?}",
                TEMPORARY_ERROR_MARKER, table.id, UPLOAD_RETRY_DELAY
            );
            tokio::time::sleep(UPLOAD_RETRY_DELAY).await;
            // The first stream is spent; start the read over.
            match start_reader(&table.last_id) {
                Ok(mut retry_reader) => {
                    let stream = retry_reader.take_stream();
                    model
                        .store
                        .insert(&task.fname, stream)
                        .await
                        .map(|obj| (obj, retry_reader.stats()))
                        .map_err(|err| anyhow!("{}", err))
                }
                Err(err) => Err(anyhow!("{}", err)),
            }
        }
        Err(err) => Err(anyhow!("{}", err)),
    };

    let (object, stats) = match uploaded {
        Ok(pair) => pair,
        Err(err) => {
            mark_error(model, table, "store.insert", &err).await;
            return Err(err);
        }
    };

    pool.close().await;

    info!(
        "Extract of {} ({}) to object storage complete: {}",
        table.name, table.id, object.self_link
    );

    if stats.oversized > 0 {
        warn!(
            "Import of {}: {} oversized rows were dropped.",
            table.name, stats.oversized
        );
    }

    // Remember the high-water mark for the next incremental read.
    table.last_id = stats.last_id.clone();
    model.catalog.save_table(table).await?;

    model.set_import_status(table.id, ImportStatus::Done);

    task.import_span = Some((import_begin, Utc::now()));
    task.import_bytes = stats.bytes;
    task.import_rows = stats.rows;

    Ok(schema)
}

/// Phase B: attach the inferred schema and the uploaded file to the
/// load job and submit it.
async fn run_load_phase(model: &Arc<Model>, task: ImportTask, schema: TableSchema) -> Result<()> {
    let ImportTask {
        mut table,
        user_id,
        job,
        fname,
        import_span,
        import_bytes,
        import_rows,
    } = task;

    if model.get_import_status(table.id) != Some(ImportStatus::Done) {
        let err = anyhow!("Load started without prior successful import.");
        mark_error(model, &mut table, "import_status", &err).await;
        return Err(err);
    }

    if import_rows == 0 {
        warn!("No (new) data for table {}.", table.name);
    }

    info!(
        "Starting warehouse load for table {} ({}).",
        table.name, table.id
    );

    let url = model.store.url_for_name(&fname);
    let mut job = match job {
        None => {
            // Interactive import: no pre-inserted job.
            let dataset = model.import_dataset(&table).await?;
            let mut job =
                model.new_load_job(&table, user_id, None, Some(vec![url.clone()]), &dataset)?;
            apply_import_stats(&mut job, import_span, import_bytes, import_rows);
            match model.catalog.insert_job(&job).await {
                Ok(job) => job,
                Err(err) => {
                    let err = anyhow!("{}", err);
                    mark_error(model, &mut table, "insert_job", &err).await;
                    return Err(err);
                }
            }
        }
        Some(mut job) => {
            apply_import_stats(&mut job, import_span, import_bytes, import_rows);
            model.catalog.update_job(&job).await?;
            job
        }
    };

    if let Err(err) = job.set_load_schema(schema) {
        let err = anyhow!("{}", err);
        mark_error(model, &mut table, "set_load_schema", &err).await;
        return Err(err);
    }

    if let Err(err) = submit_job(model, &mut job).await {
        mark_error(model, &mut table, "submit_job", &err).await;
        return Err(err);
    }

    info!(
        "import: started monitor for load job {:?}.",
        job.warehouse_job_id
    );
    spawn_monitor(model.clone(), job);
    Ok(())
}

fn apply_import_stats(
    job: &mut Job,
    span: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>,
    bytes: i64,
    rows: i64,
) {
    if let Some((begin, end)) = span {
        job.import_begin = Some(begin);
        job.import_end = Some(end);
    }
    job.import_bytes = bytes;
    job.import_rows = rows;
}

/// The primitive select for the import: the stored JSON form, or
/// `SELECT * FROM <table>` when the query is empty. Exactly one source
/// table is allowed.
fn import_statement(table: &Table) -> Result<PrimitiveSelect> {
    if table.query.is_empty() {
        return Ok(PrimitiveSelect::star(&table.name));
    }

    let stmt: PrimitiveSelect = serde_json::from_str(&table.query)?;
    let tables = tables_in_query(&stmt.to_string());
    if tables.len() > 1 {
        bail!(
            "Import tables must select from only one table, we have {}: {:?}",
            tables.len(),
            tables
        );
    }
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_selects_star() {
        let table = Table {
            name: "accounts".to_string(),
            import_db_id: Some(1),
            ..Default::default()
        };
        let stmt = import_statement(&table).unwrap();
        assert_eq!(stmt.from, "accounts");
        assert_eq!(stmt.select, "*");
    }

    #[test]
    fn multi_table_imports_are_rejected() {
        let table = Table {
            query: r#"{"Select": "*", "From": "a JOIN b"}"#.to_string(),
            import_db_id: Some(1),
            ..Default::default()
        };
        assert!(import_statement(&table).is_err());
    }
}
