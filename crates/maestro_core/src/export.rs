//! Export a warehouse table to an external database.
//!
//! The data path is store-to-database: the latest extract's gzip CSV
//! shards are streamed out of object storage, decompressed and parsed
//! on a blocking thread, and COPYed into the target database in one
//! transaction. The warehouse paging API never gets involved - extracts
//! are much faster.

use std::io::Read;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, info};

use maestro_catalog::model::{Job, JobKind, Table};
use maestro_catalog::model::DbDriver;
use maestro_dbsync::{connect_postgres, copy_table, SyncError};
use maestro_warehouse::parse_store_uri;

use crate::model::{set_table_error, set_table_running, Model};

/// Largest table an export will accept.
const EXPORT_MAX_ROWS: u64 = 100 * 1000 * 1000;
const EXPORT_MAX_BYTES: i64 = 1000 * 1000 * 1000;

/// Row channel depth between the decoder thread and the COPY task.
const ROW_CHANNEL_DEPTH: usize = 1024;

/// Start an export of the table's last extract into its export
/// database. Validates the size caps, marks the table running, and
/// does the transfer on a detached task - if the process dies mid-way
/// the transaction rolls back and the next export starts over.
pub(crate) async fn export_table(model: &Arc<Model>, table: &mut Table) -> Result<()> {
    let info = model
        .warehouse
        .get_table(&table.dataset, &table.name)
        .await
        .map_err(|err| anyhow!("{}", err))?;

    if info.num_rows > EXPORT_MAX_ROWS {
        bail!(
            "Maximum allowed rows for db export is {}, this table has {}.",
            EXPORT_MAX_ROWS,
            info.num_rows
        );
    }
    if info.num_bytes > EXPORT_MAX_BYTES {
        bail!(
            "Maximum allowed size for db export is {}, this table is {}.",
            EXPORT_MAX_BYTES,
            info.num_bytes
        );
    }

    // The last extract job holds the store URLs.
    let last_extract = last_extract_job(model, table.id).await?;
    let job = match last_extract {
        Some(job) if job.destination_urls.is_some() => job,
        _ => bail!("No extracts found for this table."),
    };

    let db_id = table
        .export_db_id
        .ok_or_else(|| anyhow!("No export database configured."))?;
    let db = model
        .catalog
        .select_db_conf(db_id)
        .await?
        .ok_or_else(|| anyhow!("No export database {}", db_id))?;
    if !db.export {
        bail!("Not an export db");
    }
    if db.driver != DbDriver::Postgres {
        bail!("Unsupported driver: {}", db.driver);
    }

    set_table_running(model, table, true).await?;

    let model = model.clone();
    let table = table.clone();
    let schema = info.schema;
    tokio::spawn(run_export_task(model, table, job, db.connect_str.clone(), schema));

    Ok(())
}

/// Body of the detached export task: run the transfer and record the
/// outcome on the table.
async fn run_export_task(
    model: Arc<Model>,
    mut table: Table,
    job: Job,
    connect_str: String,
    schema: maestro_warehouse::TableSchema,
) {
    let target = if table.export_table_name.is_empty() {
        table.name.clone()
    } else {
        table.export_table_name.clone()
    };
    match run_export(model.clone(), job, connect_str, schema, target).await {
        Ok(rows) => {
            info!(
                "Export to db for table id {} ({}.{}) finished, {} rows.",
                table.id, table.dataset, table.name, rows
            );
            if let Err(err) = set_table_running(&model, &mut table, false).await {
                error!("export_table: {}", err);
            }
        }
        Err(err) => {
            error!("export_table error in run_export(): {}", err);
            model
                .alert(format!(
                    "Export to db error in <{{URL_PREFIX}}/#/table/{}|{}>: {}",
                    table.id, table.name, err
                ))
                .await;
            table.running = false;
            let _ = set_table_error(&model, &mut table, &err.to_string()).await;
        }
    }
}

async fn last_extract_job(model: &Arc<Model>, table_id: i64) -> Result<Option<Job>> {
    let jobs = model.catalog.jobs_by_table(table_id, 0, 10).await?;
    Ok(jobs.into_iter().find(|j| j.kind == JobKind::Extract))
}

async fn run_export(
    model: &Arc<Model>,
    job: &Job,
    connect_str: &str,
    schema: &maestro_warehouse::TableSchema,
    target: &str,
) -> Result<u64> {
    let urls = job.destination_url_list()?;

    let (row_tx, row_rx) = mpsc::channel::<std::result::Result<Vec<String>, SyncError>>(
        ROW_CHANNEL_DEPTH,
    );

    // Feed the shards in order: each is pulled from the store, then
    // decompressed and CSV-parsed on a blocking thread.
    {
        let model = model.clone();
        tokio::spawn(async move {
            for (file_no, url) in urls.iter().enumerate() {
                if let Err(err) = feed_file(&model, url, file_no, &row_tx).await {
                    let _ = row_tx.send(Err(err)).await;
                    return;
                }
            }
        });
    }

    let conn = connect_postgres(connect_str).await?;
    let sent = copy_table(conn, schema, target, Box::pin(RowStream(row_rx))).await?;
    Ok(sent)
}

/// Pull one gzip CSV shard from the store and emit its records,
/// skipping the per-file header row.
async fn feed_file(
    model: &Arc<Model>,
    url: &str,
    file_no: usize,
    row_tx: &mpsc::Sender<std::result::Result<Vec<String>, SyncError>>,
) -> std::result::Result<(), SyncError> {
    let (_, name) =
        parse_store_uri(url).map_err(|err| SyncError::InvalidState(err.to_string()))?;
    let mut stream = model
        .store
        .reader(&name)
        .await
        .map_err(|err| SyncError::InvalidState(err.to_string()))?;

    // Bridge the async byte stream to the blocking decoder.
    let (byte_tx, byte_rx) = mpsc::channel::<Bytes>(16);
    let row_tx_blocking = row_tx.clone();
    let decoder = tokio::task::spawn_blocking(move || {
        let reader = flate2::read::GzDecoder::new(ChannelRead {
            rx: byte_rx,
            buf: Vec::new(),
            pos: 0,
        });
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        for (line_no, record) in csv.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    return Err(SyncError::InvalidState(format!(
                        "csv read, file {} line {}: {}",
                        file_no,
                        line_no + 1,
                        err
                    )));
                }
            };
            if line_no == 0 {
                continue; // every extract shard carries a header row
            }
            let row: Vec<String> = record.iter().map(|f| f.to_string()).collect();
            if row_tx_blocking.blocking_send(Ok(row)).is_err() {
                return Ok(()); // copy side gave up
            }
        }
        Ok(())
    });

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| SyncError::InvalidState(err.to_string()))?;
        if byte_tx.send(chunk).await.is_err() {
            break; // decoder finished or failed early
        }
    }
    drop(byte_tx);

    decoder
        .await
        .map_err(|err| SyncError::InvalidState(err.to_string()))?
}

/// Blocking `Read` over the byte channel.
struct ChannelRead {
    rx: mpsc::Receiver<Bytes>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for ChannelRead {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.buf = chunk.to_vec();
                    self.pos = 0;
                }
                None => return Ok(0), // EOF
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Adapts the row channel into the stream `copy_table` consumes.
struct RowStream(mpsc::Receiver<std::result::Result<Vec<String>, SyncError>>);

impl futures::Stream for RowStream {
    type Item = std::result::Result<Vec<String>, SyncError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}
