//! The Model aggregates everything the core works against and owns the
//! process-local in-flight state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use maestro_catalog::model::{Job, JobKind, Table, WriteDisposition};
use maestro_catalog::Catalog;
use maestro_warehouse::{
    parse_table_spec, JobConfiguration, ObjectStore, Warehouse, WarehouseSettings,
};

use crate::alert::AlertSink;
use crate::imports::{self, ImportStatus, ImportTask};
use crate::monitor::{self, submit_job};
use crate::run;
use crate::sheets::SheetSink;
use crate::ticker;

/// Default size of the import worker pool.
const IMPORT_WORKERS: usize = 6;
/// Default bound of the import queue. Producers block when it fills.
const IMPORT_QUEUE_DEPTH: usize = 1024;

const DEFAULT_DATASET: &str = "maestro";

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// OAuth users must belong to this domain. Blank denies everyone.
    pub allowed_domain: String,
    pub import_workers: usize,
    pub import_queue_depth: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            allowed_domain: String::new(),
            import_workers: IMPORT_WORKERS,
            import_queue_depth: IMPORT_QUEUE_DEPTH,
        }
    }
}

/// A registered wait for an external upload.
pub(crate) struct ExternalWait {
    pub(crate) cancel: oneshot::Sender<()>,
    pub(crate) job: Option<Job>,
}

/// Process-local in-flight state. Both maps live under one mutex;
/// holders must not perform I/O while holding it.
#[derive(Default)]
pub(crate) struct ProcessState {
    pub(crate) imports: HashMap<i64, ImportStatus>,
    pub(crate) external_waits: HashMap<i64, ExternalWait>,
}

/// Everything Maestro does is done via the Model: it holds the catalog,
/// the external capabilities, and the in-process machinery (import
/// queue, external waits, the shutdown flag).
pub struct Model {
    pub catalog: Arc<dyn Catalog>,
    pub warehouse: Arc<dyn Warehouse>,
    pub store: Arc<dyn ObjectStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub sheets: Arc<dyn SheetSink>,

    config: ModelConfig,
    /// Flipped once by [`Model::stop`]; import workers discard queued
    /// tasks instead of starting them once this is set.
    shutting_down: AtomicBool,
    pub(crate) state: Mutex<ProcessState>,

    import_tx: Mutex<Option<mpsc::Sender<ImportTask>>>,
    import_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ImportTask>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Model {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn ObjectStore>,
        alerts: Arc<dyn AlertSink>,
        sheets: Arc<dyn SheetSink>,
        config: ModelConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.import_queue_depth.max(1));
        Arc::new(Self {
            catalog,
            warehouse,
            store,
            alerts,
            sheets,
            config,
            shutting_down: AtomicBool::new(false),
            state: Mutex::new(ProcessState::default()),
            import_tx: Mutex::new(Some(tx)),
            import_rx: Arc::new(tokio::sync::Mutex::new(rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Boot the background machinery: startup recovery for unfinished
    /// jobs and runs, the frequency tickers, and the import worker
    /// pool. Recovery is idempotent - submitted jobs are found by their
    /// warehouse-side id and re-polled, unsubmitted jobs are re-driven
    /// by their run's cycle loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_default_dataset().await?;

        monitor::monitor_unfinished_jobs(self.clone()).await;
        run::monitor_unfinished_runs(self.clone()).await;
        ticker::trigger_runs(self.clone()).await?;

        for _ in 0..self.config.import_workers.max(1) {
            let handle = tokio::spawn(imports::import_worker(
                self.clone(),
                self.import_rx.clone(),
            ));
            self.tasks.lock().unwrap().push(handle);
        }
        Ok(())
    }

    /// Graceful shutdown: close the import queue first, then let the
    /// workers drain it (queued tasks are discarded once the shutdown
    /// flag is set), then wait for the pool to exit. Submitted
    /// warehouse jobs are not cancelled server-side; they are
    /// re-observed on next start. External-database transactions roll
    /// back, which is fine - the next run picks up from `last_id`.
    pub async fn stop(&self) {
        info!("Closing the import queue...");
        drop(self.import_tx.lock().unwrap().take());

        info!("Stopping any pending imports...");
        self.shutting_down.store(true, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Imports stopped");
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Configuration builders bound to this deployment's project and
    /// bucket.
    pub fn warehouse_settings(&self) -> WarehouseSettings {
        WarehouseSettings::new(self.warehouse.project_id(), self.store.bucket())
    }

    async fn ensure_default_dataset(&self) -> Result<()> {
        let existing = self.catalog.select_datasets().await?;
        if existing.is_empty() {
            self.catalog.insert_dataset(DEFAULT_DATASET).await?;
        }
        Ok(())
    }

    /// Generate an alert (fire and forget).
    pub async fn alert(&self, msg: String) {
        self.alerts.alert(&msg).await;
    }

    // -- users ----------------------------------------------------------

    /// Resolve an OAuth identity to a user id, or zero when access is
    /// denied. Unknown users are created disabled (and alerted about);
    /// the very first user ever created becomes an enabled admin.
    pub async fn valid_user(&self, oauth_id: &str, email: &str) -> i64 {
        if self.config.allowed_domain.is_empty() {
            warn!("allowed domain is blank, all OAuth authentication will fail");
            return 0;
        }

        let email = email.to_lowercase();
        if !email.is_empty() && !email.ends_with(&self.config.allowed_domain) {
            self.alert(format!(
                "WARNING: Maestro access denied (invalid domain) for: {}",
                email
            ))
            .await;
            return 0;
        }

        let (mut user, created) = match self
            .catalog
            .select_or_insert_user_by_oauth_id(oauth_id, &email)
            .await
        {
            Ok(pair) => pair,
            Err(err) => {
                warn!("valid_user: {}", err);
                return 0;
            }
        };

        if created {
            if user.id == 1 {
                user.admin = true;
                user.disabled = false;
                if let Err(err) = self.catalog.save_user(&user).await {
                    warn!("valid_user: {}", err);
                    return 0;
                }
            } else {
                self.alert(format!(
                    "New (disabled) Maestro user created: ({}) {}",
                    user.id, user.email
                ))
                .await;
            }
        }

        if user.disabled {
            info!("valid_user: disabled user access denied id: {}", user.id);
            return 0;
        }

        // Check the stored email too: it is the one that counts.
        if user.email.ends_with(&self.config.allowed_domain) {
            user.id
        } else {
            0
        }
    }

    // -- import status --------------------------------------------------

    pub fn get_import_status(&self, table_id: i64) -> Option<ImportStatus> {
        self.state.lock().unwrap().imports.get(&table_id).copied()
    }

    pub(crate) fn set_import_status(&self, table_id: i64, status: ImportStatus) {
        self.state.lock().unwrap().imports.insert(table_id, status);
    }

    pub fn delete_import_status(&self, table_id: i64) {
        self.state.lock().unwrap().imports.remove(&table_id);
    }

    /// Queue a two-phase import for the table. Blocks when the queue is
    /// full; fails when another import for the table is already in
    /// flight or the queue has been closed for shutdown.
    pub async fn queue_import(
        &self,
        table: &Table,
        user_id: Option<i64>,
        job: Option<Job>,
    ) -> Result<()> {
        if self.get_import_status(table.id).is_some() {
            bail!("Already queued, running or done");
        }

        let fname = match &job {
            None => table.import_file_name(None, Utc::now()),
            Some(job) => job.import_file_name()?,
        };

        let tx = self
            .import_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("Import queue is closed."))?;
        tx.send(ImportTask {
            table: table.clone(),
            user_id,
            job,
            fname,
            ..Default::default()
        })
        .await
        .map_err(|_| anyhow!("Import queue is closed."))?;

        self.set_import_status(table.id, ImportStatus::Queued);
        Ok(())
    }

    // -- job construction ----------------------------------------------

    pub fn new_query_job(
        &self,
        table: &Table,
        user_id: Option<i64>,
        run_id: Option<i64>,
        parent_ids: &[i64],
    ) -> Result<Job> {
        let mut job = Job::new(table.id, user_id, run_id, JobKind::Query);
        let conf = self.warehouse_settings().new_query_configuration(
            &table.query,
            &table.dataset,
            &table.name,
            table.disposition.as_str(),
            table.legacy_sql,
            table.partitioned,
        );
        job.set_configuration(&conf)?;
        job.parents = parent_ids.to_vec();
        Ok(job)
    }

    pub fn new_load_job(
        &self,
        table: &Table,
        user_id: Option<i64>,
        run_id: Option<i64>,
        source_urls: Option<Vec<String>>,
        dataset: &str,
    ) -> Result<Job> {
        let mut job = Job::new(table.id, user_id, run_id, JobKind::Load);
        // A satisfied reimport window forces a truncating load.
        let disposition = if table.reimport_cond_satisfied(Utc::now()) {
            WriteDisposition::Replace
        } else {
            table.disposition
        };
        let format = if table.is_external() {
            table.external_format.as_str()
        } else {
            "CSV"
        };
        let conf = self.warehouse_settings().new_load_configuration(
            &table.name,
            dataset,
            disposition.as_str(),
            source_urls,
            format,
        );
        job.set_configuration(&conf)?;
        Ok(job)
    }

    pub fn new_extract_job(
        &self,
        table: &Table,
        user_id: Option<i64>,
        run_id: Option<i64>,
    ) -> Result<Job> {
        let mut job = Job::new(table.id, user_id, run_id, JobKind::Extract);
        let conf = self
            .warehouse_settings()
            .new_extract_configuration(&table.dataset, &table.name);
        job.set_configuration(&conf)?;
        Ok(job)
    }

    // -- interactive table runs -----------------------------------------

    /// Syntax-check a summary table without creating a warehouse job.
    pub async fn dry_run_table(&self, table: &Table, user_id: Option<i64>) -> Result<()> {
        if table.is_import() {
            bail!("Cannot dryrun import tables.");
        }
        if table.running {
            bail!("Table already running.");
        }
        let job = self.new_query_job(table, user_id, None, &[])?;
        let mut conf: JobConfiguration = job.parsed_configuration()?;
        conf.dry_run = true;
        self.warehouse
            .start_job(&conf)
            .await
            .map_err(|err| anyhow!("{}", err))?;
        Ok(())
    }

    /// Run a single table outside a run. Returns the warehouse job id
    /// for summary tables (imports and externals run asynchronously).
    pub async fn run_table(
        self: &Arc<Self>,
        table: &mut Table,
        user_id: Option<i64>,
    ) -> Result<String> {
        if table.is_import() {
            self.queue_import(table, user_id, None).await?;
            Ok(String::new())
        } else if table.is_external() {
            self.start_external_wait(table, None).await?;
            Ok(String::new())
        } else {
            self.run_query_table(table, user_id).await
        }
    }

    async fn run_query_table(
        self: &Arc<Self>,
        table: &mut Table,
        user_id: Option<i64>,
    ) -> Result<String> {
        if table.running {
            bail!("Table already running.");
        }

        let job = self.new_query_job(table, user_id, None, &[])?;
        let mut job = self.catalog.insert_job(&job).await?;

        if let Err(err) = submit_job(self, &mut job).await {
            set_table_error(self, table, &err.to_string()).await?;
            return Err(err);
        }
        set_table_running(self, table, true).await?;

        let id = job.warehouse_job_id.clone();
        monitor::spawn_monitor(self.clone(), job);
        info!(
            "run_query_table: started monitor for job {:?} (table {})",
            id, table.id
        );
        Ok(id)
    }

    /// Force a full reimport: truncate on next load and forget the
    /// incremental cursor.
    pub async fn reimport_table(
        &self,
        table: &mut Table,
        user_id: Option<i64>,
        run_id: Option<i64>,
    ) -> Result<()> {
        if !table.is_import() {
            bail!("Not an import table");
        }

        table.disposition = WriteDisposition::Replace;
        table.last_id = String::new();
        self.catalog.save_table(table).await?;

        let dataset = self.import_dataset(table).await?;
        let now = Utc::now();
        let name = table.import_file_name(Some(run_id.unwrap_or(0)), now);
        let url = self.store.url_for_name(&name);

        let job = self.new_load_job(table, user_id, run_id, Some(vec![url]), &dataset)?;
        let job = self.catalog.insert_job(&job).await?;

        self.queue_import(table, user_id, Some(job)).await
    }

    /// Submit an extract of the table to object storage and monitor it.
    pub async fn extract_table_to_store(
        self: &Arc<Self>,
        table: &mut Table,
        user_id: Option<i64>,
        run_id: Option<i64>,
    ) -> Result<String> {
        if table.running {
            bail!("Table already running.");
        }

        let job = self.new_extract_job(table, user_id, run_id)?;
        let mut job = self.catalog.insert_job(&job).await?;

        submit_job(self, &mut job).await?;
        set_table_running(self, table, true).await?;

        let id = job.warehouse_job_id.clone();
        monitor::spawn_monitor(self.clone(), job);
        info!(
            "extract_table_to_store: started monitor for extract job {:?} (table {})",
            id, table.id
        );
        Ok(id)
    }

    /// A signed PUT URL an outside process can upload an external
    /// table's file to (no authentication required, content type
    /// application/octet-stream).
    pub async fn signed_upload_url(&self, table: &Table) -> Result<String> {
        let filename = table.external_file_name(Utc::now());
        self.warehouse
            .signed_storage_url(&filename, "PUT")
            .await
            .map_err(|err| anyhow!("{}", err))
    }

    // -- parent resolution ----------------------------------------------

    /// The dataset an import table's rows land in: the import
    /// database's dataset, not the table's own.
    pub async fn import_dataset(&self, table: &Table) -> Result<String> {
        let id = table
            .import_db_id
            .ok_or_else(|| anyhow!("Not an import table."))?;
        let db = self
            .catalog
            .select_db_conf(id)
            .await?
            .ok_or_else(|| anyhow!("No import database {}", id))?;
        Ok(db.dataset)
    }

    /// Live tables keyed by `dataset.name`; imports are keyed under
    /// their import database's dataset.
    pub async fn tables_as_map(&self) -> Result<HashMap<String, Table>> {
        let all = self.catalog.tables().await?;
        let dbs = self.catalog.select_dbs().await?;
        let db_datasets: HashMap<i64, String> =
            dbs.into_iter().map(|db| (db.id, db.dataset)).collect();

        let mut result = HashMap::new();
        for table in all {
            let key = match table.import_db_id.and_then(|id| db_datasets.get(&id)) {
                Some(dataset) => format!("{}.{}", dataset, table.name),
                None => format!("{}.{}", table.dataset, table.name),
            };
            result.insert(key, table);
        }
        Ok(result)
    }

    /// Parents for every table in `children`, keyed by the child's
    /// name: the extractor's candidates intersected with the catalog,
    /// foreign projects and self-references dropped.
    pub async fn tables_parents(
        &self,
        children: &[Table],
    ) -> Result<HashMap<String, Vec<Table>>> {
        let all = self.tables_as_map().await?;
        let mut result = HashMap::new();
        for child in children {
            result.insert(child.name.clone(), self.single_table_parents(child, &all));
        }
        Ok(result)
    }

    fn single_table_parents(
        &self,
        child: &Table,
        all: &HashMap<String, Table>,
    ) -> Vec<Table> {
        let mut set: HashMap<String, Table> = HashMap::new();
        for full_name in child.parent_names() {
            let (project, dataset, name) = parse_table_spec(&full_name);

            if !project.is_empty() && project != self.warehouse.project_id() {
                continue;
            }
            if child.dataset == dataset && child.name == name {
                continue; // self-reference
            }

            let key = format!("{}.{}", dataset, name);
            if let Some(table) = all.get(&key) {
                set.insert(key, table.clone());
            }
        }
        set.into_values().collect()
    }
}

/// Persist the running flag.
pub(crate) async fn set_table_running(model: &Model, table: &mut Table, running: bool) -> Result<()> {
    table.running = running;
    model
        .catalog
        .save_table(table)
        .await
        .context("save_table")?;
    Ok(())
}

/// Record an error on the table. Empty errors are ignored. The running
/// flag is left alone: a job that failed terminally keeps its table
/// marked running until whoever owns the flow decides otherwise.
pub(crate) async fn set_table_error(model: &Model, table: &mut Table, error: &str) -> Result<()> {
    if error.is_empty() {
        return Ok(());
    }
    table.error = error.to_string();
    model
        .catalog
        .save_table(table)
        .await
        .context("save_table")?;
    Ok(())
}

