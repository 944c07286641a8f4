//! An in-memory catalog with the same semantics as the PostgreSQL one,
//! including the one-unfinished-run-per-frequency constraint.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use maestro_catalog::model::{
    Dataset, ExternalDb, Freq, GitConf, Job, Notification, OAuthConf, Run, SlackConf, Table, User,
    WarehouseConf,
};
use maestro_catalog::{Catalog, CatalogError, Result};

#[derive(Default)]
struct MemState {
    users: Vec<User>,
    datasets: Vec<Dataset>,
    tables: Vec<Table>,
    jobs: Vec<Job>,
    runs: Vec<Run>,
    freqs: Vec<Freq>,
    dbs: Vec<ExternalDb>,
    notifications: Vec<Notification>,
    warehouse_conf: Option<WarehouseConf>,
    oauth_conf: Option<OAuthConf>,
    git_conf: Option<GitConf>,
    slack_conf: Option<SlackConf>,
    next_id: i64,
}

impl MemState {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// All catalog state in one mutex, no persistence.
#[derive(Default)]
pub struct MemCatalog {
    state: Mutex<MemState>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications logged so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().unwrap().notifications.clone()
    }

    /// Register an external database directly (bypassing encryption).
    pub fn add_external_db(&self, db: ExternalDb) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next();
        let mut db = db;
        db.id = id;
        state.dbs.push(db);
        id
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn select_or_insert_user_by_oauth_id(
        &self,
        oauth_id: &str,
        email: &str,
    ) -> Result<(User, bool)> {
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.iter().find(|u| u.oauth_id == oauth_id) {
            return Ok((user.clone(), false));
        }
        if email.is_empty() {
            return Err(CatalogError::invalid_state(
                "email cannot be blank for user insert",
            ));
        }
        let id = (state.users.len() + 1) as i64;
        let user = User {
            id,
            oauth_id: oauth_id.to_string(),
            email: email.to_string(),
            admin: false,
            disabled: true,
            created_at: Some(Utc::now()),
        };
        state.users.push(user.clone());
        Ok((user, true))
    }

    async fn select_user(&self, id: i64) -> Result<Option<User>> {
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.id == id).cloned())
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.users.iter_mut().find(|u| u.id == user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(CatalogError::not_found(format!("user {}", user.id))),
        }
    }

    async fn select_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.state.lock().unwrap().datasets.clone())
    }

    async fn insert_dataset(&self, name: &str) -> Result<Dataset> {
        let mut state = self.state.lock().unwrap();
        let dataset = Dataset {
            id: state.next(),
            dataset: name.to_string(),
        };
        state.datasets.push(dataset.clone());
        Ok(dataset)
    }

    async fn tables(&self) -> Result<Vec<Table>> {
        let state = self.state.lock().unwrap();
        let mut live: Vec<Table> = state
            .tables
            .iter()
            .filter(|t| t.deleted_at.is_none())
            .cloned()
            .collect();
        live.sort_by_key(|t| t.id);
        Ok(live)
    }

    async fn tables_by_frequency(&self, freq_id: i64) -> Result<Vec<Table>> {
        Ok(self
            .tables()
            .await?
            .into_iter()
            .filter(|t| t.freq_id == Some(freq_id))
            .collect())
    }

    async fn select_table(&self, id: i64) -> Result<Option<Table>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tables
            .iter()
            .find(|t| t.id == id && t.deleted_at.is_none())
            .cloned())
    }

    async fn select_table_id_by_name(&self, dataset: &str, name: &str) -> Result<Option<i64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tables
            .iter()
            .find(|t| t.dataset == dataset && t.name == name && t.deleted_at.is_none())
            .map(|t| t.id))
    }

    async fn insert_table(&self, table: &Table) -> Result<Table> {
        let mut state = self.state.lock().unwrap();
        let mut table = table.clone();
        table.id = state.next();
        table.created_at = Some(Utc::now());
        state.tables.push(table.clone());
        Ok(table)
    }

    async fn save_table(&self, table: &Table) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.tables.iter_mut().find(|t| t.id == table.id) {
            Some(existing) => {
                *existing = table.clone();
                Ok(())
            }
            None => Err(CatalogError::not_found(format!("table {}", table.id))),
        }
    }

    async fn insert_job(&self, job: &Job) -> Result<Job> {
        let mut state = self.state.lock().unwrap();
        let mut job = job.clone();
        job.id = state.next();
        job.created_at = Some(Utc::now());
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(CatalogError::not_found(format!("job {}", job.id))),
        }
    }

    async fn running_jobs(&self) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|j| {
                !j.warehouse_job_id.is_empty()
                    && (j.end_time.is_none() || j.end_time < j.start_time)
            })
            .cloned()
            .collect())
    }

    async fn select_job_by_warehouse_id(&self, warehouse_job_id: &str) -> Result<Option<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .find(|j| j.warehouse_job_id == warehouse_job_id)
            .cloned())
    }

    async fn jobs_by_table(&self, table_id: i64, offset: i64, limit: i64) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .jobs
            .iter()
            .filter(|j| j.table_id == table_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.id));
        Ok(jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn jobs_by_run(&self, run_id: i64) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .jobs
            .iter()
            .filter(|j| j.run_id == Some(run_id))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn insert_run(&self, user_id: Option<i64>, freq_id: i64) -> Result<Run> {
        let mut state = self.state.lock().unwrap();
        if state
            .runs
            .iter()
            .any(|r| r.freq_id == freq_id && r.end_time.is_none())
        {
            return Err(CatalogError::UnfinishedRunExists(freq_id));
        }
        let run = Run {
            id: state.next(),
            user_id,
            created_at: Some(Utc::now()),
            freq_id,
            ..Default::default()
        };
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(CatalogError::not_found(format!("run {}", run.id))),
        }
    }

    async fn select_run(&self, id: i64) -> Result<Option<Run>> {
        let state = self.state.lock().unwrap();
        Ok(state.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn unfinished_runs(&self) -> Result<Vec<Run>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .iter()
            .filter(|r| r.end_time.is_none())
            .cloned()
            .collect())
    }

    async fn runs(&self, offset: i64, limit: i64) -> Result<Vec<Run>> {
        let state = self.state.lock().unwrap();
        let mut runs = state.runs.clone();
        runs.sort_by_key(|r| std::cmp::Reverse(r.id));
        for run in &mut runs {
            run.freq_name = state
                .freqs
                .iter()
                .find(|f| f.id == run.freq_id)
                .map(|f| f.name.clone())
                .unwrap_or_default();
            run.total_bytes = state
                .jobs
                .iter()
                .filter(|j| j.run_id == Some(run.id))
                .map(|j| j.total_bytes_billed)
                .sum();
        }
        Ok(runs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn select_freqs(&self) -> Result<Vec<Freq>> {
        let state = self.state.lock().unwrap();
        let mut freqs = state.freqs.clone();
        freqs.sort_by_key(|f| f.period);
        Ok(freqs)
    }

    async fn insert_freq(
        &self,
        name: &str,
        period_secs: i64,
        offset_secs: i64,
        active: bool,
    ) -> Result<Freq> {
        let mut state = self.state.lock().unwrap();
        let freq = Freq {
            id: state.next(),
            name: name.to_string(),
            period: chrono::Duration::seconds(period_secs),
            offset: chrono::Duration::seconds(offset_secs),
            active,
        };
        state.freqs.push(freq.clone());
        Ok(freq)
    }

    async fn update_freq(&self, freq: &Freq) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.freqs.iter_mut().find(|f| f.id == freq.id) {
            Some(existing) => {
                *existing = freq.clone();
                Ok(())
            }
            None => Err(CatalogError::not_found(format!("freq {}", freq.id))),
        }
    }

    async fn select_dbs(&self) -> Result<Vec<ExternalDb>> {
        Ok(self.state.lock().unwrap().dbs.clone())
    }

    async fn select_db_conf(&self, id: i64) -> Result<Option<ExternalDb>> {
        let state = self.state.lock().unwrap();
        Ok(state.dbs.iter().find(|db| db.id == id).cloned())
    }

    async fn insert_db_conf(
        &self,
        name: &str,
        driver: &str,
        dataset: &str,
        export: bool,
        connect_str: &str,
        _secret: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let dataset_id = match state.datasets.iter().find(|d| d.dataset == dataset) {
            Some(d) => d.id,
            None => {
                let id = state.next();
                state.datasets.push(Dataset {
                    id,
                    dataset: dataset.to_string(),
                });
                id
            }
        };
        let id = state.next();
        state.dbs.push(ExternalDb {
            id,
            name: name.to_string(),
            dataset_id,
            dataset: dataset.to_string(),
            driver: driver
                .parse()
                .map_err(CatalogError::invalid_state)?,
            connect_str: connect_str.to_string(),
            export,
        });
        Ok(())
    }

    async fn update_db_conf(
        &self,
        id: i64,
        name: &str,
        driver: &str,
        dataset: &str,
        export: bool,
        connect_str: &str,
        _secret: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let dataset_id = match state.datasets.iter().find(|d| d.dataset == dataset) {
            Some(d) => d.id,
            None => {
                let new_id = state.next();
                state.datasets.push(Dataset {
                    id: new_id,
                    dataset: dataset.to_string(),
                });
                new_id
            }
        };
        match state.dbs.iter_mut().find(|db| db.id == id) {
            Some(db) => {
                db.name = name.to_string();
                db.driver = driver
                    .parse()
                    .map_err(CatalogError::invalid_state)?;
                db.dataset = dataset.to_string();
                db.dataset_id = dataset_id;
                db.export = export;
                db.connect_str = connect_str.to_string();
                Ok(())
            }
            None => Err(CatalogError::not_found(format!("db {}", id))),
        }
    }

    async fn log_notification(&self, notification: &Notification) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut notification = notification.clone();
        notification.id = state.next();
        state.notifications.push(notification);
        Ok(())
    }

    async fn select_warehouse_conf(&self) -> Result<Option<WarehouseConf>> {
        Ok(self.state.lock().unwrap().warehouse_conf.clone())
    }

    async fn set_warehouse_conf(&self, conf: &WarehouseConf) -> Result<()> {
        self.state.lock().unwrap().warehouse_conf = Some(conf.clone());
        Ok(())
    }

    async fn select_oauth_conf(&self) -> Result<Option<OAuthConf>> {
        Ok(self.state.lock().unwrap().oauth_conf.clone())
    }

    async fn set_oauth_conf(&self, conf: &OAuthConf) -> Result<()> {
        self.state.lock().unwrap().oauth_conf = Some(conf.clone());
        Ok(())
    }

    async fn select_git_conf(&self) -> Result<Option<GitConf>> {
        Ok(self.state.lock().unwrap().git_conf.clone())
    }

    async fn set_git_conf(&self, conf: &GitConf) -> Result<()> {
        self.state.lock().unwrap().git_conf = Some(conf.clone());
        Ok(())
    }

    async fn select_slack_conf(&self) -> Result<Option<SlackConf>> {
        Ok(self.state.lock().unwrap().slack_conf.clone())
    }

    async fn set_slack_conf(&self, conf: &SlackConf) -> Result<()> {
        self.state.lock().unwrap().slack_conf = Some(conf.clone());
        Ok(())
    }
}
