//! The abstract persistence interface the core consumes.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Dataset, ExternalDb, Freq, GitConf, Job, Notification, OAuthConf, Run, SlackConf, Table, User,
    WarehouseConf,
};

/// Every database operation the core needs, in one trait. All list
/// operations over soft-deletable rows exclude rows with a non-null
/// `deleted_at`.
#[async_trait]
pub trait Catalog: Send + Sync {
    // -- users ----------------------------------------------------------

    /// Look a user up by OAuth id; insert a disabled user when unknown
    /// and an email is provided. Returns the user and whether it was
    /// created by this call.
    async fn select_or_insert_user_by_oauth_id(
        &self,
        oauth_id: &str,
        email: &str,
    ) -> Result<(User, bool)>;

    async fn select_user(&self, id: i64) -> Result<Option<User>>;

    async fn save_user(&self, user: &User) -> Result<()>;

    // -- datasets -------------------------------------------------------

    async fn select_datasets(&self) -> Result<Vec<Dataset>>;

    async fn insert_dataset(&self, name: &str) -> Result<Dataset>;

    // -- tables ---------------------------------------------------------

    /// All live tables, id ascending.
    async fn tables(&self) -> Result<Vec<Table>>;

    async fn tables_by_frequency(&self, freq_id: i64) -> Result<Vec<Table>>;

    async fn select_table(&self, id: i64) -> Result<Option<Table>>;

    async fn select_table_id_by_name(&self, dataset: &str, name: &str) -> Result<Option<i64>>;

    async fn insert_table(&self, table: &Table) -> Result<Table>;

    async fn save_table(&self, table: &Table) -> Result<()>;

    // -- jobs -----------------------------------------------------------

    async fn insert_job(&self, job: &Job) -> Result<Job>;

    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Jobs that have been submitted but not observed terminal: the
    /// warehouse id is set and the end time is missing or stale.
    async fn running_jobs(&self) -> Result<Vec<Job>>;

    async fn select_job_by_warehouse_id(&self, warehouse_job_id: &str) -> Result<Option<Job>>;

    async fn jobs_by_table(&self, table_id: i64, offset: i64, limit: i64) -> Result<Vec<Job>>;

    async fn jobs_by_run(&self, run_id: i64) -> Result<Vec<Job>>;

    // -- runs -----------------------------------------------------------

    /// Insert a run row. Fails with
    /// [`CatalogError::UnfinishedRunExists`](crate::CatalogError) when
    /// an unfinished run for the frequency already exists.
    async fn insert_run(&self, user_id: Option<i64>, freq_id: i64) -> Result<Run>;

    async fn update_run(&self, run: &Run) -> Result<()>;

    async fn select_run(&self, id: i64) -> Result<Option<Run>>;

    async fn unfinished_runs(&self) -> Result<Vec<Run>>;

    /// Paginated run history, newest first, with aggregated billed
    /// bytes and the frequency name joined in.
    async fn runs(&self, offset: i64, limit: i64) -> Result<Vec<Run>>;

    // -- frequencies ----------------------------------------------------

    async fn select_freqs(&self) -> Result<Vec<Freq>>;

    async fn insert_freq(
        &self,
        name: &str,
        period_secs: i64,
        offset_secs: i64,
        active: bool,
    ) -> Result<Freq>;

    async fn update_freq(&self, freq: &Freq) -> Result<()>;

    // -- external databases ---------------------------------------------

    /// All registered databases, without connection secrets.
    async fn select_dbs(&self) -> Result<Vec<ExternalDb>>;

    /// One database with its connect string fully resolved (secret
    /// decrypted and substituted).
    async fn select_db_conf(&self, id: i64) -> Result<Option<ExternalDb>>;

    async fn insert_db_conf(
        &self,
        name: &str,
        driver: &str,
        dataset: &str,
        export: bool,
        connect_str: &str,
        secret: &str,
    ) -> Result<()>;

    async fn update_db_conf(
        &self,
        id: i64,
        name: &str,
        driver: &str,
        dataset: &str,
        export: bool,
        connect_str: &str,
        secret: &str,
    ) -> Result<()>;

    // -- notifications --------------------------------------------------

    async fn log_notification(&self, notification: &Notification) -> Result<()>;

    // -- singleton configurations ---------------------------------------

    async fn select_warehouse_conf(&self) -> Result<Option<WarehouseConf>>;
    async fn set_warehouse_conf(&self, conf: &WarehouseConf) -> Result<()>;

    async fn select_oauth_conf(&self) -> Result<Option<OAuthConf>>;
    async fn set_oauth_conf(&self, conf: &OAuthConf) -> Result<()>;

    async fn select_git_conf(&self) -> Result<Option<GitConf>>;
    async fn set_git_conf(&self, conf: &GitConf) -> Result<()>;

    async fn select_slack_conf(&self) -> Result<Option<SlackConf>>;
    async fn set_slack_conf(&self, conf: &SlackConf) -> Result<()>;
}
