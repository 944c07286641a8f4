//! PostgreSQL implementation of the catalog.
//!
//! Schema bootstrap runs on open. The only cross-process coordination
//! point in all of Maestro is here: the partial unique index on
//! (freq_id, end_time IS NULL) which admits at most one unfinished run
//! per frequency.

use async_trait::async_trait;
use chrono::Duration;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use maestro_crypto::{decrypt_string, encrypt_string};
use maestro_scheduler::Condition;

use crate::catalog::Catalog;
use crate::error::{CatalogError, Result};
use crate::model::{
    Dataset, ExternalDb, Freq, GitConf, Job, Notification, OAuthConf, Run, SlackConf, Table, User,
    WarehouseConf,
};

const TABLE_COLUMNS: &str = "t.id, t.user_id, t.dataset_id, t.name, t.query, t.disposition, \
     t.partitioned, t.legacy_sql, t.description, t.error, t.running, t.extract, \
     t.notify_extract_url, t.sheets_extract, t.sheet_id, t.export_db_id, t.export_table_name, \
     t.freq_id, t.conditions, t.reimport_cond, t.external_tmout, t.external_format, \
     t.import_db_id, t.imported_at, t.id_column, t.last_id, t.created_at, t.deleted_at, \
     t.last_ok_run_end_at";

const JOB_COLUMNS: &str = "id, created_at, table_id, user_id, run_id, parents, warehouse_job_id, \
     type, configuration, status, query_stats, load_stats, extract_stats, destination_urls, \
     creation_time, start_time, end_time, total_bytes_processed, total_bytes_billed, \
     import_begin, import_end, import_bytes, import_rows";

const RUN_COLUMNS: &str = "id, user_id, created_at, start_time, end_time, error, freq_id";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL NOT NULL PRIMARY KEY,
        oauth_id TEXT NOT NULL,
        email TEXT NOT NULL,
        admin BOOL NOT NULL DEFAULT false,
        disabled BOOL NOT NULL DEFAULT false,
        created_at TIMESTAMP WITH TIME ZONE DEFAULT now()
    );

    CREATE UNIQUE INDEX IF NOT EXISTS users_oauth_id_idx ON users(oauth_id);

    CREATE TABLE IF NOT EXISTS datasets (
        id BIGSERIAL NOT NULL PRIMARY KEY,
        dataset TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS datasets_dataset_idx ON datasets (dataset);

    CREATE TABLE IF NOT EXISTS freqs (
        id BIGSERIAL NOT NULL PRIMARY KEY,
        name TEXT NOT NULL,
        period BIGINT NOT NULL,             -- seconds
        "offset" BIGINT NOT NULL DEFAULT 0, -- seconds
        active BOOLEAN NOT NULL DEFAULT false
    );

    CREATE TABLE IF NOT EXISTS dbs (
        id BIGSERIAL NOT NULL PRIMARY KEY,
        name TEXT NOT NULL,
        dataset_id BIGINT NOT NULL REFERENCES datasets(id) ON DELETE RESTRICT,
        driver TEXT NOT NULL,
        connect_str TEXT NOT NULL,
        secret TEXT NOT NULL,
        export BOOL NOT NULL DEFAULT false
    );

    CREATE TABLE IF NOT EXISTS tables (
        id BIGSERIAL NOT NULL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE RESTRICT,
        name TEXT NOT NULL,
        dataset_id BIGINT NOT NULL REFERENCES datasets(id) ON DELETE RESTRICT,
        description TEXT NOT NULL DEFAULT '',
        query TEXT NOT NULL,
        legacy_sql BOOL NOT NULL DEFAULT false,
        disposition TEXT NOT NULL DEFAULT 'WRITE_TRUNCATE',
        partitioned BOOL NOT NULL DEFAULT false,
        running BOOL NOT NULL DEFAULT false,
        error TEXT NOT NULL DEFAULT '',
        extract BOOL NOT NULL DEFAULT false,
        notify_extract_url TEXT NOT NULL DEFAULT '',
        sheets_extract BOOL NOT NULL DEFAULT false,
        sheet_id TEXT NOT NULL DEFAULT '',
        export_db_id BIGINT REFERENCES dbs(id) ON DELETE RESTRICT,
        export_table_name TEXT NOT NULL DEFAULT '',
        freq_id BIGINT REFERENCES freqs(id) ON DELETE RESTRICT,
        conditions JSONB NOT NULL DEFAULT '[]',
        external_tmout BIGINT,
        external_format TEXT NOT NULL DEFAULT '',
        import_db_id BIGINT REFERENCES dbs(id) ON DELETE RESTRICT,
        imported_at TIMESTAMP WITH TIME ZONE,
        id_column TEXT NOT NULL DEFAULT '',
        last_id TEXT NOT NULL DEFAULT '',
        reimport_cond JSONB NOT NULL DEFAULT '[]',
        created_at TIMESTAMP WITH TIME ZONE DEFAULT now(),
        deleted_at TIMESTAMP WITH TIME ZONE,
        last_ok_run_end_at TIMESTAMP WITH TIME ZONE
    );

    CREATE UNIQUE INDEX IF NOT EXISTS tables_name_dataset_id_idx
        ON tables (name, dataset_id)
        WHERE deleted_at IS NULL;
    CREATE INDEX IF NOT EXISTS tables_user_id_idx ON tables (user_id);

    CREATE TABLE IF NOT EXISTS runs (
        id BIGSERIAL NOT NULL PRIMARY KEY,
        user_id BIGINT REFERENCES users(id) ON DELETE RESTRICT,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now(),
        start_time TIMESTAMP WITH TIME ZONE,
        end_time TIMESTAMP WITH TIME ZONE,
        error TEXT,
        freq_id BIGINT REFERENCES freqs(id) ON DELETE RESTRICT
    );

    -- Allow only one unfinished run per frequency. The index name is
    -- load-bearing: insert_run() recognizes the violation by it.
    CREATE UNIQUE INDEX IF NOT EXISTS runs_freq_id_end_time_null_idx
        ON runs (freq_id, (end_time IS NULL)) WHERE end_time IS NULL;

    CREATE TABLE IF NOT EXISTS jobs (
        id BIGSERIAL NOT NULL PRIMARY KEY,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now(),
        table_id BIGINT NOT NULL REFERENCES tables(id) ON DELETE CASCADE,
        user_id BIGINT REFERENCES users(id) ON DELETE RESTRICT,
        run_id BIGINT REFERENCES runs(id) ON DELETE CASCADE,
        parents JSONB,
        type TEXT NOT NULL,
        warehouse_job_id TEXT NOT NULL,
        configuration TEXT,
        status TEXT,
        query_stats TEXT,
        load_stats TEXT,
        extract_stats TEXT,
        creation_time TIMESTAMP WITH TIME ZONE,
        start_time TIMESTAMP WITH TIME ZONE,
        end_time TIMESTAMP WITH TIME ZONE,
        total_bytes_processed BIGINT NOT NULL DEFAULT 0,
        total_bytes_billed BIGINT NOT NULL DEFAULT 0,
        destination_urls TEXT,  -- extract only
        import_begin TIMESTAMP WITH TIME ZONE,
        import_end TIMESTAMP WITH TIME ZONE,
        import_bytes BIGINT NOT NULL DEFAULT 0,
        import_rows BIGINT NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS jobs_table_id_idx ON jobs(table_id);
    CREATE INDEX IF NOT EXISTS jobs_run_id_idx ON jobs (run_id);
    CREATE UNIQUE INDEX IF NOT EXISTS jobs_warehouse_job_id_idx
        ON jobs (warehouse_job_id) WHERE warehouse_job_id <> '';

    CREATE TABLE IF NOT EXISTS notifications (
        id BIGSERIAL NOT NULL PRIMARY KEY,
        table_id BIGINT NOT NULL REFERENCES tables(id) ON DELETE CASCADE,
        job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now(),
        duration_ms BIGINT NOT NULL,
        error TEXT,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        body TEXT NOT NULL,
        resp_status_code INT NOT NULL,
        resp_status TEXT NOT NULL,
        resp_headers TEXT NOT NULL,
        resp_body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS warehouse_conf (
        project_id TEXT NOT NULL,
        email TEXT NOT NULL,
        private_key_id TEXT NOT NULL,
        key TEXT NOT NULL,
        bucket TEXT NOT NULL DEFAULT '',
        one_row BOOL NOT NULL DEFAULT true,
        CONSTRAINT warehouse_conf_one_row_true CHECK(one_row = true)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS warehouse_conf_one_row_idx ON warehouse_conf(one_row);

    CREATE TABLE IF NOT EXISTS oauth_conf (
        client_id TEXT NOT NULL,
        secret TEXT NOT NULL,
        redirect TEXT NOT NULL,
        allowed_domain TEXT NOT NULL,
        cookie_secret TEXT NOT NULL,
        one_row BOOL NOT NULL DEFAULT true,
        CONSTRAINT oauth_conf_one_row_true CHECK(one_row = true)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS oauth_conf_one_row_idx ON oauth_conf(one_row);

    CREATE TABLE IF NOT EXISTS git_conf (
        url TEXT NOT NULL,
        token TEXT NOT NULL,
        one_row BOOL NOT NULL DEFAULT true,
        CONSTRAINT git_conf_one_row_true CHECK(one_row = true)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS git_conf_one_row_idx ON git_conf(one_row);

    CREATE TABLE IF NOT EXISTS slack_conf (
        url TEXT NOT NULL,
        username TEXT NOT NULL,
        channel TEXT NOT NULL,
        iconemoji TEXT NOT NULL DEFAULT '',
        url_prefix TEXT NOT NULL,
        one_row BOOL NOT NULL DEFAULT true,
        CONSTRAINT slack_conf_one_row_true CHECK(one_row = true)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS slack_conf_one_row_idx ON slack_conf(one_row);
"#;

/// Connection settings for the catalog database.
#[derive(Debug, Clone)]
pub struct PgCatalogConfig {
    pub database_url: String,
    /// Deployer secret used to encrypt stored credentials.
    pub secret: String,
    pub max_connections: u32,
}

impl PgCatalogConfig {
    pub fn new(database_url: &str, secret: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            secret: secret.to_string(),
            max_connections: 5,
        }
    }
}

/// The catalog, backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
    secret: String,
}

impl PgCatalog {
    /// Connect and bootstrap the schema.
    pub async fn open(config: PgCatalogConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;

        let catalog = Self {
            pool,
            secret: config.secret,
        };
        catalog.ensure_schema().await?;
        info!("Catalog opened");
        Ok(catalog)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_user(row: &PgRow) -> Result<User> {
        Ok(User {
            id: row.try_get("id")?,
            oauth_id: row.try_get("oauth_id")?,
            email: row.try_get("email")?,
            admin: row.try_get("admin")?,
            disabled: row.try_get("disabled")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_table(row: &PgRow) -> Result<Table> {
        let disposition: String = row.try_get("disposition")?;
        let external_format: String = row.try_get("external_format")?;
        let conditions: Json<Vec<Condition>> = row.try_get("conditions")?;
        let reimport_cond: Json<Vec<Condition>> = row.try_get("reimport_cond")?;

        Ok(Table {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            email: row.try_get("email").unwrap_or_default(),
            name: row.try_get("name")?,
            dataset: row.try_get("dataset").unwrap_or_default(),
            dataset_id: row.try_get("dataset_id")?,
            query: row.try_get("query")?,
            disposition: disposition
                .parse()
                .map_err(CatalogError::invalid_state)?,
            partitioned: row.try_get("partitioned")?,
            legacy_sql: row.try_get("legacy_sql")?,
            description: row.try_get("description")?,
            error: row.try_get("error")?,
            running: row.try_get("running")?,
            extract: row.try_get("extract")?,
            notify_extract_url: row.try_get("notify_extract_url")?,
            sheets_extract: row.try_get("sheets_extract")?,
            sheet_id: row.try_get("sheet_id")?,
            export_db_id: row.try_get("export_db_id")?,
            export_table_name: row.try_get("export_table_name")?,
            freq_id: row.try_get("freq_id")?,
            conditions: conditions.0,
            external_tmout_secs: row.try_get("external_tmout")?,
            external_format: external_format
                .parse()
                .map_err(CatalogError::invalid_state)?,
            import_db_id: row.try_get("import_db_id")?,
            imported_at: row.try_get("imported_at")?,
            id_column: row.try_get("id_column")?,
            last_id: row.try_get("last_id")?,
            reimport_cond: reimport_cond.0,
            created_at: row.try_get("created_at")?,
            deleted_at: row.try_get("deleted_at")?,
            last_ok_run_end_at: row.try_get("last_ok_run_end_at")?,
        })
    }

    fn row_to_job(row: &PgRow) -> Result<Job> {
        let kind: String = row.try_get("type")?;
        let parents: Option<Json<Vec<i64>>> = row.try_get("parents")?;

        Ok(Job {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            table_id: row.try_get("table_id")?,
            user_id: row.try_get("user_id")?,
            run_id: row.try_get("run_id")?,
            parents: parents.map(|p| p.0).unwrap_or_default(),
            warehouse_job_id: row.try_get("warehouse_job_id")?,
            kind: kind.parse().map_err(CatalogError::invalid_state)?,
            configuration: row.try_get("configuration")?,
            status: row.try_get("status")?,
            query_stats: row.try_get("query_stats")?,
            load_stats: row.try_get("load_stats")?,
            extract_stats: row.try_get("extract_stats")?,
            destination_urls: row.try_get("destination_urls")?,
            creation_time: row.try_get("creation_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            total_bytes_processed: row.try_get("total_bytes_processed")?,
            total_bytes_billed: row.try_get("total_bytes_billed")?,
            import_begin: row.try_get("import_begin")?,
            import_end: row.try_get("import_end")?,
            import_bytes: row.try_get("import_bytes")?,
            import_rows: row.try_get("import_rows")?,
        })
    }

    fn row_to_run(row: &PgRow) -> Result<Run> {
        Ok(Run {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            created_at: row.try_get("created_at")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            freq_id: row.try_get("freq_id")?,
            freq_name: row.try_get("freq_name").unwrap_or_default(),
            total_bytes: row.try_get("total_bytes").unwrap_or_default(),
            error: row.try_get("error")?,
        })
    }

    fn row_to_freq(row: &PgRow) -> Result<Freq> {
        let period: i64 = row.try_get("period")?;
        let offset: i64 = row.try_get("offset")?;
        Ok(Freq {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            period: Duration::seconds(period),
            offset: Duration::seconds(offset),
            active: row.try_get("active")?,
        })
    }

    fn row_to_db(row: &PgRow) -> Result<ExternalDb> {
        let driver: String = row.try_get("driver")?;
        Ok(ExternalDb {
            id: row.try_get("id").unwrap_or_default(),
            name: row.try_get("name")?,
            dataset_id: row.try_get("dataset_id")?,
            dataset: row.try_get("dataset")?,
            driver: driver.parse().map_err(CatalogError::invalid_state)?,
            connect_str: row.try_get("connect_str")?,
            export: row.try_get("export")?,
        })
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn select_or_insert_user_by_oauth_id(
        &self,
        oauth_id: &str,
        email: &str,
    ) -> Result<(User, bool)> {
        let row = sqlx::query(
            "SELECT id, oauth_id, email, admin, disabled, created_at FROM users WHERE oauth_id = $1",
        )
        .bind(oauth_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok((Self::row_to_user(&row)?, false));
        }

        if email.is_empty() {
            return Err(CatalogError::invalid_state(
                "email cannot be blank for user insert",
            ));
        }

        let row = sqlx::query(
            "INSERT INTO users (oauth_id, email, disabled) VALUES ($1, $2, true) \
             ON CONFLICT (oauth_id) DO UPDATE SET oauth_id = $1 \
             RETURNING id, oauth_id, email, admin, disabled, created_at",
        )
        .bind(oauth_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok((Self::row_to_user(&row)?, true))
    }

    async fn select_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, oauth_id, email, admin, disabled, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_to_user(&r)).transpose()
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "UPDATE users SET oauth_id = $1, email = $2, admin = $3, disabled = $4 WHERE id = $5",
        )
        .bind(&user.oauth_id)
        .bind(&user.email)
        .bind(user.admin)
        .bind(user.disabled)
        .bind(user.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_datasets(&self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT id, dataset FROM datasets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Dataset {
                    id: row.try_get("id")?,
                    dataset: row.try_get("dataset")?,
                })
            })
            .collect()
    }

    async fn insert_dataset(&self, name: &str) -> Result<Dataset> {
        let row = sqlx::query("INSERT INTO datasets (dataset) VALUES ($1) RETURNING id, dataset")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(Dataset {
            id: row.try_get("id")?,
            dataset: row.try_get("dataset")?,
        })
    }

    async fn tables(&self) -> Result<Vec<Table>> {
        let sql = format!(
            "SELECT {TABLE_COLUMNS}, d.dataset, u.email FROM tables t \
             JOIN datasets d ON t.dataset_id = d.id \
             JOIN users u ON t.user_id = u.id \
             WHERE t.deleted_at IS NULL ORDER BY t.id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_table).collect()
    }

    async fn tables_by_frequency(&self, freq_id: i64) -> Result<Vec<Table>> {
        // The table list is small; filtering in memory keeps one code
        // path for the joins.
        let all = self.tables().await?;
        Ok(all
            .into_iter()
            .filter(|t| t.freq_id == Some(freq_id))
            .collect())
    }

    async fn select_table(&self, id: i64) -> Result<Option<Table>> {
        let sql = format!(
            "SELECT {TABLE_COLUMNS}, d.dataset, u.email FROM tables t \
             JOIN datasets d ON t.dataset_id = d.id \
             JOIN users u ON t.user_id = u.id \
             WHERE t.id = $1 AND t.deleted_at IS NULL"
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_table).transpose()
    }

    async fn select_table_id_by_name(&self, dataset: &str, name: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT t.id FROM tables t JOIN datasets d ON t.dataset_id = d.id \
             WHERE d.dataset = $1 AND t.name = $2 AND t.deleted_at IS NULL",
        )
        .bind(dataset)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }

    async fn insert_table(&self, table: &Table) -> Result<Table> {
        let row = sqlx::query(
            "INSERT INTO tables \
                (user_id, dataset_id, name, query, disposition, partitioned, legacy_sql, \
                 description, import_db_id, id_column, last_id, freq_id, conditions, \
                 reimport_cond, extract, notify_extract_url, sheets_extract, sheet_id, \
                 external_tmout, external_format, export_db_id, export_table_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                 $17, $18, $19, $20, $21, $22) \
             RETURNING id",
        )
        .bind(table.user_id)
        .bind(table.dataset_id)
        .bind(&table.name)
        .bind(&table.query)
        .bind(table.disposition.as_str())
        .bind(table.partitioned)
        .bind(table.legacy_sql)
        .bind(&table.description)
        .bind(table.import_db_id)
        .bind(&table.id_column)
        .bind(&table.last_id)
        .bind(table.freq_id)
        .bind(Json(&table.conditions))
        .bind(Json(&table.reimport_cond))
        .bind(table.extract)
        .bind(&table.notify_extract_url)
        .bind(table.sheets_extract)
        .bind(&table.sheet_id)
        .bind(table.external_tmout_secs)
        .bind(table.external_format.as_str())
        .bind(table.export_db_id)
        .bind(&table.export_table_name)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        self.select_table(id)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("table {} after insert", id)))
    }

    async fn save_table(&self, table: &Table) -> Result<()> {
        sqlx::query(
            "UPDATE tables SET user_id = $1, dataset_id = $2, name = $3, query = $4, \
                disposition = $5, partitioned = $6, legacy_sql = $7, description = $8, \
                error = $9, running = $10, extract = $11, notify_extract_url = $12, \
                sheets_extract = $13, sheet_id = $14, import_db_id = $15, freq_id = $16, \
                conditions = $17, reimport_cond = $18, imported_at = $19, id_column = $20, \
                last_id = $21, deleted_at = $22, last_ok_run_end_at = $23, \
                external_tmout = $24, external_format = $25, export_db_id = $26, \
                export_table_name = $27 \
             WHERE id = $28",
        )
        .bind(table.user_id)
        .bind(table.dataset_id)
        .bind(&table.name)
        .bind(&table.query)
        .bind(table.disposition.as_str())
        .bind(table.partitioned)
        .bind(table.legacy_sql)
        .bind(&table.description)
        .bind(&table.error)
        .bind(table.running)
        .bind(table.extract)
        .bind(&table.notify_extract_url)
        .bind(table.sheets_extract)
        .bind(&table.sheet_id)
        .bind(table.import_db_id)
        .bind(table.freq_id)
        .bind(Json(&table.conditions))
        .bind(Json(&table.reimport_cond))
        .bind(table.imported_at)
        .bind(&table.id_column)
        .bind(&table.last_id)
        .bind(table.deleted_at)
        .bind(table.last_ok_run_end_at)
        .bind(table.external_tmout_secs)
        .bind(table.external_format.as_str())
        .bind(table.export_db_id)
        .bind(&table.export_table_name)
        .bind(table.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<Job> {
        let sql = format!(
            "INSERT INTO jobs \
                (table_id, user_id, run_id, parents, warehouse_job_id, type, configuration, \
                 status, query_stats, load_stats, extract_stats, destination_urls, \
                 creation_time, start_time, end_time, total_bytes_processed, \
                 total_bytes_billed, import_begin, import_end, import_bytes, import_rows) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                 $17, $18, $19, $20, $21) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job.table_id)
            .bind(job.user_id)
            .bind(job.run_id)
            .bind(Json(&job.parents))
            .bind(&job.warehouse_job_id)
            .bind(job.kind.as_str())
            .bind(&job.configuration)
            .bind(&job.status)
            .bind(&job.query_stats)
            .bind(&job.load_stats)
            .bind(&job.extract_stats)
            .bind(&job.destination_urls)
            .bind(job.creation_time)
            .bind(job.start_time)
            .bind(job.end_time)
            .bind(job.total_bytes_processed)
            .bind(job.total_bytes_billed)
            .bind(job.import_begin)
            .bind(job.import_end)
            .bind(job.import_bytes)
            .bind(job.import_rows)
            .fetch_one(&self.pool)
            .await?;
        Self::row_to_job(&row)
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET table_id = $1, user_id = $2, run_id = $3, parents = $4, \
                warehouse_job_id = $5, type = $6, configuration = $7, status = $8, \
                query_stats = $9, load_stats = $10, extract_stats = $11, \
                destination_urls = $12, creation_time = $13, start_time = $14, \
                end_time = $15, total_bytes_processed = $16, total_bytes_billed = $17, \
                import_begin = $18, import_end = $19, import_bytes = $20, import_rows = $21 \
             WHERE id = $22",
        )
        .bind(job.table_id)
        .bind(job.user_id)
        .bind(job.run_id)
        .bind(Json(&job.parents))
        .bind(&job.warehouse_job_id)
        .bind(job.kind.as_str())
        .bind(&job.configuration)
        .bind(&job.status)
        .bind(&job.query_stats)
        .bind(&job.load_stats)
        .bind(&job.extract_stats)
        .bind(&job.destination_urls)
        .bind(job.creation_time)
        .bind(job.start_time)
        .bind(job.end_time)
        .bind(job.total_bytes_processed)
        .bind(job.total_bytes_billed)
        .bind(job.import_begin)
        .bind(job.import_end)
        .bind(job.import_bytes)
        .bind(job.import_rows)
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn running_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE warehouse_job_id != '' AND (end_time IS NULL OR end_time < start_time)"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn select_job_by_warehouse_id(&self, warehouse_job_id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE warehouse_job_id = $1");
        let row = sqlx::query(&sql)
            .bind(warehouse_job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn jobs_by_table(&self, table_id: i64, offset: i64, limit: i64) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE table_id = $1 \
             ORDER BY id DESC OFFSET $2 LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(table_id)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn jobs_by_run(&self, run_id: i64) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE run_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn insert_run(&self, user_id: Option<i64>, freq_id: i64) -> Result<Run> {
        let sql = format!(
            "INSERT INTO runs (user_id, freq_id) VALUES ($1, $2) RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(freq_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if CatalogError::is_unfinished_run_conflict(&err) {
                    CatalogError::UnfinishedRunExists(freq_id)
                } else {
                    err.into()
                }
            })?;
        Self::row_to_run(&row)
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET user_id = $1, start_time = $2, end_time = $3, error = $4, \
                freq_id = $5 WHERE id = $6",
        )
        .bind(run.user_id)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(&run.error)
        .bind(run.freq_id)
        .bind(run.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_run(&self, id: i64) -> Result<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn unfinished_runs(&self) -> Result<Vec<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE end_time IS NULL");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn runs(&self, offset: i64, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT runs.id, runs.user_id, runs.created_at, runs.start_time, runs.end_time, \
                runs.error, runs.freq_id, freqs.name AS freq_name, \
                COALESCE(j.total_bytes, 0) AS total_bytes \
             FROM runs \
             JOIN freqs ON runs.freq_id = freqs.id \
             LEFT JOIN LATERAL ( \
                SELECT SUM(total_bytes_billed) AS total_bytes \
                  FROM jobs \
                 WHERE jobs.run_id = runs.id \
                 GROUP BY run_id \
             ) j ON true \
             ORDER BY runs.id DESC OFFSET $1 LIMIT $2",
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn select_freqs(&self) -> Result<Vec<Freq>> {
        let rows =
            sqlx::query("SELECT id, name, period, \"offset\", active FROM freqs ORDER BY period")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::row_to_freq).collect()
    }

    async fn insert_freq(
        &self,
        name: &str,
        period_secs: i64,
        offset_secs: i64,
        active: bool,
    ) -> Result<Freq> {
        let row = sqlx::query(
            "INSERT INTO freqs (name, period, \"offset\", active) VALUES ($1, $2, $3, $4) \
             RETURNING id, name, period, \"offset\", active",
        )
        .bind(name)
        .bind(period_secs)
        .bind(offset_secs)
        .bind(active)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_freq(&row)
    }

    async fn update_freq(&self, freq: &Freq) -> Result<()> {
        sqlx::query(
            "UPDATE freqs SET name = $2, period = $3, \"offset\" = $4, active = $5 WHERE id = $1",
        )
        .bind(freq.id)
        .bind(&freq.name)
        .bind(freq.period_secs())
        .bind(freq.offset_secs())
        .bind(freq.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_dbs(&self) -> Result<Vec<ExternalDb>> {
        // No connect string resolution here: listings never need the
        // secret.
        let rows = sqlx::query(
            "SELECT idb.id, idb.name, idb.dataset_id, idb.driver, idb.connect_str, \
                idb.export, d.dataset \
             FROM dbs idb JOIN datasets d ON idb.dataset_id = d.id ORDER BY idb.id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_db).collect()
    }

    async fn select_db_conf(&self, id: i64) -> Result<Option<ExternalDb>> {
        let row = sqlx::query(
            "SELECT idb.id, idb.name, idb.dataset_id, idb.driver, idb.connect_str, \
                idb.secret, idb.export, d.dataset \
             FROM dbs idb JOIN datasets d ON idb.dataset_id = d.id WHERE idb.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        let mut db = Self::row_to_db(&row)?;

        // Interpolate the secret into the connect string placeholder.
        let crypt_secret: String = row.try_get("secret")?;
        if !crypt_secret.is_empty() {
            let secret = decrypt_string(&crypt_secret, &self.secret)?;
            db.connect_str = db.connect_str.replacen("%s", &secret, 1);
        }
        Ok(Some(db))
    }

    async fn insert_db_conf(
        &self,
        name: &str,
        driver: &str,
        dataset: &str,
        export: bool,
        connect_str: &str,
        secret: &str,
    ) -> Result<()> {
        let dataset_id = match self
            .select_datasets()
            .await?
            .into_iter()
            .find(|d| d.dataset == dataset)
        {
            Some(d) => d.id,
            None => self.insert_dataset(dataset).await?.id,
        };

        let crypt_secret = if secret.is_empty() {
            String::new()
        } else {
            encrypt_string(secret, &self.secret)?
        };

        sqlx::query(
            "INSERT INTO dbs (name, driver, connect_str, dataset_id, secret, export) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(name)
        .bind(driver)
        .bind(connect_str)
        .bind(dataset_id)
        .bind(crypt_secret)
        .bind(export)
        .execute(&self.pool)
        .await?;
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
        secret: &str,
    ) -> Result<()> {
        let dataset_id = match self
            .select_datasets()
            .await?
            .into_iter()
            .find(|d| d.dataset == dataset)
        {
            Some(d) => d.id,
            None => self.insert_dataset(dataset).await?.id,
        };

        let crypt_secret = if secret.is_empty() {
            String::new()
        } else {
            encrypt_string(secret, &self.secret)?
        };

        sqlx::query(
            "UPDATE dbs SET name = $2, driver = $3, connect_str = $4, dataset_id = $5, \
                secret = $6, export = $7 WHERE id = $1",
        )
        .bind(id)
        .bind(name)
        .bind(driver)
        .bind(connect_str)
        .bind(dataset_id)
        .bind(crypt_secret)
        .bind(export)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_notification(&self, n: &Notification) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications \
                (table_id, job_id, created_at, duration_ms, error, url, method, body, \
                 resp_status_code, resp_status, resp_headers, resp_body) \
             VALUES ($1, $2, COALESCE($3, now()), $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(n.table_id)
        .bind(n.job_id)
        .bind(n.created_at)
        .bind(n.duration_ms)
        .bind(&n.error)
        .bind(&n.url)
        .bind(&n.method)
        .bind(&n.body)
        .bind(n.resp_status_code)
        .bind(&n.resp_status)
        .bind(&n.resp_headers)
        .bind(&n.resp_body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_warehouse_conf(&self) -> Result<Option<WarehouseConf>> {
        let row = sqlx::query(
            "SELECT project_id, email, private_key_id, key, bucket FROM warehouse_conf LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        let crypt_key: String = row.try_get("key")?;
        Ok(Some(WarehouseConf {
            project_id: row.try_get("project_id")?,
            email: row.try_get("email")?,
            private_key_id: row.try_get("private_key_id")?,
            key: decrypt_string(&crypt_key, &self.secret)?,
            bucket: row.try_get("bucket")?,
        }))
    }

    async fn set_warehouse_conf(&self, conf: &WarehouseConf) -> Result<()> {
        let crypt_key = encrypt_string(&conf.key, &self.secret)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE warehouse_conf")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO warehouse_conf (project_id, email, private_key_id, key, bucket) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&conf.project_id)
        .bind(&conf.email)
        .bind(&conf.private_key_id)
        .bind(crypt_key)
        .bind(&conf.bucket)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn select_oauth_conf(&self) -> Result<Option<OAuthConf>> {
        let row = sqlx::query(
            "SELECT client_id, secret, redirect, allowed_domain, cookie_secret \
             FROM oauth_conf LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        let crypt_secret: String = row.try_get("secret")?;
        let crypt_cookie: String = row.try_get("cookie_secret")?;
        Ok(Some(OAuthConf {
            client_id: row.try_get("client_id")?,
            secret: decrypt_string(&crypt_secret, &self.secret)?,
            redirect: row.try_get("redirect")?,
            allowed_domain: row.try_get("allowed_domain")?,
            cookie_secret: decrypt_string(&crypt_cookie, &self.secret)?,
        }))
    }

    async fn set_oauth_conf(&self, conf: &OAuthConf) -> Result<()> {
        let crypt_secret = encrypt_string(&conf.secret, &self.secret)?;
        let crypt_cookie = encrypt_string(&conf.cookie_secret, &self.secret)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE oauth_conf").execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO oauth_conf (client_id, secret, redirect, allowed_domain, cookie_secret) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&conf.client_id)
        .bind(crypt_secret)
        .bind(&conf.redirect)
        .bind(&conf.allowed_domain)
        .bind(crypt_cookie)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn select_git_conf(&self) -> Result<Option<GitConf>> {
        let row = sqlx::query("SELECT url, token FROM git_conf LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        let crypt_token: String = row.try_get("token")?;
        Ok(Some(GitConf {
            url: row.try_get("url")?,
            token: decrypt_string(&crypt_token, &self.secret)?,
        }))
    }

    async fn set_git_conf(&self, conf: &GitConf) -> Result<()> {
        let crypt_token = encrypt_string(&conf.token, &self.secret)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE git_conf").execute(&mut *tx).await?;
        sqlx::query("INSERT INTO git_conf (url, token) VALUES ($1, $2)")
            .bind(&conf.url)
            .bind(crypt_token)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn select_slack_conf(&self) -> Result<Option<SlackConf>> {
        let row = sqlx::query(
            "SELECT url, username, channel, iconemoji, url_prefix FROM slack_conf LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        Ok(Some(SlackConf {
            url: row.try_get("url")?,
            username: row.try_get("username")?,
            channel: row.try_get("channel")?,
            icon_emoji: row.try_get("iconemoji")?,
            url_prefix: row.try_get("url_prefix")?,
        }))
    }

    async fn set_slack_conf(&self, conf: &SlackConf) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE slack_conf").execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO slack_conf (url, username, channel, iconemoji, url_prefix) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&conf.url)
        .bind(&conf.username)
        .bind(&conf.channel)
        .bind(&conf.icon_emoji)
        .bind(&conf.url_prefix)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
