//! A scripted warehouse: jobs get sequential ids, outcomes are queued
//! by the test, and polls either report running or complete the job.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use maestro_warehouse::{
    ErrorProto, ExtractStatistics, JobConfiguration, JobStatistics, JobStatus, TableInfo,
    Warehouse, WarehouseError, WarehouseJob, JOB_STATE_DONE,
};

/// What a started job should eventually report.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Terminal error message; empty means success.
    pub error: String,
    /// Fail this many subsequent submit attempts before accepting.
    pub submit_failures: u32,
    /// Error text for failed submits.
    pub submit_error: String,
}

struct WarehouseState {
    jobs: HashMap<String, WarehouseJob>,
    outcomes: HashMap<String, Outcome>,
    queued: VecDeque<Outcome>,
    tables: HashMap<String, TableInfo>,
    counter: u64,
    auto_complete: bool,
    submissions: Vec<JobConfiguration>,
}

/// Mock warehouse capability.
pub struct MockWarehouse {
    project: String,
    state: Mutex<WarehouseState>,
}

impl MockWarehouse {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            state: Mutex::new(WarehouseState {
                jobs: HashMap::new(),
                outcomes: HashMap::new(),
                queued: VecDeque::new(),
                tables: HashMap::new(),
                counter: 0,
                auto_complete: true,
                submissions: Vec::new(),
            }),
        }
    }

    /// When on (the default), the first poll of a job completes it with
    /// its queued outcome. Turn off to drive completion manually.
    pub fn set_auto_complete(&self, yes: bool) {
        self.state.lock().unwrap().auto_complete = yes;
    }

    /// Queue the outcome for the next started job.
    pub fn push_outcome(&self, outcome: Outcome) {
        self.state.lock().unwrap().queued.push_back(outcome);
    }

    /// Register a table the mock can describe.
    pub fn add_table(&self, dataset: &str, name: &str, info: TableInfo) {
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(format!("{}.{}", dataset, name), info);
    }

    /// Every configuration ever submitted, in order.
    pub fn submissions(&self) -> Vec<JobConfiguration> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Complete a job by hand (auto-complete off).
    pub fn complete(&self, warehouse_id: &str, error: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(warehouse_id) {
            finish(job, error.unwrap_or(""));
        }
    }
}

fn finish(job: &mut WarehouseJob, error: &str) {
    job.status = Some(JobStatus {
        state: JOB_STATE_DONE.to_string(),
        error_result: (!error.is_empty()).then(|| ErrorProto {
            reason: "error".to_string(),
            message: error.to_string(),
        }),
    });
    let stats = job.statistics.get_or_insert_with(JobStatistics::default);
    stats.end_time = Utc::now().timestamp_millis();
    // Extracts report one output file per destination pattern.
    if let Some(conf) = &job.configuration {
        if let Some(extract) = &conf.extract {
            stats.extract = Some(ExtractStatistics {
                destination_uri_file_counts: vec![1; extract.destination_uris.len()],
            });
        }
    }
}

#[async_trait]
impl Warehouse for MockWarehouse {
    async fn start_job(&self, conf: &JobConfiguration) -> Result<WarehouseJob, WarehouseError> {
        let mut state = self.state.lock().unwrap();

        if let Some(front) = state.queued.front_mut() {
            if front.submit_failures > 0 {
                front.submit_failures -= 1;
                let msg = front.submit_error.clone();
                return Err(WarehouseError::Api(msg));
            }
        }
        let outcome = state.queued.pop_front().unwrap_or_default();

        state.counter += 1;
        let id = format!("job_{}", state.counter);
        let now = Utc::now().timestamp_millis();

        let job = WarehouseJob {
            id: id.clone(),
            configuration: Some(conf.clone()),
            status: Some(JobStatus {
                state: "RUNNING".to_string(),
                error_result: None,
            }),
            statistics: Some(JobStatistics {
                creation_time: now,
                start_time: now,
                ..Default::default()
            }),
        };

        state.submissions.push(conf.clone());
        state.outcomes.insert(id.clone(), outcome);
        state.jobs.insert(id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<WarehouseJob, WarehouseError> {
        let mut state = self.state.lock().unwrap();
        let auto = state.auto_complete;
        let outcome = state.outcomes.get(job_id).cloned().unwrap_or_default();
        match state.jobs.get_mut(job_id) {
            None => Err(WarehouseError::Api(format!("no such job: {}", job_id))),
            Some(job) => {
                let terminal = job
                    .statistics
                    .as_ref()
                    .map(|s| s.end_time != 0)
                    .unwrap_or(false);
                if auto && !terminal {
                    finish(job, &outcome.error);
                }
                Ok(job.clone())
            }
        }
    }

    async fn get_table(&self, dataset: &str, table: &str) -> Result<TableInfo, WarehouseError> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&format!("{}.{}", dataset, table))
            .cloned()
            .ok_or_else(|| WarehouseError::Api(format!("no such table: {}.{}", dataset, table)))
    }

    async fn signed_storage_url(
        &self,
        filename: &str,
        method: &str,
    ) -> Result<String, WarehouseError> {
        // Deliberately contains ampersands, like the real thing.
        Ok(format!(
            "https://storage.example.com/{}?Expires=14400&Method={}&Signature=sig",
            filename, method
        ))
    }

    fn project_id(&self) -> &str {
        &self.project
    }
}
