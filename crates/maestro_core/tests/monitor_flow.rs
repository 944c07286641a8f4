//! Monitor behavior: transient retries, schema-mismatch recovery, and
//! the post-completion steps.

mod harness;

use std::time::Duration;

use chrono::Utc;
use maestro_catalog::model::{JobState, Run, WriteDisposition};
use maestro_catalog::Catalog;
use maestro_core::{assemble_run, monitor_job, process_cycle, ImportStatus};
use maestro_test_utils::Outcome;
use maestro_warehouse::{RETRYING_MARKER, SCHEMA_MISMATCH_MARKER};

use harness::{add_table, import, register_import_db, settle, summary, world};

/// The "Retrying may solve the problem" terminal status clears the
/// stored state and mints a fresh warehouse id; the failing status is
/// never persisted where a run could observe it.
#[tokio::test(start_paused = true)]
async fn retrying_marker_resubmits_with_new_id() {
    let w = world();
    let t = add_table(&w, summary("flaky", "SELECT 1", None)).await;

    // First submission completes with the transient marker; the second
    // succeeds.
    w.warehouse.push_outcome(Outcome {
        error: RETRYING_MARKER.to_string(),
        ..Default::default()
    });

    let job = w.model.new_query_job(&t, None, None, &[]).unwrap();
    let mut job = w.catalog.insert_job(&job).await.unwrap();

    let conf = job.parsed_configuration().unwrap();
    let started = w.warehouse.start_job(&conf).await.unwrap();
    job.apply_warehouse_data(&started).unwrap();
    w.catalog.update_job(&job).await.unwrap();
    assert_eq!(job.warehouse_job_id, "job_1");

    tokio::spawn(monitor_job(w.model.clone(), job.clone()));

    settle("job resubmitted under a new id", Duration::from_secs(120), || async {
        let job = w.catalog.select_job_by_warehouse_id("job_2").await.unwrap();
        match job {
            None => false,
            Some(job) => matches!(job.get_status().unwrap(), (JobState::Done, e) if e.is_empty()),
        }
    })
    .await;

    // Two submissions total; the transient failure never reached the
    // catalog as a terminal error.
    assert_eq!(w.warehouse.submissions().len(), 2);
    let old = w.catalog.select_job_by_warehouse_id("job_1").await.unwrap();
    assert!(old.is_none(), "the old id was replaced, not duplicated");
}

/// A load failing with the schema-mismatch marker triggers exactly one
/// full reimport; the error stays on the table until the reimport
/// succeeds.
#[tokio::test]
async fn schema_mismatch_triggers_one_reimport() {
    let w = world();
    let db_id = register_import_db(&w, "ext_ds");
    let t = add_table(&w, import("events", db_id, None)).await;
    // Simulate an established incremental import.
    let mut seeded = t.clone();
    seeded.last_id = "100".to_string();
    seeded.disposition = WriteDisposition::Append;
    w.catalog.save_table(&seeded).await.unwrap();

    // A load job inside a run, failing with the schema marker.
    w.warehouse.push_outcome(Outcome {
        error: format!("{} for field x", SCHEMA_MISMATCH_MARKER),
        ..Default::default()
    });

    let job = w
        .model
        .new_load_job(&seeded, None, Some(77), Some(vec![w.store.url_for_name("events.csv")]), "ext_ds")
        .unwrap();
    let mut job = w.catalog.insert_job(&job).await.unwrap();

    let conf = job.parsed_configuration().unwrap();
    let started = w.warehouse.start_job(&conf).await.unwrap();
    job.apply_warehouse_data(&started).unwrap();
    w.catalog.update_job(&job).await.unwrap();

    monitor_job(w.model.clone(), job).await;

    // The table now carries the schema error (the deterrent against
    // endless reimports), a truncating reimport was queued, and the
    // incremental cursor is gone.
    let t2 = w.catalog.select_table(t.id).await.unwrap().unwrap();
    assert!(t2.error.contains(SCHEMA_MISMATCH_MARKER));
    assert_eq!(t2.disposition, WriteDisposition::Replace);
    assert_eq!(t2.last_id, "");
    assert_eq!(w.model.get_import_status(t.id), Some(ImportStatus::Queued));

    let jobs = w.catalog.jobs_by_table(t.id, 0, 10).await.unwrap();
    assert_eq!(jobs.len(), 2, "a fresh load job was inserted");
    let reimport_job = jobs.iter().find(|j| j.warehouse_job_id.is_empty()).unwrap();

    // The reimport load succeeds (simulated directly; the worker pool
    // is not running in this test). Success clears the schema error and
    // flips the disposition back to append for later increments.
    w.model.delete_import_status(t.id);
    let mut reimport_job = reimport_job.clone();
    let conf = reimport_job.parsed_configuration().unwrap();
    let started = w.warehouse.start_job(&conf).await.unwrap();
    reimport_job.apply_warehouse_data(&started).unwrap();
    w.catalog.update_job(&reimport_job).await.unwrap();

    monitor_job(w.model.clone(), reimport_job).await;

    let t3 = w.catalog.select_table(t.id).await.unwrap().unwrap();
    assert_eq!(t3.error, "", "schema error cleared by the good reimport");
    assert!(!t3.running);
    assert_eq!(t3.disposition, WriteDisposition::Append);
    assert!(t3.imported_at.is_some());
}

/// Load completion deletes the source files from the store.
#[tokio::test]
async fn load_completion_cleans_up_sources() {
    let w = world();
    let db_id = register_import_db(&w, "ext_ds");
    let t = add_table(&w, import("rows", db_id, None)).await;

    w.store.put("rows.csv", b"1,a\n".to_vec());

    let mut job = w
        .model
        .new_load_job(&t, None, None, Some(vec![w.store.url_for_name("rows.csv")]), "ext_ds")
        .unwrap();
    let conf = job.parsed_configuration().unwrap();
    let started = w.warehouse.start_job(&conf).await.unwrap();
    let mut job = w.catalog.insert_job(&job).await.unwrap();
    job.apply_warehouse_data(&started).unwrap();
    w.catalog.update_job(&job).await.unwrap();

    monitor_job(w.model.clone(), job).await;

    assert!(w.store.get("rows.csv").is_none(), "source file deleted");
}

/// A query table with an extract step chains an extract job; the
/// last-good stamp waits for the extract.
#[tokio::test]
async fn query_with_extract_chains_an_extract_job() {
    let w = world();
    let freq = w.catalog.insert_freq("hourly", 3600, 0, true).await.unwrap();
    let mut t = summary("reported", "SELECT 1", Some(freq.id));
    t.extract = true;
    let t = add_table(&w, t).await;
    w.warehouse
        .add_table("ds", "reported", maestro_warehouse::TableInfo::default());

    let mut run = Run {
        freq_id: freq.id,
        ..Default::default()
    };
    assemble_run(&w.model, &mut run, Utc::now()).await.unwrap();
    process_cycle(&w.model, &mut run, 0).await.unwrap();

    settle("extract chained and done", Duration::from_secs(20), || async {
        let jobs = w.catalog.jobs_by_table(t.id, 0, 10).await.unwrap();
        jobs.len() == 2
            && jobs.iter().all(|j| {
                matches!(j.get_status().unwrap(), (JobState::Done, e) if e.is_empty())
            })
    })
    .await;

    let t2 = w.catalog.select_table(t.id).await.unwrap().unwrap();
    assert!(t2.last_ok_run_end_at.is_some());
    assert!(!t2.running);
}
