//! External tables: waits, timeouts, and the upload-driven load.

mod harness;

use std::time::Duration;

use chrono::Utc;
use maestro_catalog::model::{JobState, Run};
use maestro_catalog::Catalog;
use maestro_core::{assemble_run, process_cycle};

use harness::{add_table, external, settle, world};

/// No upload within the timeout: the wait entry goes away and the
/// timeout becomes the table's error.
#[tokio::test(start_paused = true)]
async fn external_wait_times_out() {
    let w = world();
    let t = add_table(&w, external("drops", 3600, None)).await;
    let t = w.catalog.select_table(t.id).await.unwrap().unwrap();

    w.model.start_external_wait(&t, None).await.unwrap();
    assert!(w.model.has_external_wait(t.id));

    // A second wait for the same table is refused.
    assert!(w.model.start_external_wait(&t, None).await.is_err());

    settle("wait timed out", Duration::from_secs(4000), || async {
        !w.model.has_external_wait(t.id)
    })
    .await;

    let t2 = w.catalog.select_table(t.id).await.unwrap().unwrap();
    assert_eq!(t2.error, "External wait timed out after 1h0m0s");
    assert!(!t2.running);
}

/// The run registers the wait; the upload cancels it, rewrites the
/// pre-inserted load job's sources and submits it.
#[tokio::test]
async fn upload_completes_the_external_load() {
    let w = world();
    let freq = w.catalog.insert_freq("hourly", 3600, 0, true).await.unwrap();
    let t = add_table(&w, external("uploads", 3600, Some(freq.id))).await;

    let mut run = Run {
        freq_id: freq.id,
        ..Default::default()
    };
    assemble_run(&w.model, &mut run, Utc::now()).await.unwrap();

    // The assembled load job has no source URIs yet.
    let jobs = w.catalog.jobs_by_run(run.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].import_file_name().is_err());

    // The cycle registers the wait instead of submitting.
    process_cycle(&w.model, &mut run, 0).await.unwrap();
    assert!(w.model.has_external_wait(t.id));
    assert!(w.warehouse.submissions().is_empty());

    // The outside process uploads and announces the file.
    w.store.put("uploads_1.json", b"{}\n".to_vec());
    let mut t2 = w.catalog.select_table(t.id).await.unwrap().unwrap();
    w.model
        .external_load(&mut t2, "uploads_1.json", None)
        .await
        .unwrap();

    assert!(!w.model.has_external_wait(t.id));
    assert_eq!(w.warehouse.submissions().len(), 1);

    settle("load done", Duration::from_secs(20), || async {
        let jobs = w.catalog.jobs_by_run(run.id).await.unwrap();
        matches!(jobs[0].get_status().unwrap(), (JobState::Done, e) if e.is_empty())
    })
    .await;

    let jobs = w.catalog.jobs_by_run(run.id).await.unwrap();
    assert_eq!(jobs.len(), 1, "the run's pre-inserted job was reused");
    assert_eq!(jobs[0].import_file_name().unwrap(), "uploads_1.json");

    // And the run can now finish.
    process_cycle(&w.model, &mut run, 0).await.unwrap();
    assert!(run.end_time.is_some());
}
