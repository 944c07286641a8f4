//! Restart recovery and resumed runs.

mod harness;

use std::time::Duration;

use chrono::Utc;
use maestro_catalog::model::{JobState, Run};
use maestro_catalog::Catalog;
use maestro_core::{assemble_run, process_cycle, resume_run};
use maestro_test_utils::Outcome;

use harness::{add_table, settle, summary, world};

/// Kill-and-restart: submitted jobs are re-monitored by warehouse id,
/// the unfinished run resumes cycling, and nothing is submitted twice.
#[tokio::test(start_paused = true)]
async fn restart_resumes_runs_and_monitors_without_duplicates() {
    let w = world();
    w.warehouse.set_auto_complete(false);

    let freq = w.catalog.insert_freq("hourly", 3600, 0, true).await.unwrap();
    let a = add_table(&w, summary("A", "SELECT 1", Some(freq.id))).await;
    let b = add_table(&w, summary("B", "SELECT * FROM ds.A", Some(freq.id))).await;

    let mut run = Run {
        freq_id: freq.id,
        ..Default::default()
    };
    assemble_run(&w.model, &mut run, Utc::now()).await.unwrap();
    process_cycle(&w.model, &mut run, 0).await.unwrap();
    assert_eq!(w.warehouse.submissions().len(), 1); // A submitted

    // Deactivate the frequency so the restarted tickers cannot launch
    // a second run mid-test.
    let mut freq = freq;
    freq.active = false;
    w.catalog.update_freq(&freq).await.unwrap();

    // "Kill" the process: the old model's monitors are gone. Build a
    // fresh model over the same catalog and warehouse, as a restart
    // would.
    let w = harness::World {
        model: maestro_core::Model::new(
            w.catalog.clone(),
            w.warehouse.clone(),
            w.store.clone(),
            w.alerts.clone(),
            std::sync::Arc::new(maestro_core::NullSheets),
            maestro_core::ModelConfig::default(),
        ),
        ..w
    };

    w.model.start().await.unwrap();

    // Recovery does not resubmit the in-flight job.
    assert_eq!(w.warehouse.submissions().len(), 1);

    // The warehouse finishes A; the re-attached monitor observes it and
    // the resumed run loop submits B, then completes the run.
    let jobs = w.catalog.jobs_by_run(run.id).await.unwrap();
    let job_a = jobs.iter().find(|j| j.table_id == a.id).unwrap();
    w.warehouse.complete(&job_a.warehouse_job_id, None);

    settle("B submitted by the resumed loop", Duration::from_secs(300), || async {
        w.warehouse.submissions().len() == 2
    })
    .await;

    let jobs = w.catalog.jobs_by_run(run.id).await.unwrap();
    let job_b = jobs.iter().find(|j| j.table_id == b.id).unwrap();
    w.warehouse.complete(&job_b.warehouse_job_id, None);

    settle("run completed", Duration::from_secs(300), || async {
        w.catalog
            .select_run(run.id)
            .await
            .unwrap()
            .unwrap()
            .end_time
            .is_some()
    })
    .await;

    assert_eq!(w.warehouse.submissions().len(), 2, "no duplicate submissions");
    w.model.stop().await;
}

/// A resumed run tolerates exactly the errors it started with; one
/// more fails it again.
#[tokio::test(start_paused = true)]
async fn resumed_run_accepts_existing_errors_but_not_new_ones() {
    let w = world();

    let freq = w.catalog.insert_freq("hourly", 3600, 0, true).await.unwrap();
    add_table(&w, summary("bad", "SELECT 1", Some(freq.id))).await;
    // Downstream of the failing table, so it is only submitted once the
    // resume drops its failed parent from the graph.
    let good = add_table(&w, summary("good", "SELECT * FROM ds.bad", Some(freq.id))).await;

    let mut run = Run {
        freq_id: freq.id,
        ..Default::default()
    };
    assemble_run(&w.model, &mut run, Utc::now()).await.unwrap();

    // First table fails, second will fail later too.
    w.warehouse.push_outcome(Outcome {
        error: "first failure".to_string(),
        ..Default::default()
    });
    w.warehouse.push_outcome(Outcome {
        error: "second failure".to_string(),
        ..Default::default()
    });

    process_cycle(&w.model, &mut run, 0).await.unwrap();
    settle("first error lands", Duration::from_secs(60), || async {
        let jobs = w.catalog.jobs_by_run(run.id).await.unwrap();
        jobs.iter()
            .any(|j| matches!(j.get_status().unwrap(), (JobState::Error, _)))
    })
    .await;

    // Mark the run failed, as its loop would have.
    run.end_time = Some(Utc::now());
    run.error = Some("Error in table bad".to_string());
    w.catalog.update_run(&run).await.unwrap();

    // Resume: the one existing error is budgeted for, so the run
    // proceeds to submit the good table - whose new failure exceeds the
    // budget and fails the run again.
    let resumed = w.catalog.select_run(run.id).await.unwrap().unwrap();
    resume_run(w.model.clone(), resumed).await.unwrap();

    settle("resumed run fails on the new error", Duration::from_secs(300), || async {
        let run = w.catalog.select_run(run.id).await.unwrap().unwrap();
        run.end_time.is_some() && run.error.as_deref().unwrap_or("").contains("second failure")
    })
    .await;

    // The good table's job did get submitted during the resume.
    let jobs = w.catalog.jobs_by_run(run.id).await.unwrap();
    let job_good = jobs.iter().find(|j| j.table_id == good.id).unwrap();
    assert!(!job_good.warehouse_job_id.is_empty());
}
