//! Shared setup for core integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use maestro_catalog::model::{ExternalDb, Table, WriteDisposition};
use maestro_catalog::Catalog;
use maestro_core::{Model, ModelConfig, NullSheets};
use maestro_scheduler::Condition;
use maestro_test_utils::{MemCatalog, MemObjectStore, MockWarehouse, RecordingAlerts};

pub struct World {
    pub model: Arc<Model>,
    pub catalog: Arc<MemCatalog>,
    pub warehouse: Arc<MockWarehouse>,
    pub store: Arc<MemObjectStore>,
    pub alerts: Arc<RecordingAlerts>,
}

pub fn world() -> World {
    let catalog = Arc::new(MemCatalog::new());
    let warehouse = Arc::new(MockWarehouse::new("proj"));
    let store = Arc::new(MemObjectStore::new("bucket"));
    let alerts = Arc::new(RecordingAlerts::new());

    let model = Model::new(
        catalog.clone(),
        warehouse.clone(),
        store.clone(),
        alerts.clone(),
        Arc::new(NullSheets),
        ModelConfig {
            allowed_domain: "example.com".to_string(),
            ..Default::default()
        },
    );

    World {
        model,
        catalog,
        warehouse,
        store,
        alerts,
    }
}

/// A summary table in dataset `ds`.
pub fn summary(name: &str, query: &str, freq_id: Option<i64>) -> Table {
    Table {
        user_id: 1,
        name: name.to_string(),
        dataset: "ds".to_string(),
        dataset_id: 1,
        query: query.to_string(),
        disposition: WriteDisposition::Replace,
        freq_id,
        ..Default::default()
    }
}

/// An import table reading from the given external database.
pub fn import(name: &str, import_db_id: i64, freq_id: Option<i64>) -> Table {
    Table {
        user_id: 1,
        name: name.to_string(),
        dataset: "ds".to_string(),
        dataset_id: 1,
        disposition: WriteDisposition::Append,
        id_column: "id".to_string(),
        import_db_id: Some(import_db_id),
        freq_id,
        ..Default::default()
    }
}

/// An external table with an upload timeout.
pub fn external(name: &str, tmout_secs: i64, freq_id: Option<i64>) -> Table {
    Table {
        user_id: 1,
        name: name.to_string(),
        dataset: "ds".to_string(),
        dataset_id: 1,
        external_tmout_secs: Some(tmout_secs),
        freq_id,
        ..Default::default()
    }
}

pub fn hours_condition(hours: &[u32]) -> Condition {
    Condition {
        hours: hours.iter().copied().collect::<BTreeSet<u32>>(),
        ..Default::default()
    }
}

/// Register a (never actually dialed) import database whose rows land
/// in `dataset`.
pub fn register_import_db(world: &World, dataset: &str) -> i64 {
    world.catalog.add_external_db(ExternalDb {
        id: 0,
        name: "ext".to_string(),
        dataset_id: 99,
        dataset: dataset.to_string(),
        driver: "postgres".parse().unwrap(),
        connect_str: "postgres://nowhere/void".to_string(),
        export: false,
    })
}

/// Wait until the condition holds, sleeping in small steps so paused
/// clocks auto-advance. Panics after the deadline.
pub async fn settle<F, Fut>(what: &str, deadline: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let steps = (deadline.as_millis() / 50).max(1);
    for _ in 0..steps {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never settled: {}", what);
}

/// Insert a table through the catalog, returning it with its id.
pub async fn add_table(world: &World, table: Table) -> Table {
    world.catalog.insert_table(&table).await.unwrap()
}
