//! Streaming reader tests against a real PostgreSQL.
//!
//! Set MAESTRO_TEST_PG_URL to run, e.g.
//! `MAESTRO_TEST_PG_URL=postgres://localhost/maestro_test cargo test -p maestro_dbsync`.

use futures::StreamExt;
use sqlx::postgres::PgPool;

use maestro_dbsync::{ExternalPool, TableReader};
use maestro_sql::PrimitiveSelect;

async fn pool() -> Option<PgPool> {
    let url = match std::env::var("MAESTRO_TEST_PG_URL") {
        Ok(url) if !url.is_empty() => url,
        _ => {
            eprintln!("MAESTRO_TEST_PG_URL not set, skipping");
            return None;
        }
    };
    Some(PgPool::connect(&url).await.expect("connect"))
}

async fn seed(pool: &PgPool, table: &str, rows: i64) {
    sqlx::raw_sql(&format!(
        "DROP TABLE IF EXISTS {table};
         CREATE TABLE {table} (id BIGINT PRIMARY KEY, name TEXT, seen TIMESTAMPTZ);"
    ))
    .execute(pool)
    .await
    .unwrap();
    for i in 1..=rows {
        sqlx::query(&format!(
            "INSERT INTO {table} (id, name, seen) VALUES ($1, $2, now())"
        ))
        .bind(i)
        .bind(format!("row{}", i))
        .execute(pool)
        .await
        .unwrap();
    }
}

async fn drain(reader: &mut TableReader) -> String {
    let mut out = Vec::new();
    let stream = reader.take_stream();
    let mut stream = stream;
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn incremental_read_picks_up_after_last_id() {
    let pg = match pool().await {
        None => return,
        Some(p) => p,
    };
    seed(&pg, "reader_rows", 150).await;
    let ext = ExternalPool::Postgres(pg);

    let stmt = PrimitiveSelect::star("reader_rows");

    // Full read first.
    let mut reader = TableReader::start(&ext, &stmt, "id", "", None, 0).unwrap();
    let data = drain(&mut reader).await;
    let stats = reader.stats();
    assert_eq!(stats.rows, 150);
    assert_eq!(stats.last_id, "150");
    assert_eq!(data.lines().count(), 150);
    assert!(data.lines().next().unwrap().starts_with("1,row1,"));

    // Incremental read from the recorded high-water mark.
    let mut reader = TableReader::start(&ext, &stmt, "id", "100", None, 0).unwrap();
    let data = drain(&mut reader).await;
    let stats = reader.stats();
    assert_eq!(stats.rows, 50);
    assert_eq!(stats.last_id, "150");
    assert!(data.lines().next().unwrap().starts_with("101,"));

    // Nothing new: zero rows, the cursor stays put.
    let mut reader = TableReader::start(&ext, &stmt, "id", "150", None, 0).unwrap();
    let data = drain(&mut reader).await;
    let stats = reader.stats();
    assert_eq!(stats.rows, 0);
    assert_eq!(stats.last_id, "150");
    assert!(data.is_empty());
}

#[tokio::test]
async fn schema_inference_maps_native_types() {
    let pg = match pool().await {
        None => return,
        Some(p) => p,
    };
    seed(&pg, "schema_rows", 1).await;
    let ext = ExternalPool::Postgres(pg);

    let stmt = PrimitiveSelect::star("schema_rows");
    let schema = TableReader::warehouse_schema(&ext, &stmt).await.unwrap();

    let types: Vec<(&str, &str)> = schema
        .fields
        .iter()
        .map(|f| (f.name.as_str(), f.field_type.as_str()))
        .collect();
    assert_eq!(
        types,
        vec![("id", "INT64"), ("name", "STRING"), ("seen", "TIMESTAMP")]
    );
}
