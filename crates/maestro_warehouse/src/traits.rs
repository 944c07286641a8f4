//! Capability traits the core calls on external systems.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::{JobConfiguration, TableSchema};
use crate::status::WarehouseJob;
use crate::WarehouseError;

/// A lazy stream of bytes; uploads consume it to completion, downloads
/// produce one. Backpressure falls out of the stream contract - nothing
/// buffers a whole extract.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Size and shape of a warehouse table.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub schema: TableSchema,
    pub num_rows: u64,
    pub num_bytes: i64,
}

/// What the core needs from the analytical store.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Submit a job; the returned record carries the server-assigned id.
    async fn start_job(&self, conf: &JobConfiguration) -> Result<WarehouseJob, WarehouseError>;

    /// Fetch a job by its server-side id, statistics and status included.
    async fn get_job(&self, job_id: &str) -> Result<WarehouseJob, WarehouseError>;

    /// Schema and size of a table.
    async fn get_table(&self, dataset: &str, table: &str) -> Result<TableInfo, WarehouseError>;

    /// A cryptographically signed, authentication-free URL for an object
    /// in the extract bucket. Valid for the configured expiry.
    async fn signed_storage_url(
        &self,
        filename: &str,
        method: &str,
    ) -> Result<String, WarehouseError>;

    fn project_id(&self) -> &str;
}

/// An object created in the store.
#[derive(Debug, Clone, Default)]
pub struct StoredObject {
    pub name: String,
    pub self_link: String,
    pub size: u64,
}

/// What the core needs from cloud object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create an object by consuming `media` to completion.
    async fn insert(&self, name: &str, media: ByteStream) -> Result<StoredObject, WarehouseError>;

    /// Stream an object's content.
    async fn reader(&self, name: &str) -> Result<ByteStream, WarehouseError>;

    /// Delete objects given fully qualified store URIs. A URI pointing
    /// at a foreign bucket fails the whole batch.
    async fn delete_files(&self, uris: &[String]) -> Result<(), WarehouseError>;

    /// Fully qualified store URI for an object name.
    fn url_for_name(&self, name: &str) -> String;

    fn bucket(&self) -> &str;
}
