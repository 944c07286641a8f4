//! An in-memory object store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use maestro_warehouse::{
    parse_store_uri, ByteStream, ObjectStore, StoredObject, WarehouseError,
};

/// Objects live in a map; uploads consume their stream to completion
/// just like the real store does.
pub struct MemObjectStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, name: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), data);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn insert(&self, name: &str, mut media: ByteStream) -> Result<StoredObject, WarehouseError> {
        let mut data = Vec::new();
        while let Some(chunk) = media.next().await {
            let chunk = chunk.map_err(|err| WarehouseError::Store(err.to_string()))?;
            data.extend_from_slice(&chunk);
        }
        let size = data.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), data);
        Ok(StoredObject {
            name: name.to_string(),
            self_link: self.url_for_name(name),
            size,
        })
    }

    async fn reader(&self, name: &str) -> Result<ByteStream, WarehouseError> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| WarehouseError::Store(format!("no such object: {}", name)))?;
        Ok(futures::stream::once(async move { Ok(Bytes::from(data)) }).boxed())
    }

    async fn delete_files(&self, uris: &[String]) -> Result<(), WarehouseError> {
        // Validate the whole batch before touching anything.
        let mut names = Vec::with_capacity(uris.len());
        for uri in uris {
            let (bucket, name) = parse_store_uri(uri)?;
            if bucket != self.bucket {
                return Err(WarehouseError::WrongBucket(bucket, self.bucket.clone()));
            }
            names.push(name);
        }
        let mut objects = self.objects.lock().unwrap();
        for name in names {
            objects.remove(&name);
        }
        Ok(())
    }

    fn url_for_name(&self, name: &str) -> String {
        format!("gs://{}/{}", self.bucket, name)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
