//! Shared test doubles: an in-memory catalog, a scripted warehouse, an
//! in-memory object store and a recording alert sink.

mod catalog;
mod store;
mod warehouse;

pub use catalog::MemCatalog;
pub use store::MemObjectStore;
pub use warehouse::{MockWarehouse, Outcome};

use async_trait::async_trait;
use std::sync::Mutex;

use maestro_core::AlertSink;

/// Collects alert messages for assertions.
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    messages: Mutex<Vec<String>>,
}

impl RecordingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn alert(&self, msg: &str) {
        self.messages.lock().unwrap().push(msg.to_string());
    }
}
