//! The Maestro core: run scheduling, dependency resolution and the job
//! lifecycle.
//!
//! Everything here happens through a [`Model`], which aggregates the
//! catalog, the warehouse and object-store capabilities, the alert sink
//! and the process-local in-flight state (import statuses and external
//! waits). Work runs as tokio tasks: per-frequency tickers trigger
//! runs, a run coordinator advances each run every few seconds, one
//! monitor task polls each submitted warehouse job, and a fixed worker
//! pool streams external-database imports into object storage.

mod alert;
mod export;
mod external;
mod imports;
mod model;
mod monitor;
mod notify;
mod run;
mod sheets;
mod ticker;

pub use alert::{AlertSink, NullAlerts, SlackAlerts};
pub use external::format_duration_go;
pub use imports::ImportStatus;
pub use model::{Model, ModelConfig};
pub use monitor::monitor_job;
pub use notify::signed_extract_urls;
pub use run::{assemble_run, process_cycle, resume_run, start_run};
pub use sheets::{NullSheets, SheetSink};
pub use ticker::RunTick;
