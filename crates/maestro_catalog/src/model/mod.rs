//! Core persisted structures.

mod conf;
mod external_db;
mod freq;
mod job;
mod notification;
mod run;
mod table;
mod user;

pub use conf::{GitConf, OAuthConf, SlackConf, WarehouseConf};
pub use external_db::{DbDriver, ExternalDb};
pub use freq::Freq;
pub use job::{Job, JobKind, JobState};
pub use notification::Notification;
pub use run::Run;
pub use table::{Dataset, ExternalFormat, Table, TableKind, WriteDisposition};
pub use user::User;
