//! External import/export database registrations.

use std::fmt;
use std::str::FromStr;

/// Driver of an external relational database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbDriver {
    Postgres,
    Mysql,
}

impl DbDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbDriver::Postgres => "postgres",
            DbDriver::Mysql => "mysql",
        }
    }
}

impl fmt::Display for DbDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DbDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(DbDriver::Postgres),
            "mysql" => Ok(DbDriver::Mysql),
            _ => Err(format!("Unsupported driver: {}", s)),
        }
    }
}

/// Connection details for an external database rows are imported from
/// or exported to. The connect string may contain a single `%s`
/// placeholder which the catalog substitutes with the decrypted secret
/// when the full record is selected.
#[derive(Debug, Clone)]
pub struct ExternalDb {
    pub id: i64,
    pub name: String,
    /// Imported rows land in this warehouse dataset.
    pub dataset_id: i64,
    pub dataset: String,
    pub driver: DbDriver,
    pub connect_str: String,
    pub export: bool,
}
