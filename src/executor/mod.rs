//! Executor abstraction: one call runs one step's work on one backend.
//!
//! The controller owns interpolation and bookkeeping. An executor receives a
//! fully substituted request, performs exactly that operation once, and
//! returns either a table or a single value. It never sees the variable
//! scope.

pub mod local;
pub mod remote;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::bulk_data::BulkData;
use crate::error::{Backend, JobError};
use crate::job::MutationOp;

pub use local::{EmbeddedSqlite, LocalExecutor, LocalScript, SqlEngine, Sqlite3Shell};
pub use remote::{BulkSettings, RemoteExecutor};

/// Whether the caller wants a whole table or just the first value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Table,
    Scalar,
}

/// A local table handed to the SQL engine: its name and backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTable {
    pub name: String,
    pub path: PathBuf,
}

/// One unit of backend work.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    /// Run a query. Local backends import `imports` first; remote backends
    /// query `object`.
    Query {
        sql: &'a str,
        object: Option<&'a str>,
        imports: &'a [LocalTable],
        shape: Shape,
    },
    /// Insert or update `rows` into a remote object.
    Mutate {
        op: MutationOp,
        object: &'a str,
        rows: &'a BulkData,
    },
}

/// Result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Table(BulkData),
    Scalar(String),
}

impl Outcome {
    /// View any outcome as a table. A scalar becomes a one-cell table.
    pub fn into_table(self) -> BulkData {
        match self {
            Outcome::Table(data) => data,
            Outcome::Scalar(value) => {
                BulkData::new(vec!["value".to_string()], vec![vec![value]]).unwrap_or_default()
            }
        }
    }

    /// First value of the outcome, if there is one.
    pub fn into_scalar(self) -> Option<String> {
        match self {
            Outcome::Scalar(value) => Some(value),
            Outcome::Table(data) => data.first_value().map(str::to_string),
        }
    }
}

#[async_trait]
pub trait Executor: Send {
    fn backend(&self) -> Backend;

    async fn execute(&mut self, request: Request<'_>) -> Result<Outcome, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_outcome_as_table() {
        let table = Outcome::Scalar("42".to_string()).into_table();
        assert_eq!(table.fields(), &["value".to_string()]);
        assert_eq!(table.first_value(), Some("42"));
    }

    #[test]
    fn test_table_outcome_as_scalar() {
        let data = BulkData::new(
            vec!["a".into(), "b".into()],
            vec![vec!["1".into(), "2".into()], vec!["3".into(), "4".into()]],
        )
        .unwrap();
        assert_eq!(Outcome::Table(data).into_scalar(), Some("1".to_string()));
        assert_eq!(Outcome::Table(BulkData::empty()).into_scalar(), None);
    }
}
