//! Local backend: SQL over delimited-file tables.
//!
//! Each request becomes one [`LocalScript`] (imports, output mode, query) run
//! by a [`SqlEngine`] on a blocking thread. A nonzero exit status is an
//! execution error; otherwise stdout is parsed as a table or a single value.

mod engine;
mod script;


use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Executor, Outcome, Request, Shape};
use crate::bulk_data::{parse_records, BulkData};
use crate::error::{Backend, JobError};

pub use engine::{EmbeddedSqlite, EngineOutput, SqlEngine, Sqlite3Shell};
pub use script::LocalScript;

pub struct LocalExecutor {
    engine: Arc<dyn SqlEngine>,
}

impl LocalExecutor {
    pub fn new(engine: impl SqlEngine + 'static) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }
}

fn failed(message: impl Into<String>) -> JobError {
    JobError::execution(Backend::Local, message)
}

#[async_trait]
impl Executor for LocalExecutor {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    async fn execute(&mut self, request: Request<'_>) -> Result<Outcome, JobError> {
        let Request::Query {
            sql,
            imports,
            shape,
            ..
        } = request
        else {
            return Err(failed("remote mutations cannot run on the local backend"));
        };

        let script = LocalScript::new(imports, shape == Shape::Table, sql);
        debug!(engine = self.engine.name(), script = %script.render(), "Running local script");

        let engine = Arc::clone(&self.engine);
        let output = tokio::task::spawn_blocking(move || engine.run(&script))
            .await
            .map_err(|e| failed(format!("engine task failed: {}", e)))?
            .map_err(|e| failed(format!("cannot start {} engine: {}", self.engine.name(), e)))?;

        if output.status != 0 {
            return Err(failed(format!(
                "engine exited with status {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        match shape {
            Shape::Table => BulkData::from_csv(&output.stdout)
                .map(Outcome::Table)
                .map_err(|e| failed(format!("unreadable engine output: {}", e))),
            Shape::Scalar => {
                let records = parse_records(&output.stdout)
                    .map_err(|e| failed(format!("unreadable engine output: {}", e)))?;
                let value = records
                    .into_iter()
                    .next()
                    .and_then(|record| record.into_iter().next())
                    .unwrap_or_default();
                Ok(Outcome::Scalar(value))
            }
        }
    }
}
