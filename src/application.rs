//! Wiring from configuration to a runnable job controller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::{Config, EngineKind};
use crate::controller::{Backends, JobController, VariableScope};
use crate::error::Endpoint;
use crate::executor::remote::{BulkTransport, HttpBulkTransport};
use crate::executor::{EmbeddedSqlite, Executor, LocalExecutor, RemoteExecutor, Sqlite3Shell};
use crate::job::Job;

/// The sluice application: configuration plus the factories that turn it
/// into executors.
pub struct Application {
    pub config: Config,
}

impl Application {
    /// Pure instantiation; nothing connects until a job runs.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read and parse a script file.
    pub fn load_job(path: &Path) -> Result<Job> {
        let script = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        Job::parse(&script).with_context(|| format!("Invalid script {}", path.display()))
    }

    pub fn local_executor(&self) -> LocalExecutor {
        match self.config.local.engine {
            EngineKind::Embedded => LocalExecutor::new(EmbeddedSqlite),
            EngineKind::Sqlite3 => LocalExecutor::new(Sqlite3Shell::new(&self.config.local.sqlite3_path)),
        }
    }

    fn remote_executor(&self, endpoint: Endpoint, name: Option<&str>) -> Result<Option<Box<dyn Executor>>> {
        let Some(settings) = self.config.remote.endpoint(name)? else {
            return Ok(None);
        };
        debug!(%endpoint, name = name.unwrap_or_default(), login_url = %settings.login_url, "Configured remote endpoint");
        let transport: Arc<dyn BulkTransport> = Arc::new(HttpBulkTransport::new(
            settings.credentials(),
            Duration::from_secs(self.config.bulk.http_timeout_secs),
        ));
        Ok(Some(Box::new(RemoteExecutor::new(
            endpoint,
            transport,
            self.config.bulk.settings(),
        ))))
    }

    /// Executors for one run.
    pub fn backends(&self) -> Result<Backends> {
        Ok(Backends {
            local: Box::new(self.local_executor()),
            src: self.remote_executor(Endpoint::Src, self.config.remote.src.as_deref())?,
            dst: self.remote_executor(Endpoint::Dst, self.config.remote.dst.as_deref())?,
        })
    }

    /// A controller for `job`, seeded with `variables`.
    pub fn controller(&self, job: Job, variables: VariableScope) -> Result<JobController> {
        let mut options = self.config.controller_options();
        for (name, value) in variables.iter() {
            options = options.variable(name.clone(), value.clone());
        }
        Ok(JobController::new(job, self.backends()?, options))
    }
}
