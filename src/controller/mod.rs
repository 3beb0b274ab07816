//! # Job Controller
//!
//! Walks the step tree depth first in document order:
//!
//! - **Leaf**: interpolate `{name}` placeholders from the current scope,
//!   dispatch the query (local tables go to the local backend, a remote
//!   object to its endpoint), then feed the result to each sink in order.
//! - **Loop**: run the driver once, then run the body once per driver row
//!   with the parameter bound in a child scope. Child bindings are dropped at
//!   the end of each iteration except the accumulator, whose values are
//!   appended to a list in the enclosing scope. Each iteration starts
//!   without the accumulator, so `{batch_params}` inside a loop body does not
//!   see the values collected so far; it resolves only after the loop closes.
//!
//! Tables readable before the first step are the cached tables of earlier
//! runs and the named input tables. Anything else must be produced by an
//! earlier step of the same run.
//!
//! States are `Idle -> Running -> Completed | Failed`. The first error ends
//! the run. Tables and remote mutations made before the failure stay in
//! place; re-running a failed script may apply remote inserts again.

pub mod registry;
pub mod report;
pub mod scope;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bulk_data::BulkData;
use crate::error::{Endpoint, JobError};
use crate::executor::{Executor, Outcome, Request, Shape};
use crate::job::{BatchLoop, Job, Sink, StepDescriptor, StepNode};

pub use registry::LocalTableRegistry;
pub use report::{JobState, RunReport};
pub use scope::{Value, VariableScope};

/// Default name of the accumulator variable.
pub const DEFAULT_ACCUMULATOR: &str = "batch_params";

/// Executors a run dispatches to. Remote endpoints are optional; a script
/// that uses a missing one is rejected before anything runs.
pub struct Backends {
    pub local: Box<dyn Executor>,
    pub src: Option<Box<dyn Executor>>,
    pub dst: Option<Box<dyn Executor>>,
}

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub data_dir: PathBuf,
    pub accumulator: String,
    /// Reuse an existing cached table file instead of re-running its step
    pub reuse_cached: bool,
    /// Delete this run's scratch tables after a successful run
    pub cleanup_scratch: bool,
    /// Table files prepared outside sluice, readable from the first step
    pub inputs: Vec<String>,
    pub variables: VariableScope,
}

impl ControllerOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            accumulator: DEFAULT_ACCUMULATOR.to_string(),
            reuse_cached: false,
            cleanup_scratch: false,
            inputs: Vec::new(),
            variables: VariableScope::new(),
        }
    }

    pub fn accumulator(mut self, name: impl Into<String>) -> Self {
        self.accumulator = name.into();
        self
    }

    pub fn reuse_cached(mut self, reuse: bool) -> Self {
        self.reuse_cached = reuse;
        self
    }

    pub fn cleanup_scratch(mut self, cleanup: bool) -> Self {
        self.cleanup_scratch = cleanup;
        self
    }

    /// Register `name.csv` in the data directory as an input table.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    /// Seed the run with a binding.
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.set(name, value);
        self
    }
}

type NodesFuture<'a> = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'a>>;

pub struct JobController {
    job: Job,
    backends: Backends,
    registry: LocalTableRegistry,
    scope: VariableScope,
    accumulator: String,
    reuse_cached: bool,
    cleanup_scratch: bool,
    inputs: Vec<String>,
    report: RunReport,
}

impl JobController {
    pub fn new(job: Job, backends: Backends, options: ControllerOptions) -> Self {
        let report = RunReport::new(job.digest.clone());
        Self {
            registry: LocalTableRegistry::new(options.data_dir),
            scope: options.variables,
            accumulator: options.accumulator,
            reuse_cached: options.reuse_cached,
            cleanup_scratch: options.cleanup_scratch,
            inputs: options.inputs,
            job,
            backends,
            report,
        }
    }

    pub fn state(&self) -> JobState {
        self.report.state
    }

    pub fn scope(&self) -> &VariableScope {
        &self.scope
    }

    pub fn registry(&self) -> &LocalTableRegistry {
        &self.registry
    }

    /// Report of the run so far; complete once `run` returns.
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Run the job once.
    pub async fn run(&mut self) -> Result<RunReport, JobError> {
        if self.report.state != JobState::Idle {
            return Err(JobError::Config(format!(
                "job already {}; a controller runs once",
                self.report.state
            )));
        }

        self.report.state = JobState::Running;
        self.report.started_at = Some(Utc::now());
        let span = info_span!("job", run_id = %self.report.run_id);

        let result = self.execute().instrument(span.clone()).await;

        let _enter = span.enter();
        self.report.finished_at = Some(Utc::now());
        self.report.tables_written = self.registry.written();
        self.report.variables = self.scope.clone();
        match result {
            Ok(()) => {
                self.report.state = JobState::Completed;
                info!(
                    steps = self.report.steps_executed,
                    iterations = self.report.loop_iterations,
                    duration_ms = self.report.duration_ms().unwrap_or_default(),
                    "Job completed"
                );
                Ok(self.report.clone())
            }
            Err(err) => {
                self.report.state = JobState::Failed;
                self.report.error = Some(err.to_string());
                warn!(error = %err, line = err.line(), "Job failed");
                Err(err)
            }
        }
    }

    async fn execute(&mut self) -> Result<(), JobError> {
        self.preflight()?;
        let found = self.registry.discover(&self.inputs)?;
        info!(
            data_dir = %self.registry.dir().display(),
            existing_tables = found,
            "Job started"
        );

        let nodes = std::mem::take(&mut self.job.nodes);
        let mut scope = std::mem::take(&mut self.scope);
        let result = self.run_nodes(&nodes, &mut scope).await;
        self.job.nodes = nodes;
        self.scope = scope;
        result?;

        if self.cleanup_scratch {
            let removed = self.registry.cleanup_scratch()?;
            if !removed.is_empty() {
                info!(tables = %removed.join(","), "Removed scratch tables");
            }
        }
        Ok(())
    }

    /// Every remote endpoint the script touches must be configured.
    fn preflight(&self) -> Result<(), JobError> {
        for step in self.job.descriptors() {
            let mut needed = Vec::new();
            if let Some((endpoint, _)) = step.remote_source() {
                needed.push(endpoint);
            }
            if step.has_remote_sink() {
                needed.push(Endpoint::Dst);
            }
            for endpoint in needed {
                if self.endpoint_ref(endpoint).is_none() {
                    return Err(JobError::Config(format!(
                        "line {} uses remote endpoint '{}', which is not configured",
                        step.line, endpoint
                    )));
                }
            }
        }
        Ok(())
    }

    fn endpoint_ref(&self, endpoint: Endpoint) -> Option<&dyn Executor> {
        match endpoint {
            Endpoint::Src => self.backends.src.as_deref(),
            Endpoint::Dst => self.backends.dst.as_deref(),
        }
    }

    fn endpoint(&mut self, endpoint: Endpoint) -> Result<&mut Box<dyn Executor>, JobError> {
        let slot = match endpoint {
            Endpoint::Src => &mut self.backends.src,
            Endpoint::Dst => &mut self.backends.dst,
        };
        slot.as_mut().ok_or_else(|| {
            JobError::Config(format!("remote endpoint '{}' is not configured", endpoint))
        })
    }

    /* ===================== Tree Walk ===================== */

    fn run_nodes<'a>(&'a mut self, nodes: &'a [StepNode], scope: &'a mut VariableScope) -> NodesFuture<'a> {
        Box::pin(async move {
            for node in nodes {
                match node {
                    StepNode::Leaf(step) => {
                        let shape = if step.wants_scalar() {
                            Shape::Scalar
                        } else {
                            Shape::Table
                        };
                        self.run_leaf(step, scope, shape).await?;
                    }
                    StepNode::Loop(batch) => self.run_loop(batch, scope).await?,
                }
            }
            Ok(())
        })
    }

    async fn run_loop(&mut self, batch: &BatchLoop, scope: &mut VariableScope) -> Result<(), JobError> {
        let driver = self
            .run_leaf(&batch.driver, scope, Shape::Table)
            .await?
            .map(Outcome::into_table)
            .unwrap_or_default();

        let column = driver.column_index(&batch.param).unwrap_or(0);
        info!(
            loop_id = %batch.loop_id,
            param = %batch.param,
            line = batch.driver.line,
            iterations = driver.len(),
            "Batch loop started"
        );

        for (idx, row) in driver.rows().iter().enumerate() {
            let value = row.get(column).cloned().unwrap_or_default();
            let mut child = scope.child(&self.accumulator);
            child.set(batch.param.clone(), value.clone());
            if batch.loop_id != batch.param {
                child.set(batch.loop_id.clone(), value.clone());
            }
            info!(loop_id = %batch.loop_id, iteration = idx + 1, value = %value, "Batch iteration");

            self.run_nodes(&batch.body, &mut child).await?;
            scope.absorb(child, &self.accumulator);
            self.report.loop_iterations += 1;
        }

        debug!(loop_id = %batch.loop_id, "Batch loop finished");
        Ok(())
    }

    /// Execute one step and apply its sinks. Marker-only lines do nothing.
    async fn run_leaf(
        &mut self,
        step: &StepDescriptor,
        scope: &mut VariableScope,
        shape: Shape,
    ) -> Result<Option<Outcome>, JobError> {
        if !step.has_query() {
            return Ok(None);
        }
        info!(line = step.line, "Running step");

        let outcome = self
            .produce(step, scope, shape)
            .await
            .map_err(|e| e.at_step(step))?;
        self.report.steps_executed += 1;
        self.apply_sinks(step, &outcome, scope)
            .await
            .map_err(|e| e.at_step(step))?;
        Ok(Some(outcome))
    }

    async fn produce(
        &mut self,
        step: &StepDescriptor,
        scope: &VariableScope,
        shape: Shape,
    ) -> Result<Outcome, JobError> {
        if self.reuse_cached {
            if let Some(name) = self.reusable_sink(step) {
                info!(line = step.line, table = %name, "Reusing cached table");
                return Ok(Outcome::Table(self.registry.load(&name)?));
            }
        }

        let sql = scope.interpolate(&step.query);
        let unresolved = scope.unresolved(&step.query);
        if !unresolved.is_empty() {
            debug!(line = step.line, names = %unresolved.join(","), "Placeholders left unresolved");
        }
        debug!(line = step.line, sql = %sql, "Dispatching query");

        match step.remote_source() {
            Some((endpoint, object)) => {
                self.endpoint(endpoint)?
                    .execute(Request::Query {
                        sql: &sql,
                        object: Some(object),
                        imports: &[],
                        shape,
                    })
                    .await
            }
            None => {
                let imports = self.registry.resolve(step.local_sources(), step)?;
                self.backends
                    .local
                    .execute(Request::Query {
                        sql: &sql,
                        object: None,
                        imports: &imports,
                        shape,
                    })
                    .await
            }
        }
    }

    fn reusable_sink(&self, step: &StepDescriptor) -> Option<String> {
        step.sinks.iter().find_map(|sink| match sink {
            Sink::LocalTable { name, cached: true } if self.registry.reusable(name) => {
                Some(name.clone())
            }
            _ => None,
        })
    }

    async fn apply_sinks(
        &mut self,
        step: &StepDescriptor,
        outcome: &Outcome,
        scope: &mut VariableScope,
    ) -> Result<(), JobError> {
        for sink in &step.sinks {
            match sink {
                Sink::LocalTable { name, cached } => {
                    let data = outcome.clone().into_table();
                    self.registry.store(name, &data, *cached)?;
                    info!(line = step.line, table = %name, rows = data.len(), cached = *cached, "Wrote local table");
                }
                Sink::Variable { name } => {
                    let value = outcome.clone().into_scalar().unwrap_or_default();
                    if value.is_empty() {
                        warn!(line = step.line, variable = %name, "Query returned no value; binding empty string");
                    }
                    debug!(line = step.line, variable = %name, value = %value, "Bound variable");
                    scope.set(name.clone(), value);
                }
                Sink::RemoteObject {
                    object,
                    op,
                    new_ids_table,
                } => {
                    let rows: BulkData = outcome.clone().into_table();
                    let result = self
                        .endpoint(Endpoint::Dst)?
                        .execute(Request::Mutate {
                            op: *op,
                            object,
                            rows: &rows,
                        })
                        .await?
                        .into_table();
                    info!(line = step.line, object = %object, op = op.as_str(), rows = rows.len(), "Applied remote mutation");
                    if let Some(ids_table) = new_ids_table {
                        self.registry.store(ids_table, &result, false)?;
                    }
                }
            }
        }
        Ok(())
    }
}
