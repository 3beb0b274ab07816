//! Run state and the report handed back to callers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::scope::VariableScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// SHA-256 of the script text
    pub digest: String,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps_executed: usize,
    pub loop_iterations: usize,
    pub tables_written: Vec<String>,
    pub variables: VariableScope,
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(digest: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            digest: digest.into(),
            state: JobState::Idle,
            started_at: None,
            finished_at: None,
            steps_executed: 0,
            loop_iterations: 0,
            tables_written: Vec::new(),
            variables: VariableScope::new(),
            error: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run: {}", self.run_id)?;
        writeln!(f, "Script: {}", self.digest)?;
        writeln!(f, "State: {}", self.state)?;
        if let Some(ms) = self.duration_ms() {
            writeln!(f, "Duration: {}ms", ms)?;
        }
        writeln!(f, "Steps executed: {}", self.steps_executed)?;
        writeln!(f, "Loop iterations: {}", self.loop_iterations)?;
        if !self.tables_written.is_empty() {
            writeln!(f, "Tables written: {}", self.tables_written.join(", "))?;
        }
        if !self.variables.is_empty() {
            writeln!(f, "\nVariables:")?;
            for (name, value) in self.variables.iter() {
                writeln!(f, "  {} = {}", name, value)?;
            }
        }
        if let Some(error) = &self.error {
            writeln!(f, "\nError:\n  {}", error)?;
        }
        Ok(())
    }
}
