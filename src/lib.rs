pub mod application;
pub mod bulk_data;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod job;
pub mod logging;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use application::Application;
pub use bulk_data::BulkData;
pub use controller::{ControllerOptions, JobController, JobState, RunReport, VariableScope};
pub use error::{Backend, Endpoint, JobError};
pub use job::Job;
