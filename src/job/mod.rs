//! Job scripts: parsing lines into step descriptors and grouping them into a
//! step tree.
//!
//! A script is line oriented. Each logical line is a query followed by one or
//! more `=>`-chained segments:
//!
//! ```text
//! SELECT Id, Name FROM src.Account; => csv:accounts:cache
//! SELECT Id FROM csv.accounts LIMIT 1; => var:first_id
//! SELECT i FROM csv.ints; => batch_begin:i:PARAM
//! SELECT v FROM csv.values WHERE i = {PARAM}; => var:v
//! => batch_end:PARAM
//! ```
//!
//! Parsing is two passes: [`syntax::parse_lines`] turns lines into a flat list
//! of [`StepDescriptor`]s, then [`tree::build_tree`] folds batch markers into a
//! recursive [`StepNode`] tree. Both run before any step executes.

pub mod syntax;
pub mod tree;


use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Endpoint, Result};

pub use syntax::{parse_lines, prepare_lines, LogicalLine};
pub use tree::{build_tree, BatchLoop, StepNode};

/* ===================== Step Descriptor ===================== */

/// Remote mutation kind for a `dst:{op}:{object}` sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Insert,
    Update,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Insert => "insert",
            MutationOp::Update => "update",
        }
    }
}

/// Where a step's result goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Sink {
    /// `csv:{name}[:cache]`
    LocalTable { name: String, cached: bool },
    /// `var:{name}`
    Variable { name: String },
    /// `dst:{op}:{object}[:{new_ids_table}]`
    RemoteObject {
        object: String,
        op: MutationOp,
        new_ids_table: Option<String>,
    },
}

/// Where a step's query reads from, inferred from qualified table references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Source {
    /// `csv.<name>` references, deduplicated in first-seen order.
    LocalTables { names: Vec<String> },
    /// A single `src.<name>` or `dst.<name>` reference.
    RemoteObject { endpoint: Endpoint, object: String },
}

/// Batch loop marker carried by a line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "type")]
pub enum LoopMarker {
    #[default]
    None,
    /// `batch_begin:{param}:{loop_id}`
    Begin { param: String, loop_id: String },
    /// `batch_end:{loop_id}`
    End { loop_id: String },
}

/// One parsed script line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDescriptor {
    /// 1-based physical line where the logical line starts
    pub line: usize,
    /// Query text with source qualifiers stripped; empty for marker-only lines
    pub query: String,
    pub sinks: Vec<Sink>,
    pub source: Option<Source>,
    pub marker: LoopMarker,
    pub raw_line: String,
}

impl StepDescriptor {
    pub fn has_query(&self) -> bool {
        !self.query.is_empty()
    }

    /// Local tables the query reads, if any.
    pub fn local_sources(&self) -> &[String] {
        match &self.source {
            Some(Source::LocalTables { names }) => names,
            _ => &[],
        }
    }

    /// Remote endpoint the query runs against, if it reads a remote object.
    pub fn remote_source(&self) -> Option<(Endpoint, &str)> {
        match &self.source {
            Some(Source::RemoteObject { endpoint, object }) => Some((*endpoint, object)),
            _ => None,
        }
    }

    pub fn has_remote_sink(&self) -> bool {
        self.sinks
            .iter()
            .any(|s| matches!(s, Sink::RemoteObject { .. }))
    }

    /// A step whose only sink is a variable needs a single value, not a table.
    pub fn wants_scalar(&self) -> bool {
        matches!(self.sinks.as_slice(), [Sink::Variable { .. }])
            && !matches!(self.marker, LoopMarker::Begin { .. })
    }
}

/* ===================== Job ===================== */

/// A fully parsed script, ready to hand to the job controller.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub nodes: Vec<StepNode>,
    /// Hex SHA-256 of the script text
    pub digest: String,
}

impl Job {
    /// Parse and resolve a whole script. Nothing executes if this fails.
    pub fn parse(script: &str) -> Result<Self> {
        let lines: Vec<&str> = script.lines().collect();
        Self::from_lines(&lines)
    }

    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self> {
        let descriptors = parse_lines(lines)?;
        let nodes = build_tree(descriptors)?;

        let mut hasher = Sha256::new();
        for line in lines {
            hasher.update(line.as_ref().as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        Ok(Self { nodes, digest })
    }

    /// Visit every descriptor in the tree in document order, drivers included.
    pub fn descriptors(&self) -> Vec<&StepDescriptor> {
        fn walk<'a>(nodes: &'a [StepNode], out: &mut Vec<&'a StepDescriptor>) {
            for node in nodes {
                match node {
                    StepNode::Leaf(step) => out.push(step),
                    StepNode::Loop(batch) => {
                        out.push(&batch.driver);
                        walk(&batch.body, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }
}
