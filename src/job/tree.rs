//! Batch-scope resolver: folds `batch_begin`/`batch_end` markers in the flat
//! descriptor list into a recursive step tree.
//!
//! Grouping is stack based. A `Begin` marker opens a loop whose driver is the
//! marker's own step, or the step just before it when the marker line has no
//! query. Following steps land in the innermost open loop until its `End`
//! marker, which is kept as the last leaf of the body.

use serde::Serialize;

use super::{LoopMarker, StepDescriptor};
use crate::error::{JobError, Result};

/// Node of the step tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum StepNode {
    Leaf(StepDescriptor),
    Loop(BatchLoop),
}

/// A batch loop: the driver's rows are iterated, running `body` once per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchLoop {
    pub param: String,
    pub loop_id: String,
    pub driver: StepDescriptor,
    pub body: Vec<StepNode>,
}

struct OpenLoop {
    line: usize,
    param: String,
    loop_id: String,
    driver: StepDescriptor,
    body: Vec<StepNode>,
}

/// Build the step tree from descriptors in document order.
pub fn build_tree(steps: Vec<StepDescriptor>) -> Result<Vec<StepNode>> {
    let mut root: Vec<StepNode> = Vec::new();
    let mut open: Vec<OpenLoop> = Vec::new();

    for step in steps {
        match step.marker.clone() {
            LoopMarker::None => current(&mut root, &mut open).push(StepNode::Leaf(step)),

            LoopMarker::Begin { param, loop_id } => {
                if open.iter().any(|l| l.loop_id == loop_id) {
                    return Err(JobError::structure(
                        step.line,
                        format!("batch_begin:{} reuses the id of a loop that is still open", loop_id),
                    ));
                }
                let line = step.line;
                let driver = if step.has_query() {
                    step
                } else {
                    detach_driver(current(&mut root, &mut open), line, &loop_id)?
                };
                open.push(OpenLoop {
                    line,
                    param,
                    loop_id,
                    driver,
                    body: Vec::new(),
                });
            }

            LoopMarker::End { loop_id } => {
                let Some(mut innermost) = open.pop() else {
                    return Err(JobError::structure(
                        step.line,
                        format!("batch_end:{} closes a loop that was never opened", loop_id),
                    ));
                };
                if innermost.loop_id != loop_id {
                    return Err(JobError::structure(
                        step.line,
                        format!(
                            "batch_end:{} crosses open loop '{}' opened at line {}",
                            loop_id, innermost.loop_id, innermost.line
                        ),
                    ));
                }
                innermost.body.push(StepNode::Leaf(step));
                let closed = StepNode::Loop(BatchLoop {
                    param: innermost.param,
                    loop_id: innermost.loop_id,
                    driver: innermost.driver,
                    body: innermost.body,
                });
                current(&mut root, &mut open).push(closed);
            }
        }
    }

    if let Some(unclosed) = open.last() {
        return Err(JobError::structure(
            unclosed.line,
            format!("batch_begin:{} is never closed", unclosed.loop_id),
        ));
    }

    Ok(root)
}

fn current<'a>(root: &'a mut Vec<StepNode>, open: &'a mut [OpenLoop]) -> &'a mut Vec<StepNode> {
    match open.last_mut() {
        Some(innermost) => &mut innermost.body,
        None => root,
    }
}

/// Take the step preceding a query-less `batch_begin` as the loop driver.
fn detach_driver(nodes: &mut Vec<StepNode>, line: usize, loop_id: &str) -> Result<StepDescriptor> {
    match nodes.pop() {
        Some(StepNode::Leaf(step)) if step.has_query() && step.marker == LoopMarker::None => Ok(step),
        Some(other) => {
            nodes.push(other);
            Err(JobError::structure(
                line,
                format!("batch_begin:{} must follow a plain query step to drive it", loop_id),
            ))
        }
        None => Err(JobError::structure(
            line,
            format!("batch_begin:{} has no preceding step to drive it", loop_id),
        )),
    }
}
