//! Job syntax parser: raw script lines to flat step descriptors.
//!
//! Handles line continuation, comments, sink segments, loop markers and
//! source inference. Loop grouping is left to [`super::tree`].

use std::borrow::Cow;
use std::sync::LazyLock;

use pest::Parser;
use pest_derive::Parser;
use regex::Regex;

use super::{LoopMarker, MutationOp, Sink, Source, StepDescriptor};
use crate::error::{Endpoint, JobError, Result};

#[derive(Parser)]
#[grammar = "job/job.pest"]
struct JobLineParser;

static QUALIFIED_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(csv|src|dst)\.([A-Za-z_][A-Za-z0-9_]*)").expect("valid qualifier regex")
});

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid name regex"));

/* ===================== Line Joining ===================== */

/// A line after continuation joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    /// 1-based number of the first physical line
    pub number: usize,
    pub text: String,
}

/// Join lines ending in a backslash with the line that follows.
///
/// The backslash is dropped and the pieces are joined with a single space.
pub fn prepare_lines<S: AsRef<str>>(lines: &[S]) -> Vec<LogicalLine> {
    let mut out = Vec::new();
    let mut pending: Option<LogicalLine> = None;

    for (idx, raw) in lines.iter().enumerate() {
        let raw = raw.as_ref().trim_end();
        let (body, continues) = match raw.strip_suffix('\\') {
            Some(body) => (body.trim_end(), true),
            None => (raw, false),
        };

        match pending.as_mut() {
            Some(line) => {
                let piece = body.trim_start();
                if !piece.is_empty() {
                    if !line.text.is_empty() {
                        line.text.push(' ');
                    }
                    line.text.push_str(piece);
                }
            }
            None => {
                pending = Some(LogicalLine {
                    number: idx + 1,
                    text: body.to_string(),
                })
            }
        }

        if !continues {
            out.extend(pending.take());
        }
    }

    // a trailing backslash on the last line just ends the script
    out.extend(pending.take());
    out
}

/* ===================== Descriptor Parsing ===================== */

/// Parse script lines into step descriptors, in document order.
///
/// Comment lines (`--`) are dropped unless they carry a loop marker. A
/// `batch_end` whose id is not currently open is a syntax error; crossed or
/// unclosed loops are reported by [`super::tree::build_tree`].
pub fn parse_lines<S: AsRef<str>>(lines: &[S]) -> Result<Vec<StepDescriptor>> {
    let mut open_loops: Vec<String> = Vec::new();
    let mut steps = Vec::new();

    for line in prepare_lines(lines) {
        if let Some(step) = parse_line(&line, &mut open_loops)? {
            steps.push(step);
        }
    }

    Ok(steps)
}

struct Segment {
    kind: String,
    fields: Vec<String>,
}

fn parse_line(line: &LogicalLine, open_loops: &mut Vec<String>) -> Result<Option<StepDescriptor>> {
    let text = line.text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let is_comment = text.starts_with("--");
    let fail = |message: String| JobError::syntax(line.number, text, message);

    let (raw_query, segments) = match split_line(text) {
        Ok(parts) => parts,
        // comment bodies are free text
        Err(_) if is_comment => return Ok(None),
        Err(message) => return Err(fail(message)),
    };

    let mut sinks = Vec::new();
    let mut marker = LoopMarker::None;

    for segment in segments {
        if is_comment && !segment.kind.starts_with("batch_") {
            continue;
        }
        let fields: Vec<&str> = segment.fields.iter().map(String::as_str).collect();
        if let Some(bad) = fields.iter().find(|f| !NAME_RE.is_match(f)) {
            return Err(fail(format!(
                "invalid name '{}' in '{}' segment",
                bad, segment.kind
            )));
        }

        match (segment.kind.as_str(), fields.as_slice()) {
            ("batch_begin" | "batch_end", _) if marker != LoopMarker::None => {
                return Err(fail("a line may carry only one loop marker".to_string()));
            }
            ("batch_begin", [param, loop_id]) => {
                open_loops.push(loop_id.to_string());
                marker = LoopMarker::Begin {
                    param: param.to_string(),
                    loop_id: loop_id.to_string(),
                };
            }
            ("batch_end", [loop_id]) => {
                match open_loops.iter().rposition(|id| id == loop_id) {
                    Some(pos) => {
                        open_loops.remove(pos);
                    }
                    None => {
                        return Err(fail(format!(
                            "batch_end:{} has no open batch_begin",
                            loop_id
                        )))
                    }
                }
                marker = LoopMarker::End {
                    loop_id: loop_id.to_string(),
                };
            }
            ("csv", [name]) => push_sink(
                &mut sinks,
                Sink::LocalTable {
                    name: name.to_string(),
                    cached: false,
                },
            )
            .map_err(fail)?,
            ("csv", [name, "cache"]) => push_sink(
                &mut sinks,
                Sink::LocalTable {
                    name: name.to_string(),
                    cached: true,
                },
            )
            .map_err(fail)?,
            ("var", [name]) => push_sink(
                &mut sinks,
                Sink::Variable {
                    name: name.to_string(),
                },
            )
            .map_err(fail)?,
            ("dst", [op, object, rest @ ..]) if rest.len() <= 1 => {
                let op = match *op {
                    "insert" => MutationOp::Insert,
                    "update" => MutationOp::Update,
                    other => return Err(fail(format!("unrecognized dst operation '{}'", other))),
                };
                push_sink(
                    &mut sinks,
                    Sink::RemoteObject {
                        object: object.to_string(),
                        op,
                        new_ids_table: rest.first().map(|s| s.to_string()),
                    },
                )
                .map_err(fail)?;
            }
            (kind @ ("batch_begin" | "batch_end" | "csv" | "var" | "dst"), _) => {
                return Err(fail(format!(
                    "malformed '{}' segment '{}'",
                    kind,
                    std::iter::once(kind)
                        .chain(fields.iter().copied())
                        .collect::<Vec<_>>()
                        .join(":")
                )));
            }
            (other, _) => return Err(fail(format!("unrecognized sink kind '{}'", other))),
        }
    }

    if is_comment {
        if marker == LoopMarker::None {
            return Ok(None);
        }
        return Ok(Some(StepDescriptor {
            line: line.number,
            query: String::new(),
            sinks: Vec::new(),
            source: None,
            marker,
            raw_line: text.to_string(),
        }));
    }

    if raw_query.is_empty() && !sinks.is_empty() {
        return Err(fail("sink has no query to take rows from".to_string()));
    }

    let (query, source) = infer_source(&raw_query, &sinks).map_err(fail)?;

    Ok(Some(StepDescriptor {
        line: line.number,
        query,
        sinks,
        source,
        marker,
        raw_line: text.to_string(),
    }))
}

fn push_sink(sinks: &mut Vec<Sink>, sink: Sink) -> std::result::Result<(), String> {
    if sinks
        .iter()
        .any(|s| std::mem::discriminant(s) == std::mem::discriminant(&sink))
    {
        return Err("a line may carry at most one sink of each kind".to_string());
    }
    sinks.push(sink);
    Ok(())
}

fn split_line(text: &str) -> std::result::Result<(String, Vec<Segment>), String> {
    let mut pairs = JobLineParser::parse(Rule::line, text).map_err(|err| describe(&err))?;
    let line = pairs
        .next()
        .ok_or_else(|| "line did not match the job grammar".to_string())?;

    let mut query = String::new();
    let mut segments = Vec::new();

    for pair in line.into_inner() {
        match pair.as_rule() {
            Rule::query => query = pair.as_str().trim().to_string(),
            Rule::segment => {
                let mut inner = pair.into_inner();
                let kind = inner
                    .next()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default();
                let fields = inner.map(|p| p.as_str().to_string()).collect();
                segments.push(Segment { kind, fields });
            }
            _ => {}
        }
    }

    Ok((query, segments))
}

fn describe(err: &pest::error::Error<Rule>) -> String {
    let column = match err.line_col {
        pest::error::LineColLocation::Pos((_, col)) => col,
        pest::error::LineColLocation::Span((_, col), _) => col,
    };
    format!("{} at column {}", err.variant.message(), column)
}

/* ===================== Source Inference ===================== */

/// Strip `csv.`/`src.`/`dst.` qualifiers from the query and record what the
/// step reads.
fn infer_source(
    query: &str,
    sinks: &[Sink],
) -> std::result::Result<(String, Option<Source>), String> {
    let mut locals: Vec<String> = Vec::new();
    let mut remotes: Vec<(Endpoint, String)> = Vec::new();

    let pieces = sql_pieces(query);
    let code = pieces.iter().filter(|(_, is_code)| *is_code).map(|(text, _)| *text);
    for cap in code.flat_map(|text| QUALIFIED_REF_RE.captures_iter(text)) {
        let name = cap[2].to_string();
        match &cap[1] {
            "csv" => {
                if !locals.contains(&name) {
                    locals.push(name);
                }
            }
            qualifier => {
                let endpoint = if qualifier == "src" {
                    Endpoint::Src
                } else {
                    Endpoint::Dst
                };
                if !remotes.contains(&(endpoint, name.clone())) {
                    remotes.push((endpoint, name));
                }
            }
        }
    }

    if remotes.len() > 1 {
        return Err(format!(
            "query reads {} remote objects; only one is allowed per step",
            remotes.len()
        ));
    }
    if !remotes.is_empty() && !locals.is_empty() {
        return Err("query mixes local tables with a remote object".to_string());
    }

    let stripped: String = pieces
        .iter()
        .map(|&(text, is_code)| {
            if is_code {
                QUALIFIED_REF_RE.replace_all(text, "$2")
            } else {
                Cow::Borrowed(text)
            }
        })
        .collect();

    let source = if let Some((endpoint, object)) = remotes.pop() {
        Some(Source::RemoteObject { endpoint, object })
    } else if !locals.is_empty()
        || sinks.iter().any(|s| matches!(s, Sink::LocalTable { .. }))
    {
        Some(Source::LocalTables { names: locals })
    } else {
        None
    };

    Ok((stripped, source))
}

/// Split a query into code and non-code pieces, in order. Single-quoted
/// literals (with `''` escapes) and `--` comments are non-code; an
/// unterminated literal or comment runs to the end of the query.
fn sql_pieces(query: &str) -> Vec<(&str, bool)> {
    let bytes = query.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let end = match (bytes[i], bytes.get(i + 1)) {
            (b'\'', _) => {
                let mut j = i + 1;
                loop {
                    match bytes.get(j) {
                        None => break j,
                        Some(b'\'') if bytes.get(j + 1) == Some(&b'\'') => j += 2,
                        Some(b'\'') => break j + 1,
                        Some(_) => j += 1,
                    }
                }
            }
            (b'-', Some(b'-')) => bytes[i..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |offset| i + offset),
            _ => {
                i += 1;
                continue;
            }
        };
        if start < i {
            pieces.push((&query[start..i], true));
        }
        pieces.push((&query[i..end], false));
        start = end;
        i = end;
    }
    if start < bytes.len() {
        pieces.push((&query[start..], true));
    }
    pieces
}
