//! SQL engines that can run a [`LocalScript`].
//!
//! [`EmbeddedSqlite`] runs the script in-process on an in-memory database.
//! [`Sqlite3Shell`] pipes the rendered script into an external `sqlite3`
//! binary. Both report success or failure the way a process would: an exit
//! status plus captured output.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Batch, Connection};

use tracing::debug;

use super::LocalScript;
use crate::bulk_data::{parse_records, BulkData, TabularError};

/// Exit status and captured output of one engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl EngineOutput {
    fn success(stdout: String) -> Self {
        Self {
            status: 0,
            stdout,
            stderr: String::new(),
        }
    }

    fn failure(stderr: String) -> Self {
        Self {
            status: 1,
            stdout: String::new(),
            stderr,
        }
    }
}

/// Runs local scripts. `Err` means the engine could not be started at all.
pub trait SqlEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, script: &LocalScript) -> io::Result<EngineOutput>;
}

/* ===================== Embedded ===================== */

#[derive(Debug, thiserror::Error)]
enum EmbeddedError {
    #[error("{0}")]
    Sql(#[from] rusqlite::Error),

    #[error("cannot read '{path}': {source}")]
    Read { path: String, source: io::Error },

    #[error("cannot import '{table}': {source}")]
    Import { table: String, source: TabularError },

    #[error("result set is not a valid table: {0}")]
    Result(#[from] TabularError),
}

/// In-process SQLite. Imported tables get one TEXT column per header field,
/// matching what the `sqlite3` shell's `.import` creates.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedSqlite;

impl SqlEngine for EmbeddedSqlite {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn run(&self, script: &LocalScript) -> io::Result<EngineOutput> {
        match run_embedded(script) {
            Ok(stdout) => Ok(EngineOutput::success(stdout)),
            Err(err) => Ok(EngineOutput::failure(format!("Error: {}", err))),
        }
    }
}

fn run_embedded(script: &LocalScript) -> Result<String, EmbeddedError> {
    let mut conn = Connection::open_in_memory()?;

    for (table, path) in &script.imports {
        let text = std::fs::read_to_string(path).map_err(|source| EmbeddedError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let data = BulkData::from_csv(&text).map_err(|source| EmbeddedError::Import {
            table: table.clone(),
            source,
        })?;
        import_table(&mut conn, table, &data)?;
    }

    // keep the last statement that produced columns, like the shell's output
    let mut last: Option<BulkData> = None;
    let mut batch = Batch::new(&conn, &script.query);
    while let Some(mut stmt) = batch.next()? {
        if stmt.column_count() == 0 {
            stmt.execute([])?;
            continue;
        }
        let fields: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = fields.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(format_value(row.get_ref(idx)?));
            }
            rows.push(values);
        }
        last = Some(BulkData::new(fields, rows)?);
    }

    Ok(match last {
        Some(data) if script.headers => data.to_csv(),
        Some(data) => data.rows_to_csv(),
        None => String::new(),
    })
}

fn import_table(conn: &mut Connection, table: &str, data: &BulkData) -> Result<(), EmbeddedError> {
    if data.fields().is_empty() {
        return Ok(());
    }
    let columns: Vec<String> = data
        .fields()
        .iter()
        .map(|f| format!("{} TEXT", quote_ident(f)))
        .collect();
    let placeholders: Vec<String> = (1..=data.fields().len()).map(|i| format!("?{}", i)).collect();

    let tx = conn.transaction()?;
    tx.execute(
        &format!("CREATE TABLE {} ({})", quote_ident(table), columns.join(", ")),
        [],
    )?;
    {
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {} VALUES ({})",
            quote_ident(table),
            placeholders.join(", ")
        ))?;
        for row in data.rows() {
            insert.execute(params_from_iter(row.iter()))?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn format_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
            format!("{:.1}", f)
        }
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/* ===================== External Shell ===================== */

/// The `sqlite3` command-line shell, fed the rendered script on stdin.
#[derive(Debug, Clone)]
pub struct Sqlite3Shell {
    program: PathBuf,
}

impl Sqlite3Shell {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Sqlite3Shell {
    fn default() -> Self {
        Self::new("sqlite3")
    }
}

impl SqlEngine for Sqlite3Shell {
    fn name(&self) -> &'static str {
        "sqlite3"
    }

    fn run(&self, script: &LocalScript) -> io::Result<EngineOutput> {
        let output = self.exec(script)?;
        if output.status != 0 || !script.headers || !output.stdout.trim().is_empty() {
            return Ok(output);
        }
        // the shell prints no header for an empty result set
        Ok(match self.empty_result_header(script)? {
            Some(header) => EngineOutput::success(header),
            None => output,
        })
    }
}

impl Sqlite3Shell {
    fn exec(&self, script: &LocalScript) -> io::Result<EngineOutput> {
        let mut child = Command::new(&self.program)
            .arg("-batch")
            .arg("-bail")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.render().as_bytes())?;
        }
        let output = child.wait_with_output()?;

        Ok(EngineOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Header line for a query that returned no rows, or `None` when its
    /// columns cannot be determined.
    fn empty_result_header(&self, script: &LocalScript) -> io::Result<Option<String>> {
        let Some(columns) = script.columns_script() else {
            return Ok(None);
        };
        let listed = self.exec(&columns)?;
        if listed.status != 0 {
            debug!(stderr = %listed.stderr.trim(), "Could not list result columns");
            return Ok(None);
        }
        let Ok(records) = parse_records(&listed.stdout) else {
            return Ok(None);
        };
        let fields: Vec<String> = records
            .into_iter()
            .filter_map(|record| record.into_iter().next())
            .collect();
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(BulkData::new(fields, Vec::new()).ok().map(|data| data.to_csv()))
    }
}
