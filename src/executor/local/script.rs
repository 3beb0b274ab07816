//! Script handed to the local SQL engine.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::executor::LocalTable;

const COLUMNS_VIEW: &str = "_sluice_columns";

/// Imports, output mode and query for one local step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalScript {
    /// (table name, backing file) pairs, imported in order
    pub imports: Vec<(String, PathBuf)>,
    /// Emit a header line before the rows
    pub headers: bool,
    pub query: String,
}

impl LocalScript {
    pub fn new(imports: &[LocalTable], headers: bool, query: impl Into<String>) -> Self {
        Self {
            imports: imports
                .iter()
                .map(|t| (t.name.clone(), t.path.clone()))
                .collect(),
            headers,
            query: query.into(),
        }
    }

    /// Render in the dot-command dialect of the `sqlite3` shell.
    pub fn render(&self) -> String {
        let mut out = String::from(".mode csv\n");
        let _ = writeln!(out, ".headers {}", if self.headers { "on" } else { "off" });
        for (name, path) in &self.imports {
            let path = path.display().to_string().replace('\'', "''");
            let _ = writeln!(out, ".import '{}' {}", path, name);
        }
        out.push_str(".output stdout\n");
        out.push_str(self.query.trim_end());
        if !self.query.trim_end().ends_with(';') {
            out.push(';');
        }
        out.push('\n');
        out
    }

    /// Script that lists the column names of a single-statement query, one
    /// per line, without running it for rows. `None` for multi-statement
    /// queries.
    pub fn columns_script(&self) -> Option<LocalScript> {
        let query = self.query.trim().trim_end_matches(';').trim_end();
        if query.is_empty() || query.contains(';') {
            return None;
        }
        Some(LocalScript {
            imports: self.imports.clone(),
            headers: false,
            query: format!(
                "CREATE TEMP VIEW {view} AS {query};\nSELECT name FROM pragma_table_info('{view}')",
                view = COLUMNS_VIEW,
                query = query
            ),
        })
    }
}
