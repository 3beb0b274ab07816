//! End-to-end controller tests: real scripts over the embedded engine, with
//! fake remote endpoints where a script needs them.

use std::sync::Arc;

use super::*;
use crate::executor::remote::BulkOperation;
use crate::test_helpers::{controller, FakeTransport};

fn options(dir: &tempfile::TempDir) -> ControllerOptions {
    ControllerOptions::new(dir.path())
}

fn text(value: &str) -> Option<Value> {
    Some(Value::from(value))
}

fn list(values: &[&str]) -> Value {
    Value::List(values.iter().map(|v| v.to_string()).collect())
}

/* ===================== Scenarios ===================== */

#[tokio::test]
async fn test_table_then_variable() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = controller(
        "SELECT 1 as f1, 2 as f2; => csv:t\nSELECT f1 FROM csv.t; => var:x",
        options(&dir),
        None,
        None,
    );

    let report = job.run().await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(job.scope().get("x").cloned(), text("1"));
    assert_eq!(report.steps_executed, 2);
    assert_eq!(report.tables_written, vec!["t".to_string()]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("t.csv")).unwrap(),
        "f1,f2\n1,2\n"
    );
}

#[tokio::test]
async fn test_loop_collects_accumulator_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let script = "\
SELECT 1 AS p UNION ALL SELECT 2; => batch_begin:p:L
SELECT {p}; => var:out
=> batch_end:L";
    let mut job = controller(script, options(&dir).accumulator("out"), None, None);

    let report = job.run().await.unwrap();

    assert_eq!(job.scope().get("out"), Some(&list(&["1", "2"])));
    assert_eq!(report.loop_iterations, 2);
    assert_eq!(report.steps_executed, 3, "driver once plus one body step per row");
}

#[tokio::test]
async fn test_nested_loops_accumulate_across_all_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let script = "\
SELECT 1 AS o UNION ALL SELECT 2; => batch_begin:o:OUTER
SELECT 10 AS i UNION ALL SELECT 20; => batch_begin:i:INNER
SELECT {o} * 100 + {i}; => var:acc
=> batch_end:INNER
=> batch_end:OUTER";
    let mut job = controller(script, options(&dir).accumulator("acc"), None, None);

    let report = job.run().await.unwrap();

    assert_eq!(job.scope().get("acc"), Some(&list(&["110", "120", "210", "220"])));
    assert_eq!(report.loop_iterations, 6);
}

#[tokio::test]
async fn test_loop_local_bindings_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let script = "\
SELECT 'before' => var:x
SELECT 1 AS p UNION ALL SELECT 2; => batch_begin:p:L
SELECT 'inside-{L}' => var:x
SELECT {p} => var:tmp
=> batch_end:L
SELECT '{x}' => var:after";
    let mut job = controller(script, options(&dir), None, None);

    job.run().await.unwrap();

    let scope = job.scope();
    assert_eq!(scope.get("x").cloned(), text("before"));
    assert_eq!(scope.get("after").cloned(), text("before"));
    assert_eq!(scope.get("tmp"), None);
    assert_eq!(scope.get("p"), None);
    assert_eq!(scope.get("L"), None);
    assert_eq!(scope.get(DEFAULT_ACCUMULATOR), None);
}

#[tokio::test]
async fn test_loop_parameter_bound_under_param_and_loop_id() {
    let dir = tempfile::tempdir().unwrap();
    let script = "\
SELECT 'ignored' AS other, 7 AS i; => batch_begin:i:PARAM
SELECT '{i}-{PARAM}'; => var:batch_params
=> batch_end:PARAM";
    let mut job = controller(script, options(&dir), None, None);

    job.run().await.unwrap();

    assert_eq!(job.scope().get("batch_params"), Some(&list(&["7-7"])));
}

#[tokio::test]
async fn test_loop_driver_from_preceding_step() {
    let dir = tempfile::tempdir().unwrap();
    let script = "\
SELECT 3 AS p UNION ALL SELECT 4 => csv:drivers
=> batch_begin:p:L
SELECT {p} * 2 => var:batch_params
=> batch_end:L
SELECT count(*) FROM csv.drivers => var:n";
    let mut job = controller(script, options(&dir), None, None);

    job.run().await.unwrap();

    assert_eq!(job.scope().get("batch_params"), Some(&list(&["6", "8"])));
    assert_eq!(job.scope().get("n").cloned(), text("2"));
}

#[tokio::test]
async fn test_empty_driver_runs_no_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let script = "\
SELECT 1 AS p WHERE 0; => batch_begin:p:L
SELECT {p}; => var:batch_params
=> batch_end:L";
    let mut job = controller(script, options(&dir), None, None);

    let report = job.run().await.unwrap();

    assert_eq!(report.loop_iterations, 0);
    assert_eq!(job.scope().get("batch_params"), None);
}

#[tokio::test]
async fn test_accumulator_list_interpolates_after_loop() {
    let dir = tempfile::tempdir().unwrap();
    let script = "\
SELECT 1 AS p UNION ALL SELECT 2; => batch_begin:p:L
SELECT {p} + 10; => var:batch_params
=> batch_end:L
SELECT '{batch_params}'; => var:joined";
    let mut job = controller(script, options(&dir), None, None);

    job.run().await.unwrap();

    assert_eq!(job.scope().get("joined").cloned(), text("11,12"));
}

#[tokio::test]
async fn test_initial_variables_interpolate() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = controller(
        "SELECT {min} + 1 => var:x\nSELECT '{unknown}' => var:y",
        options(&dir).variable("min", "3"),
        None,
        None,
    );

    job.run().await.unwrap();

    assert_eq!(job.scope().get("x").cloned(), text("4"));
    assert_eq!(job.scope().get("y").cloned(), text("{unknown}"));
}

/* ===================== Failures ===================== */

#[tokio::test]
async fn test_unproduced_table_is_dependency_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = controller(
        "SELECT 1 => var:a\nSELECT * FROM csv.nothing => var:x",
        options(&dir),
        None,
        None,
    );

    let err = job.run().await.unwrap_err();

    match err {
        JobError::Dependency { table, step } => {
            assert_eq!(table, "nothing");
            assert_eq!(step.line, 2);
        }
        other => panic!("Expected dependency error, got {:?}", other),
    }
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.report().steps_executed, 1);
}

#[tokio::test]
async fn test_failure_leaves_earlier_tables_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = controller(
        "SELECT 1 AS a => csv:first\nSELEC nonsense => var:x\nSELECT 2 AS b => csv:never",
        options(&dir).cleanup_scratch(true),
        None,
        None,
    );

    let err = job.run().await.unwrap_err();

    assert_eq!(err.line(), Some(2));
    assert!(err.to_string().contains("local execution failed"), "got: {err}");
    assert!(dir.path().join("first.csv").exists());
    assert!(!dir.path().join("never.csv").exists());
    let report = job.report();
    assert_eq!(report.state, JobState::Failed);
    assert!(report.error.is_some());
    assert!(report.finished_at.is_some());
}

#[tokio::test]
async fn test_missing_endpoint_rejected_before_any_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = controller(
        "SELECT 1 AS a => csv:first\nSELECT a AS Name FROM csv.first => dst:insert:Account",
        options(&dir),
        None,
        None,
    );

    let err = job.run().await.unwrap_err();

    assert!(matches!(err, JobError::Config(_)), "got: {err:?}");
    assert!(!dir.path().join("first.csv").exists());
    assert_eq!(job.report().steps_executed, 0);
}

#[tokio::test]
async fn test_controller_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = controller("SELECT 1 => var:x", options(&dir), None, None);
    job.run().await.unwrap();
    assert!(matches!(job.run().await, Err(JobError::Config(_))));
}

/* ===================== Remote Endpoints ===================== */

#[tokio::test]
async fn test_remote_source_feeds_variable() {
    let dir = tempfile::tempdir().unwrap();
    let src = Arc::new(FakeTransport::with_query_chunks(&["\"Id\"\n\"001X\"\n"]));
    let mut job = controller(
        "SELECT Id FROM src.Account LIMIT 1 => var:sfvar",
        options(&dir),
        Some(&src),
        None,
    );

    job.run().await.unwrap();

    assert_eq!(job.scope().get("sfvar").cloned(), text("001X"));
    assert_eq!(src.jobs(), vec![(BulkOperation::Query, "Account".to_string())]);
    assert_eq!(src.payloads(), vec!["SELECT Id FROM Account LIMIT 1".to_string()]);
}

#[tokio::test]
async fn test_remote_insert_writes_new_ids_table() {
    let dir = tempfile::tempdir().unwrap();
    let dst = Arc::new(FakeTransport::new().rejecting("Bad"));
    let script = "\
SELECT 'Acme' AS Name UNION ALL SELECT 'Bad' UNION ALL SELECT 'Globex'; => csv:accounts => dst:insert:Account:account_ids
SELECT count(*) FROM csv.account_ids WHERE Success = 'true'; => var:ok";
    let mut job = controller(script, options(&dir), None, Some(&dst));

    let report = job.run().await.unwrap();

    assert_eq!(dst.payloads(), vec!["Name\nAcme\nBad\nGlobex\n".to_string()]);
    assert_eq!(job.scope().get("ok").cloned(), text("2"), "rejected rows do not fail the run");
    assert!(dir.path().join("account_ids.csv").exists());
    assert_eq!(job.registry().is_cached("account_ids"), Some(false));
    assert_eq!(
        report.tables_written,
        vec!["account_ids".to_string(), "accounts".to_string()]
    );
}

#[tokio::test]
async fn test_session_expiry_mid_run_retries_once() {
    let dir = tempfile::tempdir().unwrap();
    let src = Arc::new(
        FakeTransport::with_query_chunks(&["Id\n001\n"]).expire("query_result_chunk", 1),
    );
    let mut job = controller(
        "SELECT Id FROM src.Contact => csv:contacts\nSELECT count(*) FROM csv.contacts => var:n",
        options(&dir),
        Some(&src),
        None,
    );

    let report = job.run().await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(src.calls("query_result_chunk"), 2);
    assert_eq!(src.calls("login"), 2);
    assert_eq!(job.scope().get("n").cloned(), text("1"));
}

/* ===================== Cached Tables ===================== */

#[tokio::test]
async fn test_reuse_cached_skips_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = controller("SELECT 5 AS a => csv:cached_t:cache", options(&dir), None, None);
    first.run().await.unwrap();

    let script = "SELECT 1 AS a => csv:cached_t:cache\nSELECT a FROM csv.cached_t => var:x";
    let mut reused = controller(script, options(&dir).reuse_cached(true), None, None);
    reused.run().await.unwrap();
    assert_eq!(reused.scope().get("x").cloned(), text("5"));

    let mut fresh = controller(script, options(&dir), None, None);
    fresh.run().await.unwrap();
    assert_eq!(fresh.scope().get("x").cloned(), text("1"));
}

#[tokio::test]
async fn test_named_inputs_are_readable() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ints.csv"), "i\n1\n2\n3\n").unwrap();
    let mut job = controller(
        "SELECT sum(i) FROM csv.ints => var:total",
        options(&dir).input("ints"),
        None,
        None,
    );

    let report = job.run().await.unwrap();

    assert_eq!(job.scope().get("total").cloned(), text("6"));
    assert!(report.tables_written.is_empty());
}

#[tokio::test]
async fn test_unnamed_csv_files_are_not_inputs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ints.csv"), "i\n1\n").unwrap();
    let mut job = controller("SELECT i FROM csv.ints => var:x", options(&dir), None, None);

    let err = job.run().await.unwrap_err();

    assert!(matches!(err, JobError::Dependency { ref table, .. } if table == "ints"), "got: {err:?}");
}

#[tokio::test]
async fn test_scratch_table_from_earlier_run_is_not_visible() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = controller(
        "SELECT 1 AS a => csv:t\nSELECT 2 AS b => csv:kept:cache",
        options(&dir),
        None,
        None,
    );
    first.run().await.unwrap();
    assert!(dir.path().join("t.csv").exists());

    let mut second = controller("SELECT a FROM csv.t => var:x", options(&dir), None, None);
    let err = second.run().await.unwrap_err();
    match err {
        JobError::Dependency { table, step } => {
            assert_eq!(table, "t");
            assert_eq!(step.line, 1);
        }
        other => panic!("Expected dependency error, got {:?}", other),
    }

    let mut third = controller("SELECT b FROM csv.kept => var:y", options(&dir), None, None);
    third.run().await.unwrap();
    assert_eq!(third.scope().get("y").cloned(), text("2"));
}

#[tokio::test]
async fn test_empty_result_table_is_readable_later() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = controller(
        "SELECT 1 AS a WHERE 0 => csv:none\nSELECT count(*) AS n FROM csv.none => var:n",
        options(&dir),
        None,
        None,
    );

    job.run().await.unwrap();

    assert_eq!(job.scope().get("n").cloned(), text("0"));
}

#[tokio::test]
async fn test_cleanup_scratch_keeps_cached_tables() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = controller(
        "SELECT 1 AS a => csv:scratch\nSELECT 2 AS b => csv:keep:cache",
        options(&dir).cleanup_scratch(true),
        None,
        None,
    );

    job.run().await.unwrap();

    assert!(!dir.path().join("scratch.csv").exists());
    assert!(dir.path().join("keep.csv").exists());
}
